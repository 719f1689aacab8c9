#[test]
fn default_config_is_valid() {
    let config = super::ProxyConfig::default();
    assert!(config.validate().is_ok());
}

#[test]
fn partial_json_keeps_defaults_for_missing_fields() {
    let json = r#"
        {
          "listen_port": 18080,
          "passthrough_unlisted": false,
          "blocked_hosts": ["telemetry.example.net"],
          "connect_parse_mode": "lenient"
        }
    "#;
    let parsed = serde_json::from_str::<super::ProxyConfig>(json).expect("deserialize config");
    assert_eq!(parsed.listen_addr, "127.0.0.1");
    assert_eq!(parsed.listen_port, 18_080);
    assert!(!parsed.passthrough_unlisted);
    assert_eq!(
        parsed.blocked_hosts,
        vec!["telemetry.example.net".to_string()]
    );
    assert_eq!(parsed.connect_parse_mode, super::ConnectParseMode::Lenient);
    assert_eq!(parsed.token_refresh_margin_seconds, 60);
    assert!(parsed.validate().is_ok());
}

#[test]
fn serde_rejects_unknown_fields() {
    let json = r#"{ "unknown_field": true }"#;
    let err =
        serde_json::from_str::<super::ProxyConfig>(json).expect_err("unknown field must fail");
    let message = err.to_string();
    assert!(
        message.contains("unknown field"),
        "expected unknown field error, got: {message}"
    );
}

#[test]
fn validation_rejects_partial_ca_path_pair() {
    let config = super::ProxyConfig {
        ca_cert_pem_path: Some("/tmp/ca.pem".to_string()),
        ca_key_pem_path: None,
        ..super::ProxyConfig::default()
    };
    let err = config.validate().expect_err("partial CA pair should fail");
    assert_eq!(err, super::ConfigError::InvalidCaPathPair);
}

#[test]
fn validation_rejects_zero_limits() {
    let config = super::ProxyConfig {
        max_http_head_bytes: 0,
        ..super::ProxyConfig::default()
    };
    assert_eq!(
        config.validate().expect_err("zero head limit should fail"),
        super::ConfigError::ZeroValue("max_http_head_bytes")
    );
}

#[test]
fn validation_rejects_renew_window_covering_whole_validity() {
    let config = super::ProxyConfig {
        leaf_validity_seconds: 600,
        leaf_renew_before_seconds: 600,
        ..super::ProxyConfig::default()
    };
    assert_eq!(
        config.validate().expect_err("renew window must be smaller"),
        super::ConfigError::RenewWindowTooLarge
    );
}

#[test]
fn validation_rejects_blank_host_entries() {
    let config = super::ProxyConfig {
        passthrough_hosts: vec!["  ".to_string()],
        ..super::ProxyConfig::default()
    };
    assert_eq!(
        config.validate().expect_err("blank host should fail"),
        super::ConfigError::EmptyHostEntry {
            field: "passthrough_hosts"
        }
    );
}
