#[test]
fn ensure_root_persists_and_reloads_the_same_root() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = CaConfig::in_dir(&dir.path().join("ca"));

    let first = CertificateAuthority::ensure_root(config.clone()).expect("generate root");
    let first_pem = first.ca_certificate_pem().to_string();
    drop(first);
    assert!(dir.path().join("ca").join(super::CA_CERT_FILE_NAME).exists());
    assert!(dir.path().join("ca").join(super::CA_KEY_FILE_NAME).exists());

    let second = CertificateAuthority::ensure_root(config).expect("reload root");
    assert_eq!(second.ca_certificate_pem(), first_pem);

    let leaf = second.leaf_for("app.warp.dev").expect("leaf");
    assert_issuer_common_name(&leaf.cert_der, "tokenswap Root CA");
}

#[test]
fn reloaded_root_keeps_persisted_subject_when_config_changes() {
    let dir = tempfile::tempdir().expect("temp dir");
    let original = CaConfig {
        common_name: "original root".to_string(),
        ..CaConfig::in_dir(dir.path())
    };
    let first = CertificateAuthority::ensure_root(original).expect("generate root");
    let first_pem = first.ca_certificate_pem().to_string();

    let drifted = CaConfig {
        common_name: "drifted root".to_string(),
        ..CaConfig::in_dir(dir.path())
    };
    let second = CertificateAuthority::ensure_root(drifted).expect("reload root");
    assert_eq!(second.ca_certificate_pem(), first_pem);
    let leaf = second.leaf_for("app.warp.dev").expect("leaf");
    assert_issuer_common_name(&leaf.cert_der, "original root");
}

#[test]
fn half_a_root_pair_is_fatal_with_remediation() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = CaConfig::in_dir(dir.path());
    CertificateAuthority::ensure_root(config.clone()).expect("generate root");
    fs::remove_file(config.key_path.as_ref().expect("key path")).expect("remove key");

    let error = CertificateAuthority::ensure_root(config).expect_err("half pair must fail");
    assert!(matches!(error, CaInitError::PartialMaterial { .. }), "{error}");
    assert!(error.to_string().contains("reinstall the root certificate"));
}

#[test]
fn unparsable_root_is_fatal() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = CaConfig::in_dir(dir.path());
    fs::write(config.cert_path.as_ref().expect("cert path"), "not a certificate")
        .expect("write cert");
    fs::write(config.key_path.as_ref().expect("key path"), "not a key").expect("write key");

    let error = CertificateAuthority::ensure_root(config).expect_err("garbage must fail");
    assert!(matches!(error, CaInitError::Invalid { .. }), "{error}");
}

#[test]
fn mismatched_root_key_is_fatal() {
    let first_dir = tempfile::tempdir().expect("temp dir");
    let second_dir = tempfile::tempdir().expect("temp dir");
    let first = CaConfig::in_dir(first_dir.path());
    let second = CaConfig::in_dir(second_dir.path());
    CertificateAuthority::ensure_root(first.clone()).expect("first root");
    CertificateAuthority::ensure_root(second.clone()).expect("second root");

    fs::copy(
        second.key_path.as_ref().expect("key path"),
        first.key_path.as_ref().expect("key path"),
    )
    .expect("swap key");

    let error = CertificateAuthority::ensure_root(first).expect_err("mismatch must fail");
    assert!(
        error.to_string().contains("does not match"),
        "unexpected error: {error}"
    );
}

#[test]
fn partial_path_configuration_is_rejected() {
    let config = CaConfig {
        cert_path: Some("/tmp/tokenswap-only-cert.pem".into()),
        ..CaConfig::default()
    };
    let error = CertificateAuthority::ensure_root(config).expect_err("must fail");
    assert!(matches!(error, CaInitError::InvalidConfig(_)), "{error}");
}

#[test]
fn leaf_names_cover_dns_and_ip_hosts() {
    let authority = CertificateAuthority::ensure_root(CaConfig::default()).expect("root");

    let dns = authority.leaf_for("App.Warp.Dev").expect("dns leaf");
    assert_eq!(dns.host, "app.warp.dev");
    assert_common_name(&dns.cert_der, "app.warp.dev");
    assert!(san_names(&dns.cert_der).contains(&"dns:app.warp.dev".to_string()));

    let ip = authority.leaf_for("127.0.0.1").expect("ip leaf");
    assert_common_name(&ip.cert_der, "127.0.0.1");
    assert!(san_names(&ip.cert_der).contains(&"ip:127.0.0.1".to_string()));
}

fn assert_common_name(cert_der: &CertificateDer<'static>, expected: &str) {
    let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .expect("commonName")
        .as_str()
        .expect("commonName as utf8");
    assert_eq!(cn, expected);
}

fn assert_issuer_common_name(cert_der: &CertificateDer<'static>, expected: &str) {
    let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
    let cn = cert
        .issuer()
        .iter_common_name()
        .next()
        .expect("issuer commonName")
        .as_str()
        .expect("issuer commonName as utf8");
    assert_eq!(cn, expected);
}

fn san_names(cert_der: &CertificateDer<'static>) -> Vec<String> {
    let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
    let san = cert
        .subject_alternative_name()
        .expect("san extension parse")
        .expect("san extension present");
    san.value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(value) => Some(format!("dns:{value}")),
            GeneralName::IPAddress(bytes) if bytes.len() == 4 => Some(format!(
                "ip:{}.{}.{}.{}",
                bytes[0], bytes[1], bytes[2], bytes[3]
            )),
            _ => None,
        })
        .collect()
}
