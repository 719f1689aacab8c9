fn short_lived_config() -> CaConfig {
    CaConfig {
        leaf_validity: Duration::from_secs(2 * 60 * 60),
        leaf_renew_before: Duration::from_secs(10 * 60),
        ..CaConfig::default()
    }
}

#[test]
fn repeated_lookup_is_a_cache_hit_with_identical_material() {
    let authority = CertificateAuthority::ensure_root(CaConfig::default()).expect("root");
    let first = authority.leaf_for("app.warp.dev").expect("first leaf");
    let second = authority.leaf_for("APP.WARP.DEV.").expect("second leaf");

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.key_der.secret_pkcs8_der(), second.key_der.secret_pkcs8_der());
    let metrics = authority.metrics_snapshot();
    assert_eq!(metrics.cache_misses, 1);
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.leaves_issued, 1);
}

#[test]
fn leaf_inside_renewal_window_is_regenerated() {
    let authority = CertificateAuthority::ensure_root(short_lived_config()).expect("root");
    let issued_at = SystemTime::now();
    let first = authority
        .leaf_for_at("app.warp.dev", issued_at)
        .expect("first leaf");
    assert_eq!(first.expires_at, issued_at + Duration::from_secs(2 * 60 * 60));

    let still_fresh = issued_at + Duration::from_secs(60 * 60);
    let reused = authority
        .leaf_for_at("app.warp.dev", still_fresh)
        .expect("reused leaf");
    assert!(Arc::ptr_eq(&first, &reused));

    let near_expiry = issued_at + Duration::from_secs(2 * 60 * 60 - 5 * 60);
    let renewed = authority
        .leaf_for_at("app.warp.dev", near_expiry)
        .expect("renewed leaf");
    assert!(!Arc::ptr_eq(&first, &renewed));
    assert_ne!(first.cert_der, renewed.cert_der);
    assert!(renewed.is_usable_at(near_expiry, Duration::from_secs(10 * 60)));
    assert_eq!(authority.metrics_snapshot().expired_reissues, 1);
}

#[test]
fn holders_keep_their_leaf_after_renewal() {
    let authority = CertificateAuthority::ensure_root(short_lived_config()).expect("root");
    let issued_at = SystemTime::now();
    let held = authority
        .leaf_for_at("app.warp.dev", issued_at)
        .expect("held leaf");
    let held_der = held.cert_der.clone();

    let _renewed = authority
        .leaf_for_at("app.warp.dev", issued_at + Duration::from_secs(2 * 60 * 60))
        .expect("renewed leaf");
    assert_eq!(held.cert_der, held_der);
    assert_eq!(Arc::strong_count(&held), 1);
}

#[test]
fn lru_capacity_bounds_the_cache() {
    let config = CaConfig {
        leaf_cache_capacity: 1,
        ..CaConfig::default()
    };
    let authority = CertificateAuthority::ensure_root(config).expect("root");
    let first = authority.leaf_for("one.example.com").expect("first");
    authority.leaf_for("two.example.com").expect("second");
    let again = authority.leaf_for("one.example.com").expect("first again");

    assert!(!Arc::ptr_eq(&first, &again));
    assert_eq!(authority.metrics_snapshot().cache_misses, 3);
}

#[test]
fn concurrent_lookups_converge_on_one_cached_leaf() {
    let authority = Arc::new(CertificateAuthority::ensure_root(CaConfig::default()).expect("root"));
    let handles = (0..8)
        .map(|_| {
            let authority = Arc::clone(&authority);
            std::thread::spawn(move || authority.leaf_for("app.warp.dev").expect("leaf"))
        })
        .collect::<Vec<_>>();
    for handle in handles {
        let leaf = handle.join().expect("join");
        assert_eq!(leaf.host, "app.warp.dev");
    }

    let cached = authority.leaf_for("app.warp.dev").expect("cached");
    let again = authority.leaf_for("app.warp.dev").expect("cached again");
    assert!(Arc::ptr_eq(&cached, &again));
}

#[test]
fn empty_host_is_a_certificate_error() {
    let authority = CertificateAuthority::ensure_root(CaConfig::default()).expect("root");
    let error = authority.leaf_for("  ").expect_err("empty host must fail");
    assert!(matches!(error, CertificateError::InvalidHost(_)));
}
