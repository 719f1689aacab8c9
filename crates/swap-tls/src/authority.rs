use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use lru::LruCache;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use swap_core::normalize_host;
use time::OffsetDateTime;
use x509_parser::parse_x509_certificate;

use crate::leaf::{issue_leaf, LeafCertificate};
use crate::{CaConfig, CaInitError, CaMetricsSnapshot, CertificateError};

const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

pub(crate) struct RootMaterial {
    pub(crate) issuer: Issuer<'static, KeyPair>,
    pub(crate) cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_pem: String,
}

pub struct CertificateAuthority {
    config: CaConfig,
    root: RootMaterial,
    leaves: Mutex<LruCache<String, Arc<LeafCertificate>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
    expired_reissues: AtomicU64,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("common_name", &self.config.common_name)
            .field("cert_path", &self.config.cert_path)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Loads the root from disk, or generates and persists one when neither
    /// file exists. Calling it again with the same paths yields the same
    /// root.
    pub fn ensure_root(config: CaConfig) -> Result<Self, CaInitError> {
        config.validate()?;
        let root = load_or_generate_root(&config)?;
        let capacity = NonZeroUsize::new(config.leaf_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            config,
            root,
            leaves: Mutex::new(LruCache::new(capacity)),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
            expired_reissues: AtomicU64::new(0),
        })
    }

    /// Returns a leaf for `host` that stays valid for at least the renewal
    /// window. CPU-bound on a miss; callers on an async runtime should run it
    /// on a blocking worker.
    pub fn leaf_for(&self, host: &str) -> Result<Arc<LeafCertificate>, CertificateError> {
        self.leaf_for_at(host, SystemTime::now())
    }

    pub(crate) fn leaf_for_at(
        &self,
        host: &str,
        now: SystemTime,
    ) -> Result<Arc<LeafCertificate>, CertificateError> {
        let host = normalize_host(host);
        if host.is_empty() {
            return Err(CertificateError::InvalidHost(host));
        }
        let renew_before = self.config.leaf_renew_before;

        {
            let mut leaves = self.leaves.lock();
            match leaves.get(&host) {
                Some(leaf) if leaf.is_usable_at(now, renew_before) => {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(leaf));
                }
                Some(_) => {
                    leaves.pop(&host);
                    self.expired_reissues.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    self.cache_misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // Issued without holding the lock so other hosts are not delayed.
        let issued = Arc::new(issue_leaf(
            &self.root,
            &host,
            now,
            self.config.leaf_validity,
        )?);
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(host = %host, "issued leaf certificate");

        let mut leaves = self.leaves.lock();
        if let Some(existing) = leaves.get(&host) {
            if existing.is_usable_at(now, renew_before) {
                return Ok(Arc::clone(existing));
            }
        }
        leaves.put(host, Arc::clone(&issued));
        Ok(issued)
    }

    pub fn ca_certificate_pem(&self) -> &str {
        &self.root.cert_pem
    }

    pub fn ca_certificate_der(&self) -> &CertificateDer<'static> {
        &self.root.cert_der
    }

    pub fn metrics_snapshot(&self) -> CaMetricsSnapshot {
        CaMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
            expired_reissues: self.expired_reissues.load(Ordering::Relaxed),
        }
    }
}

fn load_or_generate_root(config: &CaConfig) -> Result<RootMaterial, CaInitError> {
    let (Some(cert_path), Some(key_path)) = (&config.cert_path, &config.key_path) else {
        return generate_root(config);
    };

    match (cert_path.exists(), key_path.exists()) {
        (true, true) => load_root(cert_path, key_path),
        (false, false) => {
            let generated = generate_root(config)?;
            persist_root(cert_path, key_path, &generated)?;
            tracing::info!(
                cert_path = %cert_path.display(),
                "generated new root CA; it must be trusted by clients"
            );
            Ok(generated)
        }
        (true, false) => Err(CaInitError::PartialMaterial {
            present: cert_path.clone(),
            missing: key_path.clone(),
        }),
        (false, true) => Err(CaInitError::PartialMaterial {
            present: key_path.clone(),
            missing: cert_path.clone(),
        }),
    }
}

fn generate_root(config: &CaConfig) -> Result<RootMaterial, CaInitError> {
    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
    let key_pem = key.serialize_pem();
    let params = build_root_params(config, SystemTime::now());
    let cert = params.self_signed(&key)?;
    let cert_pem = cert.pem();
    let cert_der = cert.der().clone();

    Ok(RootMaterial {
        issuer: Issuer::new(params, key),
        cert_der,
        cert_pem,
        key_pem,
    })
}

fn load_root(cert_path: &Path, key_path: &Path) -> Result<RootMaterial, CaInitError> {
    let cert_pem = read_pem(cert_path)?;
    let key_pem = read_pem(key_path)?;

    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        CaInitError::Invalid {
            path: cert_path.to_path_buf(),
            detail: format!("certificate PEM did not parse: {error}"),
        }
    })?;
    let key = KeyPair::from_pem(&key_pem).map_err(|error| CaInitError::Invalid {
        path: key_path.to_path_buf(),
        detail: format!("private key PEM did not parse: {error}"),
    })?;
    check_root_certificate(cert_path, &cert_der, &key)?;

    let issuer =
        Issuer::from_ca_cert_der(&cert_der, key).map_err(|error| CaInitError::Invalid {
            path: cert_path.to_path_buf(),
            detail: format!("issuer metadata could not be rebuilt: {error}"),
        })?;

    Ok(RootMaterial {
        issuer,
        cert_der,
        cert_pem,
        key_pem,
    })
}

/// The stored certificate must be a currently valid CA whose public key
/// belongs to the stored private key.
fn check_root_certificate(
    cert_path: &Path,
    cert_der: &CertificateDer<'static>,
    key: &KeyPair,
) -> Result<(), CaInitError> {
    let invalid = |detail: &str| CaInitError::Invalid {
        path: cert_path.to_path_buf(),
        detail: detail.to_string(),
    };
    let (_, cert) =
        parse_x509_certificate(cert_der.as_ref()).map_err(|_| invalid("not an X.509 certificate"))?;

    let is_ca = cert
        .basic_constraints()
        .ok()
        .flatten()
        .is_some_and(|constraints| constraints.value.ca);
    if !is_ca {
        return Err(invalid("certificate is not a CA"));
    }
    if !cert.validity().is_valid() {
        return Err(invalid("certificate is outside its validity period"));
    }
    if &*cert.public_key().subject_public_key.data != key.public_key_raw() {
        return Err(invalid("private key does not match the certificate"));
    }
    Ok(())
}

fn read_pem(path: &Path) -> Result<String, CaInitError> {
    fs::read_to_string(path).map_err(|source| CaInitError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn persist_root(cert_path: &Path, key_path: &Path, root: &RootMaterial) -> Result<(), CaInitError> {
    write_file(cert_path, root.cert_pem.as_bytes())?;
    write_file(key_path, root.key_pem.as_bytes())
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), CaInitError> {
    let write_error = |source| CaInitError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(write_error)?;
        }
    }
    fs::write(path, contents).map_err(write_error)
}

fn build_root_params(config: &CaConfig, now: SystemTime) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, config.common_name.clone());
    distinguished_name.push(DnType::OrganizationName, config.organization.clone());
    params.distinguished_name = distinguished_name;

    let validity = ONE_DAY * config.validity_days;
    params.not_before = OffsetDateTime::from(now.checked_sub(ONE_DAY).unwrap_or(now));
    params.not_after = OffsetDateTime::from(now + validity);
    params
}
