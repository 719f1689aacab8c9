use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::OffsetDateTime;

use crate::authority::RootMaterial;
use crate::{crypto_provider, CertificateError};

const BACKDATE: Duration = Duration::from_secs(60 * 60);

/// A host certificate signed by the root. Shared through `Arc`; a connection
/// only keeps its reference for the handshake.
#[derive(Debug)]
pub struct LeafCertificate {
    pub host: String,
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivatePkcs8KeyDer<'static>,
    pub server_config: Arc<ServerConfig>,
    pub not_before: SystemTime,
    pub expires_at: SystemTime,
}

impl LeafCertificate {
    /// True while the leaf remains valid for at least `renew_before`.
    pub fn is_usable_at(&self, now: SystemTime, renew_before: Duration) -> bool {
        now + renew_before < self.expires_at
    }
}

pub(crate) fn issue_leaf(
    root: &RootMaterial,
    host: &str,
    now: SystemTime,
    validity: Duration,
) -> Result<LeafCertificate, CertificateError> {
    let generate_error = |source| CertificateError::Generate {
        host: host.to_string(),
        source,
    };
    let not_before = now.checked_sub(BACKDATE).unwrap_or(now);
    let expires_at = now + validity;

    let params = build_leaf_params(host, not_before, expires_at).map_err(generate_error)?;
    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(generate_error)?;
    let cert = params
        .signed_by(&key, &root.issuer)
        .map_err(generate_error)?;
    let cert_der = cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(key.serialize_der());

    let chain = vec![cert_der.clone(), root.cert_der.clone()];
    let config_error = |source| CertificateError::ServerConfig {
        host: host.to_string(),
        source,
    };
    let mut server_config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(config_error)?
        .with_no_client_auth()
        .with_single_cert(chain, PrivateKeyDer::Pkcs8(key_der.clone_key()))
        .map_err(config_error)?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(LeafCertificate {
        host: host.to_string(),
        cert_der,
        key_der,
        server_config: Arc::new(server_config),
        not_before,
        expires_at,
    })
}

fn build_leaf_params(
    host: &str,
    not_before: SystemTime,
    not_after: SystemTime,
) -> Result<CertificateParams, rcgen::Error> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.use_authority_key_identifier_extension = true;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.not_before = OffsetDateTime::from(not_before);
    params.not_after = OffsetDateTime::from(not_after);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, host.to_string());
    params.distinguished_name = distinguished_name;

    let san = match host.parse::<IpAddr>() {
        Ok(ip) => SanType::IpAddress(ip),
        Err(_) => SanType::DnsName(host.try_into()?),
    };
    params.subject_alt_names.push(san);
    Ok(params)
}
