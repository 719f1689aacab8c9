use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The root CA cannot be used. Fatal at startup.
#[derive(Debug, Error)]
pub enum CaInitError {
    #[error("invalid CA configuration: {0}")]
    InvalidConfig(String),
    #[error("root CA is incomplete: {} exists but {} does not; delete both CA files and reinstall the root certificate", .present.display(), .missing.display())]
    PartialMaterial { present: PathBuf, missing: PathBuf },
    #[error("failed to read root CA file {}: {source}; delete both CA files and reinstall the root certificate", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("root CA file {} is unusable: {detail}; delete both CA files and reinstall the root certificate", .path.display())]
    Invalid { path: PathBuf, detail: String },
    #[error("failed to write root CA file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to generate root CA: {0}")]
    Generate(#[from] rcgen::Error),
}

/// A leaf could not be produced for one host. Only that connection fails.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("cannot issue a certificate for host {0:?}")]
    InvalidHost(String),
    #[error("leaf generation failed for {host}: {source}")]
    Generate {
        host: String,
        #[source]
        source: rcgen::Error,
    },
    #[error("TLS server config for {host} could not be built: {source}")]
    ServerConfig {
        host: String,
        #[source]
        source: rustls::Error,
    },
}
