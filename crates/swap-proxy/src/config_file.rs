use std::path::{Path, PathBuf};

use swap_core::ProxyConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config file {} is invalid: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Reads a JSON configuration document. Fields left out keep their defaults;
/// unknown fields are rejected. The result is not validated yet.
pub fn load_config_file(path: &Path) -> Result<ProxyConfig, ConfigFileError> {
    let raw = std::fs::read(path).map_err(|source| ConfigFileError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| ConfigFileError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Per-user data directory, e.g. `~/.local/share/tokenswap` on Linux.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("tokenswap"))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use swap_core::{ConnectParseMode, ProxyConfig};

    use super::{load_config_file, ConfigFileError};

    #[test]
    fn partial_document_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"listen_port": 9090, "connect_parse_mode": "lenient", "passthrough_unlisted": false}"#,
        )
        .expect("write config");

        let config = load_config_file(&path).expect("load");
        assert_eq!(config.listen_port, 9090);
        assert_eq!(config.connect_parse_mode, ConnectParseMode::Lenient);
        assert!(!config.passthrough_unlisted);
        assert_eq!(config.listen_addr, ProxyConfig::default().listen_addr);
    }

    #[test]
    fn unknown_fields_and_missing_files_are_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"listen_prot": 1}"#).expect("write config");
        assert!(matches!(
            load_config_file(&path),
            Err(ConfigFileError::Parse { .. })
        ));
        assert!(matches!(
            load_config_file(&dir.path().join("absent.json")),
            Err(ConfigFileError::Read { .. })
        ));
    }
}
