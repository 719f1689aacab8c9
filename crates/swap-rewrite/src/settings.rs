use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings document {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("settings document {} is not valid JSON: {source}", .path.display())]
    Invalid {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// The locally kept cloud-objects document served in place of the vendor's
/// response. A failed read or parse keeps the previously loaded document; a
/// deleted file drops it.
#[derive(Debug, Default)]
pub struct UserSettings {
    path: Option<PathBuf>,
    document: RwLock<Option<Bytes>>,
}

impl UserSettings {
    /// No document; the body replacement rule never fires.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Binds to `path` and attempts a first load. A missing or unreadable
    /// file is logged and leaves the document empty.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let settings = Self {
            path: Some(path.into()),
            document: RwLock::new(None),
        };
        if let Err(error) = settings.reload() {
            tracing::warn!(error = %error, "user settings not loaded");
        }
        settings
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn document(&self) -> Option<Bytes> {
        self.document.read().clone()
    }

    /// Reads the document again. Returns `Ok(false)` when no path is bound or
    /// the file does not exist, in which case any loaded document is dropped.
    pub fn reload(&self) -> Result<bool, SettingsError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(false);
        };
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                if self.document.write().take().is_some() {
                    tracing::info!(path = %path.display(), "user settings removed");
                }
                return Ok(false);
            }
            Err(source) => {
                return Err(SettingsError::Read {
                    path: path.clone(),
                    source,
                })
            }
        };
        serde_json::from_slice::<serde_json::Value>(&raw).map_err(|source| {
            SettingsError::Invalid {
                path: path.clone(),
                source,
            }
        })?;
        let len = raw.len();
        *self.document.write() = Some(Bytes::from(raw));
        tracing::info!(path = %path.display(), bytes = len, "loaded user settings");
        Ok(true)
    }
}
