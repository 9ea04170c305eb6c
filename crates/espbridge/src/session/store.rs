use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// Persisted client state. `last_address` is the only key.
#[derive(Debug, Default, Deserialize, Serialize)]
struct StoredState {
    last_address: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Last-used device address kept on disk between runs.
///
/// There is no locking: concurrent writers race and the last write wins.
#[derive(Debug, Clone)]
pub struct AddressStore {
    path: PathBuf,
}

impl AddressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored address, or `None` if nothing was saved yet.
    pub fn load(&self) -> Result<Option<String>, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let state: StoredState = toml::from_str(&content).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })?;
        Ok(state.last_address)
    }

    pub fn save(&self, address: &str) -> Result<(), StoreError> {
        let io_error = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }

        let content = toml::to_string(&StoredState {
            last_address: Some(address.to_string()),
        })?;
        std::fs::write(&self.path, content).map_err(io_error)?;
        tracing::debug!("Saved last address {} to {}", address, self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = AddressStore::new(temp_dir.path().join("state.toml"));
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_last_write_wins() {
        let temp_dir = TempDir::new().unwrap();
        let store = AddressStore::new(temp_dir.path().join("nested/state.toml"));

        store.save("192.0.2.1").unwrap();
        store.save("myesp32.ddns.net:8080").unwrap();

        let other = AddressStore::new(store.path());
        assert_eq!(
            other.load().unwrap().as_deref(),
            Some("myesp32.ddns.net:8080")
        );

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(content.contains("last_address"));
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.toml");
        std::fs::write(&path, "last_address = [").unwrap();

        let err = AddressStore::new(&path).load().unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
    }
}
