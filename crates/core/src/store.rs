//! Persistence hook for downloaded content.
//!
//! Operations with a destination path hand their response body to a
//! [`ContentStore`] instead of buffering it. The encrypted implementation
//! lives in `courier-crypto`; [`PlainStore`] writes bytes as-is.

use std::path::Path;

use crate::CourierError;

/// Stores and loads downloaded content at a filesystem path.
pub trait ContentStore: Send + Sync {
    /// Persist `bytes` at `path`, replacing any existing file.
    fn store(&self, bytes: &[u8], path: &Path) -> Result<(), CourierError>;

    /// Read the content back, reversing whatever [`ContentStore::store`] did.
    fn load(&self, path: &Path) -> Result<Vec<u8>, CourierError>;
}

/// Unencrypted filesystem store.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainStore;

impl ContentStore for PlainStore {
    fn store(&self, bytes: &[u8], path: &Path) -> Result<(), CourierError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CourierError::Storage(e.to_string()))?;
        }
        std::fs::write(path, bytes).map_err(|e| CourierError::Storage(e.to_string()))
    }

    fn load(&self, path: &Path) -> Result<Vec<u8>, CourierError> {
        std::fs::read(path).map_err(|e| CourierError::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.bin");
        PlainStore.store(b"hello", &path).unwrap();
        assert_eq!(PlainStore.load(&path).unwrap(), b"hello");
    }

    #[test]
    fn load_missing_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PlainStore.load(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, CourierError::Storage(_)));
    }
}
