//! The narrow key-value capability a workload is written against.

/// Error surfaced by a [`KvsBackend`] implementation.
#[derive(Debug, thiserror::Error)]
#[error("kvs backend error: {0}")]
pub struct KvsError(pub String);

/// A generic key-value store capability.
///
/// `multi_get`/`multi_set` default to a per-key loop over `get`/`set`;
/// override them when the backend has a native batch path.
pub trait KvsBackend: Send + Sync {
    /// Whether `key` exists.
    fn exists(&self, key: &[u8]) -> Result<bool, KvsError>;

    /// Set the value for `key`.
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), KvsError>;

    /// Get the value stored at `key`, if any.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvsError>;

    /// Rename `src` to `dst`.
    fn rename(&self, src: &[u8], dst: &[u8]) -> Result<(), KvsError>;

    /// Get values for multiple keys, in the same order as `keys`.
    fn multi_get(&self, keys: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>, KvsError> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Set multiple key/value pairs.
    fn multi_set(&self, mapping: &[(&[u8], &[u8])]) -> Result<(), KvsError> {
        for (key, value) in mapping {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Delete every key in the store.
    fn delete_all(&self) -> Result<(), KvsError>;

    /// Bulk-load key/value pairs. Defaults to a per-pair loop over `set`.
    fn bulk_load(&self, pairs: &mut dyn Iterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<(), KvsError> {
        for (key, value) in pairs {
            self.set(&key, &value)?;
        }
        Ok(())
    }
}
