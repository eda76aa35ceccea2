//! The key/value capability and its sled-backed implementation.
//!
//! Everything durable (the committed state tree, round records, and the
//! accepted-transaction index) goes through the `Kv` trait so any
//! conforming backend can be substituted.

use std::sync::Arc;

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Trait for key/value storage backends.
pub trait Kv: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;
    fn has(&self, key: &[u8]) -> Result<bool, StoreError>;

    /// Visit every `(key, value)` pair whose key starts with `prefix`,
    /// in ascending key order.
    fn iterate_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]),
    ) -> Result<(), StoreError>;

    /// Return the next value of a monotonic sequence scoped to `prefix`.
    /// The first call for a prefix returns 1.
    fn next_sequence(&self, prefix: &[u8]) -> Result<u64, StoreError>;
}

/// Sled-backed implementation of the `Kv` capability.
pub struct SledKv {
    #[allow(dead_code)]
    db: sled::Db,
    data: sled::Tree,
    sequences: sled::Tree,
}

impl SledKv {
    /// Open or create a sled database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    /// Open a temporary in-memory sled database (for testing).
    pub fn open_temporary() -> Result<Self, StoreError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| StoreError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let data = db
            .open_tree("data")
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let sequences = db
            .open_tree("sequences")
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(SledKv { db, data, sequences })
    }
}

impl Kv for SledKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.data
            .get(key)
            .map(|v| v.map(|ivec| ivec.to_vec()))
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.data
            .insert(key, value)
            .map(|_| ())
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.data
            .remove(key)
            .map(|_| ())
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.data
            .contains_key(key)
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn iterate_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]),
    ) -> Result<(), StoreError> {
        for item in self.data.scan_prefix(prefix) {
            let (k, v) = item.map_err(|e| StoreError::Io(e.to_string()))?;
            f(&k, &v);
        }
        Ok(())
    }

    fn next_sequence(&self, prefix: &[u8]) -> Result<u64, StoreError> {
        let updated = self
            .sequences
            .update_and_fetch(prefix, |old| {
                let current = old
                    .and_then(|b| <[u8; 8]>::try_from(b).ok())
                    .map(u64::from_be_bytes)
                    .unwrap_or(0);
                Some(current.saturating_add(1).to_be_bytes().to_vec())
            })
            .map_err(|e| StoreError::Io(e.to_string()))?;

        let bytes = updated.ok_or_else(|| StoreError::Io("sequence update vanished".into()))?;
        let arr = <[u8; 8]>::try_from(bytes.as_ref())
            .map_err(|_| StoreError::Serialization("malformed sequence counter".into()))?;
        Ok(u64::from_be_bytes(arr))
    }
}

/// Convenience alias: a shared KV handle.
pub type SharedKv = Arc<dyn Kv>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let kv = SledKv::open_temporary().unwrap();
        assert_eq!(kv.get(b"missing").unwrap(), None);

        kv.put(b"k", b"v").unwrap();
        assert!(kv.has(b"k").unwrap());
        assert_eq!(kv.get(b"k").unwrap(), Some(b"v".to_vec()));

        kv.delete(b"k").unwrap();
        assert!(!kv.has(b"k").unwrap());
    }

    #[test]
    fn prefix_iteration_is_ordered() {
        let kv = SledKv::open_temporary().unwrap();
        kv.put(b"a/2", b"two").unwrap();
        kv.put(b"a/1", b"one").unwrap();
        kv.put(b"b/1", b"other").unwrap();

        let mut keys = Vec::new();
        kv.iterate_prefix(b"a/", &mut |k, _| keys.push(k.to_vec()))
            .unwrap();
        assert_eq!(keys, vec![b"a/1".to_vec(), b"a/2".to_vec()]);
    }

    #[test]
    fn sequences_are_monotonic_and_scoped() {
        let kv = SledKv::open_temporary().unwrap();
        assert_eq!(kv.next_sequence(b"accepted").unwrap(), 1);
        assert_eq!(kv.next_sequence(b"accepted").unwrap(), 2);
        assert_eq!(kv.next_sequence(b"rounds").unwrap(), 1);
        assert_eq!(kv.next_sequence(b"accepted").unwrap(), 3);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let kv = SledKv::open(dir.path()).unwrap();
            kv.put(b"persist", b"yes").unwrap();
            assert_eq!(kv.next_sequence(b"s").unwrap(), 1);
        }
        let kv = SledKv::open(dir.path()).unwrap();
        assert_eq!(kv.get(b"persist").unwrap(), Some(b"yes".to_vec()));
        assert_eq!(kv.next_sequence(b"s").unwrap(), 2);
    }
}
