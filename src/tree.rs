//! The authenticated state tree.
//!
//! A copy-on-write ordered map over raw keys. The 16-byte checksum is a
//! BLAKE3 digest over the sorted `(key, value)` set, so two trees with equal
//! content produce equal checksums regardless of insertion history. Every
//! finalized round's identity rests on that property.
//!
//! `snapshot()` is a cheap `Arc` clone; the first mutation on either side
//! copies the map. The collapse engine mutates only its own snapshot and the
//! ledger swaps the snapshot in at finalization, so readers always see a
//! consistent view.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::identity::MerkleDigest;
use crate::store::{Kv, StoreError};

/// Prefix under which tree entries are persisted in the KV store.
const KV_TREE_PREFIX: &[u8] = b"tree/";

/// Copy-on-write authenticated key/value map.
#[derive(Clone, Default, Debug)]
pub struct StateTree {
    entries: Arc<BTreeMap<Vec<u8>, Vec<u8>>>,
    view_id: u64,
}

impl StateTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cheap immutable view sharing storage with `self` until either side
    /// is mutated.
    pub fn snapshot(&self) -> StateTree {
        self.clone()
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(|v| v.as_slice())
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) {
        Arc::make_mut(&mut self.entries).insert(key.to_vec(), value.to_vec());
    }

    pub fn delete(&mut self, key: &[u8]) -> bool {
        Arc::make_mut(&mut self.entries).remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Visit every entry whose key starts with `prefix`, ascending.
    pub fn iterate(&self, prefix: &[u8], mut f: impl FnMut(&[u8], &[u8])) {
        let range = self.entries.range::<[u8], _>((
            Bound::Included(prefix),
            Bound::<&[u8]>::Unbounded,
        ));
        for (k, v) in range {
            if !k.starts_with(prefix) {
                break;
            }
            f(k, v);
        }
    }

    /// Canonical content digest, truncated to 16 bytes.
    ///
    /// A pure function of the entry set: the map iterates in key order, so
    /// insertion history cannot leak into the digest.
    pub fn checksum(&self) -> MerkleDigest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.entries.len() as u64).to_le_bytes());
        for (k, v) in self.entries.iter() {
            hasher.update(&(k.len() as u64).to_le_bytes());
            hasher.update(k);
            hasher.update(&(v.len() as u64).to_le_bytes());
            hasher.update(v);
        }
        let digest = hasher.finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest.as_bytes()[..16]);
        MerkleDigest(out)
    }

    /// Stamp an administrative view counter. Advisory telemetry only.
    pub fn set_view_id(&mut self, view_id: u64) {
        self.view_id = view_id;
    }

    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    /// Persist the full entry set under the `tree/` prefix, removing any
    /// stale keys from a previous commit.
    pub fn commit_to(&self, kv: &dyn Kv) -> Result<(), StoreError> {
        let mut stale = Vec::new();
        kv.iterate_prefix(KV_TREE_PREFIX, &mut |k, _| {
            let tree_key = &k[KV_TREE_PREFIX.len()..];
            if !self.entries.contains_key(tree_key) {
                stale.push(k.to_vec());
            }
        })?;
        for key in stale {
            kv.delete(&key)?;
        }

        for (k, v) in self.entries.iter() {
            let mut key = KV_TREE_PREFIX.to_vec();
            key.extend_from_slice(k);
            kv.put(&key, v)?;
        }
        Ok(())
    }

    /// Rebuild a tree from a previous `commit_to`.
    pub fn load_from(kv: &dyn Kv) -> Result<Self, StoreError> {
        let mut entries = BTreeMap::new();
        kv.iterate_prefix(KV_TREE_PREFIX, &mut |k, v| {
            entries.insert(k[KV_TREE_PREFIX.len()..].to_vec(), v.to_vec());
        })?;
        Ok(StateTree {
            entries: Arc::new(entries),
            view_id: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledKv;

    #[test]
    fn checksum_is_order_independent() {
        let writes: Vec<(Vec<u8>, Vec<u8>)> = (0u8..32)
            .map(|i| (vec![i, i + 1], vec![i; (i % 7) as usize + 1]))
            .collect();

        let mut forward = StateTree::new();
        for (k, v) in &writes {
            forward.insert(k, v);
        }

        let mut reversed = StateTree::new();
        for (k, v) in writes.iter().rev() {
            reversed.insert(k, v);
        }

        assert_eq!(forward.checksum(), reversed.checksum());
    }

    #[test]
    fn checksum_reflects_content() {
        let mut tree = StateTree::new();
        let empty = tree.checksum();

        tree.insert(b"k", b"v");
        let one = tree.checksum();
        assert_ne!(empty, one);

        tree.insert(b"k", b"v2");
        assert_ne!(one, tree.checksum());

        tree.delete(b"k");
        assert_eq!(empty, tree.checksum());
    }

    #[test]
    fn snapshot_isolation() {
        let mut tree = StateTree::new();
        tree.insert(b"a", b"1");

        let snapshot = tree.snapshot();
        tree.insert(b"b", b"2");

        assert_eq!(snapshot.lookup(b"b"), None);
        assert_eq!(tree.lookup(b"b"), Some(b"2".as_ref()));
        assert_eq!(snapshot.lookup(b"a"), Some(b"1".as_ref()));
    }

    #[test]
    fn iterate_respects_prefix_and_order() {
        let mut tree = StateTree::new();
        tree.insert(b"a/2", b"y");
        tree.insert(b"a/1", b"x");
        tree.insert(b"b/1", b"z");

        let mut seen = Vec::new();
        tree.iterate(b"a/", |k, _| seen.push(k.to_vec()));
        assert_eq!(seen, vec![b"a/1".to_vec(), b"a/2".to_vec()]);
    }

    #[test]
    fn kv_round_trip_preserves_checksum() {
        let kv = SledKv::open_temporary().unwrap();

        let mut tree = StateTree::new();
        for i in 0u8..16 {
            tree.insert(&[b'x', i], &[i; 4]);
        }
        tree.commit_to(&kv).unwrap();

        let restored = StateTree::load_from(&kv).unwrap();
        assert_eq!(tree.checksum(), restored.checksum());

        // A second commit after deletions must not leave stale keys behind.
        tree.delete(&[b'x', 0]);
        tree.commit_to(&kv).unwrap();
        let restored = StateTree::load_from(&kv).unwrap();
        assert_eq!(tree.checksum(), restored.checksum());
    }

    #[test]
    fn view_id_is_advisory() {
        let mut tree = StateTree::new();
        let before = tree.checksum();
        tree.set_view_id(42);
        assert_eq!(tree.view_id(), 42);
        assert_eq!(before, tree.checksum());
    }
}
