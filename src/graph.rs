//! The in-memory transaction DAG.
//!
//! Multi-parent ancestry graph indexed by ID and by depth. Missing ancestors
//! are tracked so the sync layer knows what to fetch, and `add` is serialized
//! by an internal writer lock so readers always observe a consistent view.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::identity::TransactionId;
use crate::transaction::Transaction;

/// Errors from DAG ingress.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GraphError {
    #[error("transaction already in graph")]
    Duplicate,
    #[error("creator signature is invalid")]
    InvalidSignature,
    #[error("payload rejected at ingress: {0}")]
    InvalidPayload(String),
    #[error("parent transaction not found: {0:?}")]
    MissingParent(TransactionId),
    #[error("depth {got} inconsistent with parents (expected {expected})")]
    DepthMismatch { expected: u64, got: u64 },
    #[error("non-root transaction has no parents")]
    NoParents,
}

struct GraphInner {
    transactions: HashMap<TransactionId, Transaction>,
    /// Ascending `(depth, id)` index used by collapse statistics.
    depth_index: BTreeMap<u64, BTreeSet<TransactionId>>,
    children: HashMap<TransactionId, Vec<TransactionId>>,
    /// Outstanding ancestors mapped to the highest depth that requested them.
    missing: HashMap<TransactionId, u64>,
    root: TransactionId,
    height: u64,
}

/// The transaction DAG.
pub struct Graph {
    inner: RwLock<GraphInner>,
}

impl Graph {
    /// Create a graph seeded with its root (genesis) transaction.
    pub fn new(root: Transaction) -> Self {
        let root_id = root.id;
        let height = root.depth + 1;

        let mut depth_index: BTreeMap<u64, BTreeSet<TransactionId>> = BTreeMap::new();
        depth_index.entry(root.depth).or_default().insert(root_id);

        let mut transactions = HashMap::new();
        transactions.insert(root_id, root);

        Graph {
            inner: RwLock::new(GraphInner {
                transactions,
                depth_index,
                children: HashMap::new(),
                missing: HashMap::new(),
                root: root_id,
                height,
            }),
        }
    }

    /// Insert a transaction, verifying signature and payload at ingress.
    pub fn add(&self, tx: Transaction) -> Result<(), GraphError> {
        if !tx.verify() {
            return Err(GraphError::InvalidSignature);
        }
        self.add_impl(tx)
    }

    /// Insert without signature verification (genesis restore, tests).
    pub fn add_unchecked(&self, tx: Transaction) -> Result<(), GraphError> {
        self.add_impl(tx)
    }

    fn add_impl(&self, tx: Transaction) -> Result<(), GraphError> {
        tx.validate_payload()
            .map_err(|e| GraphError::InvalidPayload(e.to_string()))?;

        let mut inner = self.inner.write();

        if inner.transactions.contains_key(&tx.id) {
            return Err(GraphError::Duplicate);
        }
        if tx.parent_ids.is_empty() {
            return Err(GraphError::NoParents);
        }

        // Every parent must be present or already tracked as missing. An
        // absent untracked parent is marked missing so a retry after the
        // fetch completes can succeed.
        let mut max_parent_depth: Option<u64> = None;
        let mut all_parents_present = true;
        for parent_id in &tx.parent_ids {
            match inner.transactions.get(parent_id).map(|parent| parent.depth) {
                Some(parent_depth) => {
                    if tx.depth <= parent_depth {
                        return Err(GraphError::DepthMismatch {
                            expected: parent_depth + 1,
                            got: tx.depth,
                        });
                    }
                    max_parent_depth =
                        Some(max_parent_depth.map_or(parent_depth, |d| d.max(parent_depth)));
                }
                None => {
                    all_parents_present = false;
                    if !inner.missing.contains_key(parent_id) {
                        inner.missing.insert(*parent_id, tx.depth);
                        tracing::debug!(parent = ?parent_id, "marked missing ancestor at ingress");
                        return Err(GraphError::MissingParent(*parent_id));
                    }
                }
            }
        }

        if all_parents_present {
            let expected = max_parent_depth.expect("non-empty parents") + 1;
            if tx.depth != expected {
                return Err(GraphError::DepthMismatch {
                    expected,
                    got: tx.depth,
                });
            }
        }

        let id = tx.id;
        inner.missing.remove(&id);

        for parent_id in &tx.parent_ids {
            inner.children.entry(*parent_id).or_default().push(id);
        }
        inner.depth_index.entry(tx.depth).or_default().insert(id);
        inner.height = inner.height.max(tx.depth + 1);
        inner.transactions.insert(id, tx);

        Ok(())
    }

    pub fn find(&self, id: &TransactionId) -> Option<Transaction> {
        self.inner.read().transactions.get(id).cloned()
    }

    pub fn contains(&self, id: &TransactionId) -> bool {
        self.inner.read().transactions.contains_key(id)
    }

    /// Record that an ancestor is outstanding and being fetched.
    pub fn mark_missing(&self, id: TransactionId, requesting_depth: u64) {
        let mut inner = self.inner.write();
        if inner.transactions.contains_key(&id) {
            return;
        }
        let entry = inner.missing.entry(id).or_insert(requesting_depth);
        *entry = (*entry).max(requesting_depth);
    }

    pub fn is_missing(&self, id: &TransactionId) -> bool {
        self.inner.read().missing.contains_key(id)
    }

    /// IDs currently tracked as missing, in ascending order.
    pub fn missing_ids(&self) -> Vec<TransactionId> {
        let inner = self.inner.read();
        let mut ids: Vec<_> = inner.missing.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Transactions with `start < depth <= end`, in ascending `(depth, id)`
    /// order. `None` bounds are open.
    pub fn transactions_by_depth(
        &self,
        start_exclusive: Option<u64>,
        end_inclusive: Option<u64>,
    ) -> Vec<Transaction> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for (&depth, ids) in inner.depth_index.iter() {
            if let Some(start) = start_exclusive {
                if depth <= start {
                    continue;
                }
            }
            if let Some(end) = end_inclusive {
                if depth > end {
                    break;
                }
            }
            for id in ids {
                if let Some(tx) = inner.transactions.get(id) {
                    out.push(tx.clone());
                }
            }
        }
        out
    }

    /// Direct children of a transaction, in insertion order.
    pub fn children(&self, id: &TransactionId) -> Vec<TransactionId> {
        self.inner
            .read()
            .children
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// The deterministic end-bound candidate for the next round: the
    /// highest-`(depth, id)` transaction in the graph.
    pub fn end_candidate(&self) -> Option<Transaction> {
        let inner = self.inner.read();
        let (_, ids) = inner.depth_index.iter().next_back()?;
        let id = ids.iter().next_back()?;
        inner.transactions.get(id).cloned()
    }

    pub fn root_id(&self) -> TransactionId {
        self.inner.read().root
    }

    /// One past the deepest transaction.
    pub fn height(&self) -> u64 {
        self.inner.read().height
    }

    pub fn len(&self) -> usize {
        self.inner.read().transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().transactions.is_empty()
    }
}
