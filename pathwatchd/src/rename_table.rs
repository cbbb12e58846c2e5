//! Transient cookie → detached-node map pairing `MOVED_FROM` with its
//! matching `MOVED_TO` (§4.5).
//!
//! The table may legitimately survive across event batches — nothing
//! guarantees the two halves of a rename land in the same kernel read
//! (§4.4 Ordering). To still satisfy §3 invariant 5 (a residual entry means
//! the rename left the watched subtree and must eventually be freed), each
//! entry carries an insertion timestamp and [`sweep_stale`] reclaims
//! entries older than a grace period at every batch epilogue, rather than
//! unconditionally draining the table at every batch boundary.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::tree::NodeRef;

/// How long a `MOVED_FROM` is allowed to wait for its `MOVED_TO` before the
/// node is considered lost and freed.
pub const GRACE_PERIOD: Duration = Duration::from_secs(30);

pub struct RenameTable {
    entries: HashMap<u32, (NodeRef, Instant)>,
}

impl RenameTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Kernel cookies are unique within their lifetime; a duplicate insert
    /// means an earlier FROM's matching TO never arrived and was itself
    /// never swept — log it rather than silently losing the earlier node.
    pub fn insert(&mut self, cookie: u32, node: NodeRef) {
        if let Some((_stale, _)) = self.entries.insert(cookie, (node, Instant::now())) {
            log::warn!("duplicate rename cookie {} observed", cookie);
        }
    }

    pub fn take(&mut self, cookie: u32) -> Option<NodeRef> {
        self.entries.remove(&cookie).map(|(node, _)| node)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns every entry older than [`GRACE_PERIOD`].
    pub fn sweep_stale(&mut self) -> Vec<NodeRef> {
        let now = Instant::now();
        let stale: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, (_, inserted))| now.duration_since(*inserted) >= GRACE_PERIOD)
            .map(|(cookie, _)| *cookie)
            .collect();
        stale
            .into_iter()
            .filter_map(|cookie| self.entries.remove(&cookie))
            .map(|(node, _)| node)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::new_node;

    #[test]
    fn insert_then_take_pairs_a_rename() {
        let mut table = RenameTable::new();
        let node = new_node(b"a".to_vec());
        table.insert(7, node.clone());
        let taken = table.take(7).unwrap();
        assert!(std::rc::Rc::ptr_eq(&taken, &node));
        assert!(table.is_empty());
    }

    #[test]
    fn take_on_unknown_cookie_returns_none() {
        let mut table = RenameTable::new();
        assert!(table.take(1).is_none());
    }

    #[test]
    fn sweep_stale_ignores_fresh_entries() {
        let mut table = RenameTable::new();
        table.insert(1, new_node(b"a".to_vec()));
        assert!(table.sweep_stale().is_empty());
        assert!(!table.is_empty());
    }
}
