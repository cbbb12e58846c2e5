//! Wraps the kernel filesystem-change facility: subscribing directories and
//! owning the watch-descriptor → directory-node mapping (§4.3).

use std::collections::HashMap;

use inotify::{WatchDescriptor, WatchMask, Watches};

use crate::path_util;
use crate::tree::NodeRef;

/// Directories are watched for create/delete/rename activity only; content
/// changes (`MODIFY`, `ACCESS`, ...) are irrelevant to a pathname index.
pub fn watch_mask() -> WatchMask {
    WatchMask::CREATE | WatchMask::DELETE | WatchMask::MOVED_FROM | WatchMask::MOVED_TO
}

pub struct WatchManager {
    watches: Watches,
    index: HashMap<WatchDescriptor, NodeRef>,
    quiet: bool,
}

impl WatchManager {
    pub fn new(watches: Watches, quiet: bool) -> Self {
        Self {
            watches,
            index: HashMap::new(),
            quiet,
        }
    }

    /// Subscribes `node` (which must have a directory record) to watch
    /// events at `path`. On success the descriptor is stored both on the
    /// node and in this index; on failure the node is left unwatched and
    /// will drift stale until a future re-index retries it.
    pub fn watch(&mut self, node: &NodeRef, path: &[u8]) -> Option<WatchDescriptor> {
        debug_assert!(node.borrow().is_dir(), "watch: node has no directory record");
        match self.watches.add(path_util::bytes_to_path(path), watch_mask()) {
            Ok(wd) => {
                node.borrow_mut().dir.as_mut().unwrap().wd = Some(wd.clone());
                self.index.insert(wd.clone(), node.clone());
                Some(wd)
            }
            Err(why) => {
                if !self.quiet {
                    log::warn!(
                        "failed to watch {}: {}",
                        String::from_utf8_lossy(path),
                        why
                    );
                }
                None
            }
        }
    }

    pub fn unwatch(&mut self, wd: &WatchDescriptor) {
        self.index.remove(wd);
    }

    pub fn node_for(&self, wd: &WatchDescriptor) -> Option<NodeRef> {
        self.index.get(wd).cloned()
    }

    /// Removes the watch (if any) on `node` and recurses into its children,
    /// used when a whole subtree leaves the tree (DELETE, or a rename
    /// pairing that never completes).
    pub fn unwatch_recursive(&mut self, node: &NodeRef) {
        let (wd, children) = {
            let n = node.borrow();
            match &n.dir {
                Some(dir) => (dir.wd.clone(), dir.children.clone()),
                None => return,
            }
        };
        for child in &children {
            self.unwatch_recursive(child);
        }
        if let Some(wd) = wd {
            if let Err(why) = self.watches.remove(wd.clone()) {
                log::debug!("watch already gone: {}", why);
            }
            self.index.remove(&wd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::new_root;
    use inotify::Inotify;
    use tempfile::tempdir;

    #[test]
    fn watch_then_node_for_round_trips() {
        let dir = tempdir().unwrap();
        let inotify = Inotify::init().unwrap();
        let mut mgr = WatchManager::new(inotify.watches(), false);
        let root = new_root();
        let path = path_util::os_str_to_bytes(dir.path().as_os_str());

        let wd = mgr.watch(&root, &path).expect("watching a tempdir must succeed");
        assert!(mgr.node_for(&wd).is_some());

        mgr.unwatch(&wd);
        assert!(mgr.node_for(&wd).is_none());
    }

    #[test]
    fn unwatch_recursive_removes_every_descendant_watch() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let inotify = Inotify::init().unwrap();
        let mut mgr = WatchManager::new(inotify.watches(), false);
        let root = new_root();
        let root_path = path_util::os_str_to_bytes(dir.path().as_os_str());
        let root_wd = mgr.watch(&root, &root_path).unwrap();

        let child = crate::tree::new_node(b"sub".to_vec());
        child.borrow_mut().dir = Some(crate::tree::DirRecord {
            children: Vec::new(),
            wd: None,
        });
        crate::tree::add_child(&root, child.clone());
        let sub_path = path_util::os_str_to_bytes(sub.as_os_str());
        let child_wd = mgr.watch(&child, &sub_path).unwrap();

        mgr.unwatch_recursive(&root);
        assert!(mgr.node_for(&root_wd).is_none());
        assert!(mgr.node_for(&child_wd).is_none());
    }
}
