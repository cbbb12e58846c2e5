//! Recursive directory indexing (§4.2): walks a subtree, registers a watch
//! on every directory it visits, and interleaves notification draining so
//! long walks don't let the kernel's event queue overflow.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_recursion::async_recursion;
use inotify::EventStream;

use crate::dispatcher::{BatchOutcome, EventDispatcher};
use crate::path_util::{self, PathTooLong, PATH_MAX};
use crate::tree::{self, DirRecord, NodeRef};
use crate::watch::WatchManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Done,
    Drift,
}

static WARNED_PROC: AtomicBool = AtomicBool::new(false);

fn warn_proc_once(path: &[u8]) {
    if path.starts_with(b"/proc") && !WARNED_PROC.swap(true, Ordering::Relaxed) {
        log::warn!(
            "indexing {}: kernel notifications do not propagate under /proc; \
             entries created or removed there will only be seen on the next re-index",
            String::from_utf8_lossy(path)
        );
    }
}

/// Entry point (§4.2). Resolves `path` to its canonical absolute form,
/// materialises any missing ancestor nodes with `create_path` and marks
/// them indexed (the Indexer never auto-visits a just-materialised
/// ancestor later — only the terminal node is a real watched root), then
/// begins the recursive walk if the resolved path is a directory.
pub async fn index_from(
    root: &NodeRef,
    path: &Path,
    watch_mgr: &mut WatchManager,
    dispatcher: &mut EventDispatcher,
    stream: &mut EventStream<Vec<u8>>,
) -> anyhow::Result<IndexOutcome> {
    let canonical = fs::canonicalize(path)
        .map_err(|why| anyhow::anyhow!("failed to resolve {}: {}", path.display(), why))?;
    let bytes = path_util::os_str_to_bytes(canonical.as_os_str());
    if bytes.len() > PATH_MAX {
        anyhow::bail!(
            "path exceeds the {}-byte maximum during indexing: {}",
            PATH_MAX,
            canonical.display()
        );
    }
    warn_proc_once(&bytes);

    let node = tree::create_path(root, &bytes)
        .map_err(|_| anyhow::anyhow!("an existing component of {} is not a directory", canonical.display()))?;

    let mut ancestor = node.borrow().parent();
    while let Some(p) = ancestor {
        p.borrow_mut().indexed = true;
        ancestor = p.borrow().parent();
    }

    let meta = fs::symlink_metadata(&canonical)
        .map_err(|why| anyhow::anyhow!("failed to stat {}: {}", canonical.display(), why))?;
    if !meta.is_dir() {
        node.borrow_mut().indexed = true;
        return Ok(IndexOutcome::Done);
    }
    if node.borrow().dir.is_none() {
        node.borrow_mut().dir = Some(DirRecord {
            children: Vec::new(),
            wd: None,
        });
    }

    walk_from(&node, &bytes, watch_mgr, dispatcher, stream).await
}

/// The recursive walk (§4.2). `node` must already have a directory record;
/// `path` is its already-resolved absolute path. Registers a watch on
/// `node`, enumerates its entries (symlinks counted as leaves, per a
/// non-dereferencing stat), creates child nodes, recurses into
/// subdirectories, then drains whatever notifications have queued up
/// before marking `node` indexed.
#[async_recursion(?Send)]
pub async fn walk_from(
    node: &NodeRef,
    path: &[u8],
    watch_mgr: &mut WatchManager,
    dispatcher: &mut EventDispatcher,
    stream: &mut EventStream<Vec<u8>>,
) -> anyhow::Result<IndexOutcome> {
    if path.len() > PATH_MAX {
        anyhow::bail!("path exceeds the {}-byte maximum during indexing", PATH_MAX);
    }
    debug_assert!(node.borrow().is_dir(), "walk_from: node has no directory record");

    watch_mgr.watch(node, path);

    let read_dir = match fs::read_dir(path_util::bytes_to_path(path)) {
        Ok(rd) => rd,
        Err(why) => {
            if !node.borrow().complained {
                if !dispatcher.is_quiet() {
                    log::error!(
                        "failed to enumerate {}: {}",
                        String::from_utf8_lossy(path),
                        why
                    );
                }
                node.borrow_mut().complained = true;
            }
            node.borrow_mut().indexed = true;
            return Ok(IndexOutcome::Done);
        }
    };

    // `std::fs::read_dir` never yields `.` or `..`.
    for entry in read_dir {
        let entry = match entry {
            Ok(e) => e,
            Err(why) => {
                log::error!(
                    "error reading an entry of {}: {}",
                    String::from_utf8_lossy(path),
                    why
                );
                continue;
            }
        };
        let name = path_util::os_str_to_bytes(&entry.file_name());
        let child_path = match path_util::join(path, &name) {
            Ok(p) => p,
            Err(PathTooLong) => {
                anyhow::bail!("path exceeds the {}-byte maximum during indexing", PATH_MAX)
            }
        };

        let meta = match fs::symlink_metadata(path_util::bytes_to_path(&child_path)) {
            Ok(m) => m,
            Err(why) => {
                if !node.borrow().complained {
                    if !dispatcher.is_quiet() {
                        log::error!(
                            "failed to stat {}: {}",
                            String::from_utf8_lossy(&child_path),
                            why
                        );
                    }
                    node.borrow_mut().complained = true;
                }
                continue;
            }
        };

        let child = tree::new_node(name);
        let is_dir = meta.is_dir();
        if is_dir {
            child.borrow_mut().dir = Some(DirRecord {
                children: Vec::new(),
                wd: None,
            });
        } else {
            child.borrow_mut().indexed = true;
        }
        tree::add_child(node, child.clone());

        if is_dir {
            match walk_from(&child, &child_path, watch_mgr, dispatcher, stream).await? {
                IndexOutcome::Drift => return Ok(IndexOutcome::Drift),
                IndexOutcome::Done => {}
            }
        }
    }

    // Interleave a drain so a long walk can't let the queue overflow (§4.2).
    if dispatcher.drain_ready(watch_mgr, stream).await? == BatchOutcome::Drift {
        node.borrow_mut().indexed = true;
        return Ok(IndexOutcome::Drift);
    }

    node.borrow_mut().indexed = true;
    Ok(IndexOutcome::Done)
}

/// Depth-first scan used by the batch epilogue's reindex sweep (§4.4): a
/// node with `indexed = false` is returned as-is (its subtree hasn't been
/// enumerated, so there's nothing beneath it to recurse into yet);
/// otherwise its children are scanned in turn.
pub fn collect_unindexed(root: &NodeRef) -> Vec<NodeRef> {
    let mut out = Vec::new();
    collect_unindexed_rec(root, &mut out);
    out
}

fn collect_unindexed_rec(node: &NodeRef, out: &mut Vec<NodeRef>) {
    if !node.borrow().indexed {
        out.push(node.clone());
        return;
    }
    let children: Option<Vec<NodeRef>> = node.borrow().dir.as_ref().map(|d| d.children.clone());
    if let Some(children) = children {
        for child in &children {
            collect_unindexed_rec(child, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::new_root;

    #[test]
    fn collect_unindexed_stops_at_first_unindexed_ancestor() {
        let root = new_root();
        let a = tree::create_path(&root, b"/a").unwrap();
        a.borrow_mut().indexed = true;
        let b = tree::create_path(&root, b"/a/b").unwrap();
        // b stays unindexed (default for create_path); its own children,
        // if any, must not be collected separately.
        let found = collect_unindexed(&root);
        assert_eq!(found.len(), 1);
        assert!(std::rc::Rc::ptr_eq(&found[0], &b));
    }

    #[test]
    fn collect_unindexed_is_empty_once_everything_is_indexed() {
        let root = new_root();
        let a = tree::create_path(&root, b"/a").unwrap();
        a.borrow_mut().indexed = true;
        assert!(collect_unindexed(&root).is_empty());
    }
}
