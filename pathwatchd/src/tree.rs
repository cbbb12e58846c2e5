//! The in-memory mirror of a watched filesystem subtree.
//!
//! A node is owned by its parent's directory record; the parent
//! back-reference is a non-owning [`Weak`] so freeing a parent frees every
//! descendant exactly once (§9, option a). Children are kept in a `Vec` in
//! insertion order — lookup and removal are deliberately O(k) in the
//! directory's child count (§4.1 Algorithmic notes): event traffic is
//! I/O-bound, and insertion order is what `traverse` and query results rely
//! on.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use inotify::WatchDescriptor;

use crate::path_util::{self, SEP};

pub type NodeRef = Rc<RefCell<Node>>;

#[derive(Debug)]
pub struct Node {
    pub name: Vec<u8>,
    parent: Option<Weak<RefCell<Node>>>,
    pub dir: Option<DirRecord>,
    /// False means this directory's children have not yet been enumerated;
    /// the reindex sweep (see `indexer::collect_unindexed`) will visit it.
    pub indexed: bool,
    /// Suppresses duplicate error reports for the same broken node.
    pub complained: bool,
}

#[derive(Debug)]
pub struct DirRecord {
    pub children: Vec<NodeRef>,
    pub wd: Option<WatchDescriptor>,
}

impl Node {
    pub fn parent(&self) -> Option<NodeRef> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_dir(&self) -> bool {
        self.dir.is_some()
    }

    fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Allocates the synthetic root: a nameless directory with no parent.
pub fn new_root() -> NodeRef {
    Rc::new(RefCell::new(Node {
        name: Vec::new(),
        parent: None,
        dir: Some(DirRecord {
            children: Vec::new(),
            wd: None,
        }),
        indexed: true,
        complained: false,
    }))
}

/// Allocates a detached leaf node. Fails only on allocation exhaustion,
/// which in Rust surfaces as an abort rather than a recoverable error, so
/// this constructor is infallible.
pub fn new_node(name: Vec<u8>) -> NodeRef {
    Rc::new(RefCell::new(Node {
        name,
        parent: None,
        dir: None,
        indexed: false,
        complained: false,
    }))
}

/// Appends `child` to `parent`'s children and sets its parent link.
///
/// # Panics
/// If `parent` has no directory record, or `child` is already parented.
pub fn add_child(parent: &NodeRef, child: NodeRef) {
    assert!(
        child.borrow().parent().is_none(),
        "add_child: child is already attached to a parent"
    );
    parent
        .borrow_mut()
        .dir
        .as_mut()
        .expect("add_child: parent has no directory record")
        .children
        .push(child.clone());
    child.borrow_mut().parent = Some(Rc::downgrade(parent));
}

/// Detaches `node` from its parent's children. A no-op on the root (it has
/// no parent). If the node isn't found among its parent's children the tree
/// is already inconsistent; that's reported rather than panicked on, per
/// §4.1.
pub fn remove_node(node: &NodeRef) {
    let parent = match node.borrow().parent() {
        Some(p) => p,
        None => return,
    };
    {
        let mut p = parent.borrow_mut();
        let children = &mut p
            .dir
            .as_mut()
            .expect("remove_node: parent of a node always has a directory record")
            .children;
        match children.iter().position(|c| Rc::ptr_eq(c, node)) {
            Some(pos) => {
                children.remove(pos);
            }
            None => {
                log::error!("tree inconsistency: node not found among its parent's children");
            }
        }
    }
    node.borrow_mut().parent = None;
}

/// Walks an absolute byte path from `root`, descending only through
/// directory nodes. Never mutates the tree.
pub fn lookup(root: &NodeRef, path: &[u8]) -> Option<NodeRef> {
    let mut cur = root.clone();
    for component in path_util::split_components(path) {
        let next = {
            let node = cur.borrow();
            let dir = node.dir.as_ref()?;
            dir.children
                .iter()
                .find(|c| c.borrow().name == component)
                .cloned()
        };
        cur = next?;
    }
    Some(cur)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotADirectory;

impl std::fmt::Display for NotADirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "an existing path component is not a directory")
    }
}

impl std::error::Error for NotADirectory {}

/// Like [`lookup`], but materialises missing intermediate components as
/// directory nodes with `indexed = false`. Idempotent: calling it twice
/// with the same path returns the same node and mutates nothing the second
/// time.
pub fn create_path(root: &NodeRef, path: &[u8]) -> Result<NodeRef, NotADirectory> {
    let mut cur = root.clone();
    for component in path_util::split_components(path) {
        let existing = {
            let node = cur.borrow();
            let dir = node.dir.as_ref().ok_or(NotADirectory)?;
            dir.children
                .iter()
                .find(|c| c.borrow().name == component)
                .cloned()
        };
        cur = match existing {
            Some(n) => n,
            None => {
                let child = new_node(component.to_vec());
                child.borrow_mut().dir = Some(DirRecord {
                    children: Vec::new(),
                    wd: None,
                });
                add_child(&cur, child.clone());
                child
            }
        };
    }
    Ok(cur)
}

/// `lookup` then `remove_node`.
pub fn remove_path(root: &NodeRef, path: &[u8]) -> Option<NodeRef> {
    let node = lookup(root, path)?;
    remove_node(&node);
    Some(node)
}

/// Builds the absolute path of `node` by walking to the root. Directories
/// get a trailing separator; the root's absolute name is the bare
/// separator.
pub fn absolute_name(node: &NodeRef) -> Vec<u8> {
    let mut components: Vec<Vec<u8>> = Vec::new();
    let mut cur = node.clone();
    loop {
        let is_root = cur.borrow().is_root();
        if is_root {
            break;
        }
        let name = cur.borrow().name.clone();
        components.push(name);
        let parent = cur.borrow().parent();
        cur = match parent {
            Some(p) => p,
            None => break,
        };
    }
    components.reverse();

    let mut out = Vec::new();
    for component in &components {
        out.push(SEP);
        out.extend_from_slice(component);
    }
    if out.is_empty() || node.borrow().is_dir() {
        out.push(SEP);
    }
    out
}

/// Depth-first, pre-order traversal starting at the node resolved by
/// `start_path`. `callback` receives each visited node's absolute path; a
/// non-zero return aborts and propagates.
pub fn traverse<F>(root: &NodeRef, start_path: &[u8], mut callback: F) -> i32
where
    F: FnMut(&[u8]) -> i32,
{
    match lookup(root, start_path) {
        Some(start) => traverse_node(&start, &mut callback),
        None => 0,
    }
}

fn traverse_node<F>(node: &NodeRef, callback: &mut F) -> i32
where
    F: FnMut(&[u8]) -> i32,
{
    let path = absolute_name(node);
    let rc = callback(&path);
    if rc != 0 {
        return rc;
    }
    let children: Option<Vec<NodeRef>> = node.borrow().dir.as_ref().map(|d| d.children.clone());
    if let Some(children) = children {
        for child in &children {
            let rc = traverse_node(child, callback);
            if rc != 0 {
                return rc;
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mkdir(parent: &NodeRef, name: &str) -> NodeRef {
        let n = new_node(name.as_bytes().to_vec());
        n.borrow_mut().dir = Some(DirRecord {
            children: Vec::new(),
            wd: None,
        });
        add_child(parent, n.clone());
        n
    }

    fn mkfile(parent: &NodeRef, name: &str) -> NodeRef {
        let n = new_node(name.as_bytes().to_vec());
        n.borrow_mut().indexed = true;
        add_child(parent, n.clone());
        n
    }

    #[test]
    fn root_absolute_name_is_separator() {
        let root = new_root();
        assert_eq!(absolute_name(&root), b"/");
    }

    #[test]
    fn file_and_dir_absolute_names() {
        let root = new_root();
        let sub = mkdir(&root, "sub");
        let file = mkfile(&sub, "a");
        assert_eq!(absolute_name(&sub), b"/sub/");
        assert_eq!(absolute_name(&file), b"/sub/a");
    }

    #[test]
    fn lookup_empty_and_root_path_return_root() {
        let root = new_root();
        assert!(Rc::ptr_eq(&lookup(&root, b"").unwrap(), &root));
        assert!(Rc::ptr_eq(&lookup(&root, b"/").unwrap(), &root));
    }

    #[test]
    fn lookup_roundtrips_absolute_name() {
        let root = new_root();
        let sub = mkdir(&root, "sub");
        let file = mkfile(&sub, "a");
        let path = absolute_name(&file);
        let found = lookup(&root, &path).unwrap();
        assert!(Rc::ptr_eq(&found, &file));
    }

    #[test]
    fn create_path_is_idempotent() {
        let root = new_root();
        let first = create_path(&root, b"/a/b/c").unwrap();
        let children_before = root.borrow().dir.as_ref().unwrap().children.len();
        let second = create_path(&root, b"/a/b/c").unwrap();
        let children_after = root.borrow().dir.as_ref().unwrap().children.len();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(children_before, children_after);
    }

    #[test]
    fn create_path_rejects_leaf_intermediate() {
        let root = new_root();
        mkfile(&root, "a");
        assert!(create_path(&root, b"/a/b").is_err());
    }

    #[test]
    fn remove_node_detaches_and_leaves_tree_consistent() {
        let root = new_root();
        let sub = mkdir(&root, "sub");
        remove_node(&sub);
        assert!(sub.borrow().parent().is_none());
        assert!(root.borrow().dir.as_ref().unwrap().children.is_empty());
    }

    #[test]
    fn traverse_visits_depth_first_preorder_in_insertion_order() {
        let root = new_root();
        let a = mkdir(&root, "a");
        mkfile(&a, "1");
        mkfile(&a, "2");
        let b = mkdir(&root, "b");
        mkfile(&b, "3");

        let mut seen = Vec::new();
        traverse(&root, b"/", |path| {
            seen.push(path.to_vec());
            0
        });

        assert_eq!(
            seen,
            vec![
                b"/".to_vec(),
                b"/a/".to_vec(),
                b"/a/1".to_vec(),
                b"/a/2".to_vec(),
                b"/b/".to_vec(),
                b"/b/3".to_vec(),
            ]
        );
    }

    #[test]
    fn traverse_aborts_on_nonzero_return() {
        let root = new_root();
        mkdir(&root, "a");
        mkdir(&root, "b");

        let mut visited = 0;
        let rc = traverse(&root, b"/", |_path| {
            visited += 1;
            if visited == 2 {
                42
            } else {
                0
            }
        });
        assert_eq!(rc, 42);
        assert_eq!(visited, 2);
    }
}
