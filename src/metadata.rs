//! In-memory mirror of the remote namespace.
//!
//! Every node owns its children by name; there are no parent pointers, parents are
//! found by walking again from the root. The whole tree sits behind one reentrant
//! lock so that a caller holding [`MetadataTree::hold`] can keep calling tree
//! operations while other threads wait for the full unit of work.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use log::{debug, trace, warn};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::error::{Error, Result};
use crate::path;
use crate::stat::StatAttributes;

#[derive(Debug, Clone)]
struct MetadataNode {
    name: String,
    stat: StatAttributes,
    negative: bool,
    enumeration_time: Option<SystemTime>,
    children: HashMap<String, MetadataNode>,
}

/// Snapshot of one node, without its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    pub name: String,
    pub stat: StatAttributes,
    /// Confirmed absent on the remote side.
    pub negative: bool,
    /// Last successful listing of this directory, `None` if never listed.
    pub enumeration_time: Option<SystemTime>,
}

pub struct MetadataTree {
    root: ReentrantMutex<RefCell<MetadataNode>>,
}

/// Holds the tree lock for a multi-step unit of work.
pub struct TreeGuard<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<MetadataNode>>,
}

impl MetadataNode {
    fn new(
        name: &str,
        stat: StatAttributes,
        negative: bool,
        enumeration_time: Option<SystemTime>,
    ) -> Self {
        MetadataNode {
            name: name.to_string(),
            stat,
            negative,
            enumeration_time,
            children: HashMap::new(),
        }
    }

    fn entry(&self) -> MetadataEntry {
        MetadataEntry {
            name: self.name.clone(),
            stat: self.stat.clone(),
            negative: self.negative,
            enumeration_time: self.enumeration_time,
        }
    }

    /// Carry children and listing state of the node being replaced. Only a
    /// positive directory inherits; a negative node or a non-directory starts empty.
    fn absorb(&mut self, old: MetadataNode) {
        if self.negative || !self.stat.is_dir() {
            if !old.children.is_empty() {
                debug!("dropping {} children of {}", old.children.len(), old.name);
            }
            return;
        }
        if !old.negative && old.stat.is_dir() {
            self.enumeration_time = match (self.enumeration_time, old.enumeration_time) {
                (Some(new), Some(prev)) => Some(new.max(prev)),
                (new, prev) => new.or(prev),
            };
        }
        for (name, child) in old.children {
            self.children.entry(name).or_insert(child);
        }
    }
}

fn locate<'n>(root: &'n MetadataNode, path: &str) -> Option<&'n MetadataNode> {
    let mut node = root;
    for name in path::components(path) {
        node = node.children.get(name)?;
    }
    Some(node)
}

fn locate_mut<'n>(root: &'n mut MetadataNode, path: &str) -> Option<&'n mut MetadataNode> {
    let mut node = root;
    for name in path::components(path) {
        node = node.children.get_mut(name)?;
    }
    Some(node)
}

impl MetadataTree {
    pub fn new(root_stat: StatAttributes) -> Self {
        MetadataTree {
            root: ReentrantMutex::new(RefCell::new(MetadataNode::new(
                path::ROOT,
                root_stat,
                false,
                None,
            ))),
        }
    }

    pub fn hold(&self) -> TreeGuard<'_> {
        TreeGuard {
            _guard: self.root.lock(),
        }
    }

    pub fn find(&self, path: &str) -> Option<MetadataEntry> {
        let path = path::normalize(path);
        let guard = self.root.lock();
        let root = guard.borrow();
        let found = locate(&root, &path).map(MetadataNode::entry);
        match &found {
            Some(entry) => trace!("found {} negative={}", path, entry.negative),
            None => trace!("not found {}", path),
        }
        found
    }

    /// Snapshot of the children of `path`; empty when the path is unknown.
    pub fn find_children(&self, path: &str) -> Vec<MetadataEntry> {
        let path = path::normalize(path);
        let guard = self.root.lock();
        let root = guard.borrow();
        locate(&root, &path)
            .map(|node| node.children.values().map(MetadataNode::entry).collect())
            .unwrap_or_default()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.find(path).is_some()
    }

    /// Insert or replace the node at `path`. The parent must already be known.
    pub fn add(
        &self,
        path: &str,
        stat: StatAttributes,
        enumeration_time: Option<SystemTime>,
        negative: bool,
    ) -> Result<()> {
        let path = path::normalize(path);
        let guard = self.root.lock();
        let mut root = guard.borrow_mut();
        let name = path::file_name(&path);
        let mut node = MetadataNode::new(name, stat, negative, enumeration_time);

        if path::is_root(&path) {
            let old = std::mem::replace(&mut *root, node);
            root.negative = false;
            root.absorb(old);
            debug!("replaced root");
            return Ok(());
        }

        let parent_path = path::parent(&path);
        let parent = match locate_mut(&mut root, parent_path) {
            Some(parent) if !parent.negative => parent,
            _ => {
                warn!("parent directory not found: {}", path);
                return Err(Error::NotFound(parent_path.to_string()));
            }
        };
        if let Some(old) = parent.children.remove(name) {
            node.absorb(old);
        }
        trace!("added {} negative={}", path, negative);
        parent.children.insert(name.to_string(), node);
        Ok(())
    }

    /// Detach `path` from its parent. Returns whether a node was removed.
    pub fn remove(&self, path: &str) -> Result<bool> {
        let path = path::normalize(path);
        if path::is_root(&path) {
            return Err(Error::InvalidPath("cannot remove the root".to_string()));
        }
        let guard = self.root.lock();
        let mut root = guard.borrow_mut();
        let removed = locate_mut(&mut root, path::parent(&path))
            .and_then(|parent| parent.children.remove(path::file_name(&path)))
            .is_some();
        debug!("remove {} removed={}", path, removed);
        Ok(removed)
    }

    /// Drop positive children of `dir` whose names are not in `keep`. Negative
    /// children stay: they only go away through an explicit add.
    pub fn prune_children(&self, dir: &str, keep: &HashSet<String>) -> usize {
        let dir = path::normalize(dir);
        let guard = self.root.lock();
        let mut root = guard.borrow_mut();
        match locate_mut(&mut root, &dir) {
            Some(node) => {
                let before = node.children.len();
                node.children
                    .retain(|name, child| child.negative || keep.contains(name));
                before - node.children.len()
            }
            None => 0,
        }
    }
}
