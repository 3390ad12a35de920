//! Arena storage for the node tree.
//!
//! Nodes live in a flat map keyed by [`NodeId`] and refer to their parent
//! by id, so ownership stays acyclic: the arena owns every node, parents
//! own only the name → id mapping of their children.

use std::collections::HashMap;

use crate::fs::error::FsError;
use crate::fs::node::{DirKind, DirNode, Node, NodeId, NodeKind, NodeStat, ROOT_ID};

#[derive(Debug)]
pub struct Tree {
    nodes: HashMap<NodeId, Node>,
    next_id: u64,
}

impl Tree {
    /// Creates the arena holding only the root directory.
    pub fn new(uid: u32, gid: u32) -> Tree {
        let mut nodes = HashMap::new();
        let mut root_dir = DirNode::new(DirKind::Root, false);
        root_dir.children_loaded = true;
        nodes.insert(
            ROOT_ID,
            Node {
                name: "root".to_owned(),
                parent: None,
                remote_id: None,
                stat: Some(NodeStat::new(uid, gid, 2)),
                kind: NodeKind::Directory(root_dir),
            },
        );
        Tree {
            nodes,
            next_id: ROOT_ID.0 + 1,
        }
    }

    pub fn get(&self, id: NodeId) -> Result<&Node, FsError> {
        self.nodes.get(&id).ok_or(FsError::NotFound)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut Node, FsError> {
        self.nodes.get_mut(&id).ok_or(FsError::NotFound)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Looks up a direct child by name. Does not trigger lazy loading;
    /// that is the engine's job.
    pub fn child(&self, parent: NodeId, name: &str) -> Result<Option<NodeId>, FsError> {
        let node = self.get(parent)?;
        let dir = node.directory().ok_or(FsError::NotADirectory)?;
        Ok(dir.children.get(name).copied())
    }

    /// Inserts a fresh node below `parent`. The name must be unique among
    /// the parent's children; insertion bumps the parent's link count.
    pub fn insert(&mut self, parent: NodeId, mut node: Node) -> Result<NodeId, FsError> {
        {
            let parent_node = self.get(parent)?;
            let dir = parent_node.directory().ok_or(FsError::NotADirectory)?;
            if dir.children.contains_key(&node.name) {
                return Err(FsError::AlreadyExists);
            }
        }

        let id = NodeId(self.next_id);
        let parent_node = self.get_mut(parent)?;
        if let Some(stat) = parent_node.stat.as_mut() {
            stat.nlink += 1;
        }
        parent_node
            .directory_mut()
            .expect("checked above")
            .children
            .insert(node.name.clone(), id);

        node.parent = Some(parent);
        self.nodes.insert(id, node);
        self.next_id += 1;
        Ok(id)
    }

    /// Unhooks a child from its parent without dropping it from the
    /// arena, for re-attachment elsewhere (rename).
    pub fn detach(&mut self, parent: NodeId, name: &str) -> Result<NodeId, FsError> {
        let parent_node = self.get_mut(parent)?;
        let dir = parent_node.directory_mut().ok_or(FsError::NotADirectory)?;
        let id = dir.children.remove(name).ok_or(FsError::NotFound)?;
        if let Some(stat) = parent_node.stat.as_mut() {
            stat.nlink -= 1;
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = None;
        }
        Ok(id)
    }

    /// Re-attaches a detached node below a new parent under a new name.
    pub fn attach(&mut self, parent: NodeId, id: NodeId, name: &str) -> Result<(), FsError> {
        {
            let node = self.get_mut(id)?;
            node.name = name.to_owned();
            node.parent = Some(parent);
        }
        let parent_node = self.get_mut(parent)?;
        if let Some(stat) = parent_node.stat.as_mut() {
            stat.nlink += 1;
        }
        let dir = parent_node.directory_mut().ok_or(FsError::NotADirectory)?;
        dir.children.insert(name.to_owned(), id);
        Ok(())
    }

    /// Removes a child and drops it (and any descendants) from the arena.
    pub fn remove(&mut self, parent: NodeId, name: &str) -> Result<(), FsError> {
        let id = self.detach(parent, name)?;
        self.purge(id);
        Ok(())
    }

    /// Drops an already detached node (and any descendants) from the
    /// arena. Used when the last open handle on an unlinked file goes
    /// away.
    pub fn purge(&mut self, id: NodeId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            if let Some(node) = self.nodes.remove(&id) {
                if let NodeKind::Directory(dir) = node.kind {
                    pending.extend(dir.children.values().copied());
                }
            }
        }
    }

    /// Number of steps from the root: the root is 0, a course 1, an
    /// assignment 2, a submission 3.
    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut current = id;
        while let Some(node) = self.nodes.get(&current) {
            match node.parent {
                Some(parent) => {
                    depth += 1;
                    current = parent;
                }
                None => break,
            }
        }
        depth
    }

    /// The submission directory this node lives under, if any.
    pub fn submission_of(&self, id: NodeId) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(id) = current {
            let node = self.nodes.get(&id)?;
            if let NodeKind::Directory(dir) = &node.kind {
                if dir.kind == DirKind::Submission {
                    return Some(id);
                }
            }
            current = node.parent;
        }
        None
    }

    /// Name components from (and excluding) `ancestor` down to `id`.
    pub fn components_below(&self, ancestor: NodeId, id: NodeId) -> Vec<String> {
        let mut names = Vec::new();
        let mut current = id;
        while current != ancestor {
            match self.nodes.get(&current) {
                Some(node) => {
                    names.push(node.name.clone());
                    match node.parent {
                        Some(parent) => current = parent,
                        None => break,
                    }
                }
                None => break,
            }
        }
        names.reverse();
        names
    }
}
