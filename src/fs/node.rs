//! The five node variants of the in-memory tree and their stat rules.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::fs::scratch::ScratchFile;
use crate::fs::synthetic::SyntheticFile;

/// Stable identifier of a node in the arena. Doubles as the FUSE inode
/// number; ids are never reused within a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// The root gets inode 1, which is what the kernel expects.
pub const ROOT_ID: NodeId = NodeId(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirKind {
    Root,
    Course,
    Assignment,
    Submission,
    Regular,
}

/// Builds a permission word with the same rwx triple for user, group and
/// other, which is how the exposed tree treats everyone.
pub fn permission(read: bool, write: bool, execute: bool) -> u16 {
    let mut bits = 0;
    if read {
        bits += 4;
    }
    if write {
        bits += 2;
    }
    if execute {
        bits += 1;
    }
    bits | (bits << 3) | (bits << 6)
}

pub fn strip_write(perm: u16) -> u16 {
    perm & !permission(false, true, false)
}

/// Converts the server's epoch-seconds float into a `SystemTime`.
pub fn time_from_epoch(seconds: f64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs_f64(seconds.max(0.0))
}

/// Stat fields owned by a node. `size` stays `None` for data files whose
/// length is not known until the bytes (or the server metadata) arrive.
#[derive(Debug, Clone, Copy)]
pub struct NodeStat {
    pub size: Option<u64>,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
}

impl NodeStat {
    pub fn new(uid: u32, gid: u32, nlink: u32) -> NodeStat {
        let now = SystemTime::now();
        NodeStat {
            size: Some(0),
            atime: now,
            mtime: now,
            ctime: now,
            uid,
            gid,
            nlink,
        }
    }
}

/// What the adapter needs to answer a `getattr`.
#[derive(Debug, Clone, Copy)]
pub struct Attributes {
    pub ino: u64,
    pub size: u64,
    pub is_dir: bool,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

#[derive(Debug)]
pub struct DirNode {
    pub kind: DirKind,
    pub writable: bool,
    /// Local directories exist only in memory (created while mounted
    /// fixed) and never talk to the server.
    pub local: bool,
    pub children: BTreeMap<String, NodeId>,
    pub children_loaded: bool,
    /// The server's root-folder name for a submission, known once its
    /// file tree has been fetched.
    pub tld: Option<String>,
}

impl DirNode {
    pub fn new(kind: DirKind, writable: bool) -> DirNode {
        DirNode {
            kind,
            writable,
            local: false,
            children: BTreeMap::new(),
            children_loaded: false,
            tld: None,
        }
    }

    pub fn local(kind: DirKind, writable: bool) -> DirNode {
        DirNode {
            local: true,
            children_loaded: true,
            ..DirNode::new(kind, writable)
        }
    }

    /// Child names plus the two dot entries, readdir-style.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.children.keys().cloned().collect();
        names.push(".".to_owned());
        names.push("..".to_owned());
        names
    }
}

#[derive(Debug, Default)]
pub struct DataFile {
    /// `None` until fetched, and again after release.
    pub data: Option<Vec<u8>>,
    pub dirty: bool,
}

#[derive(Debug)]
pub enum NodeKind {
    Directory(DirNode),
    Data(DataFile),
    Scratch(ScratchFile),
    Synthetic(SyntheticFile),
}

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub parent: Option<NodeId>,
    /// Opaque server-side id, when this node is server-backed. A data
    /// file's id can change when the server re-identifies it on write.
    pub remote_id: Option<i64>,
    pub stat: Option<NodeStat>,
    pub kind: NodeKind,
}

impl Node {
    pub fn directory(&self) -> Option<&DirNode> {
        match &self.kind {
            NodeKind::Directory(dir) => Some(dir),
            _ => None,
        }
    }

    pub fn directory_mut(&mut self) -> Option<&mut DirNode> {
        match &mut self.kind {
            NodeKind::Directory(dir) => Some(dir),
            _ => None,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    pub fn is_data_file(&self) -> bool {
        matches!(self.kind, NodeKind::Data(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_replicates_the_triple() {
        assert_eq!(permission(true, false, true), 0o555);
        assert_eq!(permission(true, true, true), 0o777);
        assert_eq!(permission(false, false, false), 0o000);
    }

    #[test]
    fn strip_write_leaves_read_and_execute() {
        assert_eq!(strip_write(0o777), 0o555);
        assert_eq!(strip_write(0o555), 0o555);
    }

    #[test]
    fn list_includes_dot_entries() {
        let mut dir = DirNode::new(DirKind::Regular, true);
        dir.children.insert("a.c".to_owned(), NodeId(7));
        let names = dir.list();
        assert!(names.contains(&".".to_owned()));
        assert!(names.contains(&"..".to_owned()));
        assert!(names.contains(&"a.c".to_owned()));
        assert_eq!(names.len(), 3);
    }
}
