//! The filesystem engine: lazy population of the tree, per-variant file
//! I/O, write-side mutations, and the fixed-mode policy.
//!
//! The engine is shared behind one mutex between the FUSE adapter thread
//! and the control-socket thread; every public method assumes the caller
//! holds that lock and therefore takes `&mut self`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::api::Api;
use crate::fs::error::FsError;
use crate::fs::node::{
    permission, strip_write, time_from_epoch, Attributes, DataFile, DirKind, DirNode, Node,
    NodeId, NodeKind, NodeStat, ROOT_ID,
};
use crate::fs::rubric;
use crate::fs::scratch::ScratchFile;
use crate::fs::synthetic::{
    resize_bytes, splice_into, CachedFile, CachedResource, SyntheticFile,
};
use crate::fs::tree::Tree;

/// Mount policy, straight from the command line.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub fixed: bool,
    pub latest_only: bool,
    pub assigned_only: bool,
    pub rubric_append_only: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            fixed: false,
            latest_only: true,
            assigned_only: false,
            rubric_append_only: true,
        }
    }
}

/// One entry of a directory listing, ready for the readdir reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListEntry {
    pub ino: u64,
    pub name: String,
    pub is_dir: bool,
}

pub struct Engine {
    tree: Tree,
    api: Api,
    options: EngineOptions,
    mountpoint: PathBuf,
    scratch_dir: PathBuf,
    open_files: HashMap<u64, NodeId>,
    next_handle: u64,
    uid: u32,
    gid: u32,
}

impl Engine {
    /// Builds the tree root, the root-level synthetic files, and the
    /// eagerly loaded course/assignment levels.
    pub fn new(
        api: Api,
        options: EngineOptions,
        mountpoint: &Path,
        scratch_dir: &Path,
        socket_address: &str,
    ) -> Result<Engine, FsError> {
        let (uid, gid) = unsafe { (libc::getuid(), libc::getegid()) };

        let mut engine = Engine {
            tree: Tree::new(uid, gid),
            api,
            options,
            mountpoint: mountpoint.to_path_buf(),
            scratch_dir: scratch_dir.to_path_buf(),
            open_files: HashMap::new(),
            next_handle: 1,
            uid,
            gid,
        };

        engine.insert_synthetic(
            ROOT_ID,
            ".api.socket",
            SyntheticFile::fixed(socket_address.as_bytes().to_vec()),
        )?;
        engine.insert_synthetic(
            ROOT_ID,
            ".cg-mode",
            SyntheticFile::fixed(if options.fixed {
                &b"FIXED\n"[..]
            } else {
                &b"NOT_FIXED\n"[..]
            }),
        )?;

        engine.load_courses()?;
        log::info!("mounted");
        Ok(engine)
    }

    pub fn fixed(&self) -> bool {
        self.options.fixed
    }

    fn dir_node(&self, name: &str, kind: DirKind, writable: bool, remote_id: Option<i64>) -> Node {
        Node {
            name: name.to_owned(),
            parent: None,
            remote_id,
            stat: Some(NodeStat::new(self.uid, self.gid, 2)),
            kind: NodeKind::Directory(DirNode::new(kind, writable)),
        }
    }

    fn file_node(&self, name: &str, kind: NodeKind, remote_id: Option<i64>) -> Node {
        Node {
            name: name.to_owned(),
            parent: None,
            remote_id,
            stat: Some(NodeStat::new(self.uid, self.gid, 1)),
            kind,
        }
    }

    fn insert_synthetic(
        &mut self,
        parent: NodeId,
        name: &str,
        file: SyntheticFile,
    ) -> Result<NodeId, FsError> {
        let node = self.file_node(name, NodeKind::Synthetic(file), None);
        self.tree.insert(parent, node)
    }

    // ------------------------------------------------------------------
    // Lazy loaders

    fn load_courses(&mut self) -> Result<(), FsError> {
        let courses = self.api.backend().courses()?;
        for course in courses {
            let node = self.dir_node(&course.name, DirKind::Course, false, Some(course.id));
            let course_id = match self.tree.insert(ROOT_ID, node) {
                Ok(id) => id,
                Err(FsError::AlreadyExists) => {
                    log::warn!("skipping duplicate course name {:?}", course.name);
                    continue;
                }
                Err(err) => return Err(err),
            };

            for assignment in course.assignments {
                let node = self.dir_node(
                    &assignment.name,
                    DirKind::Assignment,
                    false,
                    Some(assignment.id),
                );
                let assignment_node = match self.tree.insert(course_id, node) {
                    Ok(id) => id,
                    Err(FsError::AlreadyExists) => {
                        log::warn!("skipping duplicate assignment name {:?}", assignment.name);
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                self.insert_synthetic(
                    assignment_node,
                    ".cg-assignment-id",
                    SyntheticFile::fixed(format!("{}\n", assignment.id)),
                )?;
                self.insert_synthetic(
                    assignment_node,
                    ".cg-assignment-settings.ini",
                    SyntheticFile::Cached(CachedFile::new(CachedResource::Settings {
                        assignment_id: assignment.id,
                    })),
                )?;
                self.insert_synthetic(
                    assignment_node,
                    ".cg-edit-rubric.md",
                    SyntheticFile::Cached(CachedFile::new(CachedResource::RubricEdit {
                        assignment_id: assignment.id,
                        append_only: self.options.rubric_append_only,
                        lookup: HashMap::new(),
                    })),
                )?;
                self.insert_synthetic(
                    assignment_node,
                    ".cg-edit-rubric.help",
                    SyntheticFile::fixed(rubric::EDITOR_HELP),
                )?;
            }

            if let Some(dir) = self.tree.get_mut(course_id)?.directory_mut() {
                dir.children_loaded = true;
            }
        }
        Ok(())
    }

    fn load_submissions(&mut self, assignment: NodeId) -> Result<(), FsError> {
        let remote_id = self
            .tree
            .get(assignment)?
            .remote_id
            .ok_or(FsError::NotFound)?;
        let submissions = self.api.backend().submissions(remote_id)?;
        let my_id = self.api.user().id;

        let assignee_id = |sub: &crate::api::Submission| sub.assignee.as_ref().map(|a| a.id);
        let user_assigned = self.options.assigned_only
            && submissions.iter().any(|sub| assignee_id(sub) == Some(my_id));

        let mut seen: HashSet<i64> = HashSet::new();
        for sub in submissions {
            if seen.contains(&sub.user.id) {
                continue;
            }
            if user_assigned && assignee_id(&sub) != Some(my_id) && sub.user.id != my_id {
                continue;
            }
            if self.options.latest_only {
                seen.insert(sub.user.id);
            }

            let name = format!("{} - {}", sub.user.name, sub.created_at);
            let node = self.dir_node(&name, DirKind::Submission, true, Some(sub.id));
            let sub_node = match self.tree.insert(assignment, node) {
                Ok(id) => id,
                Err(FsError::AlreadyExists) => {
                    log::warn!("skipping duplicate submission {:?}", name);
                    continue;
                }
                Err(err) => return Err(err),
            };

            self.insert_synthetic(
                sub_node,
                ".cg-rubric.md",
                SyntheticFile::Cached(CachedFile::new(CachedResource::RubricSelect {
                    submission_id: sub.id,
                    student: sub.user.name.clone(),
                    lookup: HashMap::new(),
                })),
            )?;
            self.insert_synthetic(
                sub_node,
                ".cg-grade",
                SyntheticFile::Cached(CachedFile::new(CachedResource::Grade {
                    submission_id: sub.id,
                    grade: None,
                })),
            )?;
            self.insert_synthetic(
                sub_node,
                ".cg-feedback",
                SyntheticFile::Cached(CachedFile::new(CachedResource::Feedback {
                    submission_id: sub.id,
                })),
            )?;
        }

        if let Some(dir) = self.tree.get_mut(assignment)?.directory_mut() {
            dir.children_loaded = true;
        }
        Ok(())
    }

    fn load_submission_files(&mut self, submission: NodeId) -> Result<(), FsError> {
        let remote_id = self
            .tree
            .get(submission)?
            .remote_id
            .ok_or(FsError::NotFound)?;
        let files = self.api.backend().submission_files(remote_id)?;

        for entry in files.entries.clone().unwrap_or_default() {
            self.insert_remote_entry(submission, entry)?;
        }

        self.insert_synthetic(
            submission,
            ".cg-submission-id",
            SyntheticFile::fixed(format!("{}\n", remote_id)),
        )?;

        if let Some(dir) = self.tree.get_mut(submission)?.directory_mut() {
            dir.tld = Some(files.name);
            dir.children_loaded = true;
        }
        Ok(())
    }

    fn insert_remote_entry(
        &mut self,
        parent: NodeId,
        entry: crate::api::FileEntry,
    ) -> Result<(), FsError> {
        match entry.entries {
            Some(children) => {
                let node = self.dir_node(&entry.name, DirKind::Regular, true, Some(entry.id));
                let dir_id = self.tree.insert(parent, node)?;
                for child in children {
                    self.insert_remote_entry(dir_id, child)?;
                }
                if let Some(dir) = self.tree.get_mut(dir_id)?.directory_mut() {
                    dir.children_loaded = true;
                }
            }
            None => {
                let mut node = self.file_node(
                    &entry.name,
                    NodeKind::Data(DataFile::default()),
                    Some(entry.id),
                );
                // Size and mtime arrive from a lazy server probe on the
                // first stat.
                node.stat = None;
                self.tree.insert(parent, node)?;
            }
        }
        Ok(())
    }

    /// Triggers the loader appropriate for a directory that has not been
    /// populated yet.
    fn ensure_loaded(&mut self, id: NodeId) -> Result<(), FsError> {
        let (kind, loaded) = {
            let node = self.tree.get(id)?;
            let dir = node.directory().ok_or(FsError::NotADirectory)?;
            (dir.kind, dir.children_loaded)
        };
        if loaded {
            return Ok(());
        }
        match kind {
            DirKind::Assignment => self.load_submissions(id),
            DirKind::Submission => self.load_submission_files(id),
            _ => Ok(()),
        }
    }

    fn ensure_submission_loaded(&mut self, submission: NodeId) -> Result<(), FsError> {
        let tld_known = {
            let node = self.tree.get(submission)?;
            let dir = node.directory().ok_or(FsError::NotADirectory)?;
            dir.tld.is_some()
        };
        if tld_known {
            Ok(())
        } else {
            self.load_submission_files(submission)
        }
    }

    /// Reconstructs the server path of a node below the submission level:
    /// `<tld>/<components below the submission>`, directories with a
    /// trailing slash.
    fn server_path(&mut self, id: NodeId, trailing_slash: bool) -> Result<(i64, String), FsError> {
        let submission = self.tree.submission_of(id).ok_or(FsError::NotFound)?;
        self.ensure_submission_loaded(submission)?;

        let sub_node = self.tree.get(submission)?;
        let remote_id = sub_node.remote_id.ok_or(FsError::NotFound)?;
        let tld = sub_node
            .directory()
            .and_then(|dir| dir.tld.clone())
            .ok_or(FsError::NotFound)?;

        let components = self.tree.components_below(submission, id);
        let mut path = format!("{}/{}", tld, components.join("/"));
        if trailing_slash {
            path.push('/');
        }
        Ok((remote_id, path))
    }

    /// Server path of a child about to be created under `parent`.
    fn server_path_for_child(
        &mut self,
        parent: NodeId,
        name: &str,
        trailing_slash: bool,
    ) -> Result<(i64, String), FsError> {
        let submission = self.tree.submission_of(parent).ok_or(FsError::NotFound)?;
        self.ensure_submission_loaded(submission)?;

        let sub_node = self.tree.get(submission)?;
        let remote_id = sub_node.remote_id.ok_or(FsError::NotFound)?;
        let tld = sub_node
            .directory()
            .and_then(|dir| dir.tld.clone())
            .ok_or(FsError::NotFound)?;

        let mut components = self.tree.components_below(submission, parent);
        components.push(name.to_owned());
        let mut path = format!("{}/{}", tld, components.join("/"));
        if trailing_slash {
            path.push('/');
        }
        Ok((remote_id, path))
    }

    // ------------------------------------------------------------------
    // Resolution

    /// Resolves one path component, loading lazy children as needed.
    pub fn lookup(&mut self, parent: NodeId, name: &str) -> Result<NodeId, FsError> {
        self.ensure_loaded(parent)?;
        self.tree.child(parent, name)?.ok_or(FsError::NotFound)
    }

    /// Resolves a whole path (as handed to the control socket) from the
    /// filesystem root.
    pub fn resolve(&mut self, path: &str) -> Result<NodeId, FsError> {
        let mut current = ROOT_ID;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = self.lookup(current, part)?;
        }
        Ok(current)
    }

    /// Strips the mount point from an absolute path, as the editor
    /// plugins send them.
    pub fn strip_mountpoint<'a>(&self, path: &'a str) -> &'a str {
        let mount = self.mountpoint.to_str().unwrap_or("");
        path.strip_prefix(mount).unwrap_or(path)
    }

    pub fn node_exists(&self, id: NodeId) -> bool {
        self.tree.contains(id)
    }

    pub fn is_server_file(&self, id: NodeId) -> Result<bool, FsError> {
        Ok(self.tree.get(id)?.is_data_file())
    }

    pub fn is_directory(&self, id: NodeId) -> Result<bool, FsError> {
        Ok(self.tree.get(id)?.is_dir())
    }

    fn data_file_id(&self, id: NodeId) -> Result<i64, FsError> {
        let node = self.tree.get(id)?;
        if !node.is_data_file() {
            return Err(FsError::PermissionDenied);
        }
        node.remote_id.ok_or(FsError::NotFound)
    }

    // ------------------------------------------------------------------
    // Attributes

    pub fn getattr(&mut self, id: NodeId) -> Result<Attributes, FsError> {
        self.probe_stat(id)?;

        let fixed = self.options.fixed;
        let uid = self.uid;
        let gid = self.gid;
        let node = self.tree.get_mut(id)?;

        match &mut node.kind {
            NodeKind::Directory(dir) => {
                let stat = node.stat.as_mut().expect("directories always carry a stat");
                stat.atime = SystemTime::now();
                Ok(Attributes {
                    ino: id.0,
                    size: 0,
                    is_dir: true,
                    perm: permission(true, dir.writable, true),
                    nlink: stat.nlink,
                    uid: stat.uid,
                    gid: stat.gid,
                    atime: stat.atime,
                    mtime: stat.mtime,
                    ctime: stat.ctime,
                })
            }
            NodeKind::Data(data) => {
                let remote_id = node.remote_id;
                let stat = node.stat.get_or_insert_with(|| NodeStat::new(uid, gid, 1));
                let size = match stat.size {
                    Some(size) => size,
                    None => {
                        // The probe did not learn a size; fall back to
                        // fetching the bytes themselves.
                        let bytes = match &data.data {
                            Some(bytes) => bytes.len() as u64,
                            None => {
                                let fetched = self
                                    .api
                                    .backend()
                                    .read_file(remote_id.ok_or(FsError::NotFound)?)?;
                                let len = fetched.len() as u64;
                                data.data = Some(fetched);
                                len
                            }
                        };
                        stat.size = Some(bytes);
                        bytes
                    }
                };
                let mut perm = permission(true, true, true);
                if fixed {
                    perm = strip_write(perm);
                }
                Ok(Attributes {
                    ino: id.0,
                    size,
                    is_dir: false,
                    perm,
                    nlink: stat.nlink,
                    uid: stat.uid,
                    gid: stat.gid,
                    atime: stat.atime,
                    mtime: stat.mtime,
                    ctime: stat.ctime,
                })
            }
            NodeKind::Scratch(scratch) => {
                let meta = scratch.metadata()?;
                use std::os::unix::fs::MetadataExt;
                Ok(Attributes {
                    ino: id.0,
                    size: meta.len(),
                    is_dir: false,
                    perm: permission(true, true, true),
                    nlink: meta.nlink() as u32,
                    uid: meta.uid(),
                    gid: meta.gid(),
                    atime: time_from_epoch(meta.atime() as f64),
                    mtime: time_from_epoch(meta.mtime() as f64),
                    ctime: time_from_epoch(meta.ctime() as f64),
                })
            }
            NodeKind::Synthetic(SyntheticFile::Static(data)) => {
                let now = SystemTime::now();
                Ok(Attributes {
                    ino: id.0,
                    size: data.len() as u64,
                    is_dir: false,
                    perm: permission(true, false, true),
                    nlink: 1,
                    uid,
                    gid,
                    atime: now,
                    mtime: now,
                    ctime: now,
                })
            }
            NodeKind::Synthetic(SyntheticFile::Cached(cache)) => {
                let size = cache.bytes(&mut self.api)?.len() as u64;
                let now = SystemTime::now();
                Ok(Attributes {
                    ino: id.0,
                    size,
                    is_dir: false,
                    perm: permission(true, true, true),
                    nlink: 1,
                    uid,
                    gid,
                    atime: now,
                    mtime: cache.mtime(),
                    ctime: now,
                })
            }
        }
    }

    /// First stat of a node introduced without size/mtime: ask the server
    /// for the file metadata.
    fn probe_stat(&mut self, id: NodeId) -> Result<(), FsError> {
        let (needs_probe, is_dir) = {
            let node = self.tree.get(id)?;
            match &node.kind {
                NodeKind::Data(_) => (node.stat.is_none(), false),
                NodeKind::Directory(_) => (node.stat.is_none(), true),
                _ => (false, false),
            }
        };
        if !needs_probe || self.tree.depth(id) <= 3 {
            return Ok(());
        }

        let (submission_id, path) = self.server_path(id, is_dir)?;
        let meta = self.api.backend().file_meta(submission_id, &path)?;

        let uid = self.uid;
        let gid = self.gid;
        let node = self.tree.get_mut(id)?;
        let mut stat = NodeStat::new(uid, gid, if is_dir { 2 } else { 1 });
        stat.size = meta.size;
        if let Some(modified) = meta.modification_date {
            stat.mtime = time_from_epoch(modified);
        }
        node.stat = Some(stat);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Directory reads

    pub fn readdir(&mut self, id: NodeId) -> Result<Vec<DirListEntry>, FsError> {
        self.ensure_loaded(id)?;

        let node = self.tree.get(id)?;
        let dir = node.directory().ok_or(FsError::NotADirectory)?;
        let parent = node.parent.unwrap_or(id);

        let mut entries = vec![
            DirListEntry {
                ino: id.0,
                name: ".".to_owned(),
                is_dir: true,
            },
            DirListEntry {
                ino: parent.0,
                name: "..".to_owned(),
                is_dir: true,
            },
        ];
        for (name, child_id) in &dir.children {
            let child = self.tree.get(*child_id)?;
            entries.push(DirListEntry {
                ino: child_id.0,
                name: name.clone(),
                is_dir: child.is_dir(),
            });
        }
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // File handles and I/O

    fn allocate_handle(&mut self, id: NodeId) -> u64 {
        let fh = self.next_handle;
        self.next_handle += 1;
        self.open_files.insert(fh, id);
        fh
    }

    fn handle_node(&self, fh: u64) -> Result<NodeId, FsError> {
        self.open_files.get(&fh).copied().ok_or(FsError::InvalidArgument)
    }

    pub fn open(&mut self, id: NodeId, truncate: bool) -> Result<u64, FsError> {
        {
            let node = self.tree.get_mut(id)?;
            match &mut node.kind {
                NodeKind::Directory(_) => return Err(FsError::IsADirectory),
                NodeKind::Scratch(scratch) => scratch.open()?,
                NodeKind::Data(_) | NodeKind::Synthetic(_) => {}
            }
        }
        if truncate {
            self.truncate(id, 0)?;
        }
        Ok(self.allocate_handle(id))
    }

    pub fn read(&mut self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        let id = self.handle_node(fh)?;
        self.ensure_data(id)?;

        let node = self.tree.get_mut(id)?;
        match &mut node.kind {
            NodeKind::Data(data) => {
                let bytes = data.data.as_deref().unwrap_or_default();
                Ok(slice_bytes(bytes, offset, size))
            }
            NodeKind::Scratch(scratch) => Ok(scratch.read(offset, size)?),
            NodeKind::Synthetic(SyntheticFile::Static(data)) => {
                Ok(slice_bytes(data, offset, size))
            }
            NodeKind::Synthetic(SyntheticFile::Cached(cache)) => {
                let bytes = cache.bytes(&mut self.api)?;
                Ok(slice_bytes(bytes, offset, size))
            }
            NodeKind::Directory(_) => Err(FsError::IsADirectory),
        }
    }

    pub fn write(&mut self, fh: u64, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let id = self.handle_node(fh)?;

        if self.options.fixed && self.tree.get(id)?.is_data_file() {
            return Err(FsError::PermissionDenied);
        }
        self.ensure_data(id)?;

        let node = self.tree.get_mut(id)?;
        match &mut node.kind {
            NodeKind::Data(file) => {
                let bytes = file.data.get_or_insert_with(Vec::new);
                splice_into(bytes, offset as usize, data);
                let len = bytes.len() as u64;
                file.dirty = true;
                if let Some(stat) = node.stat.as_mut() {
                    let now = SystemTime::now();
                    stat.size = Some(len);
                    stat.atime = now;
                    stat.mtime = now;
                }
                Ok(data.len() as u32)
            }
            NodeKind::Scratch(scratch) => Ok(scratch.write(offset, data)?),
            NodeKind::Synthetic(SyntheticFile::Cached(cache)) => {
                cache.write(&mut self.api, offset, data)
            }
            NodeKind::Synthetic(SyntheticFile::Static(_)) => Err(FsError::PermissionDenied),
            NodeKind::Directory(_) => Err(FsError::IsADirectory),
        }
    }

    pub fn truncate(&mut self, id: NodeId, length: u64) -> Result<(), FsError> {
        if self.options.fixed && self.tree.get(id)?.is_data_file() {
            return Err(FsError::PermissionDenied);
        }
        if self.tree.get(id)?.is_data_file() {
            self.ensure_data(id)?;
        }

        let node = self.tree.get_mut(id)?;
        match &mut node.kind {
            NodeKind::Data(file) => {
                let bytes = file.data.get_or_insert_with(Vec::new);
                resize_bytes(bytes, length as usize);
                file.dirty = true;
                if let Some(stat) = node.stat.as_mut() {
                    let now = SystemTime::now();
                    stat.size = Some(length);
                    stat.atime = now;
                    stat.mtime = now;
                }
                Ok(())
            }
            NodeKind::Scratch(scratch) => Ok(scratch.truncate(length)?),
            NodeKind::Synthetic(SyntheticFile::Cached(cache)) => {
                cache.truncate(&mut self.api, length)
            }
            NodeKind::Synthetic(SyntheticFile::Static(_)) => Err(FsError::PermissionDenied),
            NodeKind::Directory(_) => Err(FsError::IsADirectory),
        }
    }

    pub fn truncate_handle(&mut self, fh: u64, length: u64) -> Result<(), FsError> {
        let id = self.handle_node(fh)?;
        self.truncate(id, length)
    }

    /// Fetches a data file's bytes on first access.
    fn ensure_data(&mut self, id: NodeId) -> Result<(), FsError> {
        let remote_id = {
            let node = self.tree.get(id)?;
            match &node.kind {
                NodeKind::Data(file) if file.data.is_none() => {
                    node.remote_id.ok_or(FsError::NotFound)?
                }
                _ => return Ok(()),
            }
        };

        let bytes = self.api.backend().read_file(remote_id)?;
        let len = bytes.len() as u64;
        let uid = self.uid;
        let gid = self.gid;
        let node = self.tree.get_mut(id)?;
        if let NodeKind::Data(file) = &mut node.kind {
            file.data = Some(bytes);
        }
        let stat = node.stat.get_or_insert_with(|| NodeStat::new(uid, gid, 1));
        stat.size = Some(len);
        stat.atime = SystemTime::now();
        Ok(())
    }

    pub fn flush(&mut self, fh: u64) -> Result<(), FsError> {
        let id = self.handle_node(fh)?;
        self.flush_node(id)
    }

    fn flush_node(&mut self, id: NodeId) -> Result<(), FsError> {
        let payload = {
            let node = self.tree.get(id)?;
            match &node.kind {
                NodeKind::Data(file) if file.dirty => {
                    let remote_id = node.remote_id.ok_or(FsError::NotFound)?;
                    Some((remote_id, file.data.clone().unwrap_or_default()))
                }
                _ => None,
            }
        };

        if let Some((remote_id, data)) = payload {
            match self.api.backend().write_file(remote_id, &data) {
                Ok(meta) => {
                    let node = self.tree.get_mut(id)?;
                    // The server may re-identify the file on write.
                    node.remote_id = Some(meta.id);
                    if let NodeKind::Data(file) = &mut node.kind {
                        file.dirty = false;
                    }
                }
                Err(err) => {
                    // Drop the buffer so a broken body is not retried on
                    // every subsequent flush.
                    let node = self.tree.get_mut(id)?;
                    if let NodeKind::Data(file) = &mut node.kind {
                        file.data = None;
                        file.dirty = false;
                    }
                    return Err(err.into());
                }
            }
            return Ok(());
        }

        let node = self.tree.get_mut(id)?;
        match &mut node.kind {
            NodeKind::Synthetic(SyntheticFile::Cached(cache)) => cache.flush(&mut self.api),
            _ => Ok(()),
        }
    }

    pub fn release(&mut self, fh: u64) -> Result<(), FsError> {
        let id = match self.open_files.remove(&fh) {
            Some(id) => id,
            None => return Ok(()),
        };
        if !self.tree.contains(id) {
            return Ok(());
        }
        let node = self.tree.get_mut(id)?;
        match &mut node.kind {
            NodeKind::Data(file) => {
                file.data = None;
            }
            NodeKind::Scratch(scratch) => scratch.release()?,
            _ => {}
        }

        // Drop a node that was unlinked while open once its last handle
        // goes away.
        let unlinked = node.parent.is_none() && id != ROOT_ID;
        if unlinked && !self.open_files.values().any(|&open| open == id) {
            self.tree.purge(id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Write-side mutations

    pub fn create(&mut self, parent: NodeId, name: &str) -> Result<(NodeId, u64), FsError> {
        // Nothing may be created above the submission level.
        if self.tree.depth(parent) < 3 {
            return Err(FsError::PermissionDenied);
        }
        self.ensure_loaded(parent)?;
        if self.tree.child(parent, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let id = if self.options.fixed {
            let mut scratch = ScratchFile::create(&self.scratch_dir)?;
            scratch.open()?;
            let mut node = self.file_node(name, NodeKind::Scratch(scratch), None);
            node.stat = None;
            self.tree.insert(parent, node)?
        } else {
            let (submission_id, path) = self.server_path_for_child(parent, name, false)?;
            let meta = self.api.backend().create_file(submission_id, &path, b"")?;

            let mut node = self.file_node(
                name,
                NodeKind::Data(DataFile {
                    data: Some(Vec::new()),
                    dirty: false,
                }),
                Some(meta.id),
            );
            if let Some(stat) = node.stat.as_mut() {
                stat.size = Some(meta.size.unwrap_or(0));
                if let Some(modified) = meta.modification_date {
                    stat.mtime = time_from_epoch(modified);
                }
            }
            self.tree.insert(parent, node)?
        };

        Ok((id, self.allocate_handle(id)))
    }

    pub fn mkdir(&mut self, parent: NodeId, name: &str) -> Result<NodeId, FsError> {
        if self.tree.depth(parent) < 3 {
            return Err(FsError::PermissionDenied);
        }
        self.ensure_loaded(parent)?;
        if self.tree.child(parent, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        if self.options.fixed {
            let node = Node {
                name: name.to_owned(),
                parent: None,
                remote_id: None,
                stat: Some(NodeStat::new(self.uid, self.gid, 2)),
                kind: NodeKind::Directory(DirNode::local(DirKind::Regular, true)),
            };
            return self.tree.insert(parent, node);
        }

        let (submission_id, path) = self.server_path_for_child(parent, name, true)?;
        let meta = self.api.backend().create_file(submission_id, &path, b"")?;

        let mut node = self.dir_node(name, DirKind::Regular, true, Some(meta.id));
        if let Some(dir) = node.directory_mut() {
            dir.children_loaded = true;
        }
        self.tree.insert(parent, node)
    }

    pub fn unlink(&mut self, parent: NodeId, name: &str) -> Result<(), FsError> {
        let id = self.lookup(parent, name)?;

        let remote_delete = {
            let node = self.tree.get(id)?;
            match &node.kind {
                NodeKind::Directory(_) => return Err(FsError::IsADirectory),
                NodeKind::Synthetic(_) => return Err(FsError::PermissionDenied),
                NodeKind::Scratch(_) => None,
                NodeKind::Data(_) => {
                    if self.options.fixed {
                        return Err(FsError::PermissionDenied);
                    }
                    Some(node.remote_id.ok_or(FsError::NotFound)?)
                }
            }
        };

        match remote_delete {
            Some(remote_id) => {
                self.api.backend().delete_file(remote_id)?;
            }
            None => {
                let node = self.tree.get_mut(id)?;
                if let NodeKind::Scratch(scratch) = &mut node.kind {
                    scratch.unlink()?;
                }
            }
        }

        // Open handles keep the detached node alive until release.
        self.tree.detach(parent, name)?;
        if !self.open_files.values().any(|&open| open == id) {
            self.tree.purge(id);
        }
        Ok(())
    }

    pub fn rmdir(&mut self, parent: NodeId, name: &str) -> Result<(), FsError> {
        let id = self.lookup(parent, name)?;

        let remote_delete = {
            let node = self.tree.get(id)?;
            let dir = node.directory().ok_or(FsError::NotADirectory)?;
            if dir.kind != DirKind::Regular {
                return Err(FsError::PermissionDenied);
            }
            if !dir.children.is_empty() {
                return Err(FsError::NotEmpty);
            }
            if dir.local {
                None
            } else {
                if self.options.fixed {
                    return Err(FsError::PermissionDenied);
                }
                Some(node.remote_id.ok_or(FsError::NotFound)?)
            }
        };

        if let Some(remote_id) = remote_delete {
            self.api.backend().delete_file(remote_id)?;
        }
        self.tree.remove(parent, name)
    }

    pub fn rename(
        &mut self,
        parent: NodeId,
        name: &str,
        new_parent: NodeId,
        new_name: &str,
    ) -> Result<(), FsError> {
        let id = self.lookup(parent, name)?;

        if matches!(self.tree.get(id)?.kind, NodeKind::Synthetic(_)) {
            return Err(FsError::PermissionDenied);
        }
        self.ensure_loaded(new_parent)?;
        if self.tree.child(new_parent, new_name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        // Both endpoints must sit below a submission.
        if self.tree.depth(id) < 4 || self.tree.depth(new_parent) < 3 {
            return Err(FsError::PermissionDenied);
        }

        let old_submission = self.tree.submission_of(id).ok_or(FsError::PermissionDenied)?;
        let new_submission = self
            .tree
            .submission_of(new_parent)
            .ok_or(FsError::PermissionDenied)?;
        if old_submission != new_submission {
            return Err(FsError::PermissionDenied);
        }
        self.ensure_submission_loaded(old_submission)?;

        let local_only = {
            let node = self.tree.get(id)?;
            match &node.kind {
                NodeKind::Scratch(_) => true,
                NodeKind::Directory(dir) => dir.local,
                _ => false,
            }
        };

        if !local_only {
            if self.options.fixed {
                return Err(FsError::PermissionDenied);
            }
            let remote_id = self.tree.get(id)?.remote_id.ok_or(FsError::NotFound)?;
            let (_, new_path) = self.server_path_for_child(new_parent, new_name, true)?;
            let meta = self.api.backend().rename_file(remote_id, &new_path)?;
            self.tree.get_mut(id)?.remote_id = Some(meta.id);
        }

        self.tree.detach(parent, name)?;
        self.tree.attach(new_parent, id, new_name)
    }

    pub fn utimens(
        &mut self,
        id: NodeId,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<(), FsError> {
        let now = SystemTime::now();
        let atime = atime.unwrap_or(now);
        let mtime = mtime.unwrap_or(now);

        let uid = self.uid;
        let gid = self.gid;
        let fixed = self.options.fixed;
        let node = self.tree.get_mut(id)?;
        match &mut node.kind {
            NodeKind::Directory(_) => Err(FsError::IsADirectory),
            NodeKind::Data(_) => {
                if fixed {
                    return Err(FsError::PermissionDenied);
                }
                let stat = node.stat.get_or_insert_with(|| NodeStat::new(uid, gid, 1));
                stat.atime = atime;
                stat.mtime = mtime;
                Ok(())
            }
            NodeKind::Scratch(scratch) => Ok(scratch.set_times(atime, mtime)?),
            // Synthetic timestamps are computed, not stored.
            NodeKind::Synthetic(_) => Ok(()),
        }
    }

    pub fn statfs(&self) -> (u32, u64, u64) {
        // Dummy but stable: bsize, blocks, bavail.
        (512, 4096, 2048)
    }

    // ------------------------------------------------------------------
    // Control-socket operations

    pub fn file_comments(&mut self, id: NodeId) -> Result<crate::api::FileComments, FsError> {
        let file_id = self.data_file_id(id)?;
        Ok(self.api.backend().file_comments(file_id)?)
    }

    pub fn add_comment(&mut self, id: NodeId, line: u64, message: &str) -> Result<(), FsError> {
        let file_id = self.data_file_id(id)?;
        Ok(self.api.backend().add_comment(file_id, line, message)?)
    }

    pub fn delete_comment(&mut self, id: NodeId, line: u64) -> Result<(), FsError> {
        let file_id = self.data_file_id(id)?;
        Ok(self.api.backend().delete_comment(file_id, line)?)
    }
}

fn slice_bytes(data: &[u8], offset: u64, size: u32) -> Vec<u8> {
    let start = (offset as usize).min(data.len());
    let end = (start + size as usize).min(data.len());
    data[start..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::api::{InMemoryBackend, RemoteState, SharedRemoteState};

    struct Fixture {
        engine: Engine,
        state: SharedRemoteState,
        _scratch: tempfile::TempDir,
    }

    const SUBMISSION_DIR: &str = "alice - 2026-02-01T10:00:00";

    fn remote_state() -> RemoteState {
        let mut state = RemoteState::new("teacher");
        let course = state.add_course("Programming 101");
        let assignment =
            state.add_assignment(course, "Assignment 1", "grading", "2026-06-01T10:00:00");
        let sub = state.add_submission(assignment, (2, "alice"), "2026-02-01T10:00:00", "top");
        state.add_file(sub, "hello.py", b"print('hi')\n");
        state.add_file(sub, "dir/x.c", b"int main() {}\n");
        state
    }

    fn fixture_with(state: RemoteState, options: EngineOptions) -> Fixture {
        let backend = InMemoryBackend::new(state);
        let shared = backend.state();
        let scratch = tempfile::tempdir().unwrap();
        let engine = Engine::new(
            Api::new(backend),
            options,
            Path::new("/mnt/cg"),
            scratch.path(),
            "/tmp/cgfs-test.sock",
        )
        .unwrap();
        Fixture {
            engine,
            state: shared,
            _scratch: scratch,
        }
    }

    fn fixture(options: EngineOptions) -> Fixture {
        fixture_with(remote_state(), options)
    }

    fn submission_path(rest: &str) -> String {
        format!("Programming 101/Assignment 1/{}/{}", SUBMISSION_DIR, rest)
    }

    fn read_all(engine: &mut Engine, path: &str) -> Vec<u8> {
        let id = engine.resolve(path).unwrap();
        let fh = engine.open(id, false).unwrap();
        let data = engine.read(fh, 0, 1 << 20).unwrap();
        engine.release(fh).unwrap();
        data
    }

    #[test]
    fn courses_and_assignments_load_eagerly() {
        let mut fx = fixture(EngineOptions::default());
        let names: Vec<String> = fx
            .engine
            .readdir(ROOT_ID)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(names.contains(&".api.socket".to_owned()));
        assert!(names.contains(&".cg-mode".to_owned()));
        assert!(names.contains(&"Programming 101".to_owned()));

        let assignment = fx.engine.resolve("Programming 101/Assignment 1").unwrap();
        let names: Vec<String> = fx
            .engine
            .readdir(assignment)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        for expected in [
            ".cg-assignment-id",
            ".cg-assignment-settings.ini",
            ".cg-edit-rubric.md",
            ".cg-edit-rubric.help",
        ] {
            assert!(names.contains(&expected.to_owned()), "missing {}", expected);
        }
    }

    #[test]
    fn submissions_and_files_load_on_descent() {
        let mut fx = fixture(EngineOptions::default());
        let file = fx.engine.resolve(&submission_path("dir/x.c")).unwrap();
        assert!(fx.engine.is_server_file(file).unwrap());

        let submission = fx
            .engine
            .resolve(&format!("Programming 101/Assignment 1/{}", SUBMISSION_DIR))
            .unwrap();
        let names: Vec<String> = fx
            .engine
            .readdir(submission)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        for expected in [
            ".cg-rubric.md",
            ".cg-grade",
            ".cg-feedback",
            ".cg-submission-id",
            "hello.py",
            "dir",
        ] {
            assert!(names.contains(&expected.to_owned()), "missing {}", expected);
        }
    }

    #[test]
    fn mode_file_reflects_the_mount_mode() {
        let mut fx = fixture(EngineOptions::default());
        assert_eq!(read_all(&mut fx.engine, ".cg-mode"), b"NOT_FIXED\n");

        let mut fx = fixture(EngineOptions {
            fixed: true,
            ..EngineOptions::default()
        });
        assert_eq!(read_all(&mut fx.engine, ".cg-mode"), b"FIXED\n");
    }

    #[test]
    fn data_files_fetch_lazily_and_read_back() {
        let mut fx = fixture(EngineOptions::default());
        assert_eq!(
            read_all(&mut fx.engine, &submission_path("hello.py")),
            b"print('hi')\n"
        );
    }

    #[test]
    fn writes_pad_with_nul_beyond_the_end() {
        let mut fx = fixture(EngineOptions::default());
        let path = submission_path("hello.py");
        let id = fx.engine.resolve(&path).unwrap();
        let fh = fx.engine.open(id, false).unwrap();
        fx.engine.truncate(id, 0).unwrap();
        fx.engine.write(fh, 4, b"late").unwrap();
        assert_eq!(fx.engine.read(fh, 0, 100).unwrap(), b"\0\0\0\0late");
        fx.engine.flush(fh).unwrap();
        fx.engine.release(fh).unwrap();

        let state = fx.state.lock().unwrap();
        let contents = state.file_contents.values().find(|c| c.ends_with(b"late"));
        assert_eq!(contents.unwrap().as_slice(), b"\0\0\0\0late");
    }

    #[test]
    fn truncate_extends_and_shortens() {
        let mut fx = fixture(EngineOptions::default());
        let path = submission_path("hello.py");
        let id = fx.engine.resolve(&path).unwrap();
        let fh = fx.engine.open(id, false).unwrap();

        fx.engine.truncate(id, 2).unwrap();
        assert_eq!(fx.engine.read(fh, 0, 100).unwrap(), b"pr");
        fx.engine.truncate(id, 4).unwrap();
        assert_eq!(fx.engine.read(fh, 0, 100).unwrap(), b"pr\0\0");
        fx.engine.truncate(id, 0).unwrap();
        assert_eq!(fx.engine.read(fh, 0, 100).unwrap(), b"");
        fx.engine.release(fh).unwrap();
    }

    #[test]
    fn failed_flush_drops_the_buffer() {
        let mut fx = fixture(EngineOptions::default());
        let path = submission_path("hello.py");
        let id = fx.engine.resolve(&path).unwrap();
        let fh = fx.engine.open(id, false).unwrap();
        fx.engine.write(fh, 0, b"broken body").unwrap();

        fx.state.lock().unwrap().fail_next = Some(crate::api::ApiError {
            status: 500,
            code: crate::api::ApiErrorCode::Unknown,
            message: "boom".into(),
            description: String::new(),
        });
        assert!(fx.engine.flush(fh).is_err());

        // A second flush is a no-op, and reads refetch the server copy.
        fx.engine.flush(fh).unwrap();
        assert_eq!(fx.engine.read(fh, 0, 100).unwrap(), b"print('hi')\n");
        fx.engine.release(fh).unwrap();
    }

    #[test]
    fn create_needs_a_submission_parent() {
        let mut fx = fixture(EngineOptions::default());
        let assignment = fx.engine.resolve("Programming 101/Assignment 1").unwrap();
        assert!(matches!(
            fx.engine.create(assignment, "nope.txt"),
            Err(FsError::PermissionDenied)
        ));
        let course = fx.engine.resolve("Programming 101").unwrap();
        assert!(matches!(
            fx.engine.mkdir(course, "nope"),
            Err(FsError::PermissionDenied)
        ));
    }

    #[test]
    fn create_and_mkdir_reach_the_server() {
        let mut fx = fixture(EngineOptions::default());
        let submission = fx
            .engine
            .resolve(&format!("Programming 101/Assignment 1/{}", SUBMISSION_DIR))
            .unwrap();

        let dir = fx.engine.mkdir(submission, "new-dir").unwrap();
        let (file, fh) = fx.engine.create(dir, "notes.txt").unwrap();
        fx.engine.write(fh, 0, b"remember").unwrap();
        fx.engine.flush(fh).unwrap();
        fx.engine.release(fh).unwrap();
        assert!(fx.engine.is_server_file(file).unwrap());

        let sub_id = *fx.state.lock().unwrap().file_trees.keys().next().unwrap();
        let mut api = Api::new(InMemoryBackend::from_shared(&fx.state));
        let meta = api
            .backend()
            .file_meta(sub_id, "top/new-dir/notes.txt")
            .unwrap();
        assert_eq!(meta.size, Some(8));
    }

    #[test]
    fn unlink_removes_server_files() {
        let mut fx = fixture(EngineOptions::default());
        let path = submission_path("hello.py");
        let id = fx.engine.resolve(&path).unwrap();
        let parent = fx
            .engine
            .resolve(&format!("Programming 101/Assignment 1/{}", SUBMISSION_DIR))
            .unwrap();
        fx.engine.unlink(parent, "hello.py").unwrap();
        assert!(!fx.engine.node_exists(id));
        assert!(matches!(
            fx.engine.resolve(&path),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn synthetic_files_cannot_be_unlinked_or_renamed() {
        let mut fx = fixture(EngineOptions::default());
        let submission = fx
            .engine
            .resolve(&format!("Programming 101/Assignment 1/{}", SUBMISSION_DIR))
            .unwrap();
        fx.engine.ensure_loaded(submission).unwrap();
        assert!(matches!(
            fx.engine.unlink(submission, ".cg-grade"),
            Err(FsError::PermissionDenied)
        ));
        assert!(matches!(
            fx.engine
                .rename(submission, ".cg-grade", submission, "grade.txt"),
            Err(FsError::PermissionDenied)
        ));
    }

    #[test]
    fn rmdir_only_removes_empty_regular_directories() {
        let mut fx = fixture(EngineOptions::default());
        let submission = fx
            .engine
            .resolve(&format!("Programming 101/Assignment 1/{}", SUBMISSION_DIR))
            .unwrap();
        // dir still contains x.c
        assert!(matches!(
            fx.engine.rmdir(submission, "dir"),
            Err(FsError::NotEmpty)
        ));

        let dir = fx.engine.resolve(&submission_path("dir")).unwrap();
        fx.engine.unlink(dir, "x.c").unwrap();
        fx.engine.rmdir(submission, "dir").unwrap();

        let assignment = fx.engine.resolve("Programming 101/Assignment 1").unwrap();
        assert!(matches!(
            fx.engine.rmdir(assignment, SUBMISSION_DIR),
            Err(FsError::PermissionDenied)
        ));
    }

    #[test]
    fn rename_within_a_submission_adopts_the_new_server_id() {
        let mut fx = fixture(EngineOptions::default());
        let id = fx.engine.resolve(&submission_path("hello.py")).unwrap();
        let before = fx.engine.tree.get(id).unwrap().remote_id;

        let submission = fx
            .engine
            .resolve(&format!("Programming 101/Assignment 1/{}", SUBMISSION_DIR))
            .unwrap();
        let dir = fx.engine.resolve(&submission_path("dir")).unwrap();
        fx.engine
            .rename(submission, "hello.py", dir, "renamed.py")
            .unwrap();

        let after = fx.engine.tree.get(id).unwrap().remote_id;
        assert_ne!(before, after);
        assert_eq!(
            read_all(&mut fx.engine, &submission_path("dir/renamed.py")),
            b"print('hi')\n"
        );
    }

    #[test]
    fn getattr_masks_write_bits_in_fixed_mode() {
        let mut fx = fixture(EngineOptions {
            fixed: true,
            ..EngineOptions::default()
        });
        let id = fx.engine.resolve(&submission_path("hello.py")).unwrap();
        let attr = fx.engine.getattr(id).unwrap();
        assert_eq!(attr.perm, 0o555);

        let mut fx = fixture(EngineOptions::default());
        let id = fx.engine.resolve(&submission_path("hello.py")).unwrap();
        let attr = fx.engine.getattr(id).unwrap();
        assert_eq!(attr.perm, 0o777);
    }

    #[test]
    fn fixed_mode_rejects_every_data_file_mutation() {
        let mut fx = fixture(EngineOptions {
            fixed: true,
            ..EngineOptions::default()
        });
        let path = submission_path("hello.py");
        let id = fx.engine.resolve(&path).unwrap();
        let submission = fx
            .engine
            .resolve(&format!("Programming 101/Assignment 1/{}", SUBMISSION_DIR))
            .unwrap();

        let fh = fx.engine.open(id, false).unwrap();
        assert!(matches!(
            fx.engine.write(fh, 0, b"nope"),
            Err(FsError::PermissionDenied)
        ));
        assert!(matches!(
            fx.engine.truncate(id, 0),
            Err(FsError::PermissionDenied)
        ));
        assert!(matches!(
            fx.engine.unlink(submission, "hello.py"),
            Err(FsError::PermissionDenied)
        ));
        assert!(matches!(
            fx.engine.rename(submission, "hello.py", submission, "new.py"),
            Err(FsError::PermissionDenied)
        ));
        assert!(matches!(
            fx.engine.utimens(id, None, None),
            Err(FsError::PermissionDenied)
        ));
        fx.engine.release(fh).unwrap();

        assert_eq!(read_all(&mut fx.engine, &path), b"print('hi')\n");
    }

    #[test]
    fn fixed_mode_creates_redirect_to_scratch() {
        let mut fx = fixture(EngineOptions {
            fixed: true,
            ..EngineOptions::default()
        });
        let submission = fx
            .engine
            .resolve(&format!("Programming 101/Assignment 1/{}", SUBMISSION_DIR))
            .unwrap();

        let (id, fh) = fx.engine.create(submission, "notes.txt").unwrap();
        fx.engine.write(fh, 0, b"ok").unwrap();
        fx.engine.flush(fh).unwrap();
        assert_eq!(fx.engine.read(fh, 0, 10).unwrap(), b"ok");
        fx.engine.release(fh).unwrap();
        assert!(!fx.engine.is_server_file(id).unwrap());

        // The server never saw the file.
        let state = fx.state.lock().unwrap();
        assert!(state
            .file_trees
            .values()
            .all(|root| !contains_name(root, "notes.txt")));
    }

    fn contains_name(entry: &crate::api::FileEntry, name: &str) -> bool {
        if entry.name == name {
            return true;
        }
        entry
            .entries
            .as_ref()
            .is_some_and(|entries| entries.iter().any(|e| contains_name(e, name)))
    }

    #[test]
    fn scratch_files_survive_only_one_session() {
        let state = remote_state();
        let mut fx = fixture_with(
            state,
            EngineOptions {
                fixed: true,
                ..EngineOptions::default()
            },
        );
        let submission = fx
            .engine
            .resolve(&format!("Programming 101/Assignment 1/{}", SUBMISSION_DIR))
            .unwrap();
        let (_, fh) = fx.engine.create(submission, "scratch.txt").unwrap();
        fx.engine.write(fh, 0, b"ok").unwrap();
        fx.engine.release(fh).unwrap();

        // Same session: visible.
        assert_eq!(
            read_all(&mut fx.engine, &submission_path("scratch.txt")),
            b"ok"
        );

        // A fresh mount of the same server state: gone.
        let mut second = fixture_with(
            remote_state(),
            EngineOptions {
                fixed: true,
                ..EngineOptions::default()
            },
        );
        assert!(matches!(
            second.engine.resolve(&submission_path("scratch.txt")),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn latest_only_keeps_one_submission_per_user() {
        let mut state = remote_state();
        let assignment_id = state.assignments.keys().copied().next().unwrap();
        state.add_submission(assignment_id, (2, "alice"), "2026-02-02T10:00:00", "top");
        state.add_submission(assignment_id, (3, "bob"), "2026-02-03T10:00:00", "top");

        let mut fx = fixture_with(state, EngineOptions::default());
        let assignment = fx.engine.resolve("Programming 101/Assignment 1").unwrap();
        let submissions: Vec<String> = fx
            .engine
            .readdir(assignment)
            .unwrap()
            .into_iter()
            .filter(|e| e.is_dir && e.name != "." && e.name != "..")
            .map(|e| e.name)
            .collect();

        // The first submission in server order wins per user.
        assert_eq!(submissions.len(), 2);
        assert!(submissions.contains(&SUBMISSION_DIR.to_owned()));
        assert!(submissions.contains(&"bob - 2026-02-03T10:00:00".to_owned()));
    }

    #[test]
    fn all_submissions_shows_every_submission() {
        let mut state = remote_state();
        let assignment_id = state.assignments.keys().copied().next().unwrap();
        state.add_submission(assignment_id, (2, "alice"), "2026-02-02T10:00:00", "top");

        let mut fx = fixture_with(
            state,
            EngineOptions {
                latest_only: false,
                ..EngineOptions::default()
            },
        );
        let assignment = fx.engine.resolve("Programming 101/Assignment 1").unwrap();
        let submissions = fx
            .engine
            .readdir(assignment)
            .unwrap()
            .into_iter()
            .filter(|e| e.is_dir && e.name != "." && e.name != "..")
            .count();
        assert_eq!(submissions, 2);
    }

    #[test]
    fn assigned_only_filters_when_the_user_is_an_assignee() {
        let mut state = remote_state();
        let assignment_id = state.assignments.keys().copied().next().unwrap();
        let mine = state.add_submission(assignment_id, (3, "bob"), "2026-02-03T10:00:00", "top");
        state.assign_submission(mine, (1, "teacher"));

        let mut fx = fixture_with(
            state,
            EngineOptions {
                assigned_only: true,
                ..EngineOptions::default()
            },
        );
        let assignment = fx.engine.resolve("Programming 101/Assignment 1").unwrap();
        let submissions: Vec<String> = fx
            .engine
            .readdir(assignment)
            .unwrap()
            .into_iter()
            .filter(|e| e.is_dir && e.name != "." && e.name != "..")
            .map(|e| e.name)
            .collect();
        assert_eq!(submissions, vec!["bob - 2026-02-03T10:00:00".to_owned()]);
    }

    #[test]
    fn link_counts_track_children() {
        let mut fx = fixture(EngineOptions::default());
        let submission = fx
            .engine
            .resolve(&format!("Programming 101/Assignment 1/{}", SUBMISSION_DIR))
            .unwrap();
        let attr = fx.engine.getattr(submission).unwrap();
        let children = fx.engine.readdir(submission).unwrap().len() - 2;
        assert_eq!(attr.nlink as usize, 2 + children);
    }

    #[test]
    fn statfs_returns_the_fixed_geometry() {
        let fx = fixture(EngineOptions::default());
        assert_eq!(fx.engine.statfs(), (512, 4096, 2048));
    }

    #[test]
    fn mountpoint_prefix_is_stripped_for_socket_paths() {
        let fx = fixture(EngineOptions::default());
        assert_eq!(
            fx.engine.strip_mountpoint("/mnt/cg/Programming 101"),
            "/Programming 101"
        );
        assert_eq!(fx.engine.strip_mountpoint("/other/path"), "/other/path");
    }
}
