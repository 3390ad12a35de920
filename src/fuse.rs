//! Translation of kernel upcalls into engine operations.
//!
//! The adapter owns nothing: it resolves inode numbers (which are engine
//! node ids), takes the engine lock, and maps [`FsError`] onto errnos.
//! Attribute and entry TTLs are zero because content changes server-side
//! behind the kernel's back.

use std::ffi::OsStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};

use crate::fs::{Attributes, Engine, FsError, NodeId};

const TTL: Duration = Duration::ZERO;
const BLOCK_SIZE: u32 = 512;

pub struct CgFuse {
    engine: Arc<Mutex<Engine>>,
}

impl CgFuse {
    pub fn new(engine: Arc<Mutex<Engine>>) -> CgFuse {
        CgFuse { engine }
    }

    fn engine(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap()
    }
}

fn errno(err: FsError) -> i32 {
    match &err {
        FsError::Api(api) => {
            log::error!("unmapped api error: {}", api);
        }
        FsError::Io(io) => {
            log::error!("local i/o error: {}", io);
        }
        _ => {}
    }
    err.errno()
}

fn file_attr(attr: Attributes) -> FileAttr {
    FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.size.div_ceil(u64::from(BLOCK_SIZE)),
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: if attr.is_dir {
            FileType::Directory
        } else {
            FileType::RegularFile
        },
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn node_name(name: &OsStr) -> Result<&str, FsError> {
    name.to_str().ok_or(FsError::NotFound)
}

fn system_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl Filesystem for CgFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let mut engine = self.engine();
        let result = node_name(name)
            .and_then(|name| engine.lookup(NodeId(parent), name))
            .and_then(|id| engine.getattr(id));
        match result {
            Ok(attr) => reply.entry(&TTL, &file_attr(attr), 0),
            Err(err) => reply.error(errno(err)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.engine().getattr(NodeId(ino)) {
            Ok(attr) => reply.attr(&TTL, &file_attr(attr)),
            Err(err) => reply.error(errno(err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // Mode and ownership are derived, never settable.
        if mode.is_some() || uid.is_some() || gid.is_some() {
            reply.error(libc::EPERM);
            return;
        }

        let mut engine = self.engine();

        if let Some(size) = size {
            let result = match fh {
                Some(fh) => engine.truncate_handle(fh, size),
                None => engine.truncate(NodeId(ino), size),
            };
            if let Err(err) = result {
                reply.error(errno(err));
                return;
            }
        }

        if atime.is_some() || mtime.is_some() {
            let result = engine.utimens(
                NodeId(ino),
                atime.map(system_time),
                mtime.map(system_time),
            );
            if let Err(err) = result {
                reply.error(errno(err));
                return;
            }
        }

        match engine.getattr(NodeId(ino)) {
            Ok(attr) => reply.attr(&TTL, &file_attr(attr)),
            Err(err) => reply.error(errno(err)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyData) {
        reply.error(libc::EINVAL);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let mut engine = self.engine();
        let result = node_name(name)
            .and_then(|name| engine.mkdir(NodeId(parent), name))
            .and_then(|id| engine.getattr(id));
        match result {
            Ok(attr) => reply.entry(&TTL, &file_attr(attr), 0),
            Err(err) => reply.error(errno(err)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = node_name(name).and_then(|name| self.engine().unlink(NodeId(parent), name));
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(err)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = node_name(name).and_then(|name| self.engine().rmdir(NodeId(parent), name));
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(err)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EPERM);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let mut engine = self.engine();
        let result = node_name(name).and_then(|name| {
            let newname = node_name(newname)?;
            engine.rename(NodeId(parent), name, NodeId(newparent), newname)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(err)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let truncate = flags & libc::O_TRUNC != 0;
        match self.engine().open(NodeId(ino), truncate) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => reply.error(errno(err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.engine().read(fh, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(errno(err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.engine().write(fh, offset.max(0) as u64, data) {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(errno(err)),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        match self.engine().flush(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(err)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.engine().release(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(err)),
        }
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        match self.engine().flush(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(err)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.engine().readdir(NodeId(ino)) {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(errno(err));
                return;
            }
        };

        for (index, entry) in entries.into_iter().enumerate().skip(offset.max(0) as usize) {
            let kind = if entry.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            if reply.add(entry.ino, (index + 1) as i64, kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let (bsize, blocks, bavail) = self.engine().statfs();
        reply.statfs(blocks, bavail, bavail, 0, 0, bsize, 255, bsize);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, _size: u32, reply: ReplyXattr) {
        reply.error(libc::ENOTSUP);
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::ENOTSUP);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let mut engine = self.engine();
        let result = node_name(name).and_then(|name| {
            let (id, fh) = engine.create(NodeId(parent), name)?;
            Ok((engine.getattr(id)?, fh))
        });
        match result {
            Ok((attr, fh)) => reply.created(&TTL, &file_attr(attr), 0, fh, 0),
            Err(err) => reply.error(errno(err)),
        }
    }
}
