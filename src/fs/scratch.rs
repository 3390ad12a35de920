//! Local scratch files backing writes that must never reach the server.
//!
//! Every scratch file is a uniquely named regular file inside the
//! per-mount scratch directory. The directory itself is a `TempDir` owned
//! by the mount session, so everything under it vanishes at unmount.

use std::fs::{File, FileTimes, Metadata, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use uuid::Uuid;

#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    handle: Option<File>,
    open_count: u32,
    unlinked: bool,
}

impl ScratchFile {
    /// Creates an empty backing file with a random name under `dir`.
    pub fn create(dir: &Path) -> io::Result<ScratchFile> {
        loop {
            let path = dir.join(Uuid::new_v4().to_string());
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    return Ok(ScratchFile {
                        path,
                        handle: None,
                        open_count: 0,
                        unlinked: false,
                    })
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Opens the read-write handle on the first open and counts the rest.
    pub fn open(&mut self) -> io::Result<()> {
        if self.open_count == 0 {
            self.handle = Some(OpenOptions::new().read(true).write(true).open(&self.path)?);
        }
        self.open_count += 1;
        Ok(())
    }

    pub fn read(&self, offset: u64, size: u32) -> io::Result<Vec<u8>> {
        let handle = self.require_handle()?;
        let mut buf = vec![0; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match handle.read_at(&mut buf[filled..], offset + filled as u64)? {
                0 => break,
                n => filled += n,
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> io::Result<u32> {
        let handle = self.require_handle()?;
        handle.write_all_at(data, offset)?;
        handle.sync_data()?;
        Ok(data.len() as u32)
    }

    pub fn truncate(&self, length: u64) -> io::Result<()> {
        match &self.handle {
            Some(handle) => handle.set_len(length),
            None => File::options()
                .write(true)
                .open(&self.path)?
                .set_len(length),
        }
    }

    /// Drops one reference; closes the handle at zero and finishes a
    /// pending unlink.
    pub fn release(&mut self) -> io::Result<()> {
        self.open_count = self.open_count.saturating_sub(1);
        if self.open_count == 0 {
            self.handle = None;
            if self.unlinked {
                std::fs::remove_file(&self.path)?;
            }
        }
        Ok(())
    }

    /// Marks the file for removal; the backing file goes away once the
    /// last handle is released.
    pub fn unlink(&mut self) -> io::Result<()> {
        self.unlinked = true;
        if self.open_count == 0 {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    pub fn metadata(&self) -> io::Result<Metadata> {
        std::fs::metadata(&self.path)
    }

    pub fn set_times(&self, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        let times = FileTimes::new().set_accessed(atime).set_modified(mtime);
        match &self.handle {
            Some(handle) => handle.set_times(times),
            None => File::options()
                .write(true)
                .open(&self.path)?
                .set_times(times),
        }
    }

    fn require_handle(&self) -> io::Result<&File> {
        self.handle
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "scratch file is not open"))
    }
}
