//! FUSE adapter: exposes a [`WildlandFs`] through the kernel.
//!
//! Thin translation layer: path resolution, conflict handling and
//! watcher notification all live in the daemon core. Every callback maps
//! its inode to a path, proxies to the core and converts errors to errnos.

mod inode_table;

pub use inode_table::{InodeTable, ROOT_INODE};

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use parking_lot::Mutex;

use common::storage::{Attr, FsError};

use crate::fs::{FileRef, WildlandFs};

/// TTL handed to the kernel for attributes and entries.
const ATTR_TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 512;

/// The fuser-facing filesystem.
pub struct WildlandFuse {
    fs: Arc<WildlandFs>,
    inodes: Mutex<InodeTable>,
    handles: Mutex<HashMap<u64, FileRef>>,
    next_fh: AtomicU64,
    uid: u32,
    gid: u32,
}

impl WildlandFuse {
    pub fn new(fs: Arc<WildlandFs>) -> Self {
        Self {
            fs,
            inodes: Mutex::new(InodeTable::new()),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn next_handle(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::SeqCst)
    }

    fn path_of(&self, inode: u64) -> Option<PathBuf> {
        self.inodes.lock().get_path(inode).map(Path::to_path_buf)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        let name = name.to_str()?;
        Some(self.path_of(parent)?.join(name))
    }

    fn make_attr(&self, inode: u64, attr: &Attr) -> FileAttr {
        let kind = if attr.is_dir() {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        let mtime = UNIX_EPOCH + Duration::from_secs(attr.timestamp.max(0) as u64);
        FileAttr {
            ino: inode,
            size: attr.size,
            blocks: attr.size.div_ceil(BLOCK_SIZE as u64),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: (attr.mode & 0o7777) as u16,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

fn errno(e: &FsError) -> libc::c_int {
    e.errno()
}

impl Filesystem for WildlandFuse {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        tracing::info!("FUSE filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("FUSE filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(attr) => {
                let inode = self.inodes.lock().get_or_create(&path);
                reply.entry(&ATTR_TTL, &self.make_attr(inode, &attr), 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &self.make_attr(ino, &attr)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Some(size) = size {
            if let Err(e) = self.fs.truncate(&path, size) {
                reply.error(errno(&e));
                return;
            }
        }
        if let Some(mode) = mode {
            if let Err(e) = self.fs.chmod(&path, mode) {
                reply.error(errno(&e));
                return;
            }
        }
        match self.fs.getattr(&path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &self.make_attr(ino, &attr)),
            Err(e) => reply.error(errno(&e)),
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
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let names = match self.fs.readdir(&path) {
            Ok(names) => names,
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ino, FileType::Directory, "..".to_string()),
        ];
        for name in names {
            let child = path.join(&name);
            let kind = match self.fs.getattr(&child) {
                Ok(attr) if attr.is_dir() => FileType::Directory,
                _ => FileType::RegularFile,
            };
            let inode = self.inodes.lock().get_or_create(&child);
            entries.push((inode, kind, name));
        }

        for (index, (inode, kind, name)) in
            entries.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(inode, (index + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.open(&path, flags) {
            Ok(file) => {
                let fh = self.next_handle();
                self.handles.lock().insert(fh, file);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.create(&path, flags, mode) {
            Ok(file) => {
                let inode = self.inodes.lock().get_or_create(&path);
                let fh = self.next_handle();
                self.handles.lock().insert(fh, file);
                let attr = Attr::file(0, chrono::Utc::now().timestamp());
                reply.created(&ATTR_TTL, &self.make_attr(inode, &attr), 0, fh, 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

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
        let mut handles = self.handles.lock();
        let Some(file) = handles.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match file.handle.read(size as usize, offset.max(0) as u64) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(&e)),
        }
    }

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
        let mut handles = self.handles.lock();
        let Some(file) = handles.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match file.handle.write(data, offset.max(0) as u64) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno(&e)),
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
        let mut handles = self.handles.lock();
        let Some(file) = handles.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match file.handle.flush() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
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
        let mut handles = self.handles.lock();
        let Some(file) = handles.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match file.handle.fsync() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
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
        let file = self.handles.lock().remove(&fh);
        match file {
            Some(file) => match self.fs.release(file) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno(&e)),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        if let Err(e) = self.fs.mkdir(&path, mode) {
            reply.error(errno(&e));
            return;
        }
        let inode = self.inodes.lock().get_or_create(&path);
        let attr = Attr::dir(chrono::Utc::now().timestamp());
        reply.entry(&ATTR_TTL, &self.make_attr(inode, &attr), 0);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.unlink(&path) {
            Ok(()) => {
                self.inodes.lock().forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.inodes.lock().forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
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
        let (Some(src), Some(dst)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.rename(&src, &dst) {
            Ok(()) => {
                let mut inodes = self.inodes.lock();
                inodes.forget_path(&src);
                inodes.forget_path(&dst);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }
}

/// Mount the filesystem in the background, returning the session handle.
pub fn spawn_mount(
    fs: Arc<WildlandFs>,
    mount_dir: &Path,
) -> std::io::Result<fuser::BackgroundSession> {
    std::fs::create_dir_all(mount_dir)?;
    let options = vec![
        fuser::MountOption::FSName("wildland".to_string()),
        fuser::MountOption::AutoUnmount,
        fuser::MountOption::DefaultPermissions,
    ];
    tracing::info!("mounting FUSE filesystem at {}", mount_dir.display());
    fuser::spawn_mount2(WildlandFuse::new(fs), mount_dir, &options)
}
