//! The `fuser::Filesystem` adapter: translates kernel requests into
//! `Tree`/`BrokerClient` operations. Method names and signatures
//! mirror the `Filesystem` trait declared by the `fuser` crate
//! (the same trait every `fuser` example implements); anything this
//! filesystem doesn't need (symlinks, hard links, xattrs, locks,
//! ioctl, bmap, ...) is left at the trait's own default `ENOSYS`
//! implementation rather than redeclared here.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    Errno, FileAttr, FileHandle, FileType, Filesystem, FopenFlags, Generation, INodeNo,
    LockOwner, MountOption, OpenFlags, PollEvents, PollFlags, PollNotifier, ReadFlags,
    ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen,
    ReplyPoll, ReplyWrite, Request, WriteFlags,
};
use log::warn;
use parking_lot::Mutex;

use crate::context::MqttFsContext;
use crate::error::ErrorKind;
use crate::tree::Tree;

const ATTR_TTL: Duration = Duration::from_secs(0);

fn to_errno(kind: ErrorKind) -> Errno {
    match kind {
        ErrorKind::NotFound => Errno::ENOENT,
        ErrorKind::NotADirectory => Errno::ENOTDIR,
        ErrorKind::IsADirectory => Errno::EISDIR,
        ErrorKind::Exists => Errno::EEXIST,
        ErrorKind::NoMemory => Errno::ENOMEM,
        ErrorKind::IoProtocol | ErrorKind::ProtocolError | ErrorKind::NotRunning => Errno::EIO,
        ErrorKind::InvalidArgument => Errno::EINVAL,
    }
}

fn node_attr(ino: u64, is_dir: bool, size: u64, mtime: SystemTime) -> FileAttr {
    FileAttr {
        ino: INodeNo(ino),
        size,
        blocks: size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: if is_dir {
            FileType::Directory
        } else {
            FileType::RegularFile
        },
        perm: if is_dir { 0o755 } else { 0o644 },
        nlink: if is_dir { 2 } else { 1 },
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        rdev: 0,
        flags: 0,
        blksize: 512,
    }
}

/// Top-level `Filesystem` implementation: wraps the shared context
/// (tree + broker client). Inbound publishes are wired into the tree
/// by `context.rs`'s own callback, not by this adapter; this type
/// only drives the kernel-request side of the opcode table.
pub struct MqttFs {
    ctx: Arc<MqttFsContext>,
}

impl MqttFs {
    pub fn new(ctx: Arc<MqttFsContext>) -> Self {
        MqttFs { ctx }
    }

    fn tree(&self) -> &Mutex<Tree> {
        &self.ctx.tree
    }
}

impl Filesystem for MqttFs {
    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let name = match name.to_str() {
            Some(n) => n.as_bytes(),
            None => return reply.error(Errno::EINVAL),
        };
        let tree = self.tree().lock();
        match tree.lookup_child(u64::from(parent), name) {
            Ok(node) => {
                let size = node_size(&tree, node.ino);
                let attr = node_attr(node.ino, node.is_dir(), size, node.mtime);
                reply.entry(&ATTR_TTL, &attr, Generation(0));
            }
            Err(e) => reply.error(to_errno(e.kind())),
        }
    }

    fn forget(&self, _req: &Request, _ino: INodeNo, _nlookup: u64) {}

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        let tree = self.tree().lock();
        match tree.get(u64::from(ino)) {
            Ok(node) => {
                let size = node_size(&tree, node.ino);
                let attr = node_attr(node.ino, node.is_dir(), size, node.mtime);
                reply.attr(&ATTR_TTL, &attr);
            }
            Err(e) => reply.error(to_errno(e.kind())),
        }
    }

    fn mkdir(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match name.to_str() {
            Some(n) => n.as_bytes(),
            None => return reply.error(Errno::EINVAL),
        };
        let mut tree = self.tree().lock();
        match tree.mkdir(u64::from(parent), name) {
            Ok(ino) => {
                let node = tree.get(ino).expect("just created");
                let attr = node_attr(ino, true, 0, node.mtime);
                reply.entry(&ATTR_TTL, &attr, Generation(0));
            }
            Err(e) => reply.error(to_errno(e.kind())),
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let name = match name.to_str() {
            Some(n) => n.as_bytes(),
            None => return reply.error(Errno::EINVAL),
        };
        let mut tree = self.tree().lock();
        match tree.unlink(u64::from(parent), name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(to_errno(e.kind())),
        }
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let name = match name.to_str() {
            Some(n) => n.as_bytes(),
            None => return reply.error(Errno::EINVAL),
        };
        let mut tree = self.tree().lock();
        match tree.rmdir(u64::from(parent), name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(to_errno(e.kind())),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        let mut tree = self.tree().lock();
        match tree.attach_handle(u64::from(ino)) {
            Ok(fh) => reply.opened(FileHandle(fh), FopenFlags::empty()),
            Err(e) => reply.error(to_errno(e.kind())),
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.tree().lock().detach_handle(u64::from(fh));
        reply.ok();
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        size: u32,
        _read_flags: ReadFlags,
        _flags: u32,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let tree = self.tree().lock();
        match tree.payload(u64::from(ino)) {
            Ok(payload) => {
                let start = (offset as usize).min(payload.len());
                let end = (start + size as usize).min(payload.len());
                reply.data(&payload[start..end]);
            }
            Err(e) => reply.error(to_errno(e.kind())),
        }
    }

    fn write(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: i64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        if offset != 0 {
            return reply.error(Errno::EINVAL);
        }
        let (topic, tokens) = {
            let mut tree = self.tree().lock();
            let tokens = match tree.write_payload(u64::from(ino), data) {
                Ok(tokens) => tokens,
                Err(e) => return reply.error(to_errno(e.kind())),
            };
            let topic = match tree.path_of(u64::from(ino)) {
                Ok(path) => path,
                Err(e) => return reply.error(to_errno(e.kind())),
            };
            (topic, tokens)
        };
        self.ctx.notify_tokens(tokens);
        if let Err(e) = self.ctx.publish(&topic, data) {
            warn!("publish to broker failed: {e}");
            return reply.error(to_errno(e.kind()));
        }
        reply.written(data.len() as u32);
    }

    fn create(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match name.to_str() {
            Some(n) => n.as_bytes(),
            None => return reply.error(Errno::EINVAL),
        };
        let mut tree = self.tree().lock();
        let ino = match tree.create_file(u64::from(parent), name) {
            Ok(ino) => ino,
            Err(e) => return reply.error(to_errno(e.kind())),
        };
        let fh = match tree.attach_handle(ino) {
            Ok(fh) => fh,
            Err(e) => return reply.error(to_errno(e.kind())),
        };
        let node = tree.get(ino).expect("just created");
        let attr = node_attr(ino, false, 0, node.mtime);
        reply.created(&ATTR_TTL, &attr, Generation(0), FileHandle(fh), FopenFlags::empty());
    }

    fn opendir(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        let tree = self.tree().lock();
        match tree.get(u64::from(ino)) {
            Ok(node) if node.is_dir() => reply.opened(FileHandle(0), FopenFlags::empty()),
            Ok(_) => reply.error(Errno::ENOTDIR),
            Err(e) => reply.error(to_errno(e.kind())),
        }
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let tree = self.tree().lock();
        let entries = match tree.readdir(u64::from(ino)) {
            Ok(entries) => entries,
            Err(e) => return reply.error(to_errno(e.kind())),
        };
        for (i, (child_ino, name, is_dir)) in entries.into_iter().enumerate().skip(offset as usize) {
            let kind = if is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            if reply.add(INodeNo(child_ino), (i + 1) as u64, kind, OsStr::new(
                std::str::from_utf8(&name).unwrap_or("?"),
            )) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _flags: OpenFlags,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn poll(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        ph: PollNotifier,
        _events: PollEvents,
        _flags: PollFlags,
        reply: ReplyPoll,
    ) {
        let token = ph.handle().0;
        let mut tree = self.tree().lock();
        match tree.poll(u64::from(fh), Some(token)) {
            Ok(ready) => reply.poll(if ready { libc::POLLIN as u32 } else { 0 }),
            Err(e) => reply.error(to_errno(e.kind())),
        }
    }
}

fn node_size(tree: &Tree, ino: u64) -> u64 {
    tree.payload(ino).map(|p| p.len() as u64).unwrap_or(0)
}

/// Mount options this filesystem always requests, matching the way
/// every `fuser` example extends a base option list in `main`.
pub fn default_mount_options(fs_name: &str) -> Vec<MountOption> {
    vec![MountOption::FSName(fs_name.to_string()), MountOption::DefaultPermissions]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_errno_maps_kinds() {
        assert_eq!(to_errno(ErrorKind::NotFound), Errno::ENOENT);
        assert_eq!(to_errno(ErrorKind::InvalidArgument), Errno::EINVAL);
        assert_eq!(to_errno(ErrorKind::NotRunning), Errno::EIO);
    }
}
