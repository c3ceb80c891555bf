//! The filesystem operations surface (spec §4.E): one method per kernel
//! callback, routing each to pass-through against the lower tree or to
//! the synthesized-contents path based on whether a template entry
//! exists at the same virtual path.
//!
//! Two errno conventions meet at this boundary and must not be confused:
//! components C/D (render, exec) return the spec's "negative errno"
//! convention (`fixup(r) = r == -1 ? -errno : r`) directly; `fuser`'s
//! `Reply*::error()` wants the *positive* libc errno instead (the
//! teacher's own handlers call `reply.error(ENOENT)`, not `-ENOENT`).
//! [`reply_errno`] and [`pos_errno`] are the only two conversion points.

use std::ffi::{CString, OsStr};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyLock, ReplyLseek, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use libc::{EINVAL, ENOENT, ENOTDIR, EPERM};
use nix::dir::Dir;
use nix::fcntl::{self, openat, AtFlags, OFlag};
use nix::sys::stat::{fchmodat, fstatat, mkdirat, FchmodAtFlags, Mode, SFlag};
use nix::unistd::{
    faccessat, fchownat, ftruncate, linkat, pread, pwrite, readlinkat, symlinkat, unlinkat, AccessFlags,
    FchownatFlags, Gid, LinkatFlags, UnlinkatFlags, Uid,
};

use crate::anchors::{relative, TreeAnchor};
use crate::config::ConfigStore;
use crate::exec_template::execute_template_with_timeout;
use crate::handles::{DirHandle, FileHandle, HandleStore};
use crate::inode_table::InodeTable;
use crate::render;

/// spec §4.E `init`: "set all entry/attr/negative caching timeouts to
/// zero". Passed as the TTL of every `reply.entry`/`reply.attr` call.
const TTL: Duration = Duration::ZERO;

pub struct TemplateFs {
    mount: TreeAnchor,
    templates: TreeAnchor,
    inodes: InodeTable,
    handles: HandleStore,
    config_store: Box<dyn ConfigStore + Send + Sync>,
    environment: Vec<CString>,
    exec_poll_timeout: Duration,
    /// Best-effort size hint for `getattr` calls that arrive without a
    /// file handle, keyed by virtual path and then by the specific open's
    /// token. Updated on every successful template `open`, removed on the
    /// matching `release`. The inner per-token map (rather than a single
    /// length per path) matters because spec §8 requires two concurrent
    /// opens of the same template path to have independent caches: keying
    /// only by path would let releasing the first handle wipe the size
    /// hint for a second handle still open on the same path. This
    /// implementation's `fuser` binding (fuser 0.14's classic reply API)
    /// does not pass a handle into `getattr`, unlike spec §4.E's source
    /// contract ("if cache present, overwrite reported size") which
    /// assumes one; this table is the practical bridge (documented in
    /// DESIGN.md).
    rendered_len: RwLock<std::collections::HashMap<String, std::collections::HashMap<u64, u64>>>,
}

impl TemplateFs {
    pub fn new(
        mount: TreeAnchor,
        templates: TreeAnchor,
        config_store: Box<dyn ConfigStore + Send + Sync>,
        environment: Vec<CString>,
        exec_poll_timeout: Duration,
    ) -> Self {
        TemplateFs {
            mount,
            templates,
            inodes: InodeTable::new(),
            handles: HandleStore::new(),
            config_store,
            environment,
            exec_poll_timeout,
            rendered_len: RwLock::new(std::collections::HashMap::new()),
        }
    }

    fn vpath(&self, ino: u64) -> Result<String, i32> {
        self.inodes.path_of(ino).ok_or(ENOENT)
    }

    fn template_exists(&self, rel: &str) -> bool {
        faccessat(Some(self.templates.dir_fd()), empty_as_dot(rel), AccessFlags::R_OK, AtFlags::empty()).is_ok()
    }

    fn template_executable(&self, rel: &str) -> bool {
        faccessat(Some(self.templates.dir_fd()), empty_as_dot(rel), AccessFlags::X_OK, AtFlags::empty()).is_ok()
    }

    /// spec §4.E `getattr` row, shared with `lookup` (which also needs a
    /// template-aware `FileAttr`, even though the template-gating table
    /// only lists `getattr` by name, but lookup's reply *is* an attr).
    fn resolve_attr(&self, virtual_path: &str) -> Result<FileAttr, i32> {
        let rel = relative(virtual_path);
        if self.template_exists(rel) {
            let st = stat_at(self.templates.dir_fd(), rel).map_err(pos_errno)?;
            let mut attr = attr_from_stat(0, &st);
            attr.perm &= !0o222;
            if attr.kind != FileType::Directory {
                attr.perm &= !0o111;
            }
            if let Some(len) = self
                .rendered_len
                .read()
                .unwrap()
                .get(virtual_path)
                .and_then(|by_token| by_token.values().next())
            {
                attr.size = *len;
            }
            Ok(attr)
        } else {
            let st = stat_at(self.mount.dir_fd(), rel).map_err(pos_errno)?;
            Ok(attr_from_stat(0, &st))
        }
    }

    fn render_template(&self, fd: RawFd) -> Result<Vec<u8>, i32> {
        // spec §9: the source mmaps but never checks for MAP_FAILED; we
        // surface the error instead of silently treating it as success.
        let file = unsafe { std::fs::File::from_raw_fd(fd) };
        let result = match unsafe { memmap2::Mmap::map(&file) } {
            Ok(mmap) => {
                if mmap.is_empty() {
                    Ok(Vec::new())
                } else {
                    render::render(&mmap[..], self.config_store.as_ref())
                }
            }
            Err(e) => Err(-e.raw_os_error().unwrap_or(libc::EIO)),
        };
        std::mem::forget(file);
        result
    }
}

fn empty_as_dot(rel: &str) -> &str {
    if rel.is_empty() {
        "."
    } else {
        rel
    }
}

fn stat_at(dir_fd: RawFd, rel: &str) -> nix::Result<libc::stat> {
    if rel.is_empty() {
        fstatat(Some(dir_fd), "", AtFlags::AT_EMPTY_PATH | AtFlags::AT_SYMLINK_NOFOLLOW)
    } else {
        fstatat(Some(dir_fd), rel, AtFlags::AT_SYMLINK_NOFOLLOW)
    }
}

/// The positive libc errno `reply.error()` expects.
fn pos_errno(e: nix::Error) -> i32 {
    e as i32
}

/// Converts a component C/D negative-errno result into the positive
/// value `reply.error()` expects.
fn reply_errno(e: i32) -> i32 {
    e.unsigned_abs() as i32
}

fn system_time_from(sec: i64, nsec: i64) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec as u32)
    } else {
        UNIX_EPOCH - Duration::new((-sec) as u64, 0)
    }
}

fn file_type_from_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
        m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
        m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
        m if m == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn attr_from_stat(ino: u64, st: &libc::stat) -> FileAttr {
    FileAttr {
        ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: system_time_from(st.st_atime, st.st_atime_nsec),
        mtime: system_time_from(st.st_mtime, st.st_mtime_nsec),
        ctime: system_time_from(st.st_ctime, st.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind: file_type_from_mode(st.st_mode as u32),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

fn osstr_to_string(name: &OsStr) -> String {
    name.to_string_lossy().into_owned()
}

impl Filesystem for TemplateFs {
    /// spec §4.E `init`. All TTLs are zero via the `TTL` constant used on
    /// every reply; "use inode numbers from this layer" and "allow null
    /// paths" are properties of how `fuser`'s inode-addressed API is
    /// bridged in [`InodeTable`] rather than `KernelConfig` toggles, since
    /// this binding has no direct equivalent of either flag (noted in
    /// DESIGN.md).
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), i32> {
        Ok(())
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_path = match self.vpath(parent) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let child = InodeTable::child_path(&parent_path, &osstr_to_string(name));
        match self.resolve_attr(&child) {
            Ok(mut attr) => {
                attr.ino = self.inodes.intern(&child);
                reply.entry(&TTL, &attr, 0);
            }
            Err(e) => reply.error(e),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.resolve_attr(&vpath) {
            Ok(mut attr) => {
                attr.ino = ino;
                reply.attr(&TTL, &attr);
            }
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let rel = relative(&vpath);

        let is_template = match fh {
            Some(token) => self.handles.with_file_handle(token, |h| h.is_template).unwrap_or(false),
            None => self.template_exists(rel),
        };

        if size.is_some() && is_template {
            return reply.error(EPERM);
        }

        if let Some(mode) = mode {
            if let Err(e) = fchmodat(
                Some(self.mount.dir_fd()),
                empty_as_dot(rel),
                Mode::from_bits_truncate(mode),
                FchmodAtFlags::FollowSymlink,
            ) {
                return reply.error(pos_errno(e));
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(e) = fchownat(
                Some(self.mount.dir_fd()),
                empty_as_dot(rel),
                uid.map(Uid::from_raw),
                gid.map(Gid::from_raw),
                FchownatFlags::FollowSymlink,
            ) {
                return reply.error(pos_errno(e));
            }
        }
        if let Some(new_size) = size {
            let truncate_result = match fh {
                Some(token) => self
                    .handles
                    .with_file_handle(token, |h| h.fd)
                    .ok()
                    .flatten()
                    .map(|fd| ftruncate(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, new_size as i64))
                    .unwrap_or(Ok(())),
                None => {
                    let abs = self.mount.absolute(&vpath);
                    nix::unistd::truncate(&abs, new_size as i64)
                }
            };
            if let Err(e) = truncate_result {
                return reply.error(pos_errno(e));
            }
        }

        match self.resolve_attr(&vpath) {
            Ok(mut attr) => {
                attr.ino = ino;
                reply.attr(&TTL, &attr);
            }
            Err(e) => reply.error(e),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match readlinkat(Some(self.mount.dir_fd()), relative(&vpath)) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(pos_errno(e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let parent_path = match self.vpath(parent) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let child = InodeTable::child_path(&parent_path, &osstr_to_string(name));
        let rel = relative(&child);
        let sflag = SFlag::from_bits_truncate(mode & libc::S_IFMT as u32);
        let perm = Mode::from_bits_truncate(mode & 0o7777);
        match nix::sys::stat::mknodat(Some(self.mount.dir_fd()), rel, sflag, perm, rdev as u64) {
            Ok(()) => match self.resolve_attr(&child) {
                Ok(mut attr) => {
                    attr.ino = self.inodes.intern(&child);
                    reply.entry(&TTL, &attr, 0);
                }
                Err(e) => reply.error(e),
            },
            Err(e) => reply.error(pos_errno(e)),
        }
    }

    fn mkdir(&mut self, _req: &Request, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let parent_path = match self.vpath(parent) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let child = InodeTable::child_path(&parent_path, &osstr_to_string(name));
        match mkdirat(Some(self.mount.dir_fd()), relative(&child), Mode::from_bits_truncate(mode)) {
            Ok(()) => match self.resolve_attr(&child) {
                Ok(mut attr) => {
                    attr.ino = self.inodes.intern(&child);
                    reply.entry(&TTL, &attr, 0);
                }
                Err(e) => reply.error(e),
            },
            Err(e) => reply.error(pos_errno(e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_path = match self.vpath(parent) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let child = InodeTable::child_path(&parent_path, &osstr_to_string(name));
        match unlinkat(Some(self.mount.dir_fd()), relative(&child), UnlinkatFlags::NoRemoveDir) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(pos_errno(e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_path = match self.vpath(parent) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let child = InodeTable::child_path(&parent_path, &osstr_to_string(name));
        match unlinkat(Some(self.mount.dir_fd()), relative(&child), UnlinkatFlags::RemoveDir) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(pos_errno(e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let parent_path = match self.vpath(parent) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let child = InodeTable::child_path(&parent_path, &osstr_to_string(link_name));
        match symlinkat(target, Some(self.mount.dir_fd()), relative(&child)) {
            Ok(()) => match self.resolve_attr(&child) {
                Ok(mut attr) => {
                    attr.ino = self.inodes.intern(&child);
                    reply.entry(&TTL, &attr, 0);
                }
                Err(e) => reply.error(e),
            },
            Err(e) => reply.error(pos_errno(e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let from_parent = match self.vpath(parent) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let to_parent = match self.vpath(newparent) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let from = InodeTable::child_path(&from_parent, &osstr_to_string(name));
        let to = InodeTable::child_path(&to_parent, &osstr_to_string(newname));

        let rename_flags = match fcntl::RenameFlags::from_bits(flags) {
            Some(f) => f,
            None => return reply.error(EINVAL),
        };
        let result = fcntl::renameat2(
            Some(self.mount.dir_fd()),
            relative(&from),
            Some(self.mount.dir_fd()),
            relative(&to),
            rename_flags,
        );
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(pos_errno(e)),
        }
    }

    fn link(&mut self, _req: &Request<'_>, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let new_parent_path = match self.vpath(newparent) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let new_child = InodeTable::child_path(&new_parent_path, &osstr_to_string(newname));
        let result = linkat(
            Some(self.mount.dir_fd()),
            relative(&vpath),
            Some(self.mount.dir_fd()),
            relative(&new_child),
            LinkatFlags::NoSymlinkFollow,
        );
        match result {
            Ok(()) => match self.resolve_attr(&new_child) {
                Ok(mut attr) => {
                    attr.ino = self.inodes.intern(&new_child);
                    reply.entry(&TTL, &attr, 0);
                }
                Err(e) => reply.error(e),
            },
            Err(e) => reply.error(pos_errno(e)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let rel = relative(&vpath);

        if self.template_exists(rel) {
            let tfd = match openat(Some(self.templates.dir_fd()), empty_as_dot(rel), OFlag::O_RDONLY, Mode::empty()) {
                Ok(fd) => fd,
                Err(e) => return reply.error(pos_errno(e)),
            };
            let executable = self.template_executable(rel);

            let render_result: Result<Vec<u8>, i32> = if executable {
                let template_abs = self.templates.absolute(&vpath);
                let lower_abs = self.mount.absolute(&vpath);
                execute_template_with_timeout(&template_abs, &lower_abs, &self.environment, self.exec_poll_timeout).and_then(|r| {
                    if r.exit_status != 0 {
                        Err(-r.exit_status)
                    } else {
                        Ok(r.stdout)
                    }
                })
            } else {
                self.render_template(tfd.as_raw_fd())
            };

            match render_result {
                Ok(bytes) => {
                    let length = bytes.len() as u64;
                    let handle = FileHandle {
                        virtual_path: vpath.clone(),
                        fd: Some(std::os::fd::IntoRawFd::into_raw_fd(tfd)),
                        is_template: true,
                        is_executable_template: executable,
                        cached_contents: Some(bytes),
                    };
                    let token = self.handles.allocate_file_handle(handle);
                    self.rendered_len
                        .write()
                        .unwrap()
                        .entry(vpath.clone())
                        .or_default()
                        .insert(token, length);
                    reply.opened(token, 0);
                }
                Err(e) => {
                    let _ = nix::unistd::close(tfd);
                    reply.error(reply_errno(e));
                }
            }
        } else {
            let oflag = OFlag::from_bits_truncate(flags);
            match openat(Some(self.mount.dir_fd()), empty_as_dot(rel), oflag, Mode::empty()) {
                Ok(fd) => {
                    let handle = FileHandle {
                        virtual_path: vpath.clone(),
                        fd: Some(std::os::fd::IntoRawFd::into_raw_fd(fd)),
                        is_template: false,
                        is_executable_template: false,
                        cached_contents: None,
                    };
                    let token = self.handles.allocate_file_handle(handle);
                    reply.opened(token, 0);
                }
                Err(e) => reply.error(pos_errno(e)),
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = self.handles.with_file_handle(fh, |handle| {
            if handle.is_template {
                let contents = handle.cached_contents.as_deref().unwrap_or(&[]);
                let offset = offset as usize;
                if offset >= contents.len() {
                    return Err(0i32); // spec §4.E: EOF-signaling; zero-length read
                }
                let end = std::cmp::min(contents.len(), offset + size as usize);
                Ok(contents[offset..end].to_vec())
            } else {
                let fd = handle.fd.ok_or(libc::EBADF)?;
                let mut buf = vec![0u8; size as usize];
                let n = pread(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &mut buf, offset)
                    .map_err(pos_errno)?;
                buf.truncate(n);
                Ok(buf)
            }
        });

        match result {
            Ok(Ok(data)) => reply.data(&data),
            Ok(Err(0)) => reply.data(&[]),
            Ok(Err(e)) => reply.error(e),
            Err(_) => reply.error(libc::ENFILE),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = self.handles.with_file_handle(fh, |handle| {
            if handle.is_template {
                return Err(EPERM);
            }
            let fd = handle.fd.ok_or(libc::EBADF)?;
            pwrite(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, data, offset).map_err(pos_errno)
        });
        match result {
            Ok(Ok(n)) => reply.written(n as u32),
            Ok(Err(e)) => reply.error(e),
            Err(_) => reply.error(libc::ENFILE),
        }
    }

    /// spec §4.E: no-op for templates ("dup-and-close trick" otherwise).
    /// `flush` has no write-back obligation on a read-only overlay, so a
    /// plain success covers both branches here).
    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
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
        if let Ok(crate::handles::Handle::File(handle)) = self.handles.release_handle(fh) {
            if let Some(fd) = handle.fd {
                let _ = nix::unistd::close(unsafe { std::os::fd::OwnedFd::from_raw_fd(fd) });
            }
            let mut rendered_len = self.rendered_len.write().unwrap();
            if let Some(by_token) = rendered_len.get_mut(&handle.virtual_path) {
                by_token.remove(&fh);
                if by_token.is_empty() {
                    rendered_len.remove(&handle.virtual_path);
                }
            }
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let result = self.handles.with_file_handle(fh, |handle| {
            if handle.is_template {
                return Ok(());
            }
            let fd = handle.fd.ok_or(libc::EBADF)?;
            let result = if datasync {
                unsafe { libc::fdatasync(fd) }
            } else {
                unsafe { libc::fsync(fd) }
            };
            if result == -1 {
                Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
            } else {
                Ok(())
            }
        });
        match result {
            Ok(Ok(())) => reply.ok(),
            Ok(Err(e)) => reply.error(e),
            Err(_) => reply.error(libc::ENFILE),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        let dir = if vpath == "/" {
            self.mount.dup_dir_fd().and_then(|fd| Dir::from_fd(std::os::fd::IntoRawFd::into_raw_fd(fd)))
        } else {
            let rel = relative(&vpath).to_string();
            Dir::openat(self.mount.dir_fd(), rel.as_str(), OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
        };

        match dir {
            Ok(stream) => {
                let handle = DirHandle::new(stream);
                let token = self.handles.allocate_dir_handle(handle);
                reply.opened(token, 0);
            }
            Err(e) => reply.error(pos_errno(e)),
        }
    }

    /// spec §4.E: "keeps the directory stream's offset in the handle;
    /// when the kernel-supplied offset diverges, seekdir to it." The
    /// underlying `nix::dir::Dir` stream has no safe `seekdir`/`telldir`,
    /// so [`DirHandle::entry_at`] serves the kernel's offset as a direct
    /// index into a cache it extends lazily from the live stream, one
    /// entry at a time, stopping as soon as `reply.add` signals the
    /// buffer is full rather than draining the whole directory up front.
    fn readdir(&mut self, _req: &Request, ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        let mut idx = offset.max(0) as usize;
        loop {
            let entry = match self.handles.with_dir_handle_mut(fh, |handle| handle.entry_at(idx, dir_entry_type)) {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(_) => return reply.error(ENOTDIR),
            };
            let (name, kind) = entry;
            let child = InodeTable::child_path(&vpath, &name);
            let child_ino = if name == "." || name == ".." {
                ino
            } else {
                self.inodes.intern(&child)
            };
            idx += 1;
            if reply.add(child_ino, idx as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        let _ = self.handles.release_handle(fh);
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match nix::sys::statvfs::statvfs(self.mount.path()) {
            Ok(st) => reply.statfs(
                st.blocks(),
                st.blocks_free(),
                st.blocks_available(),
                st.files(),
                st.files_free(),
                st.block_size() as u32,
                st.name_max() as u32,
                st.fragment_size() as u32,
            ),
            Err(e) => reply.error(pos_errno(e)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let abs = self.mount.absolute(&vpath);
        let path_c = match CString::new(abs.as_os_str().as_encoded_bytes()) {
            Ok(c) => c,
            Err(_) => return reply.error(EINVAL),
        };
        let name_c = match CString::new(name.as_encoded_bytes()) {
            Ok(c) => c,
            Err(_) => return reply.error(EINVAL),
        };
        let r = unsafe {
            libc::setxattr(
                path_c.as_ptr(),
                name_c.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                flags,
            )
        };
        if r == -1 {
            reply.error(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        } else {
            reply.ok();
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let abs = self.mount.absolute(&vpath);
        let path_c = match CString::new(abs.as_os_str().as_encoded_bytes()) {
            Ok(c) => c,
            Err(_) => return reply.error(EINVAL),
        };
        let name_c = match CString::new(name.as_encoded_bytes()) {
            Ok(c) => c,
            Err(_) => return reply.error(EINVAL),
        };
        let needed =
            unsafe { libc::getxattr(path_c.as_ptr(), name_c.as_ptr(), std::ptr::null_mut(), 0) };
        if needed == -1 {
            return reply.error(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }
        if size == 0 {
            return reply.size(needed as u32);
        }
        if needed as u32 > size {
            return reply.error(libc::ERANGE);
        }
        let mut buf = vec![0u8; needed as usize];
        let r = unsafe {
            libc::getxattr(path_c.as_ptr(), name_c.as_ptr(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if r == -1 {
            reply.error(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        } else {
            reply.data(&buf);
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let abs = self.mount.absolute(&vpath);
        let path_c = match CString::new(abs.as_os_str().as_encoded_bytes()) {
            Ok(c) => c,
            Err(_) => return reply.error(EINVAL),
        };
        let needed = unsafe { libc::listxattr(path_c.as_ptr(), std::ptr::null_mut(), 0) };
        if needed == -1 {
            return reply.error(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        }
        if size == 0 {
            return reply.size(needed as u32);
        }
        if needed as u32 > size {
            return reply.error(libc::ERANGE);
        }
        let mut buf = vec![0u8; needed as usize];
        let r = unsafe { libc::listxattr(path_c.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if r == -1 {
            reply.error(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        } else {
            reply.data(&buf);
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let abs = self.mount.absolute(&vpath);
        let path_c = match CString::new(abs.as_os_str().as_encoded_bytes()) {
            Ok(c) => c,
            Err(_) => return reply.error(EINVAL),
        };
        let name_c = match CString::new(name.as_encoded_bytes()) {
            Ok(c) => c,
            Err(_) => return reply.error(EINVAL),
        };
        let r = unsafe { libc::removexattr(path_c.as_ptr(), name_c.as_ptr()) };
        if r == -1 {
            reply.error(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        } else {
            reply.ok();
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let vpath = match self.vpath(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let flags = AccessFlags::from_bits_truncate(mask);
        match faccessat(Some(self.mount.dir_fd()), empty_as_dot(relative(&vpath)), flags, AtFlags::empty()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(pos_errno(e)),
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
        let parent_path = match self.vpath(parent) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let child = InodeTable::child_path(&parent_path, &osstr_to_string(name));
        let oflag = OFlag::from_bits_truncate(flags) | OFlag::O_CREAT;
        match openat(Some(self.mount.dir_fd()), relative(&child), oflag, Mode::from_bits_truncate(mode)) {
            Ok(fd) => match self.resolve_attr(&child) {
                Ok(mut attr) => {
                    attr.ino = self.inodes.intern(&child);
                    let handle = FileHandle {
                        virtual_path: child,
                        fd: Some(std::os::fd::IntoRawFd::into_raw_fd(fd)),
                        is_template: false,
                        is_executable_template: false,
                        cached_contents: None,
                    };
                    let token = self.handles.allocate_file_handle(handle);
                    reply.created(&TTL, &attr, 0, token, 0);
                }
                Err(e) => reply.error(e),
            },
            Err(e) => reply.error(pos_errno(e)),
        }
    }

    fn getlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let result = self.handles.with_file_handle(fh, |handle| handle.fd);
        let fd = match result {
            Ok(Some(fd)) => fd,
            _ => return reply.error(libc::ENFILE),
        };
        let mut lock = libc::flock {
            l_type: typ as i16,
            l_whence: libc::SEEK_SET as i16,
            l_start: start as i64,
            l_len: (end.saturating_sub(start)) as i64,
            l_pid: pid as i32,
        };
        let r = unsafe { libc::fcntl(fd, libc::F_GETLK, &mut lock) };
        if r == -1 {
            reply.error(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        } else {
            let _ = lock_owner;
            reply.locked(start, end, lock.l_type as i32, lock.l_pid as u32);
        }
    }

    fn setlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        let result = self.handles.with_file_handle(fh, |handle| handle.fd);
        let fd = match result {
            Ok(Some(fd)) => fd,
            _ => return reply.error(libc::ENFILE),
        };
        let lock = libc::flock {
            l_type: typ as i16,
            l_whence: libc::SEEK_SET as i16,
            l_start: start as i64,
            l_len: (end.saturating_sub(start)) as i64,
            l_pid: pid as i32,
        };
        let cmd = if sleep { libc::F_SETLKW } else { libc::F_SETLK };
        let r = unsafe { libc::fcntl(fd, cmd, &lock) };
        if r == -1 {
            reply.error(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        } else {
            reply.ok();
        }
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let result = self.handles.with_file_handle(fh, |handle| {
            if handle.is_template {
                return Err(EPERM);
            }
            let fd = handle.fd.ok_or(libc::EBADF)?;
            let r = unsafe { libc::fallocate(fd, mode, offset, length) };
            if r == -1 {
                Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
            } else {
                Ok(())
            }
        });
        match result {
            Ok(Ok(())) => reply.ok(),
            Ok(Err(e)) => reply.error(e),
            Err(_) => reply.error(libc::ENFILE),
        }
    }

    /// spec §4.E: not seekable through a template handle (`ENFILE`);
    /// pass-through `lseek` for the lower tree.
    fn lseek(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, offset: i64, whence: i32, reply: ReplyLseek) {
        let result = self.handles.with_file_handle(fh, |handle| {
            if handle.is_template {
                return Err(libc::ENFILE);
            }
            let fd = handle.fd.ok_or(libc::EBADF)?;
            let r = unsafe { libc::lseek(fd, offset, whence) };
            if r == -1 {
                Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
            } else {
                Ok(r)
            }
        });
        match result {
            Ok(Ok(pos)) => reply.offset(pos),
            Ok(Err(e)) => reply.error(e),
            Err(_) => reply.error(libc::ENFILE),
        }
    }

    /// spec §4.E: unconditional pass-through to the mount anchor via the
    /// handle's descriptor (`flock` operates on an open fd, not a path).
    fn flock(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, op: i32, reply: ReplyEmpty) {
        let fd = match self.handles.with_file_handle(fh, |h| h.fd) {
            Ok(Some(fd)) => fd,
            _ => return reply.error(libc::ENFILE),
        };
        let r = unsafe { libc::flock(fd, op) };
        if r == -1 {
            reply.error(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        } else {
            reply.ok();
        }
    }

    fn copy_file_range(
        &mut self,
        _req: &Request<'_>,
        _ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        _ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        flags: u32,
        reply: ReplyWrite,
    ) {
        let fd_in = match self.handles.with_file_handle(fh_in, |h| h.fd) {
            Ok(Some(fd)) => fd,
            _ => return reply.error(libc::ENFILE),
        };
        let fd_out = match self.handles.with_file_handle(fh_out, |h| h.fd) {
            Ok(Some(fd)) => fd,
            _ => return reply.error(libc::ENFILE),
        };
        let mut off_in = offset_in;
        let mut off_out = offset_out;
        let r = unsafe {
            libc::copy_file_range(fd_in, &mut off_in, fd_out, &mut off_out, len as usize, flags as u32)
        };
        if r == -1 {
            reply.error(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
        } else {
            reply.written(r as u32);
        }
    }
}

fn dir_entry_type(kind: nix::dir::Type) -> FileType {
    match kind {
        nix::dir::Type::Directory => FileType::Directory,
        nix::dir::Type::Symlink => FileType::Symlink,
        nix::dir::Type::CharacterDevice => FileType::CharDevice,
        nix::dir::Type::BlockDevice => FileType::BlockDevice,
        nix::dir::Type::Fifo => FileType::NamedPipe,
        nix::dir::Type::Socket => FileType::Socket,
        nix::dir::Type::File => FileType::RegularFile,
    }
}
