//! Per-open file-handle store (spec §3 `Handle`, §4.B). A tagged union of
//! `FileHandle` / `DirHandle`, stored behind an opaque `u64` token the
//! kernel treats as `fh` and hands back unchanged on every subsequent
//! call against that open. Lookup is typed: asking for a file handle by a
//! token that names a directory handle (or vice versa) is a "no handle"
//! condition, surfaced by the caller as `ENFILE`/`ENOTDIR` per spec §4.B.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use fuser::FileType;
use nix::dir::Dir;

/// spec §3 `FileHandle`.
pub struct FileHandle {
    pub virtual_path: String,
    /// The lower-tree fd, or the template fd when `is_template` (never
    /// both; spec §3: "If is_template is true, the lower-tree descriptor
    /// references the template file... if false, it references the
    /// lower-tree file").
    pub fd: Option<RawFd>,
    pub is_template: bool,
    pub is_executable_template: bool,
    pub cached_contents: Option<Vec<u8>>,
}

impl FileHandle {
    pub fn cache_len(&self) -> u64 {
        self.cached_contents.as_ref().map(|b| b.len() as u64).unwrap_or(0)
    }
}

/// spec §3 `DirHandle`. `nix::dir::Dir` exposes no safe `telldir`/`seekdir`
/// to reposition a live directory stream, so entries are pulled from it
/// lazily, one at a time, and kept forever in `entries` as they're read.
/// A `readdir` call's kernel-supplied offset is served as a plain index
/// into this growing cache: an offset already covered is answered
/// straight from `entries` (no re-read of the OS stream, so nothing is
/// lost or duplicated across a continuous run of calls), and an offset
/// past the end pulls exactly as many further entries from `stream` as
/// needed to reach it, never the whole remaining directory at once.
pub struct DirHandle {
    pub stream: Dir,
    entries: Vec<(String, FileType)>,
    exhausted: bool,
}

impl DirHandle {
    pub fn new(stream: Dir) -> Self {
        DirHandle {
            stream,
            entries: Vec::new(),
            exhausted: false,
        }
    }

    /// Returns the entry at `idx`, reading forward from the live stream
    /// only as far as needed to reach it. `None` once the stream has run
    /// out before `idx`.
    pub fn entry_at(&mut self, idx: usize, classify: impl Fn(nix::dir::Type) -> FileType) -> Option<(String, FileType)> {
        while self.entries.len() <= idx && !self.exhausted {
            match self.stream.iter().next() {
                Some(Ok(raw)) => {
                    let name = raw.file_name().to_string_lossy().into_owned();
                    let kind = raw.file_type().map(&classify).unwrap_or(FileType::RegularFile);
                    self.entries.push((name, kind));
                }
                _ => self.exhausted = true,
            }
        }
        self.entries.get(idx).cloned()
    }
}

pub enum Handle {
    File(FileHandle),
    Dir(DirHandle),
}

/// "no handle": the token is unset, or names a handle of the wrong
/// variant (spec §4.B).
#[derive(Debug)]
pub struct NoHandle;

#[derive(Default)]
pub struct HandleStore {
    next: AtomicU64,
    handles: RwLock<HashMap<u64, Handle>>,
}

impl HandleStore {
    pub fn new() -> Self {
        HandleStore {
            next: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    fn allocate(&self, handle: Handle) -> u64 {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        self.handles.write().unwrap().insert(token, handle);
        token
    }

    pub fn allocate_file_handle(&self, handle: FileHandle) -> u64 {
        self.allocate(Handle::File(handle))
    }

    pub fn allocate_dir_handle(&self, handle: DirHandle) -> u64 {
        self.allocate(Handle::Dir(handle))
    }

    pub fn with_file_handle<R>(&self, token: u64, f: impl FnOnce(&FileHandle) -> R) -> Result<R, NoHandle> {
        let handles = self.handles.read().unwrap();
        match handles.get(&token) {
            Some(Handle::File(h)) => Ok(f(h)),
            _ => Err(NoHandle),
        }
    }

    pub fn with_file_handle_mut<R>(&self, token: u64, f: impl FnOnce(&mut FileHandle) -> R) -> Result<R, NoHandle> {
        let mut handles = self.handles.write().unwrap();
        match handles.get_mut(&token) {
            Some(Handle::File(h)) => Ok(f(h)),
            _ => Err(NoHandle),
        }
    }

    pub fn with_dir_handle_mut<R>(&self, token: u64, f: impl FnOnce(&mut DirHandle) -> R) -> Result<R, NoHandle> {
        let mut handles = self.handles.write().unwrap();
        match handles.get_mut(&token) {
            Some(Handle::Dir(h)) => Ok(f(h)),
            _ => Err(NoHandle),
        }
    }

    /// `release_handle` (spec §4.B): frees the handle's own storage (and,
    /// for a `FileHandle`, its cached-contents buffer via `Drop`). Does
    /// *not* close descriptors; the operations-surface layer closes
    /// before calling this, per spec §4.B.
    pub fn release_handle(&self, token: u64) -> Result<Handle, NoHandle> {
        self.handles.write().unwrap().remove(&token).ok_or(NoHandle)
    }
}
