//! Bridges the kernel-facing virtual path namespace (spec §4.A: "Virtual
//! paths presented by the kernel begin with `/`") onto `fuser`'s
//! inode-numbered `Filesystem` trait, which, unlike the path-based FUSE
//! API the original daemon targets, hands every operation an inode
//! number, not a path. `lookup` is the only place a new inode is minted;
//! every other callback resolves its `ino` back to the virtual path it
//! was minted for. This table has no counterpart in spec §3; it exists
//! purely to adapt the path-based contract onto `fuser`'s ino-based one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

pub const ROOT_INO: u64 = 1;

#[derive(Default)]
pub struct InodeTable {
    next: AtomicU64,
    paths: RwLock<HashMap<u64, String>>,
    inodes: RwLock<HashMap<String, u64>>,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = InodeTable {
            next: AtomicU64::new(ROOT_INO + 1),
            paths: RwLock::new(HashMap::new()),
            inodes: RwLock::new(HashMap::new()),
        };
        table.paths.write().unwrap().insert(ROOT_INO, "/".to_string());
        table.inodes.write().unwrap().insert("/".to_string(), ROOT_INO);
        table
    }

    /// Returns the existing inode for `virtual_path` if one was already
    /// minted, else allocates a fresh one and remembers the mapping
    /// (spec's "lookup" is the only FUSE callback that manufactures new
    /// kernel-visible identity for a path).
    pub fn intern(&self, virtual_path: &str) -> u64 {
        if let Some(ino) = self.inodes.read().unwrap().get(virtual_path) {
            return *ino;
        }
        let mut inodes = self.inodes.write().unwrap();
        if let Some(ino) = inodes.get(virtual_path) {
            return *ino;
        }
        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        inodes.insert(virtual_path.to_string(), ino);
        self.paths.write().unwrap().insert(ino, virtual_path.to_string());
        ino
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.paths.read().unwrap().get(&ino).cloned()
    }

    pub fn child_path(parent: &str, name: &str) -> String {
        if parent == "/" {
            format!("/{name}")
        } else {
            format!("{parent}/{name}")
        }
    }

    /// `forget` never needs to invalidate an entry here: the mapping is a
    /// path<->ino cache and reusing an inode number for a path the kernel
    /// has forgotten is harmless (spec draws no distinction; there is no
    /// notion of an inode refcount in spec §3's data model, only a
    /// FUSE/`fuser` requirement we are bridging).
    pub fn forget(&self, _ino: u64, _nlookup: u64) {}
}
