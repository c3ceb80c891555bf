//! Tree anchors (spec §3 `TreeAnchor`, §4.A): the mount root and the
//! template root, each resolved once at startup to a canonical absolute
//! path plus an open directory descriptor used as the base of every
//! `*at`-style resolution this daemon performs afterward.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::unistd;

use crate::error::TemplateFsError;

/// One resolved tree root. Two of these exist for the lifetime of a mount
/// (spec §3: "Two instances exist process-wide: mount and templates"),
/// shared read-only across every concurrent callback; nothing here is
/// mutated after `setup_tree` returns.
#[derive(Debug)]
pub struct TreeAnchor {
    path: PathBuf,
    dir: OwnedFd,
}

impl TreeAnchor {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir_fd(&self) -> RawFd {
        self.dir.as_raw_fd()
    }

    /// Duplicate the anchor descriptor for use as an independent directory
    /// stream (spec §4.A: "/" is special-cased in `opendir` by duplicating
    /// the anchor descriptor and rewinding it).
    pub fn dup_dir_fd(&self) -> nix::Result<OwnedFd> {
        unistd::dup(&self.dir)
    }

    pub fn absolute(&self, virtual_path: &str) -> PathBuf {
        self.path.join(virtual_path.trim_start_matches('/'))
    }
}

/// Strip the kernel-supplied leading `/` so the remainder can be used as
/// an `*at`-relative path off an anchor descriptor (spec §4.A).
pub fn relative(virtual_path: &str) -> &str {
    virtual_path.trim_start_matches('/')
}

/// `setup_tree(path)` (spec §4.A). Fails with `InvalidPath` if the path
/// does not resolve (canonicalize) or cannot be opened as a directory.
pub fn setup_tree(path: &Path) -> Result<TreeAnchor, TemplateFsError> {
    let canonical = path
        .canonicalize()
        .map_err(|_| TemplateFsError::InvalidPath(path.to_path_buf()))?;

    let dir = fcntl::open(&canonical, OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty())
        .map_err(|_| TemplateFsError::InvalidPath(path.to_path_buf()))?;

    Ok(TreeAnchor { path: canonical, dir })
}
