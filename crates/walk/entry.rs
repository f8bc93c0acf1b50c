//! The visit record offered to the traversal consumer.

use std::ffi::OsString;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use bfs_common::{FileKind, Stat, Timespec, btime_at, stat_at, to_cstring};

/// Whether a directory is being offered before or after its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Pre,
    Post,
}

/// What the consumer wants done after a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    Continue,
    /// Do not descend into this directory.
    SkipSubtree,
    /// Do not offer the remaining siblings of this entry.
    SkipSiblings,
    /// Halt the traversal after draining in-flight I/O.
    Stop,
}

/// One filesystem entry as seen by the traversal.
///
/// The stat block is materialized on first demand, through the parent
/// directory's handle when one is still open. Both the link-following and
/// non-following variants are cached independently.
pub struct WalkEntry {
    path: PathBuf,
    name_off: usize,
    depth: usize,
    kind: FileKind,
    visit: Visit,
    error: Option<i32>,
    at_fd: Option<RawFd>,
    at_name: OsString,
    root_dev: Option<u64>,
    root_len: usize,
    follow: bool,
    stat_follow: Option<Result<Stat, i32>>,
    stat_nofollow: Option<Result<Stat, i32>>,
    btime: Option<Result<Timespec, i32>>,
}

impl WalkEntry {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        path: PathBuf,
        depth: usize,
        kind: FileKind,
        visit: Visit,
        at_fd: Option<RawFd>,
        at_name: OsString,
        root_dev: Option<u64>,
        root_len: usize,
        follow: bool,
    ) -> Self {
        let name_len = path.file_name().map_or(0, |n| n.len());
        let bytes = path.as_os_str().as_bytes();
        // Trailing slashes on roots sit after the final component.
        let trailing = bytes.iter().rev().take_while(|&&b| b == b'/').count();
        let name_off = if name_len == 0 {
            bytes.len()
        } else {
            bytes.len() - trailing - name_len
        };
        Self {
            path,
            name_off,
            depth,
            kind,
            visit,
            error: None,
            at_fd,
            at_name,
            root_dev,
            root_len,
            follow,
            stat_follow: None,
            stat_nofollow: None,
            btime: None,
        }
    }

    pub(crate) fn with_error(mut self, errno: i32) -> Self {
        self.kind = FileKind::Error;
        self.error = Some(errno);
        self
    }

    pub(crate) fn set_kind(&mut self, kind: FileKind) {
        self.kind = kind;
    }

    pub(crate) fn prime_stat(&mut self, follow: bool, stat: Stat) {
        if follow {
            self.stat_follow = Some(Ok(stat));
        } else {
            self.stat_nofollow = Some(Ok(stat));
        }
    }

    /// Full path to the entry.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final path component.
    pub fn name(&self) -> &std::ffi::OsStr {
        self.path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new(""))
    }

    /// Byte offset of the final component within `path`.
    pub fn name_offset(&self) -> usize {
        self.name_off
    }

    /// Depth below the traversal root; the root itself is 0.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The entry type as reported by the directory read (not resolved
    /// through symlinks; may be [`FileKind::Unknown`] on some filesystems).
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn visit(&self) -> Visit {
        self.visit
    }

    /// The errno of a failed visit, for [`FileKind::Error`] entries.
    pub fn error(&self) -> Option<i32> {
        self.error
    }

    /// Open handle on the parent directory, when one is still live.
    pub fn at_fd(&self) -> Option<RawFd> {
        self.at_fd
    }

    /// Name relative to [`WalkEntry::at_fd`] (the full path when no handle
    /// is available).
    pub fn at_name(&self) -> &std::ffi::OsStr {
        &self.at_name
    }

    /// Device of the traversal root that produced this entry.
    pub fn root_dev(&self) -> Option<u64> {
        self.root_dev
    }

    /// Byte length of the traversal root's path within [`WalkEntry::path`].
    pub fn root_len(&self) -> usize {
        self.root_len
    }

    /// Whether the symlink policy resolves this entry through links.
    pub fn follows(&self) -> bool {
        self.follow
    }

    /// The stat block under the active symlink policy. A broken link under a
    /// following policy falls back to the link itself, mirroring `find -L`.
    pub fn stat(&mut self) -> Result<&Stat, i32> {
        if self.follow {
            match self.stat_full(true) {
                Ok(_) => {}
                Err(errno) if errno == libc::ENOENT || errno == libc::ELOOP => {
                    return self.stat_full(false);
                }
                Err(errno) => return Err(errno),
            }
            self.stat_full(true)
        } else {
            self.stat_full(false)
        }
    }

    /// The stat block with an explicit follow choice.
    pub fn stat_with(&mut self, follow: bool) -> Result<&Stat, i32> {
        self.stat_full(follow)
    }

    fn stat_full(&mut self, follow: bool) -> Result<&Stat, i32> {
        let cache = if follow {
            &mut self.stat_follow
        } else {
            &mut self.stat_nofollow
        };
        if cache.is_none() {
            let result = to_cstring(&self.at_name)
                .map_err(|_| libc::EINVAL)
                .and_then(|cpath| {
                    stat_at(self.at_fd, &cpath, follow)
                        .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
                });
            *cache = Some(result);
        }
        match cache.as_ref().unwrap() {
            Ok(stat) => Ok(stat),
            Err(errno) => Err(*errno),
        }
    }

    /// Birth time, fetched separately since it needs `statx`.
    pub fn birth_time(&mut self) -> Result<Timespec, i32> {
        if self.btime.is_none() {
            let follow = self.follow;
            let result = to_cstring(&self.at_name)
                .map_err(|_| libc::EINVAL)
                .and_then(|cpath| {
                    btime_at(self.at_fd, &cpath, follow)
                        .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
                });
            self.btime = Some(result);
        }
        self.btime.unwrap()
    }

    /// The entry type resolved the way the stat policy sees it.
    pub fn resolved_kind(&mut self) -> FileKind {
        if self.follow || self.kind == FileKind::Unknown {
            match self.stat() {
                Ok(stat) => stat.kind(),
                Err(_) => self.kind,
            }
        } else {
            self.kind
        }
    }
}
