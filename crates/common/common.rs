//! Types shared across the walker and the expression engine: file kind tags,
//! the stat block, and thin `*at` syscall wrappers.

mod stat;

pub use stat::{Stat, StatFields, Timespec, access_at, btime_at, readlink_at, stat_at};

use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;

/// Directory entry type, from `d_type` or a stat mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Block,
    Char,
    Fifo,
    Socket,
    Door,
    Whiteout,
    Unknown,
    /// The entry could not be examined; the errno travels with the visit.
    Error,
}

/// glibc's whiteout entry type, absent from the libc crate on Linux.
const DT_WHITEOUT: u8 = 14;

impl FileKind {
    pub fn from_d_type(d_type: u8) -> Self {
        match d_type {
            libc::DT_REG => Self::Regular,
            libc::DT_DIR => Self::Directory,
            libc::DT_LNK => Self::Symlink,
            libc::DT_BLK => Self::Block,
            libc::DT_CHR => Self::Char,
            libc::DT_FIFO => Self::Fifo,
            libc::DT_SOCK => Self::Socket,
            DT_WHITEOUT => Self::Whiteout,
            _ => Self::Unknown,
        }
    }

    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFREG => Self::Regular,
            libc::S_IFDIR => Self::Directory,
            libc::S_IFLNK => Self::Symlink,
            libc::S_IFBLK => Self::Block,
            libc::S_IFCHR => Self::Char,
            libc::S_IFIFO => Self::Fifo,
            libc::S_IFSOCK => Self::Socket,
            _ => Self::Unknown,
        }
    }

    pub fn is_dir(self) -> bool {
        self == Self::Directory
    }

    /// One-letter tag matching `ls -l` / `find -printf %y`.
    pub fn letter(self) -> char {
        match self {
            Self::Regular => 'f',
            Self::Directory => 'd',
            Self::Symlink => 'l',
            Self::Block => 'b',
            Self::Char => 'c',
            Self::Fifo => 'p',
            Self::Socket => 's',
            Self::Door => 'D',
            Self::Whiteout => 'w',
            Self::Unknown | Self::Error => 'U',
        }
    }
}

/// One directory entry as returned by a directory read.
#[derive(Debug, Clone)]
pub struct Dirent {
    pub name: OsString,
    pub kind: FileKind,
    pub ino: u64,
}

/// Convert a path-like string for handing to a syscall.
pub fn to_cstring(s: &OsStr) -> io::Result<CString> {
    CString::new(s.as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}
