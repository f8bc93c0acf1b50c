//! Stat blocks and the `*at` syscall wrappers that fill them.

use std::ffi::{CStr, OsString};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStringExt;

use crate::FileKind;

/// Seconds/nanoseconds pair as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }
}

/// Bitmask of which [`Stat`] fields hold real data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatFields(u32);

impl StatFields {
    pub const EMPTY: Self = Self(0);
    pub const TYPE: Self = Self(1 << 0);
    pub const DEV: Self = Self(1 << 1);
    pub const INO: Self = Self(1 << 2);
    pub const MODE: Self = Self(1 << 3);
    pub const NLINK: Self = Self(1 << 4);
    pub const UID: Self = Self(1 << 5);
    pub const GID: Self = Self(1 << 6);
    pub const RDEV: Self = Self(1 << 7);
    pub const SIZE: Self = Self(1 << 8);
    pub const BLOCKS: Self = Self(1 << 9);
    pub const ATIME: Self = Self(1 << 10);
    pub const CTIME: Self = Self(1 << 11);
    pub const MTIME: Self = Self(1 << 12);
    pub const BTIME: Self = Self(1 << 13);

    /// Everything `fstatat` fills in one call.
    pub const BASIC: Self = Self((1 << 13) - 1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for StatFields {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// A materialized stat block.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    pub fields: StatFields,
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub mtime: Timespec,
    pub btime: Option<Timespec>,
}

impl Stat {
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    /// Permission bits plus setuid/setgid/sticky.
    pub fn perms(&self) -> u32 {
        self.mode & 0o7777
    }
}

impl From<libc::stat> for Stat {
    fn from(st: libc::stat) -> Self {
        Self {
            fields: StatFields::BASIC,
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u64,
            uid: st.st_uid,
            gid: st.st_gid,
            rdev: st.st_rdev as u64,
            size: st.st_size as u64,
            blocks: st.st_blocks as u64,
            atime: Timespec::new(st.st_atime as i64, st.st_atime_nsec as i64),
            ctime: Timespec::new(st.st_ctime as i64, st.st_ctime_nsec as i64),
            mtime: Timespec::new(st.st_mtime as i64, st.st_mtime_nsec as i64),
            btime: None,
        }
    }
}

fn at_fd(dirfd: Option<RawFd>) -> RawFd {
    dirfd.unwrap_or(libc::AT_FDCWD)
}

/// `fstatat` relative to an open directory (or the cwd).
pub fn stat_at(dirfd: Option<RawFd>, path: &CStr, follow: bool) -> io::Result<Stat> {
    let flags = if follow { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
    let mut st = MaybeUninit::<libc::stat>::uninit();
    let ret = unsafe { libc::fstatat(at_fd(dirfd), path.as_ptr(), st.as_mut_ptr(), flags) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Stat::from(unsafe { st.assume_init() }))
}

/// Fetch the birth time via `statx`. Filesystems that do not record one make
/// this fail with `ENODATA`.
#[cfg(target_os = "linux")]
pub fn btime_at(dirfd: Option<RawFd>, path: &CStr, follow: bool) -> io::Result<Timespec> {
    let mut flags = libc::AT_STATX_DONT_SYNC;
    if !follow {
        flags |= libc::AT_SYMLINK_NOFOLLOW;
    }
    let mut stx = MaybeUninit::<libc::statx>::uninit();
    let ret = unsafe {
        libc::statx(
            at_fd(dirfd),
            path.as_ptr(),
            flags,
            libc::STATX_BTIME,
            stx.as_mut_ptr(),
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    let stx = unsafe { stx.assume_init() };
    if stx.stx_mask & libc::STATX_BTIME == 0 {
        return Err(io::Error::from_raw_os_error(libc::ENODATA));
    }
    Ok(Timespec::new(
        stx.stx_btime.tv_sec,
        stx.stx_btime.tv_nsec as i64,
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn btime_at(_dirfd: Option<RawFd>, _path: &CStr, _follow: bool) -> io::Result<Timespec> {
    Err(io::Error::from_raw_os_error(libc::ENOTSUP))
}

/// `readlinkat` into an owned buffer.
pub fn readlink_at(dirfd: Option<RawFd>, path: &CStr) -> io::Result<OsString> {
    let mut buf = vec![0u8; 4096];
    loop {
        let len = unsafe {
            libc::readlinkat(
                at_fd(dirfd),
                path.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
            )
        };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        let len = len as usize;
        if len < buf.len() {
            buf.truncate(len);
            return Ok(OsString::from_vec(buf));
        }
        buf.resize(buf.len() * 2, 0);
    }
}

/// `faccessat` with effective ids, for the readable/writable/executable tests.
pub fn access_at(dirfd: Option<RawFd>, path: &CStr, mode: i32) -> bool {
    unsafe { libc::faccessat(at_fd(dirfd), path.as_ptr(), mode, libc::AT_EACCESS) == 0 }
}
