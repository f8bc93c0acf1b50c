//! `-printf` format strings and the `-ls` long listing.

use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;

use bfs_common::{FileKind, Stat, Timespec};
use bfs_walk::WalkEntry;
use chrono::{Local, TimeZone};

use crate::pwcache::{Groups, Users};

/// A compiled `-printf` format string.
#[derive(Debug, Clone)]
pub struct Format {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(Vec<u8>),
    Directive(Directive),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    Path,
    Name,
    Dirname,
    RootRelative,
    Size,
    Blocks,
    Depth,
    Device,
    Inode,
    Links,
    LinkTarget,
    PermsOctal,
    PermsString,
    UserName,
    GroupName,
    Uid,
    Gid,
    TypeLetter,
    ResolvedTypeLetter,
    AccessTime,
    ChangeTime,
    ModifyTime,
    BirthTime,
    AccessEpoch,
    ChangeEpoch,
    ModifyEpoch,
    BirthEpoch,
}

impl Format {
    /// Compile a format string. Unknown directives are copied verbatim and
    /// reported back as warnings.
    pub fn parse(source: &str) -> (Self, Vec<String>) {
        let bytes = source.as_bytes();
        let mut warnings = Vec::new();
        let mut segments = Vec::new();
        let mut literal = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' if i + 1 < bytes.len() => {
                    i += 1;
                    match bytes[i] {
                        b'n' => literal.push(b'\n'),
                        b't' => literal.push(b'\t'),
                        b'r' => literal.push(b'\r'),
                        b'a' => literal.push(0x07),
                        b'b' => literal.push(0x08),
                        b'f' => literal.push(0x0c),
                        b'v' => literal.push(0x0b),
                        b'\\' => literal.push(b'\\'),
                        b'0'..=b'7' => {
                            let mut value = 0u32;
                            let mut digits = 0;
                            while digits < 3 && i < bytes.len() && (b'0'..=b'7').contains(&bytes[i]) {
                                value = value * 8 + u32::from(bytes[i] - b'0');
                                digits += 1;
                                i += 1;
                            }
                            i -= 1;
                            literal.push(value as u8);
                        }
                        other => {
                            warnings.push(format!("unrecognized escape \\{}", other as char));
                            literal.push(b'\\');
                            literal.push(other);
                        }
                    }
                }
                b'%' if i + 1 < bytes.len() => {
                    i += 1;
                    let directive = match bytes[i] {
                        b'%' => {
                            literal.push(b'%');
                            None
                        }
                        b'p' => Some(Directive::Path),
                        b'f' => Some(Directive::Name),
                        b'h' => Some(Directive::Dirname),
                        b'P' => Some(Directive::RootRelative),
                        b's' => Some(Directive::Size),
                        b'b' => Some(Directive::Blocks),
                        b'd' => Some(Directive::Depth),
                        b'D' => Some(Directive::Device),
                        b'i' => Some(Directive::Inode),
                        b'n' => Some(Directive::Links),
                        b'l' => Some(Directive::LinkTarget),
                        b'm' => Some(Directive::PermsOctal),
                        b'M' => Some(Directive::PermsString),
                        b'u' => Some(Directive::UserName),
                        b'g' => Some(Directive::GroupName),
                        b'U' => Some(Directive::Uid),
                        b'G' => Some(Directive::Gid),
                        b'y' => Some(Directive::TypeLetter),
                        b'Y' => Some(Directive::ResolvedTypeLetter),
                        b'a' => Some(Directive::AccessTime),
                        b'c' => Some(Directive::ChangeTime),
                        b't' => Some(Directive::ModifyTime),
                        b'B' => Some(Directive::BirthTime),
                        b'A' | b'C' | b'T' if bytes.get(i + 1) == Some(&b'@') => {
                            let epoch = match bytes[i] {
                                b'A' => Directive::AccessEpoch,
                                b'C' => Directive::ChangeEpoch,
                                _ => Directive::ModifyEpoch,
                            };
                            i += 1;
                            Some(epoch)
                        }
                        other => {
                            warnings.push(format!("unrecognized directive %{}", other as char));
                            literal.push(b'%');
                            literal.push(other);
                            None
                        }
                    };
                    // %B@ rides on the plain %B followed by '@'.
                    let directive = if directive == Some(Directive::BirthTime)
                        && bytes.get(i + 1) == Some(&b'@')
                    {
                        i += 1;
                        Some(Directive::BirthEpoch)
                    } else {
                        directive
                    };
                    if let Some(directive) = directive {
                        if !literal.is_empty() {
                            segments.push(Segment::Literal(std::mem::take(&mut literal)));
                        }
                        segments.push(Segment::Directive(directive));
                    }
                }
                b => literal.push(b),
            }
            i += 1;
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        (Self { segments }, warnings)
    }

    pub fn render(
        &self,
        entry: &mut WalkEntry,
        users: &mut Users,
        groups: &mut Groups,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        for segment in &self.segments {
            match segment {
                Segment::Literal(bytes) => out.write_all(bytes)?,
                Segment::Directive(directive) => render_directive(*directive, entry, users, groups, out)?,
            }
        }
        Ok(())
    }
}

fn stat_of(entry: &mut WalkEntry) -> Option<Stat> {
    entry.stat().ok().copied()
}

fn render_directive(
    directive: Directive,
    entry: &mut WalkEntry,
    users: &mut Users,
    groups: &mut Groups,
    out: &mut dyn Write,
) -> io::Result<()> {
    use Directive::*;
    match directive {
        Path => out.write_all(entry.path().as_os_str().as_bytes()),
        Name => out.write_all(entry.name().as_bytes()),
        Dirname => out.write_all(&dirname(entry)),
        RootRelative => {
            let path = entry.path().as_os_str().as_bytes();
            let mut rest = &path[entry.root_len().min(path.len())..];
            if rest.first() == Some(&b'/') {
                rest = &rest[1..];
            }
            out.write_all(rest)
        }
        Depth => write!(out, "{}", entry.depth()),
        TypeLetter => write!(out, "{}", entry.kind().letter()),
        ResolvedTypeLetter => {
            let letter = match entry.stat_with(true) {
                Ok(stat) => stat.kind().letter(),
                Err(errno) if errno == libc::ELOOP => 'L',
                Err(errno) if errno == libc::ENOENT => 'N',
                Err(_) => '?',
            };
            write!(out, "{letter}")
        }
        LinkTarget => {
            if entry.kind() == FileKind::Symlink {
                if let Ok(target) = bfs_common::to_cstring(entry.at_name())
                    .and_then(|cpath| bfs_common::readlink_at(entry.at_fd(), &cpath))
                {
                    return out.write_all(target.as_bytes());
                }
            }
            Ok(())
        }
        BirthTime => match entry.birth_time() {
            Ok(ts) => out.write_all(long_date(ts).as_bytes()),
            Err(_) => out.write_all(b"?"),
        },
        BirthEpoch => match entry.birth_time() {
            Ok(ts) => write!(out, "{}.{:09}", ts.sec, ts.nsec),
            Err(_) => out.write_all(b"?"),
        },
        _ => {
            let Some(stat) = stat_of(entry) else {
                return out.write_all(b"?");
            };
            match directive {
                Size => write!(out, "{}", stat.size),
                Blocks => write!(out, "{}", stat.blocks),
                Device => write!(out, "{}", stat.dev),
                Inode => write!(out, "{}", stat.ino),
                Links => write!(out, "{}", stat.nlink),
                PermsOctal => write!(out, "{:o}", stat.perms()),
                PermsString => write!(out, "{}", mode_string(&stat)),
                UserName => match users.name_for(stat.uid) {
                    Some(name) => write!(out, "{name}"),
                    None => write!(out, "{}", stat.uid),
                },
                GroupName => match groups.name_for(stat.gid) {
                    Some(name) => write!(out, "{name}"),
                    None => write!(out, "{}", stat.gid),
                },
                Uid => write!(out, "{}", stat.uid),
                Gid => write!(out, "{}", stat.gid),
                AccessTime => out.write_all(long_date(stat.atime).as_bytes()),
                ChangeTime => out.write_all(long_date(stat.ctime).as_bytes()),
                ModifyTime => out.write_all(long_date(stat.mtime).as_bytes()),
                AccessEpoch => write!(out, "{}.{:09}", stat.atime.sec, stat.atime.nsec),
                ChangeEpoch => write!(out, "{}.{:09}", stat.ctime.sec, stat.ctime.nsec),
                ModifyEpoch => write!(out, "{}.{:09}", stat.mtime.sec, stat.mtime.nsec),
                _ => unreachable!("stat-free directive in stat branch"),
            }
        }
    }
}

fn dirname(entry: &WalkEntry) -> Vec<u8> {
    let path = entry.path().as_os_str().as_bytes();
    let off = entry.name_offset();
    if off == 0 {
        return path.to_vec();
    }
    let head = &path[..off - 1];
    if head.is_empty() {
        if path.first() == Some(&b'/') {
            b"/".to_vec()
        } else {
            b".".to_vec()
        }
    } else {
        head.to_vec()
    }
}

/// `ls -l`-style mode column.
pub fn mode_string(stat: &Stat) -> String {
    let kind = match stat.kind() {
        FileKind::Regular => '-',
        FileKind::Directory => 'd',
        FileKind::Symlink => 'l',
        FileKind::Block => 'b',
        FileKind::Char => 'c',
        FileKind::Fifo => 'p',
        FileKind::Socket => 's',
        FileKind::Door => 'D',
        FileKind::Whiteout => 'w',
        FileKind::Unknown | FileKind::Error => '?',
    };
    let mode = stat.mode;
    let mut s = String::with_capacity(10);
    s.push(kind);
    for (shift, special, special_char) in [
        (6, mode & 0o4000 != 0, 's'),
        (3, mode & 0o2000 != 0, 's'),
        (0, mode & 0o1000 != 0, 't'),
    ] {
        let bits = (mode >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        let x = bits & 0o1 != 0;
        s.push(match (x, special) {
            (true, false) => 'x',
            (false, false) => '-',
            (true, true) => special_char,
            (false, true) => special_char.to_ascii_uppercase(),
        });
    }
    s
}

fn long_date(ts: Timespec) -> String {
    match Local.timestamp_opt(ts.sec, ts.nsec.clamp(0, 999_999_999) as u32) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            dt.format("%a %b %e %H:%M:%S%.9f %Y").to_string()
        }
        chrono::LocalResult::None => format!("@{}", ts.sec),
    }
}

/// Short date for `-ls`: month/day/time for recent files, month/day/year
/// otherwise.
fn ls_date(ts: Timespec, now_sec: i64) -> String {
    const SIX_MONTHS: i64 = 60 * 60 * 24 * 183;
    match Local.timestamp_opt(ts.sec, 0) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            if (now_sec - ts.sec).abs() < SIX_MONTHS {
                dt.format("%b %e %H:%M").to_string()
            } else {
                dt.format("%b %e  %Y").to_string()
            }
        }
        chrono::LocalResult::None => format!("@{}", ts.sec),
    }
}

/// One `ls -dils`-shaped line.
pub fn render_ls(
    entry: &mut WalkEntry,
    users: &mut Users,
    groups: &mut Groups,
    now_sec: i64,
    out: &mut dyn Write,
) -> io::Result<()> {
    let Some(stat) = stat_of(entry) else {
        out.write_all(entry.path().as_os_str().as_bytes())?;
        return out.write_all(b"\n");
    };
    let user = users
        .name_for(stat.uid)
        .unwrap_or_else(|| stat.uid.to_string());
    let group = groups
        .name_for(stat.gid)
        .unwrap_or_else(|| stat.gid.to_string());
    write!(
        out,
        "{:>9} {:>6} {} {:>3} {:<8} {:<8} {:>8} {} ",
        stat.ino,
        stat.blocks.div_ceil(2),
        mode_string(&stat),
        stat.nlink,
        user,
        group,
        stat.size,
        ls_date(stat.mtime, now_sec),
    )?;
    out.write_all(entry.path().as_os_str().as_bytes())?;
    if entry.kind() == FileKind::Symlink {
        if let Ok(target) = bfs_common::to_cstring(entry.at_name())
            .and_then(|cpath| bfs_common::readlink_at(entry.at_fd(), &cpath))
        {
            out.write_all(b" -> ")?;
            out.write_all(target.as_bytes())?;
        }
    }
    out.write_all(b"\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_and_escapes_compile() {
        let (format, warnings) = Format::parse("a\\tb\\n%%\\060");
        assert!(warnings.is_empty());
        let Segment::Literal(bytes) = &format.segments[0] else {
            panic!("expected a literal segment");
        };
        assert_eq!(bytes, b"a\tb\n%0");
    }

    #[test]
    fn directives_split_segments() {
        let (format, warnings) = Format::parse("%p %s\\n");
        assert!(warnings.is_empty());
        assert_eq!(format.segments.len(), 4);
        assert!(matches!(
            format.segments[0],
            Segment::Directive(Directive::Path)
        ));
        assert!(matches!(
            format.segments[2],
            Segment::Directive(Directive::Size)
        ));
    }

    #[test]
    fn epoch_forms_require_the_at_sign() {
        let (format, warnings) = Format::parse("%T@");
        assert!(warnings.is_empty());
        assert!(matches!(
            format.segments[0],
            Segment::Directive(Directive::ModifyEpoch)
        ));

        let (_, warnings) = Format::parse("%TY");
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn unknown_directives_warn_and_pass_through() {
        let (format, warnings) = Format::parse("%q");
        assert_eq!(warnings.len(), 1);
        let Segment::Literal(bytes) = &format.segments[0] else {
            panic!("expected the directive to stay literal");
        };
        assert_eq!(bytes, b"%q");
    }

    #[test]
    fn mode_strings_cover_special_bits() {
        let mut stat = Stat {
            mode: libc::S_IFREG | 0o755,
            ..Default::default()
        };
        assert_eq!(mode_string(&stat), "-rwxr-xr-x");
        stat.mode = libc::S_IFDIR | 0o2770;
        assert_eq!(mode_string(&stat), "drwxrws---");
        stat.mode = libc::S_IFDIR | 0o1777;
        assert_eq!(mode_string(&stat), "drwxrwxrwt");
        stat.mode = libc::S_IFREG | 0o4600;
        assert_eq!(mode_string(&stat), "-rwS------");
    }
}
