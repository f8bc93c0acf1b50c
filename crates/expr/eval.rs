//! Expression evaluation against visited entries.

use std::io::Write;
use std::os::unix::ffi::OsStrExt;

use bfs_common::{FileKind, Stat, Timespec, access_at, readlink_at, to_cstring};
use bfs_walk::{Visit, WalkAction, WalkEntry};

use crate::ctx::{Cmdline, EvalCtx, fstype_of};
use crate::printf::render_ls;
use crate::{
    Action, ExprArena, ExprId, ExprKind, PermCheck, PrintStyle, Test, TimeField, TimeUnit,
};

const DAY_SECONDS: i64 = 86_400;

/// The traversal consumer: pick the right visit, run the expression, and
/// translate the context's action fields back into a traversal action.
pub fn process_visit(
    arena: &ExprArena,
    root: ExprId,
    ctx: &mut EvalCtx,
    entry: &mut WalkEntry,
) -> WalkAction {
    if entry.kind() == FileKind::Error {
        if let Some(errno) = entry.error() {
            ctx.report_errno(entry.path(), errno);
        }
        return WalkAction::Continue;
    }

    // In post-order mode directories are evaluated on their post visit;
    // everything else acts on the pre visit.
    let acts_now = match entry.visit() {
        Visit::Post => true,
        Visit::Pre => !(ctx.post_order && will_revisit(ctx, entry)),
    };
    if !acts_now {
        return WalkAction::Continue;
    }

    ctx.skip_subtree = false;
    evaluate(arena, root, entry, ctx);
    if ctx.stop {
        WalkAction::Stop
    } else if ctx.skip_subtree {
        WalkAction::SkipSubtree
    } else {
        WalkAction::Continue
    }
}

/// Whether the engine will offer this entry again as a post visit.
fn will_revisit(ctx: &EvalCtx, entry: &mut WalkEntry) -> bool {
    match entry.kind() {
        FileKind::Directory => true,
        FileKind::Symlink if ctx.follow_always => entry.resolved_kind().is_dir(),
        FileKind::Unknown => entry.resolved_kind().is_dir(),
        _ => false,
    }
}

/// Evaluate a subtree for one entry.
pub fn evaluate(arena: &ExprArena, id: ExprId, entry: &mut WalkEntry, ctx: &mut EvalCtx) -> bool {
    match &arena.get(id).kind {
        ExprKind::True => true,
        ExprKind::False => false,
        ExprKind::Not(child) => !evaluate(arena, *child, entry, ctx),
        ExprKind::And(lhs, rhs) => {
            evaluate(arena, *lhs, entry, ctx) && evaluate(arena, *rhs, entry, ctx)
        }
        ExprKind::Or(lhs, rhs) => {
            evaluate(arena, *lhs, entry, ctx) || evaluate(arena, *rhs, entry, ctx)
        }
        ExprKind::Comma(lhs, rhs) => {
            evaluate(arena, *lhs, entry, ctx);
            evaluate(arena, *rhs, entry, ctx)
        }
        ExprKind::Test(test) => eval_test(test, entry, ctx),
        ExprKind::Action(action) => eval_action(action, entry, ctx),
    }
}

fn stat_or_report(entry: &mut WalkEntry, ctx: &mut EvalCtx) -> Option<Stat> {
    match entry.stat() {
        Ok(stat) => Some(*stat),
        Err(errno) => {
            ctx.report_errno(entry.path(), errno);
            None
        }
    }
}

fn field_time(
    entry: &mut WalkEntry,
    field: TimeField,
    ctx: &mut EvalCtx,
) -> Option<Timespec> {
    match field {
        TimeField::Birthed => match entry.birth_time() {
            Ok(ts) => Some(ts),
            Err(errno) => {
                ctx.report_errno(entry.path(), errno);
                None
            }
        },
        TimeField::Accessed => stat_or_report(entry, ctx).map(|s| s.atime),
        TimeField::Changed => stat_or_report(entry, ctx).map(|s| s.ctime),
        TimeField::Modified => stat_or_report(entry, ctx).map(|s| s.mtime),
    }
}

fn is_hidden(entry: &WalkEntry) -> bool {
    entry.name().as_bytes().first() == Some(&b'.') && entry.name().len() > 1
}

fn eval_test(test: &Test, entry: &mut WalkEntry, ctx: &mut EvalCtx) -> bool {
    match test {
        Test::Name { pattern } => pattern.matches(entry.name().as_bytes()),
        Test::PathGlob { pattern } | Test::PathRegex { pattern } => {
            pattern.matches(entry.path().as_os_str().as_bytes())
        }
        Test::Lname { pattern } => {
            if entry.kind() != FileKind::Symlink {
                return false;
            }
            let Ok(cpath) = to_cstring(entry.at_name()) else {
                return false;
            };
            match readlink_at(entry.at_fd(), &cpath) {
                Ok(target) => pattern.matches(target.as_bytes()),
                Err(_) => false,
            }
        }
        Test::Kind { mask } => mask.contains(entry.resolved_kind()),
        Test::LinkKind { mask } => {
            // The opposite of the active follow policy.
            if entry.follows() {
                match entry.stat_with(false) {
                    Ok(stat) => mask.contains(stat.kind()),
                    Err(_) => mask.contains(entry.kind()),
                }
            } else {
                match entry.stat_with(true) {
                    Ok(stat) => mask.contains(stat.kind()),
                    // A dangling link resolves to itself.
                    Err(errno) if errno == libc::ENOENT || errno == libc::ELOOP => {
                        mask.contains(FileKind::Symlink)
                    }
                    Err(errno) => {
                        ctx.report_errno(entry.path(), errno);
                        false
                    }
                }
            }
        }
        Test::Size { cmp, count, unit } => {
            let Some(stat) = stat_or_report(entry, ctx) else {
                return false;
            };
            cmp.matches(stat.size.div_ceil(*unit), *count)
        }
        Test::Empty => {
            let Some(stat) = stat_or_report(entry, ctx) else {
                return false;
            };
            match stat.kind() {
                FileKind::Regular => stat.size == 0,
                FileKind::Directory => match std::fs::read_dir(entry.path()) {
                    Ok(mut iter) => iter.next().is_none(),
                    Err(e) => {
                        let errno = e.raw_os_error().unwrap_or(libc::EIO);
                        ctx.report_errno(entry.path(), errno);
                        false
                    }
                },
                _ => false,
            }
        }
        Test::Sparse => {
            let Some(stat) = stat_or_report(entry, ctx) else {
                return false;
            };
            stat.blocks * 512 < stat.size
        }
        Test::InodeNum { cmp, value } => stat_or_report(entry, ctx)
            .map(|s| cmp.matches(s.ino, *value))
            .unwrap_or(false),
        Test::Links { cmp, value } => stat_or_report(entry, ctx)
            .map(|s| cmp.matches(s.nlink, *value))
            .unwrap_or(false),
        Test::Samefile { dev, ino } => stat_or_report(entry, ctx)
            .map(|s| s.dev == *dev && s.ino == *ino)
            .unwrap_or(false),
        Test::Uid { cmp, value } => stat_or_report(entry, ctx)
            .map(|s| cmp.matches(s.uid.into(), *value))
            .unwrap_or(false),
        Test::Gid { cmp, value } => stat_or_report(entry, ctx)
            .map(|s| cmp.matches(s.gid.into(), *value))
            .unwrap_or(false),
        Test::Nouser => {
            let Some(stat) = stat_or_report(entry, ctx) else {
                return false;
            };
            ctx.users.name_for(stat.uid).is_none()
        }
        Test::Nogroup => {
            let Some(stat) = stat_or_report(entry, ctx) else {
                return false;
            };
            ctx.groups.name_for(stat.gid).is_none()
        }
        Test::Perm { spec, check } => {
            let Some(stat) = stat_or_report(entry, ctx) else {
                return false;
            };
            let expected = spec.apply(0, stat.kind().is_dir());
            let perms = stat.perms();
            match check {
                PermCheck::Exact => perms == expected,
                PermCheck::All => perms & expected == expected,
                PermCheck::Any => expected == 0 || perms & expected != 0,
            }
        }
        Test::Age {
            field,
            unit,
            cmp,
            value,
        } => {
            let Some(ts) = field_time(entry, *field, ctx) else {
                return false;
            };
            let reference = match ctx.day_origin {
                Some(origin) => origin + DAY_SECONDS,
                None => ctx.now.sec,
            };
            let diff = (reference - ts.sec).max(0);
            let elapsed = match unit {
                TimeUnit::Days => diff / DAY_SECONDS,
                TimeUnit::Minutes => diff / 60,
            };
            cmp.matches(elapsed as u64, *value)
        }
        Test::Newer { field, reference } => field_time(entry, *field, ctx)
            .map(|ts| ts > *reference)
            .unwrap_or(false),
        Test::Used { cmp, value } => {
            let Some(stat) = stat_or_report(entry, ctx) else {
                return false;
            };
            let days = (stat.atime.sec - stat.ctime.sec).max(0) / DAY_SECONDS;
            cmp.matches(days as u64, *value)
        }
        Test::Hidden => is_hidden(entry),
        Test::Fstype { name } => {
            let Some(stat) = stat_or_report(entry, ctx) else {
                return false;
            };
            match ctx
                .mounts
                .as_ref()
                .map(|mounts| fstype_of(mounts, stat.dev) == Some(name.as_str()))
            {
                Some(matched) => matched,
                None => {
                    ctx.report(entry.path(), "mount table unavailable");
                    false
                }
            }
        }
        Test::Access { mode } => {
            let Ok(cpath) = to_cstring(entry.at_name()) else {
                return false;
            };
            access_at(entry.at_fd(), &cpath, *mode)
        }
    }
}

fn eval_action(action: &Action, entry: &mut WalkEntry, ctx: &mut EvalCtx) -> bool {
    match action {
        Action::Print { sink, style } => {
            let path = entry.path().as_os_str().as_bytes().to_vec();
            if ctx.xargs_safe
                && *style == PrintStyle::Plain
                && path.iter().any(|b| xargs_unsafe(*b))
            {
                ctx.report(entry.path(), "name is not safe for xargs; skipping");
                return true;
            }
            let rendered = match style {
                PrintStyle::Plain => {
                    let mut out = path;
                    out.push(b'\n');
                    out
                }
                PrintStyle::Nul => {
                    let mut out = path;
                    out.push(0);
                    out
                }
                PrintStyle::Escaped => {
                    let mut out = escape_path(&path);
                    out.push(b'\n');
                    out
                }
            };
            write_sink(ctx, *sink, &rendered);
            true
        }
        Action::Printf { sink, format } => {
            let result = {
                let (sinks, users, groups) = ctx.render_parts();
                format.render(entry, users, groups, &mut sinks[*sink].out)
            };
            if let Err(e) = result {
                sink_error(ctx, *sink, &e);
            }
            true
        }
        Action::Ls { sink } => {
            let now_sec = ctx.now.sec;
            let result = {
                let (sinks, users, groups) = ctx.render_parts();
                render_ls(entry, users, groups, now_sec, &mut sinks[*sink].out)
            };
            if let Err(e) = result {
                sink_error(ctx, *sink, &e);
            }
            true
        }
        Action::Delete => eval_delete(entry, ctx),
        Action::Prune => {
            ctx.skip_subtree = true;
            true
        }
        Action::Nohidden => {
            if is_hidden(entry) {
                ctx.skip_subtree = true;
                false
            } else {
                true
            }
        }
        Action::Quit { code } => {
            ctx.stop = true;
            if let Some(code) = code {
                ctx.exit_code = Some(*code);
            }
            true
        }
        Action::Exec { exec } => {
            match ctx.execs[*exec].run(entry.path(), entry.name_offset()) {
                Ok(result) => result,
                Err(e) => {
                    let message = e.to_string();
                    ctx.report(entry.path(), &message);
                    false
                }
            }
        }
    }
}

fn eval_delete(entry: &mut WalkEntry, ctx: &mut EvalCtx) -> bool {
    if entry.path().as_os_str() == "." {
        ctx.report(entry.path(), "refusing to delete '.'");
        return false;
    }
    // Never follow symlinks when deciding how to unlink.
    let is_dir = match entry.kind() {
        FileKind::Directory => true,
        FileKind::Unknown => entry
            .stat_with(false)
            .map(|s| s.kind().is_dir())
            .unwrap_or(false),
        _ => false,
    };
    let Ok(cpath) = to_cstring(entry.at_name()) else {
        return false;
    };
    let flags = if is_dir { libc::AT_REMOVEDIR } else { 0 };
    let dirfd = entry.at_fd().unwrap_or(libc::AT_FDCWD);
    let ret = unsafe { libc::unlinkat(dirfd, cpath.as_ptr(), flags) };
    if ret != 0 {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
        ctx.report_errno(entry.path(), errno);
        return false;
    }
    true
}

fn xargs_unsafe(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\'' | b'"' | b'\\')
}

fn escape_path(path: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(path.len());
    for &byte in path {
        match byte {
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b'\\' => out.extend_from_slice(b"\\\\"),
            b' ' => out.extend_from_slice(b"\\ "),
            _ => out.push(byte),
        }
    }
    out
}

fn write_sink(ctx: &mut EvalCtx, sink: usize, bytes: &[u8]) {
    if let Err(e) = ctx.sinks[sink].out.write_all(bytes) {
        sink_error(ctx, sink, &e);
    }
}

fn sink_error(ctx: &mut EvalCtx, sink: usize, error: &std::io::Error) {
    let name = ctx.sinks[sink].name.clone();
    ctx.errors = true;
    eprintln!("bfs: {name}: {error}");
}

/// Run the whole pipeline for a parsed command line and report the exit
/// code. This is the glue `main` calls.
pub fn run(mut cmdline: Cmdline) -> i32 {
    let mut ctx = EvalCtx::new(&mut cmdline);
    let arena = &cmdline.arena;
    let root = cmdline.root;
    let result = bfs_walk::walk(&cmdline.paths, &cmdline.walk, |entry| {
        process_visit(arena, root, &mut ctx, entry)
    });
    if let Err(e) = result {
        eprintln!("bfs: {e}");
        ctx.errors = true;
    }
    if ctx.finish().is_err() {
        ctx.errors = true;
    }
    ctx.exit_code()
}
