//! The parsed command line and the evaluator's runtime context.

use std::io::{self, Write};
use std::path::PathBuf;

use bfs_common::Timespec;
use bfs_trie::QpTrie;
use bfs_walk::WalkOptions;
use chrono::{Local, TimeZone};

use crate::exec::{ExecSpec, ExecState};
use crate::pwcache::{Groups, Users};
use crate::{ExprArena, ExprId};

/// Which `-D` diagnostic channels are on.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugFlags {
    pub opt: bool,
    pub rates: bool,
    pub stat: bool,
    pub tree: bool,
    pub cost: bool,
    pub exec: bool,
    pub search: bool,
}

impl DebugFlags {
    /// Enable one named channel (or `all`). Unknown names are refused so
    /// the parser can warn about them.
    pub fn enable(&mut self, name: &str) -> bool {
        match name {
            "opt" => self.opt = true,
            "rates" => self.rates = true,
            "stat" => self.stat = true,
            "tree" => self.tree = true,
            "cost" => self.cost = true,
            "exec" => self.exec = true,
            "search" => self.search = true,
            "all" => {
                *self = DebugFlags {
                    opt: true,
                    rates: true,
                    stat: true,
                    tree: true,
                    cost: true,
                    exec: true,
                    search: true,
                };
            }
            _ => return false,
        }
        true
    }
}

/// One output destination (stdout or an `-fprint` file).
pub struct Sink {
    pub name: String,
    pub out: Box<dyn Write>,
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink").field("name", &self.name).finish()
    }
}

/// Everything the parser extracts from argv.
#[derive(Debug)]
pub struct Cmdline {
    pub arena: ExprArena,
    pub root: ExprId,
    /// The original argv tokens, for diagnostics and `-D tree` dumps.
    pub tokens: Vec<String>,
    pub paths: Vec<PathBuf>,
    pub walk: WalkOptions,
    pub opt_level: u8,
    pub debug: DebugFlags,
    pub warn: bool,
    /// `-X`: refuse to print names `xargs` would mangle.
    pub xargs_safe: bool,
    pub color: bool,
    /// Reference time for all age tests, captured once at parse.
    pub now: Timespec,
    /// `-daystart`: measure ages from local midnight rather than from now.
    pub daystart: bool,
    pub sinks: Vec<Sink>,
    pub execs: Vec<ExecSpec>,
    /// Device id (hex) to filesystem type, loaded if `-fstype` appears.
    pub mounts: Option<QpTrie<String>>,
}

impl Cmdline {
    /// Stdout is always sink 0.
    pub const STDOUT_SINK: usize = 0;
}

/// Mutable state threaded through every evaluation.
pub struct EvalCtx {
    // Copied configuration.
    pub post_order: bool,
    pub maxdepth: usize,
    pub follow_always: bool,
    pub now: Timespec,
    /// Epoch seconds of today's local midnight when `-daystart` is on.
    pub day_origin: Option<i64>,
    pub xargs_safe: bool,

    // Per-entry action results, read back by the traversal bridge.
    pub skip_subtree: bool,
    pub stop: bool,
    pub exit_code: Option<i32>,

    // Accumulated run state.
    pub errors: bool,
    pub sinks: Vec<Sink>,
    pub execs: Vec<ExecState>,
    pub users: Users,
    pub groups: Groups,
    pub mounts: Option<QpTrie<String>>,
    /// Paths already diagnosed, to keep one line per failing path.
    reported: QpTrie<()>,
}

impl EvalCtx {
    /// Split the runtime pieces out of a parsed command line.
    pub fn new(cmdline: &mut Cmdline) -> Self {
        Self {
            post_order: cmdline.walk.post_order,
            maxdepth: cmdline.walk.maxdepth,
            follow_always: cmdline.walk.follow == bfs_walk::Follow::Always,
            now: cmdline.now,
            day_origin: cmdline.daystart.then(today_origin),
            xargs_safe: cmdline.xargs_safe,
            skip_subtree: false,
            stop: false,
            exit_code: None,
            errors: false,
            sinks: std::mem::take(&mut cmdline.sinks),
            execs: cmdline
                .execs
                .drain(..)
                .map(ExecState::new)
                .collect(),
            users: Users::new(),
            groups: Groups::new(),
            mounts: cmdline.mounts.take(),
            reported: QpTrie::new(),
        }
    }

    /// Split borrows for the renderers, which need the sink and both id
    /// caches at once.
    pub fn render_parts(&mut self) -> (&mut Vec<Sink>, &mut Users, &mut Groups) {
        (&mut self.sinks, &mut self.users, &mut self.groups)
    }

    /// One diagnostic line per distinct failing path.
    pub fn report(&mut self, path: &std::path::Path, message: &str) {
        self.errors = true;
        let key = path.as_os_str().as_encoded_bytes();
        let key: Vec<u8> = key.iter().copied().filter(|&b| b != 0).collect();
        if self.reported.find_exact(&key).is_some() {
            return;
        }
        self.reported.insert(&key, ());
        eprintln!("bfs: {}: {}", path.display(), message);
    }

    pub fn report_errno(&mut self, path: &std::path::Path, errno: i32) {
        self.report(path, &io::Error::from_raw_os_error(errno).to_string());
    }

    /// Flush batched execs and buffered sinks once the walk is over.
    pub fn finish(&mut self) -> io::Result<()> {
        for exec in &mut self.execs {
            if let Err(e) = exec.flush() {
                self.errors = true;
                eprintln!("bfs: -exec: {e}");
            }
            if exec.failed {
                self.errors = true;
            }
        }
        for sink in &mut self.sinks {
            if let Err(e) = sink.out.flush() {
                self.errors = true;
                eprintln!("bfs: {}: {e}", sink.name);
            }
        }
        Ok(())
    }

    /// Exit code under the "max of reported categories" rule.
    pub fn exit_code(&self) -> i32 {
        if let Some(code) = self.exit_code {
            return code;
        }
        if self.errors { 1 } else { 0 }
    }
}

/// Epoch seconds of the most recent local midnight.
fn today_origin() -> i64 {
    let now = Local::now();
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time");
    match Local.from_local_datetime(&midnight) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => dt.timestamp(),
        chrono::LocalResult::None => now.timestamp() - now.timestamp() % 86_400,
    }
}

/// Load the mount table: device id (as a hex key) to filesystem type.
pub fn load_mounts() -> QpTrie<String> {
    let mut table = QpTrie::new();
    let Ok(mounts) = std::fs::read_to_string("/proc/self/mounts") else {
        return table;
    };
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_source), Some(target), Some(fstype)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let target = unescape_mount_path(target);
        let Ok(cpath) = bfs_common::to_cstring(std::ffi::OsStr::new(&target)) else {
            continue;
        };
        let Ok(stat) = bfs_common::stat_at(None, &cpath, true) else {
            continue;
        };
        table.insert(format!("{:x}", stat.dev).as_bytes(), fstype.to_string());
    }
    table
}

/// Look up the filesystem type for a device id.
pub fn fstype_of(mounts: &QpTrie<String>, dev: u64) -> Option<&str> {
    mounts
        .find_exact(format!("{dev:x}").as_bytes())
        .map(|leaf| mounts.value(leaf).as_str())
}

/// mtab escapes spaces and friends as octal (`\040`).
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                out.push(value as u8);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_channels_enable_individually() {
        let mut flags = DebugFlags::default();
        assert!(flags.enable("opt"));
        assert!(flags.opt && !flags.tree);
        assert!(flags.enable("all"));
        assert!(flags.tree && flags.search && flags.rates);
        assert!(!flags.enable("bogus"));
    }

    #[test]
    fn mount_path_unescaping() {
        assert_eq!(unescape_mount_path("/plain"), "/plain");
        assert_eq!(unescape_mount_path("/with\\040space"), "/with space");
        assert_eq!(unescape_mount_path("/trailing\\04"), "/trailing\\04");
    }

    #[test]
    fn day_origin_is_before_now_and_recent() {
        let origin = today_origin();
        let now = Local::now().timestamp();
        assert!(origin <= now);
        assert!(now - origin < 86_400 + 3_600 * 2);
    }

    #[test]
    fn mounts_table_resolves_the_root_device() {
        let table = load_mounts();
        if table.is_empty() {
            // No /proc here; nothing to check.
            return;
        }
        let cpath = bfs_common::to_cstring(std::ffi::OsStr::new("/")).unwrap();
        let stat = bfs_common::stat_at(None, &cpath, true).unwrap();
        assert!(fstype_of(&table, stat.dev).is_some());
    }
}
