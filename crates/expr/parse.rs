//! Recursive-descent parser for the `find`-compatible command line.
//!
//! Tokens are consumed from a pre-split argv. Leading non-flag tokens are
//! root paths; the rest is the expression grammar, with `,` binding loosest,
//! then `-o`, then (possibly implicit) `-a`, then `!`. Predicates are
//! resolved through an ordered dispatch table by exact match first and
//! longest prefix second, with a typo-distance suggestion on a miss.

use std::ffi::OsStr;
use std::fmt;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use bfs_common::Timespec;
use bfs_trie::QpTrie;
use bfs_walk::{Follow, Strategy};
use chrono::TimeZone;
use thiserror::Error;

use crate::ctx::{Cmdline, Sink, load_mounts};
use crate::exec::ExecSpec;
use crate::opt;
use crate::pattern::{Pattern, RegexFlavor};
use crate::printf::Format;
use crate::pwcache::{Groups, Users};
use crate::typo;
use crate::{
    Action, Cmp, ExprArena, ExprId, ExprKind, FAST_COST, PRINT_COST, PermCheck, PrintStyle,
    STAT_COST, Test, TimeField, TimeUnit, TypeMask,
};
use crate::{ModeSpec, SinkId};
use bfs_common::FileKind;

/// A parse failure plus the argv span it points at.
#[derive(Debug)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    /// Token range the diagnostic should highlight.
    pub span: (usize, usize),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

#[derive(Debug, Error)]
pub enum ParseErrorKind {
    #[error("unknown predicate {token}{}", .suggestion.as_ref().map(|s| format!("; did you mean {s}?")).unwrap_or_default())]
    Unknown {
        token: String,
        suggestion: Option<String>,
    },
    #[error("{predicate} needs a value")]
    MissingValue { predicate: String },
    #[error("{predicate}: bad integer {value:?}")]
    BadNumber { predicate: String, value: String },
    #[error("-size: bad size {value:?}")]
    BadSize { value: String },
    #[error("-perm: bad mode {value:?}")]
    BadMode { value: String },
    #[error("bad file type {value:?}")]
    BadType { value: String },
    #[error("bad timestamp {value:?}")]
    BadTime { value: String },
    #[error("bad regular expression: {0}")]
    BadRegex(#[from] regex::Error),
    #[error("unknown user {name:?}")]
    UnknownUser { name: String },
    #[error("unknown group {name:?}")]
    UnknownGroup { name: String },
    #[error("unknown regex type {name:?}")]
    UnknownRegexType { name: String },
    #[error("unknown search strategy {name:?}")]
    UnknownStrategy { name: String },
    #[error("expected ')'")]
    UnmatchedOpen,
    #[error("unexpected ')'")]
    UnmatchedClose,
    #[error("{operator} needs an expression after it")]
    MissingOperand { operator: String },
    #[error("expected an expression")]
    EmptyExpression,
    #[error("paths must come before the expression: {token}")]
    PathAfterExpression { token: String },
    #[error("{path}: {message}")]
    Reference { path: String, message: String },
    #[error("{path}: {message}")]
    OutputOpen { path: String, message: String },
    #[error("-exec: missing terminating ';' or '+'")]
    UnterminatedExec,
}

struct Parser<'a> {
    tokens: &'a [String],
    pos: usize,
    cmdline: Cmdline,
    /// A test, action, or operator has appeared: no more root paths.
    expr_begun: bool,
    /// A test or action (not an option) has been parsed already.
    predicate_seen: bool,
    has_action: bool,
    prune_seen: bool,
    regex_flavor: RegexFlavor,
    /// Output files deduplicated by device and inode.
    sink_keys: QpTrie<SinkId>,
    users: Users,
    groups: Groups,
}

type ParseFn = for<'a, 't> fn(&'a mut Parser<'t>, i32, i32) -> Result<ExprId, ParseError>;

struct TableEntry {
    name: &'static str,
    prefix: bool,
    parse: ParseFn,
    arg1: i32,
    arg2: i32,
}

macro_rules! entry {
    ($name:literal, $parse:ident) => {
        entry!($name, $parse, 0, 0)
    };
    ($name:literal, $parse:ident, $arg1:expr) => {
        entry!($name, $parse, $arg1, 0)
    };
    ($name:literal, $parse:ident, $arg1:expr, $arg2:expr) => {
        TableEntry {
            name: $name,
            prefix: false,
            parse: |p: &mut Parser<'_>, a1: i32, a2: i32| Parser::$parse(p, a1, a2),
            arg1: $arg1,
            arg2: $arg2,
        }
    };
}

macro_rules! prefix_entry {
    ($name:literal, $parse:ident) => {
        TableEntry {
            name: $name,
            prefix: true,
            parse: |p: &mut Parser<'_>, a1: i32, a2: i32| Parser::$parse(p, a1, a2),
            arg1: 0,
            arg2: 0,
        }
    };
}

// Comparison senses for integer predicates, passed through arg1/arg2.
const FIELD_ATIME: i32 = 0;
const FIELD_BTIME: i32 = 1;
const FIELD_CTIME: i32 = 2;
const FIELD_MTIME: i32 = 3;

static TABLE: &[TableEntry] = &[
    // Flags
    entry!("-P", parse_follow, 0),
    entry!("-H", parse_follow, 1),
    entry!("-L", parse_follow, 2),
    prefix_entry!("-O", parse_optlevel),
    entry!("-D", parse_debug),
    entry!("-E", parse_regex_extended),
    entry!("-X", parse_xargs_safe),
    entry!("-S", parse_strategy),
    entry!("-f", parse_root_flag),
    entry!("-s", parse_sort),
    // Positional options
    entry!("-daystart", parse_daystart),
    entry!("-follow", parse_follow, 2),
    entry!("-warn", parse_warn, 1),
    entry!("-nowarn", parse_warn, 0),
    entry!("-regextype", parse_regextype),
    entry!("-ignore_readdir_race", parse_races, 1),
    entry!("-noignore_readdir_race", parse_races, 0),
    // Global options
    entry!("-mindepth", parse_depth_limit, 0),
    entry!("-maxdepth", parse_depth_limit, 1),
    entry!("-mount", parse_xdev),
    entry!("-xdev", parse_xdev),
    entry!("-depth", parse_depth_order),
    entry!("-color", parse_color, 1),
    entry!("-nocolor", parse_color, 0),
    // Tests
    entry!("-true", parse_const, 1),
    entry!("-false", parse_const, 0),
    entry!("-name", parse_name, 0),
    entry!("-iname", parse_name, 1),
    entry!("-path", parse_path, 0),
    entry!("-wholename", parse_path, 0),
    entry!("-ipath", parse_path, 1),
    entry!("-iwholename", parse_path, 1),
    entry!("-lname", parse_lname, 0),
    entry!("-ilname", parse_lname, 1),
    entry!("-regex", parse_regex, 0),
    entry!("-iregex", parse_regex, 1),
    entry!("-type", parse_type, 0),
    entry!("-xtype", parse_type, 1),
    entry!("-size", parse_size),
    entry!("-empty", parse_empty),
    entry!("-sparse", parse_sparse),
    entry!("-inum", parse_inum),
    entry!("-links", parse_links),
    entry!("-samefile", parse_samefile),
    entry!("-uid", parse_uid),
    entry!("-gid", parse_gid),
    entry!("-user", parse_user),
    entry!("-group", parse_group),
    entry!("-nouser", parse_nouser),
    entry!("-nogroup", parse_nogroup),
    entry!("-perm", parse_perm),
    entry!("-amin", parse_age, FIELD_ATIME, 0),
    entry!("-cmin", parse_age, FIELD_CTIME, 0),
    entry!("-mmin", parse_age, FIELD_MTIME, 0),
    entry!("-Bmin", parse_age, FIELD_BTIME, 0),
    entry!("-atime", parse_age, FIELD_ATIME, 1),
    entry!("-ctime", parse_age, FIELD_CTIME, 1),
    entry!("-mtime", parse_age, FIELD_MTIME, 1),
    entry!("-Btime", parse_age, FIELD_BTIME, 1),
    entry!("-anewer", parse_newer_file, FIELD_ATIME),
    entry!("-cnewer", parse_newer_file, FIELD_CTIME),
    entry!("-mnewer", parse_newer_file, FIELD_MTIME),
    entry!("-Bnewer", parse_newer_file, FIELD_BTIME),
    prefix_entry!("-newer", parse_newer_xy),
    entry!("-used", parse_used),
    entry!("-hidden", parse_hidden),
    entry!("-fstype", parse_fstype),
    entry!("-executable", parse_access, libc::X_OK),
    entry!("-readable", parse_access, libc::R_OK),
    entry!("-writable", parse_access, libc::W_OK),
    // Actions
    entry!("-print", parse_print, 0),
    entry!("-print0", parse_print, 1),
    entry!("-printx", parse_print, 2),
    entry!("-printf", parse_printf, 0),
    entry!("-fprint", parse_fprint, 0),
    entry!("-fprint0", parse_fprint, 1),
    entry!("-fprintf", parse_printf, 1),
    entry!("-ls", parse_ls, 0),
    entry!("-fls", parse_ls, 1),
    entry!("-delete", parse_delete),
    entry!("-rm", parse_delete),
    entry!("-prune", parse_prune),
    entry!("-nohidden", parse_nohidden),
    entry!("-quit", parse_quit, 0),
    entry!("-exit", parse_quit, 1),
    entry!("-exec", parse_exec, 0, 0),
    entry!("-execdir", parse_exec, 1, 0),
    entry!("-ok", parse_exec, 0, 1),
    entry!("-okdir", parse_exec, 1, 1),
];

/// Parse a full command line (everything after the program name).
pub fn parse_cmdline(tokens: Vec<String>) -> Result<Cmdline, ParseError> {
    let now = now_timespec();
    let posixly_correct = std::env::var_os("POSIXLY_CORRECT").is_some();
    let stdout_sink = Sink {
        name: "standard output".to_string(),
        out: Box::new(std::io::BufWriter::new(std::io::stdout())),
    };

    let arena = ExprArena::new();
    let root = arena.true_id();
    let cmdline = Cmdline {
        arena,
        root,
        tokens: tokens.clone(),
        paths: Vec::new(),
        walk: Default::default(),
        opt_level: 3,
        debug: Default::default(),
        warn: !posixly_correct,
        xargs_safe: false,
        color: std::env::var_os("NO_COLOR").is_none(),
        now,
        daystart: false,
        sinks: vec![stdout_sink],
        execs: Vec::new(),
        mounts: None,
    };

    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        cmdline,
        expr_begun: false,
        predicate_seen: false,
        has_action: false,
        prune_seen: false,
        regex_flavor: RegexFlavor::default(),
        sink_keys: QpTrie::new(),
        users: Users::new(),
        groups: Groups::new(),
    };

    parser.collect_roots();
    let mut root = if parser.pos < parser.tokens.len() {
        parser.parse_expr()?
    } else {
        parser.cmdline.arena.true_id()
    };
    if let Some(extra) = parser.peek() {
        let err = if extra == ")" {
            ParseErrorKind::UnmatchedClose
        } else {
            ParseErrorKind::PathAfterExpression {
                token: extra.to_string(),
            }
        };
        return Err(parser.error_here(err));
    }

    if !parser.has_action {
        let print = parser.print_leaf(Cmdline::STDOUT_SINK, PrintStyle::Plain, (0, 0));
        let level = parser.cmdline.opt_level;
        root = opt::new_and(&mut parser.cmdline.arena, root, print, (0, 0), level);
    }

    if parser.prune_seen && parser.cmdline.walk.post_order && parser.cmdline.warn {
        eprintln!("bfs: warning: -prune has no effect with -depth");
    }

    let mut cmdline = parser.cmdline;
    if cmdline.paths.is_empty() {
        cmdline.paths.push(PathBuf::from("."));
    }
    cmdline.root = opt::optimize(
        &mut cmdline.arena,
        root,
        cmdline.opt_level,
        cmdline.debug.opt,
        &cmdline.tokens,
    );
    Ok(cmdline)
}

impl<'a> Parser<'a> {
    /// Absorb root paths. Paths may keep appearing between flags and
    /// options, but the first test, action, or operator ends collection.
    fn collect_roots(&mut self) {
        if self.expr_begun {
            return;
        }
        while let Some(token) = self.peek() {
            let expression_token = matches!(token, "(" | ")" | "!" | ",")
                || (token.len() > 1 && token.starts_with('-'));
            if expression_token {
                break;
            }
            self.cmdline.paths.push(PathBuf::from(token));
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(|s| s.as_str())
    }

    fn next_token(&mut self) -> Option<&'a str> {
        let token = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(token.as_str())
    }

    /// The value token for a unary predicate like `-name`.
    fn value_for(&mut self, predicate: &str) -> Result<&'a str, ParseError> {
        self.next_token().ok_or_else(|| ParseError {
            kind: ParseErrorKind::MissingValue {
                predicate: predicate.to_string(),
            },
            span: (self.pos - 1, self.pos),
        })
    }

    fn error_here(&self, kind: ParseErrorKind) -> ParseError {
        ParseError {
            kind,
            span: (self.pos, (self.pos + 1).min(self.tokens.len().max(1))),
        }
    }

    fn error_at(&self, kind: ParseErrorKind, start: usize) -> ParseError {
        ParseError {
            kind,
            span: (start, self.pos.max(start + 1)),
        }
    }

    fn warn_user(&self, message: &str) {
        if self.cmdline.warn {
            eprintln!("bfs: warning: {message}");
        }
    }

    // Grammar

    fn parse_expr(&mut self) -> Result<ExprId, ParseError> {
        let mut lhs = self.parse_clause()?;
        while self.peek() == Some(",") {
            let start = self.pos;
            self.pos += 1;
            if self.peek().is_none() {
                return Err(self.error_at(
                    ParseErrorKind::MissingOperand {
                        operator: ",".to_string(),
                    },
                    start,
                ));
            }
            let rhs = self.parse_clause()?;
            let level = self.cmdline.opt_level;
            lhs = opt::new_comma(&mut self.cmdline.arena, lhs, rhs, (start, self.pos), level);
        }
        Ok(lhs)
    }

    fn parse_clause(&mut self) -> Result<ExprId, ParseError> {
        let mut lhs = self.parse_term()?;
        while matches!(self.peek(), Some("-o") | Some("-or")) {
            let start = self.pos;
            let operator = self.next_token().unwrap().to_string();
            if self.peek().is_none() {
                return Err(self.error_at(ParseErrorKind::MissingOperand { operator }, start));
            }
            let rhs = self.parse_term()?;
            let level = self.cmdline.opt_level;
            lhs = opt::new_or(&mut self.cmdline.arena, lhs, rhs, (start, self.pos), level);
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<ExprId, ParseError> {
        self.collect_roots();
        let mut lhs = self.parse_factor()?;
        loop {
            self.collect_roots();
            match self.peek() {
                None | Some(")") | Some(",") | Some("-o") | Some("-or") => return Ok(lhs),
                Some("-a") | Some("-and") => {
                    let start = self.pos;
                    let operator = self.next_token().unwrap().to_string();
                    if self.peek().is_none() {
                        return Err(
                            self.error_at(ParseErrorKind::MissingOperand { operator }, start)
                        );
                    }
                    let rhs = self.parse_factor()?;
                    let level = self.cmdline.opt_level;
                    lhs = opt::new_and(&mut self.cmdline.arena, lhs, rhs, (start, self.pos), level);
                }
                Some(_) => {
                    let start = self.pos;
                    let rhs = self.parse_factor()?;
                    let level = self.cmdline.opt_level;
                    lhs = opt::new_and(&mut self.cmdline.arena, lhs, rhs, (start, self.pos), level);
                }
            }
        }
    }

    fn parse_factor(&mut self) -> Result<ExprId, ParseError> {
        match self.peek() {
            None => Err(self.error_here(ParseErrorKind::EmptyExpression)),
            Some("(") => {
                let start = self.pos;
                self.expr_begun = true;
                self.pos += 1;
                let inner = self.parse_expr()?;
                if self.peek() != Some(")") {
                    return Err(self.error_at(ParseErrorKind::UnmatchedOpen, start));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(")") => Err(self.error_here(ParseErrorKind::UnmatchedClose)),
            Some("!") | Some("-not") => {
                let start = self.pos;
                self.expr_begun = true;
                self.pos += 1;
                if self.peek().is_none() {
                    return Err(self.error_at(
                        ParseErrorKind::MissingOperand {
                            operator: "!".to_string(),
                        },
                        start,
                    ));
                }
                let child = self.parse_factor()?;
                let level = self.cmdline.opt_level;
                Ok(opt::new_not(
                    &mut self.cmdline.arena,
                    child,
                    (start, self.pos),
                    level,
                ))
            }
            Some(_) => self.parse_literal(),
        }
    }

    fn parse_literal(&mut self) -> Result<ExprId, ParseError> {
        let token = self
            .peek()
            .expect("caller checked for a token")
            .to_string();
        if !token.starts_with('-') {
            return Err(self.error_here(ParseErrorKind::PathAfterExpression { token }));
        }
        if let Some(entry) = TABLE.iter().find(|e| !e.prefix && e.name == token) {
            return (entry.parse)(self, entry.arg1, entry.arg2);
        }
        let longest = TABLE
            .iter()
            .filter(|e| e.prefix && token.starts_with(e.name))
            .max_by_key(|e| e.name.len());
        if let Some(entry) = longest {
            return (entry.parse)(self, entry.arg1, entry.arg2);
        }
        let suggestion =
            typo::best_match(&token, TABLE.iter().map(|e| e.name)).map(|name| name.to_string());
        Err(self.error_here(ParseErrorKind::Unknown { token, suggestion }))
    }

    // Leaf helpers

    fn test_leaf(&mut self, test: Test, span: (usize, usize), cost: f64, prob: f64) -> ExprId {
        self.predicate_seen = true;
        self.expr_begun = true;
        self.cmdline
            .arena
            .leaf(ExprKind::Test(test), span, cost, prob, true, false, false, 0, 0)
    }

    #[allow(clippy::too_many_arguments)]
    fn action_leaf(
        &mut self,
        action: Action,
        span: (usize, usize),
        cost: f64,
        prob: f64,
        always_true: bool,
        persistent_fds: u32,
        ephemeral_fds: u32,
    ) -> ExprId {
        self.predicate_seen = true;
        self.expr_begun = true;
        self.cmdline.arena.leaf(
            ExprKind::Action(action),
            span,
            cost,
            prob,
            false,
            always_true,
            false,
            persistent_fds,
            ephemeral_fds,
        )
    }

    fn print_leaf(&mut self, sink: SinkId, style: PrintStyle, span: (usize, usize)) -> ExprId {
        let persistent = if sink == Cmdline::STDOUT_SINK { 0 } else { 1 };
        self.cmdline.arena.leaf(
            ExprKind::Action(Action::Print { sink, style }),
            span,
            PRINT_COST,
            1.0,
            false,
            true,
            false,
            persistent,
            0,
        )
    }

    fn option_node(&mut self, start: usize) -> ExprId {
        if self.predicate_seen {
            self.warn_user(&format!(
                "{} appears after a test or action; it applies to the whole command line",
                self.tokens[start]
            ));
        }
        self.cmdline.arena.true_id()
    }

    // Flag and option parsers

    fn parse_follow(&mut self, which: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        self.cmdline.walk.follow = match which {
            0 => Follow::Never,
            1 => Follow::Roots,
            _ => Follow::Always,
        };
        Ok(self.option_node(start))
    }

    fn parse_optlevel(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        let token = self.next_token().expect("dispatched on this token");
        let level = match &token[2..] {
            "0" => 0,
            "1" => 1,
            "2" => 2,
            "3" => 3,
            "4" | "fast" => 4,
            _ => {
                let suggestion = Some("-O3".to_string());
                return Err(self.error_at(
                    ParseErrorKind::Unknown {
                        token: token.to_string(),
                        suggestion,
                    },
                    start,
                ));
            }
        };
        self.cmdline.opt_level = level;
        Ok(self.option_node(start))
    }

    fn parse_debug(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let channels = self.value_for("-D")?.to_string();
        for channel in channels.split(',') {
            if !self.cmdline.debug.enable(channel) {
                self.warn_user(&format!("unknown debug channel {channel:?}"));
            }
        }
        Ok(self.option_node(start))
    }

    fn parse_regex_extended(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        self.regex_flavor = RegexFlavor::PosixExtended;
        Ok(self.option_node(start))
    }

    fn parse_xargs_safe(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        self.cmdline.xargs_safe = true;
        Ok(self.option_node(start))
    }

    fn parse_strategy(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let name = self.value_for("-S")?;
        self.cmdline.walk.strategy = match name {
            "bfs" => Strategy::Bfs,
            "dfs" => Strategy::Dfs,
            "ids" => Strategy::Ids,
            "eds" => Strategy::Eds,
            _ => {
                return Err(self.error_at(
                    ParseErrorKind::UnknownStrategy {
                        name: name.to_string(),
                    },
                    start,
                ));
            }
        };
        Ok(self.option_node(start))
    }

    fn parse_root_flag(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let path = self.value_for("-f")?;
        self.cmdline.paths.push(PathBuf::from(path));
        Ok(self.option_node(start))
    }

    fn parse_sort(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        self.cmdline.walk.sort = true;
        Ok(self.option_node(start))
    }

    fn parse_daystart(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        self.cmdline.daystart = true;
        Ok(self.option_node(start))
    }

    fn parse_warn(&mut self, on: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        self.cmdline.warn = on != 0;
        Ok(self.option_node(start))
    }

    fn parse_regextype(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let name = self.value_for("-regextype")?;
        self.regex_flavor = RegexFlavor::from_name(name).ok_or_else(|| {
            self.error_at(
                ParseErrorKind::UnknownRegexType {
                    name: name.to_string(),
                },
                start,
            )
        })?;
        Ok(self.option_node(start))
    }

    fn parse_races(&mut self, on: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        self.cmdline.walk.ignore_races = on != 0;
        Ok(self.option_node(start))
    }

    fn parse_depth_limit(&mut self, which: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        let predicate = self.next_token().expect("dispatched on this token").to_string();
        let value = self.value_for(&predicate)?;
        let depth: usize = value.parse().map_err(|_| {
            self.error_at(
                ParseErrorKind::BadNumber {
                    predicate: predicate.clone(),
                    value: value.to_string(),
                },
                start,
            )
        })?;
        if which == 0 {
            self.cmdline.walk.mindepth = depth;
        } else {
            self.cmdline.walk.maxdepth = depth;
        }
        Ok(self.option_node(start))
    }

    fn parse_xdev(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        self.cmdline.walk.xdev = true;
        Ok(self.option_node(start))
    }

    fn parse_depth_order(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        self.cmdline.walk.post_order = true;
        if self.prune_seen {
            self.warn_user("-prune has no effect with -depth");
        }
        Ok(self.option_node(start))
    }

    fn parse_color(&mut self, on: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        self.cmdline.color = on != 0;
        Ok(self.option_node(start))
    }

    // Test parsers

    fn parse_const(&mut self, truth: i32, _: i32) -> Result<ExprId, ParseError> {
        self.pos += 1;
        self.predicate_seen = true;
        self.expr_begun = true;
        Ok(if truth != 0 {
            self.cmdline.arena.true_id()
        } else {
            self.cmdline.arena.false_id()
        })
    }

    fn parse_name(&mut self, icase: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        let predicate = self.next_token().unwrap().to_string();
        let glob = self.value_for(&predicate)?;
        if glob.contains('/') {
            self.warn_user(&format!(
                "{predicate} {glob:?} will never match: patterns are matched against the basename"
            ));
        }
        let pattern = Pattern::glob(glob, icase != 0)
            .map_err(|e| self.error_at(ParseErrorKind::BadRegex(e), start))?;
        Ok(self.test_leaf(Test::Name { pattern }, (start, self.pos), FAST_COST, 0.1))
    }

    fn parse_path(&mut self, icase: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        let predicate = self.next_token().unwrap().to_string();
        let glob = self.value_for(&predicate)?;
        let pattern = Pattern::glob(glob, icase != 0)
            .map_err(|e| self.error_at(ParseErrorKind::BadRegex(e), start))?;
        Ok(self.test_leaf(Test::PathGlob { pattern }, (start, self.pos), FAST_COST, 0.1))
    }

    fn parse_lname(&mut self, icase: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        let predicate = self.next_token().unwrap().to_string();
        let glob = self.value_for(&predicate)?;
        let pattern = Pattern::glob(glob, icase != 0)
            .map_err(|e| self.error_at(ParseErrorKind::BadRegex(e), start))?;
        Ok(self.test_leaf(Test::Lname { pattern }, (start, self.pos), STAT_COST, 0.01))
    }

    fn parse_regex(&mut self, icase: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        let predicate = self.next_token().unwrap().to_string();
        let source = self.value_for(&predicate)?;
        let pattern = Pattern::regex(source, self.regex_flavor, icase != 0)
            .map_err(|e| self.error_at(ParseErrorKind::BadRegex(e), start))?;
        Ok(self.test_leaf(Test::PathRegex { pattern }, (start, self.pos), FAST_COST, 0.1))
    }

    fn parse_type(&mut self, resolve_links: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        let predicate = self.next_token().unwrap().to_string();
        let spec = self.value_for(&predicate)?;
        let mut mask = TypeMask::default();
        let mut prob: f64 = 0.0;
        for part in spec.split(',') {
            let (kind, part_prob) = match part {
                "b" => (FileKind::Block, 0.001),
                "c" => (FileKind::Char, 0.001),
                "d" => (FileKind::Directory, 0.22),
                "p" => (FileKind::Fifo, 0.001),
                "f" => (FileKind::Regular, 0.77),
                "l" => (FileKind::Symlink, 0.01),
                "s" => (FileKind::Socket, 0.001),
                "D" => (FileKind::Door, 0.0001),
                "w" => (FileKind::Whiteout, 0.0001),
                _ => {
                    return Err(self.error_at(
                        ParseErrorKind::BadType {
                            value: part.to_string(),
                        },
                        start,
                    ));
                }
            };
            mask.insert(kind);
            prob += part_prob;
        }
        let test = if resolve_links != 0 {
            Test::LinkKind { mask }
        } else {
            Test::Kind { mask }
        };
        let cost = if resolve_links != 0 { STAT_COST } else { FAST_COST };
        Ok(self.test_leaf(test, (start, self.pos), cost, prob.min(1.0)))
    }

    fn parse_size(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let value = self.value_for("-size")?;
        let (cmp, rest) = split_cmp(value);
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let (digits, suffix) = rest.split_at(digits_end);
        let count: u64 = digits.parse().map_err(|_| {
            self.error_at(
                ParseErrorKind::BadSize {
                    value: value.to_string(),
                },
                start,
            )
        })?;
        let unit: u64 = match suffix {
            "" | "b" => 512,
            "c" => 1,
            "w" => 2,
            "k" => 1 << 10,
            "M" => 1 << 20,
            "G" => 1 << 30,
            "T" => 1u64 << 40,
            "P" => 1u64 << 50,
            _ => {
                return Err(self.error_at(
                    ParseErrorKind::BadSize {
                        value: value.to_string(),
                    },
                    start,
                ));
            }
        };
        Ok(self.test_leaf(
            Test::Size { cmp, count, unit },
            (start, self.pos),
            STAT_COST,
            cmp.probability(),
        ))
    }

    fn parse_empty(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        Ok(self.test_leaf(Test::Empty, (start, self.pos), 2.0 * STAT_COST, 0.1))
    }

    fn parse_sparse(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        Ok(self.test_leaf(Test::Sparse, (start, self.pos), STAT_COST, 0.01))
    }

    fn parse_inum(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let (cmp, value) = self.integer_value("-inum", start)?;
        Ok(self.test_leaf(
            Test::InodeNum { cmp, value },
            (start, self.pos),
            STAT_COST,
            0.01,
        ))
    }

    fn parse_links(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let (cmp, value) = self.integer_value("-links", start)?;
        Ok(self.test_leaf(
            Test::Links { cmp, value },
            (start, self.pos),
            STAT_COST,
            cmp.probability(),
        ))
    }

    fn parse_samefile(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let path = self.value_for("-samefile")?.to_string();
        let follow = self.cmdline.walk.follow != Follow::Never;
        let stat = self.stat_reference(&path, follow, start)?;
        Ok(self.test_leaf(
            Test::Samefile {
                dev: stat.dev,
                ino: stat.ino,
            },
            (start, self.pos),
            STAT_COST,
            0.01,
        ))
    }

    fn parse_uid(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let (cmp, value) = self.integer_value("-uid", start)?;
        Ok(self.test_leaf(Test::Uid { cmp, value }, (start, self.pos), STAT_COST, 0.5))
    }

    fn parse_gid(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let (cmp, value) = self.integer_value("-gid", start)?;
        Ok(self.test_leaf(Test::Gid { cmp, value }, (start, self.pos), STAT_COST, 0.5))
    }

    fn parse_user(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let name = self.value_for("-user")?.to_string();
        let uid = match self.users.id_for(&name) {
            Some(uid) => uid,
            None => name.parse().map_err(|_| {
                self.error_at(ParseErrorKind::UnknownUser { name: name.clone() }, start)
            })?,
        };
        Ok(self.test_leaf(
            Test::Uid {
                cmp: Cmp::Exact,
                value: uid.into(),
            },
            (start, self.pos),
            STAT_COST,
            0.5,
        ))
    }

    fn parse_group(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let name = self.value_for("-group")?.to_string();
        let gid = match self.groups.id_for(&name) {
            Some(gid) => gid,
            None => name.parse().map_err(|_| {
                self.error_at(ParseErrorKind::UnknownGroup { name: name.clone() }, start)
            })?,
        };
        Ok(self.test_leaf(
            Test::Gid {
                cmp: Cmp::Exact,
                value: gid.into(),
            },
            (start, self.pos),
            STAT_COST,
            0.5,
        ))
    }

    fn parse_nouser(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        Ok(self.test_leaf(Test::Nouser, (start, self.pos), STAT_COST, 0.01))
    }

    fn parse_nogroup(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        Ok(self.test_leaf(Test::Nogroup, (start, self.pos), STAT_COST, 0.01))
    }

    fn parse_perm(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let value = self.value_for("-perm")?;
        let (check, rest) = match value.as_bytes().first() {
            Some(b'-') => (PermCheck::All, &value[1..]),
            Some(b'/') => (PermCheck::Any, &value[1..]),
            _ => (PermCheck::Exact, value),
        };
        let spec = ModeSpec::parse(rest).ok_or_else(|| {
            self.error_at(
                ParseErrorKind::BadMode {
                    value: value.to_string(),
                },
                start,
            )
        })?;
        Ok(self.test_leaf(
            Test::Perm { spec, check },
            (start, self.pos),
            STAT_COST,
            0.5,
        ))
    }

    fn parse_age(&mut self, field: i32, days: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        let predicate = self.next_token().unwrap().to_string();
        let (cmp, value) = self.integer_value(&predicate, start)?;
        Ok(self.test_leaf(
            Test::Age {
                field: time_field(field),
                unit: if days != 0 {
                    TimeUnit::Days
                } else {
                    TimeUnit::Minutes
                },
                cmp,
                value,
            },
            (start, self.pos),
            STAT_COST,
            0.5,
        ))
    }

    fn parse_newer_file(&mut self, field: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        let predicate = self.next_token().unwrap().to_string();
        let path = self.value_for(&predicate)?.to_string();
        let follow = self.cmdline.walk.follow != Follow::Never;
        let stat = self.stat_reference(&path, follow, start)?;
        Ok(self.test_leaf(
            Test::Newer {
                field: time_field(field),
                reference: stat.mtime,
            },
            (start, self.pos),
            STAT_COST,
            0.5,
        ))
    }

    /// The `-newerXY` family, including plain `-newer` (= `-newermm`).
    fn parse_newer_xy(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        let token = self.next_token().unwrap().to_string();
        let suffix = &token[6..];
        let (x, y) = match suffix.as_bytes() {
            [] => (b'm', b'm'),
            [x, y] => (*x, *y),
            _ => {
                return Err(self.error_at(
                    ParseErrorKind::Unknown {
                        token: token.clone(),
                        suggestion: Some("-newer".to_string()),
                    },
                    start,
                ));
            }
        };
        let field = match x {
            b'a' => TimeField::Accessed,
            b'B' => TimeField::Birthed,
            b'c' => TimeField::Changed,
            b'm' => TimeField::Modified,
            _ => {
                return Err(self.error_at(
                    ParseErrorKind::Unknown {
                        token: token.clone(),
                        suggestion: Some("-newer".to_string()),
                    },
                    start,
                ));
            }
        };
        let value = self.value_for(&token)?.to_string();
        let reference = if y == b't' {
            parse_timestamp(&value).ok_or_else(|| {
                self.error_at(ParseErrorKind::BadTime { value: value.clone() }, start)
            })?
        } else {
            let follow = self.cmdline.walk.follow != Follow::Never;
            let stat = self.stat_reference(&value, follow, start)?;
            match y {
                b'a' => stat.atime,
                b'c' => stat.ctime,
                b'm' => stat.mtime,
                b'B' => stat.btime.ok_or_else(|| {
                    self.error_at(
                        ParseErrorKind::Reference {
                            path: value.clone(),
                            message: "birth time is not available".to_string(),
                        },
                        start,
                    )
                })?,
                _ => {
                    return Err(self.error_at(
                        ParseErrorKind::Unknown {
                            token: token.clone(),
                            suggestion: Some("-newer".to_string()),
                        },
                        start,
                    ));
                }
            }
        };
        Ok(self.test_leaf(
            Test::Newer { field, reference },
            (start, self.pos),
            STAT_COST,
            0.5,
        ))
    }

    fn parse_used(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let (cmp, value) = self.integer_value("-used", start)?;
        Ok(self.test_leaf(Test::Used { cmp, value }, (start, self.pos), STAT_COST, 0.5))
    }

    fn parse_hidden(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        Ok(self.test_leaf(Test::Hidden, (start, self.pos), FAST_COST, 0.01))
    }

    fn parse_fstype(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let name = self.value_for("-fstype")?.to_string();
        if self.cmdline.mounts.is_none() {
            self.cmdline.mounts = Some(load_mounts());
        }
        Ok(self.test_leaf(
            Test::Fstype { name },
            (start, self.pos),
            STAT_COST,
            0.5,
        ))
    }

    fn parse_access(&mut self, mode: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        Ok(self.test_leaf(
            Test::Access { mode },
            (start, self.pos),
            STAT_COST,
            0.9,
        ))
    }

    // Action parsers

    fn parse_print(&mut self, style: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        self.has_action = true;
        let style = print_style(style);
        let leaf = self.print_leaf(Cmdline::STDOUT_SINK, style, (start, self.pos));
        self.predicate_seen = true;
        self.expr_begun = true;
        Ok(leaf)
    }

    fn parse_fprint(&mut self, style: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        let predicate = self.next_token().unwrap().to_string();
        let path = self.value_for(&predicate)?.to_string();
        let sink = self.open_sink(&path, start)?;
        self.has_action = true;
        let style = print_style(style);
        let leaf = self.print_leaf(sink, style, (start, self.pos));
        self.predicate_seen = true;
        self.expr_begun = true;
        Ok(leaf)
    }

    fn parse_printf(&mut self, to_file: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        let predicate = self.next_token().unwrap().to_string();
        let sink = if to_file != 0 {
            let path = self.value_for(&predicate)?.to_string();
            self.open_sink(&path, start)?
        } else {
            Cmdline::STDOUT_SINK
        };
        let source = self.value_for(&predicate)?;
        let (format, warnings) = Format::parse(source);
        for warning in warnings {
            self.warn_user(&format!("{predicate}: {warning}"));
        }
        self.has_action = true;
        let persistent = if sink == Cmdline::STDOUT_SINK { 0 } else { 1 };
        Ok(self.action_leaf(
            Action::Printf { sink, format },
            (start, self.pos),
            PRINT_COST,
            1.0,
            true,
            persistent,
            0,
        ))
    }

    fn parse_ls(&mut self, to_file: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        let predicate = self.next_token().unwrap().to_string();
        let sink = if to_file != 0 {
            let path = self.value_for(&predicate)?.to_string();
            self.open_sink(&path, start)?
        } else {
            Cmdline::STDOUT_SINK
        };
        self.has_action = true;
        let persistent = if sink == Cmdline::STDOUT_SINK { 0 } else { 1 };
        Ok(self.action_leaf(
            Action::Ls { sink },
            (start, self.pos),
            PRINT_COST + STAT_COST,
            1.0,
            true,
            persistent,
            0,
        ))
    }

    fn parse_delete(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        self.has_action = true;
        // Deleting the contents before the directory requires post-order.
        self.cmdline.walk.post_order = true;
        Ok(self.action_leaf(
            Action::Delete,
            (start, self.pos),
            2.0 * STAT_COST,
            1.0,
            false,
            0,
            1,
        ))
    }

    fn parse_prune(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        self.prune_seen = true;
        if self.cmdline.walk.post_order {
            self.warn_user("-prune has no effect with -depth");
        }
        Ok(self.action_leaf(
            Action::Prune,
            (start, self.pos),
            FAST_COST,
            1.0,
            true,
            0,
            0,
        ))
    }

    fn parse_nohidden(&mut self, _: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        Ok(self.action_leaf(
            Action::Nohidden,
            (start, self.pos),
            FAST_COST,
            0.99,
            false,
            0,
            0,
        ))
    }

    fn parse_quit(&mut self, with_code: i32, _: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        self.pos += 1;
        self.has_action = true;
        let code = if with_code != 0 {
            match self.peek().and_then(|t| t.parse::<i32>().ok()) {
                Some(code) => {
                    self.pos += 1;
                    Some(code)
                }
                None => Some(0),
            }
        } else {
            None
        };
        Ok(self.action_leaf(
            Action::Quit { code },
            (start, self.pos),
            FAST_COST,
            1.0,
            true,
            0,
            0,
        ))
    }

    fn parse_exec(&mut self, in_dir: i32, confirm: i32) -> Result<ExprId, ParseError> {
        let start = self.pos;
        let predicate = self.next_token().unwrap().to_string();
        let mut argv: Vec<std::ffi::OsString> = Vec::new();
        let mut batch = false;
        loop {
            let Some(token) = self.next_token() else {
                return Err(self.error_at(ParseErrorKind::UnterminatedExec, start));
            };
            match token {
                ";" => break,
                "+" if argv.last().map(|a| a.to_str() == Some("{}")).unwrap_or(false)
                    && confirm == 0 =>
                {
                    batch = true;
                    break;
                }
                _ => argv.push(token.into()),
            }
        }
        if argv.is_empty() {
            return Err(self.error_at(
                ParseErrorKind::MissingValue {
                    predicate: predicate.clone(),
                },
                start,
            ));
        }
        let spec = ExecSpec {
            argv,
            in_dir: in_dir != 0,
            confirm: confirm != 0,
            batch,
        };
        let exec = self.cmdline.execs.len();
        self.cmdline.execs.push(spec);
        self.has_action = true;
        let (prob, always_true) = if batch { (1.0, true) } else { (0.5, false) };
        Ok(self.action_leaf(
            Action::Exec { exec },
            (start, self.pos),
            1_000_000.0,
            prob,
            always_true,
            0,
            3,
        ))
    }

    // Shared argument helpers

    fn integer_value(&mut self, predicate: &str, start: usize) -> Result<(Cmp, u64), ParseError> {
        let value = self.value_for(predicate)?;
        let (cmp, digits) = split_cmp(value);
        let parsed = digits.parse().map_err(|_| {
            self.error_at(
                ParseErrorKind::BadNumber {
                    predicate: predicate.to_string(),
                    value: value.to_string(),
                },
                start,
            )
        })?;
        Ok((cmp, parsed))
    }

    fn stat_reference(
        &self,
        path: &str,
        follow: bool,
        start: usize,
    ) -> Result<bfs_common::Stat, ParseError> {
        let cpath = bfs_common::to_cstring(OsStr::new(path)).map_err(|e| {
            self.error_at(
                ParseErrorKind::Reference {
                    path: path.to_string(),
                    message: e.to_string(),
                },
                start,
            )
        })?;
        let mut stat = bfs_common::stat_at(None, &cpath, follow).map_err(|e| {
            self.error_at(
                ParseErrorKind::Reference {
                    path: path.to_string(),
                    message: e.to_string(),
                },
                start,
            )
        })?;
        stat.btime = bfs_common::btime_at(None, &cpath, follow)
            .ok()
            .or(stat.btime);
        Ok(stat)
    }

    /// Open (or reuse) an output file, deduplicated by device and inode so
    /// that two clauses printing to the same file share one handle.
    fn open_sink(&mut self, path: &str, start: usize) -> Result<SinkId, ParseError> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                self.error_at(
                    ParseErrorKind::OutputOpen {
                        path: path.to_string(),
                        message: e.to_string(),
                    },
                    start,
                )
            })?;
        let meta = file.metadata().map_err(|e| {
            self.error_at(
                ParseErrorKind::OutputOpen {
                    path: path.to_string(),
                    message: e.to_string(),
                },
                start,
            )
        })?;
        let key = format!("{:x}:{:x}", meta.dev(), meta.ino());
        if let Some(leaf) = self.sink_keys.find_exact(key.as_bytes()) {
            return Ok(*self.sink_keys.value(leaf));
        }
        let sink = self.cmdline.sinks.len();
        self.cmdline.sinks.push(Sink {
            name: path.to_string(),
            out: Box::new(std::io::BufWriter::new(file)),
        });
        self.sink_keys.insert(key.as_bytes(), sink);
        Ok(sink)
    }
}

fn print_style(style: i32) -> PrintStyle {
    match style {
        0 => PrintStyle::Plain,
        1 => PrintStyle::Nul,
        _ => PrintStyle::Escaped,
    }
}

fn time_field(field: i32) -> TimeField {
    match field {
        FIELD_ATIME => TimeField::Accessed,
        FIELD_BTIME => TimeField::Birthed,
        FIELD_CTIME => TimeField::Changed,
        _ => TimeField::Modified,
    }
}

fn split_cmp(value: &str) -> (Cmp, &str) {
    match value.as_bytes().first() {
        Some(b'+') => (Cmp::Greater, &value[1..]),
        Some(b'-') => (Cmp::Less, &value[1..]),
        _ => (Cmp::Exact, value),
    }
}

fn now_timespec() -> Timespec {
    let now = chrono::Local::now();
    Timespec::new(now.timestamp(), i64::from(now.timestamp_subsec_nanos()))
}

/// Accept a few common explicit timestamp spellings for `-newerXt`.
fn parse_timestamp(value: &str) -> Option<Timespec> {
    if let Some(epoch) = value.strip_prefix('@') {
        let seconds: f64 = epoch.parse().ok()?;
        return Some(Timespec::new(
            seconds.trunc() as i64,
            (seconds.fract() * 1e9) as i64,
        ));
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some(Timespec::new(dt.timestamp(), i64::from(dt.timestamp_subsec_nanos())));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d"] {
        let parsed = if format.contains('H') {
            chrono::NaiveDateTime::parse_from_str(value, format).ok()
        } else {
            chrono::NaiveDate::parse_from_str(value, format)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        };
        if let Some(naive) = parsed {
            if let chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) =
                chrono::Local.from_local_datetime(&naive)
            {
                return Some(Timespec::new(dt.timestamp(), 0));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cmdline, ParseError> {
        parse_cmdline(args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn leading_tokens_become_roots() {
        let cmdline = parse(&["a", "b", "-name", "*.txt"]).unwrap();
        assert_eq!(cmdline.paths, [PathBuf::from("a"), PathBuf::from("b")]);
    }

    #[test]
    fn missing_roots_default_to_cwd() {
        let cmdline = parse(&["-true"]).unwrap();
        assert_eq!(cmdline.paths, [PathBuf::from(".")]);
    }

    #[test]
    fn paths_may_follow_flags_and_options() {
        let cmdline = parse(&["-maxdepth", "1", ".", "-name", "x"]).unwrap();
        assert_eq!(cmdline.paths, [PathBuf::from(".")]);
        assert_eq!(cmdline.walk.maxdepth, 1);
    }

    #[test]
    fn unknown_predicate_suggests_the_closest_name() {
        let err = parse(&["-xtpye", "f"]).unwrap_err();
        let ParseErrorKind::Unknown { token, suggestion } = &err.kind else {
            panic!("wrong error kind: {err:?}");
        };
        assert_eq!(token, "-xtpye");
        assert_eq!(suggestion.as_deref(), Some("-xtype"));
    }

    #[test]
    fn global_options_update_walk_settings() {
        let cmdline = parse(&["-maxdepth", "3", "-mindepth", "1", "-xdev", "-depth"]).unwrap();
        assert_eq!(cmdline.walk.maxdepth, 3);
        assert_eq!(cmdline.walk.mindepth, 1);
        assert!(cmdline.walk.xdev);
        assert!(cmdline.walk.post_order);
    }

    #[test]
    fn flags_set_follow_policy_and_strategy() {
        let cmdline = parse(&["-L", "-S", "dfs"]).unwrap();
        assert_eq!(cmdline.walk.follow, Follow::Always);
        assert_eq!(cmdline.walk.strategy, Strategy::Dfs);

        let err = parse(&["-S", "zds"]).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::UnknownStrategy { .. }));
    }

    #[test]
    fn optimizer_level_flags_parse() {
        assert_eq!(parse(&["-O0"]).unwrap().opt_level, 0);
        assert_eq!(parse(&["-O2"]).unwrap().opt_level, 2);
        assert_eq!(parse(&["-Ofast"]).unwrap().opt_level, 4);
        assert!(parse(&["-O9"]).is_err());
    }

    #[test]
    fn missing_values_are_reported() {
        let err = parse(&["-name"]).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::MissingValue { .. }));
        let err = parse(&["-size", "12Q"]).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::BadSize { .. }));
        let err = parse(&["-mindepth", "x"]).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::BadNumber { .. }));
    }

    #[test]
    fn unbalanced_parens_are_reported() {
        let err = parse(&["(", "-true"]).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::UnmatchedOpen));
        let err = parse(&["-true", ")"]).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::UnmatchedClose));
    }

    #[test]
    fn paths_cannot_follow_the_expression() {
        let err = parse(&["-true", "stray"]).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::PathAfterExpression { .. }));
    }

    #[test]
    fn exec_consumes_until_terminator() {
        let cmdline = parse(&["-exec", "echo", "{}", ";"]).unwrap();
        assert_eq!(cmdline.execs.len(), 1);
        assert!(!cmdline.execs[0].batch);

        let cmdline = parse(&["-exec", "echo", "{}", "+"]).unwrap();
        assert!(cmdline.execs[0].batch);

        let err = parse(&["-exec", "echo", "{}"]).unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::UnterminatedExec));
    }

    #[test]
    fn implicit_print_is_added_without_an_action() {
        let cmdline = parse(&["-name", "x"]).unwrap();
        let node = cmdline.arena.get(cmdline.root);
        assert!(matches!(node.kind, ExprKind::And(_, _)));
        let ExprKind::And(_, rhs) = node.kind else {
            unreachable!()
        };
        assert!(matches!(
            cmdline.arena.get(rhs).kind,
            ExprKind::Action(Action::Print { .. })
        ));
    }

    #[test]
    fn explicit_print_suppresses_the_implicit_one() {
        let cmdline = parse(&["-print"]).unwrap();
        assert!(matches!(
            cmdline.arena.get(cmdline.root).kind,
            ExprKind::Action(Action::Print { .. })
        ));
    }

    #[test]
    fn newer_family_parses_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let reference = dir.path().join("ref");
        std::fs::write(&reference, b"x").unwrap();
        let reference = reference.to_str().unwrap();

        for token in ["-newer", "-newermm", "-neweraa", "-newercm"] {
            let cmdline = parse(&[token, reference, "-print"]).unwrap();
            drop(cmdline);
        }
        assert!(parse(&["-newerxx", reference]).is_err());
        let cmdline = parse(&["-newermt", "2024-01-01", "-print"]).unwrap();
        drop(cmdline);
        assert!(parse(&["-newermt", "not-a-time"]).is_err());
    }

    #[test]
    fn type_lists_accumulate() {
        let cmdline = parse(&["-type", "f,d", "-print"]).unwrap();
        let ExprKind::And(lhs, _) = cmdline.arena.get(cmdline.root).kind else {
            panic!("expected the and with -print");
        };
        let ExprKind::Test(Test::Kind { mask }) = &cmdline.arena.get(lhs).kind else {
            panic!("expected a type test");
        };
        assert!(mask.contains(FileKind::Regular));
        assert!(mask.contains(FileKind::Directory));
        assert!(!mask.contains(FileKind::Symlink));
        assert!(parse(&["-type", "q"]).is_err());
    }

    #[test]
    fn fprint_sinks_deduplicate_by_inode() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let out = out.to_str().unwrap();
        let cmdline = parse(&["-fprint", out, "-o", "-fprint", out]).unwrap();
        // Stdout plus exactly one shared file sink.
        assert_eq!(cmdline.sinks.len(), 2);
    }

    #[test]
    fn mount_flag_and_fstype_load_the_mount_table() {
        let cmdline = parse(&["-fstype", "ext4", "-print"]).unwrap();
        assert!(cmdline.mounts.is_some());
    }
}
