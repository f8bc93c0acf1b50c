//! The expression engine: tree model, parser, optimizer, and evaluator for
//! `find`-compatible command lines.
//!
//! An expression is a forest of arena-indexed nodes: leaf predicates (tests
//! and actions) under NOT/AND/OR/COMMA operators, with shared immutable
//! `true`/`false` sentinels. Every node carries the annotations the
//! optimizer steers by: purity, conservative constness, an expected
//! evaluation cost, and the probability of returning true.

pub mod ctx;
pub mod eval;
pub mod opt;
pub mod parse;

mod exec;
mod mode;
mod pattern;
mod printf;
mod pwcache;
mod typo;

pub use ctx::{Cmdline, DebugFlags, EvalCtx};
pub use mode::ModeSpec;
pub use parse::{ParseError, ParseErrorKind, parse_cmdline};
pub use pattern::{Pattern, RegexFlavor};

use bfs_arena::{Pool, SlotId};
use bfs_common::{FileKind, Timespec};

/// Baseline cost of a predicate that only looks at data already in hand.
pub const FAST_COST: f64 = 40.0;
/// Cost of a predicate that must materialize a stat block.
pub const STAT_COST: f64 = 1000.0;
/// Cost of writing a line of output.
pub const PRINT_COST: f64 = 20000.0;

/// Handle to an expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(SlotId);

/// Comparison sense of an integer argument: `+N`, `-N`, or exact `N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Exact,
    Greater,
    Less,
}

impl Cmp {
    pub fn matches(self, value: u64, target: u64) -> bool {
        match self {
            Cmp::Exact => value == target,
            Cmp::Greater => value > target,
            Cmp::Less => value < target,
        }
    }

    /// Probability estimate that a comparison against a typical distribution
    /// holds, for the optimizer.
    pub fn probability(self) -> f64 {
        match self {
            Cmp::Exact => 0.1,
            Cmp::Greater | Cmp::Less => 0.5,
        }
    }
}

/// Which timestamp a time test inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeField {
    Accessed,
    Birthed,
    Changed,
    Modified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Minutes,
    Days,
}

/// Set of file kinds accepted by `-type`/`-xtype`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeMask(u16);

impl TypeMask {
    pub fn insert(&mut self, kind: FileKind) {
        self.0 |= 1 << Self::bit(kind);
    }

    pub fn contains(self, kind: FileKind) -> bool {
        self.0 & (1 << Self::bit(kind)) != 0
    }

    fn bit(kind: FileKind) -> u16 {
        match kind {
            FileKind::Regular => 0,
            FileKind::Directory => 1,
            FileKind::Symlink => 2,
            FileKind::Block => 3,
            FileKind::Char => 4,
            FileKind::Fifo => 5,
            FileKind::Socket => 6,
            FileKind::Door => 7,
            FileKind::Whiteout => 8,
            FileKind::Unknown | FileKind::Error => 9,
        }
    }
}

/// How `-perm` interprets its mode argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermCheck {
    /// All and only these bits (`-perm MODE`).
    Exact,
    /// At least these bits (`-perm -MODE`).
    All,
    /// Any of these bits (`-perm /MODE`).
    Any,
}

/// Index into the command line's output sink table.
pub type SinkId = usize;
/// Index into the command line's exec table.
pub type ExecId = usize;

/// A pure(ish) test predicate.
#[derive(Debug, Clone)]
pub enum Test {
    /// Glob match on the final path component.
    Name { pattern: Pattern },
    /// Glob match on the whole path.
    PathGlob { pattern: Pattern },
    /// Glob match on a symlink target.
    Lname { pattern: Pattern },
    /// Regex match on the whole path.
    PathRegex { pattern: Pattern },
    Kind { mask: TypeMask },
    /// Like `Kind` but resolved through symlinks (or not, under `-L`).
    LinkKind { mask: TypeMask },
    Size { cmp: Cmp, count: u64, unit: u64 },
    Empty,
    Sparse,
    InodeNum { cmp: Cmp, value: u64 },
    Links { cmp: Cmp, value: u64 },
    Samefile { dev: u64, ino: u64 },
    Uid { cmp: Cmp, value: u64 },
    Gid { cmp: Cmp, value: u64 },
    Nouser,
    Nogroup,
    Perm { spec: ModeSpec, check: PermCheck },
    /// `-amin`/`-atime` and friends: age in minutes or days.
    Age {
        field: TimeField,
        unit: TimeUnit,
        cmp: Cmp,
        value: u64,
    },
    /// `-anewer`/`-newerXY`: timestamp strictly after a reference point.
    Newer { field: TimeField, reference: Timespec },
    /// Days between access and status change.
    Used { cmp: Cmp, value: u64 },
    Hidden,
    Fstype { name: String },
    /// `faccessat` check: `-readable`/`-writable`/`-executable`.
    Access { mode: i32 },
}

/// How a print action renders a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintStyle {
    /// Newline-terminated.
    Plain,
    /// NUL-terminated.
    Nul,
    /// Backslash-escaped, newline-terminated.
    Escaped,
}

/// A side-effecting action predicate.
#[derive(Debug, Clone)]
pub enum Action {
    Print { sink: SinkId, style: PrintStyle },
    Printf { sink: SinkId, format: printf::Format },
    Ls { sink: SinkId },
    Delete,
    Prune,
    /// Prune hidden entries and reject them.
    Nohidden,
    Quit { code: Option<i32> },
    Exec { exec: ExecId },
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    True,
    False,
    Not(ExprId),
    And(ExprId, ExprId),
    Or(ExprId, ExprId),
    Comma(ExprId, ExprId),
    Test(Test),
    Action(Action),
}

/// One node of the expression forest.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    /// Evaluation has no observable effect and depends only on the entry.
    pub pure: bool,
    pub always_true: bool,
    pub always_false: bool,
    /// Expected evaluation cost, in loosely nanosecond-scale units.
    pub cost: f64,
    /// Expected probability of returning true.
    pub prob: f64,
    /// Range of the original argv tokens this node came from.
    pub argv_span: (usize, usize),
    /// File descriptors this subtree keeps open for the whole run.
    pub persistent_fds: u32,
    /// File descriptors this subtree needs transiently while evaluating.
    pub ephemeral_fds: u32,
}

/// Arena of expression nodes with shared `true`/`false` sentinels.
#[derive(Debug)]
pub struct ExprArena {
    pool: Pool<Expr>,
    true_id: ExprId,
    false_id: ExprId,
}

impl Default for ExprArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ExprArena {
    pub fn new() -> Self {
        let mut pool = Pool::new();
        let true_id = ExprId(pool.alloc(Expr {
            kind: ExprKind::True,
            pure: true,
            always_true: true,
            always_false: false,
            cost: 0.0,
            prob: 1.0,
            argv_span: (0, 0),
            persistent_fds: 0,
            ephemeral_fds: 0,
        }));
        let false_id = ExprId(pool.alloc(Expr {
            kind: ExprKind::False,
            pure: true,
            always_true: false,
            always_false: true,
            cost: 0.0,
            prob: 0.0,
            argv_span: (0, 0),
            persistent_fds: 0,
            ephemeral_fds: 0,
        }));
        Self {
            pool,
            true_id,
            false_id,
        }
    }

    /// The shared always-true sentinel.
    pub fn true_id(&self) -> ExprId {
        self.true_id
    }

    /// The shared always-false sentinel.
    pub fn false_id(&self) -> ExprId {
        self.false_id
    }

    pub fn get(&self, id: ExprId) -> &Expr {
        self.pool.get(id.0)
    }

    pub fn is_sentinel(&self, id: ExprId) -> bool {
        id == self.true_id || id == self.false_id
    }

    /// Allocate a leaf predicate with explicit annotations.
    #[allow(clippy::too_many_arguments)]
    pub fn leaf(
        &mut self,
        kind: ExprKind,
        argv_span: (usize, usize),
        cost: f64,
        prob: f64,
        pure: bool,
        always_true: bool,
        always_false: bool,
        persistent_fds: u32,
        ephemeral_fds: u32,
    ) -> ExprId {
        debug_assert!(cost >= 0.0);
        debug_assert!((0.0..=1.0).contains(&prob));
        ExprId(self.pool.alloc(Expr {
            kind,
            pure,
            always_true,
            always_false,
            cost,
            prob,
            argv_span,
            persistent_fds,
            ephemeral_fds,
        }))
    }

    /// NOT with recomputed annotations; no rewriting.
    pub fn raw_not(&mut self, child: ExprId, argv_span: (usize, usize)) -> ExprId {
        let c = self.get(child).clone();
        ExprId(self.pool.alloc(Expr {
            kind: ExprKind::Not(child),
            pure: c.pure,
            always_true: c.always_false,
            always_false: c.always_true,
            cost: c.cost,
            prob: 1.0 - c.prob,
            argv_span,
            persistent_fds: c.persistent_fds,
            ephemeral_fds: c.ephemeral_fds,
        }))
    }

    /// Binary operator with recomputed annotations; no rewriting.
    pub fn raw_binary(
        &mut self,
        op: BinaryOp,
        lhs: ExprId,
        rhs: ExprId,
        argv_span: (usize, usize),
    ) -> ExprId {
        // Children are distinct allocations except for the shared sentinels.
        debug_assert!(lhs != rhs || self.is_sentinel(lhs));
        let l = self.get(lhs).clone();
        let r = self.get(rhs).clone();
        let (kind, prob, cost, always_true, always_false) = match op {
            BinaryOp::And => {
                let prob = l.prob * r.prob;
                // The right side only runs when the left returns true.
                let cost = l.cost + l.prob * r.cost;
                (
                    ExprKind::And(lhs, rhs),
                    prob,
                    cost,
                    l.always_true && r.always_true,
                    l.always_false || r.always_false,
                )
            }
            BinaryOp::Or => {
                let prob = l.prob + r.prob - l.prob * r.prob;
                let cost = l.cost + (1.0 - l.prob) * r.cost;
                (
                    ExprKind::Or(lhs, rhs),
                    prob,
                    cost,
                    l.always_true || r.always_true,
                    l.always_false && r.always_false,
                )
            }
            BinaryOp::Comma => (
                ExprKind::Comma(lhs, rhs),
                r.prob,
                l.cost + r.cost,
                r.always_true,
                r.always_false,
            ),
        };
        ExprId(self.pool.alloc(Expr {
            kind,
            pure: l.pure && r.pure,
            always_true,
            always_false,
            cost,
            prob,
            argv_span,
            persistent_fds: l.persistent_fds + r.persistent_fds,
            ephemeral_fds: l.ephemeral_fds.max(r.ephemeral_fds),
        }))
    }

    /// Render a subtree for diagnostics, quoting leaves by their original
    /// argv tokens.
    pub fn dump(&self, id: ExprId, tokens: &[String]) -> String {
        let node = self.get(id);
        let leaf_text = |span: (usize, usize), fallback: &str| {
            if span.0 < span.1 && span.1 <= tokens.len() {
                tokens[span.0..span.1].join(" ")
            } else {
                fallback.to_string()
            }
        };
        match &node.kind {
            ExprKind::True => "-true".to_string(),
            ExprKind::False => "-false".to_string(),
            ExprKind::Not(child) => format!("(! {})", self.dump(*child, tokens)),
            ExprKind::And(l, r) => {
                format!("(-a {} {})", self.dump(*l, tokens), self.dump(*r, tokens))
            }
            ExprKind::Or(l, r) => {
                format!("(-o {} {})", self.dump(*l, tokens), self.dump(*r, tokens))
            }
            ExprKind::Comma(l, r) => {
                format!("(, {} {})", self.dump(*l, tokens), self.dump(*r, tokens))
            }
            ExprKind::Test(_) => format!("({})", leaf_text(node.argv_span, "-test")),
            ExprKind::Action(Action::Print { .. }) => {
                format!("({})", leaf_text(node.argv_span, "-print"))
            }
            ExprKind::Action(_) => format!("({})", leaf_text(node.argv_span, "-action")),
        }
    }

    /// Structural equality of two subtrees, used to detect a fixed point.
    pub fn same_shape(&self, a: ExprId, b: ExprId) -> bool {
        if a == b {
            return true;
        }
        match (&self.get(a).kind, &self.get(b).kind) {
            (ExprKind::True, ExprKind::True) | (ExprKind::False, ExprKind::False) => true,
            (ExprKind::Not(x), ExprKind::Not(y)) => self.same_shape(*x, *y),
            (ExprKind::And(a1, a2), ExprKind::And(b1, b2))
            | (ExprKind::Or(a1, a2), ExprKind::Or(b1, b2))
            | (ExprKind::Comma(a1, a2), ExprKind::Comma(b1, b2)) => {
                self.same_shape(*a1, *b1) && self.same_shape(*a2, *b2)
            }
            _ => false,
        }
    }
}

/// Which binary operator to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Comma,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_fixed_and_pure() {
        let arena = ExprArena::new();
        let t = arena.get(arena.true_id());
        assert!(t.pure && t.always_true && !t.always_false);
        assert_eq!(t.prob, 1.0);
        let f = arena.get(arena.false_id());
        assert!(f.pure && f.always_false && !f.always_true);
        assert_eq!(f.prob, 0.0);
    }

    #[test]
    fn and_composes_probability_and_cost() {
        let mut arena = ExprArena::new();
        let cheap = arena.leaf(
            ExprKind::Test(Test::Hidden),
            (0, 0),
            FAST_COST,
            0.5,
            true,
            false,
            false,
            0,
            0,
        );
        let dear = arena.leaf(
            ExprKind::Test(Test::Empty),
            (0, 0),
            STAT_COST,
            0.5,
            true,
            false,
            false,
            0,
            0,
        );
        let and = arena.raw_binary(BinaryOp::And, cheap, dear, (0, 0));
        let node = arena.get(and);
        assert_eq!(node.prob, 0.25);
        assert_eq!(node.cost, FAST_COST + 0.5 * STAT_COST);
        assert!(node.pure);

        let or = arena.raw_binary(BinaryOp::Or, cheap, dear, (0, 0));
        let node = arena.get(or);
        assert_eq!(node.prob, 0.75);
        assert_eq!(node.cost, FAST_COST + 0.5 * STAT_COST);
    }

    #[test]
    fn operator_annotations_respect_bounds() {
        let mut arena = ExprArena::new();
        let t = arena.true_id();
        let leaf = arena.leaf(
            ExprKind::Test(Test::Hidden),
            (0, 0),
            FAST_COST,
            0.009,
            true,
            false,
            false,
            0,
            0,
        );
        for op in [BinaryOp::And, BinaryOp::Or, BinaryOp::Comma] {
            let node_id = arena.raw_binary(op, t, leaf, (0, 0));
            let node = arena.get(node_id);
            assert!(node.cost >= 0.0);
            assert!((0.0..=1.0).contains(&node.prob));
        }
        let not = arena.raw_not(leaf, (0, 0));
        let node = arena.get(not);
        assert!((node.prob - 0.991).abs() < 1e-9);
    }
}
