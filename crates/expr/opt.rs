//! Multi-level rewriting of expression trees.
//!
//! Rewrites run in two places: the smart constructors fold as each node is
//! built, and [`optimize`] reruns everything bottom-up to a fixed point once
//! the whole tree exists. Levels are cumulative:
//!
//! - O1: constant folding, double negation, short-circuit elimination, and
//!   De Morgan when it exposes more folding.
//! - O2: purity-based dead code.
//! - O3: cost-ordered AND/OR chains.
//! - O4: eliding an entirely pure expression.

use tracing::debug;

use crate::{BinaryOp, ExprArena, ExprId, ExprKind};

/// Build a NOT, folding where the level allows.
pub fn new_not(
    arena: &mut ExprArena,
    child: ExprId,
    span: (usize, usize),
    level: u8,
) -> ExprId {
    if level >= 1 {
        if child == arena.true_id() {
            return arena.false_id();
        }
        if child == arena.false_id() {
            return arena.true_id();
        }
        match arena.get(child).kind.clone() {
            ExprKind::Not(inner) => return inner,
            // De Morgan, when a negated child means it will fold further.
            ExprKind::And(lhs, rhs) if has_not(arena, lhs) || has_not(arena, rhs) => {
                let not_lhs = new_not(arena, lhs, span, level);
                let not_rhs = new_not(arena, rhs, span, level);
                return new_or(arena, not_lhs, not_rhs, span, level);
            }
            ExprKind::Or(lhs, rhs) if has_not(arena, lhs) || has_not(arena, rhs) => {
                let not_lhs = new_not(arena, lhs, span, level);
                let not_rhs = new_not(arena, rhs, span, level);
                return new_and(arena, not_lhs, not_rhs, span, level);
            }
            _ => {}
        }
    }
    arena.raw_not(child, span)
}

/// Build an AND, folding where the level allows.
pub fn new_and(
    arena: &mut ExprArena,
    lhs: ExprId,
    rhs: ExprId,
    span: (usize, usize),
    level: u8,
) -> ExprId {
    if level >= 1 {
        // The right side is unreachable once the left cannot return true.
        if arena.get(lhs).always_false {
            return lhs;
        }
        if lhs == arena.true_id() {
            return rhs;
        }
        if rhs == arena.true_id() {
            return lhs;
        }
    }
    if level >= 2 && arena.get(lhs).pure && arena.get(rhs).always_false {
        return rhs;
    }
    arena.raw_binary(BinaryOp::And, lhs, rhs, span)
}

/// Build an OR, folding where the level allows.
pub fn new_or(
    arena: &mut ExprArena,
    lhs: ExprId,
    rhs: ExprId,
    span: (usize, usize),
    level: u8,
) -> ExprId {
    if level >= 1 {
        if arena.get(lhs).always_true {
            return lhs;
        }
        if lhs == arena.false_id() {
            return rhs;
        }
        if rhs == arena.false_id() {
            return lhs;
        }
    }
    if level >= 2 && arena.get(lhs).pure && arena.get(rhs).always_true {
        return rhs;
    }
    arena.raw_binary(BinaryOp::Or, lhs, rhs, span)
}

/// Build a COMMA, folding where the level allows.
pub fn new_comma(
    arena: &mut ExprArena,
    lhs: ExprId,
    rhs: ExprId,
    span: (usize, usize),
    level: u8,
) -> ExprId {
    if level >= 2 && arena.get(lhs).pure {
        return rhs;
    }
    arena.raw_binary(BinaryOp::Comma, lhs, rhs, span)
}

/// Whole-tree pass: reapply the constructor rewrites bottom-up until the
/// shape stops changing, then the top-level-only rules.
pub fn optimize(
    arena: &mut ExprArena,
    mut root: ExprId,
    level: u8,
    trace: bool,
    tokens: &[String],
) -> ExprId {
    if level == 0 {
        return root;
    }
    if trace {
        debug!(target: "opt", "before: {}", arena.dump(root, tokens));
    }

    // Rewrites only shrink or reorder, so this converges; the bound is
    // paranoia against a rule pair that disagrees.
    for _ in 0..32 {
        let next = rebuild(arena, root, level);
        let stable = arena.same_shape(next, root);
        root = next;
        if stable {
            break;
        }
    }

    if level >= 2 {
        // At the top level the expression's value is unused, so a pure
        // right operand of the outermost operator does nothing at all.
        loop {
            let kind = arena.get(root).kind.clone();
            let (lhs, rhs) = match kind {
                ExprKind::And(l, r) | ExprKind::Or(l, r) | ExprKind::Comma(l, r) => (l, r),
                _ => break,
            };
            if !arena.get(rhs).pure {
                break;
            }
            if trace {
                debug!(target: "opt", "top-level collapse: {}", arena.dump(rhs, tokens));
            }
            root = lhs;
        }
    }

    if level >= 4 && arena.get(root).pure && root != arena.false_id() {
        if trace {
            debug!(target: "opt", "pure expression elided");
        }
        root = arena.false_id();
    }

    if trace {
        debug!(target: "opt", "after: {}", arena.dump(root, tokens));
    }
    root
}

fn has_not(arena: &ExprArena, id: ExprId) -> bool {
    matches!(arena.get(id).kind, ExprKind::Not(_))
}

fn rebuild(arena: &mut ExprArena, id: ExprId, level: u8) -> ExprId {
    let node = arena.get(id);
    let span = node.argv_span;
    match node.kind.clone() {
        ExprKind::Not(child) => {
            let child = rebuild(arena, child, level);
            new_not(arena, child, span, level)
        }
        ExprKind::And(..) if level >= 3 => rebuild_chain(arena, id, BinaryOp::And, level),
        ExprKind::Or(..) if level >= 3 => rebuild_chain(arena, id, BinaryOp::Or, level),
        ExprKind::And(lhs, rhs) => {
            let lhs = rebuild(arena, lhs, level);
            let rhs = rebuild(arena, rhs, level);
            new_and(arena, lhs, rhs, span, level)
        }
        ExprKind::Or(lhs, rhs) => {
            let lhs = rebuild(arena, lhs, level);
            let rhs = rebuild(arena, rhs, level);
            new_or(arena, lhs, rhs, span, level)
        }
        ExprKind::Comma(lhs, rhs) => {
            let lhs = rebuild(arena, lhs, level);
            let rhs = rebuild(arena, rhs, level);
            new_comma(arena, lhs, rhs, span, level)
        }
        _ => id,
    }
}

/// Flatten a maximal same-operator chain, rebuild its elements, sort runs
/// of pure elements by expected cost per short-circuit, and fold back.
fn rebuild_chain(arena: &mut ExprArena, id: ExprId, op: BinaryOp, level: u8) -> ExprId {
    let mut elements = Vec::new();
    flatten(arena, id, op, &mut elements);
    let span = arena.get(id).argv_span;

    let mut rebuilt: Vec<ExprId> = elements
        .into_iter()
        .map(|e| rebuild(arena, e, level))
        .collect();

    // Sort each run of pure elements; impure ones are barriers that keep
    // their place. Ties keep source order.
    let key = |arena: &ExprArena, e: ExprId| {
        let node = arena.get(e);
        let denominator = match op {
            BinaryOp::And => 1.0 - node.prob,
            BinaryOp::Or => node.prob,
            BinaryOp::Comma => unreachable!("comma chains are not reordered"),
        };
        if denominator <= 0.0 {
            f64::INFINITY
        } else {
            node.cost / denominator
        }
    };
    let mut ordered = Vec::with_capacity(rebuilt.len());
    let mut run: Vec<ExprId> = Vec::new();
    for element in rebuilt.drain(..) {
        if arena.get(element).pure {
            run.push(element);
        } else {
            run.sort_by(|&a, &b| {
                key(arena, a)
                    .partial_cmp(&key(arena, b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            ordered.append(&mut run);
            ordered.push(element);
        }
    }
    run.sort_by(|&a, &b| {
        key(arena, a)
            .partial_cmp(&key(arena, b))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ordered.append(&mut run);

    let mut iter = ordered.into_iter();
    let first = iter.next().expect("chains have at least one element");
    iter.fold(first, |acc, next| match op {
        BinaryOp::And => new_and(arena, acc, next, span, level),
        BinaryOp::Or => new_or(arena, acc, next, span, level),
        BinaryOp::Comma => unreachable!("comma chains are not reordered"),
    })
}

fn flatten(arena: &ExprArena, id: ExprId, op: BinaryOp, out: &mut Vec<ExprId>) {
    match (&arena.get(id).kind, op) {
        (ExprKind::And(lhs, rhs), BinaryOp::And) | (ExprKind::Or(lhs, rhs), BinaryOp::Or) => {
            let (lhs, rhs) = (*lhs, *rhs);
            flatten(arena, lhs, op, out);
            flatten(arena, rhs, op, out);
        }
        _ => out.push(id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExprKind, FAST_COST, STAT_COST, Test};

    fn pure_leaf(arena: &mut ExprArena, cost: f64, prob: f64) -> ExprId {
        arena.leaf(
            ExprKind::Test(Test::Hidden),
            (0, 0),
            cost,
            prob,
            true,
            false,
            false,
            0,
            0,
        )
    }

    fn impure_leaf(arena: &mut ExprArena) -> ExprId {
        arena.leaf(
            ExprKind::Action(crate::Action::Prune),
            (0, 0),
            FAST_COST,
            1.0,
            false,
            true,
            false,
            0,
            0,
        )
    }

    #[test]
    fn not_true_and_false_folds_to_true() {
        let mut arena = ExprArena::new();
        let t = arena.true_id();
        let f = arena.false_id();
        let and = new_and(&mut arena, t, f, (0, 0), 1);
        let root = new_not(&mut arena, and, (0, 0), 1);
        assert_eq!(root, arena.true_id());
    }

    #[test]
    fn level_zero_folds_nothing() {
        let mut arena = ExprArena::new();
        let t = arena.true_id();
        let f = arena.false_id();
        let and = new_and(&mut arena, t, f, (0, 0), 0);
        assert!(matches!(arena.get(and).kind, ExprKind::And(_, _)));
        let root = new_not(&mut arena, and, (0, 0), 0);
        assert!(matches!(arena.get(root).kind, ExprKind::Not(_)));
        assert_eq!(optimize(&mut arena, root, 0, false, &[]), root);
    }

    #[test]
    fn double_negation_cancels() {
        let mut arena = ExprArena::new();
        let leaf = pure_leaf(&mut arena, FAST_COST, 0.5);
        let once = new_not(&mut arena, leaf, (0, 0), 1);
        let twice = new_not(&mut arena, once, (0, 0), 1);
        assert_eq!(twice, leaf);
    }

    #[test]
    fn de_morgan_fires_only_around_negations() {
        let mut arena = ExprArena::new();
        let a = pure_leaf(&mut arena, FAST_COST, 0.5);
        let b = pure_leaf(&mut arena, FAST_COST, 0.5);
        let not_a = new_not(&mut arena, a, (0, 0), 1);
        let and = new_and(&mut arena, not_a, b, (0, 0), 1);
        let root = new_not(&mut arena, and, (0, 0), 1);
        let ExprKind::Or(lhs, rhs) = arena.get(root).kind else {
            panic!("wanted an or, got {:?}", arena.get(root).kind);
        };
        assert_eq!(lhs, a);
        assert!(matches!(arena.get(rhs).kind, ExprKind::Not(_)));

        // Without an inner negation the operator stays put.
        let plain = new_and(&mut arena, a, b, (0, 0), 1);
        let root = new_not(&mut arena, plain, (0, 0), 1);
        assert!(matches!(arena.get(root).kind, ExprKind::Not(_)));
    }

    #[test]
    fn purity_gated_dead_code_needs_level_two() {
        let mut arena = ExprArena::new();
        let pure = pure_leaf(&mut arena, FAST_COST, 0.5);
        let f = arena.false_id();
        let kept = new_and(&mut arena, pure, f, (0, 0), 1);
        assert!(matches!(arena.get(kept).kind, ExprKind::And(_, _)));
        let folded = new_and(&mut arena, pure, f, (0, 0), 2);
        assert_eq!(folded, arena.false_id());

        let comma = new_comma(&mut arena, pure, f, (0, 0), 2);
        assert_eq!(comma, arena.false_id());
    }

    #[test]
    fn impure_always_true_left_operand_swallows_or() {
        let mut arena = ExprArena::new();
        let action = impure_leaf(&mut arena);
        let pure = pure_leaf(&mut arena, FAST_COST, 0.5);
        let or = new_or(&mut arena, action, pure, (0, 0), 1);
        assert_eq!(or, action);
    }

    #[test]
    fn chains_reorder_by_expected_cost() {
        let mut arena = ExprArena::new();
        let dear = pure_leaf(&mut arena, STAT_COST, 0.5);
        let cheap = pure_leaf(&mut arena, FAST_COST, 0.5);
        let root = arena.raw_binary(BinaryOp::And, dear, cheap, (0, 0));
        let root = optimize(&mut arena, root, 3, false, &[]);
        let ExprKind::And(lhs, rhs) = arena.get(root).kind else {
            panic!("chain collapsed unexpectedly");
        };
        assert_eq!(lhs, cheap);
        assert_eq!(rhs, dear);
    }

    #[test]
    fn impure_elements_pin_their_position() {
        let mut arena = ExprArena::new();
        let dear = pure_leaf(&mut arena, STAT_COST, 0.5);
        let action = impure_leaf(&mut arena);
        let cheap = pure_leaf(&mut arena, FAST_COST, 0.5);
        let left = arena.raw_binary(BinaryOp::And, dear, action, (0, 0));
        let root = arena.raw_binary(BinaryOp::And, left, cheap, (0, 0));
        let root = optimize(&mut arena, root, 3, false, &[]);
        // The action is a barrier: `dear` may not move past it.
        let ExprKind::And(lhs, rhs) = arena.get(root).kind else {
            panic!("chain collapsed unexpectedly");
        };
        assert_eq!(rhs, cheap);
        let ExprKind::And(first, second) = arena.get(lhs).kind else {
            panic!("left side should stay an and");
        };
        assert_eq!(first, dear);
        assert_eq!(second, action);
    }

    #[test]
    fn optimizing_twice_reaches_a_fixed_point() {
        let mut arena = ExprArena::new();
        let a = pure_leaf(&mut arena, STAT_COST, 0.9);
        let b = pure_leaf(&mut arena, FAST_COST, 0.1);
        let action = impure_leaf(&mut arena);
        let not_a = arena.raw_not(a, (0, 0));
        let inner = arena.raw_binary(BinaryOp::Or, not_a, b, (0, 0));
        let root = arena.raw_binary(BinaryOp::And, inner, action, (0, 0));
        let once = optimize(&mut arena, root, 3, false, &[]);
        let twice = optimize(&mut arena, once, 3, false, &[]);
        assert!(arena.same_shape(once, twice));
    }

    #[test]
    fn level_four_elides_pure_expressions() {
        let mut arena = ExprArena::new();
        let a = pure_leaf(&mut arena, FAST_COST, 0.5);
        let b = pure_leaf(&mut arena, FAST_COST, 0.5);
        let root = new_and(&mut arena, a, b, (0, 0), 4);
        let root = optimize(&mut arena, root, 4, false, &[]);
        assert_eq!(root, arena.false_id());

        // An impure tree survives.
        let action = impure_leaf(&mut arena);
        let root = optimize(&mut arena, action, 4, false, &[]);
        assert_eq!(root, action);
    }

    #[test]
    fn annotations_stay_within_bounds_after_rewrites() {
        let mut arena = ExprArena::new();
        let mut root = pure_leaf(&mut arena, FAST_COST, 0.3);
        for i in 0..10 {
            let leaf = pure_leaf(&mut arena, FAST_COST * (i as f64 + 1.0), 0.1 * i as f64);
            root = if i % 2 == 0 {
                new_and(&mut arena, root, leaf, (0, 0), 3)
            } else {
                new_or(&mut arena, root, leaf, (0, 0), 3)
            };
        }
        let root = optimize(&mut arena, root, 3, false, &[]);
        fn check(arena: &ExprArena, id: ExprId) {
            let node = arena.get(id);
            assert!(node.cost >= 0.0);
            assert!((0.0..=1.0).contains(&node.prob));
            match node.kind {
                ExprKind::Not(c) => check(arena, c),
                ExprKind::And(l, r) | ExprKind::Or(l, r) | ExprKind::Comma(l, r) => {
                    assert!(node.cost >= arena.get(l).cost.max(0.0));
                    check(arena, l);
                    check(arena, r);
                }
                _ => {}
            }
        }
        check(&arena, root);
    }
}
