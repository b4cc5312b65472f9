//! Optimizer passes run on the finalized trace before register allocation
//! (spec.md §4.4), in the fixed order it specifies.
//!
//! Grounded on `trax_tracing.py`'s `TraceCompiler.optimize` and its six
//! constituent passes (`remove_redundant_guards`, `dead_value_elimination`,
//! `optimize_constant_guards`, `remove_trivial_guards`, `optimize_guards`,
//! `unroll_and_lift`), generalized in two places the original only
//! partially implemented (noted inline and in DESIGN.md): trivial-guard
//! elimination tracks *every* guard kind's implied type fact, not just
//! `GuardInt`/`GuardTrue`/`GuardNil`, and the type-fact map is threaded
//! from the preamble into the body's second pass rather than rebuilt from
//! scratch (needed for "using the type facts learned during the preamble",
//! spec.md §4.4 pass 6, to have any effect).

use crate::ir::{BoolBinOp, Guard, GuardKind, IrGraph, IrNode, NodeId, Trace};
use crate::liveness;
use crate::value::{TYPE_BOOL, TYPE_INT, TYPE_NIL};
use std::collections::HashMap;

/// Run every pass, in spec.md §4.4 order.
pub fn optimize(trace: &mut Trace) {
    let before = trace.order.len();
    remove_redundant_guards(trace);
    dead_value_elimination(trace);
    optimize_constant_guards(trace);
    remove_trivial_guards(trace);
    strengthen_guards(trace);
    unroll_and_peel(trace);
    tracing::debug!(
        before,
        preamble = trace.preamble.len(),
        body = trace.body.len(),
        "optimizer finished"
    );
}

/// Pass 1: keep the first guard seen for each `(kind, operand)` pair, drop
/// identical later guards (spec.md §4.4 #1; safe because guards only
/// narrow the type).
fn remove_redundant_guards(trace: &mut Trace) {
    let order = std::mem::take(&mut trace.order);
    let (kept, _) = redundant_guard_pass(&trace.graph, &order, HashMap::new());
    trace.order = kept;
}

fn redundant_guard_pass(
    graph: &IrGraph,
    order: &[NodeId],
    mut seen: HashMap<(GuardKind, NodeId), u32>,
) -> (Vec<NodeId>, HashMap<(GuardKind, NodeId), u32>) {
    let mut kept = Vec::with_capacity(order.len());
    for &id in order {
        if let IrNode::Guard(g) = graph.get(id) {
            let key = (g.kind, g.operand);
            if seen.contains_key(&key) {
                continue;
            }
            seen.insert(key, g.guard_id);
        }
        kept.push(id);
    }
    (kept, seen)
}

/// Pass 2: drop value instructions whose live range is a single point (no
/// consumer). Effects (`SetField`, `SetVar`, guards) are never dropped
/// (spec.md §4.4 #2).
fn dead_value_elimination(trace: &mut Trace) {
    let order = std::mem::take(&mut trace.order);
    let live = liveness::ranges(&trace.graph, &order);
    let kept = order
        .into_iter()
        .filter(|id| {
            let node = trace.graph.get(*id);
            if node.is_value() {
                let (start, end) = live[id];
                start != end
            } else {
                true
            }
        })
        .collect();
    trace.order = kept;
}

/// Pass 3: fold guards whose operand is already a constant. Guaranteed
/// passes are deleted; guaranteed failures are retained (the trace really
/// will always side-exit there) with a warning (spec.md §4.4 #3).
fn optimize_constant_guards(trace: &mut Trace) {
    let order = std::mem::take(&mut trace.order);
    let mut kept = Vec::with_capacity(order.len());
    for id in order {
        if let IrNode::Guard(g) = trace.graph.get(id) {
            if !g.kind.is_binary() {
                if let IrNode::Constant { value, .. } = trace.graph.get(g.operand) {
                    if g.kind.check(*value, None) {
                        continue; // guaranteed to pass, drop the guard
                    }
                    tracing::warn!(guard_id = g.guard_id, kind = %g.kind, "guard on constant is guaranteed to fail");
                }
            }
        }
        kept.push(id);
    }
    trace.order = kept;
}

/// The type fact this guard kind establishes about its operand once it has
/// passed, if any (used by [`trivial_guard_pass`]).
fn implied_type(kind: GuardKind) -> Option<u32> {
    match kind {
        GuardKind::Int => Some(TYPE_INT),
        GuardKind::Nil => Some(TYPE_NIL),
        GuardKind::Bool | GuardKind::True | GuardKind::False => Some(TYPE_BOOL),
        GuardKind::Index(t) => Some(t),
        GuardKind::Lt | GuardKind::Le | GuardKind::Gt | GuardKind::Ge | GuardKind::Eq | GuardKind::Ne => None,
    }
}

/// Pass 4: propagate a per-value known-type map; drop any guard whose
/// operand is already known to satisfy it (spec.md §4.4 #4). Generalized
/// over every guard kind (see module docs) rather than just the three the
/// original prototype covered.
fn remove_trivial_guards(trace: &mut Trace) {
    let order = std::mem::take(&mut trace.order);
    let (kept, _, _) = trivial_guard_pass(&trace.graph, &order, HashMap::new(), HashMap::new());
    trace.order = kept;
}

/// `known_truthiness[v] == Some(true)` once a `GuardTrue(v)` has passed,
/// `Some(false)` once a `GuardFalse(v)` has passed — kept separate from a
/// type fact because "known boolean" and "known which boolean" are
/// different things (a stale `True` fact must never make a later
/// `GuardFalse` look trivially satisfied).
fn trivial_guard_pass(
    graph: &IrGraph,
    order: &[NodeId],
    mut known_type: HashMap<NodeId, u32>,
    mut known_truthiness: HashMap<NodeId, bool>,
) -> (Vec<NodeId>, HashMap<NodeId, u32>, HashMap<NodeId, bool>) {
    let mut kept = Vec::with_capacity(order.len());
    for &id in order {
        let node = graph.get(id);
        let mut drop_guard = false;

        if let IrNode::Guard(g) = node {
            if g.kind == GuardKind::True || g.kind == GuardKind::False {
                let wants = g.kind == GuardKind::True;
                if known_truthiness.get(&g.operand) == Some(&wants) {
                    drop_guard = true;
                } else {
                    known_truthiness.insert(g.operand, wants);
                }
            } else if let Some(needed) = implied_type(g.kind) {
                if known_type.get(&g.operand) == Some(&needed) {
                    drop_guard = true;
                }
            }
            if !drop_guard {
                if let Some(t) = implied_type(g.kind) {
                    known_type.insert(g.operand, t);
                }
            }
        }

        if let Some(t) = node.static_type() {
            known_type.insert(id, t);
        }

        if !drop_guard {
            kept.push(id);
        }
    }
    (kept, known_type, known_truthiness)
}

fn strengthened_kind(op: BoolBinOp) -> Option<GuardKind> {
    match op {
        BoolBinOp::Eq => Some(GuardKind::Eq),
        BoolBinOp::Ne => Some(GuardKind::Ne),
        BoolBinOp::Lt => Some(GuardKind::Lt),
        BoolBinOp::Gt => Some(GuardKind::Gt),
        BoolBinOp::Le => Some(GuardKind::Le),
        BoolBinOp::Ge => Some(GuardKind::Ge),
        BoolBinOp::And | BoolBinOp::Or => None,
    }
}

/// Pass 5: `v = cmp(a, b); GuardTrue(v)` with `v` dead after the guard
/// becomes the single compound guard `GuardLT/GE/...(a, b)`, inheriting
/// the original guard's id and `values_to_keep` (spec.md §4.4 #5).
fn strengthen_guards(trace: &mut Trace) {
    let order = std::mem::take(&mut trace.order);
    let live = liveness::ranges(&trace.graph, &order);
    let mut kept = Vec::with_capacity(order.len());
    let mut i = 0;
    while i < order.len() {
        let id = order[i];
        if let IrNode::BinaryBool { op, lhs, rhs } = trace.graph.get(id).clone() {
            if i + 1 < order.len() {
                let next_id = order[i + 1];
                let next = trace.graph.get(next_id).clone();
                if let IrNode::Guard(g) = next {
                    let unused_elsewhere = live[&id].1 <= i + 1;
                    if g.kind == GuardKind::True && g.operand == id && unused_elsewhere {
                        if let Some(kind) = strengthened_kind(op) {
                            let new_id = trace.graph.push_node(IrNode::Guard(Guard {
                                kind,
                                guard_id: g.guard_id,
                                operand: lhs,
                                right: Some(rhs),
                                values_to_keep: g.values_to_keep.clone(),
                            }));
                            kept.push(new_id);
                            i += 2;
                            continue;
                        }
                    }
                }
            }
        }
        kept.push(id);
        i += 1;
    }
    trace.order = kept;
}

/// Pass 6: split the (now fully optimized) flat instruction list into a
/// preamble (run once) and a body (the hot loop), cloning every
/// non-`Input`/non-`Constant` instruction with operands remapped through a
/// preamble→body map; `Input`s are left pointing at themselves (their
/// value lives in a register carried across the back-edge) and their
/// `phi` is retargeted to the body's redefinition, then the body is
/// reanalyzed with the type facts the preamble walk established (spec.md
/// §4.4 #6).
fn unroll_and_peel(trace: &mut Trace) {
    let preamble = trace.order.clone();

    let mut phi_targets: HashMap<NodeId, NodeId> = HashMap::new();
    for &id in &preamble {
        if let IrNode::Input { phi: Some(target), .. } = trace.graph.get(id) {
            phi_targets.insert(*target, id);
        }
    }

    let (_, known_type, known_truthiness) = trivial_guard_pass(&trace.graph, &preamble, HashMap::new(), HashMap::new());

    let mut preamble_to_body: HashMap<NodeId, NodeId> = HashMap::new();
    let mut body: Vec<NodeId> = Vec::with_capacity(preamble.len());

    for &id in &preamble {
        let node = trace.graph.get(id).clone();
        if matches!(node, IrNode::Input { .. } | IrNode::Constant { .. }) {
            preamble_to_body.insert(id, id);
            continue;
        }

        let remapped = node.remapped(|operand| preamble_to_body[&operand]);
        let new_id = trace.graph.push_node(remapped);

        if let Some(&input_id) = phi_targets.get(&id) {
            if let IrNode::Input { phi, .. } = trace.graph.get_mut(input_id) {
                *phi = Some(new_id);
            }
        }

        preamble_to_body.insert(id, new_id);
        body.push(new_id);
    }

    let (body, _, _) = trivial_guard_pass(&trace.graph, &body, known_type, known_truthiness);
    // Trivial-guard facts learned from the preamble can also leave two
    // identical guards adjacent in the body (one carried over, one newly
    // trivial); sweep those with the same redundant-guard pass as pass 1.
    let (body, _) = redundant_guard_pass(&trace.graph, &body, HashMap::new());

    trace.preamble = preamble;
    trace.body = body;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IntBinOp;
    use crate::value::Value;

    fn push_guard(trace: &mut Trace, kind: GuardKind, operand: NodeId) -> NodeId {
        let id = trace.graph.guard(kind, trace.order.len() as u32, operand, None, vec![]);
        trace.push(id);
        id
    }

    #[test]
    fn redundant_guards_collapse() {
        let mut trace = Trace::new();
        let a = trace.graph.input(0);
        trace.push(a);
        push_guard(&mut trace, GuardKind::Int, a);
        push_guard(&mut trace, GuardKind::Int, a);
        remove_redundant_guards(&mut trace);
        let guard_count = trace.order.iter().filter(|id| trace.graph.get(**id).is_guard()).count();
        assert_eq!(guard_count, 1);
    }

    #[test]
    fn dead_values_are_dropped() {
        let mut trace = Trace::new();
        let a = trace.graph.input(0);
        trace.push(a);
        let b = trace.graph.constant(Value::from_int(1));
        trace.push(b);
        // `b` is never used by anything -> single-point live range -> dead.
        dead_value_elimination(&mut trace);
        assert!(trace.order.contains(&a));
        assert!(!trace.order.contains(&b));
    }

    #[test]
    fn constant_guard_guaranteed_pass_is_removed() {
        let mut trace = Trace::new();
        let c = trace.graph.constant(Value::from_int(1));
        trace.push(c);
        push_guard(&mut trace, GuardKind::Int, c);
        optimize_constant_guards(&mut trace);
        assert!(!trace.order.iter().any(|id| trace.graph.get(*id).is_guard()));
    }

    #[test]
    fn constant_guard_guaranteed_fail_is_kept() {
        let mut trace = Trace::new();
        let c = trace.graph.constant(Value::NIL);
        trace.push(c);
        push_guard(&mut trace, GuardKind::Int, c);
        optimize_constant_guards(&mut trace);
        assert!(trace.order.iter().any(|id| trace.graph.get(*id).is_guard()));
    }

    #[test]
    fn trivial_guard_dropped_after_same_kind_seen() {
        let mut trace = Trace::new();
        let a = trace.graph.input(0);
        trace.push(a);
        push_guard(&mut trace, GuardKind::Int, a);
        push_guard(&mut trace, GuardKind::Int, a);
        remove_trivial_guards(&mut trace);
        let guard_count = trace.order.iter().filter(|id| trace.graph.get(**id).is_guard()).count();
        assert_eq!(guard_count, 1);
    }

    #[test]
    fn strengthening_folds_cmp_and_guard_true() {
        let mut trace = Trace::new();
        let a = trace.graph.input(0);
        trace.push(a);
        let b = trace.graph.input(1);
        trace.push(b);
        let cmp = trace.graph.binary_bool(BoolBinOp::Lt, a, b);
        trace.push(cmp);
        push_guard(&mut trace, GuardKind::True, cmp);
        strengthen_guards(&mut trace);
        assert_eq!(trace.order.len(), 3); // a, b, GuardLT(a, b)
        let last = *trace.order.last().unwrap();
        match trace.graph.get(last) {
            IrNode::Guard(g) => {
                assert_eq!(g.kind, GuardKind::Lt);
                assert_eq!(g.operand, a);
                assert_eq!(g.right, Some(b));
            }
            _ => panic!("expected a strengthened guard"),
        }
    }

    #[test]
    fn unroll_and_peel_produces_preamble_and_body() {
        let mut trace = Trace::new();
        let input = trace.graph.input(0);
        trace.push(input);
        let one = trace.graph.constant(Value::from_int(1));
        trace.push(one);
        let sum = trace.graph.binary_int(IntBinOp::Add, input, one);
        trace.push(sum);
        if let IrNode::Input { phi, .. } = trace.graph.get_mut(input) {
            *phi = Some(sum);
        }
        unroll_and_peel(&mut trace);
        assert_eq!(trace.preamble.len(), 3);
        // body clones `sum` (Input/Constant are shared, not cloned).
        assert_eq!(trace.body.len(), 1);
        let body_sum = trace.body[0];
        assert_ne!(body_sum, sum);
        if let IrNode::Input { phi, .. } = trace.graph.get(input) {
            assert_eq!(*phi, Some(body_sum));
        } else {
            panic!("expected Input");
        }
    }
}
