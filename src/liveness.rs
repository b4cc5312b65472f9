//! Liveness ranges over a finalized trace instruction list (spec.md §4.5
//! "Liveness").
//!
//! Grounded on `trax_tracing.py`'s `get_liveness_ranges`: a single forward
//! scan recording `(first_def, last_use)` per value, with phi'd `Input`s
//! kept live to the end of the instruction list so they survive the loop
//! back-edge.

use crate::ir::{IrGraph, IrNode, NodeId};
use std::collections::HashMap;

/// `(first_def, last_use)` indices into the instruction list passed to
/// [`ranges`].
pub type LiveRange = (usize, usize);

/// Compute liveness ranges for every value-producing node in
/// `instructions` (a finalized, linear order — typically
/// `Trace::final_instructions()`).
pub fn ranges(graph: &IrGraph, instructions: &[NodeId]) -> HashMap<NodeId, LiveRange> {
    let mut liveness: HashMap<NodeId, LiveRange> = HashMap::new();
    let mut phi_nodes: HashMap<NodeId, NodeId> = HashMap::new();

    let mut touch = |liveness: &mut HashMap<NodeId, LiveRange>, value: NodeId, idx: usize| {
        if let Some((start, end)) = liveness.get_mut(&value) {
            *end = (*end).max(idx);
        } else {
            // An operand should always have been defined earlier in a
            // well-formed SSA trace; tolerate a missing entry by treating
            // this use as the definition point too, rather than panicking.
            liveness.insert(value, (idx, idx));
        }
    };

    for (idx, &id) in instructions.iter().enumerate() {
        let node = graph.get(id);

        if node.is_value() {
            liveness.insert(id, (idx, idx));
        }

        if let IrNode::Input { phi: Some(phi), .. } = node {
            phi_nodes.insert(*phi, id);
        }

        if phi_nodes.contains_key(&id) {
            let start = liveness.get(&id).map(|r| r.0).unwrap_or(idx);
            liveness.insert(id, (start, instructions.len()));
        }

        for operand in node.operands() {
            touch(&mut liveness, operand, idx);
        }
    }

    liveness
}
