//! Linear-scan register allocation over the finalized instruction list
//! (spec.md §4.5 "Linear scan", "Caller-save tracking").
//!
//! Grounded on `trax_tracing.py`'s `allocate_registers`: a single forward
//! scan that frees a value's register the instant its live range ends and
//! assigns the first free candidate register to each newly defined value.
//! Spilling is explicitly out of scope (spec.md §4.5, §9) — exhaustion is
//! a [`CodegenError::OutOfRegisters`].

use crate::error::{CodegenError, CodegenResult};
use crate::ir::{IrGraph, NodeId};
use crate::liveness;
use std::collections::{BTreeSet, HashMap, HashSet};

/// The ordered candidate general-purpose register pool, plus which of
/// those are callee-save per the AArch64 procedure call standard
/// (x19-x28, and x8 for this ABI's indirect-result-like usage).
///
/// Grounded on `trax_backend.py`'s `allowed_registers` list and the
/// callee-save subset it intersects against.
#[derive(Debug, Clone)]
pub struct RegisterPool {
    pub candidates: Vec<u8>,
    pub callee_save: BTreeSet<u8>,
}

impl RegisterPool {
    /// The pool `trax_backend.py` uses: caller-save scratch registers
    /// first (cheaper to use, nothing to save), then the callee-save
    /// x19-x28 (plus x8), to be reached for only when pressure demands it.
    pub fn aarch64_default() -> Self {
        RegisterPool {
            candidates: vec![3, 4, 5, 6, 7, 9, 10, 11, 12, 13, 14, 15, 8, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28],
            callee_save: [8, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28].into_iter().collect(),
        }
    }
}

/// The result of register allocation: a register per value-producing
/// node, plus the deduplicated, sorted set of callee-save registers that
/// ended up in use (codegen spills/restores exactly these at the
/// prologue/epilogue).
#[derive(Debug, Default)]
pub struct Allocation {
    pub assignment: HashMap<NodeId, u8>,
    pub used_callee_save: Vec<u8>,
}

impl Allocation {
    pub fn reg(&self, id: NodeId) -> u8 {
        self.assignment[&id]
    }
}

/// Allocate registers for `instructions` (preamble ++ body, per spec.md
/// §4.6 "Compile the preamble first").
pub fn allocate(graph: &IrGraph, instructions: &[NodeId], pool: &RegisterPool) -> CodegenResult<Allocation> {
    let live = liveness::ranges(graph, instructions);
    let mut assignment: HashMap<NodeId, u8> = HashMap::new();
    let mut used_registers: HashSet<u8> = HashSet::new();

    for (idx, &id) in instructions.iter().enumerate() {
        let node = graph.get(id);

        for operand in node.operands() {
            if let Some(&(_, end)) = live.get(&operand) {
                if end == idx {
                    if let Some(reg) = assignment.get(&operand) {
                        used_registers.remove(reg);
                    }
                }
            }
        }

        if node.is_value() {
            let reg = pool
                .candidates
                .iter()
                .copied()
                .find(|r| !used_registers.contains(r))
                .ok_or(CodegenError::OutOfRegisters)?;
            assignment.insert(id, reg);
            used_registers.insert(reg);
        }
    }

    let mut used_callee_save: Vec<u8> = assignment
        .values()
        .copied()
        .filter(|r| pool.callee_save.contains(r))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    used_callee_save.sort_unstable();

    Ok(Allocation { assignment, used_callee_save })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IntBinOp;
    use crate::value::Value;

    #[test]
    fn reuses_register_after_last_use() {
        let mut g = IrGraph::new();
        let a = g.input(0); // live 0..1
        let b = g.input(1); // live 1..2
        let add = g.binary_int(IntBinOp::Add, a, b); // defined at 2
        let order = vec![a, b, add];
        let pool = RegisterPool {
            candidates: vec![0, 1],
            callee_save: BTreeSet::new(),
        };
        let alloc = allocate(&g, &order, &pool).unwrap();
        assert_ne!(alloc.reg(a), alloc.reg(b));
        // `a`'s register frees at idx 2 (its last use), so `add` may reuse it.
        assert!(alloc.reg(add) == alloc.reg(a) || alloc.reg(add) == alloc.reg(b));
    }

    #[test]
    fn exhausting_pool_errors() {
        let mut g = IrGraph::new();
        let a = g.input(0);
        let b = g.input(1);
        let c = g.constant(Value::from_int(1));
        let order = vec![a, b, c];
        let pool = RegisterPool {
            candidates: vec![0],
            callee_save: BTreeSet::new(),
        };
        assert_eq!(allocate(&g, &order, &pool).unwrap_err(), CodegenError::OutOfRegisters);
    }
}
