//! IR-to-AArch64 lowering and whole-trace compilation (spec.md §4.6).
//!
//! Grounded on `trax_backend.py`'s `TraceCompiler.compile_trace`/
//! `_compile_instruction`: compile the preamble, bind a label at the
//! body's first instruction, compile the body, close the loop with phi
//! `MOV`s and a backward branch, then emit one exit block per guard that
//! was actually reached, ending in a shared epilogue. The lowering table
//! in spec.md §4.6 is called out there as "representative, not
//! exhaustive"; this module covers every [`IntBinOp`]/[`BoolBinOp`]/
//! [`UnaryOp`]/[`GuardKind`] variant, filling the gaps the Python
//! original left implicit.

use super::asm::{Assembler, Cond};
use super::reloc::LabelId;
use crate::error::{CodegenError, CodegenResult};
use crate::guard::ExitTable;
use crate::ir::{BoolBinOp, Guard, GuardKind, IntBinOp, IrGraph, IrNode, NodeId, Trace, UnaryOp};
use crate::regalloc::{self, Allocation, RegisterPool};
use crate::value::{BOOL_CHECK_MASK, FALSE_TAG, NIL_TAG, OBJECT_TAG, TRUE_TAG};
use std::collections::HashMap;

/// Fixed ABI registers (spec.md §4.6 "Calling convention"). Never handed
/// out by [`regalloc`] — its candidate pool starts at `x3`.
const REG_INPUTS: u8 = 0;
const REG_CONSTS: u8 = 1;
const REG_EXITBUF: u8 = 2;
const REG_SP: u8 = 31;

/// Scratch registers for multi-instruction lowerings (detag/retag
/// sequences, boolean materialization, the `New` call sequence). Chosen
/// outside both the ABI registers and [`RegisterPool::aarch64_default`]'s
/// candidates (x16/x17 are the AArch64 PCS's own intra-procedure-call
/// scratch registers; x18 is borrowed for the same purpose here since this
/// is a private calling convention, not one that must honor the platform
/// register).
const SCRATCH1: u8 = 16;
const SCRATCH2: u8 = 17;
const SCRATCH3: u8 = 18;

/// Mask-immediate parameters for `ANDS`/`AND` (immediate) encoding
/// `(immr, imms)` under N=1 (64-bit element). See `asm::Assembler::ands_imm`.
const MASK_BIT0: (u8, u8) = (0, 0); // value 1      — integer tag test
const MASK_LOW2: (u8, u8) = (0, 1); // value 0b11   — BOOL_CHECK_MASK
const MASK_LOW3: (u8, u8) = (0, 2); // value 0b111  — TAG_MASK
/// `!0b111` (clear the low 3 tag bits, keep the rest): a 61-bit run
/// starting at bit 3, which as a rotated bitmask immediate is `immr=61,
/// imms=60` (rotating `ones(61)` right by 61 places its low 3 bits, which
/// were already 1, at the top — equivalently a left shift by 3 that fits
/// exactly in 64 bits with no wraparound).
const MASK_PTR: (u8, u8) = (61, 60);

/// The output of [`compile_trace`]: raw AArch64 machine code plus the
/// per-trace constant table (with its trailing allocator-address slot)
/// ready to be installed by [`crate::exec_memory`].
#[derive(Debug)]
pub struct CompiledTrace {
    pub code: Vec<u8>,
    pub consts: Vec<i64>,
    pub used_callee_save: Vec<u8>,
}

/// Per-trace constant table: each distinct [`crate::value::Value`]
/// appearing as an `IrNode::Constant` gets one deduplicated slot; a
/// trailing slot holds the allocator trampoline's address (spec.md §6
/// "Constant table layout").
fn build_const_table(graph: &IrGraph, instructions: &[NodeId], alloc_fn_ptr: *const ()) -> (Vec<i64>, HashMap<NodeId, u32>) {
    let mut consts = Vec::new();
    let mut by_raw: HashMap<i64, u32> = HashMap::new();
    let mut node_slot = HashMap::new();

    for &id in instructions {
        if let IrNode::Constant { value, .. } = graph.get(id) {
            let raw = value.raw();
            let slot = *by_raw.entry(raw).or_insert_with(|| {
                let idx = consts.len() as u32;
                consts.push(raw);
                idx
            });
            node_slot.insert(id, slot);
        }
    }

    consts.push(alloc_fn_ptr as i64);
    (consts, node_slot)
}

/// `GetVar(frame_idx, var_idx)` has no memory location of its own: a
/// local's value is whatever `NodeId` the recorder already tracked for it,
/// so in practice the recorder resolves reads to an existing value and
/// rarely emits fresh `GetVar` nodes. When one does reach codegen (a local
/// read before anything else defined it), treat it exactly like an
/// `Input`: the driver appends one inputs-buffer slot per distinct
/// `GetVar` site, in first-occurrence order, right after the slots used by
/// recorded `Input` nodes. `SetVar` is the effect counterpart and needs no
/// native lowering at all — its only consumer is a guard's reconstructed
/// `FrameShape`, which names `NodeId`s directly rather than reading back
/// through any buffer.
fn build_input_layout(graph: &IrGraph, instructions: &[NodeId]) -> (u32, HashMap<NodeId, u32>) {
    let mut max_index: Option<u32> = None;
    for &id in instructions {
        if let IrNode::Input { index, .. } = graph.get(id) {
            max_index = Some(max_index.map_or(*index, |m| m.max(*index)));
        }
    }
    let n_real_inputs = max_index.map_or(0, |m| m + 1);

    let mut getvar_slot = HashMap::new();
    let mut next = n_real_inputs;
    for &id in instructions {
        if let IrNode::GetVar { .. } = graph.get(id) {
            getvar_slot.entry(id).or_insert_with(|| {
                let slot = next;
                next += 1;
                slot
            });
        }
    }
    (n_real_inputs, getvar_slot)
}

fn extract_int(asm: &mut Assembler, dst: u8, src: u8) {
    asm.mov_imm(SCRATCH3, 1);
    asm.asrv(dst, src, SCRATCH3);
}

fn retag_int(asm: &mut Assembler, dst: u8, src: u8) {
    asm.mov_imm(SCRATCH3, 1);
    asm.lslv(dst, src, SCRATCH3);
}

/// Adjusts a `SDIV`-truncated quotient/remainder pair down to floor
/// semantics (round toward -infinity, remainder takes the divisor's
/// sign), matching `trax_tracing.py`'s `DivInstruction`/
/// `ModInstruction.interp()` (Python `//`/`%`) rather than `SDIV`'s
/// round-toward-zero. `q` holds the truncating quotient on entry and the
/// floor quotient on exit; `r` holds the dividend on entry (`a`) and the
/// floor remainder on exit; `b` is the divisor; `tmp` is clobbered and
/// must differ from `q`, `r`, and `b`.
fn lower_floor_divmod(asm: &mut Assembler, q: u8, r: u8, b: u8, tmp: u8) {
    asm.msub(r, q, b, r); // r = a - q*b, the truncating remainder
    let skip = asm.new_label();
    asm.cmp_imm(r, 0);
    asm.b_cond(Cond::Eq, skip);
    asm.eor(tmp, r, b);
    asm.cmp_imm(tmp, 0);
    asm.b_cond(Cond::Ge, skip);
    asm.sub_imm(q, q, 1);
    asm.add(r, r, b);
    asm.bind_label(skip);
}

/// Lower a [`IntBinOp`] (spec.md §3 "Binary ints"). Where raw tagged
/// words can be combined directly (`Add`/`Sub` distribute over the
/// shared `<<1` tag; `BAnd`/`BOr`/`BXor` are bitwise and so do too; `Shl`
/// shifting the whole tagged word by the extracted shift amount lands the
/// tag bit back in the right place for free), no detag/retag round trip
/// is needed. `Mul`/`Div`/`Mod`/`Shr`/`Asr` extract both operands first.
fn lower_int_binop(asm: &mut Assembler, op: IntBinOp, rd: u8, lhs: u8, rhs: u8) {
    match op {
        IntBinOp::Add => asm.add(rd, lhs, rhs),
        IntBinOp::Sub => asm.sub(rd, lhs, rhs),
        IntBinOp::BAnd => asm.and_reg(rd, lhs, rhs),
        IntBinOp::BOr => asm.orr_reg(rd, lhs, rhs),
        IntBinOp::BXor => asm.eor(rd, lhs, rhs),
        IntBinOp::Max => {
            asm.cmp(lhs, rhs);
            asm.csel(rd, lhs, rhs, Cond::Gt);
        }
        IntBinOp::Min => {
            asm.cmp(lhs, rhs);
            asm.csel(rd, lhs, rhs, Cond::Lt);
        }
        IntBinOp::Shl => {
            asm.mov_imm(SCRATCH3, 1);
            asm.asrv(SCRATCH1, rhs, SCRATCH3); // SCRATCH1 = shift amount
            asm.lslv(rd, lhs, SCRATCH1); // raw_lhs << amount == tagged(a << amount)
        }
        IntBinOp::Mul => {
            extract_int(asm, SCRATCH1, lhs);
            asm.mov_imm(SCRATCH3, 1);
            asm.asrv(SCRATCH2, rhs, SCRATCH3);
            asm.mul(SCRATCH1, SCRATCH1, SCRATCH2);
            retag_int(asm, rd, SCRATCH1);
        }
        IntBinOp::Div => {
            extract_int(asm, SCRATCH1, lhs);
            asm.mov_imm(SCRATCH3, 1);
            asm.asrv(SCRATCH2, rhs, SCRATCH3);
            asm.sdiv(rd, SCRATCH1, SCRATCH2); // rd = trunc(a/b)
            lower_floor_divmod(asm, rd, SCRATCH1, SCRATCH2, SCRATCH3);
            retag_int(asm, rd, rd);
        }
        IntBinOp::Mod => {
            extract_int(asm, SCRATCH1, lhs);
            asm.mov_imm(SCRATCH3, 1);
            asm.asrv(SCRATCH2, rhs, SCRATCH3);
            asm.sdiv(SCRATCH3, SCRATCH1, SCRATCH2); // SCRATCH3 = trunc(a/b)
            lower_floor_divmod(asm, SCRATCH3, SCRATCH1, SCRATCH2, rd);
            retag_int(asm, rd, SCRATCH1);
        }
        IntBinOp::Shr => {
            extract_int(asm, SCRATCH1, lhs);
            asm.mov_imm(SCRATCH3, 1);
            asm.asrv(SCRATCH2, rhs, SCRATCH3);
            asm.lsrv(SCRATCH1, SCRATCH1, SCRATCH2);
            asm.lslv(rd, SCRATCH1, SCRATCH3);
        }
        IntBinOp::Asr => {
            extract_int(asm, SCRATCH1, lhs);
            asm.mov_imm(SCRATCH3, 1);
            asm.asrv(SCRATCH2, rhs, SCRATCH3);
            asm.asrv(SCRATCH1, SCRATCH1, SCRATCH2);
            asm.lslv(rd, SCRATCH1, SCRATCH3);
        }
    }
}

/// Lower a [`BoolBinOp`] (spec.md §3 "Binary bools"). `And`/`Or` work
/// directly on the tag encoding (`true=0b111`, `false=0b011` share their
/// low two bits, so bitwise AND/OR over the two full tags already
/// computes the right truth table); comparisons go through `CMP` +
/// `CSEL` against the two tag constants, matching the `Lt(a,b)` row of
/// spec.md §4.6's lowering table generalized to every comparison.
fn lower_bool_binop(asm: &mut Assembler, op: BoolBinOp, rd: u8, lhs: u8, rhs: u8) {
    match op {
        BoolBinOp::And => asm.and_reg(rd, lhs, rhs),
        BoolBinOp::Or => asm.orr_reg(rd, lhs, rhs),
        _ => {
            let cond = match op {
                BoolBinOp::Eq => Cond::Eq,
                BoolBinOp::Ne => Cond::Ne,
                BoolBinOp::Lt => Cond::Lt,
                BoolBinOp::Gt => Cond::Gt,
                BoolBinOp::Le => Cond::Le,
                BoolBinOp::Ge => Cond::Ge,
                BoolBinOp::And | BoolBinOp::Or => unreachable!(),
            };
            asm.mov_imm(SCRATCH1, TRUE_TAG as u16);
            asm.mov_imm(SCRATCH2, FALSE_TAG as u16);
            asm.cmp(lhs, rhs);
            asm.csel(rd, SCRATCH1, SCRATCH2, cond);
        }
    }
}

/// Lower a [`UnaryOp`] (spec.md §3 "Unary").
fn lower_unary(asm: &mut Assembler, op: UnaryOp, rd: u8, operand: u8) {
    match op {
        UnaryOp::Not => {
            // Toggle the tag's bit 2 (the only bit that differs between
            // `true=0b111` and `false=0b011`).
            asm.mov_imm(SCRATCH1, 0b100);
            asm.eor(rd, operand, SCRATCH1);
        }
        UnaryOp::BoolToInt => {
            asm.mov_imm(SCRATCH1, TRUE_TAG as u16);
            asm.cmp(operand, SCRATCH1);
            asm.mov_imm(SCRATCH1, 2); // from_int(1)
            asm.mov_imm(SCRATCH2, 0); // from_int(0)
            asm.csel(rd, SCRATCH1, SCRATCH2, Cond::Eq);
        }
        UnaryOp::IntToBool => {
            asm.mov_imm(SCRATCH1, TRUE_TAG as u16);
            asm.mov_imm(SCRATCH2, FALSE_TAG as u16);
            asm.cmp_imm(operand, 0);
            asm.csel(rd, SCRATCH1, SCRATCH2, Cond::Ne);
        }
        UnaryOp::BwNot => {
            extract_int(asm, SCRATCH1, operand);
            asm.mvn(SCRATCH1, SCRATCH1);
            retag_int(asm, rd, SCRATCH1);
        }
    }
}

/// Mask `src`'s tag bits off, leaving the 8-byte-aligned object pointer in
/// `dst` (spec.md §4.6 `GetField`/`SetField` rows).
fn mask_ptr(asm: &mut Assembler, dst: u8, src: u8) {
    let (immr, imms) = MASK_PTR;
    asm.ands_imm(dst, src, immr, imms);
}

/// Emit the check for one guard, branching to `exit` on failure (spec.md
/// §4.6 `GuardInt`/`GuardIndex`/`GuardNil`/.../`GuardLT/...` rows).
fn lower_guard_check(asm: &mut Assembler, alloc: &Allocation, guard: &Guard, exit: LabelId) {
    let operand = alloc.reg(guard.operand);
    match guard.kind {
        GuardKind::Int => {
            let (immr, imms) = MASK_BIT0;
            asm.ands_imm(SCRATCH1, operand, immr, imms);
            asm.b_cond(Cond::Ne, exit);
        }
        GuardKind::Bool => {
            let (immr, imms) = MASK_LOW2;
            asm.ands_imm(SCRATCH1, operand, immr, imms);
            asm.cmp_imm(SCRATCH1, BOOL_CHECK_MASK as u16);
            asm.b_cond(Cond::Ne, exit);
        }
        GuardKind::Nil | GuardKind::True | GuardKind::False => {
            let tag = match guard.kind {
                GuardKind::Nil => NIL_TAG,
                GuardKind::True => TRUE_TAG,
                GuardKind::False => FALSE_TAG,
                _ => unreachable!(),
            };
            let (immr, imms) = MASK_LOW3;
            asm.ands_imm(SCRATCH1, operand, immr, imms);
            asm.cmp_imm(SCRATCH1, tag as u16);
            asm.b_cond(Cond::Ne, exit);
        }
        GuardKind::Index(t) => {
            let (immr, imms) = MASK_LOW3;
            asm.ands_imm(SCRATCH1, operand, immr, imms);
            asm.cmp_imm(SCRATCH1, OBJECT_TAG as u16);
            asm.b_cond(Cond::Ne, exit);
            mask_ptr(asm, SCRATCH1, operand);
            asm.ldr(SCRATCH1, SCRATCH1, 0);
            asm.cmp_imm(SCRATCH1, t as u16);
            asm.b_cond(Cond::Ne, exit);
        }
        GuardKind::Lt | GuardKind::Le | GuardKind::Gt | GuardKind::Ge | GuardKind::Eq | GuardKind::Ne => {
            let right = alloc.reg(guard.right.expect("strengthened comparison guards always carry a right operand"));
            let cond = match guard.kind {
                GuardKind::Lt => Cond::Lt,
                GuardKind::Le => Cond::Le,
                GuardKind::Gt => Cond::Gt,
                GuardKind::Ge => Cond::Ge,
                GuardKind::Eq => Cond::Eq,
                GuardKind::Ne => Cond::Ne,
                _ => unreachable!(),
            };
            asm.cmp(operand, right);
            asm.b_cond(cond.inverse(), exit);
        }
    }
}

/// `New(type_index, n_fields)` (spec.md §6 "the `New` IR node calls this
/// via a pointer stored at the end of the constant table"): save the
/// three ABI pointer registers (the trampoline is an ordinary `extern
/// "C"` call and may clobber any caller-saved register), call through the
/// allocator address, write the header word, and tag the returned pointer
/// before restoring the saved registers.
///
/// Caller-saved values from [`RegisterPool`]'s scratch range that are
/// live across a `New` are not preserved by this sequence — matching the
/// Python backend's own `AppleSiliconBackend.new`, which makes the same
/// simplifying assumption that allocation sites are not register-pressure
/// hot spots.
fn lower_new(asm: &mut Assembler, rd: u8, type_index: u32, n_fields: u32, alloc_slot: u32) {
    const SAVE_FRAME: u16 = 48;
    asm.sub_imm(REG_SP, REG_SP, SAVE_FRAME);
    asm.str(REG_INPUTS, REG_SP, 0);
    asm.str(REG_CONSTS, REG_SP, 8);
    asm.str(REG_EXITBUF, REG_SP, 16);

    asm.ldr(SCRATCH1, REG_CONSTS, (alloc_slot * 8) as u16);
    asm.mov_imm(REG_INPUTS, (n_fields + 1) as u16); // argument: n_words
    asm.blr(SCRATCH1);
    asm.mov(SCRATCH2, REG_INPUTS); // raw pointer result, before X0 is restored

    asm.mov_imm(SCRATCH1, type_index as u16);
    asm.str(SCRATCH1, SCRATCH2, 0); // header word
    asm.mov_imm(SCRATCH1, OBJECT_TAG as u16);
    asm.orr_reg(rd, SCRATCH2, SCRATCH1);

    asm.ldr(REG_INPUTS, REG_SP, 0);
    asm.ldr(REG_CONSTS, REG_SP, 8);
    asm.ldr(REG_EXITBUF, REG_SP, 16);
    asm.add_imm(REG_SP, REG_SP, SAVE_FRAME);
}

/// Compile a closed [`Trace`] to machine code (spec.md §4.6 end to end).
///
/// `alloc_fn_ptr` is the object allocator's raw trampoline address
/// ([`crate::alloc_iface::ObjectAllocator::raw_fn_ptr`]), embedded as the
/// constant table's trailing slot.
pub fn compile_trace(trace: &Trace, alloc_fn_ptr: *const (), pool: &RegisterPool) -> CodegenResult<CompiledTrace> {
    let instructions = trace.final_instructions();
    let (consts, const_slot) = build_const_table(&trace.graph, &instructions, alloc_fn_ptr);
    let alloc_slot = (consts.len() - 1) as u32;
    let (_n_real_inputs, getvar_slot) = build_input_layout(&trace.graph, &instructions);
    let allocation = regalloc::allocate(&trace.graph, &instructions, pool)?;

    let mut asm = Assembler::new();
    let epilogue = asm.new_label();
    let mut exits: Vec<(LabelId, &Guard)> = Vec::new();

    let frame_size = if allocation.used_callee_save.is_empty() {
        0u16
    } else {
        (((allocation.used_callee_save.len() * 8) + 15) / 16 * 16) as u16
    };
    if frame_size > 0 {
        asm.sub_imm(REG_SP, REG_SP, frame_size);
        for (i, &r) in allocation.used_callee_save.iter().enumerate() {
            asm.str(r, REG_SP, (i * 8) as u16);
        }
    }

    let body_entry = if trace.body.is_empty() { None } else { Some(asm.new_label()) };
    let split = trace.preamble.len();

    for (idx, &id) in instructions.iter().enumerate() {
        if let Some(label) = body_entry {
            if idx == split {
                asm.bind_label(label);
            }
        }
        let node = trace.graph.get(id);
        match node {
            IrNode::Input { index, .. } => {
                asm.ldr(allocation.reg(id), REG_INPUTS, (*index as u16) * 8);
            }
            IrNode::Constant { .. } => {
                let slot = const_slot[&id];
                asm.ldr(allocation.reg(id), REG_CONSTS, (slot as u16) * 8);
            }
            IrNode::BinaryInt { op, lhs, rhs } => {
                lower_int_binop(&mut asm, *op, allocation.reg(id), allocation.reg(*lhs), allocation.reg(*rhs));
            }
            IrNode::BinaryBool { op, lhs, rhs } => {
                lower_bool_binop(&mut asm, *op, allocation.reg(id), allocation.reg(*lhs), allocation.reg(*rhs));
            }
            IrNode::Unary { op, operand } => {
                lower_unary(&mut asm, *op, allocation.reg(id), allocation.reg(*operand));
            }
            IrNode::GetField { obj, field_index } => {
                mask_ptr(&mut asm, SCRATCH1, allocation.reg(*obj));
                asm.ldr(allocation.reg(id), SCRATCH1, ((*field_index + 1) * 8) as u16);
            }
            IrNode::SetField { obj, field_index, value } => {
                mask_ptr(&mut asm, SCRATCH1, allocation.reg(*obj));
                asm.str(allocation.reg(*value), SCRATCH1, ((*field_index + 1) * 8) as u16);
            }
            IrNode::New { type_index, n_fields } => {
                lower_new(&mut asm, allocation.reg(id), *type_index, *n_fields, alloc_slot);
            }
            IrNode::GetVar { .. } => {
                let slot = getvar_slot[&id];
                asm.ldr(allocation.reg(id), REG_INPUTS, (slot as u16) * 8);
            }
            IrNode::SetVar { .. } => {
                // Effect only, consumed by the guard exit's FrameShape —
                // no native instruction corresponds to it.
            }
            IrNode::Guard(g) => {
                let exit_label = asm.new_label();
                lower_guard_check(&mut asm, &allocation, g, exit_label);
                exits.push((exit_label, g));
            }
        }
    }

    if let Some(entry) = body_entry {
        for &id in &trace.body {
            if let IrNode::Input { phi: Some(target), .. } = trace.graph.get(id) {
                let (input_reg, target_reg) = (allocation.reg(id), allocation.reg(*target));
                if input_reg != target_reg {
                    asm.mov(input_reg, target_reg);
                }
            }
        }
        asm.b(entry);
    }

    for (label, guard) in &exits {
        asm.bind_label(*label);
        for (i, value_id) in guard.values_to_keep.iter().enumerate() {
            asm.str(allocation.reg(*value_id), REG_EXITBUF, (i * 8) as u16);
        }
        asm.mov_imm(REG_INPUTS, guard.guard_id as u16);
        asm.b(epilogue);
    }

    asm.bind_label(epilogue);
    if frame_size > 0 {
        for (i, &r) in allocation.used_callee_save.iter().enumerate() {
            asm.ldr(r, REG_SP, (i * 8) as u16);
        }
        asm.add_imm(REG_SP, REG_SP, frame_size);
    }
    asm.ret();

    let code = asm.finish()?;
    Ok(CompiledTrace { code, consts, used_callee_save: allocation.used_callee_save })
}

/// The buffer size (in 64-bit words) a compiled trace's exit buffer must
/// provide, derived from its [`ExitTable`] (SPEC_FULL.md §5).
pub fn exit_buffer_words(exits: &ExitTable) -> usize {
    exits.buffer_len()
}

/// For each trailing `GetVar` inputs-buffer slot (the ones past the
/// recorded `Input`s), the `var_idx` of the bottom frame's local it reads
/// — `GetVar` nodes only ever reach codegen for the bottom/anchor frame
/// (see `Recorder::get_var`), so `frame_idx` is always 0 and only
/// `var_idx` matters to the driver when it packs the inputs buffer for a
/// native call (spec.md §6 "Native trace ABI").
pub fn getvar_layout(trace: &Trace) -> Vec<u32> {
    let instructions = trace.final_instructions();
    let mut seen = std::collections::HashSet::new();
    let mut layout = Vec::new();
    for &id in &instructions {
        if let IrNode::GetVar { var_idx, .. } = trace.graph.get(id) {
            if seen.insert(id) {
                layout.push(*var_idx);
            }
        }
    }
    layout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IntBinOp;
    use crate::value::Value;
    use rstest::rstest;

    fn trivial_alloc_ptr() -> *const () {
        std::ptr::null()
    }

    /// Every unary [`GuardKind`] (spec.md §4.6's lowering table) compiles
    /// to a check against a single operand plus an exit block, whatever
    /// tag or header comparison it lowers to.
    #[rstest]
    #[case::int(GuardKind::Int)]
    #[case::bool(GuardKind::Bool)]
    #[case::nil(GuardKind::Nil)]
    #[case::true_tag(GuardKind::True)]
    #[case::false_tag(GuardKind::False)]
    #[case::index(GuardKind::Index(3))]
    fn every_unary_guard_kind_lowers_to_a_tag_check(#[case] kind: GuardKind) {
        let mut trace = Trace::new();
        let a = trace.graph.input(0);
        let guard = trace.graph.guard(kind, 0, a, None, vec![a]);
        trace.push(a);
        trace.push(guard);

        let pool = RegisterPool::aarch64_default();
        let compiled = compile_trace(&trace, trivial_alloc_ptr(), &pool).unwrap();
        assert_eq!(compiled.code.len() % 4, 0);
        assert!(compiled.code.len() > 16, "{kind:?} should emit an entry check plus an exit block");
    }

    /// Every comparison [`GuardKind`] lowers to a `cmp` of its two
    /// operands and a branch on the condition's inverse.
    #[rstest]
    #[case::lt(GuardKind::Lt)]
    #[case::le(GuardKind::Le)]
    #[case::gt(GuardKind::Gt)]
    #[case::ge(GuardKind::Ge)]
    #[case::eq(GuardKind::Eq)]
    #[case::ne(GuardKind::Ne)]
    fn every_comparison_guard_kind_lowers_against_two_operands(#[case] kind: GuardKind) {
        let mut trace = Trace::new();
        let a = trace.graph.input(0);
        let b = trace.graph.input(1);
        trace.push(a);
        trace.push(b);
        let guard = trace.graph.guard(kind, 0, a, Some(b), vec![a, b]);
        trace.push(guard);

        let pool = RegisterPool::aarch64_default();
        let compiled = compile_trace(&trace, trivial_alloc_ptr(), &pool).unwrap();
        assert_eq!(compiled.code.len() % 4, 0);
        assert!(compiled.code.len() > 16, "{kind:?} should emit an entry check plus an exit block");
    }

    #[test]
    fn straight_line_add_compiles_without_guards() {
        let mut trace = Trace::new();
        let a = trace.graph.input(0);
        let b = trace.graph.input(1);
        let add = trace.graph.binary_int(IntBinOp::Add, a, b);
        trace.push(a);
        trace.push(b);
        trace.push(add);

        let pool = RegisterPool::aarch64_default();
        let compiled = compile_trace(&trace, trivial_alloc_ptr(), &pool).unwrap();
        assert!(!compiled.code.is_empty());
        assert_eq!(compiled.code.len() % 4, 0);
    }

    #[test]
    fn guarded_trace_emits_an_exit_block() {
        let mut trace = Trace::new();
        let a = trace.graph.input(0);
        let guard = trace.graph.guard(GuardKind::Int, 0, a, None, vec![a]);
        trace.push(a);
        trace.push(guard);

        let pool = RegisterPool::aarch64_default();
        let compiled = compile_trace(&trace, trivial_alloc_ptr(), &pool).unwrap();
        // prologue-less: entry check + exit block + epilogue, all 4-aligned.
        assert_eq!(compiled.code.len() % 4, 0);
        assert!(compiled.code.len() > 16);
    }

    #[test]
    fn constant_table_dedupes_repeated_values() {
        let mut trace = Trace::new();
        let c1 = trace.graph.constant(Value::from_int(5));
        let c2 = trace.graph.constant(Value::from_int(5));
        let add = trace.graph.binary_int(IntBinOp::Add, c1, c2);
        trace.push(c1);
        trace.push(c2);
        trace.push(add);

        let pool = RegisterPool::aarch64_default();
        let compiled = compile_trace(&trace, trivial_alloc_ptr(), &pool).unwrap();
        // one entry for the deduped constant plus the trailing alloc-fn slot.
        assert_eq!(compiled.consts.len(), 2);
    }

    #[test]
    fn out_of_registers_propagates_as_codegen_error() {
        let mut trace = Trace::new();
        let a = trace.graph.input(0);
        let b = trace.graph.input(1);
        let c = trace.graph.input(2);
        trace.push(a);
        trace.push(b);
        trace.push(c);

        let pool = RegisterPool { candidates: vec![3, 4], callee_save: Default::default() };
        let err = compile_trace(&trace, trivial_alloc_ptr(), &pool).unwrap_err();
        assert_eq!(err, CodegenError::OutOfRegisters);
    }
}
