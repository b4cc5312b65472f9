//! Trace recorder: shadows the concrete interpreter with IR emission
//! while a loop's back-edge is hot (spec.md §4.3).
//!
//! Grounded on `trax_interp.py`'s trace-emission code, which that module
//! inlines directly into each `execute_*` method; here it is pulled out
//! into one object with a method per bytecode opcode, closer to
//! `fuel-vm/src/interpreter/executors`' per-opcode-function split than
//! the original's monolithic dispatch loop.

use crate::bytecode::{MethodKey, ProgramPoint};
use crate::error::{RecordAbort, RecordResult};
use crate::guard::{ExitDescriptor, ExitTable, FrameShape, GuardId};
use crate::ir::{GuardKind, IrGraph, NodeId};
use crate::methods::TraceContext;
use crate::value::{TYPE_BOOL, TYPE_INT, TYPE_NIL};

/// The shadow counterpart of [`crate::bytecode::Frame`]: every concrete
/// slot (a local or an eval-stack entry) paired with the `NodeId` that
/// stands for it in the trace being recorded.
#[derive(Debug, Clone)]
struct ShadowFrame {
    method_key: MethodKey,
    pc: usize,
    locals: Vec<NodeId>,
    eval_stack: Vec<NodeId>,
}

impl ShadowFrame {
    fn program_point(&self) -> ProgramPoint {
        (self.method_key, self.pc)
    }
}

/// Accumulates IR while the interpreter executes a hot loop (spec.md
/// §4.3 "Trace Recorder"). One `Recorder` lives for exactly one
/// record-then-close attempt; a `RecordAbort` or a successful close both
/// end its lifetime.
pub struct Recorder {
    pub anchor: ProgramPoint,
    pub graph: IrGraph,
    pub order: Vec<NodeId>,
    pub exits: ExitTable,
    shadow_frames: Vec<ShadowFrame>,
    max_instructions: usize,
    /// How many of the eagerly-materialized start-of-recording `Input`s
    /// were locals vs. eval-stack slots — needed at `close()` to align
    /// the loop's final shadow values back against those same `Input`s
    /// even if locals grew past the original count in between (a late
    /// `GetVar` extends `ShadowFrame::locals`, but those extra slots are
    /// fresh `GetVar` nodes, not `Input`s, and must not be zipped in).
    n_locals_initial: usize,
    n_stack_initial: usize,
}

impl Recorder {
    /// Start recording at `anchor`, with the current frame's locals and
    /// eval stack materialized eagerly as `Input` nodes — spec.md §4.2
    /// "the driver packs the current frame's stack-or-locals into the
    /// inputs buffer in a stable order (the order the trace recorded its
    /// Inputs)": that order is fixed right here, at record start.
    pub fn start(anchor: ProgramPoint, method_key: MethodKey, pc: usize, n_locals: usize, eval_stack_depth: usize, max_instructions: usize) -> Self {
        let mut graph = IrGraph::new();
        let mut order = Vec::new();
        let mut next_index = 0u32;

        let locals = (0..n_locals)
            .map(|_| {
                let id = graph.input(next_index);
                next_index += 1;
                order.push(id);
                id
            })
            .collect();
        let eval_stack = (0..eval_stack_depth)
            .map(|_| {
                let id = graph.input(next_index);
                next_index += 1;
                order.push(id);
                id
            })
            .collect();

        Recorder {
            anchor,
            graph,
            order,
            exits: ExitTable::new(),
            shadow_frames: vec![ShadowFrame { method_key, pc, locals, eval_stack }],
            max_instructions,
            n_locals_initial: n_locals,
            n_stack_initial: eval_stack_depth,
        }
    }

    fn check_bound(&self) -> RecordResult<()> {
        if self.order.len() > self.max_instructions {
            return Err(RecordAbort::TooLong(self.max_instructions));
        }
        Ok(())
    }

    fn current(&self) -> &ShadowFrame {
        self.shadow_frames.last().expect("a recorder always has at least its anchor frame")
    }

    fn current_mut(&mut self) -> &mut ShadowFrame {
        self.shadow_frames.last_mut().expect("a recorder always has at least its anchor frame")
    }

    fn current_frame_idx(&self) -> u32 {
        (self.shadow_frames.len() - 1) as u32
    }

    /// `(n_locals, n_stack_slots)` materialized eagerly at `start()` — the
    /// driver needs this to know how many words of the native inputs
    /// buffer come straight from the current frame versus from trailing
    /// `GetVar` slots (spec.md §6 "Native trace ABI").
    pub fn initial_shape(&self) -> (usize, usize) {
        (self.n_locals_initial, self.n_stack_initial)
    }

    /// Keep the active shadow frame's `pc` in lockstep with the concrete
    /// frame the interpreter is advancing (needed so a guard fired later
    /// reconstructs at the right program point).
    pub fn sync_pc(&mut self, pc: usize) {
        self.current_mut().pc = pc;
    }

    fn push_node(&mut self, id: NodeId) -> RecordResult<NodeId> {
        self.order.push(id);
        self.check_bound()?;
        Ok(id)
    }

    /// Snapshot every shadow frame's current shape, outermost first
    /// (spec.md §3 "Guard Descriptor").
    fn frame_shapes(&self) -> Vec<FrameShape> {
        self.shadow_frames
            .iter()
            .map(|f| FrameShape {
                method_key: f.method_key,
                pc: f.pc,
                locals: f.locals.clone(),
                eval_stack: f.eval_stack.clone(),
            })
            .collect()
    }

    /// Register a guard against every shadow frame's current state
    /// (spec.md §3 "values_to_keep": "the IR values that must be
    /// materialized into the exit buffer if this guard fails" — here,
    /// conservatively, every live shadow value across the whole call
    /// stack, flattened outermost-frame-first to match
    /// [`crate::guard::reconstruct`]'s zip order).
    pub fn push_guard(&mut self, kind: GuardKind, operand: NodeId, right: Option<NodeId>) -> GuardId {
        let frames = self.frame_shapes();
        let values_to_keep: Vec<NodeId> = frames.iter().flat_map(|f| f.locals.iter().chain(f.eval_stack.iter())).copied().collect();
        let guard_id = self.exits.push(ExitDescriptor { frames, values_to_keep: values_to_keep.clone() });
        let node = self.graph.guard(kind, guard_id, operand, right, values_to_keep);
        self.order.push(node);
        guard_id
    }

    /// The guard a value's builtin-registered `type_index` requires
    /// before the call/field-access that depends on it (spec.md §4.3
    /// "Polymorphic dispatch and guards").
    fn guard_kind_for_type(type_index: u32) -> GuardKind {
        match type_index {
            TYPE_INT => GuardKind::Int,
            TYPE_NIL => GuardKind::Nil,
            TYPE_BOOL => GuardKind::Bool,
            t => GuardKind::Index(t),
        }
    }

    pub fn push_const(&mut self, value: crate::value::Value) -> RecordResult<NodeId> {
        let id = self.graph.constant(value);
        self.push_node(id)?;
        self.current_mut().eval_stack.push(id);
        Ok(id)
    }

    pub fn pop(&mut self) -> NodeId {
        self.current_mut().eval_stack.pop().expect("shadow stack underflow mirrors a concrete interpreter bug")
    }

    /// Pop `n` shadow values, bottom to top (mirrors the concrete driver's
    /// `Vec::split_off` when unpacking a `Call`'s or `New`'s arguments).
    pub fn pop_n(&mut self, n: usize) -> Vec<NodeId> {
        let len = self.current().eval_stack.len();
        self.current_mut().eval_stack.split_off(len - n)
    }

    /// Push a value the driver computed out-of-band (a builtin's traced
    /// result) directly onto the current shadow frame's stack.
    pub fn push_shadow_value(&mut self, id: NodeId) {
        self.current_mut().eval_stack.push(id);
    }

    /// Supplemented `Dup(k)` (SPEC_FULL.md §5): duplicate the shadow value
    /// `k` slots from the top, same as the concrete stack op.
    pub fn dup(&mut self, k: u32) {
        let stack = &mut self.current_mut().eval_stack;
        let id = stack[stack.len() - 1 - k as usize];
        stack.push(id);
    }

    /// `JmpIfNot` (spec.md §4.3 "Conditional control flow", fixed per
    /// spec.md §9 / SPEC_FULL.md §6: the guard's polarity reflects the
    /// path actually taken rather than always asserting `GuardTrue`).
    pub fn jmp_if_not(&mut self, condition: NodeId, branch_taken: bool) -> GuardId {
        let kind = if branch_taken { GuardKind::False } else { GuardKind::True };
        self.push_guard(kind, condition, None)
    }

    pub fn get_field(&mut self, obj: NodeId, obj_type_index: u32, field_index: u32) -> RecordResult<NodeId> {
        self.push_guard(Self::guard_kind_for_type(obj_type_index), obj, None);
        let id = self.graph.get_field(obj, field_index);
        self.push_node(id)?;
        self.current_mut().eval_stack.push(id);
        Ok(id)
    }

    pub fn set_field(&mut self, obj: NodeId, obj_type_index: u32, field_index: u32, value: NodeId) -> RecordResult<()> {
        self.push_guard(Self::guard_kind_for_type(obj_type_index), obj, None);
        let id = self.graph.set_field(obj, field_index, value);
        self.push_node(id)?;
        Ok(())
    }

    pub fn new_object(&mut self, type_index: u32, fields: &[NodeId]) -> RecordResult<NodeId> {
        let obj = self.graph.new_object(type_index, fields.len() as u32);
        self.push_node(obj)?;
        for (i, &value) in fields.iter().enumerate() {
            let set = self.graph.set_field(obj, i as u32, value);
            self.push_node(set)?;
        }
        self.current_mut().eval_stack.push(obj);
        Ok(obj)
    }

    /// `GetVar(i)`: reuse the local's current shadow value if this frame
    /// already has one. A miss means different things depending on which
    /// frame is asking:
    ///
    /// - In the bottom (anchor) frame, this local was live *before*
    ///   recording started and just wasn't one of the eagerly-materialized
    ///   slots — a genuine read of outside-the-trace state, so it gets a
    ///   fresh `GetVar` Input (spec.md §3 "locals grow on write"; see
    ///   `codegen::lower`'s treatment of it as an extra inputs-buffer slot).
    /// - In an inlined callee frame, the frame itself was created during
    ///   this recording with only `receiver`+args as locals (`call_bytecode`),
    ///   so any read past that is a local the guest never wrote before
    ///   reading — concretely always nil (`Frame::get_var`'s OOB default) —
    ///   and is recorded as a plain `Constant(Nil)`, not an Input, since
    ///   there is no "before the trace" value to thread in.
    pub fn get_var(&mut self, var_idx: u32) -> RecordResult<NodeId> {
        let frame_idx = self.current_frame_idx();
        let idx = var_idx as usize;
        if let Some(&id) = self.current().locals.get(idx) {
            self.current_mut().eval_stack.push(id);
            return Ok(id);
        }
        let id = if self.shadow_frames.len() == 1 {
            let id = self.graph.get_var(frame_idx, var_idx);
            self.push_node(id)?;
            id
        } else {
            let id = self.graph.constant(crate::value::Value::NIL);
            self.push_node(id)?;
            id
        };
        let locals = &mut self.current_mut().locals;
        if idx >= locals.len() {
            locals.resize(idx + 1, id);
        }
        locals[idx] = id;
        self.current_mut().eval_stack.push(id);
        Ok(id)
    }

    pub fn set_var(&mut self, var_idx: u32) -> RecordResult<()> {
        let value = self.pop();
        let frame_idx = self.current_frame_idx();
        let id = self.graph.set_var(frame_idx, var_idx, value);
        self.push_node(id)?;
        let idx = var_idx as usize;
        let locals = &mut self.current_mut().locals;
        if idx >= locals.len() {
            locals.resize(idx + 1, value);
        }
        locals[idx] = value;
        Ok(())
    }

    /// Enter a user-defined method body while recording (spec.md §4.3
    /// "Calls"): guard the receiver's type, then push a shadow frame.
    /// Aborts if `method_key` is already on the shadow call stack
    /// (recursion/nested loops are not specified — spec.md §4.3).
    pub fn call_bytecode(&mut self, receiver: NodeId, receiver_type_index: u32, args: Vec<NodeId>, method_key: MethodKey, entry_pc: usize) -> RecordResult<()> {
        if self.shadow_frames.iter().any(|f| f.method_key == method_key) {
            let point = (method_key, entry_pc);
            return Err(RecordAbort::Reentrant(point));
        }
        self.push_guard(Self::guard_kind_for_type(receiver_type_index), receiver, None);
        let mut locals = Vec::with_capacity(1 + args.len());
        locals.push(receiver);
        locals.extend(args);
        self.shadow_frames.push(ShadowFrame { method_key, pc: entry_pc, locals, eval_stack: Vec::new() });
        Ok(())
    }

    /// Leave the current shadow frame on `Return` (spec.md §4.3:
    /// "Returning across the recorder's bottom frame aborts the trace").
    /// `caller_point` is the concrete program point execution resumes at,
    /// asserted against the parent shadow frame (spec.md §9: "preserve
    /// the assertion and abort the trace if it fails").
    pub fn ret(&mut self, caller_point: Option<ProgramPoint>) -> RecordResult<NodeId> {
        let value = self.pop();
        if self.shadow_frames.len() == 1 {
            return Err(RecordAbort::Unsupported("return across the trace's root frame"));
        }
        self.shadow_frames.pop();
        if let Some(expected) = caller_point {
            let actual = self.current().program_point();
            if actual != expected {
                return Err(RecordAbort::ReturnMismatch(expected, actual));
            }
        }
        self.current_mut().eval_stack.push(value);
        Ok(value)
    }

    /// Whether execution is back at the anchor with exactly the bottom
    /// shadow frame active — the condition for closing the loop (spec.md
    /// §4.2 "the trace is closed").
    pub fn at_anchor(&self, point: ProgramPoint) -> bool {
        self.shadow_frames.len() == 1 && point == self.anchor
    }

    /// Close the loop: tie every Input defined at record-start to the
    /// shadow value it holds now (spec.md §4.3 "Anchor-to-anchor
    /// closure"). Consumes the recorder and hands back the finished
    /// `order`/`graph`/`exits` for the optimizer.
    pub fn close(mut self) -> (IrGraph, Vec<NodeId>, ExitTable) {
        let bottom = &self.shadow_frames[0];
        let final_values: Vec<NodeId> = bottom
            .locals
            .iter()
            .take(self.n_locals_initial)
            .chain(bottom.eval_stack.iter().take(self.n_stack_initial))
            .copied()
            .collect();

        for (i, &final_value) in final_values.iter().enumerate() {
            let input_id = self.order[i];
            if let crate::ir::IrNode::Input { phi, .. } = self.graph.get_mut(input_id) {
                *phi = Some(final_value);
            }
        }

        (self.graph, self.order, self.exits)
    }
}

impl TraceContext for Recorder {
    fn graph_mut(&mut self) -> &mut IrGraph {
        &mut self.graph
    }

    fn emit_guard_index(&mut self, operand: NodeId, type_index: u32) -> u32 {
        self.push_guard(Self::guard_kind_for_type(type_index), operand, None)
    }
}
