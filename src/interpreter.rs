//! The driver loop (spec.md §4.2 "Interpreter").
//!
//! Grounded on `trax_interp.py`'s `Interpreter.run`/`execute_*` family —
//! restructured, like `recorder.rs`, into one method per opcode closer to
//! `fuel-vm/src/interpreter/executors/instruction.rs`'s fetch/decode split
//! from per-opcode dispatch. Every step that mutates concrete state also
//! mirrors the same step into the active [`Recorder`], when one exists,
//! exactly as `trax_interp.py` inlines trace emission into its own
//! `execute_*` methods.

use crate::bytecode::{Frame, Instruction, MethodKey, ProgramPoint};
use crate::codegen::{compile_trace, getvar_layout};
use crate::error::{GuestPanic, InterpResult, InterpreterError, RecordAbort};
use crate::guard;
use crate::ir::{NodeId, Trace};
use crate::methods::{BuiltinMethod, MethodEntry};
use crate::optimizer;
use crate::recorder::Recorder;
use crate::runtime::Runtime;
use crate::value::{HeapObject, Value};
use std::collections::HashMap;

/// What a `Call` dispatches to, decided once against the method registry
/// and then acted on without holding that borrow (spec.md §4.2 "Call").
enum CallKind {
    Builtin(BuiltinMethod),
    Bytecode,
}

/// Drives bytecode execution for one [`Runtime`], switching between plain
/// interpretation, trace recording, and native trace execution as hotness
/// dictates (spec.md §4.2 "Driver loop").
pub struct Interpreter<'rt> {
    runtime: &'rt mut Runtime,
    call_stack: Vec<Frame>,
    recorder: Option<Recorder>,
}

impl<'rt> Interpreter<'rt> {
    pub fn new(runtime: &'rt mut Runtime) -> Self {
        Interpreter { runtime, call_stack: Vec::new(), recorder: None }
    }

    /// Run `method_key` to completion with `args` (receiver first) as its
    /// initial locals, returning the value its outermost `Return` produces
    /// (spec.md §4.2).
    #[tracing::instrument(skip(self, args))]
    pub fn run(&mut self, method_key: MethodKey, args: Vec<Value>) -> InterpResult<Value> {
        let mut frame = Frame::new(method_key);
        frame.locals = args;
        self.call_stack.push(frame);
        self.drive()
    }

    fn drive(&mut self) -> InterpResult<Value> {
        loop {
            let point = self.frame().program_point();

            if self.recorder.is_none() && self.try_enter_trace(point)? {
                continue;
            }

            if let Some(value) = self.dispatch_step()? {
                return Ok(value);
            }
        }
    }

    fn frame(&self) -> &Frame {
        self.call_stack.last().expect("drive always holds at least one frame")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.call_stack.last_mut().expect("drive always holds at least one frame")
    }

    /// Move the current frame's `pc` by `delta` instructions (spec.md §3:
    /// a relative jump's `offset` is added to the pc just past the jump
    /// itself).
    fn advance(&mut self, delta: i32) {
        let frame = self.frame_mut();
        frame.pc = (frame.pc as i32 + delta) as usize;
    }

    fn fetch(&self, method_key: MethodKey, pc: usize) -> InterpResult<Instruction> {
        match self.runtime.methods.get(method_key) {
            Some(MethodEntry::Bytecode(body)) => body.code.get(pc).cloned().ok_or(InterpreterError::FellOffEnd),
            _ => Err(InterpreterError::FellOffEnd),
        }
    }

    fn constant(&self, method_key: MethodKey, k: u32) -> Value {
        match self.runtime.methods.get(method_key) {
            Some(MethodEntry::Bytecode(body)) => body.constants[k as usize],
            _ => unreachable!("PushConst only ever executes inside a bytecode method's own frame"),
        }
    }

    /// Start shadowing interpretation with IR emission (spec.md §4.2
    /// "Hotness and trace activation").
    fn start_recording(&mut self, anchor: ProgramPoint) {
        let frame = self.frame();
        let n_locals = frame.locals.len();
        let n_stack = frame.eval_stack.len();
        let max = self.runtime.config.max_trace_instructions;
        tracing::debug!(?anchor, n_locals, n_stack, "starting trace recording");
        self.recorder = Some(Recorder::start(anchor, frame.method_key, frame.pc, n_locals, n_stack, max));
    }

    /// Give up on the in-progress recording and blacklist its anchor
    /// (spec.md §4.3 "implicit back-off": a blacklisted anchor's hotness
    /// counter never crosses the threshold again).
    fn abort_recording(&mut self, reason: RecordAbort) {
        if let Some(recorder) = self.recorder.take() {
            tracing::warn!(anchor = ?recorder.anchor, %reason, "aborting trace recording");
            self.runtime.blacklist(recorder.anchor);
        }
    }

    /// Finish recording at the anchor, optimize, compile, and install the
    /// trace (spec.md §4.4, §4.6). A compile failure blacklists the
    /// anchor and falls back to interpretation; an OS failure installing
    /// the executable mapping propagates (spec.md §7: the one JIT-pipeline
    /// error that is fatal).
    fn close_trace(&mut self) -> InterpResult<()> {
        let recorder = self.recorder.take().expect("close_trace only runs while recording");
        let anchor = recorder.anchor;
        let (n_locals, n_stack) = recorder.initial_shape();
        let (graph, order, exits) = recorder.close();
        let mut trace = Trace { graph, order, preamble: Vec::new(), body: Vec::new(), anchor: Some(anchor) };

        optimizer::optimize(&mut trace);

        let alloc_fn_ptr = self.runtime.allocator().raw_fn_ptr();
        match compile_trace(&trace, alloc_fn_ptr, &self.runtime.config.register_pool) {
            Ok(compiled) => {
                let layout = getvar_layout(&trace);
                self.runtime.install_trace(anchor, compiled, exits, n_locals, n_stack, layout)?;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(?anchor, %err, "trace failed to compile, blacklisting anchor");
                self.runtime.blacklist(anchor);
                Ok(())
            }
        }
    }

    /// If a native trace is installed at `point`, pack the current frame
    /// into its inputs buffer, call it, and rebuild the call stack from
    /// whichever guard it exited through (spec.md §4.6 "Guard exits").
    /// Returns whether a trace ran (the driver should re-check hotness and
    /// re-fetch at the new top frame rather than dispatch an instruction).
    fn try_enter_trace(&mut self, point: ProgramPoint) -> InterpResult<bool> {
        let Some(installed) = self.runtime.trace_at(point) else {
            return Ok(false);
        };

        let mut inputs: Vec<i64> = Vec::with_capacity(installed.n_locals + installed.n_stack + installed.getvar_layout.len());
        {
            let frame = self.frame();
            for i in 0..installed.n_locals {
                inputs.push(frame.get_var(i as u32).raw());
            }
            for i in 0..installed.n_stack {
                inputs.push(frame.eval_stack[i].raw());
            }
            for &var_idx in &installed.getvar_layout {
                inputs.push(frame.get_var(var_idx).raw());
            }
        }
        let mut exit_buf = vec![0i64; installed.exits.buffer_len().max(1)];

        tracing::debug!(?point, "entering native trace");
        // Safety: `inputs` holds one word per slot the trace's codegen laid
        // out, `installed.consts` is the constant table `compile_trace`
        // produced for this same trace, and `exit_buf` is sized by this
        // trace's own `ExitTable::buffer_len`.
        let guard_id = unsafe { installed.native.call(inputs.as_ptr(), installed.consts.as_ptr(), exit_buf.as_mut_ptr()) };

        let descriptor = installed.exits.get(guard_id);
        let mut restored: HashMap<NodeId, Value> = HashMap::new();
        for (i, &value_id) in descriptor.values_to_keep.iter().enumerate() {
            restored.insert(value_id, Value::from_raw(exit_buf[i]));
        }
        let (_resume_point, frames) = guard::reconstruct(descriptor, &restored);

        self.call_stack.pop();
        self.call_stack.extend(frames);
        Ok(true)
    }

    /// Execute exactly one bytecode instruction, mirroring it into the
    /// active recorder if there is one. `Ok(Some(value))` means the
    /// outermost frame just returned; `Ok(None)` means keep driving.
    fn dispatch_step(&mut self) -> InterpResult<Option<Value>> {
        let method_key = self.frame().method_key;
        let pc = self.frame().pc;
        let instr = self.fetch(method_key, pc)?;

        if let Some(recorder) = self.recorder.as_mut() {
            recorder.sync_pc(pc);
        }

        match instr {
            Instruction::PushConst(k) => {
                let value = self.constant(method_key, k);
                let abort = self.recorder.as_mut().and_then(|r| r.push_const(value).err());
                if let Some(abort) = abort {
                    self.abort_recording(abort);
                }
                self.frame_mut().eval_stack.push(value);
                self.advance(1);
            }

            Instruction::Pop => {
                self.frame_mut().eval_stack.pop().expect("Pop underflow mirrors a bytecode compiler bug");
                if let Some(recorder) = self.recorder.as_mut() {
                    recorder.pop();
                }
                self.advance(1);
            }

            Instruction::Dup(k) => {
                let stack = &self.frame().eval_stack;
                let value = stack[stack.len() - 1 - k as usize];
                self.frame_mut().eval_stack.push(value);
                if let Some(recorder) = self.recorder.as_mut() {
                    recorder.dup(k);
                }
                self.advance(1);
            }

            Instruction::GetField(field_index) => {
                let obj = self.frame_mut().eval_stack.pop().expect("GetField underflow mirrors a bytecode compiler bug");
                let obj_type = obj.type_index();
                let value = obj.get_field(field_index)?;
                let abort = self.recorder.as_mut().and_then(|r| {
                    let obj_id = r.pop();
                    r.get_field(obj_id, obj_type, field_index).err()
                });
                if let Some(abort) = abort {
                    self.abort_recording(abort);
                }
                self.frame_mut().eval_stack.push(value);
                self.advance(1);
            }

            Instruction::SetField(field_index) => {
                let value = self.frame_mut().eval_stack.pop().expect("SetField underflow mirrors a bytecode compiler bug");
                let obj = self.frame_mut().eval_stack.pop().expect("SetField underflow mirrors a bytecode compiler bug");
                let obj_type = obj.type_index();
                obj.set_field(field_index, value)?;
                let abort = self.recorder.as_mut().and_then(|r| {
                    let value_id = r.pop();
                    let obj_id = r.pop();
                    r.set_field(obj_id, obj_type, field_index, value_id).err()
                });
                if let Some(abort) = abort {
                    self.abort_recording(abort);
                }
                self.advance(1);
            }

            Instruction::New { type_index, n_fields } => {
                let n = n_fields as usize;
                let fields = {
                    let stack = &mut self.frame_mut().eval_stack;
                    let len = stack.len();
                    stack.split_off(len - n)
                };
                let ptr = self.runtime.allocator().allocate(1 + n);
                let obj = HeapObject::init(ptr, type_index, &fields).as_value();
                let abort = self.recorder.as_mut().and_then(|r| {
                    let field_ids = r.pop_n(n);
                    r.new_object(type_index, &field_ids).err()
                });
                if let Some(abort) = abort {
                    self.abort_recording(abort);
                }
                self.frame_mut().eval_stack.push(obj);
                self.advance(1);
            }

            Instruction::GetVar(i) => {
                let value = self.frame().get_var(i);
                let abort = self.recorder.as_mut().and_then(|r| r.get_var(i).err());
                if let Some(abort) = abort {
                    self.abort_recording(abort);
                }
                self.frame_mut().eval_stack.push(value);
                self.advance(1);
            }

            Instruction::SetVar(i) => {
                let value = self.frame_mut().eval_stack.pop().expect("SetVar underflow mirrors a bytecode compiler bug");
                self.frame_mut().set_var(i, value);
                let abort = self.recorder.as_mut().and_then(|r| r.set_var(i).err());
                if let Some(abort) = abort {
                    self.abort_recording(abort);
                }
                self.advance(1);
            }

            Instruction::Jmp { offset, loop_back } => {
                self.advance(1 + offset);
                if loop_back {
                    let target = self.frame().program_point();
                    if self.recorder.is_some() {
                        let should_close = self.recorder.as_ref().expect("just checked").at_anchor(target);
                        if should_close {
                            self.close_trace()?;
                        }
                    } else if self.runtime.record_back_edge(target) {
                        self.start_recording(target);
                    }
                }
            }

            Instruction::JmpIfNot { offset } => {
                let condition = self.frame_mut().eval_stack.pop().expect("JmpIfNot underflow mirrors a bytecode compiler bug");
                // "Jump if the value is false-tagged" (bytecode.rs) — a
                // tag check, not `to_bool()`, so a non-boolean condition
                // simply falls through rather than panicking.
                let taken = condition.is_false();
                if let Some(recorder) = self.recorder.as_mut() {
                    let cond_id = recorder.pop();
                    recorder.jmp_if_not(cond_id, taken);
                }
                self.advance(if taken { 1 + offset } else { 1 });
            }

            Instruction::Call { name, n_args } => {
                let n = n_args as usize;
                let args = {
                    let stack = &mut self.frame_mut().eval_stack;
                    let len = stack.len();
                    stack.split_off(len - n)
                };
                let receiver = self.frame_mut().eval_stack.pop().expect("Call underflow mirrors a bytecode compiler bug");
                let receiver_type = receiver.type_index();
                let key = (receiver_type, name);

                let kind = match self.runtime.methods.get(key) {
                    Some(MethodEntry::Builtin(b)) => CallKind::Builtin(*b),
                    Some(MethodEntry::Bytecode(_)) => CallKind::Bytecode,
                    None => return Err(GuestPanic::UnknownMethod(receiver_type, name).into()),
                };

                match kind {
                    CallKind::Builtin(builtin) => {
                        let result = (builtin.concrete)(receiver, &args)?;
                        if let Some(recorder) = self.recorder.as_mut() {
                            let arg_ids = recorder.pop_n(n);
                            let receiver_id = recorder.pop();
                            let result_id = (builtin.trace_emit)(recorder, receiver_id, &arg_ids);
                            recorder.order.push(result_id);
                            recorder.push_shadow_value(result_id);
                        }
                        self.frame_mut().eval_stack.push(result);
                        self.advance(1);
                    }
                    CallKind::Bytecode => {
                        let mut new_frame = Frame::new(key);
                        new_frame.locals.push(receiver);
                        new_frame.locals.extend(args.iter().copied());

                        let abort = self.recorder.as_mut().and_then(|r| {
                            let arg_ids = r.pop_n(n);
                            let receiver_id = r.pop();
                            r.call_bytecode(receiver_id, receiver_type, arg_ids, key, 0).err()
                        });
                        if let Some(abort) = abort {
                            self.abort_recording(abort);
                        }

                        self.advance(1);
                        self.call_stack.push(new_frame);
                    }
                }
            }

            Instruction::Return => {
                let value = self.frame_mut().eval_stack.pop().expect("Return underflow mirrors a bytecode compiler bug");
                self.call_stack.pop();
                let caller_point = self.call_stack.last().map(|f| f.program_point());

                let abort = self.recorder.as_mut().and_then(|r| r.ret(caller_point).err());
                if let Some(abort) = abort {
                    self.abort_recording(abort);
                }

                if let Some(caller) = self.call_stack.last_mut() {
                    caller.eval_stack.push(value);
                    return Ok(None);
                }
                return Ok(Some(value));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Instruction::*;
    use crate::methods::MethodRegistry;
    use crate::runtime::RuntimeConfig;
    use crate::value::TYPE_INT;

    fn runtime_with(methods: MethodRegistry) -> Runtime {
        Runtime::new(RuntimeConfig { trace_threshold: 1_000, ..RuntimeConfig::default() }, methods)
    }

    #[test]
    fn runs_a_straight_line_method_to_return() {
        // fn double(self) { return self + self }
        let mut registry = MethodRegistry::new();
        registry.insert_bytecode((TYPE_INT, "double"), vec![GetVar(0), GetVar(0), Call { name: "+", n_args: 1 }, Return], vec![]);
        let mut runtime = runtime_with(registry);
        let mut interp = Interpreter::new(&mut runtime);
        let result = interp.run((TYPE_INT, "double"), vec![Value::from_int(21)]).unwrap();
        assert_eq!(result.to_int().unwrap(), 42);
    }

    #[test]
    fn calls_a_user_defined_method_and_returns_through_it() {
        // fn callee(self) { return self }
        // fn caller(self) { return self.callee() }
        let mut registry = MethodRegistry::new();
        registry.insert_bytecode((TYPE_INT, "callee"), vec![GetVar(0), Return], vec![]);
        registry.insert_bytecode((TYPE_INT, "caller"), vec![GetVar(0), Call { name: "callee", n_args: 0 }, Return], vec![]);
        let mut runtime = runtime_with(registry);
        let mut interp = Interpreter::new(&mut runtime);
        let result = interp.run((TYPE_INT, "caller"), vec![Value::from_int(9)]).unwrap();
        assert_eq!(result.to_int().unwrap(), 9);
    }

    #[test]
    fn unknown_method_panics_with_the_name() {
        let mut registry = MethodRegistry::new();
        registry.insert_bytecode((TYPE_INT, "ghost"), vec![GetVar(0), Call { name: "nope", n_args: 0 }, Return], vec![]);
        let mut runtime = runtime_with(registry);
        let mut interp = Interpreter::new(&mut runtime);
        let err = interp.run((TYPE_INT, "ghost"), vec![Value::from_int(1)]).unwrap_err();
        assert!(matches!(err, InterpreterError::Panic(GuestPanic::UnknownMethod(TYPE_INT, "nope"))));
    }

    #[test]
    fn division_by_zero_surfaces_as_a_panic() {
        let mut registry = MethodRegistry::new();
        registry.insert_bytecode((TYPE_INT, "bad"), vec![GetVar(0), PushConst(0), Call { name: "/", n_args: 1 }, Return], vec![Value::from_int(0)]);
        let mut runtime = runtime_with(registry);
        let mut interp = Interpreter::new(&mut runtime);
        let err = interp.run((TYPE_INT, "bad"), vec![Value::from_int(1)]).unwrap_err();
        assert!(matches!(err, InterpreterError::Panic(GuestPanic::DivisionByZero)));
    }

    #[test]
    fn a_while_loop_runs_to_completion_under_plain_interpretation() {
        // fn count_to(self) { i = 0; while i < self { i = i + 1 }; return i }
        let code = vec![
            PushConst(0),                           // idx0: i = 0
            SetVar(1),
            GetVar(1),                               // idx2: LOOP HEAD
            GetVar(0),
            Call { name: "<", n_args: 1 },            // i < self
            JmpIfNot { offset: 5 },                   // idx5 -> idx11
            GetVar(1),
            PushConst(1),
            Call { name: "+", n_args: 1 },            // idx8: i + 1
            SetVar(1),
            Jmp { offset: -9, loop_back: true },      // idx10 -> idx2
            GetVar(1),
            Return,
        ];
        let mut registry = MethodRegistry::new();
        registry.insert_bytecode((TYPE_INT, "count_to"), code, vec![Value::from_int(0), Value::from_int(1)]);
        // High threshold: this test exercises the interpreter loop itself,
        // not trace activation.
        let mut runtime = runtime_with(registry);
        let mut interp = Interpreter::new(&mut runtime);
        let result = interp.run((TYPE_INT, "count_to"), vec![Value::from_int(5)]).unwrap();
        assert_eq!(result.to_int().unwrap(), 5);
    }
}
