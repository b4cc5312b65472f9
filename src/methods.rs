//! Built-in method table: the methods on `int` and `bool` receivers that
//! are implemented natively rather than compiled from guest bytecode
//! (spec.md §4.2 "Call"), plus the registry tying both builtin and
//! bytecode methods to `(type_index, name)` keys.
//!
//! Grounded on `trax_interp.py`'s `Interpreter.builtin_methods` /
//! `builtin_trace_methods` (the dual concrete/trace maps) and
//! `trax_runtime.py`'s `IntegerMethods`/`BooleanMethods` (each method pairs
//! a concrete implementation with a hand-written trace-emission twin that
//! records the same guards the concrete path runs). `TraceContext` mirrors
//! `trax_runtime.py`'s `InterpInterface` abstract base — the narrow surface
//! a builtin's trace twin needs, without pulling in the whole recorder.

use crate::bytecode::{Instruction, MethodKey};
use crate::error::{GuestPanic, InterpResult};
use crate::ir::{BoolBinOp, IntBinOp, IrGraph, NodeId, UnaryOp};
use crate::value::{Value, TYPE_BOOL, TYPE_INT};
use std::collections::HashMap;

/// The narrow interface a builtin's trace-emission twin needs: somewhere
/// to push IR nodes, and a way to emit the type guard its concrete twin
/// implicitly relies on (`to_int`/`to_bool` panicking on a type mismatch).
pub trait TraceContext {
    fn graph_mut(&mut self) -> &mut IrGraph;
    /// Emit the guard appropriate for `type_index` (spec.md §4.2
    /// `emit_guard_index`: `GuardInt`/`GuardNil`/`GuardBool`/`GuardIndex`
    /// depending on which built-in type_index this is).
    fn emit_guard_index(&mut self, operand: NodeId, type_index: u32) -> u32;
}

/// A native method implementation: a concrete evaluator plus the trace
/// twin that records the equivalent IR when called while recording
/// (spec.md §4.2, §4.3).
#[derive(Clone, Copy)]
pub struct BuiltinMethod {
    pub concrete: fn(Value, &[Value]) -> InterpResult<Value>,
    pub trace_emit: fn(&mut dyn TraceContext, NodeId, &[NodeId]) -> NodeId,
}

/// A guest-bytecode method body plus the constant pool its `PushConst`
/// instructions index into (spec.md §3 "Bytecode Instruction").
#[derive(Debug, Clone)]
pub struct BytecodeMethod {
    pub code: Vec<Instruction>,
    pub constants: Vec<Value>,
}

/// Either a native [`BuiltinMethod`] or a guest-bytecode method body.
#[derive(Clone)]
pub enum MethodEntry {
    Builtin(BuiltinMethod),
    Bytecode(BytecodeMethod),
}

/// Maps `(type_index, name)` to its implementation, merging the bytecode
/// compiler's user-defined methods with the natively implemented builtins
/// (spec.md §4.2 "Call": "dispatch on receiver's type + name").
#[derive(Default, Clone)]
pub struct MethodRegistry {
    methods: HashMap<MethodKey, MethodEntry>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut registry = MethodRegistry { methods: HashMap::new() };
        register_builtins(&mut registry);
        registry
    }

    pub fn with_bytecode_methods(methods: impl IntoIterator<Item = (MethodKey, BytecodeMethod)>) -> Self {
        let mut registry = Self::new();
        for (key, body) in methods {
            registry.methods.insert(key, MethodEntry::Bytecode(body));
        }
        registry
    }

    pub fn get(&self, key: MethodKey) -> Option<&MethodEntry> {
        self.methods.get(&key)
    }

    pub fn insert_bytecode(&mut self, key: MethodKey, code: Vec<Instruction>, constants: Vec<Value>) {
        self.methods.insert(key, MethodEntry::Bytecode(BytecodeMethod { code, constants }));
    }
}

macro_rules! int_binop {
    ($name:ident, $op:expr) => {
        paste::paste! {
            fn [<int_ $name _concrete>](receiver: Value, args: &[Value]) -> InterpResult<Value> {
                let a = receiver.to_int()?;
                let b = args[0].to_int()?;
                if matches!($op, IntBinOp::Div | IntBinOp::Mod) && b == 0 {
                    return Err(GuestPanic::DivisionByZero.into());
                }
                Ok(Value::from_int(int_binop_eval($op, a, b)))
            }

            fn [<int_ $name _trace>](ctx: &mut dyn TraceContext, receiver: NodeId, args: &[NodeId]) -> NodeId {
                ctx.emit_guard_index(receiver, TYPE_INT);
                ctx.emit_guard_index(args[0], TYPE_INT);
                ctx.graph_mut().binary_int($op, receiver, args[0])
            }
        }
    };
}

macro_rules! int_cmp {
    ($name:ident, $op:expr) => {
        paste::paste! {
            fn [<int_ $name _concrete>](receiver: Value, args: &[Value]) -> InterpResult<Value> {
                let a = receiver.to_int()?;
                let b = args[0].to_int()?;
                Ok(Value::from_bool(bool_binop_eval($op, a, b)))
            }

            fn [<int_ $name _trace>](ctx: &mut dyn TraceContext, receiver: NodeId, args: &[NodeId]) -> NodeId {
                ctx.emit_guard_index(receiver, TYPE_INT);
                ctx.emit_guard_index(args[0], TYPE_INT);
                ctx.graph_mut().binary_bool($op, receiver, args[0])
            }
        }
    };
}

/// `wrapping_*` to match the AArch64 backend's 64-bit `ADD`/`SUB`/`MUL`:
/// overflow wraps rather than panicking (SPEC_FULL.md §6).
///
/// `Div`/`Mod` floor rather than truncate, matching `DivInstruction`/
/// `ModInstruction.interp()`'s Python `//`/`%` (round toward -infinity,
/// remainder takes the divisor's sign) rather than Rust's default
/// round-toward-zero (SPEC_FULL.md §6).
fn int_binop_eval(op: IntBinOp, a: i64, b: i64) -> i64 {
    match op {
        IntBinOp::Add => a.wrapping_add(b),
        IntBinOp::Sub => a.wrapping_sub(b),
        IntBinOp::Mul => a.wrapping_mul(b),
        IntBinOp::Div => floor_div(a, b),
        IntBinOp::Mod => floor_mod(a, b),
        IntBinOp::Max => a.max(b),
        IntBinOp::Min => a.min(b),
        IntBinOp::BAnd => a & b,
        IntBinOp::BOr => a | b,
        IntBinOp::BXor => a ^ b,
        IntBinOp::Shl => a.wrapping_shl(b as u32),
        IntBinOp::Shr => ((a as u64).wrapping_shr(b as u32)) as i64,
        IntBinOp::Asr => a.wrapping_shr(b as u32),
    }
}

/// `a / b` rounded toward -infinity, e.g. `-7 / 2 == -4`.
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        q.wrapping_sub(1)
    } else {
        q
    }
}

/// `a % b` with the divisor's sign, e.g. `-7 % 2 == 1`.
fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        r.wrapping_add(b)
    } else {
        r
    }
}

fn bool_binop_eval(op: BoolBinOp, a: i64, b: i64) -> bool {
    match op {
        BoolBinOp::Eq => a == b,
        BoolBinOp::Ne => a != b,
        BoolBinOp::Lt => a < b,
        BoolBinOp::Gt => a > b,
        BoolBinOp::Le => a <= b,
        BoolBinOp::Ge => a >= b,
        BoolBinOp::And | BoolBinOp::Or => unreachable!("bool combinators are not int comparisons"),
    }
}

int_binop!(add, IntBinOp::Add);
int_binop!(sub, IntBinOp::Sub);
int_binop!(mul, IntBinOp::Mul);
int_binop!(div, IntBinOp::Div);
int_binop!(mod_, IntBinOp::Mod);
int_binop!(min, IntBinOp::Min);
int_binop!(max, IntBinOp::Max);
int_cmp!(lt, BoolBinOp::Lt);
int_cmp!(gt, BoolBinOp::Gt);
int_cmp!(le, BoolBinOp::Le);
int_cmp!(ge, BoolBinOp::Ge);
int_cmp!(eq, BoolBinOp::Eq);
int_cmp!(ne, BoolBinOp::Ne);

fn int_to_bool_concrete(receiver: Value, _args: &[Value]) -> InterpResult<Value> {
    Ok(Value::from_bool(receiver.to_int()? != 0))
}

fn int_to_bool_trace(ctx: &mut dyn TraceContext, receiver: NodeId, _args: &[NodeId]) -> NodeId {
    ctx.emit_guard_index(receiver, TYPE_INT);
    ctx.graph_mut().unary(UnaryOp::IntToBool, receiver)
}

macro_rules! bool_binop {
    ($name:ident, $op:expr) => {
        paste::paste! {
            fn [<bool_ $name _concrete>](receiver: Value, args: &[Value]) -> InterpResult<Value> {
                let a = receiver.to_bool()?;
                let b = args[0].to_bool()?;
                Ok(Value::from_bool(bool_combine($op, a, b)))
            }

            fn [<bool_ $name _trace>](ctx: &mut dyn TraceContext, receiver: NodeId, args: &[NodeId]) -> NodeId {
                ctx.emit_guard_index(receiver, TYPE_BOOL);
                ctx.emit_guard_index(args[0], TYPE_BOOL);
                ctx.graph_mut().binary_bool($op, receiver, args[0])
            }
        }
    };
}

fn bool_combine(op: BoolBinOp, a: bool, b: bool) -> bool {
    match op {
        BoolBinOp::And => a && b,
        BoolBinOp::Or => a || b,
        BoolBinOp::Eq => a == b,
        BoolBinOp::Ne => a != b,
        BoolBinOp::Lt | BoolBinOp::Gt | BoolBinOp::Le | BoolBinOp::Ge => unreachable!("ordering is not defined on bool"),
    }
}

bool_binop!(and, BoolBinOp::And);
bool_binop!(or, BoolBinOp::Or);
bool_binop!(eq, BoolBinOp::Eq);
bool_binop!(ne, BoolBinOp::Ne);

fn bool_not_concrete(receiver: Value, _args: &[Value]) -> InterpResult<Value> {
    Ok(Value::from_bool(!receiver.to_bool()?))
}

fn bool_not_trace(ctx: &mut dyn TraceContext, receiver: NodeId, _args: &[NodeId]) -> NodeId {
    ctx.emit_guard_index(receiver, TYPE_BOOL);
    ctx.graph_mut().unary(UnaryOp::Not, receiver)
}

fn bool_to_int_concrete(receiver: Value, _args: &[Value]) -> InterpResult<Value> {
    Ok(Value::from_int(receiver.to_bool()? as i64))
}

fn bool_to_int_trace(ctx: &mut dyn TraceContext, receiver: NodeId, _args: &[NodeId]) -> NodeId {
    ctx.emit_guard_index(receiver, TYPE_BOOL);
    ctx.graph_mut().unary(UnaryOp::BoolToInt, receiver)
}

/// Registers every builtin (spec.md's closed set of int/bool operators),
/// mirroring `trax_runtime.py`'s `add_methods_to_interpreter` name→symbol
/// table.
fn register_builtins(registry: &mut MethodRegistry) {
    macro_rules! put {
        ($type_index:expr, $symbol:literal, $name:ident) => {
            paste::paste! {
                registry.methods.insert(
                    ($type_index, $symbol),
                    MethodEntry::Builtin(BuiltinMethod {
                        concrete: [<$name _concrete>],
                        trace_emit: [<$name _trace>],
                    }),
                );
            }
        };
    }

    put!(TYPE_INT, "+", int_add);
    put!(TYPE_INT, "-", int_sub);
    put!(TYPE_INT, "*", int_mul);
    put!(TYPE_INT, "/", int_div);
    put!(TYPE_INT, "%", int_mod_);
    put!(TYPE_INT, "<", int_lt);
    put!(TYPE_INT, ">", int_gt);
    put!(TYPE_INT, "<=", int_le);
    put!(TYPE_INT, ">=", int_ge);
    put!(TYPE_INT, "==", int_eq);
    put!(TYPE_INT, "!=", int_ne);
    put!(TYPE_INT, "min", int_min);
    put!(TYPE_INT, "max", int_max);
    put!(TYPE_INT, "to_bool", int_to_bool);

    put!(TYPE_BOOL, "and", bool_and);
    put!(TYPE_BOOL, "or", bool_or);
    put!(TYPE_BOOL, "not", bool_not);
    put!(TYPE_BOOL, "==", bool_eq);
    put!(TYPE_BOOL, "!=", bool_ne);
    put!(TYPE_BOOL, "to_int", bool_to_int);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeCtx {
        graph: IrGraph,
        guards: Vec<(NodeId, u32)>,
    }

    impl TraceContext for FakeCtx {
        fn graph_mut(&mut self) -> &mut IrGraph {
            &mut self.graph
        }

        fn emit_guard_index(&mut self, operand: NodeId, type_index: u32) -> u32 {
            self.guards.push((operand, type_index));
            self.guards.len() as u32 - 1
        }
    }

    #[test]
    fn int_add_concrete_matches_trace_shape() {
        let registry = MethodRegistry::new();
        let entry = registry.get((TYPE_INT, "+")).unwrap();
        let builtin = match entry {
            MethodEntry::Builtin(b) => *b,
            _ => panic!("expected builtin"),
        };
        let result = (builtin.concrete)(Value::from_int(2), &[Value::from_int(3)]).unwrap();
        assert_eq!(result.to_int().unwrap(), 5);

        let mut ctx = FakeCtx { graph: IrGraph::new(), guards: vec![] };
        let a = ctx.graph.input(0);
        let b = ctx.graph.input(1);
        let result_id = (builtin.trace_emit)(&mut ctx, a, &[b]);
        assert_eq!(ctx.guards.len(), 2);
        match ctx.graph.get(result_id) {
            crate::ir::IrNode::BinaryInt { op: IntBinOp::Add, lhs, rhs } => {
                assert_eq!(*lhs, a);
                assert_eq!(*rhs, b);
            }
            _ => panic!("expected BinaryInt Add"),
        }
    }

    #[test]
    fn division_by_zero_is_a_guest_panic_not_a_host_abort() {
        let registry = MethodRegistry::new();
        let entry = registry.get((TYPE_INT, "/")).unwrap();
        let builtin = match entry {
            MethodEntry::Builtin(b) => *b,
            _ => panic!("expected builtin"),
        };
        let err = (builtin.concrete)(Value::from_int(1), &[Value::from_int(0)]);
        assert!(matches!(err, Err(crate::error::InterpreterError::Panic(GuestPanic::DivisionByZero))));
    }

    #[test]
    fn bool_and_requires_bool_operands() {
        let registry = MethodRegistry::new();
        let entry = registry.get((TYPE_BOOL, "and")).unwrap();
        let builtin = match entry {
            MethodEntry::Builtin(b) => *b,
            _ => panic!("expected builtin"),
        };
        let err = (builtin.concrete)(Value::from_int(1), &[Value::TRUE]);
        assert!(err.is_err());
    }
}
