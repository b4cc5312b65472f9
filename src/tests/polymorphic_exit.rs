//! Scenario 4: polymorphic exit (spec.md §8 #4).
//!
//! A loop repeatedly dispatches `self.+(i)`, specializing to whichever
//! receiver type was observed while recording. Once a trace is installed
//! for the integer path, calling the same program point with a
//! non-integer `self` must fail the hoisted `GuardInt` at native entry and
//! hand back to the interpreter, which re-dispatches `+` against the
//! receiver's real type and finishes correctly (spec.md §4.3 "Polymorphic
//! dispatch and guards", §7 "Guard failure at native").
//!
//! Entering native code at all requires running real AArch64 machine
//! code, so only the aarch64 half of this scenario is gated; the plain
//! interpretation half (the int path, and a direct Pair call) is
//! portable.

use super::TraceTestBuilder;
use crate::bytecode::Instruction::*;
use crate::value::{HeapObject, Value, FIRST_USER_TYPE, TYPE_INT};

fn poly_loop_method() -> (crate::bytecode::MethodKey, Vec<crate::bytecode::Instruction>, Vec<Value>) {
    let key = (TYPE_INT, "poly_loop");
    let code = vec![
        PushConst(0),                        // 0: 0
        SetVar(2),                           // 1: i = 0
        GetVar(2),                           // 2: i            <- anchor
        GetVar(1),                           // 3: count
        Call { name: "<", n_args: 1 },       // 4: i < count
        JmpIfNot { offset: 9 },              // 5: -> 15
        GetVar(0),                           // 6: self
        GetVar(2),                           // 7: i
        Call { name: "+", n_args: 1 },       // 8: self.+(i)   <- dispatch on self's real type
        SetVar(0),                           // 9: self = ...
        GetVar(2),                           // 10: i
        PushConst(1),                        // 11: 1
        Call { name: "+", n_args: 1 },       // 12: i + 1
        SetVar(2),                           // 13: i = ...
        Jmp { offset: -13, loop_back: true }, // 14: -> 2
        GetVar(0),                           // 15: self
        Return,                              // 16
    ];
    (key, code, vec![Value::from_int(0), Value::from_int(1)])
}

/// `Pair`'s `+`: ignores the argument and returns `self` unchanged. Enough
/// to prove the interpreter dispatched on the *real* receiver type after
/// the native guard failure rather than crashing or silently treating it
/// as an integer.
fn pair_plus_method() -> (crate::bytecode::MethodKey, Vec<crate::bytecode::Instruction>, Vec<Value>) {
    ((FIRST_USER_TYPE, "+"), vec![GetVar(0), Return], vec![])
}

#[test]
fn integer_path_accumulates_under_plain_interpretation() {
    let (key, code, consts) = poly_loop_method();
    let result = TraceTestBuilder::new()
        .trace_threshold(1_000_000)
        .with_method(key, code, consts)
        .run(key, vec![Value::from_int(0), Value::from_int(5)])
        .unwrap();
    // self += i for i in 0..5 -> 0+0+1+2+3+4 = 10.
    assert_eq!(result.to_int().unwrap(), 10);
}

#[cfg(target_arch = "aarch64")]
#[test]
fn a_pair_receiver_guard_fails_at_native_entry_and_finishes_in_the_interpreter() {
    let (key, code, consts) = poly_loop_method();
    let (pair_key, pair_code, pair_consts) = pair_plus_method();

    let mut runtime = TraceTestBuilder::new()
        .trace_threshold(2)
        .with_method(key, code, consts)
        .with_method(pair_key, pair_code, pair_consts)
        .build();

    // First call: integer `self`, enough iterations to cross the
    // threshold and install a trace specialized to `GuardInt(self)`.
    let first = crate::interpreter::Interpreter::new(&mut runtime).run(key, vec![Value::from_int(0), Value::from_int(5)]).unwrap();
    assert_eq!(first.to_int().unwrap(), 10);

    // Second call: a Pair `self`. The installed trace's GuardInt on the
    // receiver fails on its very first iteration; the side exit must
    // still land back in the interpreter at the right program point and
    // let the Pair-specific `+` finish the loop correctly.
    let ptr = runtime.allocator().allocate(3);
    let pair = HeapObject::init(ptr, FIRST_USER_TYPE, &[Value::from_int(1), Value::from_int(2)]).as_value();
    let second = crate::interpreter::Interpreter::new(&mut runtime).run(key, vec![pair, Value::from_int(1)]).unwrap();
    assert!(second.is_object());
    assert_eq!(second.get_field(0).unwrap().to_int().unwrap(), 1);
    assert_eq!(second.get_field(1).unwrap().to_int().unwrap(), 2);
}
