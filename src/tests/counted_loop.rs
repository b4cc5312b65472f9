//! Scenario 2: counted loop (spec.md §8 #2).
//!
//! `Int:sum_to` returns `1+2+...+(self-1)`. Exercised once under plain
//! interpretation (a high `trace_threshold` that never fires) and once,
//! aarch64 only, with a low threshold that forces a trace install partway
//! through the loop — the *Trace equivalence* invariant (spec.md §8):
//! both must agree on the final value.

use super::TraceTestBuilder;
use crate::bytecode::Instruction::*;
use crate::value::{Value, TYPE_INT};

fn sum_to_method() -> (crate::bytecode::MethodKey, Vec<crate::bytecode::Instruction>, Vec<Value>) {
    let key = (TYPE_INT, "sum_to");
    let code = vec![
        PushConst(0),                        // 0: 0
        SetVar(1),                           // 1: sum = 0
        PushConst(1),                        // 2: 1
        SetVar(2),                           // 3: i = 1
        GetVar(2),                           // 4: i
        GetVar(0),                           // 5: self
        Call { name: "<", n_args: 1 },       // 6: i < self
        JmpIfNot { offset: 9 },              // 7: -> 17
        GetVar(1),                           // 8: sum
        GetVar(2),                           // 9: i
        Call { name: "+", n_args: 1 },       // 10: sum + i
        SetVar(1),                           // 11: sum = ...
        GetVar(2),                           // 12: i
        PushConst(1),                        // 13: 1
        Call { name: "+", n_args: 1 },       // 14: i + 1
        SetVar(2),                           // 15: i = ...
        Jmp { offset: -13, loop_back: true }, // 16: -> 4
        GetVar(1),                           // 17: sum
        Return,                              // 18
    ];
    (key, code, vec![Value::from_int(0), Value::from_int(1)])
}

#[test]
fn sum_to_101_is_5050_under_plain_interpretation() {
    let (key, code, consts) = sum_to_method();
    let result = TraceTestBuilder::new().trace_threshold(1_000_000).with_method(key, code, consts).run(key, vec![Value::from_int(101)]).unwrap();
    assert_eq!(result.to_int().unwrap(), 5050);
}

#[test]
fn sum_to_1_is_0_the_loop_never_runs() {
    let (key, code, consts) = sum_to_method();
    let result = TraceTestBuilder::new().trace_threshold(1_000_000).with_method(key, code, consts).run(key, vec![Value::from_int(1)]).unwrap();
    assert_eq!(result.to_int().unwrap(), 0);
}

/// Native execution requires running real AArch64 machine code
/// (`exec_memory::NativeTrace::call`), so this half of the scenario is
/// only meaningful on that target.
#[cfg(target_arch = "aarch64")]
#[test]
fn sum_to_101_matches_plain_interpretation_once_a_trace_installs() {
    let (key, code, consts) = sum_to_method();
    // threshold=2 crosses well before i reaches 100, so by the time the
    // loop finishes a trace has been recorded, compiled, and installed,
    // and later iterations of *this same call* run through native code.
    let result = TraceTestBuilder::new().trace_threshold(2).with_method(key, code, consts).run(key, vec![Value::from_int(101)]).unwrap();
    assert_eq!(result.to_int().unwrap(), 5050);
}
