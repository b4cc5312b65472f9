//! End-to-end scenario tests (spec.md §8 "End-to-end scenarios").
//!
//! Grounded on `fuel-vm/src/tests/mod.rs`: one file per scenario, built on
//! a small test-only builder (`TraceTestBuilder`, analogous to `fuel-vm`'s
//! `TestBuilder`) that assembles a constant table and method map by hand,
//! since no parser/AST is in scope (spec.md §1).

use crate::bytecode::{Instruction, MethodKey};
use crate::error::InterpResult;
use crate::interpreter::Interpreter;
use crate::methods::MethodRegistry;
use crate::runtime::{Runtime, RuntimeConfig};
use crate::value::Value;

mod counted_loop;
mod polymorphic_exit;

/// Hand-assembles a method table and runs it to completion, standing in
/// for the bytecode compiler this core has no use for (spec.md §1
/// Non-goal).
pub struct TraceTestBuilder {
    registry: MethodRegistry,
    config: RuntimeConfig,
}

impl TraceTestBuilder {
    pub fn new() -> Self {
        TraceTestBuilder { registry: MethodRegistry::new(), config: RuntimeConfig::default() }
    }

    pub fn with_method(mut self, key: MethodKey, code: Vec<Instruction>, constants: Vec<Value>) -> Self {
        self.registry.insert_bytecode(key, code, constants);
        self
    }

    /// Back-edge count at which a loop starts recording (spec.md §4.2).
    /// Defaults to `RuntimeConfig::default()`'s `2`; set high to keep a
    /// scenario under plain interpretation, low to force a trace install.
    pub fn trace_threshold(mut self, n: u32) -> Self {
        self.config.trace_threshold = n;
        self
    }

    pub fn build(self) -> Runtime {
        Runtime::new(self.config, self.registry)
    }

    /// Build the runtime and run `key` once to completion.
    pub fn run(self, key: MethodKey, args: Vec<Value>) -> InterpResult<Value> {
        let mut runtime = self.build();
        Interpreter::new(&mut runtime).run(key, args)
    }
}

impl Default for TraceTestBuilder {
    fn default() -> Self {
        Self::new()
    }
}
