//! Bundled mutable state the interpreter driver threads through every
//! step (spec.md §9 "Global mutable state").
//!
//! Grounded on `fuel_vm::Interpreter<S, Ecal, Tx>`'s pattern of bundling
//! all mutable VM state behind one struct passed explicitly through every
//! call, replacing the Python original's module-level counters and
//! registries (`trax_interp.py`'s `hotness_counters`/`compiled_traces`
//! globals).

use crate::alloc_iface::{BumpAllocator, ObjectAllocator};
use crate::bytecode::ProgramPoint;
use crate::codegen::CompiledTrace;
use crate::error::InterpResult;
use crate::exec_memory::NativeTrace;
use crate::guard::ExitTable;
use crate::methods::MethodRegistry;
use crate::regalloc::RegisterPool;
use std::collections::HashMap;

/// A hotness counter low enough that it will never again cross
/// [`RuntimeConfig::trace_threshold`] — the "implicit back-off" spec.md
/// §4.3 describes for a blacklisted anchor.
const BLACKLISTED: i64 = i64::MIN / 2;

/// Tunables fixed at construction time (spec.md §1 Non-goal: no CLI/env
/// config; SPEC_FULL.md §3).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Back-edge count at which recording starts for a program point
    /// (spec.md §4.2, default 2).
    pub trace_threshold: u32,
    /// Recorder abort bound (spec.md §4.3 "the trace grows beyond a
    /// bound").
    pub max_trace_instructions: usize,
    /// The general-purpose register pool codegen allocates from
    /// (spec.md §4.5).
    pub register_pool: RegisterPool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            trace_threshold: 2,
            max_trace_instructions: 10_000,
            register_pool: RegisterPool::aarch64_default(),
        }
    }
}

/// A compiled trace plus the side-exit table codegen's guard checks
/// reference by id (spec.md §3 "Guard Descriptor"), and the shape the
/// driver needs to pack a native call's inputs buffer: how many words
/// come straight from the current frame's locals/eval-stack, and which
/// local index feeds each trailing `GetVar` slot (spec.md §6 "Native
/// trace ABI").
pub struct InstalledTrace {
    pub native: NativeTrace,
    pub consts: Vec<i64>,
    pub exits: ExitTable,
    pub n_locals: usize,
    pub n_stack: usize,
    pub getvar_layout: Vec<u32>,
}

/// All mutable VM state (spec.md §9), threaded explicitly rather than
/// kept in statics: hotness counters, installed traces, the method table,
/// and the object allocator handle.
pub struct Runtime {
    pub config: RuntimeConfig,
    pub methods: MethodRegistry,
    allocator: Box<dyn ObjectAllocator>,
    hotness: HashMap<ProgramPoint, i64>,
    traces: HashMap<ProgramPoint, InstalledTrace>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig, methods: MethodRegistry) -> Self {
        Runtime {
            config,
            methods,
            allocator: Box::new(BumpAllocator::new()),
            hotness: HashMap::new(),
            traces: HashMap::new(),
        }
    }

    pub fn with_allocator(config: RuntimeConfig, methods: MethodRegistry, allocator: Box<dyn ObjectAllocator>) -> Self {
        Runtime { config, methods, allocator, hotness: HashMap::new(), traces: HashMap::new() }
    }

    pub fn allocator(&self) -> &dyn ObjectAllocator {
        self.allocator.as_ref()
    }

    pub fn trace_at(&self, point: ProgramPoint) -> Option<&InstalledTrace> {
        self.traces.get(&point)
    }

    /// Bump `point`'s back-edge counter and report whether it just
    /// crossed the threshold (spec.md §4.2 "Hotness and trace
    /// activation").
    pub fn record_back_edge(&mut self, point: ProgramPoint) -> bool {
        let counter = self.hotness.entry(point).or_insert(0);
        if *counter <= BLACKLISTED {
            return false;
        }
        *counter += 1;
        *counter == self.config.trace_threshold as i64
    }

    /// Apply the implicit back-off a record abort triggers (spec.md
    /// §4.3 "the anchor is blacklisted by setting its counter to a large
    /// negative value").
    pub fn blacklist(&mut self, point: ProgramPoint) {
        tracing::debug!(?point, "blacklisting anchor after record abort");
        self.hotness.insert(point, BLACKLISTED);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn install_trace(
        &mut self,
        point: ProgramPoint,
        compiled: CompiledTrace,
        exits: ExitTable,
        n_locals: usize,
        n_stack: usize,
        getvar_layout: Vec<u32>,
    ) -> InterpResult<()> {
        let native = NativeTrace::install(&compiled.code)?;
        tracing::debug!(?point, "installed native trace");
        self.traces.insert(
            point,
            InstalledTrace { native, consts: compiled.consts, exits, n_locals, n_stack, getvar_layout },
        );
        Ok(())
    }
}
