//! Core of a meta-tracing JIT for a tiny dynamically-typed object language.
//!
//! An interpreter executes a stack bytecode over tagged [`value::Value`]s.
//! When a back-edge becomes hot the [`recorder`] shadows interpretation with
//! a linear [`ir`] trace, the [`optimizer`] cleans it up, [`regalloc`]
//! assigns registers, and [`codegen`] lowers it to AArch64 machine code
//! installed behind [`exec_memory`]. A failed [`guard`] sends control back to
//! the interpreter with enough state to resume exactly where native code left
//! off.

pub mod alloc_iface;
pub mod bytecode;
pub mod codegen;
pub mod error;
pub mod exec_memory;
pub mod guard;
pub mod interpreter;
pub mod ir;
pub mod liveness;
pub mod methods;
pub mod optimizer;
pub mod recorder;
pub mod regalloc;
pub mod runtime;
pub mod value;

pub use error::{CodegenError, GuestPanic, InterpreterError, OsError, RecordAbort};
pub use interpreter::Interpreter;
pub use runtime::{Runtime, RuntimeConfig};
pub use value::Value;

#[cfg(test)]
mod tests;
