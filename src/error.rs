//! Error kinds the core must distinguish (spec.md §7).
//!
//! Split the same way `fuel-vm` splits `InterpreterError` from its inner
//! panic-reason codes: a flat reason enum (`GuestPanic`) embedded in the
//! outer error that the host sees (`InterpreterError`), plus two
//! JIT-pipeline-internal error kinds (`RecordAbort`, `CodegenError`) that
//! never escape the driver — they only ever cause a fallback to pure
//! interpretation.

use crate::bytecode::ProgramPoint;
use derive_more::Display;

/// Concrete reason a guest-level operation could not proceed.
///
/// Mirrors `fuel_asm::PanicReason`'s role: a small, data-driven set of
/// reason codes rather than a string.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum GuestPanic {
    /// An operation expected an integer-tagged value and didn't get one.
    #[display(fmt = "value is not an integer")]
    NotAnInteger,
    /// An operation expected an object-tagged value and didn't get one.
    #[display(fmt = "value is not an object")]
    NotAnObject,
    /// An operation expected a boolean-tagged value and didn't get one.
    #[display(fmt = "value is not a boolean")]
    NotABoolean,
    /// No method was registered for `(type_index, name)`.
    #[display(fmt = "unknown method {_1:?} for type {_0}")]
    UnknownMethod(u32, &'static str),
    /// `/` or `%` with a zero divisor.
    #[display(fmt = "division by zero")]
    DivisionByZero,
}

/// Errors surfaced from the interpreter driver to the embedding host.
///
/// These are the only `trax` errors a caller of [`crate::Interpreter::run`]
/// ever sees; everything JIT-pipeline-internal degrades to interpretation
/// instead (spec.md §7 propagation policy).
#[derive(Debug, Display)]
pub enum InterpreterError {
    /// A bytecode instruction hit a [`GuestPanic`].
    #[display(fmt = "execution error: {_0}")]
    Panic(GuestPanic),
    /// `run` reached the end of a method's code without a `Return`.
    #[display(fmt = "method ended without returning")]
    FellOffEnd,
    /// An OS-level failure while managing executable memory. Fatal.
    #[display(fmt = "os error: {_0}")]
    Os(OsError),
}

impl From<GuestPanic> for InterpreterError {
    fn from(p: GuestPanic) -> Self {
        Self::Panic(p)
    }
}

impl From<OsError> for InterpreterError {
    fn from(e: OsError) -> Self {
        Self::Os(e)
    }
}

impl std::error::Error for InterpreterError {}

/// Why the recorder gave up on the trace currently being built.
///
/// Never propagated: on any of these the driver discards the in-progress
/// IR, blacklists the anchor (spec.md §4.3 "implicit back-off"), and
/// resumes plain interpretation.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum RecordAbort {
    /// The instruction stream grew past the configured bound.
    #[display(fmt = "trace exceeded {_0} instructions")]
    TooLong(usize),
    /// A method already on the shadow call stack was entered again.
    #[display(fmt = "method {_0:?} re-entered while recording")]
    Reentrant(ProgramPoint),
    /// The recorder doesn't know how to shadow this construct.
    #[display(fmt = "unsupported construct while recording: {_0}")]
    Unsupported(&'static str),
    /// A `Return` landed on a program point that doesn't match the shadow
    /// call stack's expectation (spec.md §9, second bullet: preserve the
    /// assertion, abort rather than panic).
    #[display(fmt = "return program point mismatch: expected {_0:?}, got {_1:?}")]
    ReturnMismatch(ProgramPoint, ProgramPoint),
}

/// Failures during register allocation or machine-code emission.
///
/// Like [`RecordAbort`], absorbed by the driver: the trace is discarded and
/// the anchor blacklisted (spec.md §7).
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum CodegenError {
    /// The linear-scan allocator ran out of registers (spec.md §4.5:
    /// spilling is left unspecified; this crate raises instead).
    #[display(fmt = "register allocator exhausted")]
    OutOfRegisters,
    /// A relocated branch's target does not fit in the instruction's
    /// offset field (26 bits for `B`, 19 bits for `B.cond`).
    #[display(fmt = "branch offset {_0} out of range for a {_1}-bit field")]
    OffsetOutOfRange(i64, u8),
    /// A relocation target (or site) was not 4-byte aligned.
    #[display(fmt = "unaligned branch target at offset {_0}")]
    Misaligned(usize),
}

/// A failed `mmap`/`mprotect`, carrying the raw `errno` (spec.md §7: this
/// is the one JIT-pipeline error that is fatal and must propagate).
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[display(fmt = "{op} failed, errno={errno}")]
pub struct OsError {
    pub op: &'static str,
    pub errno: i32,
}

impl std::error::Error for OsError {}

pub type InterpResult<T> = Result<T, InterpreterError>;
pub type RecordResult<T> = Result<T, RecordAbort>;
pub type CodegenResult<T> = Result<T, CodegenError>;
