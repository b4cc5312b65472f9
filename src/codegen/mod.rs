//! AArch64 code generation (spec.md §4.6).
//!
//! `asm` is the instruction-word encoder, `reloc` its relocation/label
//! support, and `lower` the IR-to-machine-code pass that ties them
//! together into [`lower::compile_trace`].

pub mod asm;
pub mod lower;
pub mod reloc;

pub use lower::{compile_trace, exit_buffer_words, getvar_layout, CompiledTrace};
