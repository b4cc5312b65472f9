//! Executable memory and the native call gateway (spec.md §5, §6 "To the
//! OS").
//!
//! Grounded on `trax_backend.py`'s `create_executable_memory`/
//! `call_function` (`mmap` RW, copy, `mprotect` RX, `ctypes.CFUNCTYPE`
//! call) and enriched with direct `libc` usage in the style
//! `trailofbits-mttn` uses for its own OS-level interop — the teacher
//! itself (`fuel-vm`) never touches raw syscalls, since a blockchain VM
//! has no native codegen of its own.

use crate::error::{InterpResult, OsError};
use crate::guard::GuardId;
use std::ptr::NonNull;

/// A single page-aligned, RWX-lifecycle-managed block of machine code,
/// installed once and called many times (spec.md §3 "Compiled traces
/// persist until process exit").
///
/// `(inputs, consts, exit_buf) -> guard_id` (spec.md §4.6 calling
/// convention). Not `Send`/`Sync`: the core is single-threaded
/// (spec.md §5).
pub struct NativeTrace {
    ptr: NonNull<u8>,
    len: usize,
    entry: unsafe extern "C" fn(*const i64, *const i64, *mut i64) -> u32,
}

impl NativeTrace {
    /// Map `code` as executable memory and return a callable handle
    /// (spec.md §5 "page-aligned chunks... RW during copy, then flipped to
    /// RX").
    pub fn install(code: &[u8]) -> InterpResult<Self> {
        let page_size = page_size();
        let len = round_up(code.len().max(1), page_size);

        tracing::debug!(bytes = code.len(), mapped = len, "mmap trace");
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(OsError { op: "mmap", errno: last_errno() }.into());
        }
        let ptr = NonNull::new(map as *mut u8).expect("mmap returned a non-null success value");

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr.as_ptr(), code.len());
        }

        tracing::debug!(len, "mprotect trace RX");
        let rc = unsafe { libc::mprotect(ptr.as_ptr() as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            let errno = last_errno();
            unsafe {
                libc::munmap(ptr.as_ptr() as *mut libc::c_void, len);
            }
            return Err(OsError { op: "mprotect", errno }.into());
        }

        flush_icache(ptr.as_ptr(), len);

        // Safety: the block just went RX and `code` was produced by
        // `codegen::lower::compile_trace`, whose entry point matches this
        // signature (spec.md §4.6 ABI).
        let entry = unsafe { std::mem::transmute::<*mut u8, unsafe extern "C" fn(*const i64, *const i64, *mut i64) -> u32>(ptr.as_ptr()) };

        Ok(NativeTrace { ptr, len, entry })
    }

    /// Invoke the trace (spec.md §6 "Native trace ABI"). `inputs` holds
    /// one tagged value per recorded `Input`/`GetVar` slot, `consts` the
    /// trace's constant table (trailing allocator-address slot included),
    /// and `exit_buf` must be at least [`crate::guard::ExitTable::buffer_len`]
    /// words.
    ///
    /// # Safety
    /// `inputs`/`consts` must be readable for the lengths the trace's IR
    /// expects, and `exit_buf` writable for at least `buffer_len` words.
    pub unsafe fn call(&self, inputs: *const i64, consts: *const i64, exit_buf: *mut i64) -> GuardId {
        tracing::debug!("entering native trace");
        (self.entry)(inputs, consts, exit_buf)
    }
}

impl Drop for NativeTrace {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

fn round_up(n: usize, multiple: usize) -> usize {
    ((n + multiple - 1) / multiple) * multiple
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

/// AArch64 requires an instruction-cache invalidation after writing code
/// and before executing it (spec.md §5 "the implementation must issue the
/// appropriate barrier"). `__builtin___clear_cache` is the portable libc
/// entry point for this on every AArch64 target Rust supports; on other
/// architectures no flush is required (the only target this crate's
/// codegen emits for is AArch64, but this keeps `exec_memory` itself
/// host-portable for tests that only exercise the mmap/mprotect path).
fn flush_icache(ptr: *mut u8, len: usize) {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        extern "C" {
            fn __builtin___clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
        }
        __builtin___clear_cache(ptr as *mut libc::c_char, ptr.add(len) as *mut libc::c_char);
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (ptr, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn installs_and_runs_a_ret_only_trace() {
        // `MOV X0, #7; RET` — ignores its arguments, returns 7 as a
        // "guard id" so the install/call path can be exercised without a
        // full `compile_trace` output.
        let code: [u8; 8] = [0x07, 0x00, 0x80, 0xD2, 0xC0, 0x03, 0x5F, 0xD6];
        let trace = NativeTrace::install(&code).unwrap();
        let guard_id = unsafe { trace.call(std::ptr::null(), std::ptr::null(), std::ptr::null_mut()) };
        assert_eq!(guard_id, 7);
    }

    #[test]
    fn mapped_region_is_page_aligned() {
        let code = [0u8; 4];
        let trace = NativeTrace::install(&code).unwrap();
        assert_eq!(trace.ptr.as_ptr() as usize % page_size(), 0);
    }
}
