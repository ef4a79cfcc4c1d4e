//! Executable code memory with W^X discipline.
//!
//! Code is assembled into an anonymous read-write mapping, then the mapping
//! is flipped to read-execute before an entry pointer is ever handed out.
//! The mapping is never writable and executable at the same time.

use std::ptr;

use tracing::warn;

/// Entry point signature shared by all emitted blocks: takes the guest GPR
/// file (16 slots, encoding order) and returns the next guest RIP.
pub type NativeEntry = unsafe extern "sysv64" fn(*mut u64) -> u64;

pub struct CodeBuffer {
    ptr: *mut u8,
    map_len: usize,
}

// The mapping is owned exclusively by this buffer and immutable (read,
// execute) after construction.
unsafe impl Send for CodeBuffer {}
unsafe impl Sync for CodeBuffer {}

impl CodeBuffer {
    /// Map `code` into executable memory. Returns `None` when the kernel
    /// refuses the mapping (W^X-restricted environments).
    pub fn executable(code: &[u8]) -> Option<CodeBuffer> {
        if code.is_empty() {
            return None;
        }
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let map_len = code.len().div_ceil(page) * page;

        // SAFETY: anonymous private mapping, no fd, length is non-zero.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            warn!(len = map_len, "mmap for code buffer failed");
            return None;
        }
        let ptr = ptr as *mut u8;

        // SAFETY: the mapping is at least code.len() bytes and not aliased.
        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }

        // SAFETY: ptr/map_len describe the mapping created above.
        let rc = unsafe { libc::mprotect(ptr as *mut _, map_len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            warn!(len = map_len, "mprotect to read-execute failed");
            // SAFETY: unmapping the mapping created above.
            unsafe {
                libc::munmap(ptr as *mut _, map_len);
            }
            return None;
        }

        Some(CodeBuffer { ptr, map_len })
    }

    /// The emitted entry point.
    ///
    /// # Safety
    ///
    /// Calling the returned function runs the emitted machine code; the
    /// caller must pass a pointer to at least 16 writable `u64` slots.
    pub unsafe fn entry(&self) -> NativeEntry {
        // SAFETY: the buffer holds a complete function emitted for this
        // signature and stays mapped for the buffer's lifetime.
        unsafe { std::mem::transmute::<*mut u8, NativeEntry>(self.ptr) }
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/map_len describe a live mapping owned by this buffer.
        unsafe {
            libc::munmap(self.ptr as *mut _, self.map_len);
        }
    }
}
