//! Executable-memory provider.
//!
//! Maps an anonymous region that is readable, writable and executable at
//! once. Translation is single-pass and finishes before the first byte
//! executes, so no W^X permission flipping is needed.

use std::ptr;
use std::slice;

use crate::cpu::VmError;

/// An owned RWX mapping, released on drop.
pub struct ExecMem {
    ptr: *mut u8,
    len: usize,
}

impl ExecMem {
    /// Maps at least `size` bytes of RWX memory, rounded up to the page
    /// size.
    pub fn new(size: usize) -> Result<ExecMem, VmError> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = (size + page - 1) & !(page - 1);

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(VmError::ExecAllocFailed(len));
        }

        Ok(ExecMem {
            ptr: ptr as *mut u8,
            len,
        })
    }

    pub fn base(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for ExecMem {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}
