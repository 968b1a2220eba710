// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! NUL-terminated byte buffers on the C heap.
//!
//! Whatever we hand back out of `vasprintf` is released by the caller with
//! `free`, so it has to come from `malloc`, not from the Rust allocator.

use std::{
    ffi::{c_char, CStr},
    ptr::{self, NonNull},
    slice,
};

#[derive(Debug, thiserror::Error)]
#[error("failed to allocate {0} bytes")]
pub struct AllocError(pub usize);

/// Owned `malloc` allocation holding `len` bytes followed by a NUL, inside
/// `capacity` bytes of storage.
pub struct MallocBuf {
    ptr: NonNull<u8>,
    len: usize,
    capacity: usize,
}

// Plain heap memory with a single owner.
unsafe impl Send for MallocBuf {}

impl MallocBuf {
    /// Allocates room for `capacity - 1` bytes plus a terminator. The new
    /// buffer holds the empty string.
    pub fn try_with_capacity(capacity: usize) -> Result<MallocBuf, AllocError> {
        let capacity = capacity.max(1);
        let ptr = unsafe { libc::malloc(capacity) } as *mut u8;
        let ptr = NonNull::new(ptr).ok_or(AllocError(capacity))?;
        unsafe { ptr.as_ptr().write(0) };
        Ok(MallocBuf {
            ptr,
            len: 0,
            capacity,
        })
    }

    pub fn try_from_bytes(bytes: &[u8]) -> Result<MallocBuf, AllocError> {
        let mut buf = MallocBuf::try_with_capacity(bytes.len() + 1)?;
        buf.copy_from(bytes);
        Ok(buf)
    }

    /// Takes ownership of a string allocated with `malloc`.
    ///
    /// # Safety
    /// `ptr` must be a live, NUL-terminated `malloc` allocation that nothing
    /// else will free.
    pub unsafe fn from_raw(ptr: NonNull<c_char>) -> MallocBuf {
        let len = CStr::from_ptr(ptr.as_ptr()).to_bytes().len();
        MallocBuf {
            ptr: ptr.cast(),
            len,
            capacity: len + 1,
        }
    }

    /// Gives the allocation to the caller, who must `free` it.
    pub fn into_raw(self) -> *mut c_char {
        let ptr = self.ptr.as_ptr() as *mut c_char;
        std::mem::forget(self);
        ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_bytes_with_nul(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len + 1) }
    }

    /// Replaces the contents with `bytes` and a terminator.
    ///
    /// # Panics
    /// If `bytes` and the terminator do not fit in the capacity.
    pub fn copy_from(&mut self, bytes: &[u8]) {
        assert!(bytes.len() < self.capacity, "copy_from overflows buffer");
        unsafe {
            let base = self.ptr.as_ptr();
            ptr::copy_nonoverlapping(bytes.as_ptr(), base, bytes.len());
            base.add(bytes.len()).write(0);
        }
        self.len = bytes.len();
    }

    /// Replaces `remove` bytes at `at` with `insert`, moving the tail (and
    /// its terminator) to close or open the gap.
    ///
    /// # Panics
    /// If the range is outside the string or the result does not fit.
    pub fn splice(&mut self, at: usize, remove: usize, insert: &[u8]) {
        assert!(
            at <= self.len && remove <= self.len - at,
            "splice range outside string"
        );
        let tail_start = at + remove;
        let new_len = self.len - remove + insert.len();
        assert!(new_len < self.capacity, "splice overflows buffer");

        unsafe {
            let base = self.ptr.as_ptr();
            if insert.len() != remove {
                // source and destination overlap; ptr::copy is memmove
                let tail_len = self.len - tail_start + 1;
                ptr::copy(base.add(tail_start), base.add(at + insert.len()), tail_len);
            }
            ptr::copy_nonoverlapping(insert.as_ptr(), base.add(at), insert.len());
        }
        self.len = new_len;
    }
}

impl Drop for MallocBuf {
    fn drop(&mut self) {
        unsafe { libc::free(self.ptr.as_ptr() as *mut libc::c_void) }
    }
}

impl std::fmt::Debug for MallocBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MallocBuf")
            .field("contents", &String::from_utf8_lossy(self.as_bytes()))
            .field("capacity", &self.capacity)
            .finish()
    }
}
