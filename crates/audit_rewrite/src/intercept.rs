// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    ffi::{c_char, c_int, c_void, CStr},
    ptr::NonNull,
};

use crate::{rewrite_with, AllocError, MallocBuf, TokenSet};

/// The `va_list` argument of `vasprintf`, which we never read.
///
/// On every ABI we care about a `va_list` parameter is passed as a single
/// pointer-sized value (array decay on x86_64, by-reference aggregate on
/// aarch64, a one-word struct on arm), so it can be forwarded untouched.
#[repr(transparent)]
#[derive(Clone, Copy, Debug)]
pub struct VaListRef(*mut c_void);

impl VaListRef {
    pub const fn null() -> VaListRef {
        VaListRef(std::ptr::null_mut())
    }
}

pub type Vasprintf =
    unsafe extern "C" fn(strp: *mut *mut c_char, fmt: *const c_char, ap: VaListRef) -> c_int;

/// Runs `original` and then rewrites the string it produced, if it contains
/// any of the sources in `set`.
///
/// Everything that goes wrong here ends in returning the original result
/// untouched; the caller always ends up owning exactly one buffer.
///
/// # Safety
/// Same contract as `vasprintf` itself. `original` must be a real
/// `vasprintf` (or something honouring its contract).
pub unsafe fn intercept(
    original: Vasprintf,
    strp: *mut *mut c_char,
    fmt: *const c_char,
    ap: VaListRef,
    set: &TokenSet<'_>,
) -> c_int {
    intercept_with(original, strp, fmt, ap, set, MallocBuf::try_with_capacity)
}

/// [`intercept`] with the replacement buffer coming from `alloc`.
///
/// # Safety
/// See [`intercept`].
pub unsafe fn intercept_with<A>(
    original: Vasprintf,
    strp: *mut *mut c_char,
    fmt: *const c_char,
    ap: VaListRef,
    set: &TokenSet<'_>,
    alloc: A,
) -> c_int
where
    A: FnOnce(usize) -> Result<MallocBuf, AllocError>,
{
    let result = original(strp, fmt, ap);
    if result <= 0 || strp.is_null() {
        return result;
    }
    let Some(produced) = NonNull::new(*strp) else {
        return result;
    };

    let haystack = CStr::from_ptr(produced.as_ptr()).to_bytes();
    let rewritten = match rewrite_with(haystack, set, alloc) {
        Ok(Some(b)) => b,
        Ok(None) => return result,
        Err(e) => {
            tracing::trace!("{e}, passing through");
            return result;
        }
    };

    let Ok(new_result) = c_int::try_from(rewritten.len()) else {
        return result;
    };

    tracing::trace!(
        old_len = result,
        new_len = new_result,
        "rewrote vasprintf output"
    );

    drop(MallocBuf::from_raw(produced));
    *strp = rewritten.into_raw();
    new_result
}
