// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Hooking vasprintf, which logd's LogAudit builds its audit lines with.

use std::ffi::{c_char, c_int};

use audit_rewrite::{VaListRef, Vasprintf, SELINUX_CONTEXTS};
use proc_maps::LibraryIdentity;

use super::{HookError, HookService, Hooks, LibItem};

pub static VASPRINTF: LibItem<Vasprintf> = LibItem::new("vasprintf");

unsafe extern "C" fn vasprintf_detour(
    strp: *mut *mut c_char,
    fmt: *const c_char,
    ap: VaListRef,
) -> c_int {
    // we are only reachable once committed, at which point this is set
    let Some(orig) = VASPRINTF.get() else {
        return -1;
    };
    audit_rewrite::intercept(orig, strp, fmt, ap, &SELINUX_CONTEXTS)
}

pub struct VasprintfHooks {}

impl Hooks for VasprintfHooks {
    fn name(&self) -> &'static str {
        "vasprintf"
    }

    unsafe fn apply(
        &self,
        hook_service: &mut HookService,
        target: LibraryIdentity,
    ) -> Result<(), HookError> {
        hook_service.hook_import(target, &VASPRINTF, vasprintf_detour as Vasprintf)
    }
}

#[cfg(test)]
mod test {
    use std::{
        ffi::{c_void, CStr, CString},
        ptr,
    };

    use super::*;
    use crate::hooks::{BackendError, HookBackend};

    unsafe extern "C" fn fake_vasprintf(
        strp: *mut *mut c_char,
        fmt: *const c_char,
        _ap: VaListRef,
    ) -> c_int {
        *strp = libc::strdup(fmt);
        libc::strlen(*strp) as c_int
    }

    /// Hands back `fake_vasprintf` as the original of whatever is hooked.
    struct FakeOriginal;

    impl HookBackend for FakeOriginal {
        fn register(
            &mut self,
            _target: LibraryIdentity,
            symbol: &str,
            replacement: *const c_void,
        ) -> Result<(), BackendError> {
            assert_eq!(symbol, "vasprintf");
            assert_eq!(replacement, vasprintf_detour as Vasprintf as *const c_void);
            Ok(())
        }

        fn commit(&mut self) -> Result<Vec<*mut c_void>, BackendError> {
            Ok(vec![fake_vasprintf as Vasprintf as *mut c_void])
        }

        fn revert(&mut self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn call_detour(input: &str) -> (c_int, String) {
        let fmt = CString::new(input).unwrap();
        let mut strp = ptr::null_mut();
        let ret = unsafe { vasprintf_detour(&mut strp, fmt.as_ptr(), VaListRef::null()) };
        let out = unsafe { CStr::from_ptr(strp) }.to_string_lossy().into_owned();
        unsafe { libc::free(strp as *mut c_void) };
        (ret, out)
    }

    #[test]
    fn test_detour_through_committed_original() {
        let target = LibraryIdentity { dev: 1, inode: 2 };
        let mut svc = HookService::new(FakeOriginal);
        unsafe { VasprintfHooks {}.apply(&mut svc, target) }.unwrap();

        assert_eq!(svc.commit().unwrap(), 1);
        assert!(VASPRINTF.get().is_some());

        let (ret, out) = call_detour("avc: denied { ioctl } tcontext=u:r:magisk:s0 tclass=chr_file");
        assert_eq!(
            out,
            "avc: denied { ioctl } tcontext=u:r:priv_app:s0:c512,c768 tclass=chr_file"
        );
        assert_eq!(ret as usize, out.len());

        let (ret, out) = call_detour("nothing to see");
        assert_eq!(out, "nothing to see");
        assert_eq!(ret, 14);
    }
}
