// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Hooking through Frida's interceptor.
//!
//! Unlike GOT patching this rewrites the start of the function itself, so
//! every caller in the process is redirected, not only the target library.

use std::{ffi::c_void, ptr, sync::OnceLock};

use frida_gum::{interceptor::Interceptor, Gum, Module, NativePointer};
use proc_maps::{LibraryIdentity, ProcessSelector};

use super::{BackendError, HookBackend};

static GUM: OnceLock<Gum> = OnceLock::new();

fn gum() -> &'static Gum {
    GUM.get_or_init(|| unsafe { Gum::obtain() })
}

pub struct FridaBackend {
    interceptor: Interceptor<'static>,
    originals: Vec<*mut c_void>,
    /// Functions replaced in the current transaction.
    replaced: Vec<NativePointer>,
    /// Functions replaced by the last commit.
    committed: Vec<NativePointer>,
    in_transaction: bool,
}

impl FridaBackend {
    pub fn new() -> FridaBackend {
        FridaBackend {
            interceptor: Interceptor::obtain(gum()),
            originals: Vec::new(),
            replaced: Vec::new(),
            committed: Vec::new(),
            in_transaction: false,
        }
    }

    fn module_path(target: LibraryIdentity) -> Result<String, BackendError> {
        let maps = proc_maps::scan(ProcessSelector::SelfProcess)?;
        let entry = maps
            .with_identity(target)
            .next()
            .ok_or_else(|| format!("nothing mapped from {target}"))?;
        let path = entry
            .path()
            .and_then(|p| p.to_str())
            .ok_or_else(|| format!("mapping of {target} has no usable path"))?;
        Ok(path.to_string())
    }
}

impl HookBackend for FridaBackend {
    fn register(
        &mut self,
        target: LibraryIdentity,
        symbol: &str,
        replacement: *const c_void,
    ) -> Result<(), BackendError> {
        let path = Self::module_path(target)?;
        let export = Module::find_export_by_name(Some(path.as_str()), symbol)
            .ok_or_else(|| format!("{symbol} is not exported by {path}"))?;
        let function = export.0;

        if !self.in_transaction {
            self.interceptor.begin_transaction();
            self.in_transaction = true;
        }

        let orig = self
            .interceptor
            .replace(
                export,
                NativePointer(replacement as *mut c_void),
                NativePointer(ptr::null_mut()),
            )
            .map_err(|e| format!("Frida failed: {e:?}"))?;
        self.originals.push(orig.0);
        self.replaced.push(NativePointer(function));

        Ok(())
    }

    fn commit(&mut self) -> Result<Vec<*mut c_void>, BackendError> {
        if self.in_transaction {
            self.interceptor.end_transaction();
            self.in_transaction = false;
        }
        self.committed = std::mem::take(&mut self.replaced);
        Ok(std::mem::take(&mut self.originals))
    }

    fn revert(&mut self) -> Result<(), BackendError> {
        let committed = std::mem::take(&mut self.committed);
        if committed.is_empty() {
            return Ok(());
        }
        self.interceptor.begin_transaction();
        for function in committed {
            self.interceptor.revert(function);
        }
        self.interceptor.end_transaction();
        Ok(())
    }
}
