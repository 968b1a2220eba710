// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Installing hooks at load time.
//!
//! The actual redirection of calls is somebody else's job (a [`HookBackend`]):
//! by default GOT patching of the target library's imports, or Frida's
//! interceptor with the `frida` feature. This module finds the target, asks
//! the backend for the hooks, and files away the originals for the detours.

#[cfg(feature = "frida")]
pub mod frida;
pub mod vasprintf;

use std::{ffi::c_void, mem, sync::OnceLock};

use proc_maps::{LibraryIdentity, LocateError, ProcessSelector};

use crate::config::Config;

pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Hooks every detour in here goes through.
pub static HOOKS: &[&dyn Hooks] = &[&vasprintf::VasprintfHooks {}];

/// A function we hook, and the original implementation once hooked.
pub struct LibItem<TFun> {
    fun_name: &'static str,
    orig: OnceLock<TFun>,
}

impl<TFun: Copy> LibItem<TFun> {
    pub const fn new(fun_name: &'static str) -> LibItem<TFun> {
        LibItem {
            fun_name,
            orig: OnceLock::new(),
        }
    }

    /// The original function, if the hook has been committed.
    pub fn get(&self) -> Option<TFun> {
        self.orig.get().copied()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Failed to find target library: {0}")]
    LibraryNotFound(#[from] LocateError),
    #[error("Failed to register {symbol} hook: {source}")]
    RegistrationFailed {
        symbol: &'static str,
        source: BackendError,
    },
    #[error("Failed to commit hooks: {0}")]
    CommitFailed(BackendError),
}

/// Something that can redirect calls to a function of a loaded library.
///
/// Registration only queues; nothing changes in the process until
/// `commit`, which activates every queued hook or none.
pub trait HookBackend {
    fn register(
        &mut self,
        target: LibraryIdentity,
        symbol: &str,
        replacement: *const c_void,
    ) -> Result<(), BackendError>;

    /// Returns the original of each registered hook, in registration order.
    fn commit(&mut self) -> Result<Vec<*mut c_void>, BackendError>;

    /// Undoes the last successful commit.
    fn revert(&mut self) -> Result<(), BackendError>;
}

impl HookBackend for plt_hook::PltHooker {
    fn register(
        &mut self,
        target: LibraryIdentity,
        symbol: &str,
        replacement: *const c_void,
    ) -> Result<(), BackendError> {
        Ok(plt_hook::PltHooker::register(
            self,
            target,
            symbol,
            replacement,
        )?)
    }

    fn commit(&mut self) -> Result<Vec<*mut c_void>, BackendError> {
        let originals = plt_hook::PltHooker::commit(self)?;
        Ok(originals.into_iter().map(|o| o.address).collect())
    }

    fn revert(&mut self) -> Result<(), BackendError> {
        Ok(plt_hook::PltHooker::revert(self)?)
    }
}

struct PendingHook {
    fun_name: &'static str,
    store: Box<dyn FnOnce(*mut c_void)>,
}

pub struct HookService {
    backend: Box<dyn HookBackend>,
    pending: Vec<PendingHook>,
}

/// # Safety
/// `T` must be valid when reinterpreted as a `U`.
unsafe fn transmute_same_size<T: Copy, U>(val: T) -> U {
    assert_eq!(mem::size_of::<T>(), mem::size_of::<U>());
    let val2: U = std::mem::transmute_copy(&val);
    val2
}

impl HookService {
    pub fn new(backend: impl HookBackend + 'static) -> HookService {
        HookService {
            backend: Box::new(backend),
            pending: Vec::new(),
        }
    }

    /// Registers `replacement` for `item`'s function inside `target`. The
    /// original lands in `item` once [`HookService::commit`] succeeds.
    ///
    /// # Safety
    /// `TFun` must be an `extern "C"` function pointer type matching the
    /// real signature of the hooked function.
    pub unsafe fn hook_import<TFun: Copy + Send + Sync + 'static>(
        &mut self,
        target: LibraryIdentity,
        item: &'static LibItem<TFun>,
        replacement: TFun,
    ) -> Result<(), HookError> {
        let replacement: *const c_void = transmute_same_size(replacement);

        self.backend
            .register(target, item.fun_name, replacement)
            .map_err(|source| HookError::RegistrationFailed {
                symbol: item.fun_name,
                source,
            })?;

        self.pending.push(PendingHook {
            fun_name: item.fun_name,
            store: Box::new(move |orig| {
                let orig: TFun = unsafe { transmute_same_size(orig) };
                let _ = item.orig.set(orig);
            }),
        });

        Ok(())
    }

    /// Activates everything registered so far and returns how many hooks
    /// went live.
    ///
    /// The originals are only stored once the backend has activated the
    /// detours, so a call racing with this sees no original and fails. This
    /// runs from the constructor before the host has threads of its own.
    pub fn commit(&mut self) -> Result<usize, HookError> {
        let pending = mem::take(&mut self.pending);
        let originals = self.backend.commit().map_err(HookError::CommitFailed)?;

        let problem = if originals.len() != pending.len() {
            Some(format!(
                "backend returned {} originals for {} hooks",
                originals.len(),
                pending.len()
            ))
        } else {
            pending
                .iter()
                .zip(&originals)
                .find(|(_, orig)| orig.is_null())
                .map(|(hook, _)| format!("backend returned a null original for {}", hook.fun_name))
        };

        if let Some(problem) = problem {
            // nothing may stay patched without an original to call
            if let Err(e) = self.backend.revert() {
                tracing::error!("could not undo hooks: {e}");
            }
            return Err(HookError::CommitFailed(problem.into()));
        }

        let live = pending.len();
        for (hook, orig) in pending.into_iter().zip(originals) {
            tracing::debug!("{} original at {orig:p}", hook.fun_name);
            (hook.store)(orig);
        }

        Ok(live)
    }
}

/// One intercepted function.
pub trait Hooks: Send + Sync {
    /// Name used for disabling this particular hook
    fn name(&self) -> &'static str;

    /// Registers the hook against the located target library.
    ///
    /// # Safety
    /// See [`HookService::hook_import`].
    unsafe fn apply(
        &self,
        hook_service: &mut HookService,
        target: LibraryIdentity,
    ) -> Result<(), HookError>;
}

/// Finds the target library, registers every enabled hook in `hooks` and
/// commits them together. Returns the number of hooks installed.
///
/// # Safety
/// Must run before anything can call the hooked functions concurrently.
pub unsafe fn install(
    config: &Config,
    hooks: &[&dyn Hooks],
    backend: impl HookBackend + 'static,
) -> Result<usize, HookError> {
    let target = proc_maps::locate_library(ProcessSelector::SelfProcess, &config.target_library)?;
    tracing::debug!("target {:?} is {target}", config.target_library);

    let mut hook_service = HookService::new(backend);
    for &hook in hooks {
        if config.is_disabled(hook.name()) {
            tracing::info!("hook {} disabled", hook.name());
            continue;
        }
        hook.apply(&mut hook_service, target)?;
    }

    hook_service.commit()
}
