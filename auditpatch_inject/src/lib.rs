// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Loaded into logd, this rewrites the SELinux contexts of root managers in
//! the audit lines it formats, so they read as an ordinary privileged app.

use std::panic::AssertUnwindSafe;

mod config;
mod hooks;
mod log_target;

#[cfg(feature = "frida")]
fn backend() -> hooks::frida::FridaBackend {
    hooks::frida::FridaBackend::new()
}

#[cfg(not(feature = "frida"))]
fn backend() -> plt_hook::PltHooker {
    plt_hook::PltHooker::new()
}

#[cfg(not(test))]
#[ctor::ctor]
fn init() {
    let config = config::Config::from_env();
    log_target::init(&config.log_filter);
    tracing::info!("Initializing audit log patch...");

    // a panic must not take the host process down with it
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| unsafe {
        hooks::install(&config, hooks::HOOKS, backend())
    }));

    match result {
        Ok(Ok(n)) => tracing::info!("PLT hook success ({n} hooks)"),
        Ok(Err(e)) => tracing::error!("{e}"),
        Err(_) => tracing::error!("panicked while installing hooks"),
    }
}
