// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Settings taken from the environment of the process we are loaded into.

pub const LOG_VAR: &str = "AUDITPATCH_LOG";
pub const LIBRARY_VAR: &str = "AUDITPATCH_LIBRARY";
pub const DISABLE_VAR: &str = "AUDITPATCH_DISABLE";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Fragment of the path of the library whose imports get hooked.
    pub target_library: String,
    /// `EnvFilter` directives.
    pub log_filter: String,
    /// Names of hooks not to install.
    pub disabled: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            target_library: "libc.so".into(),
            log_filter: "info".into(),
            disabled: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Config {
        Config::from_lookup(|k| std::env::var(k).ok())
    }

    /// Builds a config out of `lookup`; unset or blank values keep their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Config {
        let get = |k| lookup(k).filter(|v: &String| !v.trim().is_empty());
        let mut config = Config::default();

        if let Some(lib) = get(LIBRARY_VAR) {
            config.target_library = lib.trim().to_string();
        }
        if let Some(filter) = get(LOG_VAR) {
            config.log_filter = filter;
        }
        if let Some(disabled) = get(DISABLE_VAR) {
            config.disabled = disabled
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        config
    }

    pub fn is_disabled(&self, hook: &str) -> bool {
        self.disabled.iter().any(|d| d == hook)
    }
}
