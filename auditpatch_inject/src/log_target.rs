// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Where our diagnostics go: logcat on Android, stderr everywhere else.

#![cfg_attr(not(target_os = "android"), allow(dead_code))]

use std::ffi::c_int;

use tracing::{metadata::LevelFilter, Level};
use tracing_subscriber::prelude::*;

pub const TAG: &str = "auditpatch";

/// `android_LogPriority` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Priority {
    Verbose = 2,
    Debug = 3,
    Info = 4,
    Warn = 5,
    Error = 6,
}

impl From<&Level> for Priority {
    fn from(level: &Level) -> Self {
        match *level {
            Level::TRACE => Priority::Verbose,
            Level::DEBUG => Priority::Debug,
            Level::INFO => Priority::Info,
            Level::WARN => Priority::Warn,
            Level::ERROR => Priority::Error,
        }
    }
}

impl Priority {
    pub fn as_raw(self) -> c_int {
        self as c_int
    }
}

/// Turns one formatted event into the text of a log line: no trailing
/// newline and no interior NULs.
pub fn line_text(buf: &[u8]) -> Vec<u8> {
    let trimmed = buf.strip_suffix(b"\n").unwrap_or(buf);
    trimmed
        .iter()
        .map(|&b| if b == 0 { b' ' } else { b })
        .collect()
}

#[cfg(target_os = "android")]
mod logcat {
    use std::{
        ffi::{c_char, c_int, CString},
        io,
    };

    use tracing::Metadata;
    use tracing_subscriber::fmt::MakeWriter;

    use super::{line_text, Priority, TAG};

    #[link(name = "log")]
    extern "C" {
        fn __android_log_write(prio: c_int, tag: *const c_char, text: *const c_char) -> c_int;
    }

    pub struct Logcat {
        tag: CString,
    }

    impl Logcat {
        pub fn new() -> Logcat {
            Logcat {
                tag: CString::new(TAG).unwrap_or_default(),
            }
        }
    }

    /// Collects one event and writes it out as a single logcat entry.
    pub struct LogcatLine<'a> {
        tag: &'a CString,
        prio: Priority,
        buf: Vec<u8>,
    }

    impl io::Write for LogcatLine<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buf.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Drop for LogcatLine<'_> {
        fn drop(&mut self) {
            if self.buf.is_empty() {
                return;
            }
            let Ok(text) = CString::new(line_text(&self.buf)) else {
                return;
            };
            unsafe {
                __android_log_write(self.prio.as_raw(), self.tag.as_ptr(), text.as_ptr());
            }
        }
    }

    impl<'a> MakeWriter<'a> for Logcat {
        type Writer = LogcatLine<'a>;

        fn make_writer(&'a self) -> Self::Writer {
            LogcatLine {
                tag: &self.tag,
                prio: Priority::Info,
                buf: Vec::new(),
            }
        }

        fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
            LogcatLine {
                tag: &self.tag,
                prio: meta.level().into(),
                buf: Vec::new(),
            }
        }
    }
}

/// Installs the global subscriber, unless the host process already has one.
pub fn init(filter: &str) {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse_lossy(filter);

    let layer = tracing_subscriber::fmt::Layer::new()
        .without_time()
        .with_ansi(false)
        .with_target(false);

    #[cfg(target_os = "android")]
    let layer = layer.with_writer(logcat::Logcat::new());
    #[cfg(not(target_os = "android"))]
    let layer = layer.with_writer(std::io::stderr);

    let _ = tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init();
}
