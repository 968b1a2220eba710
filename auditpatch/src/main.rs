// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! The auditpatch CLI.
use clap::Parser;
use tracing::metadata::LevelFilter;

use std::{
    fs,
    io::{self, BufRead, Write},
    path::PathBuf,
};

use audit_rewrite::SELINUX_CONTEXTS;
use proc_maps::{MapEntry, ProcessSelector};
use tracing_subscriber::prelude::*;

type Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(clap::Parser, Debug)]
enum Command {
    /// Finds the first mapping whose path contains FRAGMENT.
    Locate {
        fragment: String,
        /// Process to look in, instead of this one.
        #[clap(long)]
        pid: Option<libc::pid_t>,
    },
    /// Lists file-backed mappings with their device and inode.
    Maps {
        #[clap(long)]
        pid: Option<libc::pid_t>,
    },
    /// Runs each line of FILE (or stdin) through the audit line rewrite.
    Rewrite {
        file: Option<PathBuf>,
        /// Only print lines that were rewritten.
        #[clap(long)]
        changed_only: bool,
    },
}

fn selector(pid: Option<libc::pid_t>) -> ProcessSelector {
    pid.map_or(ProcessSelector::SelfProcess, ProcessSelector::Pid)
}

fn describe(entry: &MapEntry) -> String {
    format!(
        "{:x}-{:x} {} {} {}",
        entry.start,
        entry.end,
        entry.perms,
        entry.identity(),
        entry.path().map_or("".into(), |p| p.display().to_string())
    )
}

fn do_locate(fragment: String, pid: Option<libc::pid_t>) -> Result<(), Error> {
    let maps = proc_maps::scan(selector(pid))?;
    let entry = proc_maps::locate(&maps, &fragment)
        .ok_or_else(|| proc_maps::LocateError::NotFound(fragment.clone()))?;
    println!("{}", describe(entry));
    Ok(())
}

fn do_maps(pid: Option<libc::pid_t>) -> Result<(), Error> {
    let maps = proc_maps::scan(selector(pid))?;
    let mut out = io::stdout().lock();
    for entry in maps.iter().filter(|e| e.inode != 0) {
        writeln!(out, "{}", describe(entry))?;
    }
    Ok(())
}

/// Copies `input` to `output` line by line, rewriting as it goes. Returns
/// how many lines were changed.
fn rewrite_lines(
    mut input: impl BufRead,
    mut output: impl Write,
    changed_only: bool,
) -> Result<usize, Error> {
    let mut changed = 0;
    let mut line = Vec::new();
    loop {
        line.clear();
        if input.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        let newline = line.ends_with(b"\n");
        let text = if newline {
            &line[..line.len() - 1]
        } else {
            &line[..]
        };

        match audit_rewrite::rewrite(text, &SELINUX_CONTEXTS)? {
            Some(buf) => {
                changed += 1;
                output.write_all(buf.as_bytes())?;
            }
            None if changed_only => continue,
            None => output.write_all(text)?,
        }
        if newline {
            output.write_all(b"\n")?;
        }
    }
    output.flush()?;
    Ok(changed)
}

fn do_rewrite(file: Option<PathBuf>, changed_only: bool) -> Result<(), Error> {
    let stdout = io::stdout().lock();
    let changed = match file {
        Some(file) => rewrite_lines(io::BufReader::new(fs::File::open(file)?), stdout, changed_only)?,
        None => rewrite_lines(io::stdin().lock(), stdout, changed_only)?,
    };
    tracing::info!("rewrote {changed} lines");
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::Layer::new()
                .without_time()
                .with_writer(io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Command::parse();

    match args {
        Command::Locate { fragment, pid } => do_locate(fragment, pid)?,
        Command::Maps { pid } => do_maps(pid)?,
        Command::Rewrite { file, changed_only } => do_rewrite(file, changed_only)?,
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    const LOG: &str = "\
type=1400 audit(0.0:1): avc: denied { read } for scontext=u:r:untrusted_app:s0 tcontext=u:r:magisk:s0 tclass=fd
type=1400 audit(0.0:2): avc: denied { read } for scontext=u:r:untrusted_app:s0 tcontext=u:r:system_server:s0 tclass=fd
comm=\"x\" tcontext=u:r:su:s0 name=\"y\"
tcontext=u:r:su:s0";

    fn run(changed_only: bool) -> (usize, String) {
        let mut out = Vec::new();
        let n = rewrite_lines(LOG.as_bytes(), &mut out, changed_only).unwrap();
        (n, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_rewrite_lines() {
        let (n, out) = run(false);
        assert_eq!(n, 2);
        expect_test::expect![[r#"
            type=1400 audit(0.0:1): avc: denied { read } for scontext=u:r:untrusted_app:s0 tcontext=u:r:priv_app:s0:c512,c768 tclass=fd
            type=1400 audit(0.0:2): avc: denied { read } for scontext=u:r:untrusted_app:s0 tcontext=u:r:system_server:s0 tclass=fd
            comm="x" tcontext=u:r:su:s0 name="y"
            tcontext=u:r:priv_app:s0:c512,c768"#]]
        .assert_eq(&out);
    }

    #[test]
    fn test_rewrite_lines_changed_only() {
        let (n, out) = run(true);
        assert_eq!(n, 2);
        expect_test::expect![[r#"
            type=1400 audit(0.0:1): avc: denied { read } for scontext=u:r:untrusted_app:s0 tcontext=u:r:priv_app:s0:c512,c768 tclass=fd
            tcontext=u:r:priv_app:s0:c512,c768"#]]
        .assert_eq(&out);
    }

    #[test]
    fn test_describe() {
        let entry = MapEntry::parse(
            b"7f1c2a000000-7f1c2a028000 r-xp 00000000 fd:01 1835 /usr/lib/libc.so.6",
        )
        .unwrap();
        expect_test::expect!["7f1c2a000000-7f1c2a028000 r-xp dev=fd:1 inode=1835 /usr/lib/libc.so.6"]
            .assert_eq(&describe(&entry));
    }

    #[test]
    fn test_selector() {
        assert_eq!(selector(None), ProcessSelector::SelfProcess);
        assert_eq!(selector(Some(1)), ProcessSelector::Pid(1));
    }
}
