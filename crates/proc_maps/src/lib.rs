// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Reading the memory mappings of a process out of `/proc/<pid>/maps`.
//!
//! Only the fields needed to identify a backing file (device and inode) and
//! to restore page protections are kept around.

use std::{
    ffi::OsStr,
    fmt,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

pub mod locate;

pub use locate::{locate, locate_library, LibraryIdentity, LocateError};

#[derive(Debug, thiserror::Error)]
pub enum MapsError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("bad maps line {line:?}: {reason}")]
    Parse { line: String, reason: &'static str },
}

/// Which process to read the mappings of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessSelector {
    SelfProcess,
    Pid(libc::pid_t),
}

impl ProcessSelector {
    fn maps_path(self) -> PathBuf {
        match self {
            ProcessSelector::SelfProcess => PathBuf::from("/proc/self/maps"),
            ProcessSelector::Pid(pid) => PathBuf::from(format!("/proc/{pid}/maps")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub shared: bool,
}

impl Perms {
    fn parse(s: &str) -> Option<Perms> {
        let b = s.as_bytes();
        if b.len() != 4 {
            return None;
        }
        Some(Perms {
            read: b[0] == b'r',
            write: b[1] == b'w',
            exec: b[2] == b'x',
            shared: b[3] == b's',
        })
    }

    /// The equivalent `PROT_*` bits for `mprotect`.
    pub fn prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.read {
            prot |= libc::PROT_READ;
        }
        if self.write {
            prot |= libc::PROT_WRITE;
        }
        if self.exec {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

impl fmt::Display for Perms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set, c| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}{}",
            flag(self.read, 'r'),
            flag(self.write, 'w'),
            flag(self.exec, 'x'),
            if self.shared { 's' } else { 'p' }
        )
    }
}

/// One line of a maps file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapEntry {
    pub start: usize,
    pub end: usize,
    pub perms: Perms,
    pub offset: u64,
    /// Encoded the same way as `st_dev`, so it can be compared against `stat`.
    pub dev: u64,
    pub inode: u64,
    /// `None` for anonymous mappings. Pseudo-files like `[stack]` are kept.
    pub path: Option<PathBuf>,
}

impl MapEntry {
    pub fn contains(&self, addr: usize) -> bool {
        (self.start..self.end).contains(&addr)
    }

    pub fn identity(&self) -> LibraryIdentity {
        LibraryIdentity {
            dev: self.dev,
            inode: self.inode,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Parses a line such as
    /// `7f1c2a000000-7f1c2a028000 r--p 00000000 fd:01 1835 /usr/lib/libc.so.6`.
    ///
    /// The path is taken as raw bytes, the kernel does not promise UTF-8.
    pub fn parse(line: &[u8]) -> Result<MapEntry, MapsError> {
        let err = |reason| MapsError::Parse {
            line: String::from_utf8_lossy(line).into_owned(),
            reason,
        };

        let mut rest = line.strip_suffix(b"\n").unwrap_or(line);
        let mut field = |name| {
            let trimmed = rest.trim_ascii_start();
            let end = trimmed
                .iter()
                .position(u8::is_ascii_whitespace)
                .unwrap_or(trimmed.len());
            let (f, r) = trimmed.split_at(end);
            rest = r;
            match std::str::from_utf8(f) {
                Ok(f) if !f.is_empty() => Ok(f),
                _ => Err(err(name)),
            }
        };

        let range = field("missing address range")?;
        let perms = field("missing permissions")?;
        let offset = field("missing offset")?;
        let dev = field("missing device")?;
        let inode = field("missing inode")?;

        let (start, end) = range.split_once('-').ok_or_else(|| err("bad range"))?;
        let start = usize::from_str_radix(start, 16).map_err(|_| err("bad range start"))?;
        let end = usize::from_str_radix(end, 16).map_err(|_| err("bad range end"))?;

        let perms = Perms::parse(perms).ok_or_else(|| err("bad permissions"))?;
        let offset = u64::from_str_radix(offset, 16).map_err(|_| err("bad offset"))?;

        let (major, minor) = dev.split_once(':').ok_or_else(|| err("bad device"))?;
        let major = u32::from_str_radix(major, 16).map_err(|_| err("bad device major"))?;
        let minor = u32::from_str_radix(minor, 16).map_err(|_| err("bad device minor"))?;

        let inode = inode.parse::<u64>().map_err(|_| err("bad inode"))?;

        let path = rest.trim_ascii_start();
        let path = (!path.is_empty()).then(|| PathBuf::from(OsStr::from_bytes(path)));

        Ok(MapEntry {
            start,
            end,
            perms,
            offset,
            dev: libc::makedev(major, minor) as u64,
            inode,
            path,
        })
    }
}

/// A snapshot of a process's mappings, in the order the kernel lists them.
#[derive(Clone, Debug, Default)]
pub struct Maps {
    entries: Vec<MapEntry>,
}

impl Maps {
    /// Parses a whole maps file. Lines that do not parse are logged and
    /// skipped, so one odd mapping cannot hide the rest.
    pub fn parse(text: &[u8]) -> Maps {
        let entries = text
            .split(|&b| b == b'\n')
            .filter(|l| !l.trim_ascii().is_empty())
            .filter_map(|l| match MapEntry::parse(l) {
                Ok(e) => Some(e),
                Err(e) => {
                    tracing::warn!("skipping {e}");
                    None
                }
            })
            .collect();
        Maps { entries }
    }

    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MapEntry> {
        self.entries.iter()
    }

    pub fn containing(&self, addr: usize) -> Option<&MapEntry> {
        self.entries.iter().find(|e| e.contains(addr))
    }

    pub fn with_identity(
        &self,
        identity: LibraryIdentity,
    ) -> impl Iterator<Item = &MapEntry> + '_ {
        self.entries
            .iter()
            .filter(move |e| e.path.is_some() && e.identity() == identity)
    }
}

impl From<Vec<MapEntry>> for Maps {
    fn from(entries: Vec<MapEntry>) -> Self {
        Maps { entries }
    }
}

impl<'a> IntoIterator for &'a Maps {
    type Item = &'a MapEntry;
    type IntoIter = std::slice::Iter<'a, MapEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Snapshots the mappings of the selected process.
pub fn scan(selector: ProcessSelector) -> Result<Maps, MapsError> {
    let path = selector.maps_path();
    let text = std::fs::read(&path).map_err(|source| MapsError::Io {
        path: path.clone(),
        source,
    })?;
    let maps = Maps::parse(&text);
    tracing::trace!("{} mappings in {}", maps.entries.len(), path.display());
    Ok(maps)
}
