// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Finding a loaded library by a fragment of its path, and naming it by the
//! device and inode of its backing file so that later lookups do not depend
//! on how the path was spelled.

use std::{fmt, os::unix::ffi::OsStrExt};

use crate::{scan, MapEntry, MapsError, ProcessSelector};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LibraryIdentity {
    pub dev: u64,
    pub inode: u64,
}

impl fmt::Display for LibraryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dev = self.dev as libc::dev_t;
        write!(
            f,
            "dev={:x}:{:x} inode={}",
            libc::major(dev),
            libc::minor(dev),
            self.inode
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("could not scan mappings: {0}")]
    Scan(#[from] MapsError),
    #[error("no mapping backed by a path containing {0:?}")]
    NotFound(String),
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// First entry, in enumeration order, whose backing path contains `fragment`.
///
/// The text and data segments of one library share a device and inode, so
/// the first hit is as good as any of them.
pub fn locate<'a, I>(entries: I, fragment: &str) -> Option<&'a MapEntry>
where
    I: IntoIterator<Item = &'a MapEntry>,
{
    let fragment = fragment.as_bytes();
    entries.into_iter().find(|e| {
        e.path.as_ref().map_or(false, |p| {
            let p = p.as_os_str().as_bytes();
            !p.is_empty() && contains(p, fragment)
        })
    })
}

/// Scans the selected process and returns the identity of the first mapping
/// whose path contains `fragment`.
pub fn locate_library(
    selector: ProcessSelector,
    fragment: &str,
) -> Result<LibraryIdentity, LocateError> {
    let maps = scan(selector)?;
    let entry = locate(&maps, fragment).ok_or_else(|| LocateError::NotFound(fragment.into()))?;

    tracing::debug!(
        path = ?entry.path,
        "located {fragment:?}: {}",
        entry.identity()
    );
    Ok(entry.identity())
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;
    use crate::{Maps, Perms};

    fn entry(path: Option<&str>, dev: u64, inode: u64) -> MapEntry {
        MapEntry {
            start: 0x1000,
            end: 0x2000,
            perms: Perms::default(),
            offset: 0,
            dev,
            inode,
            path: path.map(PathBuf::from),
        }
    }

    #[test]
    fn test_locate_single_match() {
        let maps = Maps::from(vec![
            entry(None, 0, 0),
            entry(Some("/system/bin/logd"), 1, 10),
            entry(Some("/apex/com.android.runtime/lib64/bionic/libc.so"), 2, 20),
            entry(Some("[anon:libc_malloc]"), 0, 0),
        ]);

        let found = locate(&maps, "libc.so").unwrap();
        assert_eq!(found.identity(), LibraryIdentity { dev: 2, inode: 20 });
    }

    #[test]
    fn test_locate_first_match_wins() {
        let maps = Maps::from(vec![
            entry(Some("/lib/libc.so.6"), 3, 30),
            entry(Some("/lib/libc.so.6"), 3, 30),
            entry(Some("/other/libc.so"), 4, 40),
        ]);
        assert_eq!(
            locate(&maps, "libc.so").map(|e| e.identity()),
            Some(LibraryIdentity { dev: 3, inode: 30 })
        );
    }

    #[test]
    fn test_locate_not_found() {
        let empty = Maps::default();
        assert!(locate(&empty, "libc.so").is_none());

        let maps = Maps::from(vec![entry(None, 0, 0), entry(Some("/bin/sh"), 1, 1)]);
        assert!(locate(&maps, "libc.so").is_none());
    }

    #[test]
    fn test_identity_display() {
        let id = LibraryIdentity {
            dev: libc::makedev(0x103, 2) as u64,
            inode: 1835,
        };
        expect_test::expect!["dev=103:2 inode=1835"].assert_eq(&id.to_string());
    }

    #[test]
    fn test_locate_library_self() {
        let exe = std::env::current_exe().unwrap();
        let name = exe.file_name().unwrap().to_str().unwrap();
        let id = locate_library(ProcessSelector::SelfProcess, name).unwrap();
        assert_ne!(id.inode, 0);

        // every segment of the executable carries the same identity
        let maps = scan(ProcessSelector::SelfProcess).unwrap();
        let segments = maps.with_identity(id).collect::<Vec<_>>();
        assert!(segments.len() >= 2);
        assert!(segments
            .iter()
            .all(|e| e.path.as_ref().unwrap().to_string_lossy().contains(name)));
    }

    #[test]
    fn test_locate_library_missing() {
        let err = locate_library(ProcessSelector::SelfProcess, "libdefinitely-not-loaded.so")
            .unwrap_err();
        assert!(matches!(err, LocateError::NotFound(_)));
    }

    #[test]
    fn test_locate_with_non_utf8_mapping() {
        use std::{ffi::OsStr, os::fd::AsRawFd};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(OsStr::from_bytes(b"libodd_\xff\xfe.so"));
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let file = std::fs::File::open(&path).unwrap();

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                4096,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED);

        let exe = std::env::current_exe().unwrap();
        let name = exe.file_name().unwrap().to_str().unwrap();
        let own = locate_library(ProcessSelector::SelfProcess, name);
        let odd = locate_library(ProcessSelector::SelfProcess, "libodd_");
        let maps = scan(ProcessSelector::SelfProcess).unwrap();
        let mapped = maps.containing(addr as usize).and_then(|e| e.path.clone());

        unsafe { libc::munmap(addr, 4096) };

        assert!(own.is_ok(), "{own:?}");
        assert_ne!(odd.unwrap().inode, 0);
        assert_eq!(
            mapped.as_deref().and_then(|p| p.file_name()),
            path.file_name()
        );
    }
}
