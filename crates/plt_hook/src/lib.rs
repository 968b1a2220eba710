// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Import hooking by GOT patching.
//!
//! Hooks are registered against a loaded object named by the device and
//! inode of its backing file, and only calls *made by that object* through
//! its PLT/GOT are redirected. Nothing happens until [`PltHooker::commit`],
//! which applies every pending hook or none of them.
//!
//! Objects linked with lazy binding may still have unresolved slots; the
//! original handed back is then the PLT resolver stub, which works but
//! rewrites the slot when first called. Android and most distros link with
//! `-z now`, so in practice slots are resolved by the time we get here.

use std::{
    ffi::{c_void, CString},
    sync::Mutex,
};

use proc_maps::{LibraryIdentity, Maps, ProcessSelector};

mod elf;

/// Commits snapshot page protections, so two of them must not interleave.
static COMMIT_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, thiserror::Error)]
pub enum PltError {
    #[error("symbol name {0:?} contains a NUL byte")]
    InvalidSymbol(String),
    #[error("replacement for {0} is null")]
    NullReplacement(String),
    #[error("could not scan mappings: {0}")]
    Maps(#[from] proc_maps::MapsError),
    #[error("nothing loaded is backed by {0}")]
    ObjectNotLoaded(LibraryIdentity),
    #[error("{symbol} is not imported by {identity}")]
    SymbolNotFound {
        symbol: String,
        identity: LibraryIdentity,
    },
    #[error("GOT slot for {0} holds a null pointer")]
    NullOriginal(String),
    #[error("no mapping contains GOT slot {0:#x}")]
    UnmappedSlot(usize),
    #[error("mprotect at {addr:#x} failed: {source}")]
    Protect {
        addr: usize,
        source: std::io::Error,
    },
}

struct Pending {
    identity: LibraryIdentity,
    symbol: CString,
    replacement: usize,
}

/// What a hooked import pointed at before [`PltHooker::commit`] redirected
/// it.
#[derive(Debug)]
pub struct Original {
    pub symbol: CString,
    pub address: *mut c_void,
    /// Number of GOT slots that were rewritten.
    pub slots: usize,
}

#[derive(Default)]
pub struct PltHooker {
    pending: Vec<Pending>,
    /// Slots written by the last successful commit, with their old values.
    committed: Vec<(usize, usize)>,
}

impl PltHooker {
    pub fn new() -> PltHooker {
        PltHooker::default()
    }

    /// Queues redirecting the imports of `symbol` inside the object backed by
    /// `identity` to `replacement`.
    pub fn register(
        &mut self,
        identity: LibraryIdentity,
        symbol: &str,
        replacement: *const c_void,
    ) -> Result<(), PltError> {
        let c_symbol =
            CString::new(symbol).map_err(|_| PltError::InvalidSymbol(symbol.to_string()))?;
        if replacement.is_null() {
            return Err(PltError::NullReplacement(symbol.to_string()));
        }

        self.pending.push(Pending {
            identity,
            symbol: c_symbol,
            replacement: replacement as usize,
        });
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Applies all pending hooks. On error nothing stays patched.
    ///
    /// The pending list is consumed either way. Originals come back in
    /// registration order, and are read before any slot is written.
    pub fn commit(&mut self) -> Result<Vec<Original>, PltError> {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = COMMIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let maps = proc_maps::scan(ProcessSelector::SelfProcess)?;
        let objects = elf::loaded_objects();

        let mut plan = Vec::with_capacity(pending.len());
        for p in &pending {
            let owners = objects
                .iter()
                .filter(|o| {
                    maps.containing(o.first_load)
                        .map_or(false, |e| e.path.is_some() && e.identity() == p.identity)
                })
                .collect::<Vec<_>>();
            if owners.is_empty() {
                return Err(PltError::ObjectNotLoaded(p.identity));
            }

            let mut slots = Vec::new();
            for o in owners {
                let found = unsafe { o.import_slots(&p.symbol) };
                tracing::trace!(object = %o.name, "{} slots for {:?}", found.len(), p.symbol);
                slots.extend(found);
            }
            if slots.is_empty() {
                return Err(PltError::SymbolNotFound {
                    symbol: p.symbol.to_string_lossy().into_owned(),
                    identity: p.identity,
                });
            }
            let original = unsafe { (slots[0] as *const usize).read_volatile() };
            if original == 0 {
                return Err(PltError::NullOriginal(
                    p.symbol.to_string_lossy().into_owned(),
                ));
            }
            plan.push((p, slots, original));
        }

        let mut journal = Vec::new();
        let mut originals = Vec::with_capacity(plan.len());
        for (p, slots, original) in plan {
            for &slot in &slots {
                match unsafe { write_slot(&maps, slot, p.replacement) } {
                    Ok(old) => journal.push((slot, old)),
                    Err(e) => {
                        rollback(&maps, &journal);
                        return Err(e);
                    }
                }
            }

            tracing::debug!(
                "hooked {:?} in {}: {} slots, original {original:#x}",
                p.symbol,
                p.identity,
                slots.len()
            );
            originals.push(Original {
                symbol: p.symbol.clone(),
                address: original as *mut c_void,
                slots: slots.len(),
            });
        }

        self.committed = journal;
        Ok(originals)
    }

    /// Puts back every slot the last successful commit wrote.
    pub fn revert(&mut self) -> Result<(), PltError> {
        let journal = std::mem::take(&mut self.committed);
        if journal.is_empty() {
            return Ok(());
        }

        let _guard = COMMIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let maps = proc_maps::scan(ProcessSelector::SelfProcess)?;
        let mut result = Ok(());
        for &(slot, old) in journal.iter().rev() {
            if let Err(e) = unsafe { write_slot(&maps, slot, old) } {
                tracing::error!("could not restore GOT slot {slot:#x}: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        tracing::debug!("reverted {} GOT slots", journal.len());
        result
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn protect(addr: usize, prot: libc::c_int) -> Result<(), PltError> {
    let page = page_size();
    let start = addr & !(page - 1);
    let r = unsafe { libc::mprotect(start as *mut c_void, page, prot) };
    if r != 0 {
        return Err(PltError::Protect {
            addr: start,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Stores `value` into the pointer at `slot`, returning what was there.
/// Leaves the page with the protection the maps snapshot says it had.
unsafe fn write_slot(maps: &Maps, slot: usize, value: usize) -> Result<usize, PltError> {
    let entry = maps.containing(slot).ok_or(PltError::UnmappedSlot(slot))?;
    let prot = entry.perms.prot();
    let needs_unprotect = !entry.perms.write;

    if needs_unprotect {
        protect(slot, prot | libc::PROT_READ | libc::PROT_WRITE)?;
    }

    let ptr = slot as *mut usize;
    let old = ptr.read_volatile();
    ptr.write_volatile(value);

    if needs_unprotect {
        if let Err(e) = protect(slot, prot) {
            // the page is still writable, so this cannot fault
            ptr.write_volatile(old);
            return Err(e);
        }
    }

    Ok(old)
}

fn rollback(maps: &Maps, journal: &[(usize, usize)]) {
    for &(slot, old) in journal.iter().rev() {
        if let Err(e) = unsafe { write_slot(maps, slot, old) } {
            tracing::error!("could not restore GOT slot {slot:#x}: {e}");
        }
    }
}
