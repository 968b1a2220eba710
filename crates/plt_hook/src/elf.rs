// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Just enough of the in-memory ELF dynamic section to find the GOT slots
//! that import a given symbol.

use std::{
    ffi::{c_char, c_int, c_void, CStr},
    mem, slice,
};

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;

const DT_NULL: isize = 0;
const DT_PLTRELSZ: isize = 2;
const DT_STRTAB: isize = 5;
const DT_SYMTAB: isize = 6;
const DT_RELA: isize = 7;
const DT_RELASZ: isize = 8;
const DT_STRSZ: isize = 10;
const DT_REL: isize = 17;
const DT_RELSZ: isize = 18;
const DT_PLTREL: isize = 20;
const DT_JMPREL: isize = 23;

#[cfg(target_pointer_width = "64")]
#[allow(dead_code)]
mod types {
    #[repr(C)]
    pub struct Dyn {
        pub d_tag: i64,
        pub d_val: u64,
    }

    #[repr(C)]
    pub struct Rel {
        pub r_offset: u64,
        pub r_info: u64,
    }

    #[repr(C)]
    pub struct Rela {
        pub r_offset: u64,
        pub r_info: u64,
        pub r_addend: i64,
    }

    #[repr(C)]
    pub struct Sym {
        pub st_name: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
        pub st_value: u64,
        pub st_size: u64,
    }

    pub fn r_sym(info: u64) -> usize {
        (info >> 32) as usize
    }

    pub fn r_type(info: u64) -> u32 {
        info as u32
    }
}

#[cfg(target_pointer_width = "32")]
#[allow(dead_code)]
mod types {
    #[repr(C)]
    pub struct Dyn {
        pub d_tag: i32,
        pub d_val: u32,
    }

    #[repr(C)]
    pub struct Rel {
        pub r_offset: u32,
        pub r_info: u32,
    }

    #[repr(C)]
    pub struct Rela {
        pub r_offset: u32,
        pub r_info: u32,
        pub r_addend: i32,
    }

    #[repr(C)]
    pub struct Sym {
        pub st_name: u32,
        pub st_value: u32,
        pub st_size: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
    }

    pub fn r_sym(info: u32) -> usize {
        (info >> 8) as usize
    }

    pub fn r_type(info: u32) -> u32 {
        info & 0xff
    }
}

use types::{r_sym, r_type, Dyn, Rel, Rela, Sym};

/// Relocation types that store a plain pointer to the symbol: jump slot,
/// glob dat and absolute word, in that order.
#[cfg(target_arch = "x86_64")]
const POINTER_RELOCS: &[u32] = &[7, 6, 1];
#[cfg(target_arch = "aarch64")]
const POINTER_RELOCS: &[u32] = &[1026, 1025, 257];
#[cfg(target_arch = "x86")]
const POINTER_RELOCS: &[u32] = &[7, 6, 1];
#[cfg(target_arch = "arm")]
const POINTER_RELOCS: &[u32] = &[22, 21, 2];
#[cfg(target_arch = "riscv64")]
const POINTER_RELOCS: &[u32] = &[5, 2];
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "x86",
    target_arch = "arm",
    target_arch = "riscv64"
)))]
const POINTER_RELOCS: &[u32] = &[];

/// An object as reported by the dynamic linker.
#[derive(Debug)]
pub(crate) struct LoadedObject {
    pub name: String,
    pub bias: usize,
    /// Runtime address of the first `PT_LOAD` segment.
    pub first_load: usize,
    pub dynamic: Option<usize>,
}

pub(crate) fn loaded_objects() -> Vec<LoadedObject> {
    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let out = &mut *(data as *mut Vec<LoadedObject>);
        let info = &*info;

        let bias = info.dlpi_addr as usize;
        let phdrs = if info.dlpi_phdr.is_null() {
            &[][..]
        } else {
            slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize)
        };

        let segment = |ty| {
            phdrs
                .iter()
                .find(|p| p.p_type == ty)
                .map(|p| bias.wrapping_add(p.p_vaddr as usize))
        };

        let name = if info.dlpi_name.is_null() {
            String::new()
        } else {
            CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
        };

        if let Some(first_load) = segment(PT_LOAD) {
            out.push(LoadedObject {
                name,
                bias,
                first_load,
                dynamic: segment(PT_DYNAMIC),
            });
        }

        0
    }

    let mut out: Vec<LoadedObject> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut out as *mut _ as *mut c_void);
    }
    out
}

#[derive(Default, Debug)]
struct DynamicInfo {
    symtab: Option<usize>,
    strtab: Option<usize>,
    strsz: Option<usize>,
    jmprel: Option<usize>,
    pltrelsz: usize,
    pltrel_is_rela: bool,
    rela: Option<usize>,
    relasz: usize,
    rel: Option<usize>,
    relsz: usize,
}

impl DynamicInfo {
    unsafe fn read(dynamic: *const Dyn, bias: usize) -> DynamicInfo {
        // glibc relocates d_ptr entries in place, bionic and musl leave them
        // as link-time addresses
        let addr = |v: usize| if v < bias { bias + v } else { v };

        let mut info = DynamicInfo::default();
        let mut p = dynamic;
        loop {
            let d = &*p;
            let val = d.d_val as usize;
            match d.d_tag as isize {
                DT_NULL => break,
                DT_SYMTAB => info.symtab = Some(addr(val)),
                DT_STRTAB => info.strtab = Some(addr(val)),
                DT_STRSZ => info.strsz = Some(val),
                DT_JMPREL => info.jmprel = Some(addr(val)),
                DT_PLTRELSZ => info.pltrelsz = val,
                DT_PLTREL => info.pltrel_is_rela = val as isize == DT_RELA,
                DT_RELA => info.rela = Some(addr(val)),
                DT_RELASZ => info.relasz = val,
                DT_REL => info.rel = Some(addr(val)),
                DT_RELSZ => info.relsz = val,
                _ => {}
            }
            p = p.add(1);
        }
        info
    }
}

impl LoadedObject {
    /// Addresses of every GOT slot in this object that gets filled in with
    /// the address of `symbol`.
    ///
    /// # Safety
    /// The object must still be loaded.
    pub(crate) unsafe fn import_slots(&self, symbol: &CStr) -> Vec<usize> {
        let Some(dynamic) = self.dynamic else {
            return Vec::new();
        };
        let d = DynamicInfo::read(dynamic as *const Dyn, self.bias);
        let (Some(symtab), Some(strtab)) = (d.symtab, d.strtab) else {
            return Vec::new();
        };

        let symtab = symtab as *const Sym;
        let mut slots = Vec::new();
        let mut scan = |table: Option<usize>, size: usize, rela: bool| {
            let Some(table) = table else { return };
            let stride = if rela {
                mem::size_of::<Rela>()
            } else {
                mem::size_of::<Rel>()
            };

            for i in 0..size / stride {
                let r = &*((table + i * stride) as *const Rel);
                let sym_idx = r_sym(r.r_info);
                if sym_idx == 0 || !POINTER_RELOCS.contains(&r_type(r.r_info)) {
                    continue;
                }

                let name_off = (*symtab.add(sym_idx)).st_name as usize;
                if d.strsz.map_or(false, |sz| name_off >= sz) {
                    continue;
                }
                let name = CStr::from_ptr((strtab + name_off) as *const c_char);
                if name == symbol {
                    slots.push(self.bias.wrapping_add(r.r_offset as usize));
                }
            }
        };

        scan(d.jmprel, d.pltrelsz, d.pltrel_is_rela);
        scan(d.rela, d.relasz, true);
        scan(d.rel, d.relsz, false);

        slots.sort_unstable();
        slots.dedup();
        slots
    }
}
