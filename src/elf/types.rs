#![allow(non_camel_case_types)]

use crate::util::Pod;

pub(crate) const EI_NIDENT: usize = 16;
pub(crate) const EI_CLASS: usize = 4;
pub(crate) const EI_DATA: usize = 5;

pub(crate) const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub(crate) const ELFCLASS32: u8 = 1;
pub(crate) const ELFCLASS64: u8 = 2;
pub(crate) const ELFDATA2LSB: u8 = 1;

type Elf64_Addr = u64;
type Elf64_Half = u16;
type Elf64_Off = u64;
type Elf64_Sxword = i64;
type Elf64_Word = u32;
type Elf64_Xword = u64;

pub(crate) const ET_EXEC: u16 = 2;
pub(crate) const ET_DYN: u16 = 3;
pub(crate) const ET_CORE: u16 = 4;

pub(crate) const EM_X86_64: u16 = 62;
pub(crate) const EM_AARCH64: u16 = 183;

#[derive(Debug)]
#[repr(C)]
pub(crate) struct Elf64_Ehdr {
    pub e_ident: [u8; EI_NIDENT], /* ELF "magic number" */
    pub e_type: Elf64_Half,
    pub e_machine: Elf64_Half,
    pub e_version: Elf64_Word,
    pub e_entry: Elf64_Addr, /* Entry point virtual address */
    pub e_phoff: Elf64_Off,  /* Program header table file offset */
    pub e_shoff: Elf64_Off,  /* Section header table file offset */
    pub e_flags: Elf64_Word,
    pub e_ehsize: Elf64_Half,
    pub e_phentsize: Elf64_Half,
    pub e_phnum: Elf64_Half,
    pub e_shentsize: Elf64_Half,
    pub e_shnum: Elf64_Half,
    pub e_shstrndx: Elf64_Half,
}

// SAFETY: `Elf64_Ehdr` is valid for any bit pattern.
unsafe impl Pod for Elf64_Ehdr {}

pub(crate) const PT_LOAD: u32 = 1;
pub(crate) const PT_DYNAMIC: u32 = 2;
pub(crate) const PT_INTERP: u32 = 3;
pub(crate) const PT_NOTE: u32 = 4;

#[derive(Debug)]
#[repr(C)]
pub(crate) struct Elf64_Phdr {
    pub p_type: Elf64_Word,
    pub p_flags: Elf64_Word,
    pub p_offset: Elf64_Off,   /* Segment file offset */
    pub p_vaddr: Elf64_Addr,   /* Segment virtual address */
    pub p_paddr: Elf64_Addr,   /* Segment physical address */
    pub p_filesz: Elf64_Xword, /* Segment size in file */
    pub p_memsz: Elf64_Xword,  /* Segment size in memory */
    pub p_align: Elf64_Xword,  /* Segment alignment, file & memory */
}

// SAFETY: `Elf64_Phdr` is valid for any bit pattern.
unsafe impl Pod for Elf64_Phdr {}

pub(crate) const PF_X: Elf64_Word = 1;
pub(crate) const PF_W: Elf64_Word = 2;
pub(crate) const PF_R: Elf64_Word = 4;

pub(crate) const PN_XNUM: u16 = 0xffff;

#[derive(Debug)]
#[repr(C)]
pub(crate) struct Elf64_Shdr {
    pub sh_name: Elf64_Word,       /* Section name, index in string tbl */
    pub sh_type: Elf64_Word,       /* Type of section */
    pub sh_flags: Elf64_Xword,     /* Miscellaneous section attributes */
    pub sh_addr: Elf64_Addr,       /* Section virtual addr at execution */
    pub sh_offset: Elf64_Off,      /* Section file offset */
    pub sh_size: Elf64_Xword,      /* Size of section in bytes */
    pub sh_link: Elf64_Word,       /* Index of another section */
    pub sh_info: Elf64_Word,       /* Additional section information */
    pub sh_addralign: Elf64_Xword, /* Section alignment */
    pub sh_entsize: Elf64_Xword,   /* Entry size if section holds table */
}

// SAFETY: `Elf64_Shdr` is valid for any bit pattern.
unsafe impl Pod for Elf64_Shdr {}

pub(crate) const SHN_UNDEF: u16 = 0;
pub(crate) const SHN_LORESERVE: u16 = 0xff00;
pub(crate) const SHN_ABS: u16 = 0xfff1;
pub(crate) const SHN_COMMON: u16 = 0xfff2;
pub(crate) const SHN_XINDEX: u16 = 0xffff;

pub(crate) const SHT_SYMTAB: Elf64_Word = 2;
pub(crate) const SHT_NOBITS: Elf64_Word = 8;
pub(crate) const SHT_DYNSYM: Elf64_Word = 11;

pub(crate) const STB_LOCAL: u8 = 0;
pub(crate) const STB_GLOBAL: u8 = 1;
pub(crate) const STB_WEAK: u8 = 2;
pub(crate) const STB_GNU_UNIQUE: u8 = 10;

pub(crate) const STT_NOTYPE: u8 = 0;
pub(crate) const STT_OBJECT: u8 = 1;
pub(crate) const STT_FUNC: u8 = 2;
pub(crate) const STT_SECTION: u8 = 3;
pub(crate) const STT_FILE: u8 = 4;
pub(crate) const STT_COMMON: u8 = 5;
pub(crate) const STT_TLS: u8 = 6;
pub(crate) const STT_GNU_IFUNC: u8 = 10;

#[derive(Clone, Debug)]
#[repr(C)]
pub(crate) struct Elf64_Sym {
    pub st_name: Elf64_Word,  /* Symbol name, index in string tbl */
    pub st_info: u8,          /* Type and binding attributes */
    pub st_other: u8,         /* No defined meaning, 0 */
    pub st_shndx: Elf64_Half, /* Associated section index */
    pub st_value: Elf64_Addr, /* Value of the symbol */
    pub st_size: Elf64_Xword, /* Associated symbol size */
}

// SAFETY: `Elf64_Sym` is valid for any bit pattern.
unsafe impl Pod for Elf64_Sym {}

pub(crate) const NT_PRSTATUS: Elf64_Word = 1;
pub(crate) const NT_PRPSINFO: Elf64_Word = 3;
pub(crate) const NT_AUXV: Elf64_Word = 6;
pub(crate) const NT_FILE: Elf64_Word = 0x46494c45;

#[derive(Debug)]
#[repr(C)]
pub(crate) struct Elf64_Nhdr {
    pub n_namesz: Elf64_Word,
    pub n_descsz: Elf64_Word,
    pub n_type: Elf64_Word,
}

// SAFETY: `Elf64_Nhdr` is valid for any bit pattern.
unsafe impl Pod for Elf64_Nhdr {}

pub(crate) const DT_NULL: i64 = 0;
pub(crate) const DT_HASH: i64 = 4;
pub(crate) const DT_STRTAB: i64 = 5;
pub(crate) const DT_SYMTAB: i64 = 6;
pub(crate) const DT_STRSZ: i64 = 10;
pub(crate) const DT_SYMENT: i64 = 11;
pub(crate) const DT_DEBUG: i64 = 21;
pub(crate) const DT_GNU_HASH: i64 = 0x6ffffef5;

#[derive(Clone, Debug)]
#[repr(C)]
pub(crate) struct Elf64_Dyn {
    pub d_tag: Elf64_Sxword,
    /// The `d_val`/`d_ptr` union.
    pub d_un: Elf64_Xword,
}

// SAFETY: `Elf64_Dyn` is valid for any bit pattern.
unsafe impl Pod for Elf64_Dyn {}

#[derive(Clone, Debug)]
#[repr(C)]
pub(crate) struct Elf64_Rela {
    pub r_offset: Elf64_Addr,
    pub r_info: Elf64_Xword,
    pub r_addend: Elf64_Sxword,
}

impl Elf64_Rela {
    /// Retrieve the symbol table index the relocation refers to.
    #[inline]
    pub fn sym(&self) -> u32 {
        (self.r_info >> 32) as u32
    }
}

// SAFETY: `Elf64_Rela` is valid for any bit pattern.
unsafe impl Pod for Elf64_Rela {}

pub(crate) const AT_NULL: u64 = 0;
pub(crate) const AT_BASE: u64 = 7;
pub(crate) const AT_ENTRY: u64 = 9;


#[cfg(test)]
mod tests {
    use super::*;

    use std::mem::size_of;

    use test_log::test;


    /// Exercise the `Debug` representation of various types.
    #[test]
    fn debug_repr() {
        let ehdr = Elf64_Ehdr {
            e_ident: [127, 69, 76, 70, 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            e_type: ET_CORE,
            e_machine: EM_X86_64,
            e_version: 1,
            e_entry: 0,
            e_phoff: 64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: 64,
            e_phentsize: 56,
            e_phnum: 13,
            e_shentsize: 64,
            e_shnum: 0,
            e_shstrndx: 0,
        };
        assert_ne!(format!("{ehdr:?}"), "");

        let phdr = Elf64_Phdr {
            p_type: PT_NOTE,
            p_flags: PF_R,
            p_offset: 0,
            p_vaddr: 0,
            p_paddr: 0,
            p_filesz: 0,
            p_memsz: 0,
            p_align: 0,
        };
        assert_ne!(format!("{phdr:?}"), "");

        let dyn_ = Elf64_Dyn {
            d_tag: DT_DEBUG,
            d_un: 0,
        };
        assert_ne!(format!("{dyn_:?}"), "");
    }

    /// Check that our type definitions have the sizes mandated by the
    /// ELF standard.
    #[test]
    fn type_sizes() {
        assert_eq!(size_of::<Elf64_Ehdr>(), 64);
        assert_eq!(size_of::<Elf64_Phdr>(), 56);
        assert_eq!(size_of::<Elf64_Shdr>(), 64);
        assert_eq!(size_of::<Elf64_Sym>(), 24);
        assert_eq!(size_of::<Elf64_Nhdr>(), 12);
        assert_eq!(size_of::<Elf64_Dyn>(), 16);
        assert_eq!(size_of::<Elf64_Rela>(), 24);
    }

    /// Make sure that we extract the symbol index from relocations
    /// correctly.
    #[test]
    fn rela_sym_index() {
        let rela = Elf64_Rela {
            r_offset: 0x4018,
            r_info: (5 << 32) | 7,
            r_addend: 0,
        };
        assert_eq!(rela.sym(), 5);
    }
}
