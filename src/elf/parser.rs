use std::ffi::OsStr;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::fs::File;
use std::mem;
use std::ops::Deref as _;
use std::os::unix::ffi::OsStrExt as _;
#[cfg(test)]
use std::path::Path;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::mmap::Mmap;
use crate::symbols::ElfSym;
use crate::symbols::SymTable;
use crate::target::ObjectInfo;
use crate::target::PltReloc;
use crate::target::RawSym;
use crate::util::get_or_try_init;
use crate::util::ReadRaw as _;
use crate::Error;
use crate::ErrorExt as _;
use crate::IntoError as _;
use crate::Result;

use super::types::Elf64_Ehdr;
use super::types::Elf64_Nhdr;
use super::types::Elf64_Phdr;
use super::types::Elf64_Rela;
use super::types::Elf64_Shdr;
use super::types::Elf64_Sym;
use super::types::EI_CLASS;
use super::types::EI_DATA;
use super::types::ELFCLASS64;
use super::types::ELFDATA2LSB;
use super::types::ELFMAG;
use super::types::PN_XNUM;
use super::types::PT_DYNAMIC;
use super::types::PT_INTERP;
use super::types::PT_LOAD;
use super::types::PT_NOTE;
use super::types::SHT_DYNSYM;
use super::types::SHT_NOBITS;
use super::types::SHT_SYMTAB;
use super::types::SHN_XINDEX;


/// The names of sections holding procedure linkage table stubs.
const PLT_SECTIONS: [&str; 2] = [".plt", ".plt.sec"];
/// The name of the section holding relocations for PLT slots.
const PLT_RELOC_SECTION: &str = ".rela.plt";


fn symbol_name<'mmap>(strtab: &'mmap [u8], offset: u32) -> Result<&'mmap str> {
    let name = strtab
        .get(offset as usize..)
        .ok_or_invalid_input(|| "string table index out of bounds")?
        .read_cstr()
        .ok_or_invalid_input(|| "no valid string found in string table")?
        .to_str()
        .map_err(Error::with_invalid_data)
        .context("invalid symbol name")?;

    Ok(name)
}

pub(crate) fn elf_sym(sym: &Elf64_Sym) -> ElfSym {
    ElfSym {
        st_value: sym.st_value,
        st_size: sym.st_size,
        st_info: sym.st_info,
        st_other: sym.st_other,
        st_shndx: sym.st_shndx,
    }
}

/// Check the identification bytes of an ELF file, returning its class.
pub(crate) fn elf_class(data: &[u8]) -> Option<u8> {
    if data.get(..ELFMAG.len())? != ELFMAG {
        return None
    }
    data.get(EI_CLASS).copied()
}


/// A note record as found in a `PT_NOTE` segment.
#[derive(Debug)]
pub(crate) struct Note<'elf> {
    pub n_type: u32,
    pub name: &'elf [u8],
    pub desc: &'elf [u8],
}


#[derive(Clone, Copy, Debug)]
struct EhdrExt<'mmap> {
    /// The ELF header.
    ehdr: &'mmap Elf64_Ehdr,
    /// Override of `ehdr.e_shnum`, handling of which is special-cased by
    /// the ELF standard.
    shnum: usize,
    /// Override of `ehdr.e_phnum`, handling of which is special-cased by
    /// the ELF standard.
    phnum: usize,
}


struct Cache<'mmap> {
    /// A slice of the raw ELF data that we are about to parse.
    elf_data: &'mmap [u8],
    /// The cached ELF header.
    ehdr: OnceLock<EhdrExt<'mmap>>,
    /// The cached ELF section headers.
    shdrs: OnceLock<&'mmap [Elf64_Shdr]>,
    shstrtab: OnceLock<&'mmap [u8]>,
    /// The cached ELF program headers.
    phdrs: OnceLock<&'mmap [Elf64_Phdr]>,
}

impl<'mmap> Cache<'mmap> {
    /// Create a new `Cache` using the provided raw ELF object data.
    fn new(elf_data: &'mmap [u8]) -> Self {
        Self {
            elf_data,
            ehdr: OnceLock::new(),
            shdrs: OnceLock::new(),
            shstrtab: OnceLock::new(),
            phdrs: OnceLock::new(),
        }
    }

    /// Retrieve the raw section data for the ELF section at index
    /// `idx`.
    fn section_data(&self, idx: usize) -> Result<&'mmap [u8]> {
        let shdrs = self.ensure_shdrs()?;
        let section = shdrs
            .get(idx)
            .ok_or_invalid_input(|| format!("ELF section index ({idx}) out of bounds"))?;

        if section.sh_type == SHT_NOBITS {
            return Ok(&[])
        }

        let data = self
            .elf_data
            .get(section.sh_offset as usize..)
            .ok_or_invalid_data(|| "failed to read section data: invalid offset")?
            .read_slice(section.sh_size as usize)
            .ok_or_invalid_data(|| "failed to read section data: invalid size")?;
        Ok(data)
    }

    /// Retrieve the file contents of the provided segment.
    fn segment_data(&self, phdr: &Elf64_Phdr) -> Result<&'mmap [u8]> {
        let data = self
            .elf_data
            .get(phdr.p_offset as usize..)
            .ok_or_invalid_data(|| "failed to read segment data: invalid offset")?
            .read_slice(phdr.p_filesz as usize)
            .ok_or_invalid_data(|| "failed to read segment data: invalid size")?;
        Ok(data)
    }

    /// Read the very first section header.
    ///
    /// ELF contains a couple of clauses that special case data ranges
    /// of certain member variables to reference data from this header,
    /// which otherwise is zeroed out.
    #[inline]
    fn read_first_shdr(&self, ehdr: &Elf64_Ehdr) -> Result<&'mmap Elf64_Shdr> {
        let shdr = self
            .elf_data
            .get(ehdr.e_shoff as usize..)
            .ok_or_invalid_data(|| "Elf64_Ehdr::e_shoff is invalid")?
            .read_pod_ref::<Elf64_Shdr>()
            .ok_or_invalid_data(|| "failed to read Elf64_Shdr")?;
        Ok(shdr)
    }

    fn parse_ehdr(&self) -> Result<EhdrExt<'mmap>> {
        let mut elf_data = self.elf_data;
        let ehdr = elf_data
            .read_pod_ref::<Elf64_Ehdr>()
            .ok_or_invalid_data(|| "failed to read Elf64_Ehdr")?;
        if ehdr.e_ident[..ELFMAG.len()] != ELFMAG {
            return Err(Error::with_invalid_data(format!(
                "encountered unexpected e_ident: {:x?}",
                &ehdr.e_ident[0..4]
            )))
        }

        if ehdr.e_ident[EI_CLASS] != ELFCLASS64 {
            return Err(Error::with_unsupported(format!(
                "ELF class {} is not supported",
                ehdr.e_ident[EI_CLASS]
            )))
        }

        if ehdr.e_ident[EI_DATA] != ELFDATA2LSB {
            return Err(Error::with_unsupported(
                "big endian ELF objects are not supported",
            ))
        }

        // "If the number of entries in the section header table is larger than
        // or equal to SHN_LORESERVE, e_shnum holds the value zero and the real
        // number of entries in the section header table is held in the sh_size
        // member of the initial entry in section header table."
        let shnum = if ehdr.e_shnum == 0 && ehdr.e_shoff != 0 {
            let shdr = self.read_first_shdr(ehdr)?;
            usize::try_from(shdr.sh_size).ok().ok_or_invalid_data(|| {
                format!(
                    "ELF file contains unsupported number of sections ({})",
                    shdr.sh_size
                )
            })?
        } else {
            ehdr.e_shnum.into()
        };

        // "If the number of entries in the program header table is
        // larger than or equal to PN_XNUM (0xffff), this member holds
        // PN_XNUM (0xffff) and the real number of entries in the
        // program header table is held in the sh_info member of the
        // initial entry in section header table."
        let phnum = if ehdr.e_phnum == PN_XNUM {
            let shdr = self.read_first_shdr(ehdr)?;
            usize::try_from(shdr.sh_info).ok().ok_or_invalid_data(|| {
                format!(
                    "ELF file contains unsupported number of program headers ({})",
                    shdr.sh_info
                )
            })?
        } else {
            ehdr.e_phnum.into()
        };

        let ehdr = EhdrExt { ehdr, shnum, phnum };
        Ok(ehdr)
    }

    fn ensure_ehdr(&self) -> Result<&EhdrExt<'mmap>> {
        get_or_try_init(&self.ehdr, || self.parse_ehdr())
    }

    fn parse_shdrs(&self) -> Result<&'mmap [Elf64_Shdr]> {
        let ehdr = self.ensure_ehdr()?;
        if ehdr.shnum == 0 {
            return Ok(&[])
        }

        let shdrs = self
            .elf_data
            .get(ehdr.ehdr.e_shoff as usize..)
            .ok_or_invalid_data(|| "Elf64_Ehdr::e_shoff is invalid")?
            .read_pod_slice_ref::<Elf64_Shdr>(ehdr.shnum)
            .ok_or_invalid_data(|| "failed to read Elf64_Shdr")?;
        Ok(shdrs)
    }

    fn ensure_shdrs(&self) -> Result<&'mmap [Elf64_Shdr]> {
        get_or_try_init(&self.shdrs, || self.parse_shdrs()).copied()
    }

    fn parse_phdrs(&self) -> Result<&'mmap [Elf64_Phdr]> {
        let ehdr = self.ensure_ehdr()?;
        let phdrs = self
            .elf_data
            .get(ehdr.ehdr.e_phoff as usize..)
            .ok_or_invalid_data(|| "Elf64_Ehdr::e_phoff is invalid")?
            .read_pod_slice_ref::<Elf64_Phdr>(ehdr.phnum)
            .ok_or_invalid_data(|| "failed to read Elf64_Phdr")?;
        Ok(phdrs)
    }

    fn ensure_phdrs(&self) -> Result<&'mmap [Elf64_Phdr]> {
        get_or_try_init(&self.phdrs, || self.parse_phdrs()).copied()
    }

    fn shstrndx(&self, ehdr: &Elf64_Ehdr) -> Result<usize> {
        // "If the index of section name string table section is larger
        // than or equal to SHN_LORESERVE (0xff00), this member holds
        // SHN_XINDEX (0xffff) and  the real index of the section name
        // string table section is held in the sh_link member of the
        // initial entry in section header table."
        let shstrndx = if ehdr.e_shstrndx == SHN_XINDEX {
            let shdr = self.read_first_shdr(ehdr)?;
            shdr.sh_link
        } else {
            u32::from(ehdr.e_shstrndx)
        };

        let shstrndx = usize::try_from(shstrndx).ok().ok_or_invalid_data(|| {
            format!("ELF file contains unsupported section name string table index ({shstrndx})")
        })?;
        Ok(shstrndx)
    }

    fn parse_shstrtab(&self) -> Result<&'mmap [u8]> {
        let ehdr = self.ensure_ehdr()?;
        let shstrndx = self.shstrndx(ehdr.ehdr)?;
        let shstrtab = self.section_data(shstrndx)?;
        Ok(shstrtab)
    }

    fn ensure_shstrtab(&self) -> Result<&'mmap [u8]> {
        get_or_try_init(&self.shstrtab, || self.parse_shstrtab()).copied()
    }

    /// Get the name of the section at a given index.
    fn section_name(&self, idx: usize) -> Result<&'mmap str> {
        let shdrs = self.ensure_shdrs()?;
        let shstrtab = self.ensure_shstrtab()?;

        let sect = shdrs
            .get(idx)
            .ok_or_invalid_input(|| "ELF section index out of bounds")?;
        let name = shstrtab
            .get(sect.sh_name as usize..)
            .ok_or_invalid_input(|| "string table index out of bounds")?
            .read_cstr()
            .ok_or_invalid_input(|| "no valid string found in string table")?
            .to_str()
            .map_err(Error::with_invalid_data)
            .context("invalid section name")?;
        Ok(name)
    }

    /// Find the section of a given name.
    ///
    /// This function return the index of the section if found.
    fn find_section(&self, name: &str) -> Result<Option<usize>> {
        let ehdr = self.ensure_ehdr()?;
        for i in 1..ehdr.shnum {
            if self.section_name(i)? == name {
                return Ok(Some(i))
            }
        }
        Ok(None)
    }

    /// Find the first section of the given type.
    fn find_section_by_type(&self, sh_type: u32) -> Result<Option<usize>> {
        let shdrs = self.ensure_shdrs()?;
        let idx = shdrs
            .iter()
            .enumerate()
            .skip(1)
            .find_map(|(i, shdr)| (shdr.sh_type == sh_type).then_some(i));
        Ok(idx)
    }

    /// Retrieve the raw symbols of the symbol table in section `idx`
    /// along with the associated string table.
    fn raw_syms_at(&self, idx: usize) -> Result<(&'mmap [Elf64_Sym], &'mmap [u8])> {
        let shdrs = self.ensure_shdrs()?;
        let mut syms = self.section_data(idx)?;

        if syms.len() % mem::size_of::<Elf64_Sym>() != 0 {
            return Err(Error::with_invalid_data(
                "size of symbol table section is invalid",
            ))
        }

        let count = syms.len() / mem::size_of::<Elf64_Sym>();
        let syms = syms
            .read_pod_slice_ref::<Elf64_Sym>(count)
            .ok_or_invalid_data(|| "failed to read symbol table contents")?;

        // SANITY: `section_data` succeeded, so the index is valid.
        let strndx = shdrs[idx].sh_link as usize;
        let strs = self.section_data(strndx).context("failed to read string table")?;
        Ok((syms, strs))
    }

    fn raw_syms(&self, table: SymTable) -> Result<Option<(&'mmap [Elf64_Sym], &'mmap [u8])>> {
        let sh_type = match table {
            SymTable::Static => SHT_SYMTAB,
            SymTable::Dynamic => SHT_DYNSYM,
        };

        if let Some(idx) = self.find_section_by_type(sh_type)? {
            self.raw_syms_at(idx).map(Some)
        } else {
            Ok(None)
        }
    }
}

impl Debug for Cache<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "Cache")
    }
}


/// A parser for ELF64 files.
#[derive(Debug)]
pub(crate) struct ElfParser {
    /// A cache for relevant parts of the ELF file.
    // SAFETY: We must not hand out references with a 'static lifetime to
    //         this member. Rather, they should never outlive `self`.
    //         Furthermore, this member has to be listed before `mmap`
    //         to make sure we never end up with a dangling reference.
    cache: Cache<'static>,
    /// The memory mapped file.
    mmap: Mmap,
}

impl ElfParser {
    /// Create an `ElfParser` from an open file.
    pub(crate) fn open_file(file: &File) -> Result<ElfParser> {
        Mmap::map(file)
            .map(Self::from_mmap)
            .context("failed to memory map file")
    }

    /// Create an `ElfParser` from mmap'ed data.
    pub(crate) fn from_mmap(mmap: Mmap) -> ElfParser {
        // We transmute the mmap's lifetime to static here as that is a
        // necessity for self-referentiality.
        // SAFETY: We never hand out any 'static references to cache
        //         data.
        let elf_data = unsafe { mem::transmute::<&[u8], &'static [u8]>(mmap.deref()) };

        let parser = ElfParser {
            mmap,
            cache: Cache::new(elf_data),
        };
        parser
    }

    /// Create an `ElfParser` for a path.
    #[cfg(test)]
    pub(crate) fn open(filename: &Path) -> Result<ElfParser> {
        let file = File::open(filename)
            .with_context(|| format!("failed to open {}", filename.display()))?;
        Self::open_file(&file)
    }

    /// Retrieve the raw file contents.
    #[inline]
    pub(crate) fn data(&self) -> &[u8] {
        &self.mmap
    }

    /// Retrieve the ELF header.
    pub(crate) fn ehdr(&self) -> Result<&Elf64_Ehdr> {
        let ehdr = self.cache.ensure_ehdr()?;
        Ok(ehdr.ehdr)
    }

    /// Retrieve the data corresponding to the ELF section at index `idx`.
    pub(crate) fn section_data(&self, idx: usize) -> Result<&[u8]> {
        self.cache.section_data(idx)
    }

    /// Retrieve the file contents of the provided segment.
    pub(crate) fn segment_data(&self, phdr: &Elf64_Phdr) -> Result<&[u8]> {
        self.cache.segment_data(phdr)
    }

    /// Find the section of a given name.
    ///
    /// This function return the index of the section if found.
    pub(crate) fn find_section(&self, name: &str) -> Result<Option<usize>> {
        let index = self.cache.find_section(name)?;
        Ok(index)
    }

    pub(crate) fn section_headers(&self) -> Result<&[Elf64_Shdr]> {
        let shdrs = self.cache.ensure_shdrs()?;
        Ok(shdrs)
    }

    pub(crate) fn program_headers(&self) -> Result<&[Elf64_Phdr]> {
        let phdrs = self.cache.ensure_phdrs()?;
        Ok(phdrs)
    }

    /// Read all symbols of the given symbol table, in table order.
    ///
    /// The reserved null symbol at index zero is not reported. A missing
    /// table is reported as being empty.
    pub(crate) fn symbols(&self, table: SymTable) -> Result<Vec<RawSym>> {
        let (syms, strs) = if let Some(tables) = self.cache.raw_syms(table)? {
            tables
        } else {
            return Ok(Vec::new())
        };

        syms.iter()
            .skip(1)
            .map(|sym| {
                let name = symbol_name(strs, sym.st_name)?;
                Ok(RawSym {
                    name: Box::from(name),
                    sym: elf_sym(sym),
                })
            })
            .collect()
    }

    /// Gather the information needed for placing the object in an
    /// address space and decoding its procedure linkage table.
    pub(crate) fn object_info(&self) -> Result<ObjectInfo> {
        let ehdr = self.ehdr()?;
        let phdrs = self.program_headers()?;

        let (load_vaddr, load_offset) = phdrs
            .iter()
            .find(|phdr| phdr.p_type == PT_LOAD)
            .map(|phdr| (phdr.p_vaddr, phdr.p_offset))
            .unwrap_or((0, 0));
        let dynamic = phdrs
            .iter()
            .find(|phdr| phdr.p_type == PT_DYNAMIC)
            .map(|phdr| phdr.p_vaddr);
        let interp = phdrs
            .iter()
            .find(|phdr| phdr.p_type == PT_INTERP)
            .map(|phdr| {
                let mut data = self.segment_data(phdr)?;
                let interp = data
                    .read_cstr()
                    .ok_or_invalid_data(|| "PT_INTERP segment does not contain a string")?;
                Ok::<_, Error>(PathBuf::from(OsStr::from_bytes(interp.to_bytes())))
            })
            .transpose()?;

        let shdrs = self.section_headers()?;
        let mut plt = Vec::new();
        for name in PLT_SECTIONS {
            if let Some(idx) = self.find_section(name)? {
                let shdr = &shdrs[idx];
                let end = shdr
                    .sh_addr
                    .checked_add(shdr.sh_size)
                    .ok_or_invalid_data(|| format!("section {name} exceeds the address space"))?;
                let () = plt.push(shdr.sh_addr..end);
            }
        }

        let plt_relocs = self.plt_relocs()?;

        let info = ObjectInfo {
            elf_type: ehdr.e_type,
            machine: ehdr.e_machine,
            load_vaddr,
            load_offset,
            dynamic,
            interp,
            plt,
            plt_relocs,
            ..Default::default()
        };
        Ok(info)
    }

    fn plt_relocs(&self) -> Result<Vec<PltReloc>> {
        let idx = if let Some(idx) = self.find_section(PLT_RELOC_SECTION)? {
            idx
        } else {
            return Ok(Vec::new())
        };

        let mut data = self.section_data(idx)?;
        let count = data.len() / mem::size_of::<Elf64_Rela>();
        let relas = data
            .read_pod_slice_ref::<Elf64_Rela>(count)
            .ok_or_invalid_data(|| "failed to read PLT relocations")?;

        // The relocations reference the symbol table in `sh_link`,
        // which usually is the dynamic symbol table.
        let shdrs = self.section_headers()?;
        let symndx = shdrs[idx].sh_link as usize;
        let (syms, strs) = if symndx != 0 {
            self.cache.raw_syms_at(symndx)?
        } else if let Some(tables) = self.cache.raw_syms(SymTable::Dynamic)? {
            tables
        } else {
            return Ok(Vec::new())
        };

        // Relocations are reported in table order, as lazy binding stubs
        // refer to them by index. IRELATIVE relocations and the like have
        // no symbol and are reported with an empty name.
        relas
            .iter()
            .map(|rela| {
                let name = match rela.sym() {
                    0 => "",
                    idx => {
                        let sym = syms
                            .get(idx as usize)
                            .ok_or_invalid_data(|| format!("PLT relocation references invalid symbol {idx}"))?;
                        symbol_name(strs, sym.st_name)?
                    }
                };
                Ok(PltReloc {
                    got: rela.r_offset,
                    name: Box::from(name),
                })
            })
            .collect()
    }

    /// Retrieve all notes contained in `PT_NOTE` segments.
    pub(crate) fn notes(&self) -> Result<Vec<Note<'_>>> {
        fn pad(len: usize) -> usize {
            (4 - len % 4) % 4
        }

        let mut notes = Vec::new();
        for phdr in self.program_headers()? {
            if phdr.p_type != PT_NOTE {
                continue
            }

            let mut data = self.segment_data(phdr)?;
            while data.len() >= mem::size_of::<Elf64_Nhdr>() {
                let nhdr = data
                    .read_pod::<Elf64_Nhdr>()
                    .ok_or_invalid_data(|| "failed to read note header")?;
                let name = data
                    .read_slice(nhdr.n_namesz as usize)
                    .ok_or_invalid_data(|| "note name exceeds segment")?;
                let _pad = data.read_slice(pad(name.len()).min(data.len()));
                let desc = data
                    .read_slice(nhdr.n_descsz as usize)
                    .ok_or_invalid_data(|| "note descriptor exceeds segment")?;
                let _pad = data.read_slice(pad(desc.len()).min(data.len()));

                let note = Note {
                    n_type: nhdr.n_type,
                    // Strip the terminating NUL byte, if any.
                    name: name.strip_suffix(b"\0").unwrap_or(name),
                    desc,
                };
                let () = notes.push(note);
            }
        }
        Ok(notes)
    }
}
