//! Reading of ELF object information from a loaded image, as opposed to
//! from a file.
//!
//! Only the parts of an object that are loaded are available this way:
//! the ELF and program headers, the dynamic section, and everything it
//! references, most notably the dynamic symbol table.

use std::ffi::OsStr;
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt as _;
use std::path::PathBuf;

use crate::target::ObjectInfo;
use crate::target::RawSym;
use crate::util::Pod;
use crate::util::ReadRaw as _;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::IntoError as _;
use crate::Result;

use super::parser::elf_sym;
use super::types::Elf64_Dyn;
use super::types::Elf64_Ehdr;
use super::types::Elf64_Phdr;
use super::types::Elf64_Sym;
use super::types::DT_GNU_HASH;
use super::types::DT_HASH;
use super::types::DT_NULL;
use super::types::DT_STRSZ;
use super::types::DT_STRTAB;
use super::types::DT_SYMENT;
use super::types::DT_SYMTAB;
use super::types::EI_CLASS;
use super::types::ELFCLASS64;
use super::types::ELFMAG;
use super::types::PT_DYNAMIC;
use super::types::PT_INTERP;
use super::types::PT_LOAD;


/// An upper bound on the number of dynamic entries we are willing to
/// read.
const MAX_DYN_ENTRIES: usize = 4096;
/// An upper bound on the number of dynamic symbols we are willing to
/// read.
const MAX_DYN_SYMS: usize = 1 << 20;


fn read_pod<T, F>(read: &mut F, addr: Addr) -> Result<T>
where
    T: Pod,
    F: FnMut(Addr, &mut [u8]) -> Result<()>,
{
    let mut buf = vec![0; size_of::<T>()];
    let () = read(addr, &mut buf)?;
    buf.as_slice()
        .read_pod::<T>()
        .ok_or_unexpected_eof(|| "short read of target memory")
}

fn read_vec<T, F>(read: &mut F, addr: Addr, count: usize) -> Result<Vec<T>>
where
    T: Pod,
    F: FnMut(Addr, &mut [u8]) -> Result<()>,
{
    let len = size_of::<T>()
        .checked_mul(count)
        .ok_or_invalid_data(|| "table size overflow")?;
    let mut buf = vec![0; len];
    let () = read(addr, &mut buf)?;

    let mut data = buf.as_slice();
    (0..count)
        .map(|_| {
            data.read_pod::<T>()
                .ok_or_unexpected_eof(|| "short read of target memory")
        })
        .collect()
}


/// The location of the tables referenced by a dynamic section.
#[derive(Debug, Default)]
struct DynTables {
    symtab: Option<Addr>,
    strtab: Option<Addr>,
    strsz: Option<u64>,
    syment: Option<u64>,
    hash: Option<Addr>,
    gnu_hash: Option<Addr>,
}


/// An ELF object as loaded into a target's address space.
pub(crate) struct MemoryImage<F> {
    /// The address the ELF header is loaded at.
    base: Addr,
    /// The function used for reading target memory.
    read: F,
}

impl<F> MemoryImage<F>
where
    F: FnMut(Addr, &mut [u8]) -> Result<()>,
{
    pub(crate) fn new(base: Addr, read: F) -> Self {
        Self { base, read }
    }

    fn ehdr(&mut self) -> Result<Elf64_Ehdr> {
        let ehdr = read_pod::<Elf64_Ehdr, _>(&mut self.read, self.base)
            .context("failed to read ELF header")?;
        if ehdr.e_ident[..ELFMAG.len()] != ELFMAG {
            return Err(Error::with_invalid_data(format!(
                "no ELF image loaded at {:#x}",
                self.base
            )))
        }
        if ehdr.e_ident[EI_CLASS] != ELFCLASS64 {
            return Err(Error::with_unsupported(
                "only 64 bit ELF images can be read from memory",
            ))
        }
        Ok(ehdr)
    }

    fn phdrs(&mut self, ehdr: &Elf64_Ehdr) -> Result<Vec<Elf64_Phdr>> {
        let addr = self.base + ehdr.e_phoff;
        read_vec(&mut self.read, addr, usize::from(ehdr.e_phnum))
            .context("failed to read program headers")
    }

    /// Calculate the difference between run-time and link-time
    /// addresses.
    fn bias(phdrs: &[Elf64_Phdr], base: Addr) -> Addr {
        // The ELF header is part of the first loadable segment, which
        // starts at offset zero.
        let vaddr = phdrs
            .iter()
            .find(|phdr| phdr.p_type == PT_LOAD)
            .map(|phdr| phdr.p_vaddr - phdr.p_offset)
            .unwrap_or(0);
        base.wrapping_sub(vaddr)
    }

    fn dyn_tables(&mut self, phdrs: &[Elf64_Phdr], bias: Addr) -> Result<Option<DynTables>> {
        let dynamic = if let Some(phdr) = phdrs.iter().find(|phdr| phdr.p_type == PT_DYNAMIC) {
            phdr
        } else {
            return Ok(None)
        };

        let count = (dynamic.p_memsz as usize / size_of::<Elf64_Dyn>()).min(MAX_DYN_ENTRIES);
        let entries = read_vec::<Elf64_Dyn, _>(
            &mut self.read,
            dynamic.p_vaddr.wrapping_add(bias),
            count,
        )
        .context("failed to read dynamic section")?;

        // Depending on the architecture the dynamic linker may or may not
        // have relocated pointers in the dynamic section. We can tell by
        // whether they point below the object's base.
        let base = self.base;
        let ptr = |value: u64| {
            if value < base {
                value.wrapping_add(bias)
            } else {
                value
            }
        };

        let mut tables = DynTables::default();
        for entry in entries {
            match entry.d_tag {
                DT_NULL => break,
                DT_SYMTAB => tables.symtab = Some(ptr(entry.d_un)),
                DT_STRTAB => tables.strtab = Some(ptr(entry.d_un)),
                DT_STRSZ => tables.strsz = Some(entry.d_un),
                DT_SYMENT => tables.syment = Some(entry.d_un),
                DT_HASH => tables.hash = Some(ptr(entry.d_un)),
                DT_GNU_HASH => tables.gnu_hash = Some(ptr(entry.d_un)),
                _ => (),
            }
        }
        Ok(Some(tables))
    }

    /// Determine the number of dynamic symbols using the SysV hash
    /// table.
    fn hash_count(&mut self, hash: Addr) -> Result<usize> {
        // The hash table starts with `nbucket` and `nchain`; the latter
        // equals the number of symbols.
        let header = read_vec::<u32, _>(&mut self.read, hash, 2)?;
        Ok(header[1] as usize)
    }

    /// Determine the number of dynamic symbols using the GNU hash table.
    fn gnu_hash_count(&mut self, hash: Addr) -> Result<usize> {
        let header = read_vec::<u32, _>(&mut self.read, hash, 4)?;
        let nbuckets = header[0] as usize;
        let symoffset = header[1] as usize;
        let bloom_size = header[2] as u64;

        let buckets_addr = hash + 16 + bloom_size * 8;
        let buckets = read_vec::<u32, _>(&mut self.read, buckets_addr, nbuckets)?;
        let max_bucket = buckets.iter().copied().max().unwrap_or(0) as usize;
        if max_bucket < symoffset {
            return Ok(symoffset)
        }

        // Walk the chain of the last used bucket until we hit its end.
        let chain_addr = buckets_addr + nbuckets as u64 * 4;
        let mut idx = max_bucket;
        loop {
            if idx > MAX_DYN_SYMS {
                return Err(Error::with_invalid_data(
                    "GNU hash table chain does not terminate",
                ))
            }
            let addr = chain_addr + ((idx - symoffset) as u64) * 4;
            let value = read_pod::<u32, _>(&mut self.read, addr)?;
            if value & 1 != 0 {
                break Ok(idx + 1)
            }
            idx += 1;
        }
    }

    /// Read the dynamic symbol table of the image.
    pub(crate) fn symbols(mut self) -> Result<Vec<RawSym>> {
        let ehdr = self.ehdr()?;
        let phdrs = self.phdrs(&ehdr)?;
        let bias = Self::bias(&phdrs, self.base);
        let tables = if let Some(tables) = self.dyn_tables(&phdrs, bias)? {
            tables
        } else {
            return Ok(Vec::new())
        };

        let (symtab, strtab, strsz) = match (tables.symtab, tables.strtab, tables.strsz) {
            (Some(symtab), Some(strtab), Some(strsz)) => (symtab, strtab, strsz),
            _ => return Ok(Vec::new()),
        };
        if let Some(syment) = tables.syment {
            if syment != size_of::<Elf64_Sym>() as u64 {
                return Err(Error::with_unsupported(format!(
                    "unsupported dynamic symbol entry size: {syment}"
                )))
            }
        }

        let count = if let Some(hash) = tables.gnu_hash {
            self.gnu_hash_count(hash)?
        } else if let Some(hash) = tables.hash {
            self.hash_count(hash)?
        } else {
            // Without a hash table the symbol table is commonly followed
            // immediately by the string table.
            strtab.saturating_sub(symtab) as usize / size_of::<Elf64_Sym>()
        };
        let count = count.min(MAX_DYN_SYMS);

        let syms = read_vec::<Elf64_Sym, _>(&mut self.read, symtab, count)
            .context("failed to read dynamic symbol table")?;
        let strsz = usize::try_from(strsz)
            .ok()
            .ok_or_invalid_data(|| "dynamic string table is too large")?;
        let mut strs = vec![0; strsz];
        let () = (self.read)(strtab, &mut strs).context("failed to read dynamic string table")?;

        syms.iter()
            .skip(1)
            .map(|sym| {
                let name = strs
                    .get(sym.st_name as usize..)
                    .ok_or_invalid_data(|| "string table index out of bounds")?
                    .read_cstr()
                    .ok_or_invalid_data(|| "no valid string found in string table")?
                    .to_str()
                    .map_err(Error::with_invalid_data)
                    .context("invalid symbol name")?;
                Ok(RawSym {
                    name: Box::from(name),
                    sym: elf_sym(sym),
                })
            })
            .collect()
    }

    /// Gather what object information is available from the image.
    ///
    /// Section headers are not loaded, so no procedure linkage table
    /// information is reported.
    pub(crate) fn object_info(mut self) -> Result<ObjectInfo> {
        let ehdr = self.ehdr()?;
        let phdrs = self.phdrs(&ehdr)?;
        let bias = Self::bias(&phdrs, self.base);

        let (load_vaddr, load_offset) = phdrs
            .iter()
            .find(|phdr| phdr.p_type == PT_LOAD)
            .map(|phdr| (phdr.p_vaddr, phdr.p_offset))
            .unwrap_or((0, 0));
        let dynamic = phdrs
            .iter()
            .find(|phdr| phdr.p_type == PT_DYNAMIC)
            .map(|phdr| phdr.p_vaddr);
        let interp = if let Some(phdr) = phdrs.iter().find(|phdr| phdr.p_type == PT_INTERP) {
            let mut buf = vec![0; phdr.p_filesz as usize];
            let () = (self.read)(phdr.p_vaddr.wrapping_add(bias), &mut buf)?;
            let path = buf
                .as_slice()
                .read_cstr()
                .ok_or_invalid_data(|| "PT_INTERP segment does not contain a string")?;
            Some(PathBuf::from(OsStr::from_bytes(path.to_bytes())))
        } else {
            None
        };

        let info = ObjectInfo {
            elf_type: ehdr.e_type,
            machine: ehdr.e_machine,
            load_vaddr,
            load_offset,
            dynamic,
            interp,
            ..Default::default()
        };
        Ok(info)
    }
}
