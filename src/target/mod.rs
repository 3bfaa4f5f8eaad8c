//! The interface to the operating system specific transport used for
//! accessing a target, along with the two providers shipped with the
//! crate.
//!
//! The core of the library only ever talks to a target through the
//! [`TargetIo`] trait. Users with special needs (remote targets, other
//! operating systems, ...) can provide their own implementation and
//! attach to it using [`Process::with_target`][crate::Process::with_target].

#[cfg(linux)]
pub(crate) mod corefile;
pub(crate) mod file;
#[cfg(linux)]
pub(crate) mod procfs;

use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::ops::BitOr;
use std::ops::BitOrAssign;
use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;

use crate::elf::types::AT_NULL;
use crate::elf::ElfCache;
use crate::elf::MemoryImage;
use crate::symbols::ElfSym;
use crate::symbols::SymTable;
use crate::util::decode_word;
use crate::Addr;
use crate::Result;


/// The kind of a target.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TargetKind {
    /// A live process.
    Live,
    /// A post-mortem core file.
    Core,
    /// An object file, not associated with any process.
    File,
}


/// The word size of a target.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum WordSize {
    /// 32 bit words.
    Bits32,
    /// 64 bit words.
    Bits64,
}

impl WordSize {
    /// The size of a word in bytes.
    #[inline]
    pub fn bytes(&self) -> usize {
        match self {
            Self::Bits32 => 4,
            Self::Bits64 => 8,
        }
    }
}


/// Memory protection flags of a mapping.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct Perm(u8);

impl Perm {
    /// No access.
    pub const NONE: Perm = Perm(0);
    /// The mapping is readable.
    pub const READ: Perm = Perm(0b0001);
    /// The mapping is writable.
    pub const WRITE: Perm = Perm(0b0010);
    /// The mapping is executable.
    pub const EXEC: Perm = Perm(0b0100);
    /// The mapping is shared with other processes.
    pub const SHARED: Perm = Perm(0b1000);

    /// Check whether all flags in `other` are set in `self`.
    #[inline]
    pub fn contains(&self, other: Perm) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Perm {
    type Output = Perm;

    fn bitor(self, rhs: Self) -> Self::Output {
        Perm(self.0 | rhs.0)
    }
}

impl BitOrAssign for Perm {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

impl Debug for Perm {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let flag = |perm, c| if self.contains(perm) { c } else { '-' };
        let shared = if self.contains(Perm::SHARED) { 's' } else { 'p' };
        write!(
            f,
            "{}{}{}{shared}",
            flag(Perm::READ, 'r'),
            flag(Perm::WRITE, 'w'),
            flag(Perm::EXEC, 'x')
        )
    }
}


/// A mapping as reported by a [`TargetIo`] provider.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RawMapping {
    /// The start address of the mapping.
    pub base: Addr,
    /// The size of the mapping, in bytes.
    pub size: u64,
    /// The protection flags of the mapping.
    pub perm: Perm,
    /// The offset of the mapping into the backing file.
    pub offset: u64,
    /// The path to the backing file, if any.
    pub path: Option<PathBuf>,
    /// The struct is non-exhaustive and open to extension.
    #[doc(hidden)]
    pub _non_exhaustive: (),
}


/// The image of an object to read symbols or object information from.
#[derive(Clone, Copy, Debug)]
pub enum ObjectImage<'path> {
    /// The object file at the given path.
    File(&'path Path),
    /// The object as loaded into the target's memory at `base`.
    Memory {
        /// The address the object's ELF header is loaded at.
        base: Addr,
    },
}


/// A symbol as read from an object's symbol table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawSym {
    /// The name of the symbol.
    pub name: Box<str>,
    /// The symbol record, with the value not yet relocated.
    pub sym: ElfSym,
}


/// A relocation of a procedure linkage table slot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PltReloc {
    /// The link-time address of the global offset table slot being
    /// relocated.
    pub got: Addr,
    /// The name of the symbol the slot resolves to.
    pub name: Box<str>,
}


/// Information about an object file that is relevant for placing it in
/// an address space and decoding its linkage.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ObjectInfo {
    /// The ELF object type (`ET_*`).
    pub elf_type: u16,
    /// The ELF machine (`EM_*`).
    pub machine: u16,
    /// The link-time virtual address of the first loadable segment.
    pub load_vaddr: Addr,
    /// The file offset of the first loadable segment.
    pub load_offset: u64,
    /// The link-time address of the dynamic section, if any.
    pub dynamic: Option<Addr>,
    /// The program interpreter requested by the object, if any.
    pub interp: Option<PathBuf>,
    /// The link-time address ranges of procedure linkage tables.
    pub plt: Vec<Range<Addr>>,
    /// The relocations of procedure linkage table slots.
    pub plt_relocs: Vec<PltReloc>,
    /// The struct is non-exhaustive and open to extension.
    #[doc(hidden)]
    pub _non_exhaustive: (),
}


/// An entry of a target's auxiliary vector.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AuxvEntry {
    /// The entry type (`AT_*`).
    pub type_: u64,
    /// The value.
    pub value: u64,
}

impl AuxvEntry {
    /// Decode an auxiliary vector from its in-memory representation.
    pub(crate) fn parse(data: &[u8], word_size: WordSize) -> Vec<AuxvEntry> {
        let size = word_size.bytes();
        data.chunks_exact(size * 2)
            .map_while(|pair| {
                let type_ = decode_word(pair, size)?;
                let value = decode_word(&pair[size..], size)?;
                (type_ != AT_NULL).then_some(AuxvEntry { type_, value })
            })
            .collect()
    }
}


/// Descriptive information about the process a target represents.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PsInfo {
    /// The process ID.
    pub pid: u32,
    /// The (possibly truncated) name of the executable.
    pub fname: String,
    /// The (possibly truncated) argument list.
    pub psargs: String,
    /// The struct is non-exhaustive and open to extension.
    #[doc(hidden)]
    pub _non_exhaustive: (),
}


/// The transport used for accessing a target.
///
/// Implementations are only ever used from a single thread at a time.
pub trait TargetIo: Debug + Send {
    /// Report the kind of target.
    fn kind(&self) -> TargetKind;

    /// Report the word size of the target.
    fn word_size(&self) -> WordSize;

    /// Enumerate the target's memory mappings, in ascending address
    /// order.
    fn enumerate_mappings(&self) -> Result<Vec<RawMapping>>;

    /// Fill `buf` with target memory starting at `addr`.
    ///
    /// Partial reads are reported as errors.
    fn read_memory(&self, addr: Addr, buf: &mut [u8]) -> Result<()>;

    /// Write `data` into target memory at `addr`.
    fn write_memory(&mut self, addr: Addr, data: &[u8]) -> Result<()>;

    /// Stop the target, blocking until it is stopped.
    fn stop(&mut self) -> Result<()>;

    /// Resume a stopped target.
    fn resume(&mut self) -> Result<()>;

    /// Check whether the target is currently stopped.
    fn is_stopped(&self) -> Result<bool>;

    /// Read the symbols of the provided symbol table of an object image,
    /// in table order.
    fn symbols(&self, image: ObjectImage<'_>, table: SymTable) -> Result<Vec<RawSym>>;

    /// Retrieve information about an object image.
    fn object_info(&self, image: ObjectImage<'_>) -> Result<ObjectInfo>;

    /// Retrieve the path of the target's executable, if known.
    fn executable(&self) -> Option<PathBuf> {
        None
    }

    /// Retrieve the target's auxiliary vector.
    fn auxv(&self) -> Result<Vec<AuxvEntry>> {
        Ok(Vec::new())
    }

    /// Retrieve a token identifying the image the target is currently
    /// running.
    ///
    /// The token is expected to change whenever the target executes a
    /// new image.
    fn image_token(&self) -> Option<u64> {
        None
    }

    /// Retrieve descriptive information about the target's process.
    fn psinfo(&self) -> Option<PsInfo> {
        None
    }

    /// Resolve the path of a mapped object into its canonical form.
    fn resolve_path(&self, path: &Path) -> PathBuf {
        path.canonicalize().unwrap_or_else(|_err| path.to_path_buf())
    }

    /// Release any resources associated with the target.
    ///
    /// If `retain` is set, the target is to be left untouched, which
    /// includes leaving it stopped.
    fn release(&mut self, retain: bool) -> Result<()> {
        let _retain = retain;
        Ok(())
    }
}


/// Symbol and object information reading shared by the bundled
/// providers.
#[derive(Debug, Default)]
pub(crate) struct ObjectReader {
    cache: ElfCache,
}

impl ObjectReader {
    pub(crate) fn symbols<F>(
        &self,
        image: ObjectImage<'_>,
        table: SymTable,
        read: F,
    ) -> Result<Vec<RawSym>>
    where
        F: FnMut(Addr, &mut [u8]) -> Result<()>,
    {
        match image {
            ObjectImage::File(path) => {
                let parser = self.cache.find(path)?;
                parser.symbols(table)
            }
            ObjectImage::Memory { base } => match table {
                // Only the dynamic symbol table is loaded into memory.
                SymTable::Static => Ok(Vec::new()),
                SymTable::Dynamic => MemoryImage::new(base, read).symbols(),
            },
        }
    }

    pub(crate) fn object_info<F>(&self, image: ObjectImage<'_>, read: F) -> Result<ObjectInfo>
    where
        F: FnMut(Addr, &mut [u8]) -> Result<()>,
    {
        match image {
            ObjectImage::File(path) => {
                let parser = self.cache.find(path)?;
                parser.object_info()
            }
            ObjectImage::Memory { base } => MemoryImage::new(base, read).object_info(),
        }
    }

    #[inline]
    pub(crate) fn cache(&self) -> &ElfCache {
        &self.cache
    }
}
