//! Symbol related types and the per-object symbol table index.

mod index;
pub(crate) mod plt;

use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::ops::BitOr;
use std::path::Path;

use crate::elf::types::SHN_UNDEF;
use crate::elf::types::STB_GLOBAL;
use crate::elf::types::STB_GNU_UNIQUE;
use crate::elf::types::STB_LOCAL;
use crate::elf::types::STB_WEAK;
use crate::elf::types::STT_COMMON;
use crate::elf::types::STT_FILE;
use crate::elf::types::STT_FUNC;
use crate::elf::types::STT_GNU_IFUNC;
use crate::elf::types::STT_NOTYPE;
use crate::elf::types::STT_OBJECT;
use crate::elf::types::STT_SECTION;
use crate::elf::types::STT_TLS;
use crate::Addr;

pub(crate) use index::IndexedSym;
pub(crate) use index::SymbolIndex;
pub(crate) use index::SymbolTable;


/// A stable handle to a load object of a [`Process`][crate::Process].
///
/// Handles stay valid for as long as the object remains mapped with the
/// same identity and base address.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjId(pub(crate) usize);

impl Display for ObjId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "#{}", self.0)
    }
}


/// The symbol tables an object may carry.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SymTable {
    /// The static symbol table (`.symtab`).
    Static,
    /// The dynamic symbol table (`.dynsym`).
    Dynamic,
}


/// The order in which to visit symbols.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SymOrder {
    /// Order by ascending address, with symbols at the same address
    /// ordered by descending size.
    #[default]
    ByAddress,
    /// Order by name, with symbols of the same name in table order.
    ByName,
}


/// The type of a symbol.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SymType {
    /// The symbol's type is not specified.
    NoType,
    /// A data object, including thread local and common ones.
    Object,
    /// A function, including indirect ones.
    Func,
    /// A section.
    Section,
    /// A source file.
    File,
    /// Some other type, reported as the raw `STT_*` value.
    Other(u8),
}


/// The binding of a symbol.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SymBinding {
    /// A symbol not visible outside the object.
    Local,
    /// A global symbol, including GNU unique ones.
    Global,
    /// A weak symbol.
    Weak,
    /// Some other binding, reported as the raw `STB_*` value.
    Other(u8),
}


/// An ELF symbol record.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct ElfSym {
    /// The symbol's value, typically an address.
    pub st_value: u64,
    /// The size of the symbol.
    pub st_size: u64,
    /// The symbol's type and binding attributes.
    pub st_info: u8,
    /// The symbol's visibility.
    pub st_other: u8,
    /// The index of the section the symbol is defined in.
    pub st_shndx: u16,
}

impl ElfSym {
    /// Retrieve the symbol's type.
    pub fn type_(&self) -> SymType {
        match self.st_info & 0xf {
            STT_NOTYPE => SymType::NoType,
            STT_OBJECT | STT_COMMON | STT_TLS => SymType::Object,
            STT_FUNC | STT_GNU_IFUNC => SymType::Func,
            STT_SECTION => SymType::Section,
            STT_FILE => SymType::File,
            other => SymType::Other(other),
        }
    }

    /// Retrieve the symbol's binding.
    pub fn binding(&self) -> SymBinding {
        match self.st_info >> 4 {
            STB_LOCAL => SymBinding::Local,
            STB_GLOBAL | STB_GNU_UNIQUE => SymBinding::Global,
            STB_WEAK => SymBinding::Weak,
            other => SymBinding::Other(other),
        }
    }

    /// Check whether the symbol is defined in the object containing it.
    #[inline]
    pub fn is_defined(&self) -> bool {
        self.st_shndx != SHN_UNDEF
    }

    /// Check whether the provided address is covered by the symbol.
    ///
    /// Symbols without a size do not cover any address.
    #[inline]
    pub(crate) fn contains(&self, addr: Addr) -> bool {
        self.st_value <= addr && addr - self.st_value < self.st_size
    }
}


/// A filter on symbol bindings and types.
///
/// A symbol matches a mask if it matches at least one of the binding
/// flags and at least one of the type flags contained in it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SymMask(u32);

impl SymMask {
    /// Match local symbols.
    pub const LOCAL: SymMask = SymMask(0x0001);
    /// Match global symbols.
    pub const GLOBAL: SymMask = SymMask(0x0002);
    /// Match weak symbols.
    pub const WEAK: SymMask = SymMask(0x0004);
    /// Match symbols of any binding.
    pub const ANY_BINDING: SymMask = SymMask(0x00ff);
    /// Match symbols without a type.
    pub const NOTYPE: SymMask = SymMask(0x0100);
    /// Match data objects.
    pub const OBJECT: SymMask = SymMask(0x0200);
    /// Match functions.
    pub const FUNC: SymMask = SymMask(0x0400);
    /// Match section symbols.
    pub const SECTION: SymMask = SymMask(0x0800);
    /// Match file symbols.
    pub const FILE: SymMask = SymMask(0x1000);
    /// Match symbols of any type.
    pub const ANY_TYPE: SymMask = SymMask(0xff00);
    /// Match all symbols.
    pub const ALL: SymMask = SymMask(0xffff);

    /// Check whether the provided symbol matches the mask.
    pub fn matches(&self, sym: &ElfSym) -> bool {
        let binding = match sym.binding() {
            SymBinding::Local => Self::LOCAL,
            SymBinding::Global => Self::GLOBAL,
            SymBinding::Weak => Self::WEAK,
            SymBinding::Other(..) => return false,
        };
        let type_ = match sym.type_() {
            SymType::NoType => Self::NOTYPE,
            SymType::Object => Self::OBJECT,
            SymType::Func => Self::FUNC,
            SymType::Section => Self::SECTION,
            SymType::File => Self::FILE,
            SymType::Other(..) => return false,
        };

        self.0 & binding.0 != 0 && self.0 & type_.0 != 0
    }
}

impl BitOr for SymMask {
    type Output = SymMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        SymMask(self.0 | rhs.0)
    }
}

impl Default for SymMask {
    fn default() -> Self {
        Self::ALL
    }
}


/// A selection of load objects to operate on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjectSelector<'name> {
    /// The target's executable.
    Executable,
    /// The target's dynamic linker.
    DynamicLinker,
    /// Every load object: the executable first, the dynamic linker
    /// second, and all others in mapping order.
    Every,
    /// The object with the given name.
    ///
    /// The name matches an object if it is equal to the object's full
    /// path, to its file name, or to its file name up to a version or
    /// suffix separating dot (e.g., `libc` and `libc.so` both match
    /// `/usr/lib/libc.so.6`). The name `a.out` refers to the
    /// executable.
    Named(&'name str),
}

impl ObjectSelector<'_> {
    /// Check whether the named selector matches the provided object
    /// path.
    pub(crate) fn matches_path(name: &str, path: &Path) -> bool {
        if path.as_os_str() == name {
            return true
        }

        let file_name = if let Some(file_name) = path.file_name().and_then(|name| name.to_str()) {
            file_name
        } else {
            return false
        };

        file_name == name
            || file_name
                .strip_prefix(name)
                .is_some_and(|rest| rest.starts_with('.'))
    }
}


/// A symbol of a load object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SymbolEntry {
    /// The name of the symbol.
    pub name: Box<str>,
    /// The symbol record, with its value relocated to the target's
    /// address space.
    pub sym: ElfSym,
    /// The load object containing the symbol.
    pub object: ObjId,
    /// The symbol table the symbol was found in.
    pub table: SymTable,
}

impl SymbolEntry {
    /// The run-time address of the symbol.
    #[inline]
    pub fn addr(&self) -> Addr {
        self.sym.st_value
    }

    /// Copy the symbol's name into `buf` as a NUL terminated string,
    /// truncating it if necessary.
    ///
    /// The length of the full name is returned, so that truncation can
    /// be detected by comparing it to the buffer size. Nothing is
    /// copied into an empty buffer.
    pub fn copy_name(&self, buf: &mut [u8]) -> usize {
        let name = self.name.as_bytes();
        if let Some(max) = buf.len().checked_sub(1) {
            let len = name.len().min(max);
            let () = buf[..len].copy_from_slice(&name[..len]);
            buf[len] = b'\0';
        }
        name.len()
    }
}
