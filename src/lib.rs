#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]


mod config;
mod elf;
mod error;
mod hooks;
mod log;
#[cfg(linux)]
mod maps;
mod mmap;
mod pid;
mod process;
mod rtld;
mod space;
mod symbols;
mod target;
#[cfg(test)]
mod test_helper;
mod util;


/// A type representing addresses in a target's address space.
pub type Addr = u64;

/// A result type using our [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;


pub use crate::config::Builder as ConfigBuilder;
pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::error::ErrorExt;
pub use crate::error::ErrorKind;
pub use crate::error::IntoCowStr;
pub use crate::error::IntoError;
pub use crate::hooks::DefaultHooks;
pub use crate::hooks::Hooks;
pub use crate::pid::Pid;
pub use crate::process::AttachOpts;
pub use crate::process::Process;
pub use crate::process::State;
pub use crate::rtld::Agent;
pub use crate::rtld::LinkMap;
pub use crate::rtld::RDebug;
pub use crate::rtld::RtState;
pub use crate::space::LoadObject;
pub use crate::space::Mapping;
pub use crate::symbols::ElfSym;
pub use crate::symbols::ObjId;
pub use crate::symbols::ObjectSelector;
pub use crate::symbols::SymBinding;
pub use crate::symbols::SymMask;
pub use crate::symbols::SymOrder;
pub use crate::symbols::SymTable;
pub use crate::symbols::SymType;
pub use crate::symbols::SymbolEntry;
pub use crate::target::AuxvEntry;
pub use crate::target::ObjectImage;
pub use crate::target::ObjectInfo;
pub use crate::target::Perm;
pub use crate::target::PltReloc;
pub use crate::target::PsInfo;
pub use crate::target::RawMapping;
pub use crate::target::RawSym;
pub use crate::target::TargetIo;
pub use crate::target::TargetKind;
pub use crate::target::WordSize;
