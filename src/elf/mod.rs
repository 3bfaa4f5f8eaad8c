mod cache;
mod memory;
mod parser;
pub(crate) mod types;

pub(crate) use cache::ElfCache;
pub(crate) use memory::MemoryImage;
pub(crate) use parser::elf_class;
pub(crate) use parser::ElfParser;
pub(crate) use parser::Note;
