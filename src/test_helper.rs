//! An in-memory [`TargetIo`] provider for exercising the library
//! without a real target.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::elf::types::EM_X86_64;
use crate::elf::types::ET_DYN;
use crate::symbols::ElfSym;
use crate::symbols::SymTable;
use crate::target::AuxvEntry;
use crate::target::ObjectImage;
use crate::target::ObjectInfo;
use crate::target::Perm;
use crate::target::PltReloc;
use crate::target::RawMapping;
use crate::target::RawSym;
use crate::target::TargetIo;
use crate::target::TargetKind;
use crate::target::WordSize;
use crate::Addr;
use crate::Error;
use crate::ErrorKind;
use crate::Result;


const PAGE_SIZE: u64 = 0x1000;


/// A fake load object: a text and a data mapping, optionally followed
/// by an anonymous `.bss` mapping.
#[derive(Clone, Debug)]
pub(crate) struct MockObject {
    path: PathBuf,
    base: Addr,
    bss: Option<u64>,
    info: ObjectInfo,
    static_syms: Vec<RawSym>,
    dynamic_syms: Vec<RawSym>,
    /// Whether the object file is present, as opposed to only the image
    /// in memory.
    on_disk: bool,
}

impl MockObject {
    pub(crate) fn new<P>(path: P, base: Addr) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            path: path.into(),
            base,
            bss: None,
            info: ObjectInfo {
                elf_type: ET_DYN,
                machine: EM_X86_64,
                ..Default::default()
            },
            static_syms: Vec::new(),
            dynamic_syms: Vec::new(),
            on_disk: true,
        }
    }

    pub(crate) fn with_interp<P>(mut self, interp: P) -> Self
    where
        P: Into<PathBuf>,
    {
        self.info.interp = Some(interp.into());
        self
    }

    pub(crate) fn with_load_vaddr(mut self, vaddr: Addr) -> Self {
        self.info.load_vaddr = vaddr;
        self
    }

    pub(crate) fn with_bss(mut self, size: u64) -> Self {
        self.bss = Some(size);
        self
    }

    pub(crate) fn with_dynamic(mut self, dynamic: Addr) -> Self {
        self.info.dynamic = Some(dynamic);
        self
    }

    pub(crate) fn with_machine(mut self, machine: u16) -> Self {
        self.info.machine = machine;
        self
    }

    pub(crate) fn with_plt(mut self, plt: Range<Addr>, relocs: &[(Addr, &str)]) -> Self {
        let () = self.info.plt.push(plt);
        let () = self
            .info
            .plt_relocs
            .extend(relocs.iter().map(|(got, name)| PltReloc {
                got: *got,
                name: Box::from(*name),
            }));
        self
    }

    /// Add a symbol with the given link-time `value`.
    pub(crate) fn with_sym(
        mut self,
        table: SymTable,
        name: &str,
        value: Addr,
        size: u64,
        info: u8,
    ) -> Self {
        let sym = RawSym {
            name: Box::from(name),
            sym: ElfSym {
                st_value: value,
                st_size: size,
                st_info: info,
                st_other: 0,
                st_shndx: 1,
            },
        };
        let syms = match table {
            SymTable::Static => &mut self.static_syms,
            SymTable::Dynamic => &mut self.dynamic_syms,
        };
        let () = syms.push(sym);
        self
    }

    /// Make the object file unavailable, so that only the in-memory
    /// image can be read.
    pub(crate) fn without_file(mut self) -> Self {
        self.on_disk = false;
        self
    }

    fn mappings(&self) -> Vec<RawMapping> {
        let mut mappings = vec![
            RawMapping {
                base: self.base,
                size: PAGE_SIZE,
                perm: Perm::READ | Perm::EXEC,
                offset: 0,
                path: Some(self.path.clone()),
                ..Default::default()
            },
            RawMapping {
                base: self.base + PAGE_SIZE,
                size: PAGE_SIZE,
                perm: Perm::READ | Perm::WRITE,
                offset: PAGE_SIZE,
                path: Some(self.path.clone()),
                ..Default::default()
            },
        ];
        if let Some(bss) = self.bss {
            let () = mappings.push(RawMapping {
                base: self.base + 2 * PAGE_SIZE,
                size: bss,
                perm: Perm::READ | Perm::WRITE,
                ..Default::default()
            });
        }
        mappings
    }

    fn syms(&self, table: SymTable) -> Vec<RawSym> {
        match table {
            SymTable::Static => self.static_syms.clone(),
            SymTable::Dynamic => self.dynamic_syms.clone(),
        }
    }
}


#[derive(Debug, Default)]
struct State {
    objects: Vec<MockObject>,
    /// Mappings not belonging to any object.
    other: Vec<RawMapping>,
    memory: BTreeMap<Addr, u8>,
    /// Pages made accessible by writes.
    pages: BTreeSet<Addr>,
    auxv: Vec<AuxvEntry>,
    executable: Option<PathBuf>,
    token: u64,
    stopped: bool,
    stops: usize,
    resumes: usize,
    symbol_reads: usize,
    released: Option<bool>,
}

impl State {
    fn is_accessible(&self, addr: Addr) -> bool {
        self.pages.contains(&(addr & !(PAGE_SIZE - 1)))
            || self
                .objects
                .iter()
                .flat_map(MockObject::mappings)
                .chain(self.other.iter().cloned())
                .any(|mapping| (mapping.base..mapping.base + mapping.size).contains(&addr))
    }
}


/// A fake target.
///
/// Clones share their state, so that a test can modify a target after
/// handing it to a [`Process`][crate::Process].
#[derive(Clone, Debug)]
pub(crate) struct MockTarget {
    kind: TargetKind,
    state: Arc<Mutex<State>>,
}

impl MockTarget {
    pub(crate) fn new() -> Self {
        Self {
            kind: TargetKind::Live,
            state: Arc::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn with_kind(mut self, kind: TargetKind) -> Self {
        self.kind = kind;
        self
    }

    pub(crate) fn with_object(mut self, object: MockObject) -> Self {
        let () = self.add_object(object);
        self
    }

    /// Add an anonymous mapping.
    pub(crate) fn with_anonymous(self, base: Addr, size: u64) -> Self {
        let () = self.state().other.push(RawMapping {
            base,
            size,
            perm: Perm::READ | Perm::WRITE,
            ..Default::default()
        });
        self
    }

    /// Add a mapping of a file that is not an ELF object.
    pub(crate) fn with_file<P>(self, base: Addr, path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        let () = self.state().other.push(RawMapping {
            base,
            size: PAGE_SIZE,
            perm: Perm::READ,
            path: Some(path.into()),
            ..Default::default()
        });
        self
    }

    pub(crate) fn with_auxv(self, type_: u64, value: u64) -> Self {
        let () = self.state().auxv.push(AuxvEntry { type_, value });
        self
    }

    pub(crate) fn add_object(&mut self, object: MockObject) {
        let () = self.state().objects.push(object);
    }

    pub(crate) fn remove_object<P>(&mut self, path: P)
    where
        P: AsRef<Path>,
    {
        let () = self
            .state()
            .objects
            .retain(|object| object.path != path.as_ref());
    }

    pub(crate) fn write_bytes(&mut self, addr: Addr, data: &[u8]) {
        let mut state = self.state();
        for (offset, byte) in data.iter().enumerate() {
            let addr = addr + offset as Addr;
            let _prev = state.memory.insert(addr, *byte);
            let _inserted = state.pages.insert(addr & !(PAGE_SIZE - 1));
        }
    }

    pub(crate) fn write_words(&mut self, addr: Addr, words: &[u64]) {
        for (idx, word) in words.iter().enumerate() {
            let () = self.write_bytes(addr + idx as Addr * 8, &word.to_le_bytes());
        }
    }

    /// Pretend that the target executed a new image.
    pub(crate) fn exec(&mut self) {
        self.state().token += 1;
    }

    /// Stop or continue the target behind the library's back.
    pub(crate) fn set_stopped(&mut self, stopped: bool) {
        self.state().stopped = stopped;
    }

    pub(crate) fn is_stopped_now(&self) -> bool {
        self.state().stopped
    }

    /// The number of `stop` and `resume` requests seen.
    pub(crate) fn stop_resume_counts(&self) -> (usize, usize) {
        let state = self.state();
        (state.stops, state.resumes)
    }

    /// The number of symbol tables read so far.
    pub(crate) fn symbol_reads(&self) -> usize {
        self.state().symbol_reads
    }

    /// The `retain` flag the target was released with, if released.
    pub(crate) fn released(&self) -> Option<bool> {
        self.state().released
    }
}

impl TargetIo for MockTarget {
    fn kind(&self) -> TargetKind {
        self.kind
    }

    fn word_size(&self) -> WordSize {
        WordSize::Bits64
    }

    fn enumerate_mappings(&self) -> Result<Vec<RawMapping>> {
        let state = self.state();
        let mappings = state
            .objects
            .iter()
            .flat_map(MockObject::mappings)
            .chain(state.other.iter().cloned())
            .collect();
        Ok(mappings)
    }

    fn read_memory(&self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        let state = self.state();
        for (offset, byte) in buf.iter_mut().enumerate() {
            let addr = addr + offset as Addr;
            if !state.is_accessible(addr) {
                return Err(Error::with_kind(
                    ErrorKind::UnexpectedEof,
                    format!("address {addr:#x} is not mapped"),
                ))
            }
            *byte = state.memory.get(&addr).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write_memory(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        if self.kind == TargetKind::Core {
            return Err(Error::with_unsupported("cannot write to core file"))
        }
        let () = self.write_bytes(addr, data);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.state();
        state.stops += 1;
        state.stopped = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let mut state = self.state();
        state.resumes += 1;
        state.stopped = false;
        Ok(())
    }

    fn is_stopped(&self) -> Result<bool> {
        Ok(self.kind == TargetKind::Core || self.state().stopped)
    }

    fn symbols(&self, image: ObjectImage<'_>, table: SymTable) -> Result<Vec<RawSym>> {
        let mut state = self.state();
        state.symbol_reads += 1;

        match image {
            ObjectImage::File(path) => state
                .objects
                .iter()
                .find(|object| object.on_disk && object.path == path)
                .map(|object| object.syms(table))
                .ok_or_else(|| Error::with_not_found(format!("{} not found", path.display()))),
            ObjectImage::Memory { base } => {
                let object = state
                    .objects
                    .iter()
                    .find(|object| object.base == base)
                    .ok_or_else(|| {
                        Error::with_invalid_data(format!("no ELF image loaded at {base:#x}"))
                    })?;
                match table {
                    SymTable::Static => Ok(Vec::new()),
                    SymTable::Dynamic => Ok(object.syms(table)),
                }
            }
        }
    }

    fn object_info(&self, image: ObjectImage<'_>) -> Result<ObjectInfo> {
        let state = self.state();
        match image {
            ObjectImage::File(path) => {
                if let Some(object) = state
                    .objects
                    .iter()
                    .find(|object| object.on_disk && object.path == path)
                {
                    return Ok(object.info.clone())
                }
                if state.other.iter().any(|mapping| mapping.path.as_deref() == Some(path)) {
                    return Err(Error::with_invalid_data(format!(
                        "{} is not an ELF file",
                        path.display()
                    )))
                }
                Err(Error::with_not_found(format!("{} not found", path.display())))
            }
            ObjectImage::Memory { base } => state
                .objects
                .iter()
                .find(|object| object.base == base)
                .map(|object| {
                    // Section headers are not loaded.
                    ObjectInfo {
                        plt: Vec::new(),
                        plt_relocs: Vec::new(),
                        ..object.info.clone()
                    }
                })
                .ok_or_else(|| Error::with_invalid_data(format!("no ELF image loaded at {base:#x}"))),
        }
    }

    fn executable(&self) -> Option<PathBuf> {
        self.state().executable.clone()
    }

    fn auxv(&self) -> Result<Vec<AuxvEntry>> {
        Ok(self.state().auxv.clone())
    }

    fn image_token(&self) -> Option<u64> {
        Some(self.state().token)
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }

    fn release(&mut self, retain: bool) -> Result<()> {
        self.state().released = Some(retain);
        Ok(())
    }
}
