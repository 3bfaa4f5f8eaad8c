//! The handle to an attached target and everything that can be done
//! with it.

use std::cell::Cell;
use std::ffi::OsStr;
use std::ops::ControlFlow;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;

use crate::log::debug;
use crate::log::warn;
use crate::rtld::Agent;
use crate::rtld::SyncState;
use crate::space::AddressSpace;
use crate::space::LoadObject;
use crate::space::Mapping;
use crate::symbols::plt;
use crate::symbols::plt::PltTarget;
use crate::symbols::plt::PLT_ENTRY_SIZE;
use crate::symbols::IndexedSym;
use crate::symbols::ObjId;
use crate::symbols::ObjectSelector;
use crate::symbols::SymMask;
use crate::symbols::SymOrder;
use crate::symbols::SymTable;
use crate::symbols::SymbolEntry;
use crate::symbols::SymbolTable;
use crate::target::ObjectImage;
use crate::target::PsInfo;
use crate::target::TargetIo;
use crate::target::TargetKind;
use crate::target::WordSize;
use crate::Addr;
use crate::Config;
use crate::Error;
use crate::ErrorKind;
use crate::Hooks;
use crate::IntoError as _;
use crate::Pid;
use crate::Result;


/// Options influencing how a target is attached to and released.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AttachOpts {
    /// Leave the target stopped and otherwise untouched when the
    /// [`Process`] is released.
    pub retain: bool,
    /// Attach even if the process is already controlled by somebody
    /// else.
    pub force: bool,
    /// Never modify the target's memory.
    pub read_only: bool,
    /// Do not stop the target on attach.
    pub no_stop: bool,
    /// Read object information and symbol tables from the target's
    /// memory only, instead of from object files.
    pub in_core_symbols: bool,
    /// The struct is non-exhaustive and open to extension.
    #[doc(hidden)]
    pub _non_exhaustive: (),
}


/// The lifecycle state of a [`Process`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// The handle is being (re-)initialized.
    Attaching,
    /// The handle is attached to a target of the given kind.
    Attached(TargetKind),
    /// The handle got released and can no longer be used.
    Released,
}


/// Parse a list of light weight process IDs (`1,3-5,-7,9-`).
fn parse_lwp_list(list: &str) -> Result<Vec<RangeInclusive<u32>>> {
    let invalid = || {
        Error::with_kind(
            ErrorKind::InvalidLwpSpecification,
            format!("invalid LWP list `{list}`"),
        )
    };
    let parse = |s: &str, default| {
        if s.is_empty() {
            Ok(default)
        } else if s.bytes().all(|b| b.is_ascii_digit()) {
            s.parse::<u32>().map_err(|_err| invalid())
        } else {
            Err(invalid())
        }
    };

    list.split(',')
        .map(|item| {
            if item.is_empty() || item == "-" {
                return Err(invalid())
            }

            let (lo, hi) = match item.split_once('-') {
                Some((lo, hi)) => (parse(lo, 0)?, parse(hi, u32::MAX)?),
                None => {
                    let lwp = parse(item, 0)?;
                    (lwp, lwp)
                }
            };
            if lo > hi {
                return Err(invalid())
            }
            Ok(lo..=hi)
        })
        .collect()
}


/// What a textual target reference refers to.
#[derive(Debug, Eq, PartialEq)]
enum TargetArg<'arg> {
    Pid(u32),
    Core(&'arg Path),
}

/// Interpret a textual target reference.
fn parse_arg(arg: &str) -> Result<TargetArg<'_>> {
    let is_pid = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    let to_pid = |s: &str| {
        s.parse::<u32>().map_err(|_err| {
            Error::with_kind(ErrorKind::NoSuchProcess, format!("invalid process ID `{s}`"))
        })
    };

    if let Some(pid) = arg.strip_prefix("/proc/").filter(|pid| is_pid(pid)) {
        return Ok(TargetArg::Pid(to_pid(pid)?))
    }

    let (head, lwps) = match arg.split_once('/') {
        Some((head, lwps)) => (head, Some(lwps)),
        None => (arg, None),
    };
    if is_pid(head) {
        let pid = to_pid(head)?;
        if let Some(lwps) = lwps {
            let lwps = parse_lwp_list(lwps)?;
            debug!("ignoring LWP selection {lwps:?} for process {pid}");
        }
        return Ok(TargetArg::Pid(pid))
    }

    let path = Path::new(arg);
    if path.exists() {
        return Ok(TargetArg::Core(path))
    }

    Err(Error::with_kind(
        ErrorKind::NeitherProcessNorCore,
        format!("`{arg}` is neither a process ID nor an existing core file"),
    ))
}


/// Pick the better of two symbols found for `addr`: a containing one
/// wins over one that is not, otherwise the one starting closer to the
/// address. Ties go to `current`.
fn better<'sym>(
    current: (SymTable, &'sym IndexedSym),
    candidate: (SymTable, &'sym IndexedSym),
    addr: Addr,
) -> (SymTable, &'sym IndexedSym) {
    let rank = |sym: &IndexedSym| (sym.sym.contains(addr), sym.sym.st_value);
    if rank(candidate.1) > rank(current.1) {
        candidate
    } else {
        current
    }
}


/// A handle to an attached live process or core file.
///
/// The handle owns all state cached about the target. It is `Send`,
/// but not `Sync`; operations changing the cached state require
/// exclusive access.
///
/// Dropping the handle releases it.
#[derive(Debug)]
pub struct Process {
    io: Box<dyn TargetIo>,
    hooks: Arc<dyn Hooks>,
    opts: AttachOpts,
    config: &'static Config,
    state: State,
    space: AddressSpace,
    sync: SyncState,
    /// The image token recorded at attach time or the last exec
    /// notification.
    image_token: Option<u64>,
    /// Whether the target got stopped by us.
    stopped: bool,
    last_error: Cell<Option<ErrorKind>>,
}

impl Process {
    /// Attach to the live process identified by `pid`.
    ///
    /// Unless [`AttachOpts::no_stop`] is set, the process is stopped. The
    /// calling process can only be attached to read-only and is never
    /// stopped.
    #[cfg(linux)]
    pub fn attach(pid: Pid, opts: AttachOpts, hooks: Arc<dyn Hooks>) -> Result<Self> {
        use crate::target::procfs::OpenOpts;
        use crate::target::procfs::ProcfsTarget;

        let open_opts = OpenOpts {
            force: opts.force,
            read_only: opts.read_only,
            reap: false,
        };
        let io = ProcfsTarget::open(pid, open_opts)?;
        let may_stop = !pid.is_self();
        Self::init(Box::new(io), opts, hooks, may_stop, false)
    }

    /// Attach to the core file at `path`.
    #[cfg(linux)]
    pub fn attach_core(path: &Path, hooks: Arc<dyn Hooks>) -> Result<Self> {
        use crate::target::corefile::CoreTarget;

        // Core files refuse writes themselves, reporting them as
        // unsupported.
        let io = CoreTarget::open(path)?;
        Self::init(Box::new(io), AttachOpts::default(), hooks, false, false)
    }

    /// Attach to the executable or shared object file at `path`.
    ///
    /// The object is treated as if it were loaded at its link-time
    /// addresses, with memory reads being served from the file. Such a
    /// target is useful for symbol queries without any process being
    /// involved.
    pub fn attach_file(path: &Path, hooks: Arc<dyn Hooks>) -> Result<Self> {
        use crate::target::file::FileTarget;

        let io = FileTarget::open(path)?;
        Self::init(Box::new(io), AttachOpts::default(), hooks, false, false)
    }

    /// Attach to a target described textually.
    ///
    /// `arg` may be a decimal process ID, optionally followed by a slash
    /// and a list of light weight process IDs or ranges thereof (e.g.,
    /// `1234/1,3-5`), a `/proc/<pid>` path, or the path to a core file.
    #[cfg(linux)]
    pub fn attach_arg(arg: &str, opts: AttachOpts, hooks: Arc<dyn Hooks>) -> Result<Self> {
        match parse_arg(arg)? {
            TargetArg::Pid(pid) => {
                let pid = Pid::new(pid).ok_or_error(ErrorKind::IsSystemProcess, || {
                    "process 0 is not a controllable process"
                })?;
                Self::attach(pid, opts, hooks)
            }
            TargetArg::Core(path) => Self::attach_core(path, hooks),
        }
    }

    /// Run the program described by `argv` in a new process and attach
    /// to it.
    ///
    /// The process is stopped before it executes its first instruction.
    /// [`Hooks::post_fork_pre_exec`] is invoked in the new process
    /// before the program is executed.
    ///
    /// The process is reaped in the background once it terminates
    /// after the handle got released; its exit status is not
    /// available to the caller.
    #[cfg(linux)]
    pub fn create<S>(argv: &[S], opts: AttachOpts, hooks: Arc<dyn Hooks>) -> Result<Self>
    where
        S: AsRef<OsStr>,
    {
        use std::ptr::null_mut;

        use crate::target::procfs::spawn;
        use crate::target::procfs::OpenOpts;
        use crate::target::procfs::ProcfsTarget;

        let pid = spawn(argv, Arc::clone(&hooks))?;
        let kill = || {
            let _rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
            let _rc = unsafe { libc::waitpid(pid as libc::pid_t, null_mut(), 0) };
        };

        let open_opts = OpenOpts {
            force: opts.force,
            read_only: opts.read_only,
            reap: true,
        };
        let result = Pid::new(pid)
            .ok_or_invalid_data(|| "created process has ID 0")
            .and_then(|pid| ProcfsTarget::open(pid, open_opts))
            .and_then(|io| Self::init(Box::new(io), opts, hooks, false, true));
        if result.is_err() {
            let () = kill();
        }
        result
    }

    /// Attach to a target accessed through a custom provider.
    pub fn with_target(io: Box<dyn TargetIo>, opts: AttachOpts, hooks: Arc<dyn Hooks>) -> Result<Self> {
        Self::init(io, opts, hooks, true, false)
    }

    fn init(
        io: Box<dyn TargetIo>,
        opts: AttachOpts,
        hooks: Arc<dyn Hooks>,
        may_stop: bool,
        stopped: bool,
    ) -> Result<Self> {
        let mut slf = Self {
            io,
            hooks,
            opts,
            config: Config::current(),
            state: State::Attaching,
            space: AddressSpace::default(),
            sync: SyncState::default(),
            image_token: None,
            stopped,
            last_error: Cell::new(None),
        };

        // Only a target we moved from running to stopped is resumed on
        // release.
        if slf.io.kind() == TargetKind::Live
            && may_stop
            && !slf.opts.no_stop
            && !slf.stopped
            && !slf.io.is_stopped()?
        {
            let () = slf.io.stop()?;
            slf.stopped = true;
        }

        slf.image_token = slf.io.image_token();
        let () = slf.rebuild()?;
        slf.state = State::Attached(slf.io.kind());
        debug!("attached to {:?} target", slf.io.kind());
        Ok(slf)
    }

    /// Pass a diagnostic message to the hooks, if enabled.
    fn report<F>(&self, f: F)
    where
        F: FnOnce() -> String,
    {
        if self.config.debug() {
            let () = self.hooks.report(&f());
        }
    }

    /// Record the kind of an error returned to the user.
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            let () = self.last_error.set(Some(err.kind()));
            self.report(|| format!("{err:#}"));
        }
        result
    }

    fn check_handle(&self) -> Result<()> {
        if self.state == State::Released {
            return Err(Error::with_kind(
                ErrorKind::InvalidHandle,
                "the process handle has been released",
            ))
        }
        Ok(())
    }

    /// Make sure that the cached state can be used.
    fn check(&self) -> Result<()> {
        let () = self.check_handle()?;

        if self.io.image_token() != self.image_token {
            return Err(Error::with_kind(
                ErrorKind::StaleState,
                "the target executed a new image; exec notification required",
            ))
        }
        if !self.space.is_valid() {
            return Err(Error::with_kind(
                ErrorKind::StaleState,
                "the address space cache is invalid; refresh required",
            ))
        }
        Ok(())
    }

    fn in_core(&self) -> bool {
        self.opts.in_core_symbols || self.config.in_core_elf()
    }

    fn rebuild(&mut self) -> Result<()> {
        let () = self.space.refresh(&*self.io, self.in_core())?;

        match self.sync.link_maps(&*self.io) {
            Some(Ok(link_maps)) => {
                let () = self.space.registry_mut().assign_lmids(&link_maps);
            }
            Some(Err(err)) => {
                debug!("failed to read link maps: {err:#}");
            }
            None => (),
        }
        Ok(())
    }

    /// Re-enumerate the target's mappings and rebuild the load object
    /// registry.
    ///
    /// Symbol tables of objects remaining mapped at the same address
    /// are retained.
    pub fn refresh_maps(&mut self) -> Result<()> {
        let result = self.check_handle().and_then(|()| {
            if self.io.image_token() != self.image_token {
                return Err(Error::with_kind(
                    ErrorKind::StaleState,
                    "the target executed a new image; exec notification required",
                ))
            }
            self.rebuild()
        });
        self.track(result)
    }

    /// Notify the handle that the target executed a new image.
    ///
    /// All cached state is discarded and rebuilt for the new image.
    pub fn notify_exec(&mut self) -> Result<()> {
        let result = self.check_handle().and_then(|()| {
            self.state = State::Attaching;
            let () = self.space.reset();
            self.sync = SyncState::default();
            self.image_token = self.io.image_token();
            let () = self.rebuild()?;
            self.state = State::Attached(self.io.kind());
            Ok(())
        });
        self.track(result)
    }

    /// Visit all mappings in ascending address order, along with the
    /// load object each belongs to.
    ///
    /// If `resolved` is set, the canonical paths of load objects are
    /// resolved before they are visited.
    pub fn iterate_mappings<F>(&self, resolved: bool, mut visit: F) -> Result<()>
    where
        F: FnMut(&Mapping, Option<&LoadObject>) -> ControlFlow<()>,
    {
        let () = self.track(self.check())?;

        let registry = self.space.registry();
        for mapping in self.space.mappings() {
            let object = mapping.object.and_then(|id| registry.object(id));
            if resolved {
                if let Some(object) = object {
                    let _path = object.resolve(&*self.io);
                }
            }
            if visit(mapping, object).is_break() {
                break
            }
        }
        Ok(())
    }

    /// Visit all load objects in the order of their first mapping.
    ///
    /// If `resolved` is set, the canonical paths of load objects are
    /// resolved before they are visited.
    pub fn iterate_load_objects<F>(&self, resolved: bool, mut visit: F) -> Result<()>
    where
        F: FnMut(&LoadObject) -> ControlFlow<()>,
    {
        let () = self.track(self.check())?;

        for object in self.space.registry().objects() {
            if resolved {
                let _path = object.resolve(&*self.io);
            }
            if visit(object).is_break() {
                break
            }
        }
        Ok(())
    }

    /// Find the mapping containing `addr`.
    pub fn mapping_of(&self, addr: Addr) -> Result<Option<&Mapping>> {
        let () = self.track(self.check())?;
        Ok(self.space.mapping_of(addr))
    }

    /// Find the load object covering `addr`.
    pub fn object_of(&self, addr: Addr) -> Result<Option<&LoadObject>> {
        let () = self.track(self.check())?;
        Ok(self.space.object_of(addr))
    }

    /// Retrieve the load object with the given handle.
    pub fn object(&self, id: ObjId) -> Result<&LoadObject> {
        let result = self.check().and_then(|()| {
            self.space
                .registry()
                .object(id)
                .ok_or_not_found(|| format!("load object {id} is no longer mapped"))
        });
        self.track(result)
    }

    /// Retrieve the symbol table of an object, building it if necessary.
    fn symbol_table<'obj>(&self, object: &'obj LoadObject, table: SymTable) -> Result<&'obj SymbolTable> {
        object.symbols().table(table, || {
            let image = object.image();
            let raw = match self.io.symbols(image, table) {
                Ok(raw) => raw,
                // The dynamic symbol table is also available in memory.
                Err(err) if table == SymTable::Dynamic && matches!(image, ObjectImage::File(..)) => {
                    debug!(
                        "failed to read dynamic symbols of {}: {err:#}; trying memory image",
                        object.path().display()
                    );
                    self.io
                        .symbols(ObjectImage::Memory { base: object.base() }, table)?
                }
                Err(err) => return Err(err),
            };
            Ok(SymbolTable::new(raw, object.bias(), self.config.sort()))
        })
    }

    fn entry(object: &LoadObject, table: SymTable, sym: &IndexedSym) -> SymbolEntry {
        SymbolEntry {
            name: sym.name.clone(),
            sym: sym.sym,
            object: object.id(),
            table,
        }
    }

    /// Look up a symbol by name.
    ///
    /// Objects are searched in the order defined by `selector`. In each
    /// object the static symbol table is searched before the dynamic
    /// one, and the first match in table order wins.
    pub fn lookup_by_name(&self, selector: ObjectSelector<'_>, name: &str) -> Result<SymbolEntry> {
        self.lookup_by_name_masked(selector, name, SymMask::ALL)
    }

    /// Look up a symbol by name, considering only symbols matching
    /// `mask`.
    pub fn lookup_by_name_masked(
        &self,
        selector: ObjectSelector<'_>,
        name: &str,
        mask: SymMask,
    ) -> Result<SymbolEntry> {
        let result = self.check().and_then(|()| {
            for object in self.space.registry().select(selector)? {
                for table in [SymTable::Static, SymTable::Dynamic] {
                    let symtab = match self.symbol_table(object, table) {
                        Ok(symtab) => symtab,
                        Err(err) => {
                            self.report(|| {
                                format!(
                                    "failed to read {table:?} symbols of {}: {err:#}",
                                    object.path().display()
                                )
                            });
                            continue
                        }
                    };

                    if let Some(sym) = symtab.find_by_name(name, mask) {
                        return Ok(Self::entry(object, table, sym))
                    }
                }
            }
            Err(Error::with_not_found(format!("symbol `{name}` not found")))
        });
        self.track(result)
    }

    /// Find the function or data symbol describing `addr`.
    ///
    /// The load object covering the address is reported along with the
    /// symbol.
    pub fn lookup_by_address(&self, addr: Addr) -> Result<(&LoadObject, SymbolEntry)> {
        let result = self.check().and_then(|()| {
            let object = self
                .space
                .object_of(addr)
                .ok_or_not_found(|| format!("no load object covers address {addr:#x}"))?;

            let mut best = None;
            for table in [SymTable::Static, SymTable::Dynamic] {
                let symtab = match self.symbol_table(object, table) {
                    Ok(symtab) => symtab,
                    Err(err) => {
                        self.report(|| {
                            format!(
                                "failed to read {table:?} symbols of {}: {err:#}",
                                object.path().display()
                            )
                        });
                        continue
                    }
                };

                if let Some(sym) = symtab.find_by_addr(addr) {
                    best = Some(match best {
                        None => (table, sym),
                        Some(current) => better(current, (table, sym), addr),
                    });
                }
            }

            let (table, sym) = best.ok_or_not_found(|| {
                format!(
                    "no symbol in {} describes address {addr:#x}",
                    object.path().display()
                )
            })?;
            Ok((object, Self::entry(object, table, sym)))
        });
        self.track(result)
    }

    /// Visit the symbols of the given table of the objects selected.
    ///
    /// Only defined symbols matching `mask` are visited. Objects whose
    /// symbol table can not be read are skipped when visiting
    /// [`ObjectSelector::Every`] object and reported as error otherwise.
    pub fn iterate_symbols<F>(
        &self,
        selector: ObjectSelector<'_>,
        table: SymTable,
        mask: SymMask,
        order: SymOrder,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(&SymbolEntry) -> ControlFlow<()>,
    {
        let result = self.check().and_then(|()| {
            for object in self.space.registry().select(selector)? {
                let symtab = match self.symbol_table(object, table) {
                    Ok(symtab) => symtab,
                    Err(err) if selector == ObjectSelector::Every => {
                        self.report(|| {
                            format!(
                                "skipping {table:?} symbols of {}: {err:#}",
                                object.path().display()
                            )
                        });
                        continue
                    }
                    Err(err) => return Err(err),
                };

                for sym in symtab.iter(order) {
                    if !mask.matches(&sym.sym) {
                        continue
                    }
                    if visit(&Self::entry(object, table, sym)).is_break() {
                        return Ok(())
                    }
                }
            }
            Ok(())
        });
        self.track(result)
    }

    /// Determine the name of the function the procedure linkage table
    /// entry at `addr` ultimately calls.
    ///
    /// `None` is reported if the address is not part of a known
    /// procedure linkage table or the entry could not be decoded.
    pub fn pltdest(&self, addr: Addr) -> Result<Option<Box<str>>> {
        let result = self.check().and_then(|()| {
            let object = if let Some(object) = self.space.object_of(addr) {
                object
            } else {
                return Ok(None)
            };

            let info = object.info();
            let bias = object.bias();
            let link_addr = addr.wrapping_sub(bias);
            let plt = if let Some(plt) = info.plt.iter().find(|plt| plt.contains(&link_addr)) {
                plt
            } else {
                return Ok(None)
            };

            let entry = plt.start + (link_addr - plt.start) / PLT_ENTRY_SIZE * PLT_ENTRY_SIZE;
            let entry = entry.wrapping_add(bias);
            let mut code = [0; PLT_ENTRY_SIZE as usize];
            let () = self.io.read_memory(entry, &mut code)?;

            let name = match plt::decode(info.machine, entry, &code) {
                Some(PltTarget::Got(got)) => {
                    let got = got.wrapping_sub(bias);
                    info.plt_relocs.iter().find(|reloc| reloc.got == got)
                }
                Some(PltTarget::RelocIndex(idx)) => info.plt_relocs.get(idx as usize),
                None => None,
            };
            Ok(name
                .filter(|reloc| !reloc.name.is_empty())
                .map(|reloc| reloc.name.clone()))
        });
        self.track(result)
    }

    /// Retrieve a view of the dynamic linker's debug interface.
    ///
    /// The interface is located through the executable's dynamic
    /// section the first time an agent is requested.
    pub fn rtld_agent(&self) -> Result<Agent<'_>> {
        let result = self.check().and_then(|()| {
            let exe = self
                .space
                .registry()
                .executable()
                .ok_or_not_found(|| "target has no executable mapped")?;
            let r_debug = self.sync.r_debug(&*self.io, exe)?;
            Ok(Agent::new(self, r_debug))
        });
        self.track(result)
    }

    /// Process the dynamic linker reporting that its link maps are
    /// consistent again.
    ///
    /// The address space cache is refreshed, which drops the symbol
    /// tables of objects that got unloaded.
    pub fn on_consistent_event(&mut self) -> Result<()> {
        let result = self.check().and_then(|()| {
            let () = self.sync.consistent(&*self.io)?;
            self.rebuild()
        });
        self.track(result)
    }

    /// Forget everything known about the dynamic linker's state.
    pub fn invalidate_sync(&mut self) {
        self.sync = SyncState::default();
    }

    /// Read target memory at `addr` into `buf`.
    pub fn read_memory(&self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        let result = self
            .check_handle()
            .and_then(|()| self.io.read_memory(addr, buf));
        self.track(result)
    }

    /// Write `data` into target memory at `addr`.
    pub fn write_memory(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        let result = self.check_handle().and_then(|()| {
            if self.opts.read_only {
                return Err(Error::with_kind(
                    ErrorKind::PermissionDenied,
                    "the target was attached read-only",
                ))
            }
            self.io.write_memory(addr, data)
        });
        self.track(result)
    }

    /// Release the handle.
    ///
    /// A target stopped on attach is resumed, unless
    /// [`AttachOpts::retain`] is set. Releasing an already released
    /// handle has no effect.
    pub fn release(&mut self) -> Result<()> {
        if self.state == State::Released {
            return Ok(())
        }
        self.state = State::Released;

        let resume = if self.stopped && !self.opts.retain {
            self.io.resume()
        } else {
            Ok(())
        };
        self.stopped = false;
        let release = self.io.release(self.opts.retain);
        let () = self.space.reset();
        self.sync = SyncState::default();

        let result = resume.and(release);
        self.track(result)
    }

    /// The kind of target attached to.
    #[inline]
    pub fn kind(&self) -> TargetKind {
        self.io.kind()
    }

    /// The word size of the target.
    #[inline]
    pub fn word_size(&self) -> WordSize {
        self.io.word_size()
    }

    /// The handle's lifecycle state.
    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    /// The options the target was attached with.
    #[inline]
    pub fn opts(&self) -> &AttachOpts {
        &self.opts
    }

    /// The hooks in use.
    #[inline]
    pub fn hooks(&self) -> &Arc<dyn Hooks> {
        &self.hooks
    }

    /// The kind of the last error reported by an operation on the
    /// handle, if any.
    #[inline]
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error.get()
    }

    /// Descriptive information about the target's process, if
    /// available.
    pub fn psinfo(&self) -> Option<PsInfo> {
        self.io.psinfo()
    }

    #[inline]
    pub(crate) fn io(&self) -> &dyn TargetIo {
        &*self.io
    }

    #[inline]
    pub(crate) fn sync(&self) -> &SyncState {
        &self.sync
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!("failed to release process handle: {err:#}");
        }
    }
}
