//! Access to live processes via the `/proc` file system.

use std::collections::hash_map::DefaultHasher;
use std::ffi::OsStr;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::hash::Hash as _;
use std::hash::Hasher as _;
use std::io;
use std::io::Read as _;
use std::os::unix::fs::FileExt as _;
use std::os::unix::process::CommandExt as _;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::ptr;
use std::sync::Arc;
use std::thread;
use std::thread::sleep;
use std::time::Duration;

use libc::c_int;
use libc::c_void;
use libc::kill;
use libc::pid_t;
use libc::ptrace;
use libc::waitpid;
use libc::PTRACE_DETACH;
use libc::PTRACE_TRACEME;
use libc::SIGCONT;
use libc::SIGSTOP;
use libc::SIGTRAP;
use libc::WIFSTOPPED;
use libc::WSTOPSIG;

use crate::elf::elf_class;
use crate::elf::types::ELFCLASS32;
use crate::elf::types::ELFCLASS64;
use crate::log::debug;
use crate::log::trace;
use crate::maps;
use crate::symbols::SymTable;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::ErrorKind;
use crate::Hooks;
use crate::IntoError as _;
use crate::Pid;
use crate::Result;

use super::AuxvEntry;
use super::ObjectImage;
use super::ObjectInfo;
use super::ObjectReader;
use super::PsInfo;
use super::RawMapping;
use super::RawSym;
use super::TargetIo;
use super::TargetKind;
use super::WordSize;


/// The kernel's flag marking kernel threads, as reported in the ninth
/// field of `/proc/<pid>/stat`.
const PF_KTHREAD: u64 = 0x00200000;
/// The maximum length of a reported executable name.
const FNAME_LEN: usize = 16;
/// The maximum length of a reported argument list.
const PSARGS_LEN: usize = 80;
/// The interval at which we poll a process for having stopped.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(1);


/// Map a system error onto our error kinds.
fn os_error(err: io::Error) -> Error {
    let kind = match err.raw_os_error() {
        Some(libc::EACCES | libc::EPERM) => ErrorKind::PermissionDenied,
        Some(libc::EMFILE | libc::ENFILE) => ErrorKind::OutOfFileDescriptors,
        Some(libc::EINTR) => ErrorKind::Interrupted,
        Some(libc::ENOENT | libc::ESRCH) => ErrorKind::NoSuchProcess,
        _ => ErrorKind::Unspecified,
    };
    Error::with_os_error(kind, err)
}


/// The subset of `/proc/<pid>/stat` that we care about.
#[derive(Debug)]
struct Stat {
    /// The single character process state.
    state: char,
    /// The kernel's per-process flags.
    flags: u64,
}

impl Stat {
    fn parse(line: &str) -> Option<Stat> {
        // The command name may contain anything, including parentheses
        // and spaces, so we have to anchor on the last closing one.
        let (_pid_comm, rest) = line.rsplit_once(')')?;
        let mut fields = rest.split_ascii_whitespace();
        let state = fields.next()?.chars().next()?;
        let flags = fields.nth(5)?.parse().ok()?;
        Some(Stat { state, flags })
    }

    fn read(pid: u32) -> Result<Stat> {
        let path = format!("/proc/{pid}/stat");
        let line = fs::read_to_string(&path)
            .map_err(os_error)
            .with_context(|| format!("failed to read {path}"))?;
        Self::parse(&line).ok_or_invalid_data(|| format!("failed to parse {path}"))
    }

    #[inline]
    fn is_stopped(&self) -> bool {
        matches!(self.state, 'T' | 't')
    }

    #[inline]
    fn is_dead(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }
}


/// Retrieve the process ID of the tracer of a process, if any.
fn tracer_pid(pid: u32) -> Result<Option<u32>> {
    let path = format!("/proc/{pid}/status");
    let status = fs::read_to_string(&path)
        .map_err(os_error)
        .with_context(|| format!("failed to read {path}"))?;

    let tracer = status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse::<u32>().ok())
        .ok_or_invalid_data(|| format!("{path} does not report a tracer"))?;
    Ok((tracer != 0).then_some(tracer))
}


/// Determine the word size of the executable at `path`.
fn exe_word_size(path: &Path) -> Result<WordSize> {
    let mut ident = [0u8; 5];
    let mut file = File::open(path)
        .map_err(os_error)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let () = file
        .read_exact(&mut ident)
        .map_err(Error::from)
        .with_context(|| format!("failed to read ELF identification of {}", path.display()))?;

    match elf_class(&ident) {
        Some(ELFCLASS32) => Ok(WordSize::Bits32),
        Some(ELFCLASS64) if cfg!(target_pointer_width = "32") => Err(Error::with_kind(
            ErrorKind::WordSizeMismatch,
            format!("{} is a 64 bit program", path.display()),
        )),
        Some(ELFCLASS64) => Ok(WordSize::Bits64),
        _ => Err(Error::with_invalid_data(format!(
            "{} is not a valid ELF file",
            path.display()
        ))),
    }
}


/// Send `signal` to process `pid`.
fn signal(pid: u32, signal: c_int) -> Result<()> {
    let rc = unsafe { kill(pid as pid_t, signal) };
    if rc != 0 {
        return Err(os_error(io::Error::last_os_error()))
    }
    Ok(())
}


/// Truncate `s` to at most `len` bytes, respecting character
/// boundaries.
fn truncate(mut s: String, len: usize) -> String {
    if s.len() > len {
        let mut end = len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let () = s.truncate(end);
    }
    s
}


/// Options for opening a [`ProcfsTarget`].
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct OpenOpts {
    /// Open the process even if somebody else is tracing it.
    pub force: bool,
    /// Only ever read from the process.
    pub read_only: bool,
    /// The process is a child of ours and is to be reaped once it
    /// terminates after being released.
    pub reap: bool,
}


/// A live process, accessed via `/proc`.
#[derive(Debug)]
pub(crate) struct ProcfsTarget {
    pid: u32,
    /// The process's memory.
    mem: File,
    read_only: bool,
    word_size: WordSize,
    /// The executable path as determined when opening the process.
    exe: PathBuf,
    reader: ObjectReader,
    /// Whether the process still needs to be reaped by us.
    reap: bool,
}

impl ProcfsTarget {
    /// Open the process identified by `pid`.
    pub(crate) fn open(pid: Pid, opts: OpenOpts) -> Result<Self> {
        let OpenOpts {
            force,
            read_only,
            reap,
        } = opts;

        if pid.is_self() && !read_only {
            return Err(Error::with_kind(
                ErrorKind::IsSelf,
                "the calling process can only be opened read-only",
            ))
        }

        let pid = pid.resolve();
        let stat = Stat::read(pid)?;
        if stat.is_dead() {
            return Err(Error::with_kind(
                ErrorKind::ZombieProcess,
                format!("process {pid} is a zombie"),
            ))
        }
        if stat.flags & PF_KTHREAD != 0 {
            return Err(Error::with_kind(
                ErrorKind::IsSystemProcess,
                format!("process {pid} is a kernel thread"),
            ))
        }

        if !force {
            if let Some(tracer) = tracer_pid(pid)? {
                return Err(Error::with_kind(
                    ErrorKind::AlreadyControlled,
                    format!("process {pid} is already controlled by process {tracer}"),
                ))
            }
        }

        let exe_link = format!("/proc/{pid}/exe");
        let exe = fs::read_link(&exe_link).map_err(|err| match err.raw_os_error() {
            Some(libc::ENOENT) => Error::with_os_error(ErrorKind::ExecutableNotFound, err)
                .context(format!("failed to resolve {exe_link}")),
            _ => os_error(err).context(format!("failed to resolve {exe_link}")),
        })?;
        let word_size = exe_word_size(Path::new(&exe_link))?;

        let path = format!("/proc/{pid}/mem");
        let mem = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(os_error)
            .with_context(|| format!("failed to open {path}"))?;

        debug!("opened process {pid} running {}", exe.display());
        let slf = Self {
            pid,
            mem,
            read_only,
            word_size,
            exe,
            reader: ObjectReader::default(),
            reap,
        };
        Ok(slf)
    }

    /// Read the raw auxiliary vector.
    fn raw_auxv(&self) -> Result<Vec<u8>> {
        let path = format!("/proc/{}/auxv", self.pid);
        fs::read(&path)
            .map_err(os_error)
            .with_context(|| format!("failed to read {path}"))
    }

    fn stat(&self) -> Result<Stat> {
        Stat::read(self.pid)
    }
}

impl TargetIo for ProcfsTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Live
    }

    fn word_size(&self) -> WordSize {
        self.word_size
    }

    fn enumerate_mappings(&self) -> Result<Vec<RawMapping>> {
        let pid = Pid::new(self.pid).ok_or_invalid_input(|| "invalid process ID 0")?;
        maps::parse(pid)?
            .map(|entry| entry.map(RawMapping::from))
            .collect()
    }

    fn read_memory(&self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        self.mem
            .read_exact_at(buf, addr)
            .map_err(Error::from)
            .with_context(|| {
                format!(
                    "failed to read {} bytes at {addr:#x} from process {}",
                    buf.len(),
                    self.pid
                )
            })
    }

    fn write_memory(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::with_kind(
                ErrorKind::PermissionDenied,
                format!("process {} was opened read-only", self.pid),
            ))
        }

        self.mem
            .write_all_at(data, addr)
            .map_err(Error::from)
            .with_context(|| {
                format!(
                    "failed to write {} bytes at {addr:#x} to process {}",
                    data.len(),
                    self.pid
                )
            })
    }

    fn stop(&mut self) -> Result<()> {
        if self.stat()?.is_stopped() {
            return Ok(())
        }

        let () = signal(self.pid, SIGSTOP)?;
        loop {
            let stat = self.stat()?;
            if stat.is_stopped() {
                break
            }
            if stat.is_dead() {
                return Err(Error::with_kind(
                    ErrorKind::ZombieProcess,
                    format!("process {} died while stopping it", self.pid),
                ))
            }
            let () = sleep(STOP_POLL_INTERVAL);
        }
        trace!("stopped process {}", self.pid);
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let () = signal(self.pid, SIGCONT)?;
        trace!("resumed process {}", self.pid);
        Ok(())
    }

    fn is_stopped(&self) -> Result<bool> {
        Ok(self.stat()?.is_stopped())
    }

    fn symbols(&self, image: ObjectImage<'_>, table: SymTable) -> Result<Vec<RawSym>> {
        self.reader
            .symbols(image, table, |addr, buf| self.read_memory(addr, buf))
    }

    fn object_info(&self, image: ObjectImage<'_>) -> Result<ObjectInfo> {
        self.reader
            .object_info(image, |addr, buf| self.read_memory(addr, buf))
    }

    fn executable(&self) -> Option<PathBuf> {
        // The process may have executed a new image since we opened it.
        fs::read_link(format!("/proc/{}/exe", self.pid))
            .ok()
            .or_else(|| Some(self.exe.clone()))
    }

    fn auxv(&self) -> Result<Vec<AuxvEntry>> {
        let data = self.raw_auxv()?;
        Ok(AuxvEntry::parse(&data, self.word_size))
    }

    fn image_token(&self) -> Option<u64> {
        // The auxiliary vector is set up anew by every `exec`; it
        // contains, among others, the entry point and the address of the
        // random bytes on the new stack.
        let data = self.raw_auxv().ok()?;
        let mut hasher = DefaultHasher::new();
        let () = data.hash(&mut hasher);
        Some(hasher.finish())
    }

    fn psinfo(&self) -> Option<PsInfo> {
        let comm = fs::read_to_string(format!("/proc/{}/comm", self.pid)).ok()?;
        let cmdline = fs::read(format!("/proc/{}/cmdline", self.pid)).ok()?;
        let args = cmdline
            .split(|b| *b == b'\0')
            .filter(|arg| !arg.is_empty())
            .map(String::from_utf8_lossy)
            .collect::<Vec<_>>()
            .join(" ");

        let psinfo = PsInfo {
            pid: self.pid,
            fname: truncate(comm.trim_end().to_string(), FNAME_LEN),
            psargs: truncate(args, PSARGS_LEN),
            _non_exhaustive: (),
        };
        Some(psinfo)
    }

    fn release(&mut self, _retain: bool) -> Result<()> {
        if !self.reap {
            return Ok(())
        }

        // Nobody else can collect the exit status of a child we
        // created, so wait for it in the background.
        let pid = self.pid;
        let _handle = thread::Builder::new()
            .name(format!("procctl-reap-{pid}"))
            .spawn(move || {
                let mut status = 0;
                let rc = unsafe { waitpid(pid as pid_t, &mut status, 0) };
                if rc == pid as pid_t {
                    trace!("reaped process {pid} (status {status:#x})");
                }
            })
            .map_err(os_error)
            .with_context(|| format!("failed to reap process {pid}"))?;
        self.reap = false;
        Ok(())
    }
}


/// Create a new process running `argv`, returning its process ID.
///
/// The process is stopped on return, before it executed its first
/// instruction.
pub(crate) fn spawn<S>(argv: &[S], hooks: Arc<dyn Hooks>) -> Result<u32>
where
    S: AsRef<OsStr>,
{
    let (program, args) = argv
        .split_first()
        .ok_or_invalid_input(|| "no program to run provided")?;
    let program = program.as_ref();

    let mut command = Command::new(program);
    let _command = command.args(args);
    // SAFETY: `ptrace` is async-signal-safe and the hook is documented to
    //         only use async-signal-safe functionality.
    let _command = unsafe {
        command.pre_exec(move || {
            let () = hooks.post_fork_pre_exec();
            let rc = ptrace(
                PTRACE_TRACEME,
                0,
                ptr::null_mut::<c_void>(),
                ptr::null_mut::<c_void>(),
            );
            if rc == -1 {
                return Err(io::Error::last_os_error())
            }
            Ok(())
        })
    };

    let child = command.spawn().map_err(|err| {
        let context = format!("failed to run {}", program.to_string_lossy());
        match err.kind() {
            io::ErrorKind::NotFound => {
                Error::with_os_error(ErrorKind::ExecutableNotFound, err).context(context)
            }
            _ => os_error(err).context(context),
        }
    })?;
    let pid = child.id();

    // The child stops with `SIGTRAP` once it successfully executed the
    // program.
    let mut status = 0;
    let rc = unsafe { waitpid(pid as pid_t, &mut status, 0) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        let _rc = unsafe { kill(pid as pid_t, libc::SIGKILL) };
        return Err(os_error(err).context(format!("failed to wait for process {pid}")))
    }
    if !WIFSTOPPED(status) || WSTOPSIG(status) != SIGTRAP {
        if WIFSTOPPED(status) {
            let _rc = unsafe { kill(pid as pid_t, libc::SIGKILL) };
            let _rc = unsafe { waitpid(pid as pid_t, &mut status, 0) };
        }
        return Err(Error::with_kind(
            ErrorKind::Unspecified,
            format!("process {pid} terminated unexpectedly (status {status:#x})"),
        ))
    }

    // Hand the child back, but have it stopped by the time we return.
    let rc = unsafe {
        ptrace(
            PTRACE_DETACH,
            pid as pid_t,
            ptr::null_mut::<c_void>(),
            SIGSTOP as usize as *mut c_void,
        )
    };
    if rc == -1 {
        let err = io::Error::last_os_error();
        let _rc = unsafe { kill(pid as pid_t, libc::SIGKILL) };
        return Err(os_error(err).context(format!("failed to detach from process {pid}")))
    }

    while !Stat::read(pid)?.is_stopped() {
        let () = sleep(STOP_POLL_INTERVAL);
    }
    debug!("created process {pid} running {}", program.to_string_lossy());
    Ok(pid)
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::env::current_exe;

    use test_log::test;

    use crate::DefaultHooks;


    /// Check that we can parse the interesting bits of a `stat` line.
    #[test]
    fn stat_parsing() {
        let line = "1234 (a) (b) c) S 1 1234 1234 0 -1 4194560 110 0 0 0 0 0 0 0 20 0 1 0";
        let stat = Stat::parse(line).unwrap();
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.flags, 4194560);
        assert!(!stat.is_stopped());
        assert!(!stat.is_dead());

        let line = "2 (kthreadd) S 0 0 0 0 -1 2129984 0 0 0 0 0 0 0 0 20 0 1 0";
        let stat = Stat::parse(line).unwrap();
        assert_ne!(stat.flags & PF_KTHREAD, 0);

        assert!(Stat::parse("1234 (sh").is_none());
        assert!(Stat::parse("1234 (sh) T").is_none());
    }

    /// Check that strings are truncated at character boundaries.
    #[test]
    fn string_truncation() {
        assert_eq!(truncate("hello".to_string(), 16), "hello");
        assert_eq!(truncate("hello".to_string(), 3), "hel");
        assert_eq!(truncate("hé".to_string(), 2), "h");
    }

    /// Make sure that the calling process can only be opened read-only.
    #[test]
    fn open_self() {
        let opts = OpenOpts {
            read_only: false,
            ..Default::default()
        };
        let err = ProcfsTarget::open(Pid::Slf, opts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IsSelf);

        let opts = OpenOpts {
            read_only: true,
            ..Default::default()
        };
        let mut target = ProcfsTarget::open(Pid::Slf, opts).unwrap();
        assert_ne!(format!("{target:?}"), "");
        assert_eq!(target.kind(), TargetKind::Live);
        assert!(!target.is_stopped().unwrap());
        assert_eq!(
            target.executable().unwrap().canonicalize().unwrap(),
            current_exe().unwrap().canonicalize().unwrap()
        );

        let err = target.write_memory(0x1000, &[0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let value = 0xdeadbeef_u64;
        let mut buf = [0u8; 8];
        let () = target
            .read_memory(&value as *const u64 as Addr, &mut buf)
            .unwrap();
        assert_eq!(u64::from_ne_bytes(buf), value);

        let auxv = target.auxv().unwrap();
        assert!(!auxv.is_empty());
        assert_eq!(target.image_token(), target.image_token());
        assert!(target.image_token().is_some());

        let PsInfo { pid, .. } = target.psinfo().unwrap();
        assert_eq!(pid, Pid::Slf.resolve());

        let mappings = target.enumerate_mappings().unwrap();
        assert!(!mappings.is_empty());
    }

    /// Check that we report a proper error for a process that does not
    /// exist.
    #[test]
    fn open_non_existent() {
        // Larger than the maximum process ID the kernel supports.
        let pid = Pid::new(u32::MAX - 1).unwrap();
        let err = ProcfsTarget::open(pid, OpenOpts::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchProcess);
    }

    /// Check that kernel threads are refused.
    #[test]
    fn open_kernel_thread() {
        // `kthreadd` conventionally has process ID 2, but it is not
        // visible in every PID namespace.
        let pid = Pid::new(2).unwrap();
        match Stat::read(2) {
            Ok(stat) if stat.flags & PF_KTHREAD != 0 => {
                let err = ProcfsTarget::open(pid, OpenOpts::default()).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::IsSystemProcess);
            }
            _ => (),
        }
    }

    /// Make sure that spawning a non-existent program is reported as
    /// such.
    #[test]
    fn spawn_missing() {
        let err = spawn(&["/does/not/exist"], Arc::new(DefaultHooks)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutableNotFound);

        let err = spawn::<&str>(&[], Arc::new(DefaultHooks)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
