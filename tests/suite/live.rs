use std::env::current_exe;
use std::fs::canonicalize;
use std::fs::read_to_string;
use std::ops::ControlFlow;
use std::process::Command;
use std::ptr;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use std::time::Instant;

use procctl::Addr;
use procctl::AttachOpts;
use procctl::DefaultHooks;
use procctl::ErrorKind;
use procctl::Hooks;
use procctl::ObjectSelector;
use procctl::Pid;
use procctl::Process;
use procctl::State;
use procctl::SymMask;
use procctl::SymOrder;
use procctl::SymTable;
use procctl::TargetKind;

use libc::kill;
use libc::waitpid;
use libc::SIGKILL;
use libc::SIGSTOP;

use scopeguard::defer;

use test_log::test;


/// Retrieve the state of process `pid`, as reported in
/// `/proc/<pid>/stat`, if it still exists.
fn process_state(pid: u32) -> Option<char> {
    let stat = read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}

/// Wait for `pred` to hold for the state of process `pid`, giving up
/// after a few seconds.
fn wait_for_state<F>(pid: u32, pred: F) -> bool
where
    F: Fn(Option<char>) -> bool,
{
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if pred(process_state(pid)) {
            return true
        }
        let () = sleep(Duration::from_millis(10));
    }
    false
}


fn attach_self() -> Process {
    let opts = AttachOpts {
        read_only: true,
        ..Default::default()
    };
    Process::attach(Pid::Slf, opts, Arc::new(DefaultHooks)).unwrap()
}


/// Check that we can attach to ourselves and find our own executable.
#[test]
fn attach_self_read_only() {
    let process = attach_self();
    assert_eq!(process.kind(), TargetKind::Live);
    assert_eq!(process.state(), State::Attached(TargetKind::Live));

    let exe = canonicalize(current_exe().unwrap()).unwrap();
    let mut found = false;
    let () = process
        .iterate_load_objects(true, |object| {
            if object.canonical_path() == Some(exe.as_path()) {
                found = true;
                return ControlFlow::Break(())
            }
            ControlFlow::Continue(())
        })
        .unwrap();
    assert!(found);

    let value = 0xdeadbeef_u64;
    let mut buf = [0; 8];
    let () = process
        .read_memory(&value as *const u64 as Addr, &mut buf)
        .unwrap();
    assert_eq!(u64::from_ne_bytes(buf), value);
}


/// Check that attaching to ourselves for modification is refused.
#[test]
fn attach_self_writable() {
    let err = Process::attach(Pid::Slf, AttachOpts::default(), Arc::new(DefaultHooks)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IsSelf);
}


/// Check that we can look up a symbol of a shared object and map its
/// address back to it.
#[test]
fn symbol_round_trip() {
    let process = attach_self();
    let sym = process
        .lookup_by_name_masked(ObjectSelector::Every, "malloc", SymMask::GLOBAL | SymMask::FUNC)
        .unwrap();
    assert_ne!(sym.addr(), 0);

    let (object, found) = process.lookup_by_address(sym.addr()).unwrap();
    assert_eq!(object.id(), sym.object);
    assert_eq!(found.addr(), sym.addr());
}


/// Check that the dynamic linker's link maps describe our objects.
#[test]
fn link_maps() {
    let process = attach_self();
    let agent = process.rtld_agent().unwrap();
    let link_maps = agent.link_maps().unwrap();
    assert!(link_maps.len() > 1);
    // The executable comes first and carries no name.
    assert!(link_maps[0].name.as_os_str().is_empty());
}


/// Check that attaching to a process that does not exist fails as
/// expected.
#[test]
fn attach_nonexistent() {
    let pid = Pid::new(u32::MAX).unwrap();
    let err = Process::attach(pid, AttachOpts::default(), Arc::new(DefaultHooks)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuchProcess);
}


/// Check that malformed textual references are reported properly.
#[test]
fn attach_arg_errors() {
    let hooks = Arc::new(DefaultHooks) as Arc<dyn Hooks>;
    let err = Process::attach_arg("0", AttachOpts::default(), Arc::clone(&hooks)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IsSystemProcess);

    let err = Process::attach_arg("1/1-x", AttachOpts::default(), Arc::clone(&hooks)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidLwpSpecification);

    let err = Process::attach_arg("/no/such/core", AttachOpts::default(), hooks).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NeitherProcessNorCore);
}


/// Check that we can run a program and attach to it before it executes.
#[test]
fn create_process() {
    let mut process = Process::create(
        &["sleep", "10"],
        AttachOpts::default(),
        Arc::new(DefaultHooks),
    )
    .unwrap();
    let psinfo = process.psinfo().unwrap();
    let pid = psinfo.pid;
    defer!({
        let _rc = unsafe { kill(pid as _, SIGKILL) };
    });
    assert_eq!(psinfo.fname, "sleep");
    assert_eq!(process.state(), State::Attached(TargetKind::Live));

    // Only the executable and the dynamic linker are mapped at this
    // point.
    let mut count = 0;
    let () = process
        .iterate_symbols(
            ObjectSelector::DynamicLinker,
            SymTable::Dynamic,
            SymMask::ALL,
            SymOrder::ByName,
            |_sym| {
                count += 1;
                ControlFlow::Continue(())
            },
        )
        .unwrap();
    assert!(count > 0);

    let () = process.release().unwrap();
    assert_eq!(process.state(), State::Released);

    // Once terminated, the process gets reaped without our help.
    let _rc = unsafe { kill(pid as _, SIGKILL) };
    assert!(wait_for_state(pid, |state| state.is_none()));
}


/// Check that a process stopped by somebody else stays stopped when
/// we release it.
#[test]
fn attach_stopped() {
    let child = Command::new("sleep").arg("100").spawn().unwrap();
    let pid = child.id();
    defer!({
        let _rc = unsafe { kill(pid as _, SIGKILL) };
        let _rc = unsafe { waitpid(pid as _, ptr::null_mut(), 0) };
    });

    let _rc = unsafe { kill(pid as _, SIGSTOP) };
    assert!(wait_for_state(pid, |state| state == Some('T')));

    let pid = Pid::new(pid).unwrap();
    let mut process = Process::attach(pid, AttachOpts::default(), Arc::new(DefaultHooks)).unwrap();
    let () = process.release().unwrap();
    assert_eq!(process_state(child.id()), Some('T'));
}


/// Check that running a program that does not exist fails as expected.
#[test]
fn create_nonexistent() {
    let err = Process::create(
        &["/no/such/program"],
        AttachOpts::default(),
        Arc::new(DefaultHooks),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutableNotFound);
}
