use std::env::current_exe;
use std::fs::write;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

use procctl::DefaultHooks;
use procctl::ErrorKind;
use procctl::ObjectSelector;
use procctl::Process;
use procctl::State;
use procctl::SymMask;
use procctl::SymOrder;
use procctl::SymTable;
use procctl::TargetKind;

use tempfile::NamedTempFile;

use test_log::test;


/// Check that we can work with our own executable file as a target.
#[test]
fn attach_own_executable() {
    let exe = current_exe().unwrap();
    let mut process = Process::attach_file(&exe, Arc::new(DefaultHooks)).unwrap();
    assert_eq!(process.kind(), TargetKind::File);
    assert_eq!(process.state(), State::Attached(TargetKind::File));

    let mut objects = Vec::new();
    let () = process
        .iterate_load_objects(false, |object| {
            let () = objects.push((object.path().to_path_buf(), object.base(), object.bias()));
            ControlFlow::Continue(())
        })
        .unwrap();
    assert_eq!(objects.len(), 1);
    let (path, base, bias) = objects.remove(0);
    assert_eq!(path, exe);
    assert_eq!(bias, 0);

    let mut buf = [0; 4];
    let () = process.read_memory(base, &mut buf).unwrap();
    assert_eq!(&buf, b"\x7fELF");
    let err = process.write_memory(base, &[0]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    let sym = process.lookup_by_name(ObjectSelector::Executable, "main").unwrap();
    let (object, found) = process.lookup_by_address(sym.addr()).unwrap();
    assert_eq!(object.id(), sym.object);
    assert_eq!(&*found.name, "main");

    let mut funcs = 0;
    let () = process
        .iterate_symbols(
            ObjectSelector::Every,
            SymTable::Static,
            SymMask::ANY_BINDING | SymMask::FUNC,
            SymOrder::ByAddress,
            |_sym| {
                funcs += 1;
                ControlFlow::Continue(())
            },
        )
        .unwrap();
    assert!(funcs > 0);

    let psinfo = process.psinfo().unwrap();
    assert_eq!(psinfo.pid, 0);
    assert!(exe
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with(&psinfo.fname));

    let () = process.release().unwrap();
    assert_eq!(process.state(), State::Released);
}


/// Check that files we can not treat as objects are rejected.
#[test]
fn attach_invalid_file() {
    let err = Process::attach_file(Path::new("/no/such/file"), Arc::new(DefaultHooks)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutableNotFound);

    let text = NamedTempFile::new().unwrap();
    let () = write(text.path(), b"certainly not an ELF file").unwrap();
    let err = Process::attach_file(text.path(), Arc::new(DefaultHooks)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidData);
}
