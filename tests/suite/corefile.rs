use std::env::current_exe;
use std::fs::write;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

use procctl::AttachOpts;
use procctl::DefaultHooks;
use procctl::ErrorKind;
use procctl::ObjectSelector;
use procctl::Process;
use procctl::TargetKind;

use tempfile::NamedTempFile;

use test_log::test;


const ET_EXEC: u16 = 2;
const ET_CORE: u16 = 4;
const PT_LOAD: u32 = 1;
const PT_NOTE: u32 = 4;
const PF_R: u32 = 4;
const PF_W: u32 = 2;
const PF_X: u32 = 1;
const NT_PRSTATUS: u32 = 1;
const NT_PRPSINFO: u32 = 3;
const NT_AUXV: u32 = 6;
const NT_FILE: u32 = 0x46494c45;
const AT_ENTRY: u64 = 9;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const NOTES_OFFSET: usize = 0x100;
const DATA_OFFSET: usize = 0x1000;

/// The address the executable's first page is mapped at.
const EXE_ADDR: u64 = 0x400000;
/// The address of an anonymous page whose contents are dumped.
const ANON_ADDR: u64 = 0x10000;
const PAGE_SIZE: u64 = 0x1000;


fn machine() -> u16 {
    if cfg!(target_arch = "aarch64") {
        183
    } else {
        62
    }
}


/// A builder for minimal ELF core files.
#[derive(Debug)]
struct CoreBuilder {
    e_type: u16,
    prstatus: bool,
    exe: Vec<u8>,
}

impl CoreBuilder {
    fn new(exe: &Path) -> Self {
        Self {
            e_type: ET_CORE,
            prstatus: true,
            exe: exe.as_os_str().as_encoded_bytes().to_vec(),
        }
    }

    fn note(buf: &mut Vec<u8>, n_type: u32, desc: &[u8]) {
        let name = b"CORE\0";
        let () = buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
        let () = buf.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        let () = buf.extend_from_slice(&n_type.to_le_bytes());
        let () = buf.extend_from_slice(name);
        let () = buf.resize(buf.len().next_multiple_of(4), 0);
        let () = buf.extend_from_slice(desc);
        let () = buf.resize(buf.len().next_multiple_of(4), 0);
    }

    fn words(words: &[u64]) -> Vec<u8> {
        words.iter().flat_map(|word| word.to_le_bytes()).collect()
    }

    fn notes(&self) -> Vec<u8> {
        let mut notes = Vec::new();
        if self.prstatus {
            let () = Self::note(&mut notes, NT_PRSTATUS, &[0; 336]);
        }

        let mut psinfo = vec![0; 136];
        let () = psinfo[24..28].copy_from_slice(&4242u32.to_ne_bytes());
        let () = psinfo[40..44].copy_from_slice(b"test");
        let () = psinfo[56..68].copy_from_slice(b"test --flag\0");
        let () = Self::note(&mut notes, NT_PRPSINFO, &psinfo);

        let auxv = Self::words(&[AT_ENTRY, EXE_ADDR + 0x10, 0, 0]);
        let () = Self::note(&mut notes, NT_AUXV, &auxv);

        let mut files = Self::words(&[1, PAGE_SIZE, EXE_ADDR, EXE_ADDR + PAGE_SIZE, 0]);
        let () = files.extend_from_slice(&self.exe);
        let () = files.push(b'\0');
        let () = Self::note(&mut notes, NT_FILE, &files);
        notes
    }

    fn phdr(buf: &mut Vec<u8>, p_type: u32, p_flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64) {
        let () = buf.extend_from_slice(&p_type.to_le_bytes());
        let () = buf.extend_from_slice(&p_flags.to_le_bytes());
        for word in [offset, vaddr, 0, filesz, memsz, 0] {
            let () = buf.extend_from_slice(&word.to_le_bytes());
        }
    }

    fn build(&self) -> Vec<u8> {
        let notes = self.notes();
        assert!(NOTES_OFFSET + notes.len() <= DATA_OFFSET);

        let mut elf = Vec::new();
        let () = elf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1]);
        let () = elf.resize(16, 0);
        let () = elf.extend_from_slice(&self.e_type.to_le_bytes());
        let () = elf.extend_from_slice(&machine().to_le_bytes());
        let () = elf.extend_from_slice(&1u32.to_le_bytes());
        // e_entry, e_phoff, e_shoff
        let () = elf.extend_from_slice(&Self::words(&[0, EHDR_SIZE as u64, 0]));
        // e_flags
        let () = elf.extend_from_slice(&0u32.to_le_bytes());
        // e_ehsize, e_phentsize, e_phnum, e_shentsize, e_shnum, e_shstrndx
        for half in [EHDR_SIZE as u16, PHDR_SIZE as u16, 3, 64, 0, 0] {
            let () = elf.extend_from_slice(&half.to_le_bytes());
        }
        assert_eq!(elf.len(), EHDR_SIZE);

        let () = Self::phdr(
            &mut elf,
            PT_NOTE,
            0,
            NOTES_OFFSET as u64,
            0,
            notes.len() as u64,
            0,
        );
        // The executable's first page is not dumped.
        let () = Self::phdr(&mut elf, PT_LOAD, PF_R | PF_X, DATA_OFFSET as u64, EXE_ADDR, 0, PAGE_SIZE);
        let () = Self::phdr(
            &mut elf,
            PT_LOAD,
            PF_R | PF_W,
            DATA_OFFSET as u64,
            ANON_ADDR,
            PAGE_SIZE,
            PAGE_SIZE,
        );

        let () = elf.resize(NOTES_OFFSET, 0);
        let () = elf.extend_from_slice(&notes);
        let () = elf.resize(DATA_OFFSET, 0);
        let () = elf.extend((0..PAGE_SIZE).map(|idx| idx as u8));
        elf
    }

    fn write(&self) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        let () = write(file.path(), self.build()).unwrap();
        file
    }
}


fn attach(path: &Path) -> Process {
    Process::attach_core(path, Arc::new(DefaultHooks)).unwrap()
}


/// Check that we can open a core file and read its memory.
#[test]
fn core_memory() {
    let exe = current_exe().unwrap();
    let core = CoreBuilder::new(&exe).write();
    let mut process = attach(core.path());
    assert_eq!(process.kind(), TargetKind::Core);

    let mut buf = [0; 4];
    let () = process.read_memory(ANON_ADDR + 0x10, &mut buf).unwrap();
    assert_eq!(buf, [0x10, 0x11, 0x12, 0x13]);

    // Contents not dumped are read from the mapped file.
    let () = process.read_memory(EXE_ADDR, &mut buf).unwrap();
    assert_eq!(&buf, b"\x7fELF");

    let err = process.read_memory(0x1000, &mut buf).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    let err = process.write_memory(ANON_ADDR, &[1]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    let psinfo = process.psinfo().unwrap();
    assert_eq!(psinfo.pid, 4242);
    assert_eq!(psinfo.fname, "test");
    assert_eq!(psinfo.psargs, "test --flag");
}


/// Check that mappings and load objects of a core file are reported.
#[test]
fn core_mappings() {
    let exe = current_exe().unwrap();
    let core = CoreBuilder::new(&exe).write();
    let process = attach(core.path());

    let mut mappings = Vec::new();
    let () = process
        .iterate_mappings(false, |mapping, object| {
            let () = mappings.push((mapping.base, object.map(|object| object.path().to_path_buf())));
            ControlFlow::Continue(())
        })
        .unwrap();
    assert_eq!(mappings, [(ANON_ADDR, None), (EXE_ADDR, Some(exe.clone()))]);

    let object = process.object_of(EXE_ADDR + 0x10).unwrap().unwrap();
    assert_eq!(object.path(), exe);
    assert_eq!(object.base(), EXE_ADDR);

    // The executable is identified through the entry point.
    let sym = process.lookup_by_name(ObjectSelector::Executable, "main").unwrap();
    assert_eq!(sym.object, object.id());
}


/// Check that a core file without process status is rejected.
#[test]
fn core_missing_status() {
    let exe = current_exe().unwrap();
    let mut builder = CoreBuilder::new(&exe);
    builder.prstatus = false;
    let core = builder.write();

    let err = Process::attach_core(core.path(), Arc::new(DefaultHooks)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingNoteSegment);
}


/// Check that files that are no core files are rejected.
#[test]
fn not_a_core() {
    let exe = current_exe().unwrap();
    let mut builder = CoreBuilder::new(&exe);
    builder.e_type = ET_EXEC;
    let core = builder.write();
    let err = Process::attach_core(core.path(), Arc::new(DefaultHooks)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotCoreFormat);

    let text = NamedTempFile::new().unwrap();
    let () = write(text.path(), b"certainly not an ELF file").unwrap();
    let err = Process::attach_core(text.path(), Arc::new(DefaultHooks)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotCoreFormat);

    let err = Process::attach_core(Path::new("/no/such/core"), Arc::new(DefaultHooks)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuchCoreFile);
}


/// Check that a core file can be referenced textually.
#[test]
fn core_by_arg() {
    let exe = current_exe().unwrap();
    let core = CoreBuilder::new(&exe).write();
    let path = core.path().to_str().unwrap();
    let process = Process::attach_arg(path, AttachOpts::default(), Arc::new(DefaultHooks)).unwrap();
    assert_eq!(process.kind(), TargetKind::Core);
}
