//! Access to post-mortem targets in the form of ELF core files.

use std::ffi::OsStr;
use std::fs::File;
use std::io;
use std::mem;
use std::ops::Range;
use std::os::unix::ffi::OsStrExt as _;
use std::path::Path;
use std::path::PathBuf;

use crate::elf::elf_class;
use crate::elf::types::AT_ENTRY;
use crate::elf::types::ELFCLASS32;
use crate::elf::types::ELFCLASS64;
use crate::elf::types::EM_AARCH64;
use crate::elf::types::EM_X86_64;
use crate::elf::types::ET_CORE;
use crate::elf::types::NT_AUXV;
use crate::elf::types::NT_FILE;
use crate::elf::types::NT_PRPSINFO;
use crate::elf::types::NT_PRSTATUS;
use crate::elf::types::PF_R;
use crate::elf::types::PF_W;
use crate::elf::types::PF_X;
use crate::elf::types::PT_LOAD;
use crate::elf::ElfParser;
use crate::log::debug;
use crate::symbols::SymTable;
use crate::util::ReadRaw as _;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::ErrorKind;
use crate::IntoError as _;
use crate::Result;

use super::AuxvEntry;
use super::ObjectImage;
use super::ObjectInfo;
use super::ObjectReader;
use super::Perm;
use super::PsInfo;
use super::RawMapping;
use super::RawSym;
use super::TargetIo;
use super::TargetKind;
use super::WordSize;


/// The name of notes written by the kernel.
const CORE_NOTE_NAME: &[u8] = b"CORE";


/// Offsets into `struct elf_prpsinfo` on 64 bit systems.
const PRPSINFO_PID: usize = 24;
const PRPSINFO_FNAME: Range<usize> = 40..56;
const PRPSINFO_PSARGS: Range<usize> = 56..136;


/// The machine of core files we are able to interpret.
fn host_machine() -> Option<u16> {
    if cfg!(target_arch = "x86_64") {
        Some(EM_X86_64)
    } else if cfg!(target_arch = "aarch64") {
        Some(EM_AARCH64)
    } else {
        None
    }
}


/// A loadable segment of a core file.
#[derive(Debug)]
struct Segment {
    /// The address range covered in the target.
    range: Range<Addr>,
    /// The offset of the dumped contents in the core file.
    offset: u64,
    /// The number of bytes dumped.
    filesz: u64,
    perm: Perm,
}


/// A file mapping as recorded in the `NT_FILE` note.
#[derive(Debug, Eq, PartialEq)]
struct FileMapping {
    range: Range<Addr>,
    /// The offset of the mapping into the file, in bytes.
    offset: u64,
    path: PathBuf,
}


/// Parse the contents of an `NT_FILE` note.
fn parse_file_note(mut desc: &[u8]) -> Option<Vec<FileMapping>> {
    let count = desc.read_u64()?;
    let page_size = desc.read_u64()?;

    let mut ranges = Vec::new();
    for _ in 0..count {
        let start = desc.read_u64()?;
        let end = desc.read_u64()?;
        let page_offset = desc.read_u64()?;
        let () = ranges.push((start..end, page_offset.checked_mul(page_size)?));
    }

    ranges
        .into_iter()
        .map(|(range, offset)| {
            let path = desc.read_cstr()?;
            let path = PathBuf::from(OsStr::from_bytes(path.to_bytes()));
            Some(FileMapping {
                range,
                offset,
                path,
            })
        })
        .collect()
}


/// Extract a NUL terminated string from a fixed size buffer.
fn fixed_str(data: &[u8]) -> String {
    let len = data.iter().position(|b| *b == b'\0').unwrap_or(data.len());
    String::from_utf8_lossy(&data[..len]).into_owned()
}


/// Parse the contents of an `NT_PRPSINFO` note.
fn parse_psinfo(desc: &[u8]) -> Option<PsInfo> {
    let pid = desc.get(PRPSINFO_PID..PRPSINFO_PID + 4)?;
    let pid = u32::from_ne_bytes(pid.try_into().ok()?);
    let fname = fixed_str(desc.get(PRPSINFO_FNAME)?);
    let psargs = fixed_str(desc.get(PRPSINFO_PSARGS)?);

    let psinfo = PsInfo {
        pid,
        fname,
        psargs,
        _non_exhaustive: (),
    };
    Some(psinfo)
}


fn open_error(err: io::Error, path: &Path) -> Error {
    let kind = match err.raw_os_error() {
        Some(libc::ENOENT) => ErrorKind::NoSuchCoreFile,
        Some(libc::EACCES | libc::EPERM) => ErrorKind::PermissionDenied,
        Some(libc::EMFILE | libc::ENFILE) => ErrorKind::OutOfFileDescriptors,
        Some(libc::EINTR) => ErrorKind::Interrupted,
        _ => ErrorKind::Unspecified,
    };
    Error::with_os_error(kind, err).context(format!("failed to open {}", path.display()))
}


/// A post-mortem target backed by an ELF core file.
#[derive(Debug)]
pub(crate) struct CoreTarget {
    path: PathBuf,
    parser: ElfParser,
    /// Loadable segments, sorted by address.
    segments: Vec<Segment>,
    /// File mappings, sorted by address.
    files: Vec<FileMapping>,
    auxv: Vec<AuxvEntry>,
    exe: Option<PathBuf>,
    psinfo: Option<PsInfo>,
    reader: ObjectReader,
}

impl CoreTarget {
    /// Open the core file at `path`.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| open_error(err, path))?;
        let parser = ElfParser::open_file(&file).map_err(|err| {
            Error::with_kind(ErrorKind::UnderlyingFormatLibraryError, format!("{err:#}"))
        })?;

        match elf_class(parser.data()) {
            Some(ELFCLASS64) => (),
            Some(ELFCLASS32) => {
                return Err(Error::with_kind(
                    ErrorKind::WrongArchitecture,
                    format!("{} is a 32 bit core file", path.display()),
                ))
            }
            _ => {
                return Err(Error::with_kind(
                    ErrorKind::NotCoreFormat,
                    format!("{} is not an ELF file", path.display()),
                ))
            }
        }

        let format_err = |err: Error| {
            Error::with_kind(
                ErrorKind::UnderlyingFormatLibraryError,
                format!("failed to parse {}: {err:#}", path.display()),
            )
        };

        let ehdr = parser.ehdr().map_err(format_err)?;
        if ehdr.e_type != ET_CORE {
            return Err(Error::with_kind(
                ErrorKind::NotCoreFormat,
                format!("{} is not a core file", path.display()),
            ))
        }
        if host_machine() != Some(ehdr.e_machine) {
            return Err(Error::with_kind(
                ErrorKind::WrongArchitecture,
                format!(
                    "core file {} is for machine {}, which is not supported",
                    path.display(),
                    ehdr.e_machine
                ),
            ))
        }

        let mut prstatus = false;
        let mut files = Vec::new();
        let mut auxv = Vec::new();
        let mut psinfo = None;
        for note in parser.notes().map_err(format_err)? {
            if note.name != CORE_NOTE_NAME {
                continue
            }

            match note.n_type {
                NT_PRSTATUS => prstatus = true,
                NT_FILE => {
                    files = parse_file_note(note.desc)
                        .ok_or_invalid_data(|| "failed to parse NT_FILE note")
                        .map_err(format_err)?;
                }
                NT_AUXV => auxv = AuxvEntry::parse(note.desc, WordSize::Bits64),
                NT_PRPSINFO => psinfo = parse_psinfo(note.desc),
                _ => (),
            }
        }

        if !prstatus {
            return Err(Error::with_kind(
                ErrorKind::MissingNoteSegment,
                format!("{} contains no process status note", path.display()),
            ))
        }

        let mut segments = parser
            .program_headers()
            .map_err(format_err)?
            .iter()
            .filter(|phdr| phdr.p_type == PT_LOAD)
            .map(|phdr| {
                let mut perm = Perm::NONE;
                for (flag, p) in [(PF_R, Perm::READ), (PF_W, Perm::WRITE), (PF_X, Perm::EXEC)] {
                    if phdr.p_flags & flag != 0 {
                        perm |= p;
                    }
                }
                Segment {
                    range: phdr.p_vaddr..phdr.p_vaddr.saturating_add(phdr.p_memsz),
                    offset: phdr.p_offset,
                    filesz: phdr.p_filesz.min(phdr.p_memsz),
                    perm,
                }
            })
            .collect::<Vec<_>>();
        let () = segments.sort_by_key(|segment| segment.range.start);
        let () = files.sort_by_key(|file| file.range.start);

        let entry = auxv
            .iter()
            .find(|entry| entry.type_ == AT_ENTRY)
            .map(|entry| entry.value);
        let exe = entry
            .and_then(|entry| files.iter().find(|file| file.range.contains(&entry)))
            .or_else(|| files.first())
            .map(|file| file.path.clone());

        debug!(
            "opened core file {} with {} segments and {} file mappings",
            path.display(),
            segments.len(),
            files.len()
        );

        let slf = Self {
            path: path.to_path_buf(),
            parser,
            segments,
            files,
            auxv,
            exe,
            psinfo,
            reader: ObjectReader::default(),
        };
        Ok(slf)
    }

    fn file_mapping(&self, addr: Addr) -> Option<&FileMapping> {
        self.files.iter().find(|file| file.range.contains(&addr))
    }

    /// Read as much as possible of `buf` from the segment containing
    /// `addr`, returning the number of bytes read.
    fn read_some(&self, addr: Addr, buf: &mut [u8]) -> Result<usize> {
        let segment = self
            .segments
            .iter()
            .find(|segment| segment.range.contains(&addr))
            .ok_or_unexpected_eof(|| format!("address {addr:#x} is not mapped"))?;

        let rel = addr - segment.range.start;
        let avail = usize::try_from(segment.range.end - addr).unwrap_or(usize::MAX);

        if rel < segment.filesz {
            let start = usize::try_from(segment.offset + rel)
                .map_err(Error::with_invalid_data)
                .context("segment offset does not fit into address space")?;
            let len = usize::try_from(segment.filesz - rel)
                .unwrap_or(usize::MAX)
                .min(buf.len());
            let data = self
                .parser
                .data()
                .get(start..start + len)
                .ok_or_unexpected_eof(|| {
                    format!("core file {} is truncated", self.path.display())
                })?;
            let () = buf[..len].copy_from_slice(data);
            return Ok(len)
        }

        // Parts of file backed mappings that have not been modified are
        // not contained in the core file. Consult the file itself.
        let file = self.file_mapping(addr).ok_or_unexpected_eof(|| {
            format!("contents of address {addr:#x} are not contained in core file")
        })?;
        let parser = self.reader.cache().find(&file.path)?;
        let offset = usize::try_from(file.offset + (addr - file.range.start))
            .map_err(Error::with_invalid_data)
            .context("file offset does not fit into address space")?;
        let len = avail
            .min(buf.len())
            .min(usize::try_from(file.range.end - addr).unwrap_or(usize::MAX));
        let data = parser
            .data()
            .get(offset..offset + len)
            .ok_or_unexpected_eof(|| {
                format!(
                    "{} does not contain data for address {addr:#x}",
                    file.path.display()
                )
            })?;
        let () = buf[..len].copy_from_slice(data);
        Ok(len)
    }
}

impl TargetIo for CoreTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::Core
    }

    fn word_size(&self) -> WordSize {
        WordSize::Bits64
    }

    fn enumerate_mappings(&self) -> Result<Vec<RawMapping>> {
        let mappings = self
            .segments
            .iter()
            .map(|segment| {
                let file = self.file_mapping(segment.range.start);
                RawMapping {
                    base: segment.range.start,
                    size: segment.range.end - segment.range.start,
                    perm: segment.perm,
                    offset: file
                        .map(|file| file.offset + (segment.range.start - file.range.start))
                        .unwrap_or(0),
                    path: file.map(|file| file.path.clone()),
                    ..Default::default()
                }
            })
            .collect();
        Ok(mappings)
    }

    fn read_memory(&self, mut addr: Addr, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            let count = self
                .read_some(addr, buf)
                .with_context(|| format!("failed to read memory at {addr:#x}"))?;
            addr += count as Addr;
            buf = &mut mem::take(&mut buf)[count..];
        }
        Ok(())
    }

    fn write_memory(&mut self, addr: Addr, _data: &[u8]) -> Result<()> {
        Err(Error::with_unsupported(format!(
            "cannot write to address {addr:#x} of core file {}",
            self.path.display()
        )))
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_stopped(&self) -> Result<bool> {
        Ok(true)
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
        self.exe.clone()
    }

    fn auxv(&self) -> Result<Vec<AuxvEntry>> {
        Ok(self.auxv.clone())
    }

    fn image_token(&self) -> Option<u64> {
        // A core file never executes a new image.
        Some(0)
    }

    fn psinfo(&self) -> Option<PsInfo> {
        self.psinfo.clone()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::env::current_exe;
    use std::io::Write as _;

    use tempfile::NamedTempFile;
    use test_log::test;


    /// Check that we can parse an `NT_FILE` note.
    #[test]
    fn file_note_parsing() {
        let mut desc = Vec::new();
        for word in [2u64, 0x1000, 0x400000, 0x401000, 0, 0x401000, 0x403000, 1] {
            let () = desc.extend_from_slice(&word.to_ne_bytes());
        }
        let () = desc.extend_from_slice(b"/usr/bin/app\0/usr/bin/app\0");

        let files = parse_file_note(&desc).unwrap();
        assert_eq!(
            files,
            vec![
                FileMapping {
                    range: 0x400000..0x401000,
                    offset: 0,
                    path: PathBuf::from("/usr/bin/app"),
                },
                FileMapping {
                    range: 0x401000..0x403000,
                    offset: 0x1000,
                    path: PathBuf::from("/usr/bin/app"),
                },
            ]
        );

        // Missing names.
        assert!(parse_file_note(&desc[..desc.len() - 13]).is_none());
    }

    /// Check that we can parse an `NT_PRPSINFO` note.
    #[test]
    fn psinfo_parsing() {
        let mut desc = vec![0u8; 136];
        let () = desc[PRPSINFO_PID..PRPSINFO_PID + 4].copy_from_slice(&42u32.to_ne_bytes());
        let () = desc[PRPSINFO_FNAME][..3].copy_from_slice(b"app");
        let () = desc[PRPSINFO_PSARGS][..10].copy_from_slice(b"app --flag");

        let psinfo = parse_psinfo(&desc).unwrap();
        assert_eq!(psinfo.pid, 42);
        assert_eq!(psinfo.fname, "app");
        assert_eq!(psinfo.psargs, "app --flag");

        assert!(parse_psinfo(&desc[..100]).is_none());
    }

    /// Make sure that we report sensible errors for files that are not
    /// core files.
    #[test]
    fn open_errors() {
        let err = CoreTarget::open(Path::new("/does/not/exist")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchCoreFile);

        let mut file = NamedTempFile::new().unwrap();
        let () = file.write_all(b"this is not an ELF file").unwrap();
        let err = CoreTarget::open(file.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotCoreFormat);

        // A regular executable is ELF, but not a core file.
        let exe = current_exe().unwrap();
        let err = CoreTarget::open(&exe).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotCoreFormat);

        let mut ident = [0u8; 64];
        let () = ident[..4].copy_from_slice(b"\x7fELF");
        ident[4] = ELFCLASS32;
        let mut file = NamedTempFile::new().unwrap();
        let () = file.write_all(&ident).unwrap();
        let err = CoreTarget::open(file.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongArchitecture);
    }
}
