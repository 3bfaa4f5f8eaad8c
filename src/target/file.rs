//! Access to plain object files, treated as if they were loaded at
//! their link-time addresses.

use std::fs::File;
use std::io;
use std::mem;
use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;

use crate::elf::types::Elf64_Phdr;
use crate::elf::types::ET_DYN;
use crate::elf::types::ET_EXEC;
use crate::elf::types::PF_R;
use crate::elf::types::PF_W;
use crate::elf::types::PF_X;
use crate::elf::types::PT_LOAD;
use crate::elf::ElfParser;
use crate::log::debug;
use crate::symbols::SymTable;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::ErrorKind;
use crate::IntoError as _;
use crate::Result;

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


/// The granularity segments get mapped with.
const PAGE_SIZE: u64 = 0x1000;
/// The maximum length of a reported file name.
const FNAME_LEN: usize = 16;


/// A loadable segment, laid out the way the kernel would map it.
#[derive(Debug, Eq, PartialEq)]
struct Segment {
    /// The page aligned address range covered.
    range: Range<Addr>,
    /// The file offset corresponding to the start of `range`.
    offset: u64,
    /// The end of the part of `range` backed by file contents. The
    /// remainder reads as zero.
    file_end: Addr,
    perm: Perm,
}


/// Lay out the loadable segments described by `phdrs`.
///
/// Segments sharing a page are clipped, so that the result is sorted
/// and free of overlaps.
fn layout(phdrs: &[Elf64_Phdr]) -> Result<Vec<Segment>> {
    let mut loads = phdrs
        .iter()
        .filter(|phdr| phdr.p_type == PT_LOAD && phdr.p_memsz != 0)
        .collect::<Vec<_>>();
    let () = loads.sort_by_key(|phdr| phdr.p_vaddr);

    let mut segments = Vec::<Segment>::with_capacity(loads.len());
    for phdr in loads {
        let vaddr = phdr.p_vaddr;
        let end = vaddr
            .checked_add(phdr.p_memsz)
            .and_then(|end| end.checked_next_multiple_of(PAGE_SIZE))
            .ok_or_invalid_data(|| format!("segment at {vaddr:#x} exceeds the address space"))?;
        let file_end = vaddr + phdr.p_filesz.min(phdr.p_memsz);

        let mut start = vaddr - vaddr % PAGE_SIZE;
        let mut offset = phdr
            .p_offset
            .checked_sub(vaddr - start)
            .ok_or_invalid_data(|| format!("segment at {vaddr:#x} is misaligned"))?;

        if let Some(prev) = segments.last() {
            if start < prev.range.end {
                offset += prev.range.end - start;
                start = prev.range.end;
            }
        }
        if start >= end {
            continue
        }

        let mut perm = Perm::NONE;
        for (flag, p) in [(PF_R, Perm::READ), (PF_W, Perm::WRITE), (PF_X, Perm::EXEC)] {
            if phdr.p_flags & flag != 0 {
                perm |= p;
            }
        }

        let segment = Segment {
            range: start..end,
            offset,
            file_end: file_end.clamp(start, end),
            perm,
        };
        let () = segments.push(segment);
    }
    Ok(segments)
}


fn open_error(err: io::Error, path: &Path) -> Error {
    let kind = match err.raw_os_error() {
        Some(libc::ENOENT) => ErrorKind::ExecutableNotFound,
        Some(libc::EACCES | libc::EPERM) => ErrorKind::PermissionDenied,
        Some(libc::EMFILE | libc::ENFILE) => ErrorKind::OutOfFileDescriptors,
        Some(libc::EINTR) => ErrorKind::Interrupted,
        _ => ErrorKind::Unspecified,
    };
    Error::with_os_error(kind, err).context(format!("failed to open {}", path.display()))
}


/// An executable or shared object file, not associated with any
/// process.
#[derive(Debug)]
pub(crate) struct FileTarget {
    path: PathBuf,
    parser: ElfParser,
    /// Loadable segments, sorted by address.
    segments: Vec<Segment>,
    reader: ObjectReader,
}

impl FileTarget {
    /// Open the object file at `path`.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| open_error(err, path))?;
        let parser = ElfParser::open_file(&file)
            .with_context(|| format!("failed to map {}", path.display()))?;

        let ehdr = parser
            .ehdr()
            .with_context(|| format!("failed to parse {}", path.display()))?;
        if ehdr.e_type != ET_EXEC && ehdr.e_type != ET_DYN {
            return Err(Error::with_invalid_data(format!(
                "{} is neither an executable nor a shared object",
                path.display()
            )))
        }

        let segments = parser
            .program_headers()
            .and_then(layout)
            .with_context(|| format!("failed to lay out segments of {}", path.display()))?;
        debug!(
            "opened object file {} with {} segments",
            path.display(),
            segments.len()
        );

        let slf = Self {
            path: path.to_path_buf(),
            parser,
            segments,
            reader: ObjectReader::default(),
        };
        Ok(slf)
    }

    /// Read as much as possible of `buf` from the segment containing
    /// `addr`, returning the number of bytes read.
    fn read_some(&self, addr: Addr, buf: &mut [u8]) -> Result<usize> {
        let segment = self
            .segments
            .iter()
            .find(|segment| segment.range.contains(&addr))
            .ok_or_unexpected_eof(|| format!("address {addr:#x} is not mapped"))?;

        if addr >= segment.file_end {
            let len = usize::try_from(segment.range.end - addr)
                .unwrap_or(usize::MAX)
                .min(buf.len());
            let () = buf[..len].fill(0);
            return Ok(len)
        }

        let start = usize::try_from(segment.offset + (addr - segment.range.start))
            .map_err(Error::with_invalid_data)
            .context("segment offset does not fit into address space")?;
        let len = usize::try_from(segment.file_end - addr)
            .unwrap_or(usize::MAX)
            .min(buf.len());
        let data = self
            .parser
            .data()
            .get(start..start + len)
            .ok_or_unexpected_eof(|| format!("{} is truncated", self.path.display()))?;
        let () = buf[..len].copy_from_slice(data);
        Ok(len)
    }
}

impl TargetIo for FileTarget {
    fn kind(&self) -> TargetKind {
        TargetKind::File
    }

    fn word_size(&self) -> WordSize {
        WordSize::Bits64
    }

    fn enumerate_mappings(&self) -> Result<Vec<RawMapping>> {
        let mappings = self
            .segments
            .iter()
            .map(|segment| RawMapping {
                base: segment.range.start,
                size: segment.range.end - segment.range.start,
                perm: segment.perm,
                offset: segment.offset,
                path: Some(self.path.clone()),
                ..Default::default()
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
            "cannot write to address {addr:#x} of object file {}",
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
        Some(self.path.clone())
    }

    fn image_token(&self) -> Option<u64> {
        Some(0)
    }

    fn psinfo(&self) -> Option<PsInfo> {
        let fname = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().chars().take(FNAME_LEN).collect())
            .unwrap_or_default();
        let psinfo = PsInfo {
            pid: 0,
            fname,
            psargs: self.path.display().to_string(),
            _non_exhaustive: (),
        };
        Some(psinfo)
    }
}
