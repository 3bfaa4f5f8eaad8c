//! Access to the dynamic linker's debug interface.
//!
//! The dynamic linker publishes an `r_debug` structure, which the
//! executable's dynamic section references through its `DT_DEBUG`
//! entry. It heads the list of loaded objects (`link_map`s) and reports
//! whether this list is currently consistent.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt as _;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::elf::types::DT_DEBUG;
use crate::elf::types::DT_NULL;
use crate::space::LoadObject;
use crate::target::TargetIo;
use crate::util::decode_word;
use crate::Addr;
use crate::Error;
use crate::IntoError as _;
use crate::Process;
use crate::Result;


/// An upper bound on the number of dynamic entries we are willing to
/// read.
const MAX_DYN_ENTRIES: usize = 4096;
/// An upper bound on the number of link maps per list, protecting us
/// from cycles.
const MAX_LINK_MAPS: usize = 1 << 16;
/// An upper bound on the number of link-map lists.
const MAX_NAMESPACES: usize = 256;
/// The maximum length of an object name we read.
const MAX_NAME_LEN: usize = 4096;
/// The size of chunks in which we read strings.
const NAME_CHUNK: usize = 64;


/// The state the dynamic linker reports for its link maps.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RtState {
    /// The link maps are consistent.
    Consistent,
    /// An object is being added.
    Add,
    /// An object is being removed.
    Delete,
    /// A value not known to us.
    Other(u64),
}

impl From<u64> for RtState {
    fn from(value: u64) -> Self {
        match value {
            0 => Self::Consistent,
            1 => Self::Add,
            2 => Self::Delete,
            other => Self::Other(other),
        }
    }
}


/// The contents of an `r_debug` structure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RDebug {
    /// The version of the protocol.
    pub version: u32,
    /// The address of the head of the link-map list.
    pub map: Addr,
    /// The address of the function the dynamic linker calls on
    /// changes to the link maps.
    pub brk: Addr,
    /// The state of the link maps.
    pub state: RtState,
    /// The base address the dynamic linker is loaded at.
    pub ldbase: Addr,
    /// The address of the `r_debug` structure of the next link-map
    /// list, if any. Only reported for protocol versions 2 and higher.
    pub next: Option<Addr>,
}


/// An entry of a link-map list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkMap {
    /// The identifier of the link-map list the entry is part of.
    pub lmid: u64,
    /// The difference between the object's run-time and link-time
    /// addresses (`l_addr`).
    pub addr: Addr,
    /// The path of the object. Empty for the executable.
    pub name: PathBuf,
    /// The run-time address of the object's dynamic section.
    pub ld: Addr,
}


/// Reading of the dynamic linker's data structures from a target.
struct Reader<'io> {
    io: &'io dyn TargetIo,
    word: usize,
}

impl<'io> Reader<'io> {
    fn new(io: &'io dyn TargetIo) -> Self {
        Self {
            io,
            word: io.word_size().bytes(),
        }
    }

    fn read_words<const N: usize>(&self, addr: Addr) -> Result<[u64; N]> {
        let mut buf = vec![0; self.word * N];
        let () = self.io.read_memory(addr, &mut buf)?;

        let mut words = [0; N];
        for (word, chunk) in words.iter_mut().zip(buf.chunks_exact(self.word)) {
            *word = decode_word(chunk, self.word).ok_or_invalid_data(|| "invalid word size")?;
        }
        Ok(words)
    }

    fn read_name(&self, addr: Addr) -> Result<PathBuf> {
        if addr == 0 {
            return Ok(PathBuf::new())
        }

        let mut name = Vec::new();
        let mut addr = addr;
        while name.len() < MAX_NAME_LEN {
            // Read up to the next chunk boundary only, so that we never
            // cross into an unmapped page needlessly.
            let len = NAME_CHUNK - (addr as usize % NAME_CHUNK);
            let mut buf = vec![0; len];
            let () = self.io.read_memory(addr, &mut buf)?;
            if let Some(end) = buf.iter().position(|byte| *byte == b'\0') {
                let () = name.extend_from_slice(&buf[..end]);
                return Ok(PathBuf::from(OsStr::from_bytes(&name)))
            }
            let () = name.extend_from_slice(&buf);
            addr += len as u64;
        }

        Err(Error::with_invalid_data(format!(
            "object name at {addr:#x} is not terminated"
        )))
    }

    /// Find the `r_debug` structure through the dynamic section of the
    /// executable.
    fn locate(&self, exe: &LoadObject) -> Result<Addr> {
        let dynamic = exe.info().dynamic.ok_or_not_found(|| {
            format!(
                "{} has no dynamic section; it is statically linked",
                exe.path().display()
            )
        })?;

        let mut addr = dynamic.wrapping_add(exe.bias());
        for _ in 0..MAX_DYN_ENTRIES {
            let [tag, value] = self.read_words::<2>(addr)?;
            match tag as i64 {
                DT_NULL => break,
                DT_DEBUG if value == 0 => {
                    return Err(Error::with_not_found(
                        "the dynamic linker has not initialized its debug interface yet",
                    ))
                }
                DT_DEBUG => return Ok(value),
                _ => (),
            }
            addr += 2 * self.word as u64;
        }

        Err(Error::with_not_found(format!(
            "{} has no DT_DEBUG entry",
            exe.path().display()
        )))
    }

    fn r_debug(&self, addr: Addr) -> Result<RDebug> {
        let [version, map, brk, state, ldbase] = self.read_words::<5>(addr)?;
        // `r_version` and `r_state` are `int`s, padded to a word.
        let version = version as u32;
        let next = if version >= 2 {
            let [next] = self.read_words::<1>(addr + 5 * self.word as u64)?;
            Some(next).filter(|next| *next != 0)
        } else {
            None
        };

        let r_debug = RDebug {
            version,
            map,
            brk,
            state: RtState::from(state & 0xffff_ffff),
            ldbase,
            next,
        };
        Ok(r_debug)
    }

    fn link_maps(&self, r_debug: Addr) -> Result<Vec<LinkMap>> {
        let mut link_maps = Vec::new();
        let mut next = Some(r_debug);

        for lmid in 0..MAX_NAMESPACES as u64 {
            let addr = if let Some(addr) = next {
                addr
            } else {
                break
            };
            let r_debug = self.r_debug(addr)?;

            let mut map = r_debug.map;
            let mut count = 0;
            while map != 0 {
                if count >= MAX_LINK_MAPS {
                    return Err(Error::with_invalid_data(format!(
                        "link-map list {lmid} does not terminate"
                    )))
                }

                let [l_addr, l_name, l_ld, l_next] = self.read_words::<4>(map)?;
                let link_map = LinkMap {
                    lmid,
                    addr: l_addr,
                    name: self.read_name(l_name)?,
                    ld: l_ld,
                };
                let () = link_maps.push(link_map);
                map = l_next;
                count += 1;
            }
            next = r_debug.next;
        }
        Ok(link_maps)
    }
}


/// The synchronization state with the dynamic linker of a target.
#[derive(Debug, Default)]
pub(crate) struct SyncState {
    /// The address of the `r_debug` structure, once located.
    r_debug: OnceLock<Addr>,
    /// A counter bumped on every consistent state event.
    generation: u64,
    /// The head of the link-map list at the last consistent state
    /// event.
    r_map: Option<Addr>,
}

impl SyncState {
    /// Locate the `r_debug` structure, if it has not been located yet.
    pub(crate) fn r_debug(&self, io: &dyn TargetIo, exe: &LoadObject) -> Result<Addr> {
        if let Some(addr) = self.r_debug.get() {
            return Ok(*addr)
        }
        let addr = Reader::new(io).locate(exe)?;
        Ok(*self.r_debug.get_or_init(|| addr))
    }

    /// Read the link maps, provided the `r_debug` structure has been
    /// located before.
    pub(crate) fn link_maps(&self, io: &dyn TargetIo) -> Option<Result<Vec<LinkMap>>> {
        let r_debug = self.r_debug.get()?;
        Some(Reader::new(io).link_maps(*r_debug))
    }

    /// Record a consistent state event.
    pub(crate) fn consistent(&mut self, io: &dyn TargetIo) -> Result<()> {
        if let Some(r_debug) = self.r_debug.get() {
            let r_debug = Reader::new(io).r_debug(*r_debug)?;
            self.r_map = Some(r_debug.map);
        }
        self.generation += 1;
        Ok(())
    }
}


/// A view of the dynamic linker's debug interface of a [`Process`].
///
/// Agents borrow the process they were created for, so they can not be
/// used past a change of the process' image.
#[derive(Debug)]
pub struct Agent<'proc> {
    process: &'proc Process,
    r_debug: Addr,
}

impl<'proc> Agent<'proc> {
    pub(crate) fn new(process: &'proc Process, r_debug: Addr) -> Self {
        Self { process, r_debug }
    }

    /// The address of the `r_debug` structure.
    #[inline]
    pub fn r_debug_addr(&self) -> Addr {
        self.r_debug
    }

    /// Read the current contents of the `r_debug` structure.
    pub fn r_debug(&self) -> Result<RDebug> {
        Reader::new(self.process.io()).r_debug(self.r_debug)
    }

    /// Read the current state of the link maps.
    pub fn state(&self) -> Result<RtState> {
        self.r_debug().map(|r_debug| r_debug.state)
    }

    /// Read all link maps, walking all link-map lists.
    ///
    /// The contents are only meaningful while the state is
    /// [`RtState::Consistent`].
    pub fn link_maps(&self) -> Result<Vec<LinkMap>> {
        Reader::new(self.process.io()).link_maps(self.r_debug)
    }

    /// The number of consistent state events processed so far.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.process.sync().generation
    }

    /// The head of the link-map list as seen at the last consistent
    /// state event.
    #[inline]
    pub fn last_consistent_map(&self) -> Option<Addr> {
        self.process.sync().r_map
    }
}
