//! The cached view of a target's address space: its mappings and the
//! load objects backing them.

mod registry;

use std::ops::Range;
use std::path::PathBuf;

use crate::log::debug;
use crate::symbols::ObjId;
use crate::target::AuxvEntry;
use crate::target::Perm;
use crate::target::RawMapping;
use crate::target::TargetIo;
use crate::util::find_match_or_lower_bound_by;
use crate::Addr;
use crate::Error;
use crate::Result;

pub use registry::LoadObject;
pub(crate) use registry::Registry;


/// A memory mapping of a target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mapping {
    /// The start address of the mapping.
    pub base: Addr,
    /// The size of the mapping, in bytes.
    pub size: u64,
    /// The protection flags of the mapping.
    pub perm: Perm,
    /// The offset of the mapping into the backing file.
    pub offset: u64,
    /// The path of the backing file, as reported by the target.
    pub path: Option<PathBuf>,
    /// The load object the mapping belongs to, if any.
    pub object: Option<ObjId>,
    /// The struct is non-exhaustive and open to extension.
    #[doc(hidden)]
    pub _non_exhaustive: (),
}

impl Mapping {
    /// The address range covered by the mapping.
    #[inline]
    pub fn range(&self) -> Range<Addr> {
        self.base..self.base + self.size
    }

    /// Check whether the mapping contains the provided address.
    #[inline]
    pub fn contains(&self, addr: Addr) -> bool {
        self.range().contains(&addr)
    }
}


/// Sort raw mappings by address and make sure that they are sane.
fn validate(mut raw: Vec<RawMapping>) -> Result<Vec<Mapping>> {
    let () = raw.retain(|mapping| mapping.size != 0);
    let () = raw.sort_by_key(|mapping| mapping.base);

    let mut mappings = Vec::<Mapping>::with_capacity(raw.len());
    for RawMapping {
        base,
        size,
        perm,
        offset,
        path,
        ..
    } in raw
    {
        if base.checked_add(size).is_none() {
            return Err(Error::with_invalid_data(format!(
                "mapping at {base:#x} of size {size:#x} exceeds address space"
            )))
        }

        if let Some(prev) = mappings.last() {
            if prev.range().end > base {
                return Err(Error::with_invalid_data(format!(
                    "mapping at {base:#x} overlaps mapping {:#x?}",
                    prev.range()
                )))
            }
        }

        let mapping = Mapping {
            base,
            size,
            perm,
            offset,
            path,
            object: None,
            _non_exhaustive: (),
        };
        let () = mappings.push(mapping);
    }
    Ok(mappings)
}


/// The cached address space of a target.
#[derive(Debug, Default)]
pub(crate) struct AddressSpace {
    /// All mappings, in ascending address order.
    mappings: Vec<Mapping>,
    registry: Registry,
    /// Whether the cache reflects the target's current image.
    valid: bool,
}

impl AddressSpace {
    /// Rebuild the cache from what the target reports.
    ///
    /// Load objects that are still mapped at the same address are
    /// retained, including their symbol tables.
    pub(crate) fn refresh(&mut self, io: &dyn TargetIo, in_core: bool) -> Result<()> {
        let mut mappings = validate(io.enumerate_mappings()?)?;
        let auxv = io.auxv().unwrap_or_else(|err| {
            debug!("failed to read auxiliary vector: {err}");
            Vec::<AuxvEntry>::new()
        });
        let executable = io.executable();

        let () = self
            .registry
            .rebuild(io, &mut mappings, &auxv, executable.as_deref(), in_core);
        self.mappings = mappings;
        self.valid = true;
        Ok(())
    }

    /// Discard all cached state.
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    #[inline]
    pub(crate) fn is_valid(&self) -> bool {
        self.valid
    }

    #[inline]
    pub(crate) fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    #[inline]
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    #[inline]
    pub(crate) fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Find the index of the mapping containing `addr`.
    fn mapping_idx(&self, addr: Addr) -> Option<usize> {
        let idx = find_match_or_lower_bound_by(&self.mappings, addr, |mapping| mapping.base)?;
        self.mappings[idx].contains(addr).then_some(idx)
    }

    /// Find the mapping containing `addr`.
    pub(crate) fn mapping_of(&self, addr: Addr) -> Option<&Mapping> {
        self.mapping_idx(addr).map(|idx| &self.mappings[idx])
    }

    /// Find the load object covering `addr`.
    ///
    /// Anonymous mappings directly following a mapping of an object
    /// (such as the one holding `.bss`) are attributed to this object.
    pub(crate) fn object_of(&self, addr: Addr) -> Option<&LoadObject> {
        let idx = self.mapping_idx(addr)?;
        let mapping = &self.mappings[idx];

        let id = match (mapping.object, &mapping.path) {
            (Some(id), _) => id,
            (None, Some(_path)) => return None,
            (None, None) => {
                let prev = self.mappings[..idx].last()?;
                if prev.range().end != mapping.base {
                    return None
                }
                prev.object?
            }
        };
        self.registry.object(id)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    use test_log::test;

    use crate::test_helper::MockObject;
    use crate::test_helper::MockTarget;
    use crate::ErrorKind;


    fn raw(base: Addr, size: u64) -> RawMapping {
        RawMapping {
            base,
            size,
            perm: Perm::READ,
            ..Default::default()
        }
    }


    /// Exercise the `Debug` representation of various types.
    #[test]
    fn debug_repr() {
        let space = AddressSpace::default();
        assert_ne!(format!("{space:?}"), "");
    }

    /// Check that mappings get sorted and empty ones dropped.
    #[test]
    fn mapping_validation() {
        let mappings = validate(vec![raw(0x3000, 0x1000), raw(0x1000, 0x1000), raw(0x5000, 0)]).unwrap();
        let bases = mappings.iter().map(|mapping| mapping.base).collect::<Vec<_>>();
        assert_eq!(bases, [0x1000, 0x3000]);
    }

    /// Make sure that overlapping mappings are rejected.
    #[test]
    fn overlapping_mappings() {
        let err = validate(vec![raw(0x1000, 0x2000), raw(0x2000, 0x1000)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let err = validate(vec![raw(u64::MAX - 0x10, 0x20)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    /// Check mapping and object lookups by address.
    #[test]
    fn address_lookup() {
        let target = MockTarget::new()
            .with_object(MockObject::new("/usr/bin/app", 0x400000).with_bss(0x1000))
            .with_anonymous(0x7000000, 0x1000);

        let mut space = AddressSpace::default();
        let () = space.refresh(&target, false).unwrap();
        assert!(space.is_valid());

        assert!(space.mapping_of(0x3fffff).is_none());
        let mapping = space.mapping_of(0x400010).unwrap();
        assert_eq!(mapping.base, 0x400000);
        assert!(mapping.object.is_some());

        let object = space.object_of(0x400010).unwrap();
        assert_eq!(object.path(), Path::new("/usr/bin/app"));

        // The `.bss` mapping has no object, but is attributed to the one
        // in front of it.
        let bss = space.mappings().iter().find(|mapping| mapping.path.is_none()).unwrap();
        assert_eq!(bss.object, None);
        assert_eq!(space.object_of(bss.base).unwrap().id(), object.id());

        assert!(space.object_of(0x7000000).is_none());

        let () = space.reset();
        assert!(!space.is_valid());
        assert!(space.mappings().is_empty());
    }
}
