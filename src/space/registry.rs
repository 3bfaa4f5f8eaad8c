use std::collections::HashMap;
use std::collections::HashSet;
use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::elf::types::AT_BASE;
use crate::elf::types::AT_ENTRY;
use crate::log::debug;
use crate::log::trace;
use crate::rtld::LinkMap;
use crate::symbols::ObjId;
use crate::symbols::ObjectSelector;
use crate::symbols::SymbolIndex;
use crate::target::AuxvEntry;
use crate::target::ObjectImage;
use crate::target::ObjectInfo;
use crate::target::TargetIo;
use crate::Addr;
use crate::Error;
use crate::Result;

use super::Mapping;


/// The pseudo name referring to the executable.
const EXECUTABLE_NAME: &str = "a.out";


/// Check whether two paths refer to the same file name.
fn same_file_name(lhs: &Path, rhs: &Path) -> bool {
    lhs.file_name().is_some() && lhs.file_name() == rhs.file_name()
}


/// An executable or shared object mapped into a target's address space.
#[derive(Debug)]
pub struct LoadObject {
    id: ObjId,
    /// The path as reported by the target.
    path: PathBuf,
    /// The canonical path, once resolved.
    canonical: OnceLock<PathBuf>,
    /// The address of the object's first mapping.
    base: Addr,
    /// The link-map list the object is part of.
    lmid: u64,
    /// The address ranges of the mappings belonging to the object.
    mappings: Vec<Range<Addr>>,
    info: ObjectInfo,
    /// The difference between run-time and link-time addresses.
    bias: Addr,
    /// Whether object data is read from the target's memory instead of
    /// from the file.
    in_core: bool,
    symbols: SymbolIndex,
}

impl LoadObject {
    fn new(id: ObjId, path: PathBuf, base: Addr, info: ObjectInfo, in_core: bool) -> Self {
        let bias = base.wrapping_sub(info.load_vaddr.wrapping_sub(info.load_offset));
        Self {
            id,
            path,
            canonical: OnceLock::new(),
            base,
            lmid: 0,
            mappings: Vec::new(),
            info,
            bias,
            in_core,
            symbols: SymbolIndex::default(),
        }
    }

    /// The object's handle.
    #[inline]
    pub fn id(&self) -> ObjId {
        self.id
    }

    /// The path of the object, as reported by the target.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The canonical path of the object, if it has been resolved.
    ///
    /// Paths are resolved by resolved iteration of mappings or load
    /// objects.
    #[inline]
    pub fn canonical_path(&self) -> Option<&Path> {
        self.canonical.get().map(PathBuf::as_path)
    }

    /// Resolve the canonical path of the object.
    pub(crate) fn resolve(&self, io: &dyn TargetIo) -> &Path {
        self.canonical.get_or_init(|| io.resolve_path(&self.path))
    }

    /// The address the object's first mapping starts at.
    #[inline]
    pub fn base(&self) -> Addr {
        self.base
    }

    /// The difference between the object's run-time and link-time
    /// addresses.
    #[inline]
    pub fn bias(&self) -> Addr {
        self.bias
    }

    /// The identifier of the dynamic linker's link-map list (namespace)
    /// the object belongs to.
    #[inline]
    pub fn lmid(&self) -> u64 {
        self.lmid
    }

    /// The address ranges of the mappings belonging to the object.
    #[inline]
    pub fn mappings(&self) -> &[Range<Addr>] {
        &self.mappings
    }

    /// Information about the object's ELF image.
    #[inline]
    pub fn info(&self) -> &ObjectInfo {
        &self.info
    }

    /// Check whether any of the object's mappings contains `addr`.
    pub fn contains(&self, addr: Addr) -> bool {
        self.mappings.iter().any(|range| range.contains(&addr))
    }

    /// The image to read the object's data from.
    pub(crate) fn image(&self) -> ObjectImage<'_> {
        if self.in_core {
            ObjectImage::Memory { base: self.base }
        } else {
            ObjectImage::File(&self.path)
        }
    }

    #[inline]
    pub(crate) fn symbols(&self) -> &SymbolIndex {
        &self.symbols
    }

    /// Check whether the object is known by the provided path.
    fn has_path(&self, path: &Path) -> bool {
        self.path == path || self.canonical_path() == Some(path)
    }
}


/// Read the information of an object mapped at `base`, preferring the
/// object file over the target's memory.
fn load_info(io: &dyn TargetIo, path: &Path, base: Addr, in_core: bool) -> Result<(ObjectInfo, bool)> {
    if !in_core {
        match io.object_info(ObjectImage::File(path)) {
            Ok(info) => return Ok((info, false)),
            Err(err) => {
                debug!(
                    "failed to read object information from {}: {err:#}; falling back to memory image",
                    path.display()
                )
            }
        }
    }

    let info = io.object_info(ObjectImage::Memory { base })?;
    Ok((info, true))
}


/// The arena of load objects of a target.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    /// Load objects, indexed by `ObjId`. Slots of vanished objects are
    /// cleared and never reused.
    slots: Vec<Option<LoadObject>>,
    /// Objects by path and base address.
    index: HashMap<(PathBuf, Addr), ObjId>,
    /// Mapped files we found not to be ELF objects.
    rejected: HashSet<(PathBuf, Addr)>,
    /// All present objects, in order of their first mapping.
    order: Vec<ObjId>,
    executable: Option<ObjId>,
    dynamic_linker: Option<ObjId>,
}

impl Registry {
    /// Rebuild the registry for the provided mappings, associating each
    /// mapping with the object it belongs to.
    ///
    /// A mapping at file offset zero starts a new instance of an object,
    /// later mappings of the same file are attributed to the most recent
    /// instance.
    pub(crate) fn rebuild(
        &mut self,
        io: &dyn TargetIo,
        mappings: &mut [Mapping],
        auxv: &[AuxvEntry],
        executable: Option<&Path>,
        in_core: bool,
    ) {
        let mut seen = HashSet::new();
        let mut rejected = HashSet::new();
        let mut order = Vec::new();
        let mut current = HashMap::<PathBuf, ObjId>::new();

        for mapping in mappings.iter_mut() {
            let path = if let Some(path) = &mapping.path {
                path
            } else {
                continue
            };

            let id = if mapping.offset == 0 {
                let key = (path.clone(), mapping.base);
                let id = if let Some(id) = self.index.get(&key) {
                    Some(*id)
                } else if self.rejected.contains(&key) {
                    None
                } else {
                    match load_info(io, path, mapping.base, in_core) {
                        Ok((info, in_core)) => {
                            let id = ObjId(self.slots.len());
                            trace!("new load object {} at {:#x}: {id}", path.display(), mapping.base);
                            let object = LoadObject::new(id, path.clone(), mapping.base, info, in_core);
                            let () = self.slots.push(Some(object));
                            let _prev = self.index.insert(key.clone(), id);
                            Some(id)
                        }
                        Err(err) => {
                            debug!("{} is not a load object: {err:#}", path.display());
                            None
                        }
                    }
                };

                if let Some(id) = id {
                    let _prev = current.insert(path.clone(), id);
                    id
                } else {
                    let _inserted = rejected.insert(key);
                    let _prev = current.remove(path);
                    continue
                }
            } else if let Some(id) = current.get(path) {
                *id
            } else {
                continue
            };

            let object = if let Some(Some(object)) = self.slots.get_mut(id.0) {
                object
            } else {
                continue
            };
            if seen.insert(id) {
                let () = object.mappings.clear();
                let () = order.push(id);
            }
            let () = object.mappings.push(mapping.range());
            mapping.object = Some(id);
        }

        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_some() && !seen.contains(&ObjId(idx)) {
                if let Some(object) = slot.take() {
                    trace!("load object {} at {:#x} vanished", object.path.display(), object.base);
                    let _removed = self.index.remove(&(object.path, object.base));
                }
            }
        }

        self.rejected = rejected;
        self.order = order;
        let () = self.identify(auxv, executable);
    }

    /// Determine the executable and the dynamic linker.
    fn identify(&mut self, auxv: &[AuxvEntry], executable: Option<&Path>) {
        let aux = |type_| {
            auxv.iter()
                .find(|entry| entry.type_ == type_)
                .map(|entry| entry.value)
                .filter(|value| *value != 0)
        };

        let exe = aux(AT_ENTRY)
            .and_then(|entry| self.objects().find(|object| object.contains(entry)))
            .or_else(|| {
                let path = executable?;
                self.objects().find(|object| object.has_path(path))
            })
            .or_else(|| self.objects().next())
            .map(LoadObject::id);

        let interp = exe
            .and_then(|id| self.object(id))
            .and_then(|object| object.info.interp.as_deref());
        let ld = aux(AT_BASE)
            .and_then(|base| self.objects().find(|object| object.base == base))
            .or_else(|| {
                let interp = interp?;
                self.objects().find(|object| {
                    object.has_path(interp) || same_file_name(&object.path, interp)
                })
            })
            .map(LoadObject::id)
            .filter(|id| Some(*id) != exe);

        self.executable = exe;
        self.dynamic_linker = ld;
    }

    /// Assign link-map list identifiers using the dynamic linker's
    /// link maps.
    pub(crate) fn assign_lmids(&mut self, link_maps: &[LinkMap]) {
        for id in &self.order {
            let is_exe = Some(*id) == self.executable;
            let object = if let Some(Some(object)) = self.slots.get_mut(id.0) {
                object
            } else {
                continue
            };

            let link_map = link_maps.iter().find(|link_map| {
                link_map.addr == object.bias
                    && ((is_exe && link_map.name.as_os_str().is_empty())
                        || object.has_path(&link_map.name)
                        || same_file_name(&object.path, &link_map.name))
            });
            if let Some(link_map) = link_map {
                object.lmid = link_map.lmid;
            }
        }
    }

    /// Retrieve the object with the given handle, if it is still
    /// present.
    #[inline]
    pub(crate) fn object(&self, id: ObjId) -> Option<&LoadObject> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    /// Iterate over all objects, in order of their first mapping.
    pub(crate) fn objects(&self) -> impl Iterator<Item = &LoadObject> {
        self.order.iter().filter_map(|id| self.object(*id))
    }

    #[inline]
    pub(crate) fn executable(&self) -> Option<&LoadObject> {
        self.executable.and_then(|id| self.object(id))
    }

    /// Resolve a selector into the objects to search, in search order.
    pub(crate) fn select(&self, selector: ObjectSelector<'_>) -> Result<Vec<&LoadObject>> {
        match selector {
            ObjectSelector::Executable => {
                let exe = self
                    .executable()
                    .ok_or_else(|| Error::with_not_found("target has no executable mapped"))?;
                Ok(vec![exe])
            }
            ObjectSelector::DynamicLinker => {
                let ld = self
                    .dynamic_linker
                    .and_then(|id| self.object(id))
                    .ok_or_else(|| Error::with_not_found("target has no dynamic linker mapped"))?;
                Ok(vec![ld])
            }
            ObjectSelector::Every => {
                let first = [self.executable, self.dynamic_linker];
                let objects = first
                    .iter()
                    .flatten()
                    .copied()
                    .chain(
                        self.order
                            .iter()
                            .copied()
                            .filter(|id| !first.contains(&Some(*id))),
                    )
                    .filter_map(|id| self.object(id))
                    .collect();
                Ok(objects)
            }
            ObjectSelector::Named(EXECUTABLE_NAME) => self.select(ObjectSelector::Executable),
            ObjectSelector::Named(name) => {
                let object = self
                    .objects()
                    .find(|object| {
                        ObjectSelector::matches_path(name, &object.path)
                            || object
                                .canonical_path()
                                .is_some_and(|path| ObjectSelector::matches_path(name, path))
                    })
                    .ok_or_else(|| Error::with_not_found(format!("no load object named `{name}`")))?;
                Ok(vec![object])
            }
        }
    }
}
