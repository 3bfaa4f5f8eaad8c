use std::cmp::Reverse;
use std::sync::OnceLock;

use crate::elf::types::SHN_ABS;
use crate::elf::types::SHN_COMMON;
use crate::elf::types::STT_TLS;
use crate::target::RawSym;
use crate::util::get_or_try_init;
use crate::Addr;
use crate::Result;

use super::ElfSym;
use super::SymMask;
use super::SymOrder;
use super::SymTable;
use super::SymType;


/// A symbol as stored in a [`SymbolTable`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct IndexedSym {
    pub name: Box<str>,
    /// The symbol, with its value relocated.
    pub sym: ElfSym,
}

impl IndexedSym {
    #[inline]
    fn is_code_or_data(&self) -> bool {
        matches!(self.sym.type_(), SymType::Func | SymType::Object)
    }

    /// The key ordering symbols by address, breaking ties by descending
    /// size and then table position.
    #[inline]
    fn addr_key(&self, idx: usize) -> (Addr, Reverse<u64>, usize) {
        (self.sym.st_value, Reverse(self.sym.st_size), idx)
    }
}


/// The searchable form of a single symbol table of an object.
#[derive(Debug)]
pub(crate) struct SymbolTable {
    /// All defined symbols, in table order.
    syms: Box<[IndexedSym]>,
    /// Indices into `syms`, ordered by name.
    by_name: Box<[usize]>,
    /// Indices into `syms`, ordered by address. When sorting is disabled
    /// this is table order.
    by_addr: Box<[usize]>,
    /// For each position in `by_addr`, the largest end address of any
    /// function or data symbol at or before it. Only present if
    /// `by_addr` is sorted.
    max_end: Option<Box<[Addr]>>,
}

impl SymbolTable {
    /// Build the index for a symbol table, relocating symbol values by
    /// `bias`.
    ///
    /// Undefined symbols are dropped. If `sort` is unset, lookups by
    /// address fall back to a linear scan and iteration by address
    /// happens in table order.
    pub(crate) fn new(raw: Vec<RawSym>, bias: Addr, sort: bool) -> Self {
        let syms = raw
            .into_iter()
            .filter(|raw| raw.sym.is_defined())
            .map(|RawSym { name, mut sym }| {
                let absolute = matches!(sym.st_shndx, SHN_ABS | SHN_COMMON);
                if !absolute && sym.st_info & 0xf != STT_TLS {
                    sym.st_value = sym.st_value.wrapping_add(bias);
                }
                IndexedSym { name, sym }
            })
            .collect::<Box<[_]>>();

        let mut by_name = (0..syms.len()).collect::<Box<[_]>>();
        let () = by_name.sort_by(|a, b| syms[*a].name.cmp(&syms[*b].name));

        let mut by_addr = (0..syms.len()).collect::<Box<[_]>>();
        let max_end = if sort {
            let () = by_addr.sort_by_key(|idx| syms[*idx].addr_key(*idx));
            let max_end = by_addr
                .iter()
                .scan(0, |max, idx| {
                    let sym = &syms[*idx];
                    if sym.is_code_or_data() {
                        *max = (*max).max(sym.sym.st_value.saturating_add(sym.sym.st_size));
                    }
                    Some(*max)
                })
                .collect();
            Some(max_end)
        } else {
            None
        };

        Self {
            syms,
            by_name,
            by_addr,
            max_end,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.syms.len()
    }

    /// Find the first symbol (in table order) with the given name that
    /// matches `mask`.
    pub(crate) fn find_by_name(&self, name: &str, mask: SymMask) -> Option<&IndexedSym> {
        let start = self
            .by_name
            .partition_point(|idx| &*self.syms[*idx].name < name);
        self.by_name[start..]
            .iter()
            .map(|idx| &self.syms[*idx])
            .take_while(|sym| &*sym.name == name)
            .find(|sym| mask.matches(&sym.sym))
    }

    /// Find the function or data symbol best describing `addr`.
    ///
    /// A symbol containing the address is preferred, picking the one
    /// starting closest to it and, among those, the smallest. Failing
    /// that, a symbol without size starting closest to the address is
    /// reported.
    pub(crate) fn find_by_addr(&self, addr: Addr) -> Option<&IndexedSym> {
        if let Some(max_end) = &self.max_end {
            self.find_by_addr_sorted(addr, max_end)
        } else {
            self.find_by_addr_linear(addr)
        }
    }

    fn find_by_addr_sorted(&self, addr: Addr, max_end: &[Addr]) -> Option<&IndexedSym> {
        let end = self
            .by_addr
            .partition_point(|idx| self.syms[*idx].sym.st_value <= addr);

        let mut nearest = None;
        for pos in (0..end).rev() {
            // No symbol at or before `pos` reaches `addr` anymore.
            if nearest.is_some() && max_end[pos] <= addr {
                break
            }

            let sym = &self.syms[self.by_addr[pos]];
            if !sym.is_code_or_data() {
                continue
            }
            if sym.sym.contains(addr) {
                return Some(sym)
            }
            if nearest.is_none() {
                nearest = Some(sym);
            }
        }

        nearest.filter(|sym| sym.sym.st_size == 0)
    }

    fn find_by_addr_linear(&self, addr: Addr) -> Option<&IndexedSym> {
        let candidates = || {
            self.syms
                .iter()
                .enumerate()
                .filter(|(_idx, sym)| sym.is_code_or_data() && sym.sym.st_value <= addr)
        };

        let containing = candidates()
            .filter(|(_idx, sym)| sym.sym.contains(addr))
            .max_by_key(|(idx, sym)| sym.addr_key(*idx));
        if let Some((_idx, sym)) = containing {
            return Some(sym)
        }

        candidates()
            .max_by_key(|(idx, sym)| sym.addr_key(*idx))
            .map(|(_idx, sym)| sym)
            .filter(|sym| sym.sym.st_size == 0)
    }

    /// Iterate over all symbols in the given order.
    pub(crate) fn iter(&self, order: SymOrder) -> impl Iterator<Item = &IndexedSym> {
        let indices = match order {
            SymOrder::ByAddress => &self.by_addr,
            SymOrder::ByName => &self.by_name,
        };
        indices.iter().map(|idx| &self.syms[*idx])
    }
}


/// The lazily built symbol tables of a load object.
#[derive(Debug, Default)]
pub(crate) struct SymbolIndex {
    static_: OnceLock<SymbolTable>,
    dynamic: OnceLock<SymbolTable>,
}

impl SymbolIndex {
    /// Retrieve the given symbol table, building it using `load` if it
    /// has not been built yet.
    ///
    /// A failure to load leaves the table unbuilt, so that a later
    /// request tries again.
    pub(crate) fn table<F>(&self, table: SymTable, load: F) -> Result<&SymbolTable>
    where
        F: FnOnce() -> Result<SymbolTable>,
    {
        let cell = match table {
            SymTable::Static => &self.static_,
            SymTable::Dynamic => &self.dynamic,
        };
        get_or_try_init(cell, load)
    }
}
