//! ELF symbol resolution for uprobe placement
//!
//! Uprobes are placed by file offset, not by virtual address, so each
//! matching function symbol is translated through the load segment that
//! contains it.

use crate::error::{GilStatsError, Result};
use object::{Object, ObjectSegment, ObjectSymbol, SymbolKind};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

/// A function in the probed library, addressed by file offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolSite {
    pub name: String,
    pub address: u64,
    pub file_offset: u64,
}

/// Find every defined function in `library` whose name matches `pattern`
///
/// Versioned aliases of one function (e.g. two `sem_wait` versions that
/// share code) are collapsed to one site per address.
pub fn resolve_symbol_sites(library: &Path, pattern: &Regex) -> Result<Vec<SymbolSite>> {
    let elf_err = |detail: String| GilStatsError::ElfParse {
        path: library.to_path_buf(),
        detail,
    };

    let file = File::open(library)?;
    // SAFETY: the mapping is read-only and dropped before returning.
    let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| elf_err(e.to_string()))?;
    let object = object::File::parse(&*mmap).map_err(|e| elf_err(e.to_string()))?;

    let segments: Vec<(u64, u64, u64)> = object
        .segments()
        .map(|segment| {
            let (offset, _) = segment.file_range();
            (segment.address(), segment.size(), offset)
        })
        .collect();

    let mut by_address: BTreeMap<u64, SymbolSite> = BTreeMap::new();
    for symbol in object.symbols().chain(object.dynamic_symbols()) {
        if symbol.is_undefined() || symbol.kind() != SymbolKind::Text || symbol.address() == 0 {
            continue;
        }
        let Ok(name) = symbol.name() else {
            continue;
        };
        if !pattern.is_match(name) {
            continue;
        }
        let Some(file_offset) = file_offset_for(&segments, symbol.address()) else {
            tracing::debug!("{} at {:#x} is outside every load segment", name, symbol.address());
            continue;
        };

        by_address.entry(symbol.address()).or_insert_with(|| SymbolSite {
            name: name.to_string(),
            address: symbol.address(),
            file_offset,
        });
    }

    if by_address.is_empty() {
        return Err(GilStatsError::SymbolNotFound {
            library: library.to_path_buf(),
            pattern: pattern.as_str().to_string(),
        });
    }

    Ok(by_address.into_values().collect())
}

/// Translate a virtual address into a file offset via (vaddr, size, offset) segments
pub fn file_offset_for(segments: &[(u64, u64, u64)], address: u64) -> Option<u64> {
    segments
        .iter()
        .find(|(vaddr, size, _)| {
            address >= *vaddr && vaddr.checked_add(*size).is_some_and(|end| address < end)
        })
        .map(|(vaddr, _, offset)| address - vaddr + offset)
}
