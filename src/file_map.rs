//! Per-connection virtual address space bookkeeping.
//!
//! Every file a session exposes - a node's `.apx` definition, its `.out`
//! provide-data buffer, or its `.in` require-data buffer - occupies a
//! disjoint, aligned slice of one of two regions. [`FileMap`] hands out
//! addresses in the right region and answers "which file owns this byte"
//! lookups, which happen on every inbound write.

use anyhow::{bail, Result};
use std::cell::Cell;

pub const PORT_DATA_BASE: u32 = 0x0000_0000;
pub const PORT_DATA_END: u32 = 0x03FF_FFFF;
pub const DEFINITION_BASE: u32 = 0x0400_0000;
pub const DEFINITION_END: u32 = 0x7FFF_FFFF;
pub const REMOTE_BIT: u32 = 0x8000_0000;

pub const PORT_DATA_ALIGN: u32 = 1024;
pub const DEFINITION_ALIGN: u32 = 1024 * 1024;

pub const MAX_BASE_NAME_LEN: usize = 252;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    PortData,
    Definition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Definition,
    ProvideData,
    RequireData,
}

impl FileKind {
    pub fn from_name(name: &str) -> Option<Self> {
        if name.ends_with(".apx") {
            Some(FileKind::Definition)
        } else if name.ends_with(".out") {
            Some(FileKind::ProvideData)
        } else if name.ends_with(".in") {
            Some(FileKind::RequireData)
        } else {
            None
        }
    }

    pub fn region(self) -> Region {
        match self {
            FileKind::Definition => Region::Definition,
            FileKind::ProvideData | FileKind::RequireData => Region::PortData,
        }
    }

    fn align(self) -> u32 {
        match self.region() {
            Region::Definition => DEFINITION_ALIGN,
            Region::PortData => PORT_DATA_ALIGN,
        }
    }
}

#[derive(Debug, Clone)]
pub struct File {
    pub name: String,
    pub address: u32,
    pub size: u32,
    pub kind: FileKind,
    pub open: bool,
    pub is_remote: bool,
}

impl File {
    pub fn base_address(&self) -> u32 {
        self.address & !REMOTE_BIT
    }

    pub fn contains(&self, addr: u32) -> bool {
        let base = self.base_address();
        addr >= base && addr < base.saturating_add(self.size)
    }

    pub fn node_name(&self) -> &str {
        let suffix = match self.kind {
            FileKind::Definition => ".apx",
            FileKind::ProvideData => ".out",
            FileKind::RequireData => ".in",
        };
        self.name.strip_suffix(suffix).unwrap_or(&self.name)
    }
}

#[derive(Debug)]
pub enum FileMapError {
    NameTooLong,
    RegionFull,
    Overlap,
    Duplicate,
}

impl std::fmt::Display for FileMapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileMapError::NameTooLong => write!(f, "base name exceeds {MAX_BASE_NAME_LEN} characters"),
            FileMapError::RegionFull => write!(f, "no address range of the requested size is free"),
            FileMapError::Overlap => write!(f, "requested address overlaps an existing file"),
            FileMapError::Duplicate => write!(f, "a file with this name already exists"),
        }
    }
}

impl std::error::Error for FileMapError {}

fn align_up(value: u32, align: u32) -> u32 {
    let value = value.max(1);
    ((value + align - 1) / align) * align
}

fn region_bounds(region: Region) -> (u32, u32) {
    match region {
        Region::PortData => (PORT_DATA_BASE, PORT_DATA_END),
        Region::Definition => (DEFINITION_BASE, DEFINITION_END),
    }
}

/// Tracks the files belonging to one side (local or remote) of one
/// connection's address space.
#[derive(Default)]
pub struct FileMap {
    files: Vec<File>,
    last_hit: Cell<Option<usize>>,
}

impl FileMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> &[File] {
        &self.files
    }

    /// Registers a new file. `address` is required for remote files (the
    /// peer dictates its own addressing); for local files, pass `None` to
    /// have one allocated first-fit within the kind's region.
    pub fn create_file(
        &mut self,
        name: String,
        address: Option<u32>,
        size: u32,
        kind: FileKind,
        is_remote: bool,
    ) -> Result<&File, FileMapError> {
        let base_name = name.rsplit_once('.').map(|(n, _)| n).unwrap_or(&name);
        if base_name.len() > MAX_BASE_NAME_LEN {
            return Err(FileMapError::NameTooLong);
        }
        if self.files.iter().any(|f| f.name == name) {
            return Err(FileMapError::Duplicate);
        }
        let region = kind.region();
        let align = kind.align();
        let aligned_size = align_up(size, align);

        let address = match address {
            Some(addr) => {
                let (base, end) = region_bounds(region);
                let stripped = addr & !REMOTE_BIT;
                if stripped < base || stripped.saturating_add(aligned_size).wrapping_sub(1) > end {
                    return Err(FileMapError::RegionFull);
                }
                if self.overlaps(stripped, aligned_size) {
                    return Err(FileMapError::Overlap);
                }
                addr
            }
            None => self.alloc_address(region, aligned_size)?,
        };

        self.files.push(File {
            name,
            address,
            size,
            kind,
            open: false,
            is_remote,
        });
        self.last_hit.set(None);
        Ok(self.files.last().unwrap())
    }

    fn overlaps(&self, base: u32, aligned_size: u32) -> bool {
        self.files.iter().any(|f| {
            let existing_base = f.base_address();
            let existing_len = align_up(f.size, f.kind.align());
            base < existing_base.saturating_add(existing_len) && existing_base < base.saturating_add(aligned_size)
        })
    }

    fn alloc_address(&self, region: Region, aligned_size: u32) -> Result<u32, FileMapError> {
        let (base, end) = region_bounds(region);
        let align = match region {
            Region::PortData => PORT_DATA_ALIGN,
            Region::Definition => DEFINITION_ALIGN,
        };
        let mut occupied: Vec<(u32, u32)> = self
            .files
            .iter()
            .filter(|f| f.kind.region() == region)
            .map(|f| (f.base_address(), align_up(f.size, align)))
            .collect();
        occupied.sort_unstable();

        let mut candidate = base;
        for (addr, len) in occupied {
            if candidate.saturating_add(aligned_size) <= addr {
                break;
            }
            candidate = addr.saturating_add(len);
        }
        if candidate < base || candidate.saturating_add(aligned_size).saturating_sub(1) > end {
            return Err(FileMapError::RegionFull);
        }
        Ok(candidate)
    }

    pub fn find_by_address(&self, addr: u32) -> Option<&File> {
        if let Some(idx) = self.last_hit.get() {
            if let Some(f) = self.files.get(idx) {
                if f.contains(addr) {
                    return Some(f);
                }
            }
        }
        let idx = self.files.iter().position(|f| f.contains(addr))?;
        self.last_hit.set(Some(idx));
        self.files.get(idx)
    }

    pub fn find_by_address_mut(&mut self, addr: u32) -> Option<&mut File> {
        let idx = self.files.iter().position(|f| f.contains(addr))?;
        self.last_hit.set(Some(idx));
        self.files.get_mut(idx)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&File> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn remove_by_address(&mut self, addr: u32) -> Option<File> {
        let idx = self.files.iter().position(|f| f.contains(addr))?;
        self.last_hit.set(None);
        Some(self.files.remove(idx))
    }
}

pub fn check_base_name_len(base_name: &str) -> Result<()> {
    if base_name.len() > MAX_BASE_NAME_LEN {
        bail!(FileMapError::NameTooLong);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_data_files_round_up_to_1kib_and_dont_overlap() {
        let mut map = FileMap::new();
        let f1 = map
            .create_file("Node1.out".into(), None, 1023, FileKind::ProvideData, false)
            .unwrap();
        assert_eq!(f1.address, 0);
        let f2 = map
            .create_file("Node1.in".into(), None, 10, FileKind::RequireData, false)
            .unwrap();
        assert_eq!(f2.address, PORT_DATA_ALIGN);
    }

    #[test]
    fn definition_files_round_up_to_1mib() {
        let mut map = FileMap::new();
        map.create_file("Node1.apx".into(), None, 100, FileKind::Definition, false)
            .unwrap();
        let f2 = map
            .create_file("Node2.apx".into(), None, 1, FileKind::Definition, false)
            .unwrap();
        assert_eq!(f2.address, DEFINITION_BASE + DEFINITION_ALIGN);
    }

    #[test]
    fn exact_alignment_boundary_definition_file_is_accepted() {
        let mut map = FileMap::new();
        let f = map
            .create_file("Big.apx".into(), None, 64 * 1024 * 1024, FileKind::Definition, false)
            .unwrap();
        assert_eq!(f.size, 64 * 1024 * 1024);
    }

    #[test]
    fn overlong_base_name_is_rejected() {
        let mut map = FileMap::new();
        let name = format!("{}.apx", "N".repeat(MAX_BASE_NAME_LEN + 1));
        let err = map
            .create_file(name, None, 10, FileKind::Definition, false)
            .unwrap_err();
        assert!(matches!(err, FileMapError::NameTooLong));
    }

    #[test]
    fn overlapping_remote_address_is_rejected() {
        let mut map = FileMap::new();
        map.create_file("A.out".into(), Some(0), 100, FileKind::ProvideData, true)
            .unwrap();
        let err = map
            .create_file("B.out".into(), Some(50), 100, FileKind::ProvideData, true)
            .unwrap_err();
        assert!(matches!(err, FileMapError::Overlap));
    }

    #[test]
    fn find_by_address_caches_last_hit() {
        let mut map = FileMap::new();
        map.create_file("A.out".into(), None, 10, FileKind::ProvideData, false)
            .unwrap();
        assert!(map.find_by_address(5).is_some());
        assert!(map.find_by_address(5).is_some());
    }
}
