//! Core shared types for Quarry.
//!
//! This crate is intentionally small and dependency-light: everything else in
//! the workspace depends on it.

mod change;
mod file;

pub use change::{ChangeKind, FileEvent};
pub use file::{FileId, FileMeta, FileStamp, FileTable};

/// Single source of truth for the Quarry version embedded in persisted
/// artifacts. Any mismatch invalidates the artifact and forces a rebuild.
pub const QUARRY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Byte order of the machine that produced a persisted artifact.
///
/// Archived payloads are not portable across endianness; the storage layer
/// records the producer's byte order and rejects mismatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

#[inline]
pub const fn target_endian() -> Endian {
    if cfg!(target_endian = "big") {
        Endian::Big
    } else {
        Endian::Little
    }
}

/// Pointer width in bits of the machine that produced a persisted artifact.
///
/// `rkyv` archives container lengths as `usize`, so 32-bit and 64-bit
/// archives are mutually incompatible.
#[inline]
pub const fn target_pointer_width() -> u8 {
    (std::mem::size_of::<usize>() * 8) as u8
}
