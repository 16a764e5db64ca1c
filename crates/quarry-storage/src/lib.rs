//! Memory-mapped, zero-copy storage backend for Quarry's persisted index
//! artifacts.
//!
//! ## Format
//! Each persisted artifact is stored as:
//! - a fixed-size header (64 bytes, little-endian)
//! - a payload containing an `rkyv` archived root object
//!
//! The header embeds:
//! - artifact kind and schema version
//! - Quarry version
//! - endianness and pointer-width compatibility checks
//! - compression flag (currently whole-payload zstd or none)
//! - a blake3 hash of the uncompressed payload
//!
//! ## Compatibility limitations
//! `rkyv` archives are not portable across:
//! - endianness (little vs big)
//! - pointer width (32-bit vs 64-bit) because container lengths are archived
//!   as `usize`.
//!
//! Quarry detects these mismatches and treats the artifact as incompatible,
//! which the index layer answers with a rebuild rather than a migration.

mod header;
mod persisted;
mod write;

pub use header::{ArtifactKind, Compression, StorageHeader, HEADER_LEN};
pub use persisted::{CheckableArchived, PersistedArchive, StorageError};
pub use write::write_archive_atomic;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
    #[archive(check_bytes)]
    struct Sample {
        a: u32,
        b: String,
        values: Vec<u64>,
    }

    #[test]
    fn round_trip_uncompressed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sample.idx");

        let value = Sample {
            a: 42,
            b: "hello".to_string(),
            values: vec![1, 2, 3, 4],
        };

        write_archive_atomic(&path, ArtifactKind::IndexBase, 1, &value, Compression::None)
            .unwrap();

        let loaded = PersistedArchive::<Sample>::open(&path, ArtifactKind::IndexBase, 1).unwrap();
        assert_eq!(loaded.header().schema_version, 1);
        assert_eq!(loaded.to_owned().unwrap(), value);
    }

    #[test]
    fn round_trip_zstd() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sample.idx");

        let value = Sample {
            a: 7,
            b: "compressed".repeat(100),
            values: (0..512).collect(),
        };

        write_archive_atomic(&path, ArtifactKind::IndexBase, 3, &value, Compression::Zstd)
            .unwrap();

        let loaded = PersistedArchive::<Sample>::open(&path, ArtifactKind::IndexBase, 3).unwrap();
        assert_eq!(loaded.to_owned().unwrap(), value);
    }

    #[test]
    fn wrong_kind_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sample.idx");

        let value = Sample {
            a: 1,
            b: "x".to_string(),
            values: vec![],
        };
        write_archive_atomic(&path, ArtifactKind::IndexBase, 1, &value, Compression::None)
            .unwrap();

        let err =
            PersistedArchive::<Sample>::open(&path, ArtifactKind::IndexSegment, 1).unwrap_err();
        assert!(matches!(err, StorageError::WrongArtifact { .. }));
    }

    #[test]
    fn wrong_schema_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sample.idx");

        let value = Sample {
            a: 1,
            b: "x".to_string(),
            values: vec![],
        };
        write_archive_atomic(&path, ArtifactKind::IndexBase, 1, &value, Compression::None)
            .unwrap();

        let err = PersistedArchive::<Sample>::open(&path, ArtifactKind::IndexBase, 2).unwrap_err();
        match err {
            StorageError::WrongSchema { expected, found } => {
                assert_eq!(expected, 2);
                assert_eq!(found, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn truncated_file_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sample.idx");

        let value = Sample {
            a: 1,
            b: "x".to_string(),
            values: vec![9],
        };

        write_archive_atomic(&path, ArtifactKind::IndexBase, 1, &value, Compression::None)
            .unwrap();

        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len((HEADER_LEN - 1) as u64).unwrap();

        let err = PersistedArchive::<Sample>::open(&path, ArtifactKind::IndexBase, 1).unwrap_err();
        match err {
            StorageError::Truncated { .. } => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn corrupted_payload_is_hash_mismatch() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sample.idx");

        let value = Sample {
            a: 123,
            b: "hello".to_string(),
            values: vec![1, 2, 3, 4],
        };

        write_archive_atomic(&path, ArtifactKind::IndexBase, 1, &value, Compression::None)
            .unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        assert!(bytes.len() > HEADER_LEN);

        // Corrupt a byte in a `u64` element. `rkyv` validation still accepts
        // the payload (any bit pattern is a valid u64); the content hash is
        // what reliably detects this class of damage.
        let payload = &bytes[HEADER_LEN..];
        let mut aligned = rkyv::util::AlignedVec::with_capacity(payload.len());
        aligned.extend_from_slice(payload);
        let archived = rkyv::check_archived_root::<Sample>(&aligned).unwrap();

        let element_ptr = &archived.values[0] as *const u64 as *const u8;
        let payload_ptr = aligned.as_ptr();
        let offset = unsafe { element_ptr.offset_from(payload_ptr) as usize };
        bytes[HEADER_LEN + offset] ^= 0x01;

        std::fs::write(&path, &bytes).unwrap();

        let err = PersistedArchive::<Sample>::open(&path, ArtifactKind::IndexBase, 1).unwrap_err();
        match err {
            StorageError::HashMismatch { expected, found } => {
                assert_ne!(expected, found);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn corruption_classification() {
        let io = StorageError::Io(std::io::Error::other("disk on fire"));
        assert!(!io.is_corruption());
        assert!(StorageError::HashMismatch {
            expected: 1,
            found: 2
        }
        .is_corruption());
        assert!(StorageError::WrongSchema {
            expected: 1,
            found: 2
        }
        .is_corruption());
    }
}
