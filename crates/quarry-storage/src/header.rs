use byteorder::{ByteOrder, LittleEndian};
use quarry_core::Endian;

use crate::persisted::StorageError;

/// Fixed header size in bytes. The payload starts immediately after.
pub const HEADER_LEN: usize = 64;

const MAGIC: [u8; 4] = *b"QIDX";
const VERSION_FIELD_LEN: usize = 16;

/// What kind of persisted artifact a file contains.
///
/// The tag is stored in the header so opening a file as the wrong artifact
/// fails loudly instead of misinterpreting the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// A full index snapshot (`base.idx`).
    IndexBase,
    /// An incremental delta segment (`segments/seg-NNNNNN.idx`).
    IndexSegment,
}

impl ArtifactKind {
    fn tag(self) -> u16 {
        match self {
            ArtifactKind::IndexBase => 1,
            ArtifactKind::IndexSegment => 2,
        }
    }

    fn from_tag(tag: u16) -> Result<Self, StorageError> {
        match tag {
            1 => Ok(ArtifactKind::IndexBase),
            2 => Ok(ArtifactKind::IndexSegment),
            _ => Err(StorageError::InvalidHeader("unknown artifact kind tag")),
        }
    }
}

/// Whole-payload compression applied after archiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd,
}

impl Compression {
    fn tag(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zstd => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, StorageError> {
        match tag {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Zstd),
            other => Err(StorageError::UnsupportedCompression(other)),
        }
    }
}

/// The fixed-size, little-endian header written in front of every persisted
/// artifact.
///
/// Layout (byte offsets):
/// - `0..4` magic `b"QIDX"`
/// - `4..6` artifact kind tag (u16)
/// - `6` compression tag (u8)
/// - `7` endian tag (u8: 0 = little, 1 = big)
/// - `8` pointer width in bits (u8)
/// - `9..12` reserved, zero
/// - `12..16` schema version (u32)
/// - `16..32` quarry version, zero-padded ASCII
/// - `32..40` payload offset (u64, always `HEADER_LEN`)
/// - `40..48` payload length on disk (u64)
/// - `48..56` uncompressed payload length (u64)
/// - `56..64` blake3 content hash of the uncompressed payload, first 8 bytes
///   as little-endian u64
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageHeader {
    pub kind: ArtifactKind,
    pub schema_version: u32,
    pub quarry_version: String,
    pub endian: Endian,
    pub pointer_width: u8,
    pub compression: Compression,
    pub payload_offset: u64,
    pub payload_len: u64,
    pub uncompressed_len: u64,
    pub content_hash: u64,
}

impl StorageHeader {
    pub fn new(
        kind: ArtifactKind,
        schema_version: u32,
        compression: Compression,
        payload_len: u64,
        uncompressed_len: u64,
        content_hash: u64,
    ) -> Self {
        Self {
            kind,
            schema_version,
            quarry_version: truncated_version(),
            endian: quarry_core::target_endian(),
            pointer_width: quarry_core::target_pointer_width(),
            compression,
            payload_offset: HEADER_LEN as u64,
            payload_len,
            uncompressed_len,
            content_hash,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC);
        LittleEndian::write_u16(&mut out[4..6], self.kind.tag());
        out[6] = self.compression.tag();
        out[7] = match self.endian {
            Endian::Little => 0,
            Endian::Big => 1,
        };
        out[8] = self.pointer_width;
        LittleEndian::write_u32(&mut out[12..16], self.schema_version);

        let version = self.quarry_version.as_bytes();
        let n = version.len().min(VERSION_FIELD_LEN);
        out[16..16 + n].copy_from_slice(&version[..n]);

        LittleEndian::write_u64(&mut out[32..40], self.payload_offset);
        LittleEndian::write_u64(&mut out[40..48], self.payload_len);
        LittleEndian::write_u64(&mut out[48..56], self.uncompressed_len);
        LittleEndian::write_u64(&mut out[56..64], self.content_hash);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        if bytes.len() < HEADER_LEN {
            return Err(StorageError::Truncated {
                expected: HEADER_LEN,
                found: bytes.len(),
            });
        }
        if bytes[0..4] != MAGIC {
            return Err(StorageError::InvalidHeader("bad magic"));
        }

        let kind = ArtifactKind::from_tag(LittleEndian::read_u16(&bytes[4..6]))?;
        let compression = Compression::from_tag(bytes[6])?;
        let endian = match bytes[7] {
            0 => Endian::Little,
            1 => Endian::Big,
            _ => return Err(StorageError::InvalidHeader("unknown endian tag")),
        };
        let pointer_width = bytes[8];
        let schema_version = LittleEndian::read_u32(&bytes[12..16]);

        let version_field = &bytes[16..16 + VERSION_FIELD_LEN];
        let version_len = version_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(VERSION_FIELD_LEN);
        let quarry_version = std::str::from_utf8(&version_field[..version_len])
            .map_err(|_| StorageError::InvalidHeader("non-utf8 version field"))?
            .to_string();

        Ok(Self {
            kind,
            schema_version,
            quarry_version,
            endian,
            pointer_width,
            compression,
            payload_offset: LittleEndian::read_u64(&bytes[32..40]),
            payload_len: LittleEndian::read_u64(&bytes[40..48]),
            uncompressed_len: LittleEndian::read_u64(&bytes[48..56]),
            content_hash: LittleEndian::read_u64(&bytes[56..64]),
        })
    }
}

/// The version string as persisted: truncated to the fixed header field.
///
/// Compatibility checks must compare against this same truncation.
pub(crate) fn truncated_version() -> String {
    let version = quarry_core::QUARRY_VERSION;
    let n = version
        .as_bytes()
        .len()
        .min(VERSION_FIELD_LEN);
    version[..n].to_string()
}
