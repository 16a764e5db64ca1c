//! Durable-store plumbing for Quarry: content fingerprints, the on-disk
//! store layout, and the cross-process store lock.

mod error;
mod fingerprint;
mod lock;
mod store_dir;

pub use error::{sanitize_json_error_message, CacheError};
pub use fingerprint::{is_changed, ArchivedFingerprint, Fingerprint, FingerprintMode};
pub use lock::StoreLock;
pub use store_dir::StoreDir;
