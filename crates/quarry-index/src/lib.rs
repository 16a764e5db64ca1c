//! The incremental file-based symbol index engine.
//!
//! Language plugins register indexes — `{id, extractor version, applicability
//! filter, extract fn}` — and the engine handles the rest: content-addressed
//! change detection, durable key → (file, payload) storage with append-only
//! delta segments, version-gated rebuilds, and a concurrency-safe query
//! surface that catches an index up before answering.
//!
//! The host supplies file identity, enumeration, change notifications, and
//! content access ([`ContentSource`]); the engine never walks the file
//! system itself.

mod catalog;
mod definition;
mod engine;
mod error;
mod query;
mod recovery;
mod scheduler;
mod segments;
mod source;
mod store;

pub use catalog::IndexState;
pub use definition::{
    extension_filter, ExtractFn, Extraction, Fact, FileFilter, IndexDefinition, IndexId, Payload,
};
pub use engine::{EngineConfig, IndexEngine};
pub use error::IndexError;
pub use query::Scope;
pub use recovery::{RebuildReason, SoftFailureReport};
pub use scheduler::UpdatePolicy;
pub use source::{ContentSource, FileContent, MemorySource};
pub use store::{IndexStore, OpenOutcome, PutOutcome};
