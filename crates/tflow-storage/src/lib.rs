//! Storage collaborators for the transcoding core.
//!
//! This crate provides:
//! - The `PersistenceStore` interface for session, asset and job records,
//!   including compare-and-swap on job records
//! - The `ObjectStore` interface for assembled assets and outputs
//! - In-memory implementations of both
//! - SHA-256 checksum helpers

pub mod checksum;
pub mod error;
pub mod object_store;
pub mod persistence;

pub use checksum::{checksums_match, sha256_hex};
pub use error::{StorageError, StorageResult};
pub use object_store::{asset_key, output_key, MemoryObjectStore, ObjectMeta, ObjectStore};
pub use persistence::{CasOutcome, MemoryStore, PersistenceStore};
