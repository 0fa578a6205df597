//! Storage module - Passkey index and payload backends.
//!
//! This module contains:
//! - Entry records (text inline, image as blob reference)
//! - EntryStore, the mutex-guarded passkey index
//! - BlobStore trait and the on-disk backend

pub mod blob;
pub mod entry;
pub mod entry_store;

pub use blob::{BlobFile, BlobStore, DiskBlobStore};
pub use entry::{BlobLocation, Entry, EntryKind, EntrySummary, ImageRef, StoredEntry};
pub use entry_store::{EntryStore, Occupied, Take};
