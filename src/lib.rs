//! Passdrop Library
//!
//! Ephemeral drop box for text and images. Each submission returns a random
//! passkey; redeeming the passkey hands the payload back exactly once and
//! removes it from the store.
//!
//! - `gateway`: submit/redeem operations and their one-time semantics
//! - `storage`: in-memory entry store and on-disk image blobs
//! - `server`: HTTP binding over hyper
//!
//! Nothing is persisted across restarts except orphaned blob files, which are
//! purged on the next start.

pub mod config;
pub mod error;
pub mod gateway;
pub mod passkey;
pub mod rate_limit;
pub mod server;
pub mod storage;

// Re-export main types
pub use config::{Config, RuntimeMode};
pub use error::{VaultError, NOT_FOUND_MESSAGE};
pub use gateway::{Gateway, GatewaySettings, ImageDelivery, Inventory};
pub use passkey::Passkey;
pub use rate_limit::RateLimiter;
pub use storage::{BlobStore, DiskBlobStore, Entry, EntryKind, EntryStore};
