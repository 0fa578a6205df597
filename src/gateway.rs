//! Retrieval gateway - Submit and redeem operations.
//!
//! The gateway owns the one-time protocol:
//! - submit: persist payload (blob first), then register it under a fresh passkey
//! - redeem: take the entry atomically, read the payload, hand it off
//!
//! Image redemption is two-phase. `redeem_image` returns an `ImageDelivery`;
//! the blob is deleted only when the delivery is confirmed. Dropping an
//! unconfirmed delivery puts the entry back so an aborted transfer never
//! loses the payload.

use crate::config::{Config, RuntimeMode};
use crate::error::VaultError;
use crate::passkey::Passkey;
use crate::storage::{
    BlobFile, BlobLocation, BlobStore, Entry, EntryKind, EntryStore, EntrySummary, ImageRef,
    Occupied, StoredEntry, Take,
};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Fresh passkeys tried before giving up on registration.
const KEY_ATTEMPTS: usize = 4;

/// File name used when an upload carries none.
pub const DEFAULT_IMAGE_NAME: &str = "image";

/// Gateway policy, fixed at startup.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub mode: RuntimeMode,
    pub max_text_bytes: usize,
    pub max_image_bytes: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for GatewaySettings {
    fn from(config: &Config) -> Self {
        Self {
            mode: config.mode,
            max_text_bytes: config.limits.max_text_bytes,
            max_image_bytes: config.limits.max_image_bytes,
        }
    }
}

/// Diagnostic listing of live entries and blob files.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    pub stored_records: Vec<EntrySummary>,
    pub physical_files: Vec<BlobFile>,
}

/// Front door to the store and blob backend. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    store: Arc<EntryStore>,
    blobs: Arc<dyn BlobStore>,
    settings: Arc<GatewaySettings>,
    keygen: fn() -> Passkey,
}

impl Gateway {
    pub fn new(store: Arc<EntryStore>, blobs: Arc<dyn BlobStore>, settings: GatewaySettings) -> Self {
        Self {
            store,
            blobs,
            settings: Arc::new(settings),
            keygen: Passkey::generate,
        }
    }

    /// Replace the passkey source.
    pub fn with_key_generator(mut self, keygen: fn() -> Passkey) -> Self {
        self.keygen = keygen;
        self
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Store text and return its passkey.
    pub fn submit_text(&self, text: &str) -> Result<Passkey, VaultError> {
        if text.is_empty() {
            return Err(VaultError::invalid("No text provided"));
        }
        if text.len() > self.settings.max_text_bytes {
            return Err(VaultError::PayloadTooLarge {
                limit: self.settings.max_text_bytes,
            });
        }

        let key = self.register(Entry::Text(text.to_string()))?;
        info!("[gateway] Stored text ({} bytes) under {}", text.len(), key.redacted());
        Ok(key)
    }

    /// Persist image bytes and return their passkey.
    pub fn submit_image(&self, bytes: &[u8], original_name: &str) -> Result<Passkey, VaultError> {
        if bytes.is_empty() {
            return Err(VaultError::invalid("No image provided"));
        }
        if bytes.len() > self.settings.max_image_bytes {
            return Err(VaultError::PayloadTooLarge {
                limit: self.settings.max_image_bytes,
            });
        }

        let original_name = clean_file_name(original_name);
        let location = self.blobs.write(&original_name, bytes).map_err(|e| {
            error!("[gateway] Blob write failed: {:#}", e);
            VaultError::backend(e)
        })?;

        let image = ImageRef {
            location: location.clone(),
            original_name,
            size: bytes.len() as u64,
            sha256: sha256_hex(bytes),
        };

        match self.register(Entry::Image(image)) {
            Ok(key) => {
                info!(
                    "[gateway] Stored image ({} bytes) as {} under {}",
                    bytes.len(),
                    location,
                    key.redacted()
                );
                Ok(key)
            }
            Err(e) => {
                self.delete_blob(&location);
                Err(e)
            }
        }
    }

    /// Redeem a text passkey. Consumes the entry.
    pub fn redeem_text(&self, passkey: &str) -> Result<String, VaultError> {
        let (key, stored) = self.take(passkey, EntryKind::Text)?;
        let text = match stored.entry {
            Entry::Text(text) => text,
            Entry::Image(_) => return Err(VaultError::NotFound),
        };
        info!("[gateway] Redeemed text {}", key.redacted());
        Ok(text)
    }

    /// Redeem an image passkey.
    ///
    /// The entry leaves the store immediately so concurrent redeems fail, but
    /// the blob stays until `ImageDelivery::confirm`. Read or checksum
    /// failures put the entry back and surface as a backend error.
    pub fn redeem_image(&self, passkey: &str) -> Result<ImageDelivery, VaultError> {
        let (key, stored) = self.take(passkey, EntryKind::Image)?;
        let StoredEntry {
            entry,
            created_at,
            expires_at,
        } = stored;
        let Entry::Image(image) = entry else {
            return Err(VaultError::NotFound);
        };

        let pending = PendingRedeem {
            key,
            image,
            created_at,
            expires_at,
            store: Arc::clone(&self.store),
            blobs: Arc::clone(&self.blobs),
        };

        let bytes = match self.read_verified(&pending.image) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(
                    "[gateway] Cannot read blob {} for {}: {:#}",
                    pending.image.location,
                    pending.key.redacted(),
                    e
                );
                pending.restore();
                return Err(VaultError::backend(e));
            }
        };

        debug!(
            "[gateway] Handing off {} for {}",
            pending.image.location,
            pending.key.redacted()
        );
        Ok(ImageDelivery {
            bytes,
            file_name: pending.image.original_name.clone(),
            pending: Some(pending),
        })
    }

    /// List live entries and blob files. Development mode only.
    pub fn inventory(&self) -> Result<Inventory, VaultError> {
        if !self.settings.mode.is_development() {
            return Err(VaultError::Disabled);
        }

        let physical_files = self.blobs.list().map_err(VaultError::backend)?;
        Ok(Inventory {
            stored_records: self.store.list(),
            physical_files,
        })
    }

    /// Drop expired entries and their blobs. Returns how many entries went.
    pub fn sweep_expired(&self) -> usize {
        let expired = self.store.drain_expired(Utc::now());
        for (key, entry) in &expired {
            debug!("[gateway] Expired {}", key.redacted());
            if let Some(location) = entry.blob() {
                self.delete_blob(location);
            }
        }
        if !expired.is_empty() {
            info!("[gateway] Swept {} expired entries", expired.len());
        }
        expired.len()
    }

    /// Delete blobs no live entry refers to.
    ///
    /// Meant for startup, before any submission can be in flight: a blob is
    /// written before its entry is registered.
    pub fn purge_orphan_blobs(&self) -> Result<usize, VaultError> {
        let referenced = self.store.referenced_blobs();
        let mut purged = 0;

        for file in self.blobs.list().map_err(VaultError::backend)? {
            let location = BlobLocation::new(file.name);
            if referenced.contains(&location) {
                continue;
            }
            match self.blobs.delete(&location) {
                Ok(()) => purged += 1,
                Err(e) => warn!("[gateway] Cannot purge {}: {:#}", location, e),
            }
        }

        if purged > 0 {
            info!("[gateway] Purged {} orphaned blobs", purged);
        }
        Ok(purged)
    }

    /// Register `entry` under a fresh passkey, regenerating on collision.
    fn register(&self, entry: Entry) -> Result<Passkey, VaultError> {
        let mut entry = entry;
        for _ in 0..KEY_ATTEMPTS {
            let key = (self.keygen)();
            match self.store.insert_new(key.clone(), entry) {
                Ok(()) => return Ok(key),
                Err(Occupied(rejected)) => {
                    warn!("[gateway] Passkey collision on {}, regenerating", key.redacted());
                    entry = rejected;
                }
            }
        }
        Err(VaultError::Backend(format!(
            "No free passkey after {} attempts",
            KEY_ATTEMPTS
        )))
    }

    /// Take the entry for `passkey` if it has `kind`. All failure reasons
    /// collapse into `NotFound`.
    fn take(&self, passkey: &str, kind: EntryKind) -> Result<(Passkey, StoredEntry), VaultError> {
        let Some(key) = Passkey::parse(passkey) else {
            debug!("[gateway] Rejected malformed passkey");
            return Err(VaultError::NotFound);
        };

        match self.store.take_if_kind(&key, kind) {
            Take::Taken(stored) => Ok((key, stored)),
            Take::Missing => {
                debug!("[gateway] No entry for {}", key.redacted());
                Err(VaultError::NotFound)
            }
            Take::KindMismatch => {
                debug!("[gateway] {} is not a {} entry", key.redacted(), kind);
                Err(VaultError::NotFound)
            }
            Take::Expired(entry) => {
                debug!("[gateway] {} expired before redemption", key.redacted());
                if let Some(location) = entry.blob() {
                    self.delete_blob(location);
                }
                Err(VaultError::NotFound)
            }
        }
    }

    fn read_verified(&self, image: &ImageRef) -> Result<Vec<u8>> {
        let bytes = self.blobs.read(&image.location)?;
        if bytes.len() as u64 != image.size {
            bail!(
                "Blob {} has {} bytes, expected {}",
                image.location,
                bytes.len(),
                image.size
            );
        }
        if sha256_hex(&bytes) != image.sha256 {
            bail!("Blob {} failed checksum verification", image.location);
        }
        Ok(bytes)
    }

    fn delete_blob(&self, location: &BlobLocation) {
        if let Err(e) = self.blobs.delete(location) {
            warn!("[gateway] Cannot delete blob {}: {:#}", location, e);
        }
    }
}

/// Image bytes on their way to a client.
///
/// Call `confirm` once the bytes are fully handed off. If the delivery is
/// dropped first, the entry returns to the store.
pub struct ImageDelivery {
    bytes: Vec<u8>,
    file_name: String,
    pending: Option<PendingRedeem>,
}

/// A taken image entry, held until the delivery completes or is dropped.
struct PendingRedeem {
    key: Passkey,
    image: ImageRef,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    store: Arc<EntryStore>,
    blobs: Arc<dyn BlobStore>,
}

impl PendingRedeem {
    /// Put the entry back with its original timestamps.
    fn restore(self) {
        let stored = StoredEntry {
            entry: Entry::Image(self.image),
            created_at: self.created_at,
            expires_at: self.expires_at,
        };
        self.store.restore(self.key, stored);
    }
}

impl ImageDelivery {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Move the bytes out, leaving the delivery pending.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }

    /// Name supplied at upload.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Complete the redemption: the blob is deleted.
    ///
    /// The entry is consumed even if the delete fails; the payload was
    /// already delivered, so the error is only reported.
    pub fn confirm(mut self) -> Result<(), VaultError> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let location = &pending.image.location;

        info!(
            "[gateway] Delivered {} for {}",
            location,
            pending.key.redacted()
        );
        pending.blobs.delete(location).map_err(|e| {
            warn!("[gateway] Delivered blob {} not deleted: {:#}", location, e);
            VaultError::backend(e)
        })
    }
}

impl Drop for ImageDelivery {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            warn!(
                "[gateway] Delivery for {} aborted, entry restored",
                pending.key.redacted()
            );
            pending.restore();
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Keep only the final path component of an uploaded name.
fn clean_file_name(raw: &str) -> String {
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>();
    if name.is_empty() || name == "." || name == ".." {
        DEFAULT_IMAGE_NAME.to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskBlobStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn gateway(temp: &TempDir) -> Gateway {
        let blobs = DiskBlobStore::open(temp.path().join("blobs")).unwrap();
        Gateway::new(
            Arc::new(EntryStore::new()),
            Arc::new(blobs),
            GatewaySettings {
                mode: RuntimeMode::Development,
                max_text_bytes: 64,
                max_image_bytes: 64,
            },
        )
    }

    #[test]
    fn test_clean_file_name() {
        assert_eq!(clean_file_name("cat.png"), "cat.png");
        assert_eq!(clean_file_name("C:\\Users\\me\\cat.png"), "cat.png");
        assert_eq!(clean_file_name("../../etc/passwd"), "passwd");
        assert_eq!(clean_file_name("dir/"), DEFAULT_IMAGE_NAME);
        assert_eq!(clean_file_name("  "), DEFAULT_IMAGE_NAME);
        assert_eq!(clean_file_name("a\nb.png"), "ab.png");
    }

    #[test]
    fn test_text_limits() {
        let temp = TempDir::new().unwrap();
        let gw = gateway(&temp);

        assert!(matches!(gw.submit_text(""), Err(VaultError::InvalidInput(_))));
        assert!(matches!(
            gw.submit_text(&"x".repeat(65)),
            Err(VaultError::PayloadTooLarge { limit: 64 })
        ));
        assert!(gw.store().is_empty());

        // Whitespace is content
        assert!(gw.submit_text("  ").is_ok());
    }

    #[test]
    fn test_image_limits_write_nothing() {
        let temp = TempDir::new().unwrap();
        let gw = gateway(&temp);

        assert!(matches!(
            gw.submit_image(b"", "a.png"),
            Err(VaultError::InvalidInput(_))
        ));
        assert!(matches!(
            gw.submit_image(&[0u8; 65], "a.png"),
            Err(VaultError::PayloadTooLarge { .. })
        ));
        assert!(gw.inventory().unwrap().physical_files.is_empty());
    }

    #[test]
    fn test_collision_regenerates() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn colliding() -> Passkey {
            // First two calls return the same key
            let n = CALLS.fetch_add(1, Ordering::SeqCst);
            let byte = if n < 2 { 0 } else { n };
            Passkey::parse(&format!("{:032x}", byte)).unwrap()
        }

        let temp = TempDir::new().unwrap();
        let gw = gateway(&temp).with_key_generator(colliding);

        let first = gw.submit_text("one").unwrap();
        let second = gw.submit_text("two").unwrap();
        assert_ne!(first, second);
        assert_eq!(gw.redeem_text(first.as_str()).unwrap(), "one");
        assert_eq!(gw.redeem_text(second.as_str()).unwrap(), "two");
    }

    #[test]
    fn test_exhausted_key_space_deletes_blob() {
        fn constant() -> Passkey {
            Passkey::parse(&"a".repeat(32)).unwrap()
        }

        let temp = TempDir::new().unwrap();
        let gw = gateway(&temp).with_key_generator(constant);

        gw.submit_text("taken").unwrap();
        let err = gw.submit_image(b"png!", "x.png").unwrap_err();
        assert!(matches!(err, VaultError::Backend(_)));
        assert!(gw.inventory().unwrap().physical_files.is_empty());
    }

    #[test]
    fn test_corrupted_blob_is_backend_error_and_entry_survives() {
        let temp = TempDir::new().unwrap();
        let gw = gateway(&temp);

        let key = gw.submit_image(b"abcd", "x.png").unwrap();
        let blob = gw.inventory().unwrap().physical_files.remove(0);
        std::fs::write(&blob.path, b"abce").unwrap();

        let err = gw.redeem_image(key.as_str()).err().unwrap();
        assert!(matches!(err, VaultError::Backend(_)));
        assert_eq!(gw.store().len(), 1);
    }

    #[test]
    fn test_expired_image_blob_removed_on_redeem() {
        let temp = TempDir::new().unwrap();
        let blobs = DiskBlobStore::open(temp.path().join("blobs")).unwrap();
        let gw = Gateway::new(
            Arc::new(EntryStore::with_ttl(Some(Duration::ZERO))),
            Arc::new(blobs),
            GatewaySettings {
                mode: RuntimeMode::Development,
                ..GatewaySettings::default()
            },
        );

        let key = gw.submit_image(b"old", "old.gif").unwrap();
        assert!(matches!(
            gw.redeem_image(key.as_str()),
            Err(VaultError::NotFound)
        ));
        assert!(gw.inventory().unwrap().physical_files.is_empty());
    }

    #[test]
    fn test_sweep_expired_deletes_blobs() {
        let temp = TempDir::new().unwrap();
        let blobs = DiskBlobStore::open(temp.path().join("blobs")).unwrap();
        let gw = Gateway::new(
            Arc::new(EntryStore::with_ttl(Some(Duration::ZERO))),
            Arc::new(blobs),
            GatewaySettings {
                mode: RuntimeMode::Development,
                ..GatewaySettings::default()
            },
        );

        gw.submit_text("a").unwrap();
        gw.submit_image(b"b", "b.png").unwrap();
        assert_eq!(gw.sweep_expired(), 2);
        let inventory = gw.inventory().unwrap();
        assert!(inventory.stored_records.is_empty());
        assert!(inventory.physical_files.is_empty());
    }

    #[test]
    fn test_purge_keeps_referenced_blobs() {
        let temp = TempDir::new().unwrap();
        let gw = gateway(&temp);

        gw.submit_image(b"keep", "keep.png").unwrap();
        std::fs::write(temp.path().join("blobs").join("blob-0-stale.png"), b"x").unwrap();

        assert_eq!(gw.purge_orphan_blobs().unwrap(), 1);
        let files = gw.inventory().unwrap().physical_files;
        assert_eq!(files.len(), 1);
        assert!(files[0].name.ends_with(".png"));
        assert_ne!(files[0].name, "blob-0-stale.png");
    }

    #[test]
    fn test_dropped_delivery_keeps_timestamps() {
        let temp = TempDir::new().unwrap();
        let gw = gateway(&temp);

        let key = gw.submit_image(b"pic", "p.png").unwrap();
        let before = gw.store().list().remove(0);

        drop(gw.redeem_image(key.as_str()).unwrap());
        let after = gw.store().list().remove(0);
        assert_eq!(after.passkey, key);
        assert_eq!(after.kind, EntryKind::Image);
        assert_eq!(after.path, before.path);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.expires_at, before.expires_at);
    }

    #[test]
    fn test_inventory_disabled_in_production() {
        let temp = TempDir::new().unwrap();
        let blobs = DiskBlobStore::open(temp.path()).unwrap();
        let gw = Gateway::new(
            Arc::new(EntryStore::new()),
            Arc::new(blobs),
            GatewaySettings::default(),
        );
        assert!(matches!(gw.inventory(), Err(VaultError::Disabled)));
    }
}
