//! Blob backends - Durable storage for image payloads.
//!
//! Blobs are addressed by generated names, never by passkey. The store only
//! keeps the name; the backend owns the bytes.

use super::entry::BlobLocation;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Prefix of every generated blob name.
pub const BLOB_PREFIX: &str = "blob-";

/// Attempts at finding a free name before giving up.
const NAME_ATTEMPTS: usize = 3;

/// A file present in the backend.
#[derive(Debug, Clone, Serialize)]
pub struct BlobFile {
    pub name: String,
    pub path: String,
}

/// Trait for all blob backends.
pub trait BlobStore: Send + Sync {
    /// Backend name (disk, ...)
    fn name(&self) -> &'static str;

    /// Persist bytes under a fresh name derived from `original_name`.
    fn write(&self, original_name: &str, bytes: &[u8]) -> Result<BlobLocation>;

    /// Read a blob back in full.
    fn read(&self, location: &BlobLocation) -> Result<Vec<u8>>;

    /// Delete a blob. Deleting a missing blob is not an error.
    fn delete(&self, location: &BlobLocation) -> Result<()>;

    /// Enumerate stored blobs.
    fn list(&self) -> Result<Vec<BlobFile>>;
}

/// Build a storage name: `blob-<unix millis>-<random suffix><.ext>`.
pub fn storage_name(original_name: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..12];
    format!("{}{}-{}{}", BLOB_PREFIX, millis, suffix, extension_of(original_name))
}

/// Extension of `original_name` including the dot, or empty.
/// Only short alphanumeric extensions survive.
fn extension_of(original_name: &str) -> String {
    Path::new(original_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 10)
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default()
}

/// Blob backend on the local file system.
pub struct DiskBlobStore {
    root: PathBuf,
}

impl DiskBlobStore {
    /// Open the backend, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Cannot create blob directory: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a name to a path, refusing anything that could leave `root`.
    fn resolve(&self, location: &BlobLocation) -> Result<PathBuf> {
        let name = location.as_str();
        if name.is_empty()
            || name.starts_with('.')
            || name.contains(['/', '\\'])
            || !name.starts_with(BLOB_PREFIX)
        {
            bail!("Invalid blob name: {:?}", name);
        }
        Ok(self.root.join(name))
    }
}

impl BlobStore for DiskBlobStore {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn write(&self, original_name: &str, bytes: &[u8]) -> Result<BlobLocation> {
        for _ in 0..NAME_ATTEMPTS {
            let location = BlobLocation::new(storage_name(original_name));
            let path = self.resolve(&location)?;

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Cannot create blob: {}", path.display()))
                }
            };

            let written = file.write_all(bytes).and_then(|_| file.sync_all());
            if let Err(e) = written {
                let _ = fs::remove_file(&path);
                return Err(e).with_context(|| format!("Cannot write blob: {}", path.display()));
            }

            tracing::debug!("[blob] Wrote {} bytes to {}", bytes.len(), location);
            return Ok(location);
        }

        bail!("No free blob name after {} attempts", NAME_ATTEMPTS)
    }

    fn read(&self, location: &BlobLocation) -> Result<Vec<u8>> {
        let path = self.resolve(location)?;
        fs::read(&path).with_context(|| format!("Cannot read blob: {}", path.display()))
    }

    fn delete(&self, location: &BlobLocation) -> Result<()> {
        let path = self.resolve(location)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("[blob] Deleted {}", location);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Cannot delete blob: {}", path.display())),
        }
    }

    fn list(&self) -> Result<Vec<BlobFile>> {
        let mut files = Vec::new();
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Cannot list blob directory: {}", self.root.display()))?;

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            files.push(BlobFile {
                path: entry.path().to_string_lossy().to_string(),
                name,
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}
