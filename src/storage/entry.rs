//! Entry records held by the store.

use crate::passkey::Passkey;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Payload kind. Redemption must name the kind it expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Text,
    Image,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Image => f.write_str("image"),
        }
    }
}

/// Name of a blob inside the blob backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BlobLocation(String);

impl BlobLocation {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to an image persisted in the blob backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub location: BlobLocation,
    /// File name supplied at upload, echoed back as a download hint
    pub original_name: String,
    pub size: u64,
    /// Hex SHA-256 of the bytes written
    pub sha256: String,
}

/// Tagged payload record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Text(String),
    Image(ImageRef),
}

impl Entry {
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::Text(_) => EntryKind::Text,
            Self::Image(_) => EntryKind::Image,
        }
    }

    /// Blob backing this entry, if any.
    pub fn blob(&self) -> Option<&BlobLocation> {
        match self {
            Self::Text(_) => None,
            Self::Image(image) => Some(&image.location),
        }
    }

    /// Where the payload lives, for diagnostics.
    pub fn location_hint(&self) -> String {
        match self.blob() {
            Some(location) => location.to_string(),
            None => "text-data".to_string(),
        }
    }
}

/// Entry plus bookkeeping, as kept in the store.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub entry: Entry,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// One row of the diagnostic listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySummary {
    pub passkey: Passkey,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_location_hint() {
        let text = Entry::Text("hi".into());
        assert_eq!(text.location_hint(), "text-data");
        assert_eq!(text.kind(), EntryKind::Text);

        let image = Entry::Image(ImageRef {
            location: BlobLocation::new("blob-1-abc.png"),
            original_name: "cat.png".into(),
            size: 3,
            sha256: String::new(),
        });
        assert_eq!(image.location_hint(), "blob-1-abc.png");
        assert_eq!(image.kind(), EntryKind::Image);
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let stored = StoredEntry {
            entry: Entry::Text("x".into()),
            created_at: now,
            expires_at: Some(now + Duration::seconds(10)),
        };
        assert!(!stored.is_expired(now));
        assert!(stored.is_expired(now + Duration::seconds(10)));

        let forever = StoredEntry {
            expires_at: None,
            ..stored
        };
        assert!(!forever.is_expired(now + Duration::days(3650)));
    }
}
