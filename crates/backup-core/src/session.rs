use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StorageError;

/// Upper bound on adapter metadata entries kept in a session.
pub const MAX_SESSION_METADATA: usize = 32;

/// Identity of a transfer session: one logical file of one job at one destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub job_id: String,
    pub destination_id: String,
    pub file: String,
}

impl SessionKey {
    pub fn new(
        job_id: impl Into<String>,
        destination_id: impl Into<String>,
        file: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            destination_id: destination_id.into(),
            file: file.into(),
        }
    }
}

/// Destination-side handle for an in-progress transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationToken {
    /// Adapter-specific handle (upload session URI, multipart upload id, partial file name)
    pub handle: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ContinuationToken {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            expires_at: None,
        }
    }

    pub fn expiring(handle: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            handle: handle.into(),
            expires_at: Some(expires_at),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Durable state of one resumable transfer.
///
/// A session without a token means "start fresh": adapters establish a new
/// continuation token on the first chunk and ignore any stale offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSession {
    pub key: SessionKey,
    /// Bytes the destination is known to hold
    pub bytes_transferred: u64,
    /// Size of the file being transferred
    pub total_size: u64,
    #[serde(default)]
    pub token: Option<ContinuationToken>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Times the offset was corrected from the destination's authoritative view
    #[serde(default)]
    pub resync_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferSession {
    pub fn new(key: SessionKey, total_size: u64, now: DateTime<Utc>) -> Self {
        Self {
            key,
            bytes_transferred: 0,
            total_size,
            token: None,
            metadata: BTreeMap::new(),
            resync_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.token.is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_transferred >= self.total_size
    }

    pub fn remaining(&self) -> u64 {
        self.total_size.saturating_sub(self.bytes_transferred)
    }

    /// Install a new continuation token. The transfer restarts at zero.
    pub fn establish(&mut self, token: ContinuationToken) {
        self.token = Some(token);
        self.bytes_transferred = 0;
        self.metadata.clear();
        self.updated_at = Utc::now();
    }

    /// Record `n` more bytes accepted by the destination.
    pub fn advance(&mut self, n: u64) {
        self.bytes_transferred = self.bytes_transferred.saturating_add(n);
        self.updated_at = Utc::now();
    }

    /// Replace the offset with the destination's authoritative value.
    pub fn resync(&mut self, authoritative: u64) {
        if authoritative != self.bytes_transferred {
            warn!(
                job = %self.key.job_id,
                destination = %self.key.destination_id,
                "Resynchronizing {} from {} to {} bytes",
                self.key.file,
                self.bytes_transferred,
                authoritative
            );
            self.bytes_transferred = authoritative;
            self.resync_count += 1;
            self.updated_at = Utc::now();
        }
    }

    /// Drop the continuation token and all progress.
    pub fn reset(&mut self) {
        self.token = None;
        self.bytes_transferred = 0;
        self.metadata.clear();
        self.updated_at = Utc::now();
    }

    pub fn token_expired(&self, now: DateTime<Utc>) -> bool {
        self.token.as_ref().is_some_and(|t| t.is_expired(now))
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set_meta(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), StorageError> {
        let key = key.into();
        if !self.metadata.contains_key(&key) && self.metadata.len() >= MAX_SESSION_METADATA {
            return Err(StorageError::InvalidArgument(format!(
                "session metadata is limited to {} entries",
                MAX_SESSION_METADATA
            )));
        }
        self.metadata.insert(key, value.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> TransferSession {
        TransferSession::new(SessionKey::new("j1", "d1", "a.tar"), 100, Utc::now())
    }

    #[test]
    fn test_establish_resets_progress() {
        let mut s = session();
        s.advance(40);
        s.establish(ContinuationToken::new("upload-1"));
        assert_eq!(s.bytes_transferred, 0);
        assert!(!s.is_fresh());
    }

    #[test]
    fn test_resync_counts_only_changes() {
        let mut s = session();
        s.establish(ContinuationToken::new("upload-1"));
        s.advance(60);
        s.resync(60);
        assert_eq!(s.resync_count, 0);
        s.resync(50);
        assert_eq!(s.bytes_transferred, 50);
        assert_eq!(s.resync_count, 1);
        assert_eq!(s.remaining(), 50);
    }

    #[test]
    fn test_token_expiry() {
        let now = Utc::now();
        let mut s = session();
        assert!(!s.token_expired(now));
        s.establish(ContinuationToken::expiring("u", now - chrono::Duration::seconds(1)));
        assert!(s.token_expired(now));
    }

    #[test]
    fn test_metadata_is_bounded() {
        let mut s = session();
        for i in 0..MAX_SESSION_METADATA {
            s.set_meta(format!("k{}", i), "v").unwrap();
        }
        assert!(s.set_meta("overflow", "v").is_err());
        // Overwriting an existing key is still allowed
        s.set_meta("k0", "w").unwrap();
        assert_eq!(s.meta("k0"), Some("w"));
    }
}
