//! Bounded on-disk store for messages the broker has not taken
//!
//! One file per message, named so that lexical order is arrival order.
//! Once `max_keys` files exist new messages are dropped with a warning.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

const MESSAGE_SUFFIX: &str = ".msg.json";

/// A stored message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub topic: String,
    /// Signed envelope as published
    pub payload: String,
}

pub struct Outbox {
    dir: PathBuf,
    max_keys: usize,
    sequence: AtomicU64,
    lock: Mutex<()>,
}

impl Outbox {
    pub fn open(dir: impl Into<PathBuf>, max_keys: usize) -> StoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| io_error(&dir, source))?;
        let outbox = Self {
            dir,
            max_keys,
            sequence: AtomicU64::new(0),
            lock: Mutex::new(()),
        };
        debug!(dir = %outbox.dir.display(), pending = outbox.keys()?.len(), "Outbox opened");
        Ok(outbox)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a message; false when the key limit dropped it
    pub fn store(&self, topic: &str, payload: &[u8], timestamp_millis: i64) -> StoreResult<bool> {
        let _guard = self.lock.lock();
        let count = self.keys()?.len();
        if count >= self.max_keys {
            warn!(topic, limit = self.max_keys, "Outbox full, dropping message");
            return Ok(false);
        }

        let message = OutboxMessage {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        };
        let bytes = serde_json::to_vec(&message).map_err(|source| StoreError::Serialize {
            kind: "outbox message",
            source,
        })?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let key = format!(
            "{:016}-{:08}-{}{}",
            timestamp_millis.max(0),
            sequence,
            uuid::Uuid::new_v4().simple(),
            MESSAGE_SUFFIX
        );
        let path = self.dir.join(&key);

        let mut file = NamedTempFile::new_in(&self.dir).map_err(|e| io_error(&path, e))?;
        file.write_all(&bytes).map_err(|e| io_error(&path, e))?;
        file.persist(&path).map_err(|e| io_error(&path, e.error))?;
        debug!(topic, key = %key, "Message stored in outbox");
        Ok(true)
    }

    /// Stored messages, oldest first. Unreadable files are skipped.
    pub fn pending(&self) -> StoreResult<Vec<(String, OutboxMessage)>> {
        let _guard = self.lock.lock();
        let mut messages = Vec::new();
        for key in self.keys()? {
            let path = self.dir.join(&key);
            let bytes = std::fs::read(&path).map_err(|e| io_error(&path, e))?;
            match serde_json::from_slice(&bytes) {
                Ok(message) => messages.push((key, message)),
                Err(e) => warn!(key = %key, error = %e, "Skipping corrupt outbox entry"),
            }
        }
        Ok(messages)
    }

    pub fn remove(&self, key: &str) -> StoreResult<()> {
        let _guard = self.lock.lock();
        let path = self.dir.join(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    pub fn len(&self) -> StoreResult<usize> {
        let _guard = self.lock.lock();
        Ok(self.keys()?.len())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        let mut keys: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(MESSAGE_SUFFIX))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_store_pending_remove() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = Outbox::open(dir.path(), 10).unwrap();

        assert!(outbox.store("devices/status", br#"{"n":1}"#, 2_000).unwrap());
        assert!(outbox.store("devices/logs", br#"{"n":2}"#, 1_000).unwrap());
        assert!(outbox.store("devices/status", br#"{"n":3}"#, 2_000).unwrap());

        let pending = outbox.pending().unwrap();
        let payloads: Vec<_> = pending.iter().map(|(_, m)| m.payload.as_str()).collect();
        assert_eq!(payloads, vec![r#"{"n":2}"#, r#"{"n":1}"#, r#"{"n":3}"#]);
        assert_eq!(pending[0].1.topic, "devices/logs");

        outbox.remove(&pending[0].0).unwrap();
        assert_eq!(outbox.len().unwrap(), 2);
        // Removing twice is harmless
        outbox.remove(&pending[0].0).unwrap();
    }

    #[test]
    fn test_key_limit_drops_new_messages() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = Outbox::open(dir.path(), 2).unwrap();

        assert!(outbox.store("t", b"1", 1).unwrap());
        assert!(outbox.store("t", b"2", 2).unwrap());
        assert!(!outbox.store("t", b"3", 3).unwrap());

        let payloads: Vec<_> = outbox.pending().unwrap().into_iter().map(|(_, m)| m.payload).collect();
        assert_eq!(payloads, vec!["1", "2"]);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        Outbox::open(dir.path(), 10).unwrap().store("t", b"kept", 5).unwrap();

        let reopened = Outbox::open(dir.path(), 10).unwrap();
        assert_eq!(reopened.pending().unwrap()[0].1.payload, "kept");
    }
}
