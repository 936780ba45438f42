//! In-memory lock registry.
//!
//! Maps a lock key to the metadata of the connection holding it. At most one
//! entry exists per key. The registry is owned by the event loop and only
//! ever touched from that thread, so it carries no internal locking.
//!
//! Keys and versions are raw bytes; two keys are the same lock only if they
//! are byte-for-byte equal.

use bytes::Bytes;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::fmt;
use tracing::trace;

/// Format used when a lock's acquisition time is shown to clients.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Identity of the client acquiring a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    /// Peer address rendered as `ip:port`.
    pub addr: String,
    /// Version line the client sent when it connected.
    pub protocol_version: Bytes,
}

/// A single held lock.
#[derive(Debug, Clone)]
pub struct LockEntry {
    pub key: Bytes,
    pub holder: String,
    pub protocol_version: Bytes,
    pub acquired_at: DateTime<Local>,
}

impl LockEntry {
    /// Acquisition time as shown in replies.
    pub fn timestamp(&self) -> impl fmt::Display + '_ {
        self.acquired_at.format(TIMESTAMP_FORMAT)
    }
}

/// Result of trying to take a lock.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireResult {
    Acquired,
    /// Someone (possibly the caller) already holds the key.
    Conflict,
}

#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: HashMap<Bytes, LockEntry>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a lock for `key` unless one already exists.
    ///
    /// Empty keys must be rejected by the caller before reaching here.
    pub fn acquire(&mut self, key: &[u8], holder: &Holder) -> AcquireResult {
        if self.locks.contains_key(key) {
            return AcquireResult::Conflict;
        }

        let key = Bytes::copy_from_slice(key);
        self.locks.insert(
            key.clone(),
            LockEntry {
                key: key.clone(),
                holder: holder.addr.clone(),
                protocol_version: holder.protocol_version.clone(),
                acquired_at: Local::now(),
            },
        );
        trace!(
            key = %String::from_utf8_lossy(&key),
            holder = %holder.addr,
            locks = self.locks.len(),
            "Lock inserted"
        );
        AcquireResult::Acquired
    }

    /// Remove the entry for `key`, returning it if it existed.
    ///
    /// Callers only release keys they are known to hold.
    pub fn release(&mut self, key: &[u8]) -> Option<LockEntry> {
        let entry = self.locks.remove(key);
        if entry.is_some() {
            trace!(
                key = %String::from_utf8_lossy(key),
                locks = self.locks.len(),
                "Lock removed"
            );
        }
        entry
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&LockEntry> {
        self.locks.get(key)
    }

    /// All current locks, in no particular order.
    pub fn snapshot(&self) -> Vec<&LockEntry> {
        self.locks.values().collect()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
