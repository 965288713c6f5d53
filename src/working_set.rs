//! In-memory working set.
//!
//! Per-folder scratch state layered over the persistent store: the last-seen
//! index and thread, plus the `*_queried` sentinels that suppress repeat
//! SELECTs within one session. The working set is a cache of the store,
//! never its source of truth.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::codec::{IndexRow, ThreadRow};
use crate::types::{MessageHeaders, Uid};

/// An index snapshot plus whether it has been checked against live folder
/// status during the current call chain.
#[derive(Debug, Clone)]
pub(crate) struct CachedIndex {
    pub row: IndexRow,
    pub validated: bool,
}

#[derive(Debug, Default)]
pub(crate) struct FolderSlot {
    pub index: Option<CachedIndex>,
    pub thread: Option<ThreadRow>,
    /// The store has been asked for the index row at least once this
    /// session.
    pub index_queried: bool,
    pub thread_queried: bool,
}

#[derive(Debug, Default)]
pub(crate) struct WorkingSet {
    folders: HashMap<String, FolderSlot>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn folder(&self, name: &str) -> Option<&FolderSlot> {
        self.folders.get(name)
    }

    pub fn folder_mut(&mut self, name: &str) -> &mut FolderSlot {
        self.folders.entry(name.to_string()).or_default()
    }

    /// Drop the in-memory index but remember the store was (effectively)
    /// consulted, so the session skips re-reading a row known stale.
    pub fn drop_index(&mut self, name: &str) {
        let slot = self.folder_mut(name);
        slot.index = None;
        slot.index_queried = true;
    }

    pub fn drop_thread(&mut self, name: &str) {
        let slot = self.folder_mut(name);
        slot.thread = None;
        slot.thread_queried = true;
    }

    pub fn drop_all_indexes(&mut self) {
        for slot in self.folders.values_mut() {
            slot.index = None;
            slot.index_queried = true;
        }
    }

    pub fn drop_all_threads(&mut self) {
        for slot in self.folders.values_mut() {
            slot.thread = None;
            slot.thread_queried = true;
        }
    }

    pub fn clear(&mut self) {
        self.folders.clear();
    }
}

/// The one "current message" slot a Cache owns.
///
/// Reads install the most recently fetched message here; flag changes that
/// touch only this message mutate it in place and defer the store write
/// until the slot is displaced or the cache closes. Dirtiness is detected by
/// digest comparison against the last persisted form.
#[derive(Debug, Clone)]
pub(crate) struct CurrentMessage {
    pub folder: String,
    pub uid: Uid,
    pub message: MessageHeaders,
    /// Whether a row for this message existed in the store when the slot was
    /// installed.
    pub existed_in_store: bool,
    digest: String,
}

impl CurrentMessage {
    pub fn new(folder: &str, message: MessageHeaders, existed_in_store: bool) -> Self {
        let digest = message_digest(&message);
        Self {
            folder: folder.to_string(),
            uid: message.uid,
            message,
            existed_in_store,
            digest,
        }
    }

    pub fn matches(&self, folder: &str, uid: Uid) -> bool {
        self.folder == folder && self.uid == uid
    }

    /// Whether the in-memory object has drifted from its last persisted
    /// form.
    pub fn is_dirty(&self) -> bool {
        message_digest(&self.message) != self.digest
    }

    /// Record that the current form has been persisted.
    pub fn mark_clean(&mut self) {
        self.digest = message_digest(&self.message);
        self.existed_in_store = true;
    }
}

/// Content digest of a message object, stable within a session. Flags are
/// part of the hashed form so a flag-only change marks the slot dirty.
fn message_digest(message: &MessageHeaders) -> String {
    let json = serde_json::to_string(message).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}
