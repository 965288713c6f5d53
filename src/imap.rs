//! The IMAP client seam.
//!
//! The cache never speaks the wire protocol itself; it consumes a connected
//! client through this trait. Connection pooling, command serialization and
//! response parsing all live behind it.

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::error::CacheError;
use crate::types::{MessageHeaders, MessageIndex, SortField, SortOrder, ThreadTree, Uid};

/// Snapshot of a folder's state as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderStatus {
    pub uidvalidity: Option<u32>,
    pub exists: u32,
    pub uidnext: Option<u32>,
    pub highestmodseq: Option<u64>,
    /// Server refused MODSEQ tracking for this folder (NOMODSEQ response).
    pub nomodseq: bool,
    /// UIDs of undeleted messages, when the server reported them alongside
    /// the status (sorted ascending).
    pub undeleted: Option<Vec<Uid>>,
}

/// One message's flags as returned by a CHANGEDSINCE fetch.
///
/// Flag names are the registry's canonical names (`SEEN`, `DELETED`, ...);
/// the client strips the protocol's backslash prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagChange {
    pub uid: Uid,
    pub flags: BTreeSet<String>,
}

/// Result of a `FETCH (FLAGS) CHANGEDSINCE` round-trip, with the VANISHED
/// piggyback when QRESYNC was in effect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagDelta {
    pub changes: Vec<FlagChange>,
    pub vanished: Vec<Uid>,
}

/// Operations the cache needs from an IMAP client.
#[async_trait]
pub trait ImapClient {
    /// Fetch the folder's current status (SELECT/STATUS as the client sees
    /// fit). The `undeleted` set is optional and server-dependent.
    async fn folder_status(&mut self, folder: &str) -> Result<FolderStatus, CacheError>;

    /// Server-side SORT: the folder's UIDs under the given field and order.
    async fn fetch_index(
        &mut self,
        folder: &str,
        sort_field: SortField,
        order: SortOrder,
    ) -> Result<MessageIndex, CacheError>;

    /// Server-side THREAD: the folder's conversation trees.
    async fn fetch_threads(&mut self, folder: &str) -> Result<ThreadTree, CacheError>;

    /// Fetch header/structure objects for the given UIDs.
    async fn fetch_headers(
        &mut self,
        folder: &str,
        uids: &[Uid],
    ) -> Result<Vec<MessageHeaders>, CacheError>;

    /// One-shot `SEARCH ALL UNDELETED NOT UID <known>`: undeleted UIDs the
    /// cache does not know about.
    async fn search_missing_undeleted(
        &mut self,
        folder: &str,
        known: &[Uid],
    ) -> Result<Vec<Uid>, CacheError>;

    /// Resolve a message sequence number to its UID.
    async fn seqno_to_uid(&mut self, folder: &str, seqno: u32) -> Result<Option<Uid>, CacheError>;

    /// `UID FETCH <uids> (FLAGS) (CHANGEDSINCE <modseq>)`, requesting
    /// VANISHED responses when `vanished` is set (QRESYNC only).
    async fn fetch_flags_changed(
        &mut self,
        folder: &str,
        uids: &[Uid],
        since_modseq: u64,
        vanished: bool,
    ) -> Result<FlagDelta, CacheError>;

    /// Whether the server advertised the given capability.
    fn has_capability(&self, name: &str) -> bool;

    /// Verify the connection is alive, reconnecting if the client supports
    /// it.
    async fn check_connection(&mut self) -> Result<(), CacheError>;

    /// Issue ENABLE for the given extension.
    async fn enable(&mut self, capability: &str) -> Result<(), CacheError>;

    /// The folder currently selected on the connection, if any.
    fn selected_folder(&self) -> Option<String>;

    /// Close the selected folder so the next SELECT reports fresh state.
    async fn unselect(&mut self, folder: &str) -> Result<(), CacheError>;
}
