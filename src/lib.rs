//! Per-user IMAP folder cache.
//!
//! This crate provides a durable SQLite cache of IMAP folder state —
//! per-folder sorted UID indexes, thread trees and message header objects —
//! sitting between a webmail application and its IMAP servers. The local
//! database is a cache of server state, not the source of truth.
//!
//! Key principles:
//! - Repeated folder accesses are served from the cache; every served copy
//!   has passed validation against live UIDVALIDITY/UIDNEXT/HIGHESTMODSEQ
//! - When CONDSTORE/QRESYNC are available, a stale cache is repaired from
//!   flag deltas and VANISHED responses instead of being rebuilt
//! - Flag churn on the message currently being read coalesces into a single
//!   write when the cache closes
//!
//! ## Module organization
//!
//! - [`cache`]: the `Cache` facade, one per user session
//! - [`db`]: SQLite persistence adapter (three tables, TTL sweep)
//! - [`sync`]: incremental synchronization via CONDSTORE/QRESYNC
//! - `validate`: decides whether a cached index/thread is trustworthy
//! - [`imap`]: the client trait the cache consumes
//! - [`flags`]: the packed flag bitmap registry
//! - [`codec`]: versioned row encoding

pub mod cache;
pub mod codec;
pub mod db;
pub mod error;
pub mod flags;
pub mod imap;
pub mod sync;
pub mod types;
pub(crate) mod validate;
pub(crate) mod working_set;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::{Cache, CacheConfig, MAX_TTL_SECS};
pub use db::CacheStore;
pub use error::CacheError;
pub use imap::{FlagChange, FlagDelta, FolderStatus, ImapClient};
pub use sync::SyncStrategy;
pub use types::{
    MessageHeaders, MessageIndex, SortField, SortOrder, ThreadNode, ThreadTree, Uid,
};
