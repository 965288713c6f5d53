//! Cache validation.
//!
//! Given a cached index or thread row and a fresh folder status snapshot,
//! decide whether the cached object is still trustworthy. Invalidation is a
//! normal control signal, not an error; the verdict tells the caller what to
//! discard before rebuilding. Rule order is part of the contract.

use tracing::debug;

use crate::codec::{IndexRow, ThreadRow};
use crate::error::CacheError;
use crate::imap::{FolderStatus, ImapClient};

/// Outcome of validating a cached row against live folder status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Valid,
    Invalid(InvalidAction),
}

/// What the caller discards when a row fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InvalidAction {
    /// The persisted row is merely stale; rebuild over it.
    Rebuild,
    /// Drop the in-memory slot only; the persisted row stays.
    DropSlot,
    /// The folder's cache is unusable; purge index, thread and messages.
    PurgeFolder,
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid)
    }
}

/// Validate a cached index against live folder status.
///
/// The cheap metadata checks run first; only when they are inconclusive does
/// this fall back to the server (an UNDELETED search when hiding deleted
/// messages, a sequence-number probe otherwise).
pub(crate) async fn validate_index<I: ImapClient>(
    imap: &mut I,
    folder: &str,
    row: &IndexRow,
    skip_deleted: bool,
    status: &FolderStatus,
) -> Result<Verdict, CacheError> {
    if let Some(verdict) = validate_common(folder, row.uidvalidity, row.index.is_empty(), status) {
        return Ok(verdict);
    }

    if !row.valid {
        debug!("Index for {} is flagged invalid in the store", folder);
        return Ok(Verdict::Invalid(InvalidAction::DropSlot));
    }

    if row.skip_deleted != skip_deleted {
        return Ok(Verdict::Invalid(InvalidAction::Rebuild));
    }

    if let Some(verdict) = validate_modseq_uidnext(row.modseq, row.uidnext, status) {
        return Ok(verdict);
    }

    if skip_deleted {
        // Compare against the undeleted set when the status carried one,
        // otherwise ask the server whether it knows undeleted UIDs we don't.
        if let Some(undeleted) = &status.undeleted {
            if undeleted.len() != row.index.len() {
                return Ok(Verdict::Invalid(InvalidAction::Rebuild));
            }
            let mut cached: Vec<_> = row.index.uids.clone();
            cached.sort_unstable();
            let mut live = undeleted.clone();
            live.sort_unstable();
            if cached != live {
                return Ok(Verdict::Invalid(InvalidAction::Rebuild));
            }
        } else {
            let unknown = imap.search_missing_undeleted(folder, &row.index.uids).await?;
            if !unknown.is_empty() {
                debug!(
                    "Index for {} is missing {} undeleted messages",
                    folder,
                    unknown.len()
                );
                return Ok(Verdict::Invalid(InvalidAction::Rebuild));
            }
        }
    } else {
        if status.exists as usize != row.index.len() {
            return Ok(Verdict::Invalid(InvalidAction::Rebuild));
        }
        let last_uid = imap.seqno_to_uid(folder, status.exists).await?;
        if last_uid.is_none() || row.index.max_uid() != last_uid {
            return Ok(Verdict::Invalid(InvalidAction::Rebuild));
        }
    }

    Ok(Verdict::Valid)
}

/// Validate a cached thread tree. Threads get one cheap count check on top
/// of the shared metadata rules; they are never repaired incrementally.
pub(crate) fn validate_thread(
    folder: &str,
    row: &ThreadRow,
    skip_deleted: bool,
    status: &FolderStatus,
) -> Verdict {
    if let Some(verdict) = validate_common(folder, row.uidvalidity, row.tree.is_empty(), status) {
        return verdict;
    }

    if row.skip_deleted != skip_deleted {
        return Verdict::Invalid(InvalidAction::Rebuild);
    }

    if let Some(verdict) = validate_modseq_uidnext(None, row.uidnext, status) {
        return verdict;
    }

    if !skip_deleted && status.exists as usize != row.tree.message_count() {
        return Verdict::Invalid(InvalidAction::Rebuild);
    }

    Verdict::Valid
}

/// Rules shared by index and thread validation: UIDVALIDITY, emptiness.
/// Returns `None` when inconclusive.
fn validate_common(
    folder: &str,
    uidvalidity: Option<u32>,
    cached_empty: bool,
    status: &FolderStatus,
) -> Option<Verdict> {
    if uidvalidity.is_none() || uidvalidity != status.uidvalidity {
        debug!(
            "UIDVALIDITY of {} changed ({:?} -> {:?})",
            folder, uidvalidity, status.uidvalidity
        );
        return Some(Verdict::Invalid(InvalidAction::PurgeFolder));
    }

    if status.exists == 0 {
        return Some(if cached_empty {
            Verdict::Valid
        } else {
            Verdict::Invalid(InvalidAction::PurgeFolder)
        });
    }

    if cached_empty {
        return Some(Verdict::Invalid(InvalidAction::DropSlot));
    }

    None
}

/// The MODSEQ short-circuit and the UIDNEXT check, in that order.
/// Returns `None` when inconclusive.
fn validate_modseq_uidnext(
    modseq: Option<u64>,
    uidnext: Option<u32>,
    status: &FolderStatus,
) -> Option<Verdict> {
    if modseq.is_some() && status.highestmodseq.is_some() && modseq == status.highestmodseq {
        return Some(Verdict::Valid);
    }

    if uidnext != status.uidnext {
        return Some(Verdict::Invalid(InvalidAction::DropSlot));
    }

    None
}
