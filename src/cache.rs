//! The cache facade.
//!
//! One `Cache` per user session, bound to one user id, one IMAP client and
//! one store handle. Reads consult the working set, then the store, then ask
//! the validator whether to trust what they found; only then does anything
//! go to the server. Writes go through the store after flag packing, except
//! for the current-message slot, which coalesces flag churn on the message
//! the user is looking at into a single write on displacement or close.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{IndexRow, ThreadRow};
use crate::db::CacheStore;
use crate::error::CacheError;
use crate::flags;
use crate::imap::{FolderStatus, ImapClient};
use crate::types::{MessageHeaders, MessageIndex, SortField, SortOrder, ThreadTree, Uid};
use crate::validate::{self, InvalidAction, Verdict};
use crate::working_set::{CachedIndex, CurrentMessage, WorkingSet};

/// Upper bound on row lifetime: 30 days.
pub const MAX_TTL_SECS: u64 = 2_592_000;

/// Cache tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Row lifetime in seconds; 0 means rows never expire. Values above
    /// [`MAX_TTL_SECS`] are clamped.
    pub ttl_secs: u64,
    /// Hide messages flagged `\Deleted` from indexes.
    pub skip_deleted: bool,
    /// Message bodies larger than this are stripped before persisting.
    pub body_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 10 * 24 * 3600,
            skip_deleted: false,
            body_threshold: 32 * 1024,
        }
    }
}

/// Per-user IMAP folder cache.
pub struct Cache<I: ImapClient> {
    user_id: String,
    imap: I,
    store: CacheStore,
    config: CacheConfig,
    pub(crate) working: WorkingSet,
    pub(crate) current: Option<CurrentMessage>,
}

impl<I: ImapClient> Cache<I> {
    pub fn new(user_id: &str, imap: I, store: CacheStore, mut config: CacheConfig) -> Self {
        if config.ttl_secs > MAX_TTL_SECS {
            warn!(
                "Cache TTL {}s exceeds the 30-day maximum, clamping",
                config.ttl_secs
            );
            config.ttl_secs = MAX_TTL_SECS;
        }

        Self {
            user_id: user_id.to_string(),
            imap,
            store,
            config,
            working: WorkingSet::new(),
            current: None,
        }
    }

    pub(crate) fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn user_id(&self) -> &str {
        &self.user_id
    }

    pub(crate) fn store(&self) -> &CacheStore {
        &self.store
    }

    pub(crate) fn imap_mut(&mut self) -> &mut I {
        &mut self.imap
    }

    pub(crate) fn imap_ref(&self) -> &I {
        &self.imap
    }

    pub(crate) fn expires(&self) -> Option<i64> {
        CacheStore::expires_from_ttl(self.config.ttl_secs)
    }

    // ========== Index queries ==========

    /// Get the folder's sorted UID index, serving from the working set or
    /// the store when a cached copy survives validation, rebuilding from the
    /// server otherwise. With `existing_only` a miss returns `None` instead
    /// of rebuilding.
    pub async fn get_index(
        &mut self,
        folder: &str,
        sort_field: SortField,
        order: SortOrder,
        existing_only: bool,
    ) -> Result<Option<MessageIndex>, CacheError> {
        let mut candidate: Option<IndexRow> = None;

        if let Some(slot) = self.working.folder(folder) {
            if let Some(cached) = &slot.index {
                if cached.validated
                    && (sort_field == SortField::Any || cached.row.sort_field == sort_field)
                {
                    return Ok(Some(cached.row.index.in_order(order)));
                }
                candidate = Some(cached.row.clone());
            }
        }

        if candidate.is_none() && !self.index_queried(folder) {
            candidate = self.store.select_index(&self.user_id, folder)?;
            self.working.folder_mut(folder).index_queried = true;
        }

        // `Any` adopts whatever sort the stored row was built with.
        let effective_sort = match (sort_field, &candidate) {
            (SortField::Any, Some(row)) => row.sort_field,
            _ => sort_field,
        };

        let mut status: Option<FolderStatus> = None;
        let mut valid_row: Option<IndexRow> = None;

        if let Some(row) = candidate {
            if row.sort_field == effective_sort {
                let st = self.imap.folder_status(folder).await?;
                let verdict = validate::validate_index(
                    &mut self.imap,
                    folder,
                    &row,
                    self.config.skip_deleted,
                    &st,
                )
                .await?;
                self.apply_index_verdict(folder, &verdict)?;
                if verdict.is_valid() {
                    valid_row = Some(row);
                }
                status = Some(st);
            }
        }

        if let Some(row) = valid_row {
            let result = row.index.in_order(order);
            self.working.folder_mut(folder).index = Some(CachedIndex {
                row,
                validated: true,
            });
            return Ok(Some(result));
        }

        if existing_only {
            return Ok(None);
        }

        // Rebuild from the server.
        let st = match status {
            Some(st) => st,
            None => self.imap.folder_status(folder).await?,
        };
        let resolved = effective_sort.resolve();
        let index = if st.exists == 0 {
            MessageIndex::empty(resolved, order)
        } else {
            self.imap.fetch_index(folder, resolved, order).await?
        };
        info!(
            "Rebuilt index for {} ({} messages, sort {})",
            folder,
            index.len(),
            resolved
        );

        let row = IndexRow {
            valid: true,
            sort_field: resolved,
            skip_deleted: self.config.skip_deleted,
            uidvalidity: st.uidvalidity,
            uidnext: st.uidnext,
            modseq: st.highestmodseq,
            index,
        };
        self.store
            .upsert_index(&self.user_id, folder, &row, self.expires())?;

        let result = row.index.in_order(order);
        self.working.folder_mut(folder).index = Some(CachedIndex {
            row,
            validated: true,
        });
        Ok(Some(result))
    }

    /// Get the folder's thread tree, same protocol as [`Cache::get_index`]
    /// without sort fields.
    pub async fn get_thread(&mut self, folder: &str) -> Result<ThreadTree, CacheError> {
        let mut candidate: Option<ThreadRow> = None;

        if let Some(slot) = self.working.folder(folder) {
            candidate = slot.thread.clone();
        }

        if candidate.is_none() && !self.thread_queried(folder) {
            candidate = self.store.select_thread(&self.user_id, folder)?;
            self.working.folder_mut(folder).thread_queried = true;
        }

        let mut status: Option<FolderStatus> = None;
        let mut valid_row: Option<ThreadRow> = None;

        if let Some(row) = candidate {
            let st = self.imap.folder_status(folder).await?;
            let verdict = validate::validate_thread(folder, &row, self.config.skip_deleted, &st);
            self.apply_thread_verdict(folder, &verdict)?;
            if verdict.is_valid() {
                valid_row = Some(row);
            }
            status = Some(st);
        }

        if let Some(row) = valid_row {
            let tree = row.tree.clone();
            self.working.folder_mut(folder).thread = Some(row);
            return Ok(tree);
        }

        let st = match status {
            Some(st) => st,
            None => self.imap.folder_status(folder).await?,
        };
        let tree = if st.exists == 0 {
            ThreadTree::empty()
        } else {
            self.imap.fetch_threads(folder).await?
        };
        info!("Rebuilt threads for {} ({} messages)", folder, tree.message_count());

        let row = ThreadRow {
            skip_deleted: self.config.skip_deleted,
            uidvalidity: st.uidvalidity,
            uidnext: st.uidnext,
            tree: tree.clone(),
        };
        self.store
            .upsert_thread(&self.user_id, folder, &row, self.expires())?;
        self.working.folder_mut(folder).thread = Some(row);
        Ok(tree)
    }

    // ========== Message queries ==========

    /// Get one message's headers: current slot, then store, then server
    /// (unless `update` is false). With `cache` the result displaces the
    /// current-message slot, flushing the outgoing one if dirty.
    pub async fn get_message(
        &mut self,
        folder: &str,
        uid: Uid,
        update: bool,
        cache: bool,
    ) -> Result<Option<MessageHeaders>, CacheError> {
        if let Some(slot) = &self.current {
            if slot.matches(folder, uid) {
                return Ok(Some(slot.message.clone()));
            }
        }

        let mut message = self.store.select_message(&self.user_id, folder, uid)?;
        let existed = message.is_some();

        if message.is_none() && update {
            let fetched = self.imap.fetch_headers(folder, &[uid]).await?;
            message = fetched.into_iter().find(|m| m.uid == uid);
        }

        if cache {
            if let Some(msg) = &message {
                self.flush_current()?;
                self.current = Some(CurrentMessage::new(folder, msg.clone(), existed));
            }
        }

        Ok(message)
    }

    /// Bulk message lookup: serve what the store has, fetch the rest from
    /// the server and persist it. Bodies are nulled on the returned objects
    /// after insertion to keep the working set small.
    pub async fn get_messages(
        &mut self,
        folder: &str,
        uids: &[Uid],
    ) -> Result<Vec<MessageHeaders>, CacheError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let mut found = self.store.select_messages(&self.user_id, folder, uids)?;

        // The slot may hold unflushed flag changes for one of these.
        if let Some(slot) = &self.current {
            if slot.folder == folder && uids.contains(&slot.uid) {
                found.insert(slot.uid, slot.message.clone());
            }
        }

        let missing: Vec<Uid> = uids.iter().filter(|u| !found.contains_key(*u)).copied().collect();
        if !missing.is_empty() {
            debug!("Fetching {} uncached messages from {}", missing.len(), folder);
            let fetched = self.imap.fetch_headers(folder, &missing).await?;
            for msg in fetched {
                self.store.upsert_message(
                    &self.user_id,
                    folder,
                    &msg,
                    self.config.body_threshold,
                    self.expires(),
                )?;
                let mut out = msg;
                out.body = None;
                found.insert(out.uid, out);
            }
        }

        Ok(uids.iter().filter_map(|u| found.remove(u)).collect())
    }

    // ========== Mutation ==========

    /// Persist a message object. Flags are packed into the bitmap column and
    /// stripped from the stored clone. `force` signals the row is known
    /// absent; with atomic upserts both paths execute the same statement.
    pub fn add_message(
        &mut self,
        folder: &str,
        message: &MessageHeaders,
        force: bool,
    ) -> Result<(), CacheError> {
        debug!("add_message {}/{} (force={})", folder, message.uid, force);
        self.store.upsert_message(
            &self.user_id,
            folder,
            message,
            self.config.body_threshold,
            self.expires(),
        )?;

        if let Some(slot) = &mut self.current {
            if slot.matches(folder, message.uid) {
                *slot = CurrentMessage::new(folder, message.clone(), true);
            }
        }
        Ok(())
    }

    /// Set or clear one flag on a UID set. Unknown flags are a silent no-op.
    /// When the only affected UID is the current-message slot, the write is
    /// deferred to the slot flush.
    pub fn change_flag(
        &mut self,
        folder: &str,
        uids: &[Uid],
        flag: &str,
        enabled: bool,
    ) -> Result<(), CacheError> {
        let Some(bit) = flags::flag_bit(flag) else {
            debug!("Ignoring unknown flag {:?}", flag);
            return Ok(());
        };
        if uids.is_empty() {
            return Ok(());
        }

        if let Some(slot) = &mut self.current {
            if slot.folder == folder && uids.contains(&slot.uid) {
                slot.message.set_flag(flag, enabled);
                if uids.len() == 1 {
                    return Ok(());
                }
            }
        }

        self.store
            .change_flag(&self.user_id, folder, uids, bit, enabled)
    }

    /// Delete message rows: everything for the user (no folder), a folder,
    /// or an explicit UID list. A matching current-message slot is dropped.
    pub fn remove_message(
        &mut self,
        folder: Option<&str>,
        uids: Option<&[Uid]>,
    ) -> Result<(), CacheError> {
        self.store.delete_messages(&self.user_id, folder, uids)?;

        if let Some(slot) = &self.current {
            let hit = match folder {
                None => true,
                Some(f) => slot.folder == f && uids.map_or(true, |u| u.contains(&slot.uid)),
            };
            if hit {
                self.current = None;
            }
        }
        Ok(())
    }

    /// Remove or invalidate index rows. `remove` deletes physically (used on
    /// UIDVALIDITY change and empty mailboxes); otherwise only the `valid`
    /// flag drops, preserving the HIGHESTMODSEQ snapshot for incremental
    /// repair.
    pub fn remove_index(&mut self, folder: Option<&str>, remove: bool) -> Result<(), CacheError> {
        if remove {
            self.store.delete_index(&self.user_id, folder)?;
        } else {
            self.store.set_index_invalid(&self.user_id, folder)?;
        }

        match folder {
            Some(folder) => self.working.drop_index(folder),
            None => self.working.drop_all_indexes(),
        }
        Ok(())
    }

    /// Delete thread rows; threads are never soft-invalidated.
    pub fn remove_thread(&mut self, folder: Option<&str>) -> Result<(), CacheError> {
        self.store.delete_thread(&self.user_id, folder)?;

        match folder {
            Some(folder) => self.working.drop_thread(folder),
            None => self.working.drop_all_threads(),
        }
        Ok(())
    }

    /// Purge a folder (or everything): index, thread and message rows.
    pub fn clear(&mut self, folder: Option<&str>, uids: Option<&[Uid]>) -> Result<(), CacheError> {
        self.remove_index(folder, true)?;
        self.remove_thread(folder)?;
        self.remove_message(folder, uids)
    }

    // ========== Lifecycle ==========

    /// Flush a dirty current-message slot and drop the working set.
    pub fn close(&mut self) -> Result<(), CacheError> {
        self.flush_current()?;
        self.current = None;
        self.working.clear();
        Ok(())
    }

    // ========== Internal ==========

    /// Persist the current-message slot when it drifted from its last
    /// persisted form, or was never persisted at all.
    pub(crate) fn flush_current(&mut self) -> Result<(), CacheError> {
        if let Some(slot) = &mut self.current {
            if slot.is_dirty() || !slot.existed_in_store {
                debug!("Flushing current message {}/{}", slot.folder, slot.uid);
                self.store.upsert_message(
                    &self.user_id,
                    &slot.folder,
                    &slot.message,
                    self.config.body_threshold,
                    CacheStore::expires_from_ttl(self.config.ttl_secs),
                )?;
                slot.mark_clean();
            }
        }
        Ok(())
    }

    pub(crate) fn apply_index_verdict(
        &mut self,
        folder: &str,
        verdict: &Verdict,
    ) -> Result<(), CacheError> {
        match verdict {
            Verdict::Valid => Ok(()),
            Verdict::Invalid(InvalidAction::PurgeFolder) => self.clear(Some(folder), None),
            Verdict::Invalid(InvalidAction::DropSlot) => {
                self.working.drop_index(folder);
                Ok(())
            }
            Verdict::Invalid(InvalidAction::Rebuild) => Ok(()),
        }
    }

    pub(crate) fn apply_thread_verdict(
        &mut self,
        folder: &str,
        verdict: &Verdict,
    ) -> Result<(), CacheError> {
        match verdict {
            Verdict::Valid => Ok(()),
            Verdict::Invalid(InvalidAction::PurgeFolder) => self.clear(Some(folder), None),
            Verdict::Invalid(InvalidAction::DropSlot) => {
                self.working.drop_thread(folder);
                Ok(())
            }
            Verdict::Invalid(InvalidAction::Rebuild) => Ok(()),
        }
    }

    fn index_queried(&self, folder: &str) -> bool {
        self.working.folder(folder).map_or(false, |s| s.index_queried)
    }

    fn thread_queried(&self, folder: &str) -> bool {
        self.working.folder(folder).map_or(false, |s| s.thread_queried)
    }
}
