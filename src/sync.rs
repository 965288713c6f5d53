//! Incremental synchronization via CONDSTORE/QRESYNC (RFC 7162).
//!
//! Instead of rebuilding a folder's index on every change, the synchronizer
//! replays what happened since the stored HIGHESTMODSEQ: one FETCH with
//! CHANGEDSINCE brings flag updates, the VANISHED piggyback (QRESYNC)
//! brings expunges, and only if the index is still wrong afterwards does a
//! full server-side SORT run. Thread indexes are not repaired this way;
//! they are dropped and rebuilt on next access.

use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::codec::IndexRow;
use crate::error::CacheError;
use crate::flags;
use crate::imap::ImapClient;
use crate::types::{MessageIndex, Uid};
use crate::validate::{self, InvalidAction, Verdict};
use crate::working_set::CachedIndex;

/// Sync strategy picked from server capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// QRESYNC: flag changes and expunges in one round-trip.
    Qresync,
    /// CONDSTORE: flag changes only; expunges surface through validation.
    Condstore,
    /// Neither extension; incremental sync is not possible.
    Bare,
}

impl SyncStrategy {
    pub fn detect<I: ImapClient>(imap: &I) -> SyncStrategy {
        if imap.has_capability("QRESYNC") {
            SyncStrategy::Qresync
        } else if imap.has_capability("CONDSTORE") {
            SyncStrategy::Condstore
        } else {
            SyncStrategy::Bare
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SyncStrategy::Qresync => "QRESYNC (flag changes and expunges in one round-trip)",
            SyncStrategy::Condstore => "CONDSTORE (incremental flag changes)",
            SyncStrategy::Bare => "Basic IMAP (no incremental sync)",
        }
    }
}

impl<I: ImapClient> Cache<I> {
    /// Bring the folder's cache into consistency with the server.
    ///
    /// IMAP failures abort silently: the cache stays possibly stale but
    /// consistent, and the next read heals it through validation. Store
    /// failures surface.
    pub async fn synchronize(&mut self, folder: &str) -> Result<(), CacheError> {
        match self.synchronize_inner(folder).await {
            Err(CacheError::Imap(err)) => {
                warn!("Sync of {} aborted: {}", folder, err);
                Ok(())
            }
            other => other,
        }
    }

    async fn synchronize_inner(&mut self, folder: &str) -> Result<(), CacheError> {
        let Some(mut row) = self.load_index_row(folder)? else {
            return Ok(());
        };

        // Without a MODSEQ snapshot there is no "since" to sync from.
        let Some(stored_modseq) = row.modseq else {
            debug!("No MODSEQ stored for {}, skipping incremental sync", folder);
            return Ok(());
        };

        let skip_deleted = self.config().skip_deleted;

        let strategy = SyncStrategy::detect(self.imap_ref());
        if strategy == SyncStrategy::Bare {
            debug!("Server offers neither QRESYNC nor CONDSTORE");
            return Ok(());
        }
        let qresync = strategy == SyncStrategy::Qresync;

        self.imap_mut().check_connection().await?;
        self.imap_mut()
            .enable(if qresync { "QRESYNC" } else { "CONDSTORE" })
            .await?;

        // Reselect to get fresh UIDVALIDITY/HIGHESTMODSEQ.
        if self.imap_mut().selected_folder().as_deref() == Some(folder) {
            self.imap_mut().unselect(folder).await?;
        }

        let status = self.imap_mut().folder_status(folder).await?;

        if row.uidvalidity.is_none() || row.uidvalidity != status.uidvalidity {
            info!("UIDVALIDITY of {} changed, purging cache", folder);
            self.clear(Some(folder), None)?;
            return Ok(());
        }

        if status.nomodseq {
            debug!("{} reports NOMODSEQ, cannot sync incrementally", folder);
            return Ok(());
        }
        let Some(live_modseq) = status.highestmodseq else {
            return Ok(());
        };
        if live_modseq == stored_modseq {
            debug!("{} unchanged at MODSEQ {}", folder, stored_modseq);
            return Ok(());
        }

        let uids = self.store().select_message_uids(self.user_id(), folder)?;
        let mut removed: Vec<Uid> = Vec::new();
        let mut membership_changed = false;

        if !uids.is_empty() {
            let delta = self
                .imap_mut()
                .fetch_flags_changed(folder, &uids, stored_modseq, qresync)
                .await?;

            for change in &delta.changes {
                if skip_deleted && change.flags.contains("DELETED") {
                    removed.push(change.uid);
                    membership_changed = true;
                } else {
                    let bits = flags::pack(change.flags.iter());
                    self.store()
                        .update_message_flags(self.user_id(), folder, change.uid, bits)?;
                }
            }

            for uid in &delta.vanished {
                if !removed.contains(uid) {
                    removed.push(*uid);
                }
            }
            if !delta.vanished.is_empty() {
                membership_changed = true;
            }
        }

        if !removed.is_empty() {
            info!("Removing {} messages from {} cache", removed.len(), folder);
            self.store()
                .delete_messages(self.user_id(), Some(folder), Some(&removed))?;
            row.index.remove(&removed);
        }
        if membership_changed {
            row.valid = false;
        }

        let verdict =
            validate::validate_index(self.imap_mut(), folder, &row, skip_deleted, &status).await?;

        match verdict {
            Verdict::Invalid(InvalidAction::PurgeFolder) => {
                self.clear(Some(folder), None)?;
                return Ok(());
            }
            Verdict::Invalid(_) => {
                // Replay was not enough; rebuild the index and drop the
                // thread row, which is never repaired incrementally.
                let sort = row.sort_field.resolve();
                let order = row.index.order;
                row.index = if status.exists == 0 {
                    MessageIndex::empty(sort, order)
                } else {
                    self.imap_mut().fetch_index(folder, sort, order).await?
                };
                row.sort_field = sort;
                self.remove_thread(Some(folder))?;
                info!("Rebuilt index for {} after sync ({} messages)", folder, row.index.len());
            }
            Verdict::Valid => {}
        }

        row.valid = true;
        row.skip_deleted = skip_deleted;
        row.uidvalidity = status.uidvalidity;
        row.uidnext = status.uidnext;
        row.modseq = status.highestmodseq;

        self.store()
            .upsert_index(self.user_id(), folder, &row, self.expires())?;
        self.working.folder_mut(folder).index = Some(CachedIndex {
            row,
            validated: false,
        });
        Ok(())
    }

    /// The persisted index row, via the working set and its queried
    /// sentinel.
    fn load_index_row(&mut self, folder: &str) -> Result<Option<IndexRow>, CacheError> {
        if let Some(slot) = self.working.folder(folder) {
            if let Some(cached) = &slot.index {
                return Ok(Some(cached.row.clone()));
            }
            if slot.index_queried {
                return Ok(None);
            }
        }

        let row = self.store().select_index(self.user_id(), folder)?;
        self.working.folder_mut(folder).index_queried = true;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::db::CacheStore;
    use crate::imap::{FlagChange, FlagDelta, FolderStatus};
    use crate::testutil::{FakeImap, FakeState};
    use crate::types::{MessageHeaders, SortField, SortOrder};
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    fn new_cache(config: CacheConfig) -> (Cache<FakeImap>, Arc<Mutex<FakeState>>) {
        let (imap, state) = FakeImap::new();
        let store = CacheStore::in_memory().expect("Failed to create store");
        (Cache::new("user", imap, store, config), state)
    }

    fn status(modseq: u64) -> FolderStatus {
        FolderStatus {
            uidvalidity: Some(42),
            exists: 3,
            uidnext: Some(10),
            highestmodseq: Some(modseq),
            nomodseq: false,
            undeleted: None,
        }
    }

    /// Seed the store the way a previous session would have left it:
    /// an index row at modseq 100 and three unseen messages.
    async fn seed(cache: &mut Cache<FakeImap>, state: &Arc<Mutex<FakeState>>) {
        {
            let mut s = state.lock().unwrap();
            s.statuses.insert("INBOX".to_string(), status(100));
            s.indexes.insert("INBOX".to_string(), vec![9, 7, 3]);
            s.capabilities.insert("CONDSTORE".to_string());
        }
        cache
            .get_index("INBOX", SortField::Date, SortOrder::Desc, false)
            .await
            .expect("seeding get_index failed");
        for uid in [3, 7, 9] {
            cache
                .add_message("INBOX", &MessageHeaders::new(uid), true)
                .expect("seeding add_message failed");
        }
        // Forget the session state so synchronize starts from the store
        cache.close().expect("close failed");
        state.lock().unwrap().selected = None;
    }

    fn flags_of(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_sync_noop_when_modseq_unchanged() {
        let (mut cache, state) = new_cache(CacheConfig::default());
        seed(&mut cache, &state).await;
        let calls_before = state.lock().unwrap().status_calls;

        cache.synchronize("INBOX").await.expect("synchronize failed");

        let s = state.lock().unwrap();
        assert_eq!(s.status_calls, calls_before + 1);
        assert_eq!(s.flag_fetch_calls, 0);
        drop(s);

        let row = cache
            .store()
            .select_index("user", "INBOX")
            .expect("select failed")
            .expect("row should remain");
        assert_eq!(row.modseq, Some(100));
        assert!(row.valid);
    }

    #[tokio::test]
    async fn test_sync_applies_flag_delta() {
        let (mut cache, state) = new_cache(CacheConfig::default());
        seed(&mut cache, &state).await;
        {
            let mut s = state.lock().unwrap();
            s.statuses.insert("INBOX".to_string(), status(105));
            s.seqno_uids.insert(("INBOX".to_string(), 3), 9);
            s.flag_deltas.insert(
                "INBOX".to_string(),
                FlagDelta {
                    changes: vec![FlagChange {
                        uid: 7,
                        flags: flags_of(&["SEEN"]),
                    }],
                    vanished: vec![],
                },
            );
        }

        cache.synchronize("INBOX").await.expect("synchronize failed");

        let msg7 = cache
            .store()
            .select_message("user", "INBOX", 7)
            .expect("select failed")
            .expect("message should exist");
        assert!(msg7.has_flag("SEEN"));
        for uid in [3, 9] {
            let msg = cache
                .store()
                .select_message("user", "INBOX", uid)
                .expect("select failed")
                .expect("message should exist");
            assert!(msg.flags.is_empty(), "uid {} should be untouched", uid);
        }

        let row = cache
            .store()
            .select_index("user", "INBOX")
            .expect("select failed")
            .expect("row should remain");
        assert_eq!(row.modseq, Some(105));
        assert!(row.valid);
        assert_eq!(row.index.uids, vec![9, 7, 3]);
        // One CHANGEDSINCE fetch, no index rebuild
        assert_eq!(state.lock().unwrap().flag_fetch_calls, 1);
        assert_eq!(state.lock().unwrap().index_calls, 1); // the seeding build only
    }

    #[tokio::test]
    async fn test_sync_qresync_vanished_removes_and_rebuilds() {
        let (mut cache, state) = new_cache(CacheConfig::default());
        seed(&mut cache, &state).await;
        {
            let mut s = state.lock().unwrap();
            s.capabilities.insert("QRESYNC".to_string());
            let mut st = status(105);
            st.exists = 2;
            st.uidnext = Some(10);
            s.statuses.insert("INBOX".to_string(), st);
            s.indexes.insert("INBOX".to_string(), vec![9, 3]);
            s.flag_deltas.insert(
                "INBOX".to_string(),
                FlagDelta {
                    changes: vec![],
                    vanished: vec![7],
                },
            );
        }

        cache.synchronize("INBOX").await.expect("synchronize failed");

        assert!(cache
            .store()
            .select_message("user", "INBOX", 7)
            .expect("select failed")
            .is_none());

        let row = cache
            .store()
            .select_index("user", "INBOX")
            .expect("select failed")
            .expect("row should remain");
        assert_eq!(row.index.uids, vec![9, 3]);
        assert!(row.valid);
        assert_eq!(row.modseq, Some(105));
        // The invalid index forced one rebuild
        assert_eq!(state.lock().unwrap().index_calls, 2);
        assert_eq!(state.lock().unwrap().enabled.last().map(String::as_str), Some("QRESYNC"));
    }

    #[tokio::test]
    async fn test_sync_skip_deleted_removes_newly_deleted() {
        let (mut cache, state) = new_cache(CacheConfig {
            skip_deleted: true,
            ..Default::default()
        });
        {
            let mut s = state.lock().unwrap();
            let mut st = status(100);
            st.undeleted = Some(vec![3, 7, 9]);
            s.statuses.insert("INBOX".to_string(), st);
            s.indexes.insert("INBOX".to_string(), vec![9, 7, 3]);
            s.capabilities.insert("CONDSTORE".to_string());
        }
        cache
            .get_index("INBOX", SortField::Date, SortOrder::Desc, false)
            .await
            .expect("seeding get_index failed");
        for uid in [3, 7, 9] {
            cache
                .add_message("INBOX", &MessageHeaders::new(uid), true)
                .expect("seeding add_message failed");
        }
        cache.close().expect("close failed");
        {
            let mut s = state.lock().unwrap();
            let mut st = status(105);
            st.exists = 3;
            st.undeleted = Some(vec![3, 9]);
            s.statuses.insert("INBOX".to_string(), st);
            s.indexes.insert("INBOX".to_string(), vec![9, 3]);
            s.flag_deltas.insert(
                "INBOX".to_string(),
                FlagDelta {
                    changes: vec![FlagChange {
                        uid: 7,
                        flags: flags_of(&["DELETED"]),
                    }],
                    vanished: vec![],
                },
            );
        }

        cache.synchronize("INBOX").await.expect("synchronize failed");

        assert!(cache
            .store()
            .select_message("user", "INBOX", 7)
            .expect("select failed")
            .is_none());
        let row = cache
            .store()
            .select_index("user", "INBOX")
            .expect("select failed")
            .expect("row should remain");
        assert_eq!(row.index.uids, vec![9, 3]);
        assert!(row.valid);
    }

    #[tokio::test]
    async fn test_sync_uidvalidity_change_purges() {
        let (mut cache, state) = new_cache(CacheConfig::default());
        seed(&mut cache, &state).await;
        {
            let mut s = state.lock().unwrap();
            let mut st = status(1);
            st.uidvalidity = Some(43);
            st.exists = 0;
            s.statuses.insert("INBOX".to_string(), st);
        }

        cache.synchronize("INBOX").await.expect("synchronize failed");

        assert!(cache
            .store()
            .select_index("user", "INBOX")
            .expect("select failed")
            .is_none());
        assert!(cache
            .store()
            .select_message_uids("user", "INBOX")
            .expect("select failed")
            .is_empty());
    }

    #[tokio::test]
    async fn test_sync_without_extensions_is_a_noop() {
        let (mut cache, state) = new_cache(CacheConfig::default());
        seed(&mut cache, &state).await;
        state.lock().unwrap().capabilities.clear();
        let calls_before = state.lock().unwrap().status_calls;

        cache.synchronize("INBOX").await.expect("synchronize failed");

        assert_eq!(state.lock().unwrap().status_calls, calls_before);
    }

    #[tokio::test]
    async fn test_sync_imap_failure_aborts_silently() {
        let (mut cache, state) = new_cache(CacheConfig::default());
        seed(&mut cache, &state).await;
        // Unscripted status makes folder_status fail
        state.lock().unwrap().statuses.remove("INBOX");

        // The IMAP error is swallowed; the cache row is untouched
        cache.synchronize("INBOX").await.expect("should not surface");
        let row = cache
            .store()
            .select_index("user", "INBOX")
            .expect("select failed")
            .expect("row should remain");
        assert_eq!(row.modseq, Some(100));
    }

    #[test]
    fn test_strategy_detection() {
        let (imap, state) = FakeImap::new();
        assert_eq!(SyncStrategy::detect(&imap), SyncStrategy::Bare);

        state.lock().unwrap().capabilities.insert("CONDSTORE".to_string());
        assert_eq!(SyncStrategy::detect(&imap), SyncStrategy::Condstore);

        state.lock().unwrap().capabilities.insert("QRESYNC".to_string());
        assert_eq!(SyncStrategy::detect(&imap), SyncStrategy::Qresync);
    }
}
