//! Scripted IMAP client for tests.
//!
//! The fake serves whatever the test scripted into its shared state and
//! counts the round-trips, so tests can assert both results and the number
//! of server touches an operation cost.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::CacheError;
use crate::imap::{FlagDelta, FolderStatus, ImapClient};
use crate::types::{MessageHeaders, MessageIndex, SortField, SortOrder, ThreadTree, Uid};

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub statuses: HashMap<String, FolderStatus>,
    pub indexes: HashMap<String, Vec<Uid>>,
    pub threads: HashMap<String, ThreadTree>,
    pub headers: HashMap<(String, Uid), MessageHeaders>,
    pub missing_undeleted: HashMap<String, Vec<Uid>>,
    pub seqno_uids: HashMap<(String, u32), Uid>,
    pub flag_deltas: HashMap<String, FlagDelta>,
    pub capabilities: HashSet<String>,
    pub selected: Option<String>,
    pub enabled: Vec<String>,

    pub status_calls: usize,
    pub index_calls: usize,
    pub thread_calls: usize,
    pub header_calls: usize,
    pub flag_fetch_calls: usize,
    pub unselect_calls: usize,
}

pub(crate) struct FakeImap {
    state: Arc<Mutex<FakeState>>,
}

impl FakeImap {
    pub fn new() -> (Self, Arc<Mutex<FakeState>>) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

#[async_trait]
impl ImapClient for FakeImap {
    async fn folder_status(&mut self, folder: &str) -> Result<FolderStatus, CacheError> {
        let mut state = self.state.lock().unwrap();
        state.status_calls += 1;
        state.selected = Some(folder.to_string());
        state
            .statuses
            .get(folder)
            .cloned()
            .ok_or_else(|| CacheError::Imap(format!("no scripted status for {}", folder)))
    }

    async fn fetch_index(
        &mut self,
        folder: &str,
        sort_field: SortField,
        order: SortOrder,
    ) -> Result<MessageIndex, CacheError> {
        let mut state = self.state.lock().unwrap();
        state.index_calls += 1;
        let uids = state
            .indexes
            .get(folder)
            .cloned()
            .ok_or_else(|| CacheError::Imap(format!("no scripted index for {}", folder)))?;
        Ok(MessageIndex::new(sort_field.resolve(), order, uids))
    }

    async fn fetch_threads(&mut self, folder: &str) -> Result<ThreadTree, CacheError> {
        let mut state = self.state.lock().unwrap();
        state.thread_calls += 1;
        state
            .threads
            .get(folder)
            .cloned()
            .ok_or_else(|| CacheError::Imap(format!("no scripted threads for {}", folder)))
    }

    async fn fetch_headers(
        &mut self,
        folder: &str,
        uids: &[Uid],
    ) -> Result<Vec<MessageHeaders>, CacheError> {
        let mut state = self.state.lock().unwrap();
        state.header_calls += 1;
        Ok(uids
            .iter()
            .filter_map(|uid| state.headers.get(&(folder.to_string(), *uid)).cloned())
            .collect())
    }

    async fn search_missing_undeleted(
        &mut self,
        folder: &str,
        _known: &[Uid],
    ) -> Result<Vec<Uid>, CacheError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .missing_undeleted
            .get(folder)
            .cloned()
            .unwrap_or_default())
    }

    async fn seqno_to_uid(&mut self, folder: &str, seqno: u32) -> Result<Option<Uid>, CacheError> {
        let state = self.state.lock().unwrap();
        Ok(state.seqno_uids.get(&(folder.to_string(), seqno)).copied())
    }

    async fn fetch_flags_changed(
        &mut self,
        folder: &str,
        _uids: &[Uid],
        _since_modseq: u64,
        _vanished: bool,
    ) -> Result<FlagDelta, CacheError> {
        let mut state = self.state.lock().unwrap();
        state.flag_fetch_calls += 1;
        Ok(state.flag_deltas.get(folder).cloned().unwrap_or_default())
    }

    fn has_capability(&self, name: &str) -> bool {
        self.state.lock().unwrap().capabilities.contains(name)
    }

    async fn check_connection(&mut self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn enable(&mut self, capability: &str) -> Result<(), CacheError> {
        self.state.lock().unwrap().enabled.push(capability.to_string());
        Ok(())
    }

    fn selected_folder(&self) -> Option<String> {
        self.state.lock().unwrap().selected.clone()
    }

    async fn unselect(&mut self, folder: &str) -> Result<(), CacheError> {
        let mut state = self.state.lock().unwrap();
        state.unselect_calls += 1;
        if state.selected.as_deref() == Some(folder) {
            state.selected = None;
        }
        Ok(())
    }
}
