//! Shared data types: sort descriptors, message indexes, thread trees and
//! the cached message header object.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable per-message identifier within a folder.
pub type Uid = u32;

/// Field a folder index is sorted by.
///
/// `Any` means "accept whatever the store has": a lookup with `Any` adopts
/// the sort field the persisted row was built with, and a rebuild falls back
/// to arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortField {
    Any,
    Arrival,
    Date,
    From,
    To,
    Cc,
    Subject,
    Size,
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::Any => "ANY",
            SortField::Arrival => "ARRIVAL",
            SortField::Date => "DATE",
            SortField::From => "FROM",
            SortField::To => "TO",
            SortField::Cc => "CC",
            SortField::Subject => "SUBJECT",
            SortField::Size => "SIZE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ANY" => Some(SortField::Any),
            "ARRIVAL" => Some(SortField::Arrival),
            "DATE" => Some(SortField::Date),
            "FROM" => Some(SortField::From),
            "TO" => Some(SortField::To),
            "CC" => Some(SortField::Cc),
            "SUBJECT" => Some(SortField::Subject),
            "SIZE" => Some(SortField::Size),
            _ => None,
        }
    }

    /// The concrete field a rebuild uses when the caller asked for `Any`.
    pub fn resolve(&self) -> SortField {
        match self {
            SortField::Any => SortField::Arrival,
            other => *other,
        }
    }
}

impl std::fmt::Display for SortField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn reversed(&self) -> SortOrder {
        match self {
            SortOrder::Asc => SortOrder::Desc,
            SortOrder::Desc => SortOrder::Asc,
        }
    }
}

/// A folder's messages as an ordered UID sequence under one sort field and
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageIndex {
    pub sort_field: SortField,
    pub order: SortOrder,
    pub uids: Vec<Uid>,
}

impl MessageIndex {
    pub fn new(sort_field: SortField, order: SortOrder, uids: Vec<Uid>) -> Self {
        Self {
            sort_field,
            order,
            uids,
        }
    }

    pub fn empty(sort_field: SortField, order: SortOrder) -> Self {
        Self::new(sort_field, order, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    /// Highest UID in the sequence, independent of sort order.
    pub fn max_uid(&self) -> Option<Uid> {
        self.uids.iter().copied().max()
    }

    pub fn contains(&self, uid: Uid) -> bool {
        self.uids.contains(&uid)
    }

    /// Drop the given UIDs, keeping order.
    pub fn remove(&mut self, uids: &[Uid]) {
        self.uids.retain(|u| !uids.contains(u));
    }

    /// The same sequence under the opposite order.
    pub fn reversed(&self) -> MessageIndex {
        let mut uids = self.uids.clone();
        uids.reverse();
        MessageIndex::new(self.sort_field, self.order.reversed(), uids)
    }

    /// The index re-ordered to the requested order, reversing when it
    /// differs from the stored one.
    pub fn in_order(&self, order: SortOrder) -> MessageIndex {
        if self.order == order {
            self.clone()
        } else {
            self.reversed()
        }
    }
}

/// One node of a thread tree: a message UID and its replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadNode {
    pub uid: Uid,
    #[serde(default)]
    pub children: Vec<ThreadNode>,
}

impl ThreadNode {
    pub fn leaf(uid: Uid) -> Self {
        Self {
            uid,
            children: Vec::new(),
        }
    }

    fn count(&self) -> usize {
        1 + self.children.iter().map(ThreadNode::count).sum::<usize>()
    }
}

/// A folder's messages grouped into conversation trees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadTree {
    pub roots: Vec<ThreadNode>,
}

impl ThreadTree {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Total number of messages across all trees.
    pub fn message_count(&self) -> usize {
        self.roots.iter().map(ThreadNode::count).sum()
    }
}

/// Cached message header/structure object.
///
/// This is the unit the message table persists: envelope headers, structure
/// hints and an optional body. Flags live on the object in memory but are
/// persisted separately as a packed bitmap; bodies above the configured
/// threshold are stripped before the row is written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    pub uid: Uid,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub size: u32,
    #[serde(default)]
    pub flags: BTreeSet<String>,
    pub body: Option<String>,
}

impl MessageHeaders {
    pub fn new(uid: Uid) -> Self {
        Self {
            uid,
            ..Default::default()
        }
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.contains(&name.to_ascii_uppercase())
    }

    pub fn set_flag(&mut self, name: &str, enabled: bool) {
        let upper = name.to_ascii_uppercase();
        if enabled {
            self.flags.insert(upper);
        } else {
            self.flags.remove(&upper);
        }
    }
}
