//! Persisted row encoding.
//!
//! Each row's `data` column holds a single JSON array: format version first,
//! then the opaque object blob as a nested JSON *string*, then the positional
//! metadata fields. Nesting the blob keeps its decoding independent of the
//! envelope: a corrupt blob still yields the metadata (with a fresh empty
//! object), while an unparseable envelope or a version mismatch reads as a
//! cache miss. Neither case is an error.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CacheError;
use crate::types::{MessageHeaders, MessageIndex, SortField, SortOrder, ThreadTree, Uid};

/// Bumped whenever the envelope layout or the blob schema changes. Rows
/// written under another version decode as misses and get rebuilt.
pub const FORMAT_VERSION: u32 = 1;

/// Persisted index row: the sorted UID sequence plus the folder-state
/// snapshot it was built under.
///
/// `valid` is persisted as its own column, not inside the envelope, so
/// invalidation is a one-column UPDATE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRow {
    pub valid: bool,
    pub sort_field: SortField,
    pub skip_deleted: bool,
    pub uidvalidity: Option<u32>,
    pub uidnext: Option<u32>,
    pub modseq: Option<u64>,
    pub index: MessageIndex,
}

/// Persisted thread row: the thread tree plus its folder-state snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRow {
    pub skip_deleted: bool,
    pub uidvalidity: Option<u32>,
    pub uidnext: Option<u32>,
    pub tree: ThreadTree,
}

#[derive(Serialize, Deserialize)]
struct IndexEnvelope(
    u32,            // version
    String,         // blob: MessageIndex as JSON
    String,         // sort_field
    bool,           // skip_deleted
    Option<u32>,    // uidvalidity
    Option<u32>,    // uidnext
    Option<u64>,    // modseq
);

#[derive(Serialize, Deserialize)]
struct ThreadEnvelope(
    u32,            // version
    String,         // blob: ThreadTree as JSON
    bool,           // skip_deleted
    Option<u32>,    // uidvalidity
    Option<u32>,    // uidnext
);

#[derive(Serialize, Deserialize)]
struct MessageEnvelope(u32, String);

pub fn encode_index(row: &IndexRow) -> Result<String, CacheError> {
    let blob = serde_json::to_string(&row.index)?;
    let envelope = IndexEnvelope(
        FORMAT_VERSION,
        blob,
        row.sort_field.as_str().to_string(),
        row.skip_deleted,
        row.uidvalidity,
        row.uidnext,
        row.modseq,
    );
    Ok(serde_json::to_string(&envelope)?)
}

/// Decode an index row; `valid` comes from its own column. `None` means the
/// envelope is unreadable (corrupt or foreign version) and the row should be
/// treated as absent.
pub fn decode_index(data: &str, valid: bool) -> Option<IndexRow> {
    let envelope: IndexEnvelope = match serde_json::from_str(data) {
        Ok(e) => e,
        Err(err) => {
            debug!("Unreadable index row envelope: {}", err);
            return None;
        }
    };
    if envelope.0 != FORMAT_VERSION {
        debug!("Index row has format version {}, expected {}", envelope.0, FORMAT_VERSION);
        return None;
    }

    let sort_field = SortField::parse(&envelope.2).unwrap_or(SortField::Any);
    // Metadata survives a corrupt blob; the object starts over empty.
    let index = serde_json::from_str::<MessageIndex>(&envelope.1)
        .unwrap_or_else(|_| MessageIndex::empty(sort_field, SortOrder::Asc));

    Some(IndexRow {
        valid,
        sort_field,
        skip_deleted: envelope.3,
        uidvalidity: envelope.4,
        uidnext: envelope.5,
        modseq: envelope.6,
        index,
    })
}

pub fn encode_thread(row: &ThreadRow) -> Result<String, CacheError> {
    let blob = serde_json::to_string(&row.tree)?;
    let envelope = ThreadEnvelope(
        FORMAT_VERSION,
        blob,
        row.skip_deleted,
        row.uidvalidity,
        row.uidnext,
    );
    Ok(serde_json::to_string(&envelope)?)
}

pub fn decode_thread(data: &str) -> Option<ThreadRow> {
    let envelope: ThreadEnvelope = match serde_json::from_str(data) {
        Ok(e) => e,
        Err(err) => {
            debug!("Unreadable thread row envelope: {}", err);
            return None;
        }
    };
    if envelope.0 != FORMAT_VERSION {
        return None;
    }

    let tree = serde_json::from_str::<ThreadTree>(&envelope.1).unwrap_or_default();

    Some(ThreadRow {
        skip_deleted: envelope.2,
        uidvalidity: envelope.3,
        uidnext: envelope.4,
        tree,
    })
}

pub fn encode_message(message: &MessageHeaders) -> Result<String, CacheError> {
    let blob = serde_json::to_string(message)?;
    Ok(serde_json::to_string(&MessageEnvelope(FORMAT_VERSION, blob))?)
}

/// Decode a message row. A corrupt blob reads as a miss so the caller falls
/// back to refetching the headers from the server.
pub fn decode_message(data: &str, uid: Uid) -> Option<MessageHeaders> {
    let envelope: MessageEnvelope = match serde_json::from_str(data) {
        Ok(e) => e,
        Err(err) => {
            debug!("Unreadable message row for uid {}: {}", uid, err);
            return None;
        }
    };
    if envelope.0 != FORMAT_VERSION {
        return None;
    }
    serde_json::from_str(&envelope.1).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index_row() -> IndexRow {
        IndexRow {
            valid: true,
            sort_field: SortField::Date,
            skip_deleted: false,
            uidvalidity: Some(42),
            uidnext: Some(10),
            modseq: Some(100),
            index: MessageIndex::new(SortField::Date, SortOrder::Desc, vec![9, 7, 3]),
        }
    }

    #[test]
    fn test_index_roundtrip() {
        let row = sample_index_row();
        let encoded = encode_index(&row).expect("encode failed");
        let decoded = decode_index(&encoded, true).expect("decode returned miss");
        assert_eq!(decoded, row);
    }

    #[test]
    fn test_index_corrupt_blob_keeps_metadata() {
        let row = sample_index_row();
        let encoded = encode_index(&row).expect("encode failed");
        // Replace the nested blob with garbage, leaving the envelope intact
        let mut envelope: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        envelope[1] = serde_json::Value::String("not json".to_string());
        let decoded = decode_index(&envelope.to_string(), true).expect("metadata should survive");

        assert!(decoded.index.is_empty());
        assert_eq!(decoded.uidvalidity, Some(42));
        assert_eq!(decoded.modseq, Some(100));
        assert!(decoded.valid);
    }

    #[test]
    fn test_index_corrupt_envelope_is_a_miss() {
        assert!(decode_index("garbage", true).is_none());
        assert!(decode_index("{\"not\":\"an array\"}", true).is_none());
    }

    #[test]
    fn test_index_foreign_version_is_a_miss() {
        let row = sample_index_row();
        let encoded = encode_index(&row).expect("encode failed");
        let mut envelope: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        envelope[0] = serde_json::Value::from(99);
        assert!(decode_index(&envelope.to_string(), true).is_none());
    }

    #[test]
    fn test_thread_roundtrip() {
        let row = ThreadRow {
            skip_deleted: true,
            uidvalidity: Some(42),
            uidnext: Some(10),
            tree: ThreadTree {
                roots: vec![crate::types::ThreadNode {
                    uid: 3,
                    children: vec![crate::types::ThreadNode::leaf(7)],
                }],
            },
        };
        let encoded = encode_thread(&row).expect("encode failed");
        let decoded = decode_thread(&encoded).expect("decode returned miss");
        assert_eq!(decoded, row);
    }

    #[test]
    fn test_message_roundtrip() {
        let mut msg = MessageHeaders::new(9);
        msg.subject = Some("hello".to_string());
        msg.size = 1234;
        let encoded = encode_message(&msg).expect("encode failed");
        let decoded = decode_message(&encoded, 9).expect("decode returned miss");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_message_corrupt_is_a_miss() {
        assert!(decode_message("garbage", 9).is_none());
    }
}
