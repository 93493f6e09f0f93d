//! The vault index: a CRDT map from path to entry.
//!
//! The reserved `__index__` document is the single authority for which files
//! exist. Adding a path means "this file exists everywhere"; removing it
//! means "delete everywhere". Text files carry a bare marker entry; binary
//! files carry their content hash, mtime, origin host and the hash they
//! replaced, so concurrent binary writes can be told apart from plain
//! fast-forwards (see [`judge_blob`]).
//!
//! Entries are stored as JSON strings inside a `yrs` map rooted at
//! `"files"`. Set semantics come from the CRDT itself: concurrent adds both
//! land, concurrent add/remove resolves by the map's own rules.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use yrs::{Any, Doc, Map, Out, Transact};

use crate::blob::conflict_name;

const FILES_ROOT: &str = "files";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IndexEntry {
    /// A CRDT text file; content lives in its own document.
    Text,
    /// A content-addressed binary file.
    Blob {
        hash: String,
        /// Modification time in milliseconds since the epoch.
        mtime: u64,
        /// Human name of the device that produced this version.
        host: String,
        /// Hash this version replaced; the causal breadcrumb that separates
        /// a fast-forward from a concurrent write.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prev: Option<String>,
    },
}

impl IndexEntry {
    pub fn blob(hash: impl Into<String>, mtime: u64, host: impl Into<String>) -> Self {
        IndexEntry::Blob {
            hash: hash.into(),
            mtime,
            host: host.into(),
            prev: None,
        }
    }

    pub fn blob_after(
        hash: impl Into<String>,
        mtime: u64,
        host: impl Into<String>,
        prev: Option<String>,
    ) -> Self {
        IndexEntry::Blob {
            hash: hash.into(),
            mtime,
            host: host.into(),
            prev,
        }
    }
}

pub fn entries(doc: &Doc) -> HashMap<String, IndexEntry> {
    let map = doc.get_or_insert_map(FILES_ROOT);
    let txn = doc.transact();
    let mut result = HashMap::new();
    for (key, value) in map.iter(&txn) {
        if let Some(entry) = parse_entry(value) {
            result.insert(key.to_string(), entry);
        }
    }
    result
}

pub fn get(doc: &Doc, path: &str) -> Option<IndexEntry> {
    let map = doc.get_or_insert_map(FILES_ROOT);
    let txn = doc.transact();
    map.get(&txn, path).and_then(parse_entry)
}

pub fn upsert(doc: &Doc, path: &str, entry: &IndexEntry) {
    // IndexEntry serialization cannot fail: strings and integers only.
    let json = serde_json::to_string(entry).unwrap_or_default();
    let map = doc.get_or_insert_map(FILES_ROOT);
    let mut txn = doc.transact_mut();
    map.insert(&mut txn, path, json);
}

pub fn remove(doc: &Doc, path: &str) -> bool {
    let map = doc.get_or_insert_map(FILES_ROOT);
    let mut txn = doc.transact_mut();
    map.remove(&mut txn, path).is_some()
}

fn parse_entry(value: Out) -> Option<IndexEntry> {
    match value {
        Out::Any(Any::String(s)) => serde_json::from_str(&s).ok(),
        _ => None,
    }
}

/// Local side of a binary comparison.
#[derive(Debug, Clone)]
pub struct LocalBlob {
    pub hash: String,
    pub mtime: u64,
}

/// What to do about a binary path after an index change.
#[derive(Debug, PartialEq, Eq)]
pub enum BlobFate {
    /// Disk already matches the entry.
    InSync,
    /// No conflicting local version: fetch the entry's bytes.
    Fetch,
    /// Concurrent write, ours is newer: keep the name, persist theirs as
    /// `loser_path`.
    LocalWins { loser_path: String },
    /// Concurrent write, theirs is newer: move ours to `loser_path`, fetch
    /// theirs to the original name.
    RemoteWins { loser_path: String },
}

/// Arbitrate a binary path against a (possibly concurrent) index entry.
///
/// `observed` is the entry this replica last saw for the path. The remote
/// entry is a plain fast-forward when it directly replaces what is on disk
/// (`prev == local.hash`), or when the local copy is an unmodified older
/// version that some other host has since moved past. Everything else is a
/// concurrent write: the later mtime keeps the name, equal mtimes fall back
/// to hash order so both sides pick the same winner.
pub fn judge_blob(
    path: &str,
    local: Option<&LocalBlob>,
    observed: Option<&IndexEntry>,
    remote: &IndexEntry,
    local_host: &str,
) -> BlobFate {
    let IndexEntry::Blob {
        hash: remote_hash,
        mtime: remote_mtime,
        host: remote_host,
        prev: remote_prev,
    } = remote
    else {
        return BlobFate::InSync;
    };

    let Some(local) = local else {
        return BlobFate::Fetch;
    };
    if local.hash == *remote_hash {
        return BlobFate::InSync;
    }

    // The remote version directly replaces the bytes we hold.
    if remote_prev.as_deref() == Some(local.hash.as_str()) {
        return BlobFate::Fetch;
    }

    // We hold an unmodified copy of a version another host produced; the
    // remote change is newer history, not a competing edit of ours.
    if let Some(IndexEntry::Blob { hash, host, .. }) = observed {
        if *hash == local.hash && host != local_host {
            return BlobFate::Fetch;
        }
    }

    let local_wins = match local.mtime.cmp(remote_mtime) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => local.hash > *remote_hash,
    };

    if local_wins {
        BlobFate::LocalWins {
            loser_path: conflict_name(path, remote_host),
        }
    } else {
        BlobFate::RemoteWins {
            loser_path: conflict_name(path, local_host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::new_text_doc;

    #[test]
    fn entry_json_shape() {
        let text = serde_json::to_string(&IndexEntry::Text).unwrap();
        assert_eq!(text, r#"{"kind":"text"}"#);

        let blob = IndexEntry::blob_after("abc", 7, "A", Some("zzz".into()));
        let json = serde_json::to_string(&blob).unwrap();
        let parsed: IndexEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, blob);

        // `prev` is optional on the wire.
        let legacy: IndexEntry =
            serde_json::from_str(r#"{"kind":"blob","hash":"h","mtime":3,"host":"A"}"#).unwrap();
        assert_eq!(legacy, IndexEntry::blob("h", 3, "A"));
    }

    #[test]
    fn upsert_get_remove_roundtrip() {
        let doc = new_text_doc();
        assert!(get(&doc, "notes/a.md").is_none());

        upsert(&doc, "notes/a.md", &IndexEntry::Text);
        upsert(&doc, "logo.png", &IndexEntry::blob("h1", 10, "A"));

        assert_eq!(get(&doc, "notes/a.md"), Some(IndexEntry::Text));
        assert_eq!(get(&doc, "logo.png"), Some(IndexEntry::blob("h1", 10, "A")));

        let all = entries(&doc);
        assert_eq!(all.len(), 2);

        assert!(remove(&doc, "notes/a.md"));
        assert!(!remove(&doc, "notes/a.md"));
        assert!(get(&doc, "notes/a.md").is_none());
    }

    #[test]
    fn concurrent_adds_merge_through_updates() {
        use yrs::updates::decoder::Decode;
        use yrs::updates::encoder::Encode;
        use yrs::{ReadTxn, StateVector, Update};

        let a = new_text_doc();
        let b = new_text_doc();
        upsert(&a, "from-a.md", &IndexEntry::Text);
        upsert(&b, "from-b.md", &IndexEntry::Text);

        let ua = a
            .transact()
            .encode_state_as_update_v1(&StateVector::default());
        let ub = b
            .transact()
            .encode_state_as_update_v1(&StateVector::default());

        let mut txn = a.transact_mut();
        txn.apply_update(Update::decode_v1(&ub).unwrap()).unwrap();
        drop(txn);
        let mut txn = b.transact_mut();
        txn.apply_update(Update::decode_v1(&ua).unwrap()).unwrap();
        drop(txn);

        assert_eq!(entries(&a), entries(&b));
        assert_eq!(entries(&a).len(), 2);
    }

    #[test]
    fn judge_missing_local_fetches() {
        let fate = judge_blob("logo.png", None, None, &IndexEntry::blob("h1", 5, "B"), "A");
        assert_eq!(fate, BlobFate::Fetch);
    }

    #[test]
    fn judge_matching_hash_in_sync() {
        let local = LocalBlob {
            hash: "h1".into(),
            mtime: 5,
        };
        let fate = judge_blob(
            "logo.png",
            Some(&local),
            None,
            &IndexEntry::blob("h1", 9, "B"),
            "A",
        );
        assert_eq!(fate, BlobFate::InSync);
    }

    #[test]
    fn judge_direct_successor_fast_forwards() {
        // Remote edited exactly the bytes we hold, even though we authored
        // them: sequential, not a conflict.
        let local = LocalBlob {
            hash: "h1".into(),
            mtime: 5,
        };
        let observed = IndexEntry::blob("h1", 5, "A");
        let remote = IndexEntry::blob_after("h2", 9, "B", Some("h1".into()));
        let fate = judge_blob("logo.png", Some(&local), Some(&observed), &remote, "A");
        assert_eq!(fate, BlobFate::Fetch);
    }

    #[test]
    fn judge_unmodified_older_copy_fast_forwards() {
        // We hold B's old version untouched; B has moved on twice.
        let local = LocalBlob {
            hash: "h2".into(),
            mtime: 5,
        };
        let observed = IndexEntry::blob("h2", 5, "B");
        let remote = IndexEntry::blob_after("h4", 9, "B", Some("h3".into()));
        let fate = judge_blob("logo.png", Some(&local), Some(&observed), &remote, "A");
        assert_eq!(fate, BlobFate::Fetch);
    }

    #[test]
    fn judge_concurrent_later_mtime_wins() {
        // Both sides diverged from h0 while offline.
        let observed = IndexEntry::blob_after("h1", 10, "A", Some("h0".into()));

        // Remote is newer: ours moves aside under our host name.
        let local = LocalBlob {
            hash: "h1".into(),
            mtime: 10,
        };
        let remote = IndexEntry::blob_after("h2", 20, "B", Some("h0".into()));
        let fate = judge_blob("logo.png", Some(&local), Some(&observed), &remote, "A");
        assert_eq!(
            fate,
            BlobFate::RemoteWins {
                loser_path: "logo (A).png".into()
            }
        );

        // Ours is newer: theirs is persisted under their host name.
        let local = LocalBlob {
            hash: "h1".into(),
            mtime: 30,
        };
        let fate = judge_blob("logo.png", Some(&local), Some(&observed), &remote, "A");
        assert_eq!(
            fate,
            BlobFate::LocalWins {
                loser_path: "logo (B).png".into()
            }
        );
    }

    #[test]
    fn judge_equal_mtimes_break_by_hash() {
        let observed = IndexEntry::blob_after("zzz", 10, "A", Some("h0".into()));
        let local = LocalBlob {
            hash: "zzz".into(),
            mtime: 10,
        };
        let remote = IndexEntry::blob_after("aaa", 10, "B", Some("h0".into()));
        let fate = judge_blob("logo.png", Some(&local), Some(&observed), &remote, "A");
        assert!(matches!(fate, BlobFate::LocalWins { .. }));
    }
}
