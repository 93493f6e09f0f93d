//! Character diff between the replica text and the on-disk text, applied as
//! minimal insert/delete ops.
//!
//! Offsets handed to the CRDT are **byte** offsets: documents are created
//! with byte-offset indexing (see [`crate::replica`]), and `similar` change
//! values are `&str` slices whose `len()` is their byte length. Counting
//! chars here instead would desynchronize the first time a multi-byte
//! character appears.

use similar::{ChangeTag, TextDiff};
use yrs::{Doc, Text, TextRef, Transact};

/// Mutate `text` so its content becomes `new`, emitting the smallest
/// insert/delete sequence the character diff finds.
pub fn apply_text_diff(doc: &Doc, text: &TextRef, old: &str, new: &str) {
    let diff = TextDiff::from_chars(old, new);
    let mut txn = doc.transact_mut();

    // Cursor tracks the byte position in the evolving text.
    let mut cursor = 0u32;
    for change in diff.iter_all_changes() {
        let value = change.value();
        match change.tag() {
            ChangeTag::Equal => {
                cursor += value.len() as u32;
            }
            ChangeTag::Delete => {
                text.remove_range(&mut txn, cursor, value.len() as u32);
            }
            ChangeTag::Insert => {
                text.insert(&mut txn, cursor, value);
                cursor += value.len() as u32;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::new_text_doc;
    use yrs::GetString;

    fn seeded(content: &str) -> (Doc, TextRef) {
        let doc = new_text_doc();
        let text = doc.get_or_insert_text("content");
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, content);
        drop(txn);
        (doc, text)
    }

    fn current(doc: &Doc, text: &TextRef) -> String {
        let txn = doc.transact();
        text.get_string(&txn)
    }

    #[test]
    fn insert_in_the_middle() {
        let (doc, text) = seeded("Hello World");
        apply_text_diff(&doc, &text, "Hello World", "Hello CRDT World!");
        assert_eq!(current(&doc, &text), "Hello CRDT World!");
    }

    #[test]
    fn delete_in_the_middle() {
        let (doc, text) = seeded("Hello CRDT World!");
        apply_text_diff(&doc, &text, "Hello CRDT World!", "Hello World");
        assert_eq!(current(&doc, &text), "Hello World");
    }

    #[test]
    fn full_replacement() {
        let (doc, text) = seeded("old text");
        apply_text_diff(&doc, &text, "old text", "completely different");
        assert_eq!(current(&doc, &text), "completely different");
    }

    #[test]
    fn empty_to_content_and_back() {
        let (doc, text) = seeded("");
        apply_text_diff(&doc, &text, "", "fresh");
        assert_eq!(current(&doc, &text), "fresh");
        apply_text_diff(&doc, &text, "fresh", "");
        assert_eq!(current(&doc, &text), "");
    }

    #[test]
    fn edit_after_multibyte_char() {
        let (doc, text) = seeded("🚀a");
        // Changing 'a' to 'b' after a 4-byte emoji: a char-counting cursor
        // would target byte 1, inside the emoji.
        apply_text_diff(&doc, &text, "🚀a", "🚀b");
        assert_eq!(current(&doc, &text), "🚀b");
    }

    #[test]
    fn insert_before_accented_text() {
        let (doc, text) = seeded("café");
        apply_text_diff(&doc, &text, "café", "le café");
        assert_eq!(current(&doc, &text), "le café");
    }

    #[test]
    fn append_emoji_then_edit_at_start() {
        let (doc, text) = seeded("café");
        apply_text_diff(&doc, &text, "café", "café🚀");
        assert_eq!(current(&doc, &text), "café🚀");
        // No index skew on a subsequent insert at position 0.
        apply_text_diff(&doc, &text, "café🚀", "Xcafé🚀");
        assert_eq!(current(&doc, &text), "Xcafé🚀");
    }

    #[test]
    fn combining_marks_survive() {
        // "e" + U+0301 combining acute, visually "é".
        let (doc, text) = seeded("ne\u{0301}e");
        apply_text_diff(&doc, &text, "ne\u{0301}e", "ne\u{0301}es");
        assert_eq!(current(&doc, &text), "ne\u{0301}es");
    }
}
