//! Content addressing for binary files and the conflict rename rule.

use std::path::Path;

use sha2::{Digest, Sha256};

/// Hex SHA-256 of raw bytes — the identity of a blob everywhere in the
/// system (index entries, store keys, wire payloads).
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Raw 32-byte digest, for wire payloads.
pub fn digest_bytes(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}

/// File mtime in milliseconds since the epoch; 0 when unavailable.
pub fn mtime_millis(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Where a losing binary conflict version is persisted:
/// `"notes/logo.png"` lost by host `"A"` becomes `"notes/logo (A).png"`.
pub fn conflict_name(path: &str, origin_host: &str) -> String {
    let p = Path::new(path);
    let stem = p
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let renamed = match p.extension() {
        Some(ext) => format!("{stem} ({origin_host}).{}", ext.to_string_lossy()),
        None => format!("{stem} ({origin_host})"),
    };
    match p.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            format!("{}/{renamed}", parent.to_string_lossy())
        }
        _ => renamed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_content_addressed() {
        let a = hash_bytes(b"hello");
        let b = hash_bytes(b"hello");
        let c = hash_bytes(b"hello!");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn digest_matches_hex_hash() {
        let digest = digest_bytes(b"hello");
        assert_eq!(hex::encode(&digest), hash_bytes(b"hello"));
    }

    #[test]
    fn conflict_name_with_extension() {
        assert_eq!(conflict_name("logo.png", "A"), "logo (A).png");
    }

    #[test]
    fn conflict_name_without_extension() {
        assert_eq!(conflict_name("Makefile", "bob-laptop"), "Makefile (bob-laptop)");
    }

    #[test]
    fn conflict_name_keeps_directories() {
        assert_eq!(
            conflict_name("assets/img/logo.png", "A"),
            "assets/img/logo (A).png"
        );
    }
}
