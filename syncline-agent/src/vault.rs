//! Vault directory layout: doc-id mapping, file classification, startup scan.

use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

/// Directory names excluded from sync, matched by exact basename. Prefix
/// matching would swallow legitimate files like `.gitignore`.
const SKIPPED_DIRS: [&str; 2] = [".git", ".syncline"];

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("path {0} is outside the vault")]
    OutsideVault(PathBuf),

    #[error("vault io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// `.md` / `.txt`: synced as a text CRDT document.
    Text,
    /// Everything else: synced as a content-addressed blob.
    Blob,
}

/// One file found by the startup scan.
#[derive(Debug, Clone)]
pub struct ScanItem {
    pub doc_id: String,
    pub path: PathBuf,
    pub kind: FileKind,
}

/// The watched directory and its `.syncline` sidecar.
#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
    state_dir: PathBuf,
}

impl Vault {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, VaultError> {
        // Canonicalize so paths reported by the watcher (which resolves
        // symlinks, e.g. /var → /private/var on macOS) strip cleanly.
        let root = root
            .as_ref()
            .canonicalize()
            .unwrap_or_else(|_| root.as_ref().to_path_buf());
        let state_dir = root.join(".syncline").join("data");
        std::fs::create_dir_all(&state_dir)?;
        Ok(Self { root, state_dir })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where replica documents persist their full state.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Vault-relative doc id for a physical path (`notes/idea.md`).
    pub fn doc_id_for(&self, path: &Path) -> Result<String, VaultError> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let rel = canonical
            .strip_prefix(&self.root)
            .map_err(|_| VaultError::OutsideVault(path.to_path_buf()))?;
        Ok(rel.to_string_lossy().replace('\\', "/"))
    }

    /// Physical path for a doc id.
    pub fn abs_path(&self, doc_id: &str) -> PathBuf {
        self.root.join(doc_id)
    }

    pub fn kind_of(path: &Path) -> FileKind {
        match path.extension().and_then(|e| e.to_str()) {
            Some("md") | Some("txt") => FileKind::Text,
            _ => FileKind::Blob,
        }
    }

    /// Whether any component of the path is an excluded directory.
    pub fn is_excluded(path: &Path) -> bool {
        path.components().any(|c| {
            matches!(c, std::path::Component::Normal(name)
                if SKIPPED_DIRS.iter().any(|skip| name == std::ffi::OsStr::new(skip)))
        })
    }

    /// Enumerate every syncable file. Entries that fail to resolve log and
    /// are skipped; the walk itself never aborts.
    pub fn scan(&self) -> Vec<ScanItem> {
        let mut items = Vec::new();
        let walker = WalkDir::new(&self.root).into_iter().filter_entry(|e| {
            !(e.file_type().is_dir()
                && SKIPPED_DIRS
                    .iter()
                    .any(|skip| e.file_name() == std::ffi::OsStr::new(skip)))
        });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("scan: skipping unreadable entry: {e}");
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            let doc_id = match self.doc_id_for(path) {
                Ok(id) => id,
                Err(e) => {
                    log::warn!("scan: skipping {}: {e}", path.display());
                    continue;
                }
            };
            items.push(ScanItem {
                doc_id,
                kind: Self::kind_of(path),
                path: path.to_path_buf(),
            });
        }
        items
    }

    /// Doc ids with persisted replica state from earlier runs.
    pub fn persisted_doc_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for entry in WalkDir::new(&self.state_dir)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = path.strip_prefix(&self.state_dir) else {
                continue;
            };
            let rel = rel.to_string_lossy().replace('\\', "/");
            if let Some(doc_id) = rel.strip_suffix(".bin") {
                ids.push(doc_id.to_owned());
            }
        }
        ids
    }
}
