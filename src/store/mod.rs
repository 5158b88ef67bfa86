//! Durable Store: crash-safe JSON documents on local disk.
//!
//! `save` writes to a fresh temp file next to the target, fsyncs it and
//! renames it over the target. `load` never fails: a missing, unreadable or
//! unparsable document yields the caller's default. Temp files orphaned by a
//! writer that died before renaming are removed by `sweep_stale_temps`.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// The documents the relay persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Document {
    /// Correspondent id (as string) -> ordered message lines.
    Conversations,
    /// Sequence of correspondent ids ever messaged.
    Correspondents,
}

impl Document {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Conversations => "conversations.json",
            Self::Correspondents => "correspondents.json",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DurableStore {
    dir: PathBuf,
}

impl DurableStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, document: Document) -> PathBuf {
        self.dir.join(document.file_name())
    }

    pub fn save<T: Serialize + ?Sized>(&self, document: Document, value: &T) -> Result<()> {
        replace_atomic(&self.path(document), |file| {
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, value)
                .with_context(|| format!("Failed to serialize {}", document.file_name()))?;
            writer.flush().context("Failed to write temporary file contents")
        })
    }

    /// Remove temp files left next to the documents by an interrupted save.
    /// Only call this while no save is in progress. Returns how many were
    /// removed.
    pub fn sweep_stale_temps(&self) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return 0,
            Err(e) => {
                tracing::warn!("Could not scan {} for temp files: {e}", self.dir.display());
                return 0;
            }
        };

        let prefixes: Vec<String> = [Document::Conversations, Document::Correspondents]
            .iter()
            .map(|doc| temp_prefix(doc.file_name()))
            .collect();
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !prefixes.iter().any(|prefix| name.starts_with(prefix.as_str())) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Could not remove stale temp file {name}: {e}"),
            }
        }
        if removed > 0 {
            tracing::info!("Removed {removed} stale temp files from {}", self.dir.display());
        }
        removed
    }

    pub fn load<T: DeserializeOwned>(&self, document: Document, default: T) -> T {
        let path = self.path(document);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return default,
            Err(e) => {
                tracing::warn!("Could not read {}, starting empty: {e}", path.display());
                return default;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Ignoring corrupt {}: {e}", path.display());
                default
            }
        }
    }
}

/// Replace `path` with `bytes` atomically.
///
/// On any failure the temp file is removed and the previous contents of
/// `path` are left as they were.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    replace_atomic(path, |file| {
        file.write_all(bytes)
            .context("Failed to write temporary file contents")
    })
}

fn temp_prefix(file_name: &str) -> String {
    format!(".{file_name}.tmp-")
}

/// Create a temp file next to `path`, let `write` fill it, fsync it and
/// rename it over `path`. The temp file never outlives a failure.
fn replace_atomic<W>(path: &Path, write: W) -> Result<()>
where
    W: FnOnce(&mut File) -> Result<()>,
{
    let parent_dir = path
        .parent()
        .context("Document path must have a parent directory")?;
    fs::create_dir_all(parent_dir)
        .with_context(|| format!("Failed to create directory: {}", parent_dir.display()))?;

    let file_name = path
        .file_name()
        .and_then(|v| v.to_str())
        .context("Document path must have a file name")?;
    let temp_path = parent_dir.join(format!("{}{}", temp_prefix(file_name), uuid::Uuid::new_v4()));

    if let Err(e) = write_synced(&temp_path, write) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        anyhow::bail!("Failed to atomically replace {}: {e}", path.display());
    }

    sync_directory(parent_dir)
}

fn write_synced<W>(temp_path: &Path, write: W) -> Result<()>
where
    W: FnOnce(&mut File) -> Result<()>,
{
    let mut temp_file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .with_context(|| format!("Failed to create temporary file: {}", temp_path.display()))?;
    write(&mut temp_file)?;
    temp_file
        .sync_all()
        .context("Failed to fsync temporary file")?;
    Ok(())
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> Result<()> {
    let dir = File::open(path)
        .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
    dir.sync_all()
        .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::types::{ConversationMap, CorrespondentId};
    use tempfile::TempDir;

    fn temp_names(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.contains(".tmp-"))
            .collect()
    }

    #[test]
    fn save_then_load_roundtrips() {
        let tmp = TempDir::new().unwrap();
        let store = DurableStore::new(tmp.path());

        let mut conversations = ConversationMap::new();
        conversations.insert(CorrespondentId(100), vec!["X: hi".into(), "You: yo".into()]);
        store.save(Document::Conversations, &conversations).unwrap();

        let loaded: ConversationMap = store.load(Document::Conversations, ConversationMap::new());
        assert_eq!(loaded, conversations);
        assert!(temp_names(tmp.path()).is_empty());
    }

    #[test]
    fn missing_document_yields_default() {
        let tmp = TempDir::new().unwrap();
        let store = DurableStore::new(tmp.path().join("not-yet-created"));
        let known: Vec<CorrespondentId> = store.load(Document::Correspondents, Vec::new());
        assert!(known.is_empty());
    }

    #[test]
    fn corrupt_document_yields_default() {
        let tmp = TempDir::new().unwrap();
        let store = DurableStore::new(tmp.path());
        fs::write(store.path(Document::Correspondents), b"[1, 2,").unwrap();

        let known: Vec<CorrespondentId> =
            store.load(Document::Correspondents, vec![CorrespondentId(9)]);
        assert_eq!(known, vec![CorrespondentId(9)]);
    }

    /// Serializes one element, then fails.
    struct FailsMidway;

    impl Serialize for FailsMidway {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            use serde::ser::{Error, SerializeSeq};
            let mut seq = serializer.serialize_seq(Some(2))?;
            seq.serialize_element(&CorrespondentId(7))?;
            Err(S::Error::custom("disk pulled mid-write"))
        }
    }

    #[test]
    fn failure_after_temp_file_is_created_leaves_original_intact() {
        let tmp = TempDir::new().unwrap();
        let store = DurableStore::new(tmp.path());
        store
            .save(Document::Correspondents, &vec![CorrespondentId(1)])
            .unwrap();
        let path = store.path(Document::Correspondents);
        let before = fs::read(&path).unwrap();

        let err = store
            .save(Document::Correspondents, &FailsMidway)
            .unwrap_err();
        assert!(format!("{err:#}").contains("disk pulled mid-write"));

        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(temp_names(tmp.path()).is_empty());
        let known: Vec<CorrespondentId> = store.load(Document::Correspondents, Vec::new());
        assert_eq!(known, vec![CorrespondentId(1)]);
    }

    #[test]
    fn orphaned_temp_files_are_swept() {
        let tmp = TempDir::new().unwrap();
        let store = DurableStore::new(tmp.path());
        store
            .save(Document::Correspondents, &vec![CorrespondentId(1)])
            .unwrap();

        // Writers that died after creating their temp file but before renaming.
        fs::write(
            tmp.path().join(".correspondents.json.tmp-crashed"),
            b"[1, 2, 3]",
        )
        .unwrap();
        fs::write(tmp.path().join(".conversations.json.tmp-crashed"), b"{").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"keep").unwrap();

        assert_eq!(store.sweep_stale_temps(), 2);
        assert!(temp_names(tmp.path()).is_empty());
        assert!(tmp.path().join("notes.txt").exists());

        let known: Vec<CorrespondentId> = store.load(Document::Correspondents, Vec::new());
        assert_eq!(known, vec![CorrespondentId(1)]);
        assert_eq!(store.sweep_stale_temps(), 0);
    }

    #[test]
    fn sweeping_a_missing_directory_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let store = DurableStore::new(tmp.path().join("absent"));
        assert_eq!(store.sweep_stale_temps(), 0);
    }

    #[test]
    fn failed_rename_removes_temp_file() {
        let tmp = TempDir::new().unwrap();
        let store = DurableStore::new(tmp.path());

        // A non-empty directory squatting on the target makes rename fail.
        let target = store.path(Document::Conversations);
        fs::create_dir_all(target.join("occupied")).unwrap();

        let result = store.save(Document::Conversations, &ConversationMap::new());
        assert!(result.is_err());
        assert!(target.join("occupied").exists());
        assert!(temp_names(tmp.path()).is_empty());
    }

    #[test]
    fn save_replaces_previous_value() {
        let tmp = TempDir::new().unwrap();
        let store = DurableStore::new(tmp.path());
        store
            .save(Document::Correspondents, &vec![CorrespondentId(1)])
            .unwrap();
        store
            .save(
                Document::Correspondents,
                &vec![CorrespondentId(1), CorrespondentId(2)],
            )
            .unwrap();

        let raw = fs::read_to_string(store.path(Document::Correspondents)).unwrap();
        let parsed: Vec<u64> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, vec![1, 2]);
    }
}
