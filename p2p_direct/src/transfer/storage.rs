//! Storage sinks that receive reassembled file bytes.

use crate::error::StorageError;
use crate::{StoredArtifact, TransferManifest};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::utils::{create_secure_file, deduplicate_name, sanitize_file_name};

/// Destination for received files.
///
/// `prepare` is always awaited before the first `write_region` of a session.
pub trait StorageSink: Send {
    fn prepare(
        &mut self,
        manifest: &TransferManifest,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn write_region(
        &mut self,
        file_id: u32,
        offset: u64,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn finalize(
        &mut self,
        file_id: u32,
    ) -> impl Future<Output = Result<StoredArtifact, StorageError>> + Send;

    /// Discard a partially written file. The default keeps whatever was written.
    fn abort(&mut self, file_id: u32) -> impl Future<Output = ()> + Send {
        let _ = file_id;
        async {}
    }
}

/// Keeps every received file in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    prepared: bool,
    names: HashMap<u32, String>,
    files: HashMap<u32, Vec<u8>>,
    finalized: HashSet<u32>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of a file, finalized or not
    pub fn contents(&self, file_id: u32) -> Option<&[u8]> {
        self.files.get(&file_id).map(Vec::as_slice)
    }

    pub fn is_finalized(&self, file_id: u32) -> bool {
        self.finalized.contains(&file_id)
    }
}

impl StorageSink for MemoryStorage {
    async fn prepare(&mut self, manifest: &TransferManifest) -> Result<(), StorageError> {
        for file in &manifest.files {
            self.names.insert(file.id, file.name.clone());
            self.files.insert(file.id, Vec::new());
        }
        self.prepared = true;
        Ok(())
    }

    async fn write_region(
        &mut self,
        file_id: u32,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        if !self.prepared {
            return Err(StorageError::NotPrepared);
        }
        let buf = self
            .files
            .get_mut(&file_id)
            .ok_or(StorageError::UnknownFile(file_id))?;
        let start = offset as usize;
        let end = start + bytes.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(bytes);
        Ok(())
    }

    async fn finalize(&mut self, file_id: u32) -> Result<StoredArtifact, StorageError> {
        let size = self
            .files
            .get(&file_id)
            .ok_or(StorageError::UnknownFile(file_id))?
            .len() as u64;
        self.finalized.insert(file_id);
        Ok(StoredArtifact {
            file_id,
            name: self.names.get(&file_id).cloned().unwrap_or_default(),
            size,
            location: None,
        })
    }

    async fn abort(&mut self, file_id: u32) {
        self.files.remove(&file_id);
    }
}

struct OpenFile {
    file: File,
    path: PathBuf,
    name: String,
    written: u64,
}

/// Writes received files into a download directory.
///
/// Names announced by the peer are sanitized and de-duplicated against files
/// already present, so nothing is written outside `dir` or overwritten.
pub struct DirectoryStorage {
    dir: PathBuf,
    open: HashMap<u32, OpenFile>,
    prepared: bool,
}

impl std::fmt::Debug for DirectoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryStorage")
            .field("dir", &self.dir)
            .field("open_files", &self.open.len())
            .finish()
    }
}

impl DirectoryStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            open: HashMap::new(),
            prepared: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a declared file is being written to
    pub fn path_of(&self, file_id: u32) -> Option<&Path> {
        self.open.get(&file_id).map(|f| f.path.as_path())
    }
}

impl StorageSink for DirectoryStorage {
    async fn prepare(&mut self, manifest: &TransferManifest) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut taken: HashSet<String> = HashSet::new();
        for descriptor in &manifest.files {
            let clean = sanitize_file_name(&descriptor.name);
            let name = deduplicate_name(&clean, |candidate| {
                taken.contains(candidate) || self.dir.join(candidate).exists()
            });
            if name != descriptor.name {
                debug!("Storing '{}' as '{}'", descriptor.name, name);
            }
            taken.insert(name.clone());

            let path = self.dir.join(&name);
            let file = create_secure_file(&path).await?;
            self.open.insert(
                descriptor.id,
                OpenFile {
                    file,
                    path,
                    name,
                    written: 0,
                },
            );
        }
        self.prepared = true;
        Ok(())
    }

    async fn write_region(
        &mut self,
        file_id: u32,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        if !self.prepared {
            return Err(StorageError::NotPrepared);
        }
        let open = self
            .open
            .get_mut(&file_id)
            .ok_or(StorageError::UnknownFile(file_id))?;
        open.file.seek(SeekFrom::Start(offset)).await?;
        open.file.write_all(bytes).await?;
        open.written = open.written.max(offset + bytes.len() as u64);
        Ok(())
    }

    async fn finalize(&mut self, file_id: u32) -> Result<StoredArtifact, StorageError> {
        let mut open = self
            .open
            .remove(&file_id)
            .ok_or(StorageError::UnknownFile(file_id))?;
        open.file.flush().await?;
        open.file.sync_all().await?;
        Ok(StoredArtifact {
            file_id,
            name: open.name,
            size: open.written,
            location: Some(open.path),
        })
    }

    async fn abort(&mut self, file_id: u32) {
        if let Some(open) = self.open.remove(&file_id) {
            drop(open.file);
            if let Err(e) = tokio::fs::remove_file(&open.path).await {
                warn!("Failed to remove partial file {:?}: {}", open.path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileDescriptor;

    fn manifest(names: &[&str]) -> TransferManifest {
        let files = names
            .iter()
            .enumerate()
            .map(|(i, name)| FileDescriptor {
                id: i as u32,
                name: name.to_string(),
                size: 4,
                media_type: "text/plain".into(),
                modified_at: 0,
            })
            .collect();
        TransferManifest::new(files, false, "blake3")
    }

    #[tokio::test]
    async fn test_memory_storage_out_of_order_regions() {
        let mut storage = MemoryStorage::new();
        storage.prepare(&manifest(&["a.txt"])).await.unwrap();
        storage.write_region(0, 2, b"cd").await.unwrap();
        storage.write_region(0, 0, b"ab").await.unwrap();

        let artifact = storage.finalize(0).await.unwrap();
        assert_eq!(artifact.size, 4);
        assert_eq!(artifact.name, "a.txt");
        assert_eq!(storage.contents(0), Some(&b"abcd"[..]));
        assert!(storage.is_finalized(0));
    }

    #[tokio::test]
    async fn test_memory_storage_requires_prepare() {
        let mut storage = MemoryStorage::new();
        assert!(matches!(
            storage.write_region(0, 0, b"x").await,
            Err(StorageError::NotPrepared)
        ));
    }

    #[tokio::test]
    async fn test_directory_storage_sanitizes_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"old").unwrap();

        let mut storage = DirectoryStorage::new(dir.path());
        storage
            .prepare(&manifest(&["../../notes.txt", "notes.txt", "CON"]))
            .await
            .unwrap();

        assert_eq!(storage.path_of(0).unwrap(), dir.path().join("notes (1).txt"));
        assert_eq!(storage.path_of(1).unwrap(), dir.path().join("notes (2).txt"));
        assert_eq!(storage.path_of(2).unwrap(), dir.path().join("unknown_file"));

        storage.write_region(0, 0, b"data").await.unwrap();
        let artifact = storage.finalize(0).await.unwrap();
        assert_eq!(artifact.size, 4);
        assert_eq!(std::fs::read(artifact.location.unwrap()).unwrap(), b"data");
        assert_eq!(std::fs::read(dir.path().join("notes.txt")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_directory_storage_abort_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = DirectoryStorage::new(dir.path().join("downloads"));
        storage.prepare(&manifest(&["partial.bin"])).await.unwrap();
        storage.write_region(0, 0, b"ab").await.unwrap();

        storage.abort(0).await;
        assert!(!dir.path().join("downloads/partial.bin").exists());
        assert!(matches!(
            storage.finalize(0).await,
            Err(StorageError::UnknownFile(0))
        ));
    }
}
