//! Access to the buddy mirrored chunks of local targets
//!
//! Paths are relative to the mirror root of a target and use `/` as the
//! separator. The empty path is the mirror root itself.

use async_trait::async_trait;
use beegfs_core::{BeegfsError, ChunkDirPage, EntryKind, Result, TargetId};
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::targets::StorageTargets;

/// Metadata of one chunk or chunk directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    pub is_dir: bool,
    pub mtime: SystemTime,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Join a relative chunk path and an entry name
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// `None` if the entry does not exist
    async fn stat(&self, target_id: TargetId, rel_path: &str) -> Result<Option<EntryMeta>>;

    /// Entries of a directory sorted by name
    async fn list_dir(&self, target_id: TargetId, rel_path: &str) -> Result<Vec<DirEntry>>;

    /// Up to `len` bytes from `offset`; shorter at the end of the chunk
    async fn read_chunk(
        &self,
        target_id: TargetId,
        rel_path: &str,
        offset: u64,
        len: usize,
    ) -> Result<Bytes>;

    /// Write a block received from the primary. `offset` 0 starts the chunk
    /// over, `last` cuts it off after this block.
    async fn write_chunk(
        &self,
        target_id: TargetId,
        rel_path: &str,
        offset: u64,
        data: Bytes,
        last: bool,
    ) -> Result<()>;

    /// Remove a chunk or an empty directory
    async fn remove_path(&self, target_id: TargetId, rel_path: &str) -> Result<()>;

    /// One page of a directory listing starting at entry `offset`
    async fn list_dir_incremental(
        &self,
        target_id: TargetId,
        rel_path: &str,
        offset: i64,
        max_entries: u32,
    ) -> Result<ChunkDirPage>;
}

/// [`ChunkStore`] on the local file system below `<target>/buddymir`
#[derive(Debug, Clone)]
pub struct FsChunkStore {
    targets: Arc<StorageTargets>,
}

impl FsChunkStore {
    pub fn new(targets: Arc<StorageTargets>) -> Self {
        Self { targets }
    }

    fn resolve(&self, target_id: TargetId, rel_path: &str) -> Result<PathBuf> {
        let root = self.targets.mirror_path(target_id)?;
        let rel = Path::new(rel_path);

        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(BeegfsError::Inval(format!("invalid chunk path: {}", rel_path)));
        }

        Ok(root.join(rel))
    }
}

fn entry_kind(file_type: std::fs::FileType) -> EntryKind {
    if file_type.is_dir() {
        EntryKind::Dir
    } else {
        EntryKind::File
    }
}

#[async_trait]
impl ChunkStore for FsChunkStore {
    async fn stat(&self, target_id: TargetId, rel_path: &str) -> Result<Option<EntryMeta>> {
        let path = self.resolve(target_id, rel_path)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(EntryMeta {
                is_dir: meta.is_dir(),
                mtime: meta.modified()?,
                size: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_dir(&self, target_id: TargetId, rel_path: &str) -> Result<Vec<DirEntry>> {
        let path = self.resolve(target_id, rel_path)?;
        let mut dir = tokio::fs::read_dir(&path).await?;
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: entry_kind(entry.file_type().await?),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read_chunk(
        &self,
        target_id: TargetId,
        rel_path: &str,
        offset: u64,
        len: usize,
    ) -> Result<Bytes> {
        let path = self.resolve(target_id, rel_path)?;
        let mut file = tokio::fs::File::open(&path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write_chunk(
        &self,
        target_id: TargetId,
        rel_path: &str,
        offset: u64,
        data: Bytes,
        last: bool,
    ) -> Result<()> {
        let path = self.resolve(target_id, rel_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(offset == 0)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;

        if last {
            file.set_len(offset + data.len() as u64).await?;
        }
        file.flush().await?;

        Ok(())
    }

    async fn remove_path(&self, target_id: TargetId, rel_path: &str) -> Result<()> {
        let path = self.resolve(target_id, rel_path)?;
        let meta = tokio::fs::symlink_metadata(&path).await?;

        if meta.is_dir() {
            tokio::fs::remove_dir(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }

        debug!(target_id, path = %rel_path, "Removed chunk path");
        Ok(())
    }

    async fn list_dir_incremental(
        &self,
        target_id: TargetId,
        rel_path: &str,
        offset: i64,
        max_entries: u32,
    ) -> Result<ChunkDirPage> {
        let entries = self.list_dir(target_id, rel_path).await?;
        let start = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);

        let mut page = ChunkDirPage::default();
        for entry in entries.into_iter().skip(start).take(max_entries as usize) {
            page.names.push(entry.name);
            page.kinds.push(entry.kind);
        }
        page.new_offset = offset.max(0) + page.names.len() as i64;

        Ok(page)
    }
}
