// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Local scratch directories, remote object storage, and the mapping
//! between them for one (segment, field) disk index.

use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use object_store::path::Path as StorePath;
use object_store::ObjectStore;
use snafu::location;

use canopy_core::data::FieldData;
use canopy_core::{Error, FieldId, Result};

use crate::engine::VectorDataset;

/// Narrow filesystem capability for local scratch data.
///
/// All paths are relative to the manager's root. Replaces a process-wide
/// singleton: every disk index receives its manager at construction.
#[derive(Debug)]
pub struct LocalChunkManager {
    root: PathBuf,
}

impl LocalChunkManager {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn exist(&self, rel: &str) -> bool {
        self.full(rel).exists()
    }

    pub fn create_dir(&self, rel: &str) -> Result<()> {
        std::fs::create_dir_all(self.full(rel))?;
        Ok(())
    }

    /// Recursively removes the directory; absent directories are fine.
    pub fn remove_dir(&self, rel: &str) -> Result<()> {
        let path = self.full(rel);
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    pub fn create_file(&self, rel: &str) -> Result<()> {
        let path = self.full(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(path)?;
        Ok(())
    }

    pub fn write_at(&self, rel: &str, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(self.full(rel))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    pub fn read_all(&self, rel: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.full(rel))?)
    }

    pub fn file_size(&self, rel: &str) -> Result<u64> {
        Ok(std::fs::metadata(self.full(rel))?.len())
    }

    /// Names of the regular files directly under `rel`, sorted.
    pub fn list_files(&self, rel: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.full(rel))? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Process-level default rooted in the system temp directory, for tests
/// and tools that do not inject their own scratch space.
pub fn default_local_chunk_manager() -> Arc<LocalChunkManager> {
    static DEFAULT: OnceLock<Arc<LocalChunkManager>> = OnceLock::new();
    DEFAULT
        .get_or_init(|| {
            let root = std::env::temp_dir().join(format!("canopy-scratch-{}", std::process::id()));
            Arc::new(LocalChunkManager::new(root).expect("temp dir must be writable"))
        })
        .clone()
}

/// Serializes a dataset into the write-once staging layout: `u32` LE row
/// count, `u32` LE dim, then the packed body. No padding, no checksum.
pub fn encode_staged_vectors(dataset: &VectorDataset) -> Result<Vec<u8>> {
    let rows = dataset.rows() as u32;
    let dim = dataset.dim();
    let mut buf = Vec::with_capacity(8 + rows as usize * dataset.row_width());
    buf.write_u32::<LittleEndian>(rows)?;
    buf.write_u32::<LittleEndian>(dim)?;
    match dataset {
        VectorDataset::Float { data, .. } => {
            for v in data {
                buf.write_f32::<LittleEndian>(*v)?;
            }
        }
        VectorDataset::Binary { data, .. } => {
            buf.extend_from_slice(data);
        }
    }
    Ok(buf)
}

/// Reads a float staging file back into a dataset.
pub fn decode_staged_floats(bytes: &[u8]) -> Result<VectorDataset> {
    let mut cursor = std::io::Cursor::new(bytes);
    let rows = cursor.read_u32::<LittleEndian>()?;
    let dim = cursor.read_u32::<LittleEndian>()?;
    let mut data = vec![0f32; rows as usize * dim as usize];
    cursor.read_f32_into::<LittleEndian>(&mut data)?;
    Ok(VectorDataset::Float { dim, data })
}

/// Mediates staging for one (segment, field): raw vectors and index
/// artifacts move between the injected local scratch capability and the
/// remote object store.
///
/// The engine shares the local capability through an [`Arc`]; the engine
/// never outlives the owning disk index.
pub struct FileManager {
    local: Arc<LocalChunkManager>,
    remote: Arc<dyn ObjectStore>,
    remote_prefix: StorePath,
    segment_id: i64,
    field_id: FieldId,
}

impl FileManager {
    pub fn new(
        local: Arc<LocalChunkManager>,
        remote: Arc<dyn ObjectStore>,
        remote_prefix: StorePath,
        segment_id: i64,
        field_id: FieldId,
    ) -> Self {
        Self {
            local,
            remote,
            remote_prefix,
            segment_id,
            field_id,
        }
    }

    pub fn local(&self) -> &Arc<LocalChunkManager> {
        &self.local
    }

    pub fn local_index_prefix(&self) -> String {
        format!("index/{}/{}", self.segment_id, self.field_id)
    }

    pub fn local_raw_data_prefix(&self) -> String {
        format!("raw_data/{}/{}", self.segment_id, self.field_id)
    }

    pub fn staged_raw_data_path(&self) -> String {
        format!("{}/raw_data", self.local_raw_data_prefix())
    }

    pub fn staged_scalar_path(&self) -> String {
        format!("{}/scalar_data", self.local_raw_data_prefix())
    }

    /// Downloads raw-vector shards, concatenates them, and stages the
    /// result locally. Returns the staged path.
    pub async fn cache_raw_data_to_disk(&self, insert_files: &[String]) -> Result<String> {
        if insert_files.is_empty() {
            return Err(Error::invalid_input(
                "insert file paths are empty when building a disk index",
                location!(),
            ));
        }
        let mut merged: Option<FieldData> = None;
        for file in insert_files {
            let bytes = self.fetch(file).await?;
            let shard: FieldData = bincode::deserialize(&bytes)?;
            match merged.as_mut() {
                None => merged = Some(shard),
                Some(data) => data.extend(shard)?,
            }
        }
        let dataset = match merged {
            Some(FieldData::FloatVector { dim, data }) => VectorDataset::Float { dim, data },
            Some(FieldData::BinaryVector { dim, data }) => VectorDataset::Binary { dim, data },
            Some(other) => {
                return Err(Error::data_type(
                    format!("{} shards cannot back a vector index", other.data_type()),
                    location!(),
                ));
            }
            // Unreachable given the emptiness check above.
            None => {
                return Err(Error::invalid_input("no raw data collected", location!()));
            }
        };
        self.stage_dataset(&dataset)
    }

    /// Stages an in-memory dataset into the raw-data layout.
    pub fn stage_dataset(&self, dataset: &VectorDataset) -> Result<String> {
        let path = self.staged_raw_data_path();
        if !self.local.exist(&path) {
            self.local.create_file(&path)?;
        }
        let buf = encode_staged_vectors(dataset)?;
        self.local.write_at(&path, 0, &buf)?;
        Ok(path)
    }

    /// Downloads auxiliary scalar shards into a single staged file.
    pub async fn cache_opt_field_to_disk(&self, files: &[String]) -> Result<String> {
        let mut merged: Option<FieldData> = None;
        for file in files {
            let bytes = self.fetch(file).await?;
            let shard: FieldData = bincode::deserialize(&bytes)?;
            match merged.as_mut() {
                None => merged = Some(shard),
                Some(data) => data.extend(shard)?,
            }
        }
        let merged = merged.ok_or_else(|| {
            Error::invalid_input("auxiliary scalar field has no shards", location!())
        })?;
        let path = self.staged_scalar_path();
        self.local.create_file(&path)?;
        self.local.write_at(&path, 0, &bincode::serialize(&merged)?)?;
        Ok(path)
    }

    /// Downloads index artifacts into the local index prefix, keyed by the
    /// final path component.
    pub async fn cache_index_to_disk(&self, index_files: &[String]) -> Result<()> {
        for file in index_files {
            let bytes = self.fetch(file).await?;
            let name = file.rsplit('/').next().unwrap_or(file.as_str());
            let local_path = format!("{}/{}", self.local_index_prefix(), name);
            self.local.create_file(&local_path)?;
            self.local.write_at(&local_path, 0, &bytes)?;
        }
        Ok(())
    }

    /// Uploads every local index artifact; returns (remote path, size).
    pub async fn upload_index_files(&self) -> Result<Vec<(String, u64)>> {
        let prefix = self.local_index_prefix();
        let mut uploaded = Vec::new();
        for name in self.local.list_files(&prefix)? {
            let bytes = self.local.read_all(&format!("{}/{}", prefix, name))?;
            let size = bytes.len() as u64;
            let remote_path = self.remote_prefix.child(name.as_str());
            self.remote
                .put(&remote_path, Bytes::from(bytes).into())
                .await?;
            uploaded.push((remote_path.to_string(), size));
        }
        Ok(uploaded)
    }

    async fn fetch(&self, path: &str) -> Result<Bytes> {
        let path = StorePath::parse(path)?;
        Ok(self.remote.get(&path).await?.bytes().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use tempfile::TempDir;

    fn local() -> (TempDir, Arc<LocalChunkManager>) {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(LocalChunkManager::new(dir.path()).unwrap());
        (dir, manager)
    }

    #[test]
    fn test_staging_round_trip() {
        let dataset = VectorDataset::Float {
            dim: 4,
            data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
        };
        let bytes = encode_staged_vectors(&dataset).unwrap();
        // header: u32 rows, u32 dim
        assert_eq!(&bytes[..4], 2u32.to_le_bytes().as_slice());
        assert_eq!(&bytes[4..8], 4u32.to_le_bytes().as_slice());
        assert_eq!(bytes.len(), 8 + 8 * 4);
        assert_eq!(decode_staged_floats(&bytes).unwrap(), dataset);
    }

    #[test]
    fn test_local_chunk_manager_write_read() {
        let (_dir, manager) = local();
        manager.create_file("a/b/file").unwrap();
        manager.write_at("a/b/file", 0, b"hello").unwrap();
        manager.write_at("a/b/file", 5, b" world").unwrap();
        assert_eq!(manager.read_all("a/b/file").unwrap(), b"hello world");
        assert_eq!(manager.file_size("a/b/file").unwrap(), 11);
        assert!(manager.exist("a/b/file"));
        manager.remove_dir("a").unwrap();
        assert!(!manager.exist("a/b/file"));
        // removing again is a no-op
        manager.remove_dir("a").unwrap();
    }

    #[tokio::test]
    async fn test_cache_and_upload() {
        let (_dir, manager) = local();
        let remote: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let fm = FileManager::new(
            manager.clone(),
            remote.clone(),
            StorePath::from("indexes/1/101"),
            1,
            FieldId(101),
        );

        let shard = FieldData::FloatVector {
            dim: 2,
            data: vec![1.0, 2.0],
        };
        remote
            .put(
                &StorePath::from("insert_log/0"),
                Bytes::from(bincode::serialize(&shard).unwrap()).into(),
            )
            .await
            .unwrap();

        let staged = fm
            .cache_raw_data_to_disk(&["insert_log/0".to_string()])
            .await
            .unwrap();
        let decoded = decode_staged_floats(&manager.read_all(&staged).unwrap()).unwrap();
        assert_eq!(decoded.rows(), 1);

        // stash an artifact and round-trip it through the remote store
        let artifact = format!("{}/flat.bin", fm.local_index_prefix());
        manager.create_file(&artifact).unwrap();
        manager.write_at(&artifact, 0, b"artifact-bytes").unwrap();
        let uploaded = fm.upload_index_files().await.unwrap();
        assert_eq!(uploaded.len(), 1);
        assert_eq!(uploaded[0].1, 14);

        manager.remove_dir(&fm.local_index_prefix()).unwrap();
        fm.cache_index_to_disk(&[uploaded[0].0.clone()]).await.unwrap();
        assert_eq!(
            manager.read_all(&artifact).unwrap(),
            b"artifact-bytes".to_vec()
        );
    }

    #[tokio::test]
    async fn test_cache_raw_data_requires_files() {
        let (_dir, manager) = local();
        let remote: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let fm = FileManager::new(manager, remote, StorePath::from("p"), 1, FieldId(101));
        assert!(fm.cache_raw_data_to_disk(&[]).await.is_err());
    }
}
