// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Lifecycle of an out-of-core vector index for one (segment, field).
//!
//! Exactly one of [`DiskAnnIndex::build`] or [`DiskAnnIndex::load`] runs in
//! an index's lifetime. Build stages raw vectors to local scratch and hands
//! them to the engine; load re-hydrates previously uploaded artifacts.

pub mod file_manager;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use roaring::RoaringBitmap;
use snafu::location;
use tracing::{info, info_span, Instrument};

use canopy_core::{Error, Result};

use crate::distance::{check_range_search_params, Metric};
use crate::engine::{
    AnnIterator, BinarySet, EngineBuildParams, EngineHits, EngineLoadParams, EngineSearchParams,
    VectorDataset, VectorEngine, CURRENT_INDEX_VERSION, MINIMAL_INDEX_VERSION,
};
use crate::query::{round_distances, SearchInfo, SearchResult};
use file_manager::FileManager;

/// DiskANN caps its candidate list at 200 for small topk.
const SEARCH_LIST_MAX_SMALL_TOPK: usize = 200;
/// Cap for topk above 20.
const SEARCH_LIST_MAX_LARGE_TOPK: usize = 65535;
/// Beamwidth used when the load config does not override it.
const DEFAULT_BEAMWIDTH: usize = 8;

/// Build-time configuration.
#[derive(Debug, Clone, Default)]
pub struct DiskAnnBuildParams {
    /// Remote shard files carrying the field's raw vectors.
    pub insert_files: Vec<String>,
    /// String-typed on the wire; must parse to a positive thread count.
    pub build_thread_num: String,
    /// Remote shard files of an auxiliary scalar field, staged only when
    /// the engine advertises additional-scalar support.
    pub vec_opt_fields: Option<Vec<String>>,
}

/// Load-time configuration.
#[derive(Debug, Clone, Default)]
pub struct DiskAnnLoadParams {
    /// Remote artifact paths produced by a prior upload.
    pub index_files: Vec<String>,
    pub load_thread_num: String,
    pub query_beamwidth: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Created,
    Built,
    Loaded,
    Closed,
}

/// Disk-resident vector index bound to one (segment, field).
pub struct DiskAnnIndex {
    engine: RwLock<Box<dyn VectorEngine>>,
    file_manager: Arc<FileManager>,
    metric: Metric,
    state: Mutex<LifecycleState>,
    search_beamwidth: AtomicUsize,
    dim: AtomicUsize,
}

impl std::fmt::Debug for DiskAnnIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskAnnIndex")
            .field("metric", &self.metric)
            .field("state", &self.state)
            .field("search_beamwidth", &self.search_beamwidth)
            .field("dim", &self.dim)
            .finish()
    }
}

impl DiskAnnIndex {
    /// Binds the engine to local scratch and remote storage.
    ///
    /// A leftover local index prefix means a prior process died in this
    /// location; it is removed and recreated.
    pub fn new(
        engine: Box<dyn VectorEngine>,
        metric: Metric,
        version: u32,
        file_manager: Arc<FileManager>,
    ) -> Result<Self> {
        check_compatible(version)?;
        let prefix = file_manager.local_index_prefix();
        if file_manager.local().exist(&prefix) {
            info!(prefix = %prefix, "removing stale local index prefix");
            file_manager.local().remove_dir(&prefix)?;
        }
        file_manager.local().create_dir(&prefix)?;
        Ok(Self {
            engine: RwLock::new(engine),
            file_manager,
            metric,
            state: Mutex::new(LifecycleState::Created),
            search_beamwidth: AtomicUsize::new(DEFAULT_BEAMWIDTH),
            dim: AtomicUsize::new(0),
        })
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn dim(&self) -> usize {
        self.dim.load(Ordering::Acquire)
    }

    pub fn has_raw_data(&self) -> bool {
        self.engine.read().unwrap().has_raw_data(self.metric)
    }

    /// Stages raw vectors from remote shards and builds the index.
    ///
    /// On success the staged raw data is removed; on failure scratch is
    /// left in place for diagnostics.
    pub async fn build(&self, params: DiskAnnBuildParams) -> Result<()> {
        self.expect_state(LifecycleState::Created)?;
        let threads = parse_thread_num(&params.build_thread_num, "build_thread_num")?;

        let raw_data_path = self
            .file_manager
            .cache_raw_data_to_disk(&params.insert_files)
            .await?;
        let scalar_data_path = match &params.vec_opt_fields {
            Some(files) if self.engine.read().unwrap().is_additional_scalar_supported() => {
                Some(self.file_manager.cache_opt_field_to_disk(files).await?)
            }
            _ => None,
        };

        self.run_build(EngineBuildParams {
            raw_data_path,
            prefix_path: self.file_manager.local_index_prefix(),
            threads,
            metric: self.metric,
            scalar_data_path,
        })
    }

    /// Builds from an in-memory dataset, staging it through the same
    /// write-once raw-data layout.
    pub async fn build_with_dataset(
        &self,
        dataset: &VectorDataset,
        build_thread_num: &str,
    ) -> Result<()> {
        self.expect_state(LifecycleState::Created)?;
        let threads = parse_thread_num(build_thread_num, "build_thread_num")?;
        let raw_data_path = self.file_manager.stage_dataset(dataset)?;
        self.run_build(EngineBuildParams {
            raw_data_path,
            prefix_path: self.file_manager.local_index_prefix(),
            threads,
            metric: self.metric,
            scalar_data_path: None,
        })
    }

    fn run_build(&self, params: EngineBuildParams) -> Result<()> {
        {
            let mut engine = self.engine.write().unwrap();
            engine.build(&params).map_err(|e| {
                Error::index_build(format!("failed to build disk index: {}", e), location!())
            })?;
            self.dim.store(engine.dim(), Ordering::Release);
        }
        self.file_manager
            .local()
            .remove_dir(&self.file_manager.local_raw_data_prefix())?;
        *self.state.lock().unwrap() = LifecycleState::Built;
        Ok(())
    }

    /// Serializes the engine's metadata and pushes local artifacts to
    /// remote storage; the returned manifest carries the metadata blobs
    /// plus one (remote path, size) reference per artifact.
    pub async fn upload(&self) -> Result<BinarySet> {
        self.expect_state(LifecycleState::Built)?;
        let mut manifest = BinarySet::default();
        self.engine
            .read()
            .unwrap()
            .serialize(&mut manifest)
            .map_err(|e| {
                Error::unexpected(format!("failed to serialize index: {}", e), location!())
            })?;
        for (path, size) in self.file_manager.upload_index_files().await? {
            manifest.append_ref(path, size);
        }
        Ok(manifest)
    }

    /// Re-hydrates previously uploaded artifacts and hands them to the
    /// engine. Warm-up and BFS caching are forced off.
    pub async fn load(&self, params: DiskAnnLoadParams) -> Result<()> {
        self.expect_state(LifecycleState::Created)?;
        if params.index_files.is_empty() {
            return Err(Error::invalid_input(
                "index file paths are empty when loading a disk index",
                location!(),
            ));
        }
        let threads = parse_thread_num(&params.load_thread_num, "load_thread_num")?;
        if let Some(beamwidth) = &params.query_beamwidth {
            let beamwidth = parse_thread_num(beamwidth, "query_beamwidth")?;
            self.search_beamwidth.store(beamwidth, Ordering::Release);
        }

        self.file_manager
            .cache_index_to_disk(&params.index_files)
            .instrument(info_span!("disk_index_read_files"))
            .await?;

        {
            let _span = info_span!("disk_index_engine_load").entered();
            let mut engine = self.engine.write().unwrap();
            engine
                .deserialize(
                    BinarySet::default(),
                    &EngineLoadParams {
                        prefix_path: self.file_manager.local_index_prefix(),
                        threads,
                        warm_up: false,
                        use_bfs_cache: false,
                    },
                )
                .map_err(|e| {
                    Error::unexpected(
                        format!("failed to deserialize index: {}", e),
                        location!(),
                    )
                })?;
            self.dim.store(engine.dim(), Ordering::Release);
        }
        *self.state.lock().unwrap() = LifecycleState::Loaded;
        Ok(())
    }

    /// Top-k or range search, depending on whether the caller set a
    /// radius. Results land in the dense `(nq, topk)` layout.
    pub fn query(
        &self,
        query: &VectorDataset,
        search_info: &SearchInfo,
        bitset: &RoaringBitmap,
        out: &mut SearchResult,
    ) -> Result<()> {
        if search_info.metric != self.metric {
            return Err(Error::invalid_input(
                format!(
                    "metric {} of the search does not match index metric {}",
                    search_info.metric, self.metric
                ),
                location!(),
            ));
        }
        let nq = query.rows();
        let topk = search_info.topk;

        let search_list_size = search_info.params.query_list.map(|requested| {
            let bound = if topk <= 20 {
                SEARCH_LIST_MAX_SMALL_TOPK
            } else {
                SEARCH_LIST_MAX_LARGE_TOPK
            };
            requested.min(bound)
        });
        let params = EngineSearchParams {
            topk,
            metric: self.metric,
            search_list_size,
            beamwidth: self.search_beamwidth.load(Ordering::Acquire),
            prefix_path: self.file_manager.local_index_prefix(),
            pq_code_budget: 0.0,
            radius: search_info.params.radius,
            range_filter: search_info.params.range_filter,
        };

        let engine = self.engine.read().unwrap();
        let hits = if let Some(radius) = search_info.params.radius {
            if let Some(range_filter) = search_info.params.range_filter {
                check_range_search_params(radius, range_filter, self.metric)?;
            }
            let raw = engine.range_search(query, &params, bitset).map_err(|e| {
                Error::unexpected(format!("failed to range search: {}", e), location!())
            })?;
            regen_range_search_result(raw, nq, topk, self.metric)?
        } else {
            engine
                .search(query, &params, bitset)
                .map_err(|e| Error::unexpected(format!("failed to search: {}", e), location!()))?
        };

        let mut distances = hits.distances;
        round_distances(&mut distances, search_info.round_decimal);

        out.seg_offsets = hits.offsets;
        out.distances = distances;
        out.total_nq = nq;
        out.unity_topk = topk;
        Ok(())
    }

    /// Batched best-first iterators, one per query.
    pub fn vector_iterators(
        &self,
        query: &VectorDataset,
        search_info: &SearchInfo,
        bitset: &RoaringBitmap,
    ) -> Result<Vec<AnnIterator>> {
        let params = EngineSearchParams {
            topk: search_info.topk,
            metric: self.metric,
            search_list_size: search_info.params.query_list,
            beamwidth: self.search_beamwidth.load(Ordering::Acquire),
            prefix_path: self.file_manager.local_index_prefix(),
            pq_code_budget: 0.0,
            radius: None,
            range_filter: None,
        };
        self.engine
            .read()
            .unwrap()
            .ann_iterator(query, &params, bitset)
    }

    /// Raw vectors for the given offsets as one contiguous byte buffer:
    /// `dim / 8 * n` bytes for binary vectors, `dim * 4 * n` for float.
    pub fn get_vector(&self, ids: &[i64]) -> Result<Vec<u8>> {
        let dataset = self
            .engine
            .read()
            .unwrap()
            .get_vector_by_ids(ids)
            .map_err(|e| {
                Error::unexpected(format!("failed to get vector: {}", e), location!())
            })?;
        let bytes = match dataset {
            VectorDataset::Binary { data, .. } => data,
            VectorDataset::Float { data, .. } => {
                let mut bytes = Vec::with_capacity(data.len() * 4);
                for v in data {
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                bytes
            }
        };
        Ok(bytes)
    }

    /// Removes both local prefixes; the index is unusable afterwards.
    pub fn clean_local_data(&self) -> Result<()> {
        self.file_manager
            .local()
            .remove_dir(&self.file_manager.local_index_prefix())?;
        self.file_manager
            .local()
            .remove_dir(&self.file_manager.local_raw_data_prefix())?;
        *self.state.lock().unwrap() = LifecycleState::Closed;
        Ok(())
    }

    fn expect_state(&self, expected: LifecycleState) -> Result<()> {
        let state = *self.state.lock().unwrap();
        if state != expected {
            return Err(Error::invalid_input(
                format!(
                    "disk index lifecycle violation: expected {:?}, currently {:?}",
                    expected, state
                ),
                location!(),
            ));
        }
        Ok(())
    }
}

fn check_compatible(version: u32) -> Result<()> {
    if !(MINIMAL_INDEX_VERSION..=CURRENT_INDEX_VERSION).contains(&version) {
        return Err(Error::version_incompatible(
            version,
            format!(
                "supported index versions are {}..={}",
                MINIMAL_INDEX_VERSION, CURRENT_INDEX_VERSION
            ),
            location!(),
        ));
    }
    Ok(())
}

fn parse_thread_num(value: &str, key: &str) -> Result<usize> {
    if value.is_empty() {
        return Err(Error::invalid_input(
            format!("param {} is empty", key),
            location!(),
        ));
    }
    let parsed: usize = value.parse().map_err(|_| {
        Error::invalid_input(format!("param {} is not a number: {}", key, value), location!())
    })?;
    if parsed == 0 {
        return Err(Error::invalid_input(
            format!("param {} must be positive", key),
            location!(),
        ));
    }
    Ok(parsed)
}

/// Reshapes variable-length range hits into the dense `(nq, topk)` layout,
/// best hits first, padded with `-1` offsets.
fn regen_range_search_result(
    hits: EngineHits,
    nq: usize,
    topk: usize,
    metric: Metric,
) -> Result<EngineHits> {
    let lims = hits.lims.ok_or_else(|| {
        Error::unexpected("range search returned no result boundaries", location!())
    })?;
    if lims.len() != nq + 1 {
        return Err(Error::unexpected(
            format!("range search boundary count {} for {} queries", lims.len(), nq),
            location!(),
        ));
    }
    let mut offsets = Vec::with_capacity(nq * topk);
    let mut distances = Vec::with_capacity(nq * topk);
    for q in 0..nq {
        let mut query_hits: Vec<(i64, f32)> = (lims[q]..lims[q + 1])
            .map(|i| (hits.offsets[i], hits.distances[i]))
            .collect();
        if metric.smaller_is_better() {
            query_hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        } else {
            query_hits.sort_by(|a, b| b.1.total_cmp(&a.1));
        }
        query_hits.truncate(topk);
        for slot in 0..topk {
            match query_hits.get(slot) {
                Some((offset, dist)) => {
                    offsets.push(*offset);
                    distances.push(*dist);
                }
                None => {
                    offsets.push(-1);
                    distances.push(metric.worst_distance());
                }
            }
        }
    }
    Ok(EngineHits {
        offsets,
        distances,
        lims: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flat::FlatDiskEngine;
    use super::file_manager::LocalChunkManager;
    use object_store::memory::InMemory;
    use object_store::path::Path as StorePath;
    use object_store::ObjectStore;
    use tempfile::TempDir;

    fn fixture(segment_id: i64) -> (TempDir, Arc<FileManager>, Arc<dyn ObjectStore>) {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(LocalChunkManager::new(dir.path()).unwrap());
        let remote: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let fm = Arc::new(FileManager::new(
            local,
            remote.clone(),
            StorePath::from(format!("indexes/{}/101", segment_id)),
            segment_id,
            canopy_core::FieldId(101),
        ));
        (dir, fm, remote)
    }

    fn new_index(fm: Arc<FileManager>) -> DiskAnnIndex {
        let engine = Box::new(FlatDiskEngine::new(fm.local().clone(), Metric::L2));
        DiskAnnIndex::new(engine, Metric::L2, CURRENT_INDEX_VERSION, fm).unwrap()
    }

    #[test]
    fn test_version_check() {
        let (_dir, fm, _remote) = fixture(1);
        let engine = Box::new(FlatDiskEngine::new(fm.local().clone(), Metric::L2));
        let err = DiskAnnIndex::new(engine, Metric::L2, CURRENT_INDEX_VERSION + 1, fm);
        assert!(matches!(
            err.unwrap_err(),
            Error::VersionIncompatible { .. }
        ));
    }

    #[test]
    fn test_stale_prefix_removed() {
        let (_dir, fm, _remote) = fixture(2);
        let stale = format!("{}/leftover", fm.local_index_prefix());
        fm.local().create_file(&stale).unwrap();
        let _index = new_index(fm.clone());
        assert!(!fm.local().exist(&stale));
        assert!(fm.local().exist(&fm.local_index_prefix()));
    }

    #[tokio::test]
    async fn test_build_upload_load_query_round_trip() {
        let (_dir, fm, _remote) = fixture(3);
        let index = new_index(fm.clone());

        let dataset = VectorDataset::Float {
            dim: 4,
            data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
        };
        index.build_with_dataset(&dataset, "2").await.unwrap();
        // staged raw data is removed after a successful build
        assert!(!fm.local().exist(&fm.local_raw_data_prefix()));

        let manifest = index.upload().await.unwrap();
        let remote_files: Vec<String> = manifest
            .entries()
            .iter()
            .filter(|e| e.value.is_none())
            .map(|e| e.key.clone())
            .collect();
        assert!(!remote_files.is_empty());

        // a second index in the same scratch location re-hydrates the upload
        let reloaded = new_index(fm.clone());
        reloaded
            .load(DiskAnnLoadParams {
                index_files: remote_files,
                load_thread_num: "2".to_string(),
                query_beamwidth: Some("4".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(reloaded.dim(), 4);

        let mut result = SearchResult::default();
        reloaded
            .query(
                &VectorDataset::Float {
                    dim: 4,
                    data: vec![1.0, 2.0, 3.0, 4.0],
                },
                &SearchInfo::new(canopy_core::FieldId(101), 1, Metric::L2),
                &RoaringBitmap::new(),
                &mut result,
            )
            .unwrap();
        assert_eq!(result.seg_offsets, vec![0]);
        assert_eq!(result.distances, vec![0.0]);
    }

    #[tokio::test]
    async fn test_build_then_load_rejected() {
        let (_dir, fm, _remote) = fixture(4);
        let index = new_index(fm.clone());
        let dataset = VectorDataset::Float {
            dim: 2,
            data: vec![0.0, 1.0],
        };
        index.build_with_dataset(&dataset, "1").await.unwrap();
        let err = index
            .load(DiskAnnLoadParams {
                index_files: vec!["x".to_string()],
                load_thread_num: "1".to_string(),
                query_beamwidth: None,
            })
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_empty_thread_num_rejected() {
        let (_dir, fm, _remote) = fixture(5);
        let index = new_index(fm);
        let dataset = VectorDataset::Float {
            dim: 2,
            data: vec![0.0, 1.0],
        };
        let err = index.build_with_dataset(&dataset, "").await;
        assert!(matches!(err.unwrap_err(), Error::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_load_requires_index_files() {
        let (_dir, fm, _remote) = fixture(6);
        let index = new_index(fm);
        let err = index
            .load(DiskAnnLoadParams {
                index_files: vec![],
                load_thread_num: "1".to_string(),
                query_beamwidth: None,
            })
            .await;
        assert!(matches!(err.unwrap_err(), Error::InvalidInput { .. }));
    }

    #[test]
    fn test_regen_range_result_reshape() {
        let hits = EngineHits {
            offsets: vec![5, 3, 9],
            distances: vec![0.5, 0.1, 0.9],
            lims: Some(vec![0, 3]),
        };
        let reshaped = regen_range_search_result(hits, 1, 2, Metric::L2).unwrap();
        assert_eq!(reshaped.offsets, vec![3, 5]);
        assert_eq!(reshaped.distances, vec![0.1, 0.5]);
    }

    #[tokio::test]
    async fn test_range_query_with_invalid_bounds() {
        let (_dir, fm, _remote) = fixture(7);
        let index = new_index(fm);
        let dataset = VectorDataset::Float {
            dim: 2,
            data: vec![0.0, 0.0, 1.0, 0.0],
        };
        index.build_with_dataset(&dataset, "1").await.unwrap();

        let mut info = SearchInfo::new(canopy_core::FieldId(101), 1, Metric::L2);
        info.params.radius = Some(1.0);
        info.params.range_filter = Some(2.0); // inverted for L2
        let mut result = SearchResult::default();
        let err = index.query(
            &VectorDataset::Float {
                dim: 2,
                data: vec![0.0, 0.0],
            },
            &info,
            &RoaringBitmap::new(),
            &mut result,
        );
        assert!(err.is_err());
    }
}
