// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Flat (exact-scan) disk engine.
//!
//! The reference implementation of [`VectorEngine`]: build stages the raw
//! vectors into a single artifact under the index prefix, search is an
//! exhaustive scan. Useful as the test engine and as the fallback when no
//! approximate engine is configured.

use std::sync::Arc;

use bytes::Bytes;
use roaring::RoaringBitmap;
use snafu::location;

use canopy_core::{Error, Result};

use crate::disk::file_manager::{
    decode_staged_floats, encode_staged_vectors, LocalChunkManager,
};
use crate::distance::{float_distance, range_hit, Metric, TopKCollector};
use crate::engine::{
    AnnIterator, BinarySet, EngineBuildParams, EngineHits, EngineLoadParams, EngineSearchParams,
    VectorDataset, VectorEngine,
};

/// Artifact written under the index prefix.
pub const FLAT_INDEX_FILE: &str = "flat.bin";
/// Manifest key carrying the engine's serialized metadata.
pub const FLAT_META_KEY: &str = "canopy_flat_meta";

/// Exact-scan engine over float vectors.
pub struct FlatDiskEngine {
    chunk_manager: Arc<LocalChunkManager>,
    metric: Metric,
    data: Option<VectorDataset>,
}

impl FlatDiskEngine {
    pub fn new(chunk_manager: Arc<LocalChunkManager>, metric: Metric) -> Self {
        Self {
            chunk_manager,
            metric,
            data: None,
        }
    }

    fn vectors(&self) -> Result<(&[f32], usize)> {
        match &self.data {
            Some(VectorDataset::Float { dim, data }) => Ok((data, *dim as usize)),
            Some(VectorDataset::Binary { .. }) => Err(Error::data_type(
                "flat engine holds binary vectors, expected float",
                location!(),
            )),
            None => Err(Error::Internal {
                message: "flat engine used before build or deserialize".to_string(),
                location: location!(),
            }),
        }
    }

    fn query_rows<'a>(&self, query: &'a VectorDataset, dim: usize) -> Result<&'a [f32]> {
        match query {
            VectorDataset::Float { dim: qd, data } if *qd as usize == dim => Ok(data),
            VectorDataset::Float { dim: qd, .. } => Err(Error::invalid_input(
                format!("query dim {} does not match index dim {}", qd, dim),
                location!(),
            )),
            VectorDataset::Binary { .. } => Err(Error::data_type(
                "flat engine expects float queries",
                location!(),
            )),
        }
    }
}

impl VectorEngine for FlatDiskEngine {
    fn build(&mut self, params: &EngineBuildParams) -> Result<()> {
        let raw = self.chunk_manager.read_all(&params.raw_data_path)?;
        let dataset = decode_staged_floats(&raw)?;

        self.chunk_manager.create_dir(&params.prefix_path)?;
        let artifact = format!("{}/{}", params.prefix_path, FLAT_INDEX_FILE);
        self.chunk_manager.create_file(&artifact)?;
        self.chunk_manager
            .write_at(&artifact, 0, &encode_staged_vectors(&dataset)?)?;

        self.data = Some(dataset);
        Ok(())
    }

    fn serialize(&self, binary_set: &mut BinarySet) -> Result<()> {
        let (vectors, dim) = self.vectors()?;
        let meta = bincode::serialize(&(vectors.len() as u64 / dim as u64, dim as u32))?;
        binary_set.append_blob(FLAT_META_KEY, Bytes::from(meta));
        Ok(())
    }

    fn deserialize(&mut self, _binary_set: BinarySet, params: &EngineLoadParams) -> Result<()> {
        let artifact = format!("{}/{}", params.prefix_path, FLAT_INDEX_FILE);
        let raw = self.chunk_manager.read_all(&artifact)?;
        self.data = Some(decode_staged_floats(&raw)?);
        Ok(())
    }

    fn search(
        &self,
        query: &VectorDataset,
        params: &EngineSearchParams,
        bitset: &RoaringBitmap,
    ) -> Result<EngineHits> {
        let (vectors, dim) = self.vectors()?;
        let queries = self.query_rows(query, dim)?;
        let nq = query.rows();
        let rows = vectors.len() / dim.max(1);

        let mut offsets = Vec::with_capacity(nq * params.topk);
        let mut distances = Vec::with_capacity(nq * params.topk);
        for q in 0..nq {
            let qv = &queries[q * dim..(q + 1) * dim];
            let mut topk = TopKCollector::new(params.topk, self.metric);
            for row in 0..rows {
                if bitset.contains(row as u32) {
                    continue;
                }
                let dist = float_distance(self.metric, qv, &vectors[row * dim..(row + 1) * dim])?;
                topk.push(row as i64, dist);
            }
            let hits = topk.into_sorted();
            for slot in 0..params.topk {
                match hits.get(slot) {
                    Some((offset, dist)) => {
                        offsets.push(*offset);
                        distances.push(*dist);
                    }
                    None => {
                        offsets.push(-1);
                        distances.push(self.metric.worst_distance());
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

    fn range_search(
        &self,
        query: &VectorDataset,
        params: &EngineSearchParams,
        bitset: &RoaringBitmap,
    ) -> Result<EngineHits> {
        let radius = params.radius.ok_or_else(|| {
            Error::invalid_input("range search requires a radius", location!())
        })?;
        let (vectors, dim) = self.vectors()?;
        let queries = self.query_rows(query, dim)?;
        let nq = query.rows();
        let rows = vectors.len() / dim.max(1);

        let mut offsets = Vec::new();
        let mut distances = Vec::new();
        let mut lims = Vec::with_capacity(nq + 1);
        lims.push(0);
        for q in 0..nq {
            let qv = &queries[q * dim..(q + 1) * dim];
            for row in 0..rows {
                if bitset.contains(row as u32) {
                    continue;
                }
                let dist = float_distance(self.metric, qv, &vectors[row * dim..(row + 1) * dim])?;
                if range_hit(self.metric, dist, radius, params.range_filter) {
                    offsets.push(row as i64);
                    distances.push(dist);
                }
            }
            lims.push(offsets.len());
        }
        Ok(EngineHits {
            offsets,
            distances,
            lims: Some(lims),
        })
    }

    fn ann_iterator(
        &self,
        query: &VectorDataset,
        _params: &EngineSearchParams,
        bitset: &RoaringBitmap,
    ) -> Result<Vec<AnnIterator>> {
        let (vectors, dim) = self.vectors()?;
        let queries = self.query_rows(query, dim)?;
        let nq = query.rows();
        let rows = vectors.len() / dim.max(1);

        let mut iterators = Vec::with_capacity(nq);
        for q in 0..nq {
            let qv = &queries[q * dim..(q + 1) * dim];
            let mut hits = Vec::with_capacity(rows);
            for row in 0..rows {
                if bitset.contains(row as u32) {
                    continue;
                }
                let dist = float_distance(self.metric, qv, &vectors[row * dim..(row + 1) * dim])?;
                hits.push((row as i64, dist));
            }
            if self.metric.smaller_is_better() {
                hits.sort_by(|a, b| a.1.total_cmp(&b.1));
            } else {
                hits.sort_by(|a, b| b.1.total_cmp(&a.1));
            }
            iterators.push(AnnIterator::new(hits));
        }
        Ok(iterators)
    }

    fn has_raw_data(&self, _metric: Metric) -> bool {
        true
    }

    fn is_additional_scalar_supported(&self) -> bool {
        false
    }

    fn dim(&self) -> usize {
        match &self.data {
            Some(dataset) => dataset.dim() as usize,
            None => 0,
        }
    }

    fn get_vector_by_ids(&self, ids: &[i64]) -> Result<VectorDataset> {
        let (vectors, dim) = self.vectors()?;
        let rows = vectors.len() / dim.max(1);
        let mut data = Vec::with_capacity(ids.len() * dim);
        for &id in ids {
            if id < 0 || id as usize >= rows {
                return Err(Error::unexpected(
                    format!("vector id {} out of range (rows {})", id, rows),
                    location!(),
                ));
            }
            let row = id as usize;
            data.extend_from_slice(&vectors[row * dim..(row + 1) * dim]);
        }
        Ok(VectorDataset::Float {
            dim: dim as u32,
            data,
        })
    }
}
