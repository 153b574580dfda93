// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Vector search dispatch for growing segments.
//!
//! A synced field answers from its interim index, with any raw tail
//! between the sync watermark and the insert barrier scanned from chunks
//! and merged in. Everything else is a brute-force scan over the raw
//! chunks under the shared chunk lock.

use half::{bf16, f16};
use roaring::RoaringBitmap;
use snafu::location;

use canopy_core::{DataType, Error, FieldMeta, Result};
use canopy_index::distance::{
    check_range_search_params, float_distance, hamming, range_hit, Metric, TopKCollector,
};
use canopy_index::engine::VectorDataset;
use canopy_index::query::round_distances;
use canopy_index::{SearchInfo, SearchResult};

use crate::column::Column;
use super::GrowingSegment;

pub(super) fn search_on_growing(
    segment: &GrowingSegment,
    info: &SearchInfo,
    query: &VectorDataset,
    ins_barrier: u64,
    blocked: &RoaringBitmap,
    out: &mut SearchResult,
) -> Result<()> {
    let meta = segment.schema().field(info.field_id)?;
    if !meta.is_vector() {
        return Err(Error::data_type(
            format!("field {} is not a vector field", info.field_id),
            location!(),
        ));
    }
    check_query_shape(meta, query)?;

    let nq = query.rows();
    let topk = info.topk;
    let per_query = if info.params.radius.is_some() {
        range_hits(segment, info, meta, query, ins_barrier, blocked)?
    } else {
        topk_hits(segment, info, meta, query, ins_barrier, blocked)?
    };

    out.seg_offsets = Vec::with_capacity(nq * topk);
    out.distances = Vec::with_capacity(nq * topk);
    for hits in per_query {
        for slot in 0..topk {
            match hits.get(slot) {
                Some((offset, dist)) => {
                    out.seg_offsets.push(*offset);
                    out.distances.push(*dist);
                }
                None => {
                    out.seg_offsets.push(-1);
                    out.distances.push(info.metric.worst_distance());
                }
            }
        }
    }
    round_distances(&mut out.distances, info.round_decimal);
    out.total_nq = nq;
    out.unity_topk = topk;
    Ok(())
}

fn check_query_shape(meta: &FieldMeta, query: &VectorDataset) -> Result<()> {
    let matches = match meta.data_type {
        DataType::FloatVector | DataType::Float16Vector | DataType::BFloat16Vector => {
            matches!(query, VectorDataset::Float { .. })
        }
        DataType::BinaryVector => matches!(query, VectorDataset::Binary { .. }),
        _ => false,
    };
    if !matches || query.dim() != meta.dim.unwrap_or(0) {
        return Err(Error::invalid_input(
            format!(
                "query shape does not match field {} ({}, dim {:?})",
                meta.id, meta.data_type, meta.dim
            ),
            location!(),
        ));
    }
    Ok(())
}

fn topk_hits(
    segment: &GrowingSegment,
    info: &SearchInfo,
    meta: &FieldMeta,
    query: &VectorDataset,
    ins_barrier: u64,
    blocked: &RoaringBitmap,
) -> Result<Vec<Vec<(i64, f32)>>> {
    let nq = query.rows();
    if segment.indexing_record.sync_data_with_index(info.field_id) {
        check_index_metric(segment, info)?;
        let VectorDataset::Float { data: queries, .. } = query else {
            // Synced fields are float-vector by construction.
            return Err(Error::data_type("synced field expects float queries", location!()));
        };
        let watermark = segment.indexing_record.sync_watermark(info.field_id);
        let mut per_query = segment.indexing_record.search(
            info.field_id,
            queries,
            nq,
            info.topk,
            ins_barrier,
            blocked,
        )?;
        // Tail rows past the watermark (if any) still live in raw chunks.
        if watermark < ins_barrier {
            let _chunk_guard = segment.chunk_mutex.read().unwrap();
            let column = segment.insert_record.column(info.field_id)?;
            for (q, hits) in per_query.iter_mut().enumerate() {
                let mut collector = TopKCollector::new(info.topk, info.metric);
                for &(offset, dist) in hits.iter() {
                    collector.push(offset, dist);
                }
                scan_column(
                    column,
                    meta,
                    query,
                    q,
                    info.metric,
                    watermark..ins_barrier,
                    blocked,
                    &mut |offset, dist| collector.push(offset, dist),
                )?;
                *hits = collector.into_sorted();
            }
        }
        return Ok(per_query);
    }

    let _chunk_guard = segment.chunk_mutex.read().unwrap();
    let column = segment.insert_record.column(info.field_id)?;
    let mut per_query = Vec::with_capacity(nq);
    for q in 0..nq {
        let mut collector = TopKCollector::new(info.topk, info.metric);
        scan_column(
            column,
            meta,
            query,
            q,
            info.metric,
            0..ins_barrier,
            blocked,
            &mut |offset, dist| collector.push(offset, dist),
        )?;
        per_query.push(collector.into_sorted());
    }
    Ok(per_query)
}

fn range_hits(
    segment: &GrowingSegment,
    info: &SearchInfo,
    meta: &FieldMeta,
    query: &VectorDataset,
    ins_barrier: u64,
    blocked: &RoaringBitmap,
) -> Result<Vec<Vec<(i64, f32)>>> {
    // Radius presence is the caller's range-search signal.
    let radius = info.params.radius.unwrap();
    if let Some(range_filter) = info.params.range_filter {
        check_range_search_params(radius, range_filter, info.metric)?;
    }
    let nq = query.rows();
    let mut per_query = vec![Vec::new(); nq];

    let collect = |per_query: &mut Vec<Vec<(i64, f32)>>,
                   q: usize,
                   offset: i64,
                   dist: f32| {
        if range_hit(info.metric, dist, radius, info.params.range_filter) {
            per_query[q].push((offset, dist));
        }
    };

    if segment.indexing_record.sync_data_with_index(info.field_id) {
        check_index_metric(segment, info)?;
        let VectorDataset::Float { data: queries, .. } = query else {
            return Err(Error::data_type("synced field expects float queries", location!()));
        };
        // An exhaustive pass: ask the interim index for everything below
        // the barrier, then filter by the range window.
        let all = segment.indexing_record.search(
            info.field_id,
            queries,
            nq,
            ins_barrier as usize,
            ins_barrier,
            blocked,
        )?;
        let watermark = segment.indexing_record.sync_watermark(info.field_id);
        for (q, hits) in all.into_iter().enumerate() {
            for (offset, dist) in hits {
                collect(&mut per_query, q, offset, dist);
            }
        }
        if watermark < ins_barrier {
            let _chunk_guard = segment.chunk_mutex.read().unwrap();
            let column = segment.insert_record.column(info.field_id)?;
            for q in 0..nq {
                scan_column(
                    column,
                    meta,
                    query,
                    q,
                    info.metric,
                    watermark..ins_barrier,
                    blocked,
                    &mut |offset, dist| collect(&mut per_query, q, offset, dist),
                )?;
            }
        }
    } else {
        let _chunk_guard = segment.chunk_mutex.read().unwrap();
        let column = segment.insert_record.column(info.field_id)?;
        for q in 0..nq {
            scan_column(
                column,
                meta,
                query,
                q,
                info.metric,
                0..ins_barrier,
                blocked,
                &mut |offset, dist| collect(&mut per_query, q, offset, dist),
            )?;
        }
    }

    for hits in per_query.iter_mut() {
        if info.metric.smaller_is_better() {
            hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        } else {
            hits.sort_by(|a, b| b.1.total_cmp(&a.1));
        }
        hits.truncate(info.topk);
    }
    Ok(per_query)
}

fn check_index_metric(segment: &GrowingSegment, info: &SearchInfo) -> Result<()> {
    let interim = segment.config().interim_metric;
    if info.metric != interim {
        return Err(Error::invalid_input(
            format!(
                "search metric {} does not match the interim index metric {}",
                info.metric, interim
            ),
            location!(),
        ));
    }
    Ok(())
}

/// Brute-force scan of `range` against query `q`, dispatched on the
/// field's element type.
#[allow(clippy::too_many_arguments)]
fn scan_column(
    column: &Column,
    meta: &FieldMeta,
    query: &VectorDataset,
    q: usize,
    metric: Metric,
    range: std::ops::Range<u64>,
    blocked: &RoaringBitmap,
    push: &mut dyn FnMut(i64, f32),
) -> Result<()> {
    match (column, query) {
        (Column::FloatVector(col), VectorDataset::Float { dim, data }) => {
            let dim = *dim as usize;
            let qv = &data[q * dim..(q + 1) * dim];
            for offset in range {
                if blocked.contains(offset as u32) {
                    continue;
                }
                let dist = col.with_row(offset, |row| float_distance(metric, qv, row))?;
                push(offset as i64, dist);
            }
        }
        (Column::Float16Vector(col), VectorDataset::Float { dim, data }) => {
            let dim = *dim as usize;
            let qv = &data[q * dim..(q + 1) * dim];
            let mut row_f32 = vec![0f32; dim];
            for offset in range {
                if blocked.contains(offset as u32) {
                    continue;
                }
                col.with_row(offset, |row| {
                    for (dst, src) in row_f32.iter_mut().zip(row.iter()) {
                        *dst = f16::to_f32(*src);
                    }
                });
                push(offset as i64, float_distance(metric, qv, &row_f32)?);
            }
        }
        (Column::BFloat16Vector(col), VectorDataset::Float { dim, data }) => {
            let dim = *dim as usize;
            let qv = &data[q * dim..(q + 1) * dim];
            let mut row_f32 = vec![0f32; dim];
            for offset in range {
                if blocked.contains(offset as u32) {
                    continue;
                }
                col.with_row(offset, |row| {
                    for (dst, src) in row_f32.iter_mut().zip(row.iter()) {
                        *dst = bf16::to_f32(*src);
                    }
                });
                push(offset as i64, float_distance(metric, qv, &row_f32)?);
            }
        }
        (Column::BinaryVector(col), VectorDataset::Binary { dim, data }) => {
            if metric != Metric::Hamming {
                return Err(Error::invalid_input(
                    format!("binary field {} requires the HAMMING metric", meta.id),
                    location!(),
                ));
            }
            let width = *dim as usize / 8;
            let qv = &data[q * width..(q + 1) * width];
            for offset in range {
                if blocked.contains(offset as u32) {
                    continue;
                }
                let dist = col.with_row(offset, |row| hamming(qv, row) as f32);
                push(offset as i64, dist);
            }
        }
        _ => {
            return Err(Error::data_type(
                format!("field {} cannot serve this query", meta.id),
                location!(),
            ));
        }
    }
    Ok(())
}
