// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! Bulk re-hydration of a growing segment from remote storage.
//!
//! Shard files are bincode-serialized `FieldData` slices named by their
//! numeric position (`.../<field>/<n>`). Each field's shards are fetched
//! by a spawned reader task and streamed through a bounded channel; the
//! collected rows are routed through the same rules as a live insert.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use object_store::path::Path as StorePath;
use object_store::ObjectStore;
use snafu::location;
use tokio::sync::mpsc;
use tracing::info;

use canopy_core::data::{FieldData, IdArray};
use canopy_core::{
    Error, FieldId, Result, Timestamp, ROW_ID_FIELD, TIMESTAMP_FIELD,
};

use super::GrowingSegment;

/// Shards are prefetched at most this far ahead of the consumer.
const LOAD_CHANNEL_DEPTH: usize = 2;

/// Per-field shard listing.
#[derive(Debug, Clone, Default)]
pub struct FieldLoadInfo {
    pub insert_files: Vec<String>,
}

/// Bulk-load request: every schema field plus the two system columns.
#[derive(Debug, Clone, Default)]
pub struct LoadFieldDataInfo {
    pub field_infos: HashMap<FieldId, FieldLoadInfo>,
    pub row_count: usize,
}

/// A persisted deletion log to replay.
#[derive(Debug, Clone)]
pub struct LoadDeletedRecordInfo {
    pub row_count: usize,
    pub primary_keys: IdArray,
    pub timestamps: Vec<Timestamp>,
}

impl GrowingSegment {
    /// Loads previously persisted field data into this segment.
    ///
    /// The request must cover the timestamp and row-id columns, the
    /// primary field, and every schema field. Shards are applied in
    /// numeric-suffix order; routing per field matches [`insert`].
    ///
    /// [`insert`]: GrowingSegment::insert
    pub async fn load_field_data(
        &self,
        remote: Arc<dyn ObjectStore>,
        info: &LoadFieldDataInfo,
    ) -> Result<()> {
        for required in [TIMESTAMP_FIELD, ROW_ID_FIELD, self.schema().primary_field_id()] {
            if !info.field_infos.contains_key(&required) {
                return Err(Error::invalid_input(
                    format!("field {} data must be included in the load", required),
                    location!(),
                ));
            }
        }
        for meta in self.schema().fields() {
            if !info.field_infos.contains_key(&meta.id) {
                return Err(Error::invalid_input(
                    format!("lost field {} data when loading a growing segment", meta.id),
                    location!(),
                ));
            }
        }

        let num_rows = info.row_count as u64;
        let reserved_begin = self.pre_insert(num_rows);

        for (&field_id, field_info) in &info.field_infos {
            let files = sort_by_numeric_suffix(field_info.insert_files.clone())?;
            info!(
                segment = self.id(),
                field = %field_id,
                rows = num_rows,
                "loading field data"
            );
            let shards = collect_shards(remote.clone(), files).await?;
            self.route_field_shards(field_id, reserved_begin, shards)?;
            info!(segment = self.id(), field = %field_id, "field load done");
        }

        self.insert_record.commit(reserved_begin, num_rows);
        Ok(())
    }

    /// Space-URL variant: shard paths are derived by listing
    /// `<url>/<field_id>/` for every required field.
    pub async fn load_field_data_v2(
        &self,
        remote: Arc<dyn ObjectStore>,
        url: &str,
        row_count: usize,
    ) -> Result<()> {
        let mut field_infos = HashMap::new();
        let mut field_ids: Vec<FieldId> = vec![TIMESTAMP_FIELD, ROW_ID_FIELD];
        field_ids.extend(self.schema().fields().iter().map(|f| f.id));
        for field_id in field_ids {
            let prefix = StorePath::parse(format!("{}/{}", url.trim_end_matches('/'), field_id))?;
            let mut files = Vec::new();
            let mut listing = remote.list(Some(&prefix));
            while let Some(meta) = listing.next().await {
                files.push(meta?.location.to_string());
            }
            field_infos.insert(field_id, FieldLoadInfo {
                insert_files: files,
            });
        }
        let info = LoadFieldDataInfo {
            field_infos,
            row_count,
        };
        self.load_field_data(remote, &info).await
    }

    fn route_field_shards(
        &self,
        field_id: FieldId,
        reserved_begin: u64,
        shards: Vec<FieldData>,
    ) -> Result<()> {
        if field_id == TIMESTAMP_FIELD {
            let mut offset = reserved_begin;
            for shard in shards {
                let timestamps = as_timestamps(&shard)?;
                self.insert_record.timestamps().write_rows(offset, &timestamps);
                offset += timestamps.len() as u64;
            }
            return Ok(());
        }
        if field_id == ROW_ID_FIELD {
            let mut offset = reserved_begin;
            for shard in shards {
                let FieldData::Int64(row_ids) = &shard else {
                    return Err(Error::data_type(
                        "row-id shards must be Int64",
                        location!(),
                    ));
                };
                self.insert_record.row_ids().write_rows(offset, row_ids);
                offset += row_ids.len() as u64;
            }
            return Ok(());
        }

        let is_primary = field_id == self.schema().primary_field_id();
        let mut offset = reserved_begin;
        for shard in shards {
            let rows = shard.num_rows() as u64;
            if self.config().enable_interim_index {
                self.indexing_record.appending_index(offset, field_id, &shard)?;
            }
            if !self.indexing_record.covers(field_id, offset + rows) {
                self.insert_record.column(field_id)?.append(offset, &shard)?;
            }
            if is_primary {
                self.insert_record
                    .insert_pks(&shard.primary_keys()?, offset);
            }
            self.stats
                .mem_size
                .fetch_add(shard.byte_size(), std::sync::atomic::Ordering::Relaxed);
            offset += rows;
        }
        self.try_remove_chunks(field_id);
        Ok(())
    }
}

fn as_timestamps(shard: &FieldData) -> Result<Vec<Timestamp>> {
    let FieldData::Int64(values) = shard else {
        return Err(Error::data_type(
            "timestamp shards must be Int64",
            location!(),
        ));
    };
    Ok(values.iter().map(|&v| v as Timestamp).collect())
}

/// Sorts shard paths by the numeric suffix after the final `/`.
fn sort_by_numeric_suffix(mut files: Vec<String>) -> Result<Vec<String>> {
    let mut keyed = Vec::with_capacity(files.len());
    for file in files.drain(..) {
        let suffix = file.rsplit('/').next().unwrap_or(file.as_str());
        let key: u64 = suffix.parse().map_err(|_| {
            Error::invalid_input(
                format!("shard file {} has no numeric suffix", file),
                location!(),
            )
        })?;
        keyed.push((key, file));
    }
    keyed.sort();
    Ok(keyed.into_iter().map(|(_, file)| file).collect())
}

/// Fetches shards in order through a bounded channel fed by a reader task.
async fn collect_shards(
    remote: Arc<dyn ObjectStore>,
    files: Vec<String>,
) -> Result<Vec<FieldData>> {
    let (tx, mut rx) = mpsc::channel::<Result<FieldData>>(LOAD_CHANNEL_DEPTH);
    let reader = tokio::spawn(async move {
        for file in files {
            let shard = fetch_shard(&remote, &file).await;
            if tx.send(shard).await.is_err() {
                break;
            }
        }
    });
    let mut shards = Vec::new();
    while let Some(shard) = rx.recv().await {
        shards.push(shard?);
    }
    reader.await?;
    Ok(shards)
}

async fn fetch_shard(remote: &Arc<dyn ObjectStore>, file: &str) -> Result<FieldData> {
    let path = StorePath::parse(file)?;
    let bytes = remote.get(&path).await?.bytes().await?;
    Ok(bincode::deserialize(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_by_numeric_suffix() {
        let files = vec![
            "log/f/10".to_string(),
            "log/f/2".to_string(),
            "log/f/1".to_string(),
        ];
        assert_eq!(
            sort_by_numeric_suffix(files).unwrap(),
            vec!["log/f/1", "log/f/2", "log/f/10"]
        );
    }

    #[test]
    fn test_sort_rejects_non_numeric() {
        assert!(sort_by_numeric_suffix(vec!["log/f/last".to_string()]).is_err());
    }
}
