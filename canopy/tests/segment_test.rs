// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Canopy Authors

//! End-to-end scenarios for the growing segment.

use std::sync::Arc;

use roaring::RoaringBitmap;

use canopy::data::{FieldData, IdArray, InsertData};
use canopy::segment::{GrowingSegment, LoadDeletedRecordInfo, LoadFieldDataInfo};
use canopy::{
    DataType, FieldId, FieldMeta, Metric, Schema, SearchInfo, SearchResult, SegmentConfig,
    VectorDataset, INVALID_SEG_OFFSET,
};

const ID_FIELD: FieldId = FieldId(100);
const VEC_FIELD: FieldId = FieldId(101);

fn schema() -> Arc<Schema> {
    Arc::new(
        Schema::new(
            vec![
                FieldMeta::new(ID_FIELD, "id", DataType::Int64),
                FieldMeta::new_vector(VEC_FIELD, "vec", DataType::FloatVector, 4),
            ],
            ID_FIELD,
        )
        .unwrap(),
    )
}

fn small_segment() -> GrowingSegment {
    GrowingSegment::new(
        1,
        schema(),
        SegmentConfig {
            chunk_rows: 2,
            ..SegmentConfig::default()
        },
    )
    .unwrap()
}

fn insert_data(ids: &[i64], vectors: &[f32]) -> InsertData {
    InsertData::new(vec![
        (ID_FIELD, FieldData::Int64(ids.to_vec())),
        (
            VEC_FIELD,
            FieldData::FloatVector {
                dim: 4,
                data: vectors.to_vec(),
            },
        ),
    ])
    .unwrap()
}

/// Seeds the E1 segment: three rows with unit vectors at ts 1..=3.
fn seeded_segment() -> GrowingSegment {
    let segment = small_segment();
    let begin = segment.pre_insert(3);
    assert_eq!(begin, 0);
    segment
        .insert(
            begin,
            3,
            &[10, 11, 12],
            &[1, 2, 3],
            &insert_data(
                &[10, 11, 12],
                &[
                    1.0, 0.0, 0.0, 0.0, //
                    0.0, 1.0, 0.0, 0.0, //
                    0.0, 0.0, 1.0, 0.0,
                ],
            ),
        )
        .unwrap();
    segment
}

fn float_query(data: &[f32]) -> VectorDataset {
    VectorDataset::Float {
        dim: 4,
        data: data.to_vec(),
    }
}

#[test]
fn test_single_field_insert_and_search() {
    let segment = seeded_segment();
    assert_eq!(segment.row_count(), 3);

    let mut result = SearchResult::default();
    segment
        .vector_search(
            &SearchInfo::new(VEC_FIELD, 2, Metric::L2),
            &float_query(&[1.0, 0.0, 0.0, 0.0]),
            10,
            &RoaringBitmap::new(),
            &mut result,
        )
        .unwrap();
    assert_eq!(result.total_nq, 1);
    assert_eq!(result.unity_topk, 2);
    assert_eq!(result.seg_offsets[0], 0);
    assert_eq!(result.distances[0], 0.0);

    let vectors = segment.bulk_subscript(VEC_FIELD, &[1, 2]).unwrap();
    assert_eq!(
        vectors,
        FieldData::FloatVector {
            dim: 4,
            data: vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        }
    );
}

#[test]
fn test_delete_before_search() {
    let segment = seeded_segment();
    segment
        .delete(1, &IdArray::Int64(vec![11]), &[5])
        .unwrap();

    let mut bitset = RoaringBitmap::new();
    segment.mask_with_delete(&mut bitset, 3, 10);
    assert!(bitset.contains(1));
    assert!(!bitset.contains(0));
    assert!(!bitset.contains(2));

    // composing twice changes nothing
    let before = bitset.len();
    segment.mask_with_delete(&mut bitset, 3, 10);
    assert_eq!(bitset.len(), before);

    // at ts 10 the deletion is visible and the id resolves to nothing
    let (_, offsets) = segment
        .search_ids(&IdArray::Int64(vec![11]), 10)
        .unwrap();
    assert!(offsets.is_empty());

    // before the deletion's timestamp the row is still reachable
    let (_, offsets) = segment
        .search_ids(&IdArray::Int64(vec![11]), 4)
        .unwrap();
    assert_eq!(offsets, vec![1]);

    // a search at ts 10 no longer returns the deleted row
    let mut result = SearchResult::default();
    segment
        .vector_search(
            &SearchInfo::new(VEC_FIELD, 3, Metric::L2),
            &float_query(&[0.0, 1.0, 0.0, 0.0]),
            10,
            &RoaringBitmap::new(),
            &mut result,
        )
        .unwrap();
    assert!(!result.hits(0).any(|(offset, _)| offset == 1));
}

#[test]
fn test_delete_missing_pk_is_noop() {
    let segment = seeded_segment();
    segment
        .delete(1, &IdArray::Int64(vec![99]), &[5])
        .unwrap();
    let mut bitset = RoaringBitmap::new();
    segment.mask_with_delete(&mut bitset, 3, 10);
    assert!(bitset.is_empty());
}

#[test]
fn test_concurrent_pre_insert_covers_offset_space() {
    let segment = Arc::new(small_segment());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let segment = segment.clone();
            std::thread::spawn(move || segment.pre_insert(100))
        })
        .collect();
    let mut begins: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    begins.sort();
    assert_eq!(begins, (0..8).map(|i| i * 100).collect::<Vec<u64>>());
}

#[test]
fn test_chunk_release_after_sync() {
    let segment = GrowingSegment::new(
        2,
        schema(),
        SegmentConfig {
            chunk_rows: 1024,
            enable_interim_index: true,
            interim_index_threshold: 4096,
            interim_metric: Metric::L2,
        },
    )
    .unwrap();

    let batch = 2500usize;
    for b in 0..4 {
        let begin = segment.pre_insert(batch as u64);
        let ids: Vec<i64> = (0..batch).map(|i| (begin + i as u64) as i64).collect();
        let timestamps: Vec<u64> = (0..batch).map(|i| begin + i as u64 + 1).collect();
        let mut vectors = Vec::with_capacity(batch * 4);
        for i in 0..batch {
            let v = (begin + i as u64) as f32;
            vectors.extend_from_slice(&[v, 0.0, 0.0, 0.0]);
        }
        segment
            .insert(begin, batch, &ids, &timestamps, &insert_data(&ids, &vectors))
            .unwrap();
        if b >= 1 {
            // the second batch crosses the 4096-row threshold
            segment.try_remove_chunks(VEC_FIELD);
        }
    }
    assert_eq!(segment.row_count(), 10_000);

    // raw chunks are gone, reads come from the interim index
    let offsets: Vec<i64> = (0..4096).collect();
    let data = segment.bulk_subscript(VEC_FIELD, &offsets).unwrap();
    let FieldData::FloatVector { dim: 4, data } = data else {
        panic!("expected float vectors");
    };
    for (i, chunk) in data.chunks(4).enumerate() {
        assert_eq!(chunk, &[i as f32, 0.0, 0.0, 0.0]);
    }

    // and searches still see every row
    let mut result = SearchResult::default();
    segment
        .vector_search(
            &SearchInfo::new(VEC_FIELD, 1, Metric::L2),
            &float_query(&[9999.0, 0.0, 0.0, 0.0]),
            u64::MAX,
            &RoaringBitmap::new(),
            &mut result,
        )
        .unwrap();
    assert_eq!(result.seg_offsets[0], 9999);
}

#[test]
fn test_insert_rejects_duplicate_field_payload() {
    let err = InsertData::new(vec![
        (ID_FIELD, FieldData::Int64(vec![1])),
        (ID_FIELD, FieldData::Int64(vec![2])),
    ]);
    assert!(err.is_err());
}

#[test]
fn test_failed_insert_commits_nothing() {
    let segment = small_segment();
    let begin = segment.pre_insert(1);
    // missing the vector field entirely
    let partial = InsertData::new(vec![(ID_FIELD, FieldData::Int64(vec![1]))]).unwrap();
    let err = segment.insert(begin, 1, &[1], &[1], &partial);
    assert!(err.is_err());
    assert_eq!(segment.row_count(), 0);
    assert_eq!(segment.get_active_count(u64::MAX), 0);
}

#[test]
fn test_row_count_mismatch_is_bad_input() {
    let segment = small_segment();
    let begin = segment.pre_insert(2);
    let data = insert_data(&[1], &[0.0; 4]);
    assert!(segment.insert(begin, 2, &[1, 2], &[1, 2], &data).is_err());
}

#[test]
fn test_search_topk_zero() {
    let segment = seeded_segment();
    let mut result = SearchResult::default();
    segment
        .vector_search(
            &SearchInfo::new(VEC_FIELD, 0, Metric::L2),
            &float_query(&[1.0, 0.0, 0.0, 0.0]),
            10,
            &RoaringBitmap::new(),
            &mut result,
        )
        .unwrap();
    assert!(result.seg_offsets.is_empty());
    assert_eq!(result.unity_topk, 0);
}

#[test]
fn test_search_round_decimal() {
    let segment = seeded_segment();
    let mut info = SearchInfo::new(VEC_FIELD, 1, Metric::L2);
    info.round_decimal = 1;
    let mut result = SearchResult::default();
    segment
        .vector_search(
            &info,
            &float_query(&[0.9, 0.12, 0.0, 0.0]),
            10,
            &RoaringBitmap::new(),
            &mut result,
        )
        .unwrap();
    // every distance is rounded to one decimal place
    for d in &result.distances {
        assert_eq!((d * 10.0).round() / 10.0, *d);
    }
}

#[test]
fn test_read_timestamp_bounds_visibility() {
    let segment = seeded_segment();
    assert_eq!(segment.get_active_count(0), 0);
    assert_eq!(segment.get_active_count(2), 2);
    assert_eq!(segment.get_active_count(100), 3);

    // a search at ts 1 sees only the first row
    let mut result = SearchResult::default();
    segment
        .vector_search(
            &SearchInfo::new(VEC_FIELD, 3, Metric::L2),
            &float_query(&[0.0, 0.0, 1.0, 0.0]),
            1,
            &RoaringBitmap::new(),
            &mut result,
        )
        .unwrap();
    let hits: Vec<i64> = result.hits(0).map(|(o, _)| o).collect();
    assert_eq!(hits, vec![0]);
}

#[test]
fn test_range_search_on_raw_chunks() {
    let segment = seeded_segment();
    let mut info = SearchInfo::new(VEC_FIELD, 3, Metric::L2);
    info.params.radius = Some(1.5);
    let mut result = SearchResult::default();
    segment
        .vector_search(
            &info,
            &float_query(&[1.0, 0.0, 0.0, 0.0]),
            10,
            &RoaringBitmap::new(),
            &mut result,
        )
        .unwrap();
    // only the identical vector is within radius 1.5 (squared L2)
    let hits: Vec<i64> = result.hits(0).map(|(o, _)| o).collect();
    assert_eq!(hits, vec![0]);
}

#[test]
fn test_bulk_subscript_sentinel_and_system_columns() {
    let segment = seeded_segment();
    let data = segment
        .bulk_subscript(VEC_FIELD, &[0, INVALID_SEG_OFFSET])
        .unwrap();
    assert_eq!(
        data,
        FieldData::FloatVector {
            dim: 4,
            data: vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        }
    );

    let ids = segment
        .bulk_subscript(ID_FIELD, &[2, 0])
        .unwrap();
    assert_eq!(ids, FieldData::Int64(vec![12, 10]));

    use canopy::{SystemData, SystemField};
    let row_ids = segment
        .bulk_subscript_system(SystemField::RowId, &[0, 2])
        .unwrap();
    assert_eq!(row_ids, SystemData::RowIds(vec![10, 12]));
    let timestamps = segment
        .bulk_subscript_system(SystemField::Timestamp, &[1])
        .unwrap();
    assert_eq!(timestamps, SystemData::Timestamps(vec![2]));
}

#[test]
fn test_search_ids_returns_every_occurrence() {
    let segment = small_segment();
    let begin = segment.pre_insert(3);
    segment
        .insert(
            begin,
            3,
            &[1, 2, 3],
            &[1, 2, 3],
            &insert_data(&[7, 8, 7], &[0.0; 12]),
        )
        .unwrap();
    let (ids, offsets) = segment
        .search_ids(&IdArray::Int64(vec![7]), u64::MAX)
        .unwrap();
    assert_eq!(ids, IdArray::Int64(vec![7, 7]));
    let mut offsets = offsets;
    offsets.sort();
    assert_eq!(offsets, vec![0, 2]);
}

#[test]
fn test_load_deleted_record_skips_existence_filter() {
    let segment = seeded_segment();
    // pk 99 was never inserted; the bulk path keeps it anyway
    segment
        .load_deleted_record(&LoadDeletedRecordInfo {
            row_count: 2,
            primary_keys: IdArray::Int64(vec![99, 11]),
            timestamps: vec![4, 5],
        })
        .unwrap();
    let mut bitset = RoaringBitmap::new();
    segment.mask_with_delete(&mut bitset, 3, 10);
    assert!(bitset.contains(1));
    assert_eq!(bitset.len(), 1);
}

mod load {
    use super::*;
    use bytes::Bytes;
    use object_store::memory::InMemory;
    use object_store::path::Path as StorePath;
    use object_store::ObjectStore;
    use std::collections::HashMap;

    async fn put_shard(store: &Arc<dyn ObjectStore>, path: &str, shard: &FieldData) {
        store
            .put(
                &StorePath::from(path),
                Bytes::from(bincode::serialize(shard).unwrap()).into(),
            )
            .await
            .unwrap();
    }

    async fn seed_remote(store: &Arc<dyn ObjectStore>, prefix: &str) {
        // two shards per field, named by numeric suffix
        put_shard(store, &format!("{}/1/0", prefix), &FieldData::Int64(vec![1, 2])).await;
        put_shard(store, &format!("{}/1/1", prefix), &FieldData::Int64(vec![3])).await;
        put_shard(store, &format!("{}/0/0", prefix), &FieldData::Int64(vec![10, 11])).await;
        put_shard(store, &format!("{}/0/1", prefix), &FieldData::Int64(vec![12])).await;
        put_shard(
            store,
            &format!("{}/100/0", prefix),
            &FieldData::Int64(vec![10, 11]),
        )
        .await;
        put_shard(
            store,
            &format!("{}/100/1", prefix),
            &FieldData::Int64(vec![12]),
        )
        .await;
        put_shard(
            store,
            &format!("{}/101/0", prefix),
            &FieldData::FloatVector {
                dim: 4,
                data: vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            },
        )
        .await;
        put_shard(
            store,
            &format!("{}/101/1", prefix),
            &FieldData::FloatVector {
                dim: 4,
                data: vec![0.0, 0.0, 1.0, 0.0],
            },
        )
        .await;
    }

    fn load_info(prefix: &str) -> LoadFieldDataInfo {
        let mut field_infos = HashMap::new();
        for field in [0, 1, 100, 101] {
            field_infos.insert(
                FieldId(field),
                canopy::FieldLoadInfo {
                    insert_files: vec![
                        format!("{}/{}/0", prefix, field),
                        format!("{}/{}/1", prefix, field),
                    ],
                },
            );
        }
        LoadFieldDataInfo {
            field_infos,
            row_count: 3,
        }
    }

    #[tokio::test]
    async fn test_load_field_data_round_trip() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        seed_remote(&store, "seg").await;

        let segment = small_segment();
        segment
            .load_field_data(store.clone(), &load_info("seg"))
            .await
            .unwrap();
        assert_eq!(segment.row_count(), 3);

        let (_, offsets) = segment
            .search_ids(&IdArray::Int64(vec![11]), u64::MAX)
            .unwrap();
        assert_eq!(offsets, vec![1]);

        let mut result = SearchResult::default();
        segment
            .vector_search(
                &SearchInfo::new(VEC_FIELD, 1, Metric::L2),
                &float_query(&[0.0, 0.0, 1.0, 0.0]),
                u64::MAX,
                &RoaringBitmap::new(),
                &mut result,
            )
            .unwrap();
        assert_eq!(result.seg_offsets[0], 2);
    }

    #[tokio::test]
    async fn test_load_field_data_requires_system_columns() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let segment = small_segment();
        let mut info = load_info("seg");
        info.field_infos.remove(&FieldId(1));
        assert!(segment.load_field_data(store, &info).await.is_err());
    }

    #[tokio::test]
    async fn test_load_field_data_v2_lists_shards() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        seed_remote(&store, "space").await;

        let segment = small_segment();
        segment
            .load_field_data_v2(store, "space", 3)
            .await
            .unwrap();
        assert_eq!(segment.row_count(), 3);
        let ids = segment.bulk_subscript(ID_FIELD, &[0, 1, 2]).unwrap();
        assert_eq!(ids, FieldData::Int64(vec![10, 11, 12]));
    }
}

mod disk_index {
    use super::*;
    use canopy_index::disk::file_manager::{FileManager, LocalChunkManager};
    use canopy_index::disk::{DiskAnnIndex, DiskAnnLoadParams};
    use canopy_index::engine::CURRENT_INDEX_VERSION;
    use canopy_index::flat::FlatDiskEngine;
    use object_store::memory::InMemory;
    use object_store::path::Path as StorePath;
    use object_store::ObjectStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_disk_build_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(LocalChunkManager::new(dir.path()).unwrap());
        let remote: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let fm = Arc::new(FileManager::new(
            local.clone(),
            remote,
            StorePath::from("indexes/9/101"),
            9,
            VEC_FIELD,
        ));

        let build_index = DiskAnnIndex::new(
            Box::new(FlatDiskEngine::new(local.clone(), Metric::L2)),
            Metric::L2,
            CURRENT_INDEX_VERSION,
            fm.clone(),
        )
        .unwrap();
        build_index
            .build_with_dataset(
                &VectorDataset::Float {
                    dim: 4,
                    data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
                },
                "2",
            )
            .await
            .unwrap();
        let manifest = build_index.upload().await.unwrap();
        let index_files: Vec<String> = manifest
            .entries()
            .iter()
            .filter(|e| e.value.is_none())
            .map(|e| e.key.clone())
            .collect();

        let query_index = DiskAnnIndex::new(
            Box::new(FlatDiskEngine::new(local, Metric::L2)),
            Metric::L2,
            CURRENT_INDEX_VERSION,
            fm,
        )
        .unwrap();
        query_index
            .load(DiskAnnLoadParams {
                index_files,
                load_thread_num: "2".to_string(),
                query_beamwidth: None,
            })
            .await
            .unwrap();

        let mut result = SearchResult::default();
        query_index
            .query(
                &VectorDataset::Float {
                    dim: 4,
                    data: vec![1.0, 2.0, 3.0, 4.0],
                },
                &SearchInfo::new(VEC_FIELD, 1, Metric::L2),
                &RoaringBitmap::new(),
                &mut result,
            )
            .unwrap();
        assert_eq!(result.seg_offsets, vec![0]);
        assert_eq!(result.distances, vec![0.0]);

        // raw vectors come back byte-identical through the engine
        let bytes = query_index.get_vector(&[1]).unwrap();
        assert_eq!(bytes.len(), 16);
        let floats: Vec<f32> = bytes
            .chunks(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(floats, vec![5.0, 6.0, 7.0, 8.0]);

        query_index.clean_local_data().unwrap();
    }
}
