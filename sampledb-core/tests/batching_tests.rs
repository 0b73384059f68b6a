//! Integration tests for save contexts, adaptive batching and sharding

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use sampledb_core::batching::shard::shard_ids;
use sampledb_core::batching::{shard_bounds, shard_with_policy, BatchSizer, ShardPolicy, ShardSpec};
use sampledb_core::schema::{FieldDescriptor, MediaType, ScalarKind};
use sampledb_core::{
    run_sharded, shard, BatchingStrategy, Collection, EngineConfig, MemoryStore, MutationError,
    ObjectId, SampleDbError, SampleMutation,
};
use serde_json::json;

fn create_collection(name: &str, samples: usize) -> (Arc<MemoryStore>, Collection, Vec<ObjectId>) {
    let store = Arc::new(MemoryStore::new());
    let coll = Collection::new(name, MediaType::Image, store.clone(), EngineConfig::default()).unwrap();
    coll.add_sample_field("score", FieldDescriptor::scalar(ScalarKind::Float))
        .unwrap();
    let ids = if samples == 0 {
        Vec::new()
    } else {
        coll.add_samples(
            (0..samples)
                .map(|i| json!({"filepath": format!("{}.jpg", i), "tags": []}))
                .collect(),
        )
        .unwrap()
    };
    (store, coll, ids)
}

// ========== SAVE CONTEXT TESTS ==========

#[test]
fn test_static_context_writes_in_batches() {
    let (store, coll, ids) = create_collection("static", 7);
    store.reset_counters();

    let history = coll
        .with_save_context(Some(BatchingStrategy::Static { batch_size: 3 }), |ctx| {
            for (i, id) in ids.iter().enumerate() {
                ctx.register(SampleMutation::new(id.clone()).set("score", json!(i as f64 / 10.0)))?;
            }
            Ok(ctx.flush_history().to_vec())
        })
        .unwrap();

    assert_eq!(history, vec![3, 3]);
    // The trailing write happens when the context closes
    assert_eq!(store.bulk_write_calls(), 3);
    let scores = coll.view().values("score").unwrap();
    assert_eq!(scores.len(), 7);
    assert_eq!(scores[6].as_f64(), Some(0.6));
}

#[test]
fn test_latency_context_flushes_by_elapsed_time() {
    let (store, coll, ids) = create_collection("latency", 4);
    store.reset_counters();

    let history = coll
        .with_save_context(Some(BatchingStrategy::Latency { target: Duration::ZERO }), |ctx| {
            for id in &ids {
                ctx.register(SampleMutation::new(id.clone()).set("score", json!(0.5)))?;
            }
            Ok(ctx.flush_history().to_vec())
        })
        .unwrap();
    assert_eq!(history, vec![1, 1, 1, 1]);
    assert_eq!(store.bulk_write_calls(), 4);

    store.reset_counters();
    let history = coll
        .with_save_context(
            Some(BatchingStrategy::Latency { target: Duration::from_secs(3600) }),
            |ctx| {
                for id in &ids {
                    ctx.register(SampleMutation::new(id.clone()).set("score", json!(0.7)))?;
                }
                Ok(ctx.flush_history().to_vec())
            },
        )
        .unwrap();
    // Everything waits for the context to close
    assert!(history.is_empty());
    assert_eq!(store.bulk_write_calls(), 1);
    let scores = coll.view().values("score").unwrap();
    assert!(scores.iter().all(|s| s.as_f64() == Some(0.7)));
}

#[test]
fn test_push_onto_null_list_is_repaired() {
    let store = Arc::new(MemoryStore::new());
    let coll = Collection::new("heal", MediaType::Image, store.clone(), EngineConfig::default()).unwrap();
    let ids = coll
        .add_samples(vec![
            json!({"filepath": "a.jpg", "tags": []}),
            json!({"filepath": "b.jpg", "tags": null}),
            json!({"filepath": "c.jpg", "tags": ["old"]}),
        ])
        .unwrap();

    coll.with_save_context(Some(BatchingStrategy::Static { batch_size: 10 }), |ctx| {
        for id in &ids {
            ctx.register(SampleMutation::new(id.clone()).push("tags", json!("x")))?;
        }
        Ok(())
    })
    .unwrap();

    let tags = coll.view().values("tags").unwrap();
    assert_eq!(tags, vec![json!(["x"]), json!(["x"]), json!(["old", "x"])]);
}

#[test]
fn test_add_to_set_skips_present_values() {
    let (_, coll, ids) = create_collection("sets", 2);
    coll.with_save_context(Some(BatchingStrategy::Static { batch_size: 1 }), |ctx| {
        for _ in 0..2 {
            ctx.register(SampleMutation::new(ids[0].clone()).add_to_set("tags", json!("hard")))?;
        }
        ctx.register(SampleMutation::new(ids[1].clone()).add_to_set("tags", json!(7)))
    })
    .unwrap_err();

    let tags = coll.view().values("tags").unwrap();
    assert_eq!(tags, vec![json!(["hard"]), json!([])]);
}

#[test]
fn test_second_null_list_is_reported() {
    let store = Arc::new(MemoryStore::new());
    let coll = Collection::new("heal", MediaType::Image, store.clone(), EngineConfig::default()).unwrap();
    let ids = coll
        .add_samples(vec![
            json!({"filepath": "a.jpg", "tags": []}),
            json!({"filepath": "b.jpg", "tags": null}),
            json!({"filepath": "c.jpg", "tags": null}),
        ])
        .unwrap();

    let err = coll
        .with_save_context(Some(BatchingStrategy::Static { batch_size: 10 }), |ctx| {
            for id in &ids {
                ctx.register(SampleMutation::new(id.clone()).push("tags", json!("x")))?;
            }
            Ok(())
        })
        .unwrap_err();

    match err {
        SampleDbError::Mutation(MutationError::NullArrayField { path, applied }) => {
            assert_eq!(path, "tags");
            assert_eq!(applied, 2);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    // Writes before the second failure stay applied
    let docs = store.documents("heal");
    assert_eq!(docs[0]["tags"], json!(["x"]));
    assert_eq!(docs[1]["tags"], json!(["x"]));
    assert_eq!(docs[2]["tags"], json!(null));
}

#[test]
fn test_failed_flush_surfaces_from_callback_scope() {
    let (store, coll, ids) = create_collection("failing", 2);
    store.fail_next_bulk_write("disk full");
    let err = coll
        .with_save_context(Some(BatchingStrategy::Static { batch_size: 10 }), |ctx| {
            ctx.register(SampleMutation::new(ids[0].clone()).set("score", json!(1.0)))
        })
        .unwrap_err();
    assert!(err.to_string().contains("disk full"));
}

#[test]
fn test_strategy_from_name() {
    let config = EngineConfig::default();
    assert_eq!(
        BatchingStrategy::from_name("static", &config).unwrap(),
        BatchingStrategy::Static { batch_size: 100 }
    );
    assert_eq!(BatchingStrategy::from_name("size", &config).unwrap().name(), "size");
    assert!(BatchingStrategy::from_name("eager", &config).is_err());
}

// ========== SHARDING TESTS ==========

#[test]
fn test_shards_cover_view_in_order() {
    let (_, coll, _) = create_collection("shards", 7);
    let shards = shard(&coll.view(), 3, "slice").unwrap();
    let specs: Vec<&ShardSpec> = shards.iter().map(|s| &s.spec).collect();
    assert_eq!(
        specs,
        vec![
            &ShardSpec::Range { start: 0, end: 3 },
            &ShardSpec::Range { start: 3, end: 5 },
            &ShardSpec::Range { start: 5, end: 7 },
        ]
    );
    assert!(shards.iter().all(|s| s.count == 3));
}

#[test]
fn test_more_workers_than_samples() {
    let (_, coll, _) = create_collection("shards", 7);
    let shards = shard(&coll.view(), 10, "slice").unwrap();
    assert_eq!(shards.len(), 7);
    assert!(shards.iter().all(|s| s.len() == 1));

    let (_, empty, _) = create_collection("empty", 0);
    let shards = shard(&empty.view(), 4, "slice").unwrap();
    assert_eq!(shards.len(), 1);
    assert!(shards[0].is_empty());
}

#[test]
fn test_id_shards_partition_ids() {
    let (_, coll, ids) = create_collection("shards", 5);
    let shards = shard_with_policy(&coll.view(), 2, ShardPolicy::Ids).unwrap();
    assert_eq!(shards.iter().map(|s| s.len()).collect::<Vec<_>>(), vec![3, 2]);

    let flattened = shard_ids(&shards);
    let expected: Vec<_> = ids.iter().map(ObjectId::to_value).collect();
    assert_eq!(flattened, expected);
}

#[test]
fn test_workers_see_only_their_shard() {
    let (_, coll, _) = create_collection("shards", 7);
    let view = coll.view();
    let shards = shard(&view, 3, "id").unwrap();

    let paths = run_sharded(&view, &shards, |_, shard_view| shard_view.values("filepath")).unwrap();
    assert_eq!(paths.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 2, 2]);
    let all: Vec<_> = paths.into_iter().flatten().collect();
    assert_eq!(all, view.values("filepath").unwrap());
}

#[test]
fn test_zero_workers_rejected() {
    let (_, coll, _) = create_collection("shards", 3);
    assert!(matches!(shard(&coll.view(), 0, "slice"), Err(SampleDbError::InvalidQuery(_))));
    assert!(matches!(shard(&coll.view(), 2, "hash"), Err(SampleDbError::ShardPolicy(_))));
}

// ========== PROPERTY TESTS ==========

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_shard_bounds_partition(n in 0usize..40, workers in 1usize..12) {
        let bounds = shard_bounds(n, workers).unwrap();
        prop_assert_eq!(bounds.len(), workers.min(n).max(1));
        prop_assert_eq!(bounds.first().map(|b| b.0), Some(0));
        prop_assert_eq!(bounds.last().map(|b| b.1), Some(n));
        for pair in bounds.windows(2) {
            prop_assert_eq!(pair[0].1, pair[1].0);
        }
        let total: usize = bounds.iter().map(|(s, e)| e - s).sum();
        prop_assert_eq!(total, n);
    }

    #[test]
    fn prop_batch_size_converges(
        per_item in 0.001f64..10.0,
        desired in 1usize..2000,
        init in 1usize..2000,
        min_size in 1usize..10,
        span in 0usize..1000,
        max_beta in 1.5f64..4.0,
    ) {
        let max_size = min_size + span;
        let mut sizer = BatchSizer::with_bounds(per_item * desired as f64, init, min_size, max_size, max_beta);
        let mut last = sizer.next_size(None);
        for _ in 0..64 {
            let next = sizer.next_size(Some(per_item * last as f64));
            prop_assert!(next as f64 <= (last as f64 * max_beta).round());
            prop_assert!(next as f64 + 1.0 >= (last as f64 / max_beta).round());
            prop_assert!((min_size..=max_size).contains(&next));
            last = next;
        }
        prop_assert_eq!(last, desired.clamp(min_size, max_size));
    }
}
