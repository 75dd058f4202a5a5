//! End-to-end router scenarios over the in-process cluster.

use mesh_core::{tuple, BucketId, Condition, Tuple, UpdateOp, Value};
use mesh_router::config::RouterConfig;
use mesh_router::error::RouterError;
use mesh_router::memory::MemoryCluster;
use mesh_router::router::{Router, WriteOpts};
use mesh_router::scatter::ReadOpts;
use mesh_router::schema::{FieldDef, FieldType, IndexDef, SpaceSchema};
use mesh_router::sharding::SpaceSharding;
use mesh_router::stats::RecordingStats;
use std::sync::Arc;
use std::time::Duration;

fn users_schema() -> SpaceSchema {
    SpaceSchema {
        name: "users".into(),
        fields: vec![
            FieldDef::new("id", FieldType::Int),
            FieldDef::new("bucket_id", FieldType::Int).nullable(),
            FieldDef::new("name", FieldType::Str),
            FieldDef::new("age", FieldType::Int).nullable(),
        ],
        primary_key: vec!["id".into()],
        indexes: vec![IndexDef::new("by_age", vec!["age"])],
        bucket_field: "bucket_id".into(),
        version: 1,
    }
}

fn make_router(
    partitions: u32,
    bucket_count: u32,
) -> (Arc<MemoryCluster>, Router<MemoryCluster>, Arc<RecordingStats>) {
    let cluster = Arc::new(MemoryCluster::new(partitions, bucket_count));
    cluster.add_space(users_schema());
    let stats = Arc::new(RecordingStats::new());
    let router = Router::new(
        Arc::clone(&cluster),
        cluster.clone(),
        RouterConfig::default(),
    )
    .with_stats(stats.clone());
    (cluster, router, stats)
}

fn user(id: i64, name: &str) -> Tuple {
    tuple![id, Value::Null, name, 30i64]
}

/// Registers the fixed test hash: ids 1 and 2 land on bucket 1, everything
/// else on bucket 0. With two partitions, bucket b maps to partition b.
fn register_test_hash(router: &Router<MemoryCluster>) {
    router
        .sharding_functions()
        .register("test_hash", |key: &[Value], _n| {
            match key.first().and_then(Value::as_int) {
                Some(1) | Some(2) => BucketId::new(1),
                _ => BucketId::new(0),
            }
        });
}

// =============================================================================
// Scenario A: batch insert with partial duplicates on re-run
// =============================================================================

#[tokio::test]
async fn scenario_a_batch_insert_duplicates_per_partition() {
    let (cluster, router, _stats) = make_router(2, 2);
    register_test_hash(&router);
    cluster.set_sharding(
        "users",
        SpaceSharding {
            key_fields: None,
            func: Some("test_hash".into()),
        },
    );

    let batch = vec![user(1, "a"), user(2, "b"), user(3, "c")];

    let result = router
        .batch_insert("users", batch.clone(), &WriteOpts::new())
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 3);
    assert!(result.errors.is_empty());

    // Re-running the same batch hits a duplicate as the first tuple of
    // each partition's sub-batch: nothing is applied, one error per
    // partition that still holds a duplicate.
    let rerun = router
        .batch_insert("users", batch, &WriteOpts::new())
        .await
        .unwrap();
    assert_eq!(rerun.rows.len(), 0);
    assert_eq!(rerun.errors.len(), 2);
    for error in &rerun.errors {
        assert!(error.tuple.is_some());
    }
}

#[tokio::test]
async fn batch_insert_partition_keeps_prefix_and_reports_failing_tuple() {
    let (cluster, router, _stats) = make_router(2, 2);
    register_test_hash(&router);
    cluster.set_sharding(
        "users",
        SpaceSharding {
            key_fields: None,
            func: Some("test_hash".into()),
        },
    );

    // Seed a duplicate for id 2 only; the partition holding {1, 2} applies
    // 1, stops at 2, and partition {3} is unaffected.
    router
        .insert("users", user(2, "seed"), &WriteOpts::new())
        .await
        .unwrap();

    let result = router
        .batch_insert(
            "users",
            vec![user(1, "a"), user(2, "b"), user(3, "c")],
            &WriteOpts::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.rows.len(), 2); // 1 and 3
    assert_eq!(result.errors.len(), 1);
    let failing = result.errors[0].tuple.as_ref().unwrap();
    assert_eq!(failing.get(0), Some(&Value::Int(2)));
    assert_eq!(cluster.total_rows("users"), 3);
}

#[tokio::test]
async fn batch_resolution_error_aborts_before_any_rpc() {
    let (cluster, router, _stats) = make_router(2, 16);

    // Second tuple carries an embedded bucket id conflicting with the
    // caller override: the whole call aborts, nothing is written.
    let mut conflicting = user(2, "b");
    conflicting.set(1, Value::Int(3));
    let batch = vec![user(1, "a"), conflicting];

    let err = router
        .batch_insert(
            "users",
            batch,
            &WriteOpts::new().with_bucket_id(BucketId::new(7)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::BucketIdConflict { .. }));
    assert_eq!(cluster.total_rows("users"), 0);
}

// =============================================================================
// Scenario B: scatter select with merge and fetch accounting
// =============================================================================

#[tokio::test]
async fn scenario_b_scatter_select_merges_and_counts() {
    let (_cluster, router, stats) = make_router(2, 2);

    // Four tuples on partition 0, one on partition 1.
    for id in 1..=4i64 {
        router
            .insert(
                "users",
                user(id, "x"),
                &WriteOpts::new().with_bucket_id(BucketId::new(0)),
            )
            .await
            .unwrap();
    }
    router
        .insert(
            "users",
            user(5, "y"),
            &WriteOpts::new().with_bucket_id(BucketId::new(1)),
        )
        .await
        .unwrap();

    let rows = router
        .select(
            "users",
            vec![Condition::gt("id", 0i64)],
            &ReadOpts::new().with_first(10),
        )
        .await
        .unwrap();

    let ids: Vec<i64> = rows
        .iter()
        .map(|r| r.get(0).unwrap().as_int().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(stats.map_reduces(), 1);
    assert_eq!(stats.tuples_looked_up(), 5);
    assert_eq!(stats.tuples_fetched(), 5);
}

#[tokio::test]
async fn scatter_select_interleaves_partitions_in_key_order() {
    let (_cluster, router, _stats) = make_router(2, 2);

    for (id, bucket) in [(1i64, 0u32), (2, 1), (3, 0), (4, 1), (5, 1), (6, 0)] {
        router
            .insert(
                "users",
                user(id, "x"),
                &WriteOpts::new().with_bucket_id(BucketId::new(bucket)),
            )
            .await
            .unwrap();
    }

    let rows = router
        .select("users", vec![Condition::gt("id", 0i64)], &ReadOpts::new())
        .await
        .unwrap();
    let ids: Vec<i64> = rows
        .iter()
        .map(|r| r.get(0).unwrap().as_int().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn select_respects_first_limit() {
    let (_cluster, router, _stats) = make_router(2, 16);
    for id in 1..=20i64 {
        router
            .insert("users", user(id, "x"), &WriteOpts::new())
            .await
            .unwrap();
    }

    let rows = router
        .select(
            "users",
            vec![Condition::gt("id", 5i64)],
            &ReadOpts::new().with_first(4),
        )
        .await
        .unwrap();
    let ids: Vec<i64> = rows
        .iter()
        .map(|r| r.get(0).unwrap().as_int().unwrap())
        .collect();
    assert_eq!(ids, vec![6, 7, 8, 9]);
}

// =============================================================================
// Scenario C: equality on the sharding key routes to one partition
// =============================================================================

#[tokio::test]
async fn scenario_c_equality_on_sharding_key_skips_map_reduce() {
    let (_cluster, router, stats) = make_router(4, 256);
    for id in 1..=10i64 {
        router
            .insert("users", user(id, "x"), &WriteOpts::new())
            .await
            .unwrap();
    }

    let rows = router
        .select(
            "users",
            vec![Condition::eq("id", 5i64)],
            &ReadOpts::new(),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(&Value::Int(5)));
    assert_eq!(stats.map_reduces(), 0);
}

#[tokio::test]
async fn force_map_call_plans_a_map_reduce_anyway() {
    let (_cluster, router, stats) = make_router(4, 256);
    router
        .insert("users", user(5, "x"), &WriteOpts::new())
        .await
        .unwrap();

    let rows = router
        .select(
            "users",
            vec![Condition::eq("id", 5i64)],
            &ReadOpts::new().with_force_map_call(),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(stats.map_reduces(), 1);
}

// =============================================================================
// Scenario D: single-flight metadata fetch
// =============================================================================

#[tokio::test]
async fn scenario_d_concurrent_metadata_fetches_share_one_rpc() {
    let (cluster, router, _stats) = make_router(2, 16);
    cluster.set_metadata_delay(Duration::from_millis(10));
    router
        .insert("users", user(1, "a"), &WriteOpts::new())
        .await
        .unwrap();
    assert_eq!(cluster.metadata_fetches(), 1);

    // Drop the populated cache and race two fresh first-time fetches.
    router.invalidate_caches();
    let opts_a = ReadOpts::new();
    let opts_b = ReadOpts::new();
    let (a, b) = tokio::join!(
        router.get("users", vec![1i64.into()], &opts_a),
        router.get("users", vec![1i64.into()], &opts_b),
    );
    assert!(a.unwrap().is_some());
    assert!(b.unwrap().is_some());
    assert_eq!(cluster.metadata_fetches(), 2);
}

#[tokio::test]
async fn metadata_fetch_failure_reaches_all_waiters_without_poisoning() {
    let (cluster, router, _stats) = make_router(2, 16);
    cluster.set_metadata_delay(Duration::from_millis(10));
    cluster.fail_metadata_fetches(1);

    let opts_a = ReadOpts::new();
    let opts_b = ReadOpts::new();
    let (a, b) = tokio::join!(
        router.get("users", vec![1i64.into()], &opts_a),
        router.get("users", vec![1i64.into()], &opts_b),
    );
    assert!(matches!(a.unwrap_err(), RouterError::MetadataFetch { .. }));
    assert!(matches!(b.unwrap_err(), RouterError::MetadataFetch { .. }));
    assert_eq!(cluster.metadata_fetches(), 1);

    // The failure did not poison the cache: the next caller refetches.
    let row = router
        .get("users", vec![1i64.into()], &ReadOpts::new())
        .await
        .unwrap();
    assert!(row.is_none());
    assert_eq!(cluster.metadata_fetches(), 2);
}

// =============================================================================
// Bucket resolution
// =============================================================================

#[tokio::test]
async fn bucket_conflict_rejected_without_rpc() {
    let (cluster, router, _stats) = make_router(2, 16);

    let mut t = user(1, "a");
    t.set(1, Value::Int(5));
    let err = router
        .insert(
            "users",
            t,
            &WriteOpts::new().with_bucket_id(BucketId::new(7)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::BucketIdConflict { .. }));
    assert_eq!(cluster.total_rows("users"), 0);
}

#[tokio::test]
async fn bucket_resolution_is_deterministic_within_an_epoch() {
    let (_cluster, router, _stats) = make_router(4, 256);

    let first = router
        .insert("users", user(42, "a"), &WriteOpts::new())
        .await
        .unwrap();
    let bucket = first.get(1).cloned().unwrap();

    router
        .delete("users", vec![42i64.into()], &WriteOpts::new())
        .await
        .unwrap();
    let second = router
        .insert("users", user(42, "a"), &WriteOpts::new())
        .await
        .unwrap();
    assert_eq!(second.get(1), Some(&bucket));
}

// =============================================================================
// Stale-schema retry
// =============================================================================

#[tokio::test]
async fn stale_schema_select_recovers_once_without_side_effects() {
    let (cluster, router, _stats) = make_router(2, 16);
    for id in 1..=6i64 {
        router
            .insert("users", user(id, "x"), &WriteOpts::new())
            .await
            .unwrap();
    }

    // A schema change the router has not observed yet
    cluster.bump_schema_version("users");
    let fetches_before = cluster.schema_fetches();

    let rows = router
        .select("users", vec![Condition::gt("id", 0i64)], &ReadOpts::new())
        .await
        .unwrap();
    assert_eq!(rows.len(), 6);
    // Exactly one schema refetch, and re-running the read changed nothing
    assert_eq!(cluster.schema_fetches(), fetches_before + 1);
    assert_eq!(cluster.total_rows("users"), 6);

    // The refreshed cache serves the next call without another fetch
    router
        .select("users", vec![Condition::gt("id", 0i64)], &ReadOpts::new())
        .await
        .unwrap();
    assert_eq!(cluster.schema_fetches(), fetches_before + 1);
}

#[tokio::test]
async fn stale_schema_write_recovers_once() {
    let (cluster, router, _stats) = make_router(2, 16);
    router
        .insert("users", user(1, "a"), &WriteOpts::new())
        .await
        .unwrap();

    cluster.bump_schema_version("users");
    let row = router
        .insert("users", user(2, "b"), &WriteOpts::new())
        .await
        .unwrap();
    assert_eq!(row.get(0), Some(&Value::Int(2)));
    assert_eq!(cluster.total_rows("users"), 2);
}

// =============================================================================
// Point CRUD
// =============================================================================

#[tokio::test]
async fn point_crud_roundtrip() {
    let (_cluster, router, _stats) = make_router(3, 256);

    router
        .insert("users", user(1, "ada"), &WriteOpts::new())
        .await
        .unwrap();

    let row = router
        .get("users", vec![1i64.into()], &ReadOpts::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get(2), Some(&Value::Str("ada".into())));

    let updated = router
        .update(
            "users",
            vec![1i64.into()],
            vec![UpdateOp::assign("name", "grace"), UpdateOp::add("age", 1i64)],
            &WriteOpts::new(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.get(2), Some(&Value::Str("grace".into())));
    assert_eq!(updated.get(3), Some(&Value::Int(31)));

    let replaced = router
        .replace("users", user(1, "hopper"), &WriteOpts::new())
        .await
        .unwrap();
    assert_eq!(replaced.get(2), Some(&Value::Str("hopper".into())));

    let deleted = router
        .delete("users", vec![1i64.into()], &WriteOpts::new())
        .await
        .unwrap();
    assert!(deleted.is_some());
    let gone = router
        .get("users", vec![1i64.into()], &ReadOpts::new())
        .await
        .unwrap();
    assert!(gone.is_none());
}

#[tokio::test]
async fn point_ops_with_non_derivable_sharding_key_fall_back_to_lookup() {
    let (cluster, router, _stats) = make_router(2, 16);
    router
        .sharding_functions()
        .register("by_name_len", |key: &[Value], n| {
            let len = key
                .first()
                .and_then(Value::as_str)
                .map(|s| s.len() as u32)
                .unwrap_or(0);
            BucketId::new(len % n)
        });
    cluster.set_sharding(
        "users",
        SpaceSharding {
            key_fields: Some(vec!["name".into()]),
            func: Some("by_name_len".into()),
        },
    );

    router
        .insert("users", user(1, "ada"), &WriteOpts::new())
        .await
        .unwrap();

    // The row is routed by name, so its partition is not derivable from
    // the primary key; get and update locate it with a fan-out lookup.
    let row = router
        .get("users", vec![1i64.into()], &ReadOpts::new())
        .await
        .unwrap();
    assert!(row.is_some());

    let updated = router
        .update(
            "users",
            vec![1i64.into()],
            vec![UpdateOp::add("age", 2i64)],
            &WriteOpts::new(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.get(3), Some(&Value::Int(32)));
}

#[tokio::test]
async fn upsert_inserts_then_updates() {
    let (_cluster, router, _stats) = make_router(2, 16);

    router
        .upsert(
            "users",
            user(1, "first"),
            vec![UpdateOp::add("age", 10i64)],
            &WriteOpts::new(),
        )
        .await
        .unwrap();
    let row = router
        .get("users", vec![1i64.into()], &ReadOpts::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get(3), Some(&Value::Int(30)));

    router
        .upsert(
            "users",
            user(1, "ignored"),
            vec![UpdateOp::add("age", 10i64)],
            &WriteOpts::new(),
        )
        .await
        .unwrap();
    let row = router
        .get("users", vec![1i64.into()], &ReadOpts::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get(3), Some(&Value::Int(40)));
}

#[tokio::test]
async fn object_variants_flatten_through_the_schema() {
    let (_cluster, router, _stats) = make_router(2, 16);

    let mut object = mesh_router::router::Object::new();
    object.insert("id".into(), serde_json::json!(7));
    object.insert("name".into(), serde_json::json!("lin"));
    object.insert("age".into(), serde_json::json!(28));

    let row = router
        .insert_object("users", object, &WriteOpts::new())
        .await
        .unwrap();
    assert_eq!(row.get(0), Some(&Value::Int(7)));
    assert_eq!(row.get(2), Some(&Value::Str("lin".into())));

    // Unknown fields are rejected before any RPC
    let mut bad = mesh_router::router::Object::new();
    bad.insert("id".into(), serde_json::json!(8));
    bad.insert("shoe_size".into(), serde_json::json!(44));
    let err = router
        .insert_object("users", bad, &WriteOpts::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Validation(_)));
}

// =============================================================================
// Pagination, tail mode, projection
// =============================================================================

#[tokio::test]
async fn select_resumes_after_cursor() {
    let (_cluster, router, _stats) = make_router(2, 16);
    for id in 1..=9i64 {
        router
            .insert("users", user(id, "x"), &WriteOpts::new())
            .await
            .unwrap();
    }

    let first_page = router
        .select(
            "users",
            vec![Condition::gt("id", 0i64)],
            &ReadOpts::new().with_first(4),
        )
        .await
        .unwrap();
    let cursor = first_page.last().cloned().unwrap();

    let second_page = router
        .select(
            "users",
            vec![Condition::gt("id", 0i64)],
            &ReadOpts::new().with_first(4).with_after(cursor),
        )
        .await
        .unwrap();
    let ids: Vec<i64> = second_page
        .iter()
        .map(|r| r.get(0).unwrap().as_int().unwrap())
        .collect();
    assert_eq!(ids, vec![5, 6, 7, 8]);
}

#[tokio::test]
async fn tail_mode_returns_preceding_rows_in_ascending_order() {
    let (_cluster, router, _stats) = make_router(2, 16);
    for id in 1..=10i64 {
        router
            .insert("users", user(id, "x"), &WriteOpts::new())
            .await
            .unwrap();
    }
    let anchor = router
        .get("users", vec![8i64.into()], &ReadOpts::new())
        .await
        .unwrap()
        .unwrap();

    let rows = router
        .select(
            "users",
            vec![Condition::gt("id", 0i64)],
            &ReadOpts::new().with_first(-3).with_after(anchor),
        )
        .await
        .unwrap();
    let ids: Vec<i64> = rows
        .iter()
        .map(|r| r.get(0).unwrap().as_int().unwrap())
        .collect();
    assert_eq!(ids, vec![5, 6, 7]);
}

#[tokio::test]
async fn tail_mode_resumes_past_missing_cursor() {
    let (_cluster, router, _stats) = make_router(2, 16);
    for id in 1..=10i64 {
        router
            .insert("users", user(id, "x"), &WriteOpts::new())
            .await
            .unwrap();
    }
    let anchor = router
        .get("users", vec![8i64.into()], &ReadOpts::new())
        .await
        .unwrap()
        .unwrap();

    // The anchor row vanishes between the two calls; the tail resumes
    // from its nearest surviving neighbor.
    router
        .delete("users", vec![8i64.into()], &WriteOpts::new())
        .await
        .unwrap();

    let rows = router
        .select(
            "users",
            vec![Condition::gt("id", 0i64)],
            &ReadOpts::new().with_first(-3).with_after(anchor),
        )
        .await
        .unwrap();
    let ids: Vec<i64> = rows
        .iter()
        .map(|r| r.get(0).unwrap().as_int().unwrap())
        .collect();
    assert_eq!(ids, vec![5, 6, 7]);
}

#[tokio::test]
async fn tail_mode_without_after_is_rejected() {
    let (_cluster, router, _stats) = make_router(2, 16);
    let err = router
        .select(
            "users",
            vec![Condition::gt("id", 0i64)],
            &ReadOpts::new().with_first(-3),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Validation(_)));
}

#[tokio::test]
async fn projection_strips_output_but_not_merge_order() {
    let (_cluster, router, _stats) = make_router(2, 16);
    for id in 1..=6i64 {
        router
            .insert("users", user(id, "x"), &WriteOpts::new())
            .await
            .unwrap();
    }

    let rows = router
        .select(
            "users",
            vec![Condition::gt("id", 0i64)],
            &ReadOpts::new().with_fields(vec!["name".into(), "id".into()]),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 6);
    // Projected to the requested fields, still in id order
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row.len(), 2);
        assert_eq!(row.get(1), Some(&Value::Int(i as i64 + 1)));
    }
}

#[tokio::test]
async fn pairs_streams_lazily_with_refill_rounds() {
    let (_cluster, router, _stats) = make_router(2, 16);
    for id in 1..=12i64 {
        router
            .insert("users", user(id, "x"), &WriteOpts::new())
            .await
            .unwrap();
    }

    // A tiny batch size forces several refill rounds per partition.
    let mut stream = router
        .pairs(
            "users",
            vec![Condition::gt("id", 0i64)],
            &ReadOpts::new().with_batch_size(3),
        )
        .await
        .unwrap();

    let mut ids = Vec::new();
    while let Some(row) = stream.next().await.unwrap() {
        ids.push(row.get(0).unwrap().as_int().unwrap());
    }
    assert_eq!(ids, (1..=12).collect::<Vec<i64>>());
}

#[tokio::test]
async fn secondary_index_orders_by_index_key_then_primary_key() {
    let (_cluster, router, _stats) = make_router(2, 16);
    // Duplicate ages across partitions exercise the tie-break
    for (id, age) in [(1i64, 40i64), (2, 20), (3, 40), (4, 20), (5, 30)] {
        router
            .insert("users", tuple![id, Value::Null, "x", age], &WriteOpts::new())
            .await
            .unwrap();
    }

    let rows = router
        .select(
            "users",
            vec![Condition::ge("age", 20i64)],
            &ReadOpts::new(),
        )
        .await
        .unwrap();
    let pairs: Vec<(i64, i64)> = rows
        .iter()
        .map(|r| {
            (
                r.get(3).unwrap().as_int().unwrap(),
                r.get(0).unwrap().as_int().unwrap(),
            )
        })
        .collect();
    assert_eq!(pairs, vec![(20, 2), (20, 4), (30, 5), (40, 1), (40, 3)]);
}

// =============================================================================
// Space-wide operations
// =============================================================================

#[tokio::test]
async fn len_min_max_truncate() {
    let (_cluster, router, _stats) = make_router(3, 256);
    for id in [3i64, 1, 9, 4, 7] {
        router
            .insert("users", user(id, "x"), &WriteOpts::new())
            .await
            .unwrap();
    }

    assert_eq!(router.len("users", &ReadOpts::new()).await.unwrap(), 5);

    let min = router.min("users", None, &ReadOpts::new()).await.unwrap().unwrap();
    assert_eq!(min.get(0), Some(&Value::Int(1)));
    let max = router.max("users", None, &ReadOpts::new()).await.unwrap().unwrap();
    assert_eq!(max.get(0), Some(&Value::Int(9)));

    router.truncate("users", &WriteOpts::new()).await.unwrap();
    assert_eq!(router.len("users", &ReadOpts::new()).await.unwrap(), 0);
    assert!(router
        .min("users", None, &ReadOpts::new())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn batch_upsert_mixes_inserts_and_updates() {
    let (_cluster, router, _stats) = make_router(2, 16);
    router
        .insert("users", user(1, "ada"), &WriteOpts::new())
        .await
        .unwrap();

    let result = router
        .batch_upsert(
            "users",
            vec![user(1, "ignored"), user(2, "new")],
            vec![vec![UpdateOp::add("age", 5i64)], vec![]],
            &WriteOpts::new(),
        )
        .await
        .unwrap();
    assert!(result.errors.is_empty());

    let existing = router
        .get("users", vec![1i64.into()], &ReadOpts::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(existing.get(3), Some(&Value::Int(35)));
    let inserted = router
        .get("users", vec![2i64.into()], &ReadOpts::new())
        .await
        .unwrap();
    assert!(inserted.is_some());
}

// =============================================================================
// Error surfaces
// =============================================================================

#[tokio::test]
async fn unknown_space_fails_fast_and_is_observed() {
    let (_cluster, router, stats) = make_router(2, 16);
    let err = router
        .get("ghost", vec![1i64.into()], &ReadOpts::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::UnknownSpace { .. }));
    assert_eq!(stats.space_not_found(), 1);
}

#[tokio::test]
async fn unknown_condition_field_is_rejected_before_rpc() {
    let (_cluster, router, _stats) = make_router(2, 16);
    let err = router
        .select("users", vec![Condition::eq("ghost", 1i64)], &ReadOpts::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Validation(_)));
}

#[tokio::test]
async fn operations_are_observed_with_status() {
    let (_cluster, router, stats) = make_router(2, 16);
    router
        .insert("users", user(1, "a"), &WriteOpts::new())
        .await
        .unwrap();
    router
        .insert("users", user(1, "dup"), &WriteOpts::new())
        .await
        .unwrap_err();

    let ops = stats.operations();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].1, "insert");
    assert_eq!(ops[0].2, mesh_router::stats::OpStatus::Ok);
    assert_eq!(ops[1].2, mesh_router::stats::OpStatus::Error);
}
