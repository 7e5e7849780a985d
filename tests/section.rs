//! Data-model behavior of sections: expansion, merge, TTL, children,
//! and the scoped-lock counter scenario.

use futures::future::join_all;
use serde_json::json;
use std::time::Duration;
use trellis::test_utils::{init_tracing, memory_pool_with_names, memory_store, section_on};
use trellis::{Error, KeyTtl, Section};

#[tokio::test]
async fn mapping_round_trips_through_leaves() {
    let store = memory_store();
    let root = section_on(&store, "");

    root.set("a", json!({"x": 1, "y": {"z": 2}}), None)
        .await
        .unwrap();

    assert_eq!(
        root.get("a").unwrap().value().await.unwrap(),
        Some(json!({"x": 1, "y": {"z": 2}}))
    );
    // Every field is individually addressable.
    assert_eq!(root.get("a.y.z").unwrap().value().await.unwrap(), Some(json!(2)));
    assert_eq!(
        root.get("a.y").unwrap().value().await.unwrap(),
        Some(json!({"z": 2}))
    );
}

#[tokio::test]
async fn scalar_write_and_partial_reads() {
    let store = memory_store();
    let root = section_on(&store, "");

    root.set("a.b.c", json!(23), None).await.unwrap();

    assert_eq!(root.get("a.b.c").unwrap().value().await.unwrap(), Some(json!(23)));
    assert_eq!(
        root.get("a.b").unwrap().value().await.unwrap(),
        Some(json!({"c": 23}))
    );
    assert!(!root.get("a.b.x").unwrap().exists().await.unwrap());
    assert!(root.get("a").unwrap().exists().await.unwrap());
}

#[tokio::test]
async fn deeper_write_replaces_scalar_in_the_way() {
    let store = memory_store();
    let root = section_on(&store, "");

    root.set("a.b", json!(2), None).await.unwrap();
    root.set("a.b.c", json!(3), None).await.unwrap();

    assert_eq!(
        root.get("a.b").unwrap().value().await.unwrap(),
        Some(json!({"c": 3}))
    );
}

#[tokio::test]
async fn writing_a_mapping_clears_the_old_subtree() {
    let store = memory_store();
    let root = section_on(&store, "");

    root.set("cfg", json!({"x": 1, "old": {"flag": true}}), None)
        .await
        .unwrap();
    root.set("cfg", json!({"y": 2}), None).await.unwrap();

    assert_eq!(
        root.get("cfg").unwrap().value().await.unwrap(),
        Some(json!({"y": 2}))
    );
}

#[tokio::test]
async fn null_is_a_value_not_absence() {
    let store = memory_store();
    let root = section_on(&store, "");

    root.set("k", json!(null), None).await.unwrap();
    let node = root.get("k").unwrap();
    assert!(node.exists().await.unwrap());
    assert_eq!(node.value().await.unwrap(), Some(json!(null)));
}

#[tokio::test]
async fn clear_and_delete_are_idempotent() {
    let store = memory_store();
    let root = section_on(&store, "");

    let empty = root.get("nothing.here").unwrap();
    empty.clear().await.unwrap();
    assert!(!empty.exists().await.unwrap());

    root.delete("nothing.here").await.unwrap();

    root.set("a", json!({"x": 1, "y": {"z": 2}}), None)
        .await
        .unwrap();
    root.delete("a").await.unwrap();
    assert!(!root.get("a").unwrap().exists().await.unwrap());
    assert_eq!(root.get("a").unwrap().value().await.unwrap(), None);
    root.delete("a").await.unwrap();
}

#[tokio::test]
async fn children_are_immediate_only() {
    let store = memory_store();
    let root = section_on(&store, "");

    root.set("tree", json!({"a": {"deep": 1}, "b": 2, "c": 3}), None)
        .await
        .unwrap();

    let names: Vec<String> = root
        .get("tree")
        .unwrap()
        .children()
        .await
        .unwrap()
        .map(|child| child.path().to_string())
        .collect();
    assert_eq!(names, vec!["tree.a", "tree.b", "tree.c"]);

    let no_children: Vec<_> = root.get("tree.b").unwrap().children().await.unwrap().collect();
    assert!(no_children.is_empty());
}

#[tokio::test]
async fn ttl_scenario_distinguishes_missing_from_no_expiry() {
    let store = memory_store();
    let root = section_on(&store, "");

    root.set("x", json!("v"), Some(Duration::from_secs(10)))
        .await
        .unwrap();
    match root.get("x").unwrap().time_to_live().await.unwrap() {
        KeyTtl::Remaining(left) => {
            assert!(left <= Duration::from_secs(10));
            assert!(left > Duration::ZERO);
        }
        other => panic!("expected a remaining TTL, got {other:?}"),
    }

    root.set("forever", json!("v"), None).await.unwrap();
    assert_eq!(
        root.get("forever").unwrap().time_to_live().await.unwrap(),
        KeyTtl::NoExpiry
    );

    root.set("gone", json!("v"), Some(Duration::from_millis(40)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    let node = root.get("gone").unwrap();
    assert_eq!(node.value().await.unwrap(), None);
    assert!(!node.exists().await.unwrap());
    assert_eq!(node.time_to_live().await.unwrap(), KeyTtl::Missing);
}

#[tokio::test]
async fn expire_covers_the_whole_subtree() {
    let store = memory_store();
    let root = section_on(&store, "");

    root.set("a", json!({"x": 1, "y": {"z": 2}}), None)
        .await
        .unwrap();
    root.get("a").unwrap().expire(Duration::from_millis(40)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert!(!root.get("a").unwrap().exists().await.unwrap());
    assert_eq!(root.get("a.y.z").unwrap().value().await.unwrap(), None);
}

#[tokio::test]
async fn add_rejects_non_numbers() {
    let store = memory_store();
    let root = section_on(&store, "");

    root.set("s", json!("text"), None).await.unwrap();
    let result = root.get("s").unwrap().add(1).await;
    assert!(matches!(result, Err(Error::NotANumber { .. })));

    // Absent counts as zero.
    assert_eq!(root.get("n").unwrap().add(5).await.unwrap(), 5);
    assert_eq!(root.get("n").unwrap().add(-2).await.unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scoped_increments_do_not_lose_updates() {
    const WRITERS: usize = 2;
    const INCREMENTS: i64 = 50;

    init_tracing();
    let store = memory_store();
    let writers = (0..WRITERS).map(|_| {
        let section = section_on(&store, "counters");
        tokio::spawn(async move {
            for _ in 0..INCREMENTS {
                section
                    .with_lock(|locked| async move { locked.get("d")?.add(1).await })
                    .await
                    .unwrap();
            }
        })
    });
    for done in join_all(writers).await {
        done.unwrap();
    }

    let total = section_on(&store, "counters.d").value().await.unwrap();
    assert_eq!(total, Some(json!(WRITERS as i64 * INCREMENTS)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unscoped_increments_may_lose_updates() {
    const WRITERS: i64 = 2;
    const INCREMENTS: i64 = 200;

    let store = memory_store();
    let writers = (0..WRITERS).map(|_| {
        let counter = section_on(&store, "counters.d");
        tokio::spawn(async move {
            for _ in 0..INCREMENTS {
                counter.add(1).await.unwrap();
            }
        })
    });
    for done in join_all(writers).await {
        done.unwrap();
    }

    // Unprotected read-modify-write is a documented race: the final value
    // is bounded above by the ideal total but may fall short of it.
    let total = section_on(&store, "counters.d")
        .value()
        .await
        .unwrap()
        .and_then(|v| v.as_i64())
        .unwrap();
    assert!(total > 0);
    assert!(total <= WRITERS * INCREMENTS);
}

#[tokio::test]
async fn lock_failure_inside_scope_still_releases() {
    let store = memory_store();
    let section = section_on(&store, "jobs");

    let result: trellis::Result<()> = section
        .with_lock(|locked| async move {
            locked.set("state", json!("running"), None).await?;
            Err(Error::Internal("boom".to_string()))
        })
        .await;
    assert!(result.is_err());

    // The failing closure released the lock; a fresh zero-timeout
    // acquisition succeeds.
    let locked = section.lock_with(Duration::ZERO, Duration::from_secs(5)).await.unwrap();
    locked.release().await.unwrap();
}

#[tokio::test]
async fn locked_section_reads_and_writes_through() {
    let store = memory_store();
    let section = section_on(&store, "jobs.batch");

    let locked = section.lock().await.unwrap();
    locked.set("status", json!("running"), None).await.unwrap();
    assert_eq!(
        locked.get("status").unwrap().value().await.unwrap(),
        Some(json!("running"))
    );
    assert!(locked.is_locked().await.unwrap());
    locked.release().await.unwrap();
    assert!(!section.is_locked().await.unwrap());
}

#[tokio::test]
async fn logical_databases_are_isolated() {
    let pool = memory_pool_with_names(&[("jobs", 1), ("cache", 2)]);

    let jobs = Section::open(&pool, Some("jobs"), "shared.key").unwrap();
    let cache = Section::open(&pool, Some("cache"), "shared.key").unwrap();

    jobs.set("v", json!(1), None).await.unwrap();
    assert!(jobs.get("v").unwrap().exists().await.unwrap());
    assert!(!cache.get("v").unwrap().exists().await.unwrap());
}
