//! Concurrent access tests for `MemoryBackend` conditional writes.
//!
//! Both the replay guard and the concurrency controller depend on these
//! guarantees: exactly one insert-if-absent wins per key, and exactly one
//! update-if-unchanged wins per observed value.

#![allow(clippy::expect_used, clippy::panic)]

use bytes::Bytes;
use corpdir_storage::{
    MemoryBackend, StorageBackend, assert_conflict,
    error::StorageError,
    testutil::{is_conflict, make_key, make_tagged_value, populated_backend},
};
use tokio::task::JoinSet;

/// Number of concurrent tasks per round.
const CONCURRENCY: usize = 16;

/// Number of CAS rounds for the exactly-one-winner tests.
const CAS_ROUNDS: usize = 50;

// ---------------------------------------------------------------------------
// Test: insert-if-absent, exactly one winner per key
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn insert_if_absent_has_exactly_one_winner() {
    let backend = MemoryBackend::new();

    for round in 0..CAS_ROUNDS {
        let key = make_key("nonce", round);
        let mut set = JoinSet::new();

        for task_id in 0..CONCURRENCY {
            let backend = backend.clone();
            let key = key.clone();
            set.spawn(async move {
                let result =
                    backend.compare_and_set(&key, None, make_tagged_value(task_id, round)).await;
                (task_id, result)
            });
        }

        let mut winners = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (task_id, result) = joined.expect("task should not panic");
            match result {
                Ok(()) => winners.push(task_id),
                Err(StorageError::Conflict) => {},
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(winners.len(), 1, "round {round}: exactly one insert must win");
        let stored = backend.get(&key).await.expect("get").expect("key present");
        assert_eq!(stored, Bytes::from(make_tagged_value(winners[0], round)));
    }
}

// ---------------------------------------------------------------------------
// Test: update-if-unchanged, exactly one winner per observed value
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn update_if_unchanged_has_exactly_one_winner() {
    let backend = MemoryBackend::new();
    let key = b"contact:1".to_vec();
    backend.set(key.clone(), b"initial".to_vec()).await.expect("seed");

    for round in 0..CAS_ROUNDS {
        let observed = backend.get(&key).await.expect("get").expect("present");
        let mut set = JoinSet::new();

        for task_id in 0..CONCURRENCY {
            let backend = backend.clone();
            let key = key.clone();
            let observed = observed.clone();
            set.spawn(async move {
                let result = backend
                    .compare_and_set(&key, Some(observed.as_ref()), make_tagged_value(task_id, round))
                    .await;
                assert!(result.is_ok() || is_conflict(&result), "unexpected error: {result:?}");
                result.is_ok()
            });
        }

        let mut wins = 0;
        while let Some(joined) = set.join_next().await {
            if joined.expect("task should not panic") {
                wins += 1;
            }
        }
        assert_eq!(wins, 1, "round {round}: exactly one update must win");
    }
}

// ---------------------------------------------------------------------------
// Test: compare-and-delete racing compare-and-set
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_and_replace_never_both_win() {
    let backend = MemoryBackend::new();

    for round in 0..CAS_ROUNDS {
        let key = make_key("record", round);
        backend.set(key.clone(), b"old".to_vec()).await.expect("seed");

        let deleter = {
            let backend = backend.clone();
            let key = key.clone();
            tokio::spawn(async move { backend.compare_and_delete(&key, b"old").await.is_ok() })
        };
        let replacer = {
            let backend = backend.clone();
            let key = key.clone();
            tokio::spawn(async move {
                backend.compare_and_set(&key, Some(b"old".as_slice()), b"new".to_vec()).await.is_ok()
            })
        };

        let deleted = deleter.await.expect("deleter");
        let replaced = replacer.await.expect("replacer");
        assert!(deleted ^ replaced, "round {round}: exactly one of delete/replace must win");

        let stored = backend.get(&key).await.expect("get");
        if replaced {
            assert_eq!(stored, Some(Bytes::from("new")));
        } else {
            assert_eq!(stored, None);
        }
    }
}

// ---------------------------------------------------------------------------
// Test: conditional writes on one key leave neighbours untouched
// ---------------------------------------------------------------------------

#[tokio::test]
async fn conflicts_do_not_touch_other_keys() {
    let backend = populated_backend("contact", 8).await;
    let target = make_key("contact", 3);

    assert_conflict!(backend.compare_and_set(&target, None, b"dup".to_vec()).await);
    assert_conflict!(
        backend.compare_and_set(&target, Some(b"stale".as_slice()), b"x".to_vec()).await,
        "stale expected value"
    );
    assert_conflict!(backend.compare_and_delete(&target, b"stale").await);

    let all = backend.get_range(make_key("contact", 0)..).await.expect("range");
    assert_eq!(all.len(), 8);
    for (i, kv) in all.iter().enumerate() {
        assert_eq!(kv.key, Bytes::from(make_key("contact", i)));
        assert_eq!(kv.value, Bytes::from(make_tagged_value(0, i)));
    }
}
