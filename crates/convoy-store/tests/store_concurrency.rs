#![allow(clippy::unwrap_used, clippy::expect_used)]

use convoy_store::{MemoryStore, Store};
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_zpopmin_hands_out_each_member_once() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..200 {
        store.zadd("jobs", &format!("job-{i}"), i as f64).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some((member, _)) = store.zpopmin("jobs").await.unwrap() {
                mine.push(member);
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for member in handle.await.unwrap() {
            assert!(seen.insert(member), "member popped twice");
        }
    }
    assert_eq!(seen.len(), 200);
    assert_eq!(store.zcard("jobs").await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_incr_loses_no_updates() {
    let store = Arc::new(MemoryStore::new());
    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                store.incr("seq", 1).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(store.incr("seq", 0).await.unwrap(), 500);
}

#[tokio::test]
async fn delete_clears_any_kind_of_key() {
    let store = MemoryStore::new();
    store.sadd("s", "a").await.unwrap();
    store.zadd("z", "a", 1.0).await.unwrap();
    assert!(store.delete("s").await.unwrap());
    assert!(store.delete("z").await.unwrap());
    assert!(!store.delete("missing").await.unwrap());
    assert_eq!(store.scard("s").await.unwrap(), 0);
}
