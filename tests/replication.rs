//! Replication and row-locking tests

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use drey::{
  Cache, CacheError, CacheOptions, Fetched, LocalPeer, ManualClock, Mutation, PeerError, PeerLink,
  Value,
};

struct FlakyPeer;

#[async_trait]
impl PeerLink for FlakyPeer {
  fn node(&self) -> &str {
    "flaky"
  }

  async fn apply(&self, _mutation: Mutation) -> Result<(), PeerError> {
    Err(PeerError("injected failure".to_string()))
  }

  async fn lock(&self, _keys: &[String]) -> Result<(), PeerError> {
    Ok(())
  }

  async fn unlock(&self, _keys: &[String]) {}
}

fn pair(origin_name: &str, replica_name: &str) -> (Cache, Cache) {
  let replica = Cache::start(CacheOptions::new(replica_name)).unwrap();
  let origin = Cache::start(
    CacheOptions::new(origin_name).peer(Arc::new(LocalPeer::new(replica_name, replica.clone()))),
  )
  .unwrap();
  (origin, replica)
}

// =============================================================================
// Broadcast Tests
// =============================================================================

#[tokio::test]
async fn test_writes_replicate_to_peer() {
  let (origin, replica) = pair("r_origin", "r_replica");

  origin.set("k", "v", None).await.unwrap();
  assert_eq!(
    replica.get("k").await.unwrap(),
    Fetched::Hit(Value::from("v"))
  );

  origin.del("k").await.unwrap();
  assert_eq!(replica.get("k").await.unwrap(), Fetched::Missing);

  origin.stop();
  replica.stop();
}

#[tokio::test]
async fn test_counters_replicate() {
  let (origin, replica) = pair("r_incr_origin", "r_incr_replica");

  assert_eq!(origin.incr("n", 5, 0).await.unwrap(), 5);
  assert_eq!(origin.incr("n", 1, 0).await.unwrap(), 6);
  assert_eq!(
    replica.get("n").await.unwrap(),
    Fetched::Hit(Value::Integer(6))
  );

  origin.stop();
  replica.stop();
}

#[tokio::test]
async fn test_take_and_clear_replicate() {
  let (origin, replica) = pair("r_take_origin", "r_take_replica");

  origin.set("a", 1i64, None).await.unwrap();
  origin.set("b", 2i64, None).await.unwrap();

  assert_eq!(origin.take("a").await.unwrap(), Some(Value::Integer(1)));
  assert_eq!(replica.get("a").await.unwrap(), Fetched::Missing);

  assert_eq!(origin.clear().await.unwrap(), 1);
  assert_eq!(replica.size().await.unwrap(), 0);

  origin.stop();
  replica.stop();
}

#[tokio::test]
async fn test_partial_failure_keeps_survivors() {
  let replica = Cache::start(CacheOptions::new("r_partial_replica")).unwrap();
  let origin = Cache::start(
    CacheOptions::new("r_partial_origin")
      .peer(Arc::new(LocalPeer::new("good", replica.clone())))
      .peer(Arc::new(FlakyPeer)),
  )
  .unwrap();

  // the failed node is reported; nothing is rolled back
  let result = origin.set("k", "v", None).await;
  assert_eq!(
    result,
    Err(CacheError::ReplicationFailed(vec!["flaky".to_string()]))
  );
  assert_eq!(
    origin.get("k").await.unwrap(),
    Fetched::Hit(Value::from("v"))
  );
  assert_eq!(
    replica.get("k").await.unwrap(),
    Fetched::Hit(Value::from("v"))
  );

  origin.stop();
  replica.stop();
}

#[tokio::test]
async fn test_apply_replicated_does_not_rebroadcast() {
  let (origin, replica) = pair("r_direct_origin", "r_direct_replica");

  // hand the replica a mutation the way a transport would
  replica
    .apply_replicated(Mutation::Set {
      key: "remote".to_string(),
      value: Value::from("v"),
      ttl: None,
    })
    .await
    .unwrap();

  assert_eq!(
    replica.get("remote").await.unwrap(),
    Fetched::Hit(Value::from("v"))
  );
  // the origin never saw it: replicated applies stay local
  assert_eq!(origin.get("remote").await.unwrap(), Fetched::Missing);

  origin.stop();
  replica.stop();
}

// =============================================================================
// Janitor in Remote Mode
// =============================================================================

#[tokio::test]
async fn test_remote_janitor_sweeps_every_node() {
  let clock_a = Arc::new(ManualClock::new());
  let clock_b = Arc::new(ManualClock::new());

  let replica =
    Cache::start(CacheOptions::new("r_janitor_replica").clock(clock_b.clone())).unwrap();
  let origin = Cache::start(
    CacheOptions::new("r_janitor_origin")
      .peer(Arc::new(LocalPeer::new("b", replica.clone())))
      .ttl_interval(25)
      .clock(clock_a.clone()),
  )
  .unwrap();

  origin.set("k", "v", Some(50)).await.unwrap();
  assert_eq!(replica.size().await.unwrap(), 1);

  clock_a.advance(100);
  clock_b.advance(100);
  tokio::time::sleep(Duration::from_millis(120)).await;

  // the sweep went through the worker, so the peer was swept too
  assert_eq!(origin.size().await.unwrap(), 0);
  assert_eq!(replica.size().await.unwrap(), 0);

  origin.stop();
  replica.stop();
}

// =============================================================================
// Transactional Mode Tests
// =============================================================================

#[tokio::test]
async fn test_transactional_write_waits_for_peer_locks() {
  let replica = Cache::start(CacheOptions::new("r_txn_replica")).unwrap();
  let origin = Cache::start(
    CacheOptions::new("r_txn_origin")
      .peer(Arc::new(LocalPeer::new("b", replica.clone())))
      .transactional(true)
      .call_timeout(1000),
  )
  .unwrap();

  let keys = vec!["k".to_string()];
  replica.lock_table().lock(&keys).await;

  // release the contended row shortly; the write should block until then
  {
    let replica = replica.clone();
    let keys = keys.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      replica.lock_table().unlock(&keys);
    });
  }

  let started = std::time::Instant::now();
  origin.set("k", "v", None).await.unwrap();
  assert!(started.elapsed() >= Duration::from_millis(90));

  assert_eq!(
    replica.get("k").await.unwrap(),
    Fetched::Hit(Value::from("v"))
  );

  // every row lock was released on the way out
  assert!(!origin.lock_table().is_locked("k"));
  assert!(!replica.lock_table().is_locked("k"));

  origin.stop();
  replica.stop();
}

#[tokio::test]
async fn test_transactional_locks_released_after_each_write() {
  let replica = Cache::start(CacheOptions::new("r_txn2_replica")).unwrap();
  let origin = Cache::start(
    CacheOptions::new("r_txn2_origin")
      .peer(Arc::new(LocalPeer::new("b", replica.clone())))
      .transactional(true),
  )
  .unwrap();

  origin.set("a", 1i64, None).await.unwrap();
  origin.incr("a", 1, 0).await.unwrap();
  origin.del("a").await.unwrap();

  assert!(!origin.lock_table().is_locked("a"));
  assert!(!replica.lock_table().is_locked("a"));

  origin.stop();
  replica.stop();
}
