//! Hook pipeline tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use drey::{Cache, CacheOptions, Fetched, Hook, HookEvent, HookKind, ManualClock, Outcome, Value};

struct Recorder {
  kind: HookKind,
  seen: Mutex<Vec<(String, Option<Outcome>)>>,
}

impl Recorder {
  fn new(kind: HookKind) -> Arc<Self> {
    Arc::new(Self {
      kind,
      seen: Mutex::new(Vec::new()),
    })
  }

  fn names(&self) -> Vec<String> {
    self.seen.lock().iter().map(|(name, _)| name.clone()).collect()
  }
}

#[async_trait]
impl Hook for Recorder {
  fn name(&self) -> &str {
    "recorder"
  }

  fn kind(&self) -> HookKind {
    self.kind
  }

  async fn handle(&self, event: &HookEvent) {
    match event {
      HookEvent::Pre { action } => {
        self.seen.lock().push((action.name.to_string(), None));
      }
      HookEvent::Post { action, outcome } => {
        self.seen.lock().push((action.name.to_string(), Some(*outcome)));
      }
    }
  }
}

struct Exploding;

#[async_trait]
impl Hook for Exploding {
  fn name(&self) -> &str {
    "exploding"
  }

  fn kind(&self) -> HookKind {
    HookKind::Post
  }

  async fn handle(&self, _event: &HookEvent) {
    panic!("hook exploded");
  }
}

#[tokio::test]
async fn test_pre_hooks_observe_incoming_actions() {
  let recorder = Recorder::new(HookKind::Pre);
  let cache = Cache::start(CacheOptions::new("h_pre").hook(recorder.clone())).unwrap();

  cache.set("k", "v", None).await.unwrap();
  let _ = cache.get("k").await.unwrap();
  cache.del("k").await.unwrap();

  tokio::time::sleep(Duration::from_millis(100)).await;
  assert_eq!(
    recorder.names(),
    vec!["set".to_string(), "get".to_string(), "del".to_string()]
  );
  // pre-hooks never see a result
  assert!(recorder.seen.lock().iter().all(|(_, outcome)| outcome.is_none()));

  cache.stop();
}

#[tokio::test]
async fn test_post_hooks_observe_outcomes_in_worker_order() {
  let recorder = Recorder::new(HookKind::Post);
  let cache = Cache::start(CacheOptions::new("h_post").hook(recorder.clone())).unwrap();

  cache.set("k", "v", None).await.unwrap();
  let _ = cache.get("k").await.unwrap();
  let _ = cache.get("absent").await.unwrap();
  cache.del("k").await.unwrap();

  tokio::time::sleep(Duration::from_millis(100)).await;
  let seen = recorder.seen.lock().clone();
  assert_eq!(
    seen,
    vec![
      ("set".to_string(), Some(Outcome::Written)),
      ("get".to_string(), Some(Outcome::Hit)),
      ("get".to_string(), Some(Outcome::Miss { expired: false })),
      ("del".to_string(), Some(Outcome::Removed { hit: true })),
    ]
  );

  cache.stop();
}

#[tokio::test]
async fn test_hook_crash_does_not_fail_actions() {
  let cache = Cache::start(CacheOptions::new("h_crash").hook(Arc::new(Exploding))).unwrap();

  // the hook panics on every event; clients never notice
  cache.set("k", "v", None).await.unwrap();
  assert_eq!(cache.get("k").await.unwrap(), Fetched::Hit(Value::from("v")));
  cache.del("k").await.unwrap();

  cache.stop();
}

#[tokio::test]
async fn test_janitor_emits_purge_events() {
  let clock = Arc::new(ManualClock::new());
  let recorder = Recorder::new(HookKind::Post);
  let cache = Cache::start(
    CacheOptions::new("h_janitor")
      .hook(recorder.clone())
      .ttl_interval(25)
      .clock(clock.clone()),
  )
  .unwrap();

  cache.set("k", "v", Some(50)).await.unwrap();
  clock.advance(100);
  tokio::time::sleep(Duration::from_millis(120)).await;

  let swept: Vec<Outcome> = recorder
    .seen
    .lock()
    .iter()
    .filter(|(name, _)| name == "purge")
    .filter_map(|(_, outcome)| *outcome)
    .collect();
  assert!(
    swept.contains(&Outcome::Swept(1)),
    "janitor should report the eviction: {:?}",
    swept
  );

  cache.stop();
}
