//! Hook events and the dispatch pipeline

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::supervise;

/// Whether a hook observes actions before or after execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
  Pre,
  Post,
}

/// Descriptor of an API action entering the worker
#[derive(Debug, Clone)]
pub struct Action {
  pub name: &'static str,
  pub key: Option<String>,
}

impl Action {
  pub fn new(name: &'static str) -> Self {
    Self { name, key: None }
  }

  pub fn for_key(name: &'static str, key: impl Into<String>) -> Self {
    Self {
      name,
      key: Some(key.into()),
    }
  }
}

/// What an executed action did, as observed by post-hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  Hit,
  Miss { expired: bool },
  Loaded { expired: bool },
  Written,
  Removed { hit: bool },
  Cleared(usize),
  Swept(usize),
  Counter(i64),
  TtlChanged(bool),
  Info,
  Error,
}

/// Event delivered to hooks
#[derive(Debug, Clone)]
pub enum HookEvent {
  /// Dispatched before the worker executes the action
  Pre { action: Action },
  /// Dispatched after the worker has produced a result
  Post { action: Action, outcome: Outcome },
}

impl HookEvent {
  pub fn kind(&self) -> HookKind {
    match self {
      HookEvent::Pre { .. } => HookKind::Pre,
      HookEvent::Post { .. } => HookKind::Post,
    }
  }

  pub fn action(&self) -> &Action {
    match self {
      HookEvent::Pre { action } => action,
      HookEvent::Post { action, .. } => action,
    }
  }
}

/// Observer registered on a cache instance
///
/// Hooks are observational: they cannot modify the request or the result,
/// and the worker never waits for them.
#[async_trait]
pub trait Hook: Send + Sync {
  fn name(&self) -> &str;
  fn kind(&self) -> HookKind;
  async fn handle(&self, event: &HookEvent);
}

/// Fans events out to per-hook tasks without blocking the worker
///
/// Delivery is best-effort over a bounded buffer: a hook task that lags
/// behind loses the oldest buffered events, and the loss is counted.
#[derive(Clone)]
pub(crate) struct HookDispatcher {
  tx: broadcast::Sender<HookEvent>,
  dropped: Arc<AtomicU64>,
}

impl HookDispatcher {
  pub fn new(buffer: usize) -> Self {
    let (tx, _) = broadcast::channel(buffer);
    Self {
      tx,
      dropped: Arc::new(AtomicU64::new(0)),
    }
  }

  /// Spawn the delivery task for one hook; the task is respawned on panic
  pub fn attach(&self, hook: Arc<dyn Hook>) -> JoinHandle<()> {
    let tx = self.tx.clone();
    let dropped = self.dropped.clone();
    supervise::spawn_supervised(format!("hook '{}'", hook.name()), move || {
      let mut rx = tx.subscribe();
      let hook = hook.clone();
      let dropped = dropped.clone();
      async move {
        loop {
          match rx.recv().await {
            Ok(event) => {
              if event.kind() == hook.kind() {
                hook.handle(&event).await;
              }
            }
            Err(RecvError::Lagged(n)) => {
              dropped.fetch_add(n, Ordering::Relaxed);
            }
            Err(RecvError::Closed) => break,
          }
        }
      }
    })
  }

  pub fn pre(&self, action: Action) {
    let _ = self.tx.send(HookEvent::Pre { action });
  }

  pub fn post(&self, action: Action, outcome: Outcome) {
    let _ = self.tx.send(HookEvent::Post { action, outcome });
  }

  /// Events lost to lagging hook tasks
  #[allow(dead_code)]
  pub fn dropped(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }
}
