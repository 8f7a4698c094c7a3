//! Built-in statistics hook

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::hooks::{Hook, HookEvent, HookKind, Outcome};

/// Point-in-time view of a cache's counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
  pub op_count: u64,
  pub hit_count: u64,
  pub miss_count: u64,
  pub set_count: u64,
  pub eviction_count: u64,
  pub expired_count: u64,
  /// Alias of `op_count`
  pub request_count: u64,
  /// Wall-clock ms at which the hook was created
  pub creation_date: i64,
}

impl StatsSnapshot {
  pub fn hit_rate(&self) -> f64 {
    let total = self.hit_count + self.miss_count;
    if total == 0 {
      0.0
    } else {
      self.hit_count as f64 / total as f64
    }
  }
}

#[derive(Debug, Default)]
struct Counters {
  ops: AtomicU64,
  hits: AtomicU64,
  misses: AtomicU64,
  sets: AtomicU64,
  evictions: AtomicU64,
  expired: AtomicU64,
}

/// Post-hook folding action outcomes into counters
///
/// Installed automatically when `record_stats` is set. The counters are
/// mutated only on the hook's task; `stats` reads a snapshot.
pub struct StatsHook {
  counters: Arc<Counters>,
  creation_date: i64,
}

impl StatsHook {
  pub fn new() -> Self {
    Self {
      counters: Arc::new(Counters::default()),
      creation_date: Utc::now().timestamp_millis(),
    }
  }

  pub(crate) fn reader(&self) -> StatsReader {
    StatsReader {
      counters: self.counters.clone(),
      creation_date: self.creation_date,
    }
  }
}

impl Default for StatsHook {
  fn default() -> Self {
    Self::new()
  }
}

/// Read side handed to the worker for `stats` replies
#[derive(Clone)]
pub(crate) struct StatsReader {
  counters: Arc<Counters>,
  creation_date: i64,
}

impl StatsReader {
  pub fn snapshot(&self) -> StatsSnapshot {
    let ops = self.counters.ops.load(Ordering::Relaxed);
    StatsSnapshot {
      op_count: ops,
      hit_count: self.counters.hits.load(Ordering::Relaxed),
      miss_count: self.counters.misses.load(Ordering::Relaxed),
      set_count: self.counters.sets.load(Ordering::Relaxed),
      eviction_count: self.counters.evictions.load(Ordering::Relaxed),
      expired_count: self.counters.expired.load(Ordering::Relaxed),
      request_count: ops,
      creation_date: self.creation_date,
    }
  }
}

#[async_trait]
impl Hook for StatsHook {
  fn name(&self) -> &str {
    "stats"
  }

  fn kind(&self) -> HookKind {
    HookKind::Post
  }

  async fn handle(&self, event: &HookEvent) {
    let HookEvent::Post { outcome, .. } = event else {
      return;
    };

    let c = &self.counters;
    c.ops.fetch_add(1, Ordering::Relaxed);
    match *outcome {
      Outcome::Hit => {
        c.hits.fetch_add(1, Ordering::Relaxed);
      }
      Outcome::Miss { expired } | Outcome::Loaded { expired } => {
        c.misses.fetch_add(1, Ordering::Relaxed);
        if expired {
          c.expired.fetch_add(1, Ordering::Relaxed);
        }
      }
      Outcome::Written | Outcome::Counter(_) => {
        c.sets.fetch_add(1, Ordering::Relaxed);
      }
      Outcome::Removed { hit: true } => {
        c.evictions.fetch_add(1, Ordering::Relaxed);
      }
      Outcome::Cleared(n) => {
        c.evictions.fetch_add(n as u64, Ordering::Relaxed);
      }
      Outcome::Swept(n) => {
        c.expired.fetch_add(n as u64, Ordering::Relaxed);
      }
      _ => {}
    }
  }
}
