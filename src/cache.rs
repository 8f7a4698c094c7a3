//! Public cache handle and instance lifecycle

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{CacheError, CacheResult};
use crate::hooks::HookDispatcher;
use crate::janitor::{self, Janitor};
use crate::options::{CacheOptions, FallbackFn};
use crate::registry;
use crate::replica::{LockTable, Mutation, Replicator};
use crate::stats::{StatsHook, StatsSnapshot};
use crate::store::{MemoryStore, Store};
use crate::supervise;
use crate::value::Value;
use crate::worker::{self, Applied, Command, Fetched, TtlStatus, UpdateFn, WorkerCtx};

struct CacheInner {
  name: String,
  tx: mpsc::Sender<Command>,
  locks: Arc<LockTable>,
  call_timeout: Duration,
  tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Clonable handle to a running cache instance
///
/// All methods route through the instance's worker, so the order in which
/// mutations are accepted is the order every later read observes.
#[derive(Clone)]
pub struct Cache {
  inner: Arc<CacheInner>,
}

impl Cache {
  /// Start a named instance: validate options, claim the name, and spawn
  /// the worker, hook, and janitor tasks (each restarted one-for-one on
  /// panic).
  pub fn start(options: CacheOptions) -> CacheResult<Cache> {
    options.validate()?;

    let store: Arc<dyn Store> = options
      .store
      .clone()
      .unwrap_or_else(|| Arc::new(MemoryStore::new()));
    let clock = options.clock.clone();
    let hooks = HookDispatcher::new(options.hook_buffer);
    let locks = Arc::new(LockTable::new());

    let mut tasks = Vec::new();
    for hook in &options.hooks {
      tasks.push(hooks.attach(hook.clone()));
    }
    let mut stats = None;
    if options.record_stats {
      let stats_hook = Arc::new(StatsHook::new());
      stats = Some(stats_hook.reader());
      tasks.push(hooks.attach(stats_hook));
    }

    let replicator = if options.remote() {
      Some(Replicator::new(options.peers.clone(), options.call_timeout))
    } else {
      None
    };

    let (tx, rx) = mpsc::channel(options.queue_depth);
    let ctx = Arc::new(WorkerCtx {
      store: store.clone(),
      clock: clock.clone(),
      hooks: hooks.clone(),
      default_ttl: options.default_ttl,
      default_fallback: options.default_fallback.clone(),
      fallback_args: options.fallback_args.clone(),
      stats,
      replicator,
      locks: locks.clone(),
      transactional: options.transactional,
      lock_timeout: Duration::from_millis(options.call_timeout),
    });

    let inbox = Arc::new(tokio::sync::Mutex::new(rx));
    {
      let ctx = ctx.clone();
      let inbox = inbox.clone();
      tasks.push(supervise::spawn_supervised(
        format!("worker '{}'", options.name),
        move || worker::run(ctx.clone(), inbox.clone()),
      ));
    }

    if let Some(every) = options.ttl_interval {
      tasks.push(janitor::start(Janitor {
        store,
        clock,
        hooks,
        every,
        worker: options.remote().then(|| tx.clone()),
      }));
    }

    let cache = Cache {
      inner: Arc::new(CacheInner {
        name: options.name.clone(),
        tx,
        locks,
        call_timeout: Duration::from_millis(options.call_timeout),
        tasks: parking_lot::Mutex::new(tasks),
      }),
    };

    if let Err(e) = registry::register(cache.clone()) {
      cache.abort_tasks();
      return Err(e);
    }
    tracing::info!("cache '{}' started", options.name);
    Ok(cache)
  }

  /// Find a running instance by name
  pub fn lookup(name: &str) -> Option<Cache> {
    registry::lookup(name)
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  /// Stop the instance: the name is released and all tasks are aborted.
  /// Pending and later synchronous callers observe `CacheError::Stopped`.
  pub fn stop(&self) {
    registry::deregister(&self.inner.name);
    self.abort_tasks();
    tracing::info!("cache '{}' stopped", self.inner.name);
  }

  fn abort_tasks(&self) {
    for task in self.inner.tasks.lock().drain(..) {
      task.abort();
    }
  }

  // == Reads ==

  /// Read a key; on miss the configured default fallback loads the value
  pub async fn get(&self, key: &str) -> CacheResult<Fetched> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Command::Get {
          key: key.to_string(),
          fallback: None,
          reply,
        },
        rx,
      )
      .await
  }

  /// Read a key with an explicit fallback for this call
  pub async fn fetch(&self, key: &str, fallback: FallbackFn) -> CacheResult<Fetched> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Command::Get {
          key: key.to_string(),
          fallback: Some(fallback),
          reply,
        },
        rx,
      )
      .await
  }

  /// Read a key (fallback respected), apply `apply` to the value, and write
  /// the result back without refreshing the TTL
  pub async fn get_and_update(&self, key: &str, apply: UpdateFn) -> CacheResult<Applied> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Command::GetAndUpdate {
          key: key.to_string(),
          apply,
          fallback: None,
          reply,
        },
        rx,
      )
      .await
  }

  /// `get_and_update` with an explicit fallback for this call
  pub async fn fetch_and_update(
    &self,
    key: &str,
    apply: UpdateFn,
    fallback: FallbackFn,
  ) -> CacheResult<Applied> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Command::GetAndUpdate {
          key: key.to_string(),
          apply,
          fallback: Some(fallback),
          reply,
        },
        rx,
      )
      .await
  }

  /// Remaining lifetime of a key
  pub async fn ttl(&self, key: &str) -> CacheResult<TtlStatus> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Command::Ttl {
          key: key.to_string(),
          reply,
        },
        rx,
      )
      .await
  }

  /// Record count, logically expired records included
  pub async fn size(&self) -> CacheResult<usize> {
    let (reply, rx) = oneshot::channel();
    self.call(Command::Size { reply }, rx).await
  }

  /// Record count after filtering logically expired records
  pub async fn count(&self) -> CacheResult<usize> {
    let (reply, rx) = oneshot::channel();
    self.call(Command::Count { reply }, rx).await
  }

  /// Unordered keys, logically expired records included
  pub async fn keys(&self) -> CacheResult<Vec<String>> {
    let (reply, rx) = oneshot::channel();
    self.call(Command::Keys { reply }, rx).await
  }

  /// True iff the key exists and is not logically expired
  pub async fn exists(&self, key: &str) -> CacheResult<bool> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Command::Exists {
          key: key.to_string(),
          reply,
        },
        rx,
      )
      .await
  }

  pub async fn is_empty(&self) -> CacheResult<bool> {
    Ok(self.size().await? == 0)
  }

  /// Counters from the stats hook; an error when `record_stats` is off
  pub async fn stats(&self) -> CacheResult<StatsSnapshot> {
    let (reply, rx) = oneshot::channel();
    self.call(Command::Stats { reply }, rx).await
  }

  // == Mutations ==

  /// Write a value; `ttl` falls back to the instance default
  pub async fn set(&self, key: &str, value: impl Into<Value>, ttl: Option<u64>) -> CacheResult<bool> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Command::Set {
          key: key.to_string(),
          value: value.into(),
          ttl,
          reply: Some(reply),
        },
        rx,
      )
      .await
  }

  /// Overwrite the value only; `touched` and `ttl` stay. False on miss.
  pub async fn update(&self, key: &str, value: impl Into<Value>) -> CacheResult<bool> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Command::Update {
          key: key.to_string(),
          value: value.into(),
          reply: Some(reply),
        },
        rx,
      )
      .await
  }

  /// Remove a key; true either way, the guarantee is absence
  pub async fn del(&self, key: &str) -> CacheResult<bool> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Command::Del {
          key: key.to_string(),
          reply: Some(reply),
        },
        rx,
      )
      .await
  }

  /// Remove every record; returns the removal count
  pub async fn clear(&self) -> CacheResult<usize> {
    let (reply, rx) = oneshot::channel();
    self.call(Command::Clear { reply: Some(reply) }, rx).await
  }

  /// Read and atomically remove a key
  pub async fn take(&self, key: &str) -> CacheResult<Option<Value>> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Command::Take {
          key: key.to_string(),
          reply: Some(reply),
        },
        rx,
      )
      .await
  }

  /// Add `amount` to the integer at `key`, initialising a missing key to
  /// `initial` first. A hit keeps its `touched`/`ttl`.
  pub async fn incr(&self, key: &str, amount: i64, initial: i64) -> CacheResult<i64> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Command::Incr {
          key: key.to_string(),
          amount,
          initial,
          reply: Some(reply),
        },
        rx,
      )
      .await
  }

  pub async fn decr(&self, key: &str, amount: i64, initial: i64) -> CacheResult<i64> {
    self.incr(key, -amount, initial).await
  }

  /// Restart the TTL window at `ttl` ms from now; non-positive evicts
  pub async fn expire(&self, key: &str, ttl: i64) -> CacheResult<bool> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Command::Expire {
          key: key.to_string(),
          ttl,
          reply: Some(reply),
        },
        rx,
      )
      .await
  }

  /// Expire at an absolute cache-clock timestamp; a past or present
  /// timestamp evicts immediately
  pub async fn expire_at(&self, key: &str, at: u64) -> CacheResult<bool> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Command::ExpireAt {
          key: key.to_string(),
          at,
          reply: Some(reply),
        },
        rx,
      )
      .await
  }

  /// Clear the TTL so the key never expires
  pub async fn persist(&self, key: &str) -> CacheResult<bool> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Command::Persist {
          key: key.to_string(),
          reply: Some(reply),
        },
        rx,
      )
      .await
  }

  /// Reset `touched` to now, keeping the TTL
  pub async fn refresh(&self, key: &str) -> CacheResult<bool> {
    let (reply, rx) = oneshot::channel();
    self
      .call(
        Command::Refresh {
          key: key.to_string(),
          reply: Some(reply),
        },
        rx,
      )
      .await
  }

  /// Synchronously sweep all logically expired records
  pub async fn purge(&self) -> CacheResult<usize> {
    let (reply, rx) = oneshot::channel();
    self.call(Command::Purge { reply: Some(reply) }, rx).await
  }

  // == Fire-and-forget variants ==
  //
  // Enqueue the mutation and return `Ok(true)` immediately; the effect is
  // eventually observed in queue order. No result travels back, so `clear`
  // and friends lose their counts on this path.

  pub async fn set_async(
    &self,
    key: &str,
    value: impl Into<Value>,
    ttl: Option<u64>,
  ) -> CacheResult<bool> {
    self
      .cast(Command::Set {
        key: key.to_string(),
        value: value.into(),
        ttl,
        reply: None,
      })
      .await
  }

  pub async fn update_async(&self, key: &str, value: impl Into<Value>) -> CacheResult<bool> {
    self
      .cast(Command::Update {
        key: key.to_string(),
        value: value.into(),
        reply: None,
      })
      .await
  }

  pub async fn del_async(&self, key: &str) -> CacheResult<bool> {
    self
      .cast(Command::Del {
        key: key.to_string(),
        reply: None,
      })
      .await
  }

  pub async fn clear_async(&self) -> CacheResult<bool> {
    self.cast(Command::Clear { reply: None }).await
  }

  pub async fn take_async(&self, key: &str) -> CacheResult<bool> {
    self
      .cast(Command::Take {
        key: key.to_string(),
        reply: None,
      })
      .await
  }

  pub async fn incr_async(&self, key: &str, amount: i64, initial: i64) -> CacheResult<bool> {
    self
      .cast(Command::Incr {
        key: key.to_string(),
        amount,
        initial,
        reply: None,
      })
      .await
  }

  pub async fn decr_async(&self, key: &str, amount: i64, initial: i64) -> CacheResult<bool> {
    self.incr_async(key, -amount, initial).await
  }

  pub async fn expire_async(&self, key: &str, ttl: i64) -> CacheResult<bool> {
    self
      .cast(Command::Expire {
        key: key.to_string(),
        ttl,
        reply: None,
      })
      .await
  }

  pub async fn expire_at_async(&self, key: &str, at: u64) -> CacheResult<bool> {
    self
      .cast(Command::ExpireAt {
        key: key.to_string(),
        at,
        reply: None,
      })
      .await
  }

  pub async fn persist_async(&self, key: &str) -> CacheResult<bool> {
    self
      .cast(Command::Persist {
        key: key.to_string(),
        reply: None,
      })
      .await
  }

  pub async fn refresh_async(&self, key: &str) -> CacheResult<bool> {
    self
      .cast(Command::Refresh {
        key: key.to_string(),
        reply: None,
      })
      .await
  }

  pub async fn purge_async(&self) -> CacheResult<bool> {
    self.cast(Command::Purge { reply: None }).await
  }

  // == Replication surface ==

  /// Apply a mutation arriving from a peer node, without re-broadcast.
  /// Transports deliver into this from their receive side.
  pub async fn apply_replicated(&self, mutation: Mutation) -> CacheResult<()> {
    let (reply, rx) = oneshot::channel();
    self.call(Command::Replicated { mutation, reply }, rx).await
  }

  /// Row-lock table used by replication transports
  pub fn lock_table(&self) -> Arc<LockTable> {
    self.inner.locks.clone()
  }

  // == Plumbing ==

  async fn call<T>(
    &self,
    command: Command,
    reply: oneshot::Receiver<CacheResult<T>>,
  ) -> CacheResult<T> {
    if self.inner.tx.send(command).await.is_err() {
      return Err(CacheError::Stopped);
    }
    match tokio::time::timeout(self.inner.call_timeout, reply).await {
      Ok(Ok(result)) => result,
      Ok(Err(_)) => Err(CacheError::Stopped),
      Err(_) => Err(CacheError::Timeout),
    }
  }

  async fn cast(&self, command: Command) -> CacheResult<bool> {
    if self.inner.tx.send(command).await.is_err() {
      return Err(CacheError::Stopped);
    }
    Ok(true)
  }
}
