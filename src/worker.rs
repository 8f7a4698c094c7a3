//! The serialising worker that owns one cache instance
//!
//! Every public API routes through here as a `Command`; the worker drains
//! its inbox in FIFO order, so the sequence of accepted mutations forms a
//! total order observed by all later reads and hooks.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::clock::Clock;
use crate::error::{CacheError, CacheResult};
use crate::hooks::{Action, HookDispatcher, Outcome};
use crate::janitor;
use crate::options::FallbackFn;
use crate::record::Record;
use crate::replica::{LockTable, Mutation, Replicator};
use crate::stats::{StatsReader, StatsSnapshot};
use crate::store::Store;
use crate::value::Value;

/// Closure applied by `get_and_update`; receives the prior value, if any
pub type UpdateFn = Arc<dyn Fn(Option<&Value>) -> Value + Send + Sync>;

/// How a read obtained its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
  Hit,
  Loaded,
  Missing,
}

/// Result of a read
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
  /// Value present and live
  Hit(Value),
  /// Value produced by a fallback and written back
  Loaded(Value),
  /// No value and no fallback configured
  Missing,
}

impl Fetched {
  pub fn origin(&self) -> Origin {
    match self {
      Fetched::Hit(_) => Origin::Hit,
      Fetched::Loaded(_) => Origin::Loaded,
      Fetched::Missing => Origin::Missing,
    }
  }

  pub fn into_value(self) -> Option<Value> {
    match self {
      Fetched::Hit(value) | Fetched::Loaded(value) => Some(value),
      Fetched::Missing => None,
    }
  }
}

/// Result of `get_and_update`
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
  /// How the prior value was obtained
  pub origin: Origin,
  pub value: Value,
}

/// Remaining lifetime of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
  Remaining(u64),
  /// The record exists but carries no TTL
  Unset,
  Missing,
}

type Reply<T> = oneshot::Sender<CacheResult<T>>;

/// A request entering the worker queue
///
/// Mutations carry `Option<Reply>`: `None` is the fire-and-forget path.
pub(crate) enum Command {
  Get {
    key: String,
    fallback: Option<FallbackFn>,
    reply: Reply<Fetched>,
  },
  GetAndUpdate {
    key: String,
    apply: UpdateFn,
    fallback: Option<FallbackFn>,
    reply: Reply<Applied>,
  },
  Set {
    key: String,
    value: Value,
    ttl: Option<u64>,
    reply: Option<Reply<bool>>,
  },
  Update {
    key: String,
    value: Value,
    reply: Option<Reply<bool>>,
  },
  Del {
    key: String,
    reply: Option<Reply<bool>>,
  },
  Clear {
    reply: Option<Reply<usize>>,
  },
  Take {
    key: String,
    reply: Option<Reply<Option<Value>>>,
  },
  Incr {
    key: String,
    amount: i64,
    initial: i64,
    reply: Option<Reply<i64>>,
  },
  Expire {
    key: String,
    ttl: i64,
    reply: Option<Reply<bool>>,
  },
  ExpireAt {
    key: String,
    at: u64,
    reply: Option<Reply<bool>>,
  },
  Persist {
    key: String,
    reply: Option<Reply<bool>>,
  },
  Refresh {
    key: String,
    reply: Option<Reply<bool>>,
  },
  Ttl {
    key: String,
    reply: Reply<TtlStatus>,
  },
  Size {
    reply: Reply<usize>,
  },
  Count {
    reply: Reply<usize>,
  },
  Keys {
    reply: Reply<Vec<String>>,
  },
  Exists {
    key: String,
    reply: Reply<bool>,
  },
  Purge {
    reply: Option<Reply<usize>>,
  },
  Stats {
    reply: Reply<StatsSnapshot>,
  },
  /// A mutation arriving from a peer node; applied locally, never
  /// re-broadcast
  Replicated {
    mutation: Mutation,
    reply: Reply<()>,
  },
}

/// Everything the worker needs to service requests
pub(crate) struct WorkerCtx {
  pub store: Arc<dyn Store>,
  pub clock: Arc<dyn Clock>,
  pub hooks: HookDispatcher,
  pub default_ttl: Option<u64>,
  pub default_fallback: Option<FallbackFn>,
  pub fallback_args: Vec<Value>,
  pub stats: Option<StatsReader>,
  pub replicator: Option<Replicator>,
  pub locks: Arc<LockTable>,
  pub transactional: bool,
  pub lock_timeout: Duration,
}

/// Worker loop; the inbox survives restarts so a panic only loses the
/// command that caused it
pub(crate) async fn run(ctx: Arc<WorkerCtx>, inbox: Arc<Mutex<mpsc::Receiver<Command>>>) {
  let mut inbox = inbox.lock().await;
  while let Some(command) = inbox.recv().await {
    handle(&ctx, command).await;
  }
}

async fn handle(ctx: &WorkerCtx, command: Command) {
  match command {
    Command::Get { key, fallback, reply } => {
      let action = Action::for_key("get", key.as_str());
      ctx.hooks.pre(action.clone());
      let (result, outcome) = do_get(ctx, &key, fallback).await;
      let _ = reply.send(result);
      ctx.hooks.post(action, outcome);
    }
    Command::GetAndUpdate {
      key,
      apply,
      fallback,
      reply,
    } => {
      let action = Action::for_key("get_and_update", key.as_str());
      ctx.hooks.pre(action.clone());
      let (result, outcome) = do_get_and_update(ctx, &key, apply, fallback).await;
      let _ = reply.send(result);
      ctx.hooks.post(action, outcome);
    }
    Command::Set {
      key,
      value,
      ttl,
      reply,
    } => {
      let action = Action::for_key("set", key.as_str());
      ctx.hooks.pre(action.clone());
      let (result, outcome) = match do_set(ctx, key, value, ttl).await {
        Ok(()) => (Ok(true), Outcome::Written),
        Err(e) => (Err(e), Outcome::Error),
      };
      send(reply, result);
      ctx.hooks.post(action, outcome);
    }
    Command::Update { key, value, reply } => {
      let action = Action::for_key("update", key.as_str());
      ctx.hooks.pre(action.clone());
      let (result, outcome) = match do_update(ctx, key, value).await {
        Ok(true) => (Ok(true), Outcome::Written),
        Ok(false) => (Ok(false), Outcome::Miss { expired: false }),
        Err(e) => (Err(e), Outcome::Error),
      };
      send(reply, result);
      ctx.hooks.post(action, outcome);
    }
    Command::Del { key, reply } => {
      let action = Action::for_key("del", key.as_str());
      ctx.hooks.pre(action.clone());
      let (result, outcome) = match do_del(ctx, key).await {
        // the guarantee is absence, so del succeeds either way
        Ok(hit) => (Ok(true), Outcome::Removed { hit }),
        Err(e) => (Err(e), Outcome::Error),
      };
      send(reply, result);
      ctx.hooks.post(action, outcome);
    }
    Command::Clear { reply } => {
      let action = Action::new("clear");
      ctx.hooks.pre(action.clone());
      let (result, outcome) = match do_clear(ctx).await {
        Ok(count) => (Ok(count), Outcome::Cleared(count)),
        Err(e) => (Err(e), Outcome::Error),
      };
      send(reply, result);
      ctx.hooks.post(action, outcome);
    }
    Command::Take { key, reply } => {
      let action = Action::for_key("take", key.as_str());
      ctx.hooks.pre(action.clone());
      let (result, outcome) = match do_take(ctx, key).await {
        Ok((Some(value), _)) => (Ok(Some(value)), Outcome::Removed { hit: true }),
        Ok((None, expired)) => (Ok(None), Outcome::Miss { expired }),
        Err(e) => (Err(e), Outcome::Error),
      };
      send(reply, result);
      ctx.hooks.post(action, outcome);
    }
    Command::Incr {
      key,
      amount,
      initial,
      reply,
    } => {
      let action = Action::for_key("incr", key.as_str());
      ctx.hooks.pre(action.clone());
      let (result, outcome) = match do_incr(ctx, key, amount, initial).await {
        Ok(next) => (Ok(next), Outcome::Counter(next)),
        Err(e) => (Err(e), Outcome::Error),
      };
      send(reply, result);
      ctx.hooks.post(action, outcome);
    }
    Command::Expire { key, ttl, reply } => {
      let action = Action::for_key("expire", key.as_str());
      ctx.hooks.pre(action.clone());
      let (result, outcome) = match do_expire(ctx, key, ttl).await {
        Ok(hit) => (Ok(hit), Outcome::TtlChanged(hit)),
        Err(e) => (Err(e), Outcome::Error),
      };
      send(reply, result);
      ctx.hooks.post(action, outcome);
    }
    Command::ExpireAt { key, at, reply } => {
      let action = Action::for_key("expire_at", key.as_str());
      ctx.hooks.pre(action.clone());
      // peers receive the relative deadline; absolute stamps do not travel
      let ttl = at as i64 - ctx.clock.now_ms() as i64;
      let (result, outcome) = match do_expire(ctx, key, ttl).await {
        Ok(hit) => (Ok(hit), Outcome::TtlChanged(hit)),
        Err(e) => (Err(e), Outcome::Error),
      };
      send(reply, result);
      ctx.hooks.post(action, outcome);
    }
    Command::Persist { key, reply } => {
      let action = Action::for_key("persist", key.as_str());
      ctx.hooks.pre(action.clone());
      let (result, outcome) = match do_persist(ctx, key).await {
        Ok(hit) => (Ok(hit), Outcome::TtlChanged(hit)),
        Err(e) => (Err(e), Outcome::Error),
      };
      send(reply, result);
      ctx.hooks.post(action, outcome);
    }
    Command::Refresh { key, reply } => {
      let action = Action::for_key("refresh", key.as_str());
      ctx.hooks.pre(action.clone());
      let (result, outcome) = match do_refresh(ctx, key).await {
        Ok(hit) => (Ok(hit), Outcome::TtlChanged(hit)),
        Err(e) => (Err(e), Outcome::Error),
      };
      send(reply, result);
      ctx.hooks.post(action, outcome);
    }
    Command::Ttl { key, reply } => {
      let action = Action::for_key("ttl", key.as_str());
      ctx.hooks.pre(action.clone());
      let status = ttl_status(ctx, &key).await;
      let _ = reply.send(Ok(status));
      ctx.hooks.post(action, Outcome::Info);
    }
    Command::Size { reply } => {
      let action = Action::new("size");
      ctx.hooks.pre(action.clone());
      let size = ctx.store.len().await;
      let _ = reply.send(Ok(size));
      ctx.hooks.post(action, Outcome::Info);
    }
    Command::Count { reply } => {
      let action = Action::new("count");
      ctx.hooks.pre(action.clone());
      let now = ctx.clock.now_ms();
      let count = ctx
        .store
        .scan()
        .await
        .iter()
        .filter(|(_, record)| !record.is_expired(now))
        .count();
      let _ = reply.send(Ok(count));
      ctx.hooks.post(action, Outcome::Info);
    }
    Command::Keys { reply } => {
      let action = Action::new("keys");
      ctx.hooks.pre(action.clone());
      let keys = ctx.store.scan().await.into_iter().map(|(k, _)| k).collect();
      let _ = reply.send(Ok(keys));
      ctx.hooks.post(action, Outcome::Info);
    }
    Command::Exists { key, reply } => {
      let action = Action::for_key("exists", key.as_str());
      ctx.hooks.pre(action.clone());
      let now = ctx.clock.now_ms();
      let exists = ctx
        .store
        .get(&key)
        .await
        .map(|record| !record.is_expired(now))
        .unwrap_or(false);
      let _ = reply.send(Ok(exists));
      ctx.hooks.post(action, Outcome::Info);
    }
    Command::Purge { reply } => {
      let action = Action::new("purge");
      ctx.hooks.pre(action.clone());
      let (result, outcome) = match do_purge(ctx).await {
        Ok(swept) => (Ok(swept), Outcome::Swept(swept)),
        Err(e) => (Err(e), Outcome::Error),
      };
      send(reply, result);
      ctx.hooks.post(action, outcome);
    }
    Command::Stats { reply } => {
      let action = Action::new("stats");
      ctx.hooks.pre(action.clone());
      let result = match &ctx.stats {
        Some(reader) => Ok(reader.snapshot()),
        None => Err(CacheError::StatsNotEnabled),
      };
      let outcome = if result.is_ok() {
        Outcome::Info
      } else {
        Outcome::Error
      };
      let _ = reply.send(result);
      ctx.hooks.post(action, outcome);
    }
    Command::Replicated { mutation, reply } => {
      let action = mutation_action(&mutation);
      ctx.hooks.pre(action.clone());
      let (result, outcome) = apply_replicated(ctx, mutation).await;
      let _ = reply.send(result);
      ctx.hooks.post(action, outcome);
    }
  }
}

fn send<T>(reply: Option<Reply<T>>, result: CacheResult<T>) {
  if let Some(reply) = reply {
    let _ = reply.send(result);
  }
}

// == Read path ==

async fn do_get(
  ctx: &WorkerCtx,
  key: &str,
  fallback: Option<FallbackFn>,
) -> (CacheResult<Fetched>, Outcome) {
  let (result, expired) = read_value(ctx, key, fallback).await;
  let outcome = match &result {
    Ok(Fetched::Hit(_)) => Outcome::Hit,
    Ok(Fetched::Loaded(_)) => Outcome::Loaded { expired },
    Ok(Fetched::Missing) => Outcome::Miss { expired },
    Err(_) => Outcome::Error,
  };
  (result, outcome)
}

/// Look up `key`, evicting a logically expired record on the way, and run
/// the fallback protocol on a miss. The second return says whether an
/// expired record was evicted.
async fn read_value(
  ctx: &WorkerCtx,
  key: &str,
  fallback: Option<FallbackFn>,
) -> (CacheResult<Fetched>, bool) {
  let now = ctx.clock.now_ms();
  let mut expired = false;
  match ctx.store.get(key).await {
    Some(record) if record.is_expired(now) => {
      ctx.store.remove(key).await;
      expired = true;
    }
    Some(record) => return (Ok(Fetched::Hit(record.value)), false),
    None => {}
  }

  let fallback = fallback.or_else(|| ctx.default_fallback.clone());
  let Some(fallback) = fallback else {
    return (Ok(Fetched::Missing), expired);
  };

  match invoke_fallback(&fallback, key, &ctx.fallback_args) {
    Ok(value) => {
      let keys = vec![key.to_string()];
      let write = with_locks(ctx, &keys, async {
        let now = ctx.clock.now_ms();
        ctx
          .store
          .put(Record::new(key, value.clone(), now, ctx.default_ttl))
          .await;
        broadcast(
          ctx,
          Mutation::Set {
            key: key.to_string(),
            value: value.clone(),
            ttl: ctx.default_ttl,
          },
        )
        .await
      })
      .await;
      match write {
        Ok(()) => (Ok(Fetched::Loaded(value)), expired),
        Err(e) => (Err(e), expired),
      }
    }
    Err(e) => (Err(e), expired),
  }
}

async fn do_get_and_update(
  ctx: &WorkerCtx,
  key: &str,
  apply: UpdateFn,
  fallback: Option<FallbackFn>,
) -> (CacheResult<Applied>, Outcome) {
  let (read, expired) = read_value(ctx, key, fallback).await;
  let fetched = match read {
    Ok(fetched) => fetched,
    Err(e) => return (Err(e), Outcome::Error),
  };
  let origin = fetched.origin();
  let prior = fetched.into_value();

  let value = match invoke_update(&apply, prior.as_ref()) {
    Ok(value) => value,
    Err(e) => return (Err(e), Outcome::Error),
  };

  let keys = vec![key.to_string()];
  let write = match origin {
    // the record exists (a hit, or just written by the load); only the
    // value changes, the TTL base stays where it was
    Origin::Hit | Origin::Loaded => {
      with_locks(ctx, &keys, async {
        update_value(ctx, key, value.clone()).await;
        broadcast(
          ctx,
          Mutation::Update {
            key: key.to_string(),
            value: value.clone(),
          },
        )
        .await
      })
      .await
    }
    Origin::Missing => {
      with_locks(ctx, &keys, async {
        let now = ctx.clock.now_ms();
        ctx
          .store
          .put(Record::new(key, value.clone(), now, ctx.default_ttl))
          .await;
        broadcast(
          ctx,
          Mutation::Set {
            key: key.to_string(),
            value: value.clone(),
            ttl: ctx.default_ttl,
          },
        )
        .await
      })
      .await
    }
  };

  match write {
    Ok(()) => {
      let outcome = match origin {
        Origin::Hit => Outcome::Hit,
        Origin::Loaded => Outcome::Loaded { expired },
        Origin::Missing => Outcome::Miss { expired },
      };
      (Ok(Applied { origin, value }), outcome)
    }
    Err(e) => (Err(e), Outcome::Error),
  }
}

async fn ttl_status(ctx: &WorkerCtx, key: &str) -> TtlStatus {
  let now = ctx.clock.now_ms();
  match ctx.store.get(key).await {
    Some(record) if record.is_expired(now) => TtlStatus::Missing,
    Some(record) => match record.remaining(now) {
      Some(ms) => TtlStatus::Remaining(ms),
      None => TtlStatus::Unset,
    },
    None => TtlStatus::Missing,
  }
}

// == Write path ==
//
// Every do_* below applies locally, then broadcasts the mutation when the
// instance is replicated. Row locks wrap the whole of both steps in
// transactional mode.

async fn do_set(ctx: &WorkerCtx, key: String, value: Value, ttl: Option<u64>) -> CacheResult<()> {
  let keys = vec![key.clone()];
  let effective = ttl.or(ctx.default_ttl);
  with_locks(ctx, &keys, async move {
    let now = ctx.clock.now_ms();
    ctx
      .store
      .put(Record::new(key.clone(), value.clone(), now, effective))
      .await;
    broadcast(
      ctx,
      Mutation::Set {
        key,
        value,
        ttl: effective,
      },
    )
    .await
  })
  .await
}

async fn do_update(ctx: &WorkerCtx, key: String, value: Value) -> CacheResult<bool> {
  let keys = vec![key.clone()];
  with_locks(ctx, &keys, async move {
    let hit = update_value(ctx, &key, value.clone()).await;
    if !hit {
      return Ok(false);
    }
    broadcast(ctx, Mutation::Update { key, value }).await?;
    Ok(true)
  })
  .await
}

async fn do_del(ctx: &WorkerCtx, key: String) -> CacheResult<bool> {
  let keys = vec![key.clone()];
  with_locks(ctx, &keys, async move {
    let hit = ctx.store.remove(&key).await;
    broadcast(ctx, Mutation::Del { key }).await?;
    Ok(hit)
  })
  .await
}

async fn do_clear(ctx: &WorkerCtx) -> CacheResult<usize> {
  let count = ctx.store.clear().await;
  broadcast(ctx, Mutation::Clear).await?;
  Ok(count)
}

async fn do_take(ctx: &WorkerCtx, key: String) -> CacheResult<(Option<Value>, bool)> {
  let keys = vec![key.clone()];
  with_locks(ctx, &keys, async move {
    let (value, expired) = take_record(ctx, &key).await;
    broadcast(ctx, Mutation::Take { key }).await?;
    Ok((value, expired))
  })
  .await
}

async fn do_incr(ctx: &WorkerCtx, key: String, amount: i64, initial: i64) -> CacheResult<i64> {
  let keys = vec![key.clone()];
  with_locks(ctx, &keys, async move {
    let next = incr_value(ctx, &key, amount, initial).await?;
    broadcast(
      ctx,
      Mutation::Incr {
        key,
        amount,
        initial,
      },
    )
    .await?;
    Ok(next)
  })
  .await
}

async fn do_expire(ctx: &WorkerCtx, key: String, ttl: i64) -> CacheResult<bool> {
  let keys = vec![key.clone()];
  with_locks(ctx, &keys, async move {
    let hit = expire_key(ctx, &key, ttl).await;
    broadcast(ctx, Mutation::Expire { key, ttl }).await?;
    Ok(hit)
  })
  .await
}

async fn do_persist(ctx: &WorkerCtx, key: String) -> CacheResult<bool> {
  let keys = vec![key.clone()];
  with_locks(ctx, &keys, async move {
    let hit = persist_key(ctx, &key).await;
    broadcast(ctx, Mutation::Persist { key }).await?;
    Ok(hit)
  })
  .await
}

async fn do_refresh(ctx: &WorkerCtx, key: String) -> CacheResult<bool> {
  let keys = vec![key.clone()];
  with_locks(ctx, &keys, async move {
    let hit = refresh_key(ctx, &key).await;
    broadcast(ctx, Mutation::Refresh { key }).await?;
    Ok(hit)
  })
  .await
}

async fn do_purge(ctx: &WorkerCtx) -> CacheResult<usize> {
  let swept = janitor::sweep(ctx.store.as_ref(), ctx.clock.as_ref()).await;
  broadcast(ctx, Mutation::Purge).await?;
  Ok(swept)
}

// == Local primitives ==
//
// Shared by the write path above and by replicated mutations arriving from
// peers. A logically expired record is treated as missing and its husk is
// removed on the way.

async fn update_value(ctx: &WorkerCtx, key: &str, value: Value) -> bool {
  let now = ctx.clock.now_ms();
  match ctx.store.get(key).await {
    Some(record) if record.is_expired(now) => {
      ctx.store.remove(key).await;
      false
    }
    Some(_) => ctx
      .store
      .update(key, Box::new(move |record| record.value = value))
      .await
      .is_some(),
    None => false,
  }
}

async fn take_record(ctx: &WorkerCtx, key: &str) -> (Option<Value>, bool) {
  let now = ctx.clock.now_ms();
  match ctx.store.get(key).await {
    Some(record) if record.is_expired(now) => {
      ctx.store.remove(key).await;
      (None, true)
    }
    Some(record) => {
      ctx.store.remove(key).await;
      (Some(record.value), false)
    }
    None => (None, false),
  }
}

async fn incr_value(ctx: &WorkerCtx, key: &str, amount: i64, initial: i64) -> CacheResult<i64> {
  let now = ctx.clock.now_ms();
  let live = match ctx.store.get(key).await {
    Some(record) if record.is_expired(now) => {
      ctx.store.remove(key).await;
      None
    }
    live => live,
  };
  match live {
    Some(record) => {
      let current = record.value.as_i64().ok_or(CacheError::NotANumber)?;
      let next = current + amount;
      ctx
        .store
        .update(key, Box::new(move |record| record.value = Value::Integer(next)))
        .await;
      Ok(next)
    }
    None => {
      let next = initial + amount;
      ctx
        .store
        .put(Record::new(key, Value::Integer(next), now, ctx.default_ttl))
        .await;
      Ok(next)
    }
  }
}

async fn expire_key(ctx: &WorkerCtx, key: &str, ttl: i64) -> bool {
  let now = ctx.clock.now_ms();
  match ctx.store.get(key).await {
    Some(record) if record.is_expired(now) => {
      ctx.store.remove(key).await;
      false
    }
    Some(_) => {
      if ttl <= 0 {
        ctx.store.remove(key).await
      } else {
        let ttl = ttl as u64;
        ctx
          .store
          .update(
            key,
            Box::new(move |record| {
              record.touched = now;
              record.ttl = Some(ttl);
            }),
          )
          .await
          .is_some()
      }
    }
    None => false,
  }
}

async fn persist_key(ctx: &WorkerCtx, key: &str) -> bool {
  let now = ctx.clock.now_ms();
  match ctx.store.get(key).await {
    Some(record) if record.is_expired(now) => {
      ctx.store.remove(key).await;
      false
    }
    Some(_) => ctx
      .store
      .update(key, Box::new(|record| record.ttl = None))
      .await
      .is_some(),
    None => false,
  }
}

async fn refresh_key(ctx: &WorkerCtx, key: &str) -> bool {
  let now = ctx.clock.now_ms();
  match ctx.store.get(key).await {
    Some(record) if record.is_expired(now) => {
      ctx.store.remove(key).await;
      false
    }
    Some(_) => ctx
      .store
      .update(key, Box::new(move |record| record.touched = now))
      .await
      .is_some(),
    None => false,
  }
}

// == Replication plumbing ==

async fn broadcast(ctx: &WorkerCtx, mutation: Mutation) -> CacheResult<()> {
  match &ctx.replicator {
    Some(replicator) => replicator.broadcast(&mutation).await,
    None => Ok(()),
  }
}

/// Row locks around `op`, held locally and on every peer. A no-op outside
/// transactional mode and for keyless mutations.
async fn with_locks<T>(
  ctx: &WorkerCtx,
  keys: &[String],
  op: impl Future<Output = CacheResult<T>>,
) -> CacheResult<T> {
  if !ctx.transactional || keys.is_empty() {
    return op.await;
  }

  // the guard releases the local rows on every exit path below
  let _rows = match tokio::time::timeout(ctx.lock_timeout, ctx.locks.lock_guard(keys)).await {
    Ok(guard) => guard,
    Err(_) => return Err(CacheError::Timeout),
  };
  if let Some(replicator) = &ctx.replicator {
    replicator.lock_peers(keys).await?;
  }

  let result = op.await;

  if let Some(replicator) = &ctx.replicator {
    replicator.unlock_peers(keys).await;
  }
  result
}

async fn apply_replicated(ctx: &WorkerCtx, mutation: Mutation) -> (CacheResult<()>, Outcome) {
  match mutation {
    Mutation::Set { key, value, ttl } => {
      let now = ctx.clock.now_ms();
      ctx.store.put(Record::new(key, value, now, ttl)).await;
      (Ok(()), Outcome::Written)
    }
    Mutation::Update { key, value } => {
      let hit = update_value(ctx, &key, value).await;
      if hit {
        (Ok(()), Outcome::Written)
      } else {
        (Ok(()), Outcome::Miss { expired: false })
      }
    }
    Mutation::Del { key } => {
      let hit = ctx.store.remove(&key).await;
      (Ok(()), Outcome::Removed { hit })
    }
    Mutation::Clear => {
      let count = ctx.store.clear().await;
      (Ok(()), Outcome::Cleared(count))
    }
    Mutation::Take { key } => {
      let (value, expired) = take_record(ctx, &key).await;
      if value.is_some() {
        (Ok(()), Outcome::Removed { hit: true })
      } else {
        (Ok(()), Outcome::Miss { expired })
      }
    }
    Mutation::Incr {
      key,
      amount,
      initial,
    } => match incr_value(ctx, &key, amount, initial).await {
      Ok(next) => (Ok(()), Outcome::Counter(next)),
      Err(e) => (Err(e), Outcome::Error),
    },
    Mutation::Expire { key, ttl } => {
      let hit = expire_key(ctx, &key, ttl).await;
      (Ok(()), Outcome::TtlChanged(hit))
    }
    Mutation::Persist { key } => {
      let hit = persist_key(ctx, &key).await;
      (Ok(()), Outcome::TtlChanged(hit))
    }
    Mutation::Refresh { key } => {
      let hit = refresh_key(ctx, &key).await;
      (Ok(()), Outcome::TtlChanged(hit))
    }
    Mutation::Purge => {
      let swept = janitor::sweep(ctx.store.as_ref(), ctx.clock.as_ref()).await;
      (Ok(()), Outcome::Swept(swept))
    }
  }
}

fn mutation_action(mutation: &Mutation) -> Action {
  match mutation {
    Mutation::Set { key, .. } => Action::for_key("set", key.as_str()),
    Mutation::Update { key, .. } => Action::for_key("update", key.as_str()),
    Mutation::Del { key } => Action::for_key("del", key.as_str()),
    Mutation::Clear => Action::new("clear"),
    Mutation::Take { key } => Action::for_key("take", key.as_str()),
    Mutation::Incr { key, .. } => Action::for_key("incr", key.as_str()),
    Mutation::Expire { key, .. } => Action::for_key("expire", key.as_str()),
    Mutation::Persist { key } => Action::for_key("persist", key.as_str()),
    Mutation::Refresh { key } => Action::for_key("refresh", key.as_str()),
    Mutation::Purge => Action::new("purge"),
  }
}

// == User callables ==
//
// Fallbacks and update closures run inside the worker's critical section;
// a panic maps to an error instead of taking the worker down.

fn invoke_fallback(fallback: &FallbackFn, key: &str, args: &[Value]) -> CacheResult<Value> {
  match catch_unwind(AssertUnwindSafe(|| fallback(key, args))) {
    Ok(Ok(value)) => Ok(value),
    Ok(Err(reason)) => Err(CacheError::FallbackError(reason)),
    Err(_) => Err(CacheError::FallbackError("fallback panicked".to_string())),
  }
}

fn invoke_update(apply: &UpdateFn, prior: Option<&Value>) -> CacheResult<Value> {
  catch_unwind(AssertUnwindSafe(|| apply(prior)))
    .map_err(|_| CacheError::FallbackError("update closure panicked".to_string()))
}
