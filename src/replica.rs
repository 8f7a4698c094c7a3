//! Peer replication and row locking

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::cache::Cache;
use crate::error::{CacheError, CacheResult};
use crate::value::Value;

/// A mutation replayed on peer nodes
///
/// Deadlines travel as relative TTLs so peers apply them against their own
/// clocks.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
  Set {
    key: String,
    value: Value,
    ttl: Option<u64>,
  },
  Update {
    key: String,
    value: Value,
  },
  Del {
    key: String,
  },
  Clear,
  Take {
    key: String,
  },
  Incr {
    key: String,
    amount: i64,
    initial: i64,
  },
  Expire {
    key: String,
    ttl: i64,
  },
  Persist {
    key: String,
  },
  Refresh {
    key: String,
  },
  Purge,
}

impl Mutation {
  /// Keys whose rows must be locked in transactional mode
  pub fn keys(&self) -> Vec<String> {
    match self {
      Mutation::Set { key, .. }
      | Mutation::Update { key, .. }
      | Mutation::Del { key }
      | Mutation::Take { key }
      | Mutation::Incr { key, .. }
      | Mutation::Expire { key, .. }
      | Mutation::Persist { key }
      | Mutation::Refresh { key } => vec![key.clone()],
      Mutation::Clear | Mutation::Purge => Vec::new(),
    }
  }
}

/// Failure applying a mutation on a peer
#[derive(Debug, Clone)]
pub struct PeerError(pub String);

impl std::fmt::Display for PeerError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "peer error: {}", self.0)
  }
}

impl std::error::Error for PeerError {}

/// Transport to one peer node
///
/// Implementations must deliver `apply` calls in submission order; the
/// worker's total order on mutations depends on it.
#[async_trait]
pub trait PeerLink: Send + Sync {
  /// Stable identifier of the peer node
  fn node(&self) -> &str;
  /// Apply a mutation on the peer
  async fn apply(&self, mutation: Mutation) -> Result<(), PeerError>;
  /// Acquire row locks on the peer (transactional mode)
  async fn lock(&self, keys: &[String]) -> Result<(), PeerError>;
  /// Release row locks on the peer
  async fn unlock(&self, keys: &[String]);
}

/// Per-instance row locks
///
/// `lock` acquires every key at once or waits; partial acquisition is never
/// observable, so lock order between callers cannot deadlock locally.
#[derive(Default)]
pub struct LockTable {
  held: Mutex<HashSet<String>>,
  freed: Notify,
}

impl LockTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn lock(&self, keys: &[String]) {
    loop {
      let mut notified = pin!(self.freed.notified());
      notified.as_mut().enable();
      {
        let mut held = self.held.lock();
        if keys.iter().all(|k| !held.contains(k.as_str())) {
          for key in keys {
            held.insert(key.clone());
          }
          return;
        }
      }
      notified.await;
    }
  }

  pub fn unlock(&self, keys: &[String]) {
    {
      let mut held = self.held.lock();
      for key in keys {
        held.remove(key.as_str());
      }
    }
    self.freed.notify_waiters();
  }

  /// RAII acquisition; the rows are released when the guard drops
  pub async fn lock_guard<'a>(&'a self, keys: &[String]) -> RowGuard<'a> {
    self.lock(keys).await;
    RowGuard {
      table: self,
      keys: keys.to_vec(),
    }
  }

  pub fn is_locked(&self, key: &str) -> bool {
    self.held.lock().contains(key)
  }
}

/// Holds row locks until dropped
pub struct RowGuard<'a> {
  table: &'a LockTable,
  keys: Vec<String>,
}

impl Drop for RowGuard<'_> {
  fn drop(&mut self) {
    self.table.unlock(&self.keys);
  }
}

/// Applies mutations on every configured peer
pub(crate) struct Replicator {
  peers: Vec<Arc<dyn PeerLink>>,
  timeout: Duration,
}

impl Replicator {
  pub fn new(peers: Vec<Arc<dyn PeerLink>>, timeout_ms: u64) -> Self {
    Self {
      peers,
      timeout: Duration::from_millis(timeout_ms),
    }
  }

  /// Apply `mutation` on every peer, in order; succeeds iff all acknowledge.
  ///
  /// Peers that acknowledged before a failure keep the mutation.
  pub async fn broadcast(&self, mutation: &Mutation) -> CacheResult<()> {
    let mut failed = Vec::new();
    for peer in &self.peers {
      match tokio::time::timeout(self.timeout, peer.apply(mutation.clone())).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
          tracing::error!("peer {} rejected mutation: {}", peer.node(), e);
          failed.push(peer.node().to_string());
        }
        Err(_) => {
          tracing::error!("peer {} timed out applying mutation", peer.node());
          failed.push(peer.node().to_string());
        }
      }
    }
    if failed.is_empty() {
      Ok(())
    } else {
      Err(CacheError::ReplicationFailed(failed))
    }
  }

  /// Acquire row locks on every peer; backs out on the first failure
  pub async fn lock_peers(&self, keys: &[String]) -> CacheResult<()> {
    let mut locked: Vec<&Arc<dyn PeerLink>> = Vec::new();
    for peer in &self.peers {
      match tokio::time::timeout(self.timeout, peer.lock(keys)).await {
        Ok(Ok(())) => locked.push(peer),
        _ => {
          for held in locked {
            held.unlock(keys).await;
          }
          return Err(CacheError::ReplicationFailed(vec![peer.node().to_string()]));
        }
      }
    }
    Ok(())
  }

  pub async fn unlock_peers(&self, keys: &[String]) {
    for peer in &self.peers {
      peer.unlock(keys).await;
    }
  }
}

/// In-process transport: applies mutations through another instance's worker
pub struct LocalPeer {
  node: String,
  target: Cache,
}

impl LocalPeer {
  pub fn new(node: impl Into<String>, target: Cache) -> Self {
    Self {
      node: node.into(),
      target,
    }
  }
}

#[async_trait]
impl PeerLink for LocalPeer {
  fn node(&self) -> &str {
    &self.node
  }

  async fn apply(&self, mutation: Mutation) -> Result<(), PeerError> {
    self
      .target
      .apply_replicated(mutation)
      .await
      .map_err(|e| PeerError(e.to_string()))
  }

  async fn lock(&self, keys: &[String]) -> Result<(), PeerError> {
    self.target.lock_table().lock(keys).await;
    Ok(())
  }

  async fn unlock(&self, keys: &[String]) {
    self.target.lock_table().unlock(keys);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_lock_table_mutual_exclusion() {
    let table = Arc::new(LockTable::new());
    let keys = vec!["a".to_string()];

    table.lock(&keys).await;
    assert!(table.is_locked("a"));

    let contender = {
      let table = table.clone();
      let keys = keys.clone();
      tokio::spawn(async move {
        table.lock(&keys).await;
        table.unlock(&keys);
      })
    };

    // Still held by us, the contender has to wait
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!contender.is_finished());

    table.unlock(&keys);
    contender.await.unwrap();
    assert!(!table.is_locked("a"));
  }

  #[tokio::test]
  async fn test_lock_guard_releases_on_drop() {
    let table = LockTable::new();
    let keys = vec!["a".to_string(), "b".to_string()];
    {
      let _guard = table.lock_guard(&keys).await;
      assert!(table.is_locked("a"));
      assert!(table.is_locked("b"));
    }
    assert!(!table.is_locked("a"));
    assert!(!table.is_locked("b"));
  }

  #[test]
  fn test_mutation_keys() {
    let m = Mutation::Set {
      key: "k".to_string(),
      value: Value::from(1),
      ttl: None,
    };
    assert_eq!(m.keys(), vec!["k".to_string()]);
    assert!(Mutation::Clear.keys().is_empty());
    assert!(Mutation::Purge.keys().is_empty());
  }
}
