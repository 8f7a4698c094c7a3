//! Store trait and the default in-memory backend

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::record::Record;

/// Closure applied under the store's single-key atomicity guarantee
pub type UpdateRecord = Box<dyn FnOnce(&mut Record) + Send>;

/// Concurrent keyed table holding the records of one cache instance
///
/// Single-key operations are linearisable. `scan` is weakly consistent: it
/// observes every operation that completed before it started and may or may
/// not observe concurrent ones.
#[async_trait]
pub trait Store: Send + Sync {
  async fn get(&self, key: &str) -> Option<Record>;
  async fn put(&self, record: Record);
  async fn remove(&self, key: &str) -> bool;
  /// Atomic compare-and-update; returns the updated record, `None` on miss
  async fn update(&self, key: &str, apply: UpdateRecord) -> Option<Record>;
  async fn scan(&self) -> Vec<(String, Record)>;
  async fn clear(&self) -> usize;
  async fn len(&self) -> usize;
}

/// Default backend: a read/write-locked hash map
#[derive(Default)]
pub struct MemoryStore {
  data: RwLock<HashMap<String, Record>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn get(&self, key: &str) -> Option<Record> {
    self.data.read().get(key).cloned()
  }

  async fn put(&self, record: Record) {
    self.data.write().insert(record.key.clone(), record);
  }

  async fn remove(&self, key: &str) -> bool {
    self.data.write().remove(key).is_some()
  }

  async fn update(&self, key: &str, apply: UpdateRecord) -> Option<Record> {
    let mut data = self.data.write();
    let record = data.get_mut(key)?;
    apply(record);
    Some(record.clone())
  }

  async fn scan(&self) -> Vec<(String, Record)> {
    self
      .data
      .read()
      .iter()
      .map(|(k, r)| (k.clone(), r.clone()))
      .collect()
  }

  async fn clear(&self) -> usize {
    let mut data = self.data.write();
    let count = data.len();
    data.clear();
    count
  }

  async fn len(&self) -> usize {
    self.data.read().len()
  }
}
