//! Process-global registry of named instances

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::cache::Cache;
use crate::error::{CacheError, CacheResult};

static REGISTRY: OnceLock<RwLock<HashMap<String, Cache>>> = OnceLock::new();

fn table() -> &'static RwLock<HashMap<String, Cache>> {
  REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

pub(crate) fn register(cache: Cache) -> CacheResult<()> {
  let mut table = table().write();
  if table.contains_key(cache.name()) {
    return Err(CacheError::NameInUse(cache.name().to_string()));
  }
  table.insert(cache.name().to_string(), cache);
  Ok(())
}

pub(crate) fn lookup(name: &str) -> Option<Cache> {
  table().read().get(name).cloned()
}

pub(crate) fn deregister(name: &str) {
  table().write().remove(name);
}
