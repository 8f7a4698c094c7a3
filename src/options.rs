//! Per-instance configuration

use std::fmt;
use std::sync::Arc;

use crate::clock::{Clock, MonotonicClock};
use crate::error::{CacheError, CacheResult};
use crate::hooks::Hook;
use crate::replica::PeerLink;
use crate::store::Store;
use crate::value::Value;

/// Result of a fallback invocation
pub type FallbackResult = Result<Value, String>;

/// Miss loader: receives the key and the configured extra arguments
pub type FallbackFn = Arc<dyn Fn(&str, &[Value]) -> FallbackResult + Send + Sync>;

/// Default synchronous reply timeout in ms
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 250;

/// Default worker inbox depth
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// Default hook event buffer
pub const DEFAULT_HOOK_BUFFER: usize = 1024;

/// Configuration for one cache instance, immutable once started
#[derive(Clone)]
pub struct CacheOptions {
  /// Logical name, unique within the process
  pub name: String,
  /// TTL in ms applied to writes that do not carry their own
  pub default_ttl: Option<u64>,
  /// Janitor sweep interval in ms; `None` disables the janitor
  pub ttl_interval: Option<u64>,
  /// Loader consulted on every miss without a per-call fallback
  pub default_fallback: Option<FallbackFn>,
  /// Extra arguments handed to every fallback invocation
  pub fallback_args: Vec<Value>,
  /// Peer transports; empty means non-replicated
  pub peers: Vec<Arc<dyn PeerLink>>,
  /// Acquire row locks on every write path, locally and on peers
  pub transactional: bool,
  /// Ordered observers
  pub hooks: Vec<Arc<dyn Hook>>,
  /// Install the built-in stats post-hook
  pub record_stats: bool,
  /// Backend override; defaults to the in-memory store
  pub store: Option<Arc<dyn Store>>,
  pub clock: Arc<dyn Clock>,
  pub call_timeout: u64,
  pub queue_depth: usize,
  pub hook_buffer: usize,
}

impl CacheOptions {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      default_ttl: None,
      ttl_interval: None,
      default_fallback: None,
      fallback_args: Vec::new(),
      peers: Vec::new(),
      transactional: false,
      hooks: Vec::new(),
      record_stats: false,
      store: None,
      clock: Arc::new(MonotonicClock::new()),
      call_timeout: DEFAULT_CALL_TIMEOUT_MS,
      queue_depth: DEFAULT_QUEUE_DEPTH,
      hook_buffer: DEFAULT_HOOK_BUFFER,
    }
  }

  pub fn default_ttl(mut self, ms: u64) -> Self {
    self.default_ttl = Some(ms);
    self
  }

  pub fn ttl_interval(mut self, ms: u64) -> Self {
    self.ttl_interval = Some(ms);
    self
  }

  pub fn default_fallback(mut self, fallback: FallbackFn) -> Self {
    self.default_fallback = Some(fallback);
    self
  }

  pub fn fallback_args(mut self, args: Vec<Value>) -> Self {
    self.fallback_args = args;
    self
  }

  pub fn peer(mut self, peer: Arc<dyn PeerLink>) -> Self {
    self.peers.push(peer);
    self
  }

  pub fn transactional(mut self, transactional: bool) -> Self {
    self.transactional = transactional;
    self
  }

  pub fn hook(mut self, hook: Arc<dyn Hook>) -> Self {
    self.hooks.push(hook);
    self
  }

  pub fn record_stats(mut self, record_stats: bool) -> Self {
    self.record_stats = record_stats;
    self
  }

  pub fn store(mut self, store: Arc<dyn Store>) -> Self {
    self.store = Some(store);
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn call_timeout(mut self, ms: u64) -> Self {
    self.call_timeout = ms;
    self
  }

  pub fn queue_depth(mut self, depth: usize) -> Self {
    self.queue_depth = depth;
    self
  }

  pub fn hook_buffer(mut self, buffer: usize) -> Self {
    self.hook_buffer = buffer;
    self
  }

  /// True when mutations must also be applied on peer nodes
  pub fn remote(&self) -> bool {
    !self.peers.is_empty()
  }

  pub(crate) fn validate(&self) -> CacheResult<()> {
    if self.name.trim().is_empty() {
      return Err(CacheError::InvalidOption(
        "name must not be empty".to_string(),
      ));
    }
    if self.ttl_interval == Some(0) {
      return Err(CacheError::InvalidOption(
        "ttl_interval must be positive".to_string(),
      ));
    }
    if self.call_timeout == 0 {
      return Err(CacheError::InvalidOption(
        "call_timeout must be positive".to_string(),
      ));
    }
    if self.queue_depth == 0 {
      return Err(CacheError::InvalidOption(
        "queue_depth must be positive".to_string(),
      ));
    }
    if self.hook_buffer == 0 {
      return Err(CacheError::InvalidOption(
        "hook_buffer must be positive".to_string(),
      ));
    }
    Ok(())
  }
}

impl fmt::Debug for CacheOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheOptions")
      .field("name", &self.name)
      .field("default_ttl", &self.default_ttl)
      .field("ttl_interval", &self.ttl_interval)
      .field("default_fallback", &self.default_fallback.is_some())
      .field("fallback_args", &self.fallback_args.len())
      .field("peers", &self.peers.len())
      .field("transactional", &self.transactional)
      .field("hooks", &self.hooks.len())
      .field("record_stats", &self.record_stats)
      .field("call_timeout", &self.call_timeout)
      .field("queue_depth", &self.queue_depth)
      .field("hook_buffer", &self.hook_buffer)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let options = CacheOptions::new("cache");
    assert_eq!(options.name, "cache");
    assert_eq!(options.default_ttl, None);
    assert_eq!(options.ttl_interval, None);
    assert_eq!(options.call_timeout, DEFAULT_CALL_TIMEOUT_MS);
    assert_eq!(options.queue_depth, DEFAULT_QUEUE_DEPTH);
    assert!(!options.remote());
    assert!(!options.transactional);
    assert!(!options.record_stats);
    assert!(options.validate().is_ok());
  }

  #[test]
  fn test_validate_rejects_empty_name() {
    let result = CacheOptions::new("  ").validate();
    assert!(matches!(result, Err(CacheError::InvalidOption(_))));
  }

  #[test]
  fn test_validate_rejects_zero_intervals() {
    let options = CacheOptions::new("cache").ttl_interval(0);
    assert!(matches!(
      options.validate(),
      Err(CacheError::InvalidOption(_))
    ));

    let options = CacheOptions::new("cache").call_timeout(0);
    assert!(matches!(
      options.validate(),
      Err(CacheError::InvalidOption(_))
    ));

    let options = CacheOptions::new("cache").queue_depth(0);
    assert!(matches!(
      options.validate(),
      Err(CacheError::InvalidOption(_))
    ));
  }
}
