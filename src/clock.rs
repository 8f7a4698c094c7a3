//! Time sources

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic millisecond time source for TTL bookkeeping
pub trait Clock: Send + Sync {
  fn now_ms(&self) -> u64;
}

/// Production clock: milliseconds since the clock was created
#[derive(Debug)]
pub struct MonotonicClock {
  origin: Instant,
}

impl MonotonicClock {
  pub fn new() -> Self {
    Self {
      origin: Instant::now(),
    }
  }
}

impl Default for MonotonicClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for MonotonicClock {
  fn now_ms(&self) -> u64 {
    self.origin.elapsed().as_millis() as u64
  }
}

/// Hand-driven clock for deterministic tests
#[derive(Debug, Default)]
pub struct ManualClock {
  now: AtomicU64,
}

impl ManualClock {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn advance(&self, ms: u64) {
    self.now.fetch_add(ms, Ordering::SeqCst);
  }

  pub fn set(&self, ms: u64) {
    self.now.store(ms, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now_ms(&self) -> u64 {
    self.now.load(Ordering::SeqCst)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_manual_clock() {
    let clock = ManualClock::new();
    assert_eq!(clock.now_ms(), 0);

    clock.advance(100);
    assert_eq!(clock.now_ms(), 100);

    clock.set(50);
    assert_eq!(clock.now_ms(), 50);
  }

  #[test]
  fn test_monotonic_clock_advances() {
    let clock = MonotonicClock::new();
    let first = clock.now_ms();
    std::thread::sleep(std::time::Duration::from_millis(5));
    assert!(clock.now_ms() >= first);
  }
}
