//! Stored records and expiry arithmetic

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// The unit stored under each key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub key: String,
  /// Timestamp on the cache clock (ms) at which `ttl` started counting
  pub touched: u64,
  /// Time to live in ms; `None` never expires
  pub ttl: Option<u64>,
  pub value: Value,
}

impl Record {
  pub fn new(key: impl Into<String>, value: Value, touched: u64, ttl: Option<u64>) -> Self {
    Self {
      key: key.into(),
      touched,
      ttl,
      value,
    }
  }

  /// Logically expired: the deadline has passed, whether or not the record
  /// has been physically removed
  pub fn is_expired(&self, now: u64) -> bool {
    match self.ttl {
      Some(ttl) => self.touched.saturating_add(ttl) <= now,
      None => false,
    }
  }

  /// Milliseconds left before expiry; `None` when the record never expires
  pub fn remaining(&self, now: u64) -> Option<u64> {
    self
      .ttl
      .map(|ttl| self.touched.saturating_add(ttl).saturating_sub(now))
  }
}
