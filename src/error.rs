//! Cache error taxonomy

/// Errors surfaced by cache operations
///
/// A missing key is a status, not an error; it is carried in the operation's
/// return value instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
  /// Configuration rejected at start
  InvalidOption(String),
  /// A cache with this name is already running in the process
  NameInUse(String),
  /// incr/decr on a value without a numeric view
  NotANumber,
  /// `stats` called on an instance started without `record_stats`
  StatsNotEnabled,
  /// The synchronous reply window elapsed; the worker still completes the
  /// request
  Timeout,
  /// One or more peers did not acknowledge a broadcast mutation; the nodes
  /// that acknowledged are not rolled back
  ReplicationFailed(Vec<String>),
  /// A fallback or update closure returned an error or panicked
  FallbackError(String),
  /// The instance has been stopped
  Stopped,
}

impl std::fmt::Display for CacheError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheError::InvalidOption(msg) => write!(f, "invalid option: {}", msg),
      CacheError::NameInUse(name) => write!(f, "cache name '{}' already in use", name),
      CacheError::NotANumber => write!(f, "value is not a number"),
      CacheError::StatsNotEnabled => write!(f, "stats are not enabled for this cache"),
      CacheError::Timeout => write!(f, "timed out waiting for the cache worker"),
      CacheError::ReplicationFailed(nodes) => {
        write!(f, "replication failed on nodes: {}", nodes.join(", "))
      }
      CacheError::FallbackError(msg) => write!(f, "fallback failed: {}", msg),
      CacheError::Stopped => write!(f, "cache has been stopped"),
    }
  }
}

impl std::error::Error for CacheError {}

/// Convenience Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
