//! One-for-one task supervision

use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Runs `factory`'s future, respawning it whenever it panics.
///
/// A clean return ends the loop; aborting the returned handle cancels the
/// child with it. Siblings are unaffected either way.
pub(crate) fn spawn_supervised<F, Fut>(name: String, mut factory: F) -> JoinHandle<()>
where
  F: FnMut() -> Fut + Send + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  tokio::spawn(async move {
    loop {
      match AssertUnwindSafe(factory()).catch_unwind().await {
        Ok(()) => break,
        Err(_) => {
          tracing::error!("task {} crashed, restarting", name);
          tokio::time::sleep(Duration::from_millis(50)).await;
        }
      }
    }
  })
}
