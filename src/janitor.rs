//! Periodic eviction of expired records

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::hooks::{Action, HookDispatcher, Outcome};
use crate::store::Store;
use crate::supervise;
use crate::worker::Command;

/// Wiring for one janitor task
#[derive(Clone)]
pub(crate) struct Janitor {
  pub store: Arc<dyn Store>,
  pub clock: Arc<dyn Clock>,
  pub hooks: HookDispatcher,
  /// Sweep interval in ms
  pub every: u64,
  /// Remote mode: sweeps flow through the worker so peers see them
  pub worker: Option<mpsc::Sender<Command>>,
}

pub(crate) fn start(janitor: Janitor) -> JoinHandle<()> {
  supervise::spawn_supervised("janitor".to_string(), move || run(janitor.clone()))
}

/// A missed tick is not made up; the next one catches every expired record
/// regardless
async fn run(janitor: Janitor) {
  let every = Duration::from_millis(janitor.every);
  loop {
    tokio::time::sleep(every).await;
    match &janitor.worker {
      Some(worker) => {
        let _ = worker.send(Command::Purge { reply: None }).await;
      }
      None => {
        let swept = sweep(janitor.store.as_ref(), janitor.clock.as_ref()).await;
        if swept > 0 {
          tracing::debug!("janitor evicted {} expired records", swept);
        }
        janitor
          .hooks
          .post(Action::new("purge"), Outcome::Swept(swept));
      }
    }
  }
}

/// Evict every logically expired record; returns the eviction count
pub(crate) async fn sweep(store: &dyn Store, clock: &dyn Clock) -> usize {
  let now = clock.now_ms();
  let mut swept = 0;
  for (key, record) in store.scan().await {
    if record.is_expired(now) && store.remove(&key).await {
      swept += 1;
    }
  }
  swept
}
