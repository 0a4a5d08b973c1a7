//! ReaperLoop - stale session の定期回収
//!
//! core 自身は timer を持ちません。この loop が外部スケジューラとして
//! 一定間隔で `Coordinator::sweep` を呼びます。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::ports::{Clock, ProjectStore};

use super::Coordinator;

/// Reaper handle.
/// - `request_shutdown()` で次の tick を待たずに止まる
/// - `shutdown_and_join()` で終了を待てる
pub struct ReaperLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperLoop {
    /// Sweep now, then every `interval`.
    pub fn spawn<S, C>(coordinator: Arc<Coordinator<S, C>>, interval: Duration) -> Self
    where
        S: ProjectStore + 'static,
        C: Clock + Clone + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            reaper_loop(coordinator, interval, &mut shutdown_rx).await;
        });
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}

async fn reaper_loop<S, C>(
    coordinator: Arc<Coordinator<S, C>>,
    interval: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) where
    S: ProjectStore,
    C: Clock + Clone + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender dropped counts as shutdown
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        match coordinator.sweep().await {
            Ok(report) if !report.is_empty() => info!(
                project = coordinator.project(),
                released = report.released.len(),
                removed = report.removed.len(),
                "reaper released stale claims"
            ),
            Ok(_) => {}
            Err(e) => warn!(project = coordinator.project(), error = %e, "sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::TaskDraft;
    use crate::config::CoordinationConfig;
    use crate::domain::RegisterRequest;
    use crate::impls::InMemoryProjectStore;
    use crate::ports::FixedClock;
    use chrono::Utc;

    #[tokio::test]
    async fn first_tick_sweeps_and_shutdown_stops_the_loop() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let coordinator = Arc::new(Coordinator::new(
            InMemoryProjectStore::new(),
            Arc::clone(&clock),
            CoordinationConfig::default(),
            "demo",
        ));
        coordinator.init().await.unwrap();
        let task = coordinator.add_task(TaskDraft::new("a")).await.unwrap();
        let w = coordinator
            .register(RegisterRequest::new("w"))
            .await
            .unwrap()
            .worker_id;
        coordinator.claim(task.id, w).await.unwrap();
        clock.advance(chrono::Duration::minutes(10));

        let reaper = ReaperLoop::spawn(Arc::clone(&coordinator), Duration::from_secs(3600));

        let swept = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if coordinator.snapshot().await.unwrap().sessions.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(swept.is_ok());

        tokio::time::timeout(Duration::from_secs(5), reaper.shutdown_and_join())
            .await
            .unwrap();
        let snapshot = coordinator.snapshot().await.unwrap();
        assert!(snapshot.tasks[0].locked_by.is_none());
    }
}
