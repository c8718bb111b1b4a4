use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use annolab_common::retries::with_retries;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

use crate::broker::{BrokerClient, BrokerError, WorkerSnapshot};
use crate::config::TaskMonitorConfig;
use crate::metrics;

/// Singleton background refresher of the broker's live-task snapshot.
/// Status queries read the snapshot instead of pinging every worker.
pub struct TaskMonitor {
    shared: Arc<MonitorShared>,
}

struct MonitorShared {
    broker: Arc<dyn BrokerClient>,
    config: TaskMonitorConfig,
    snapshot: RwLock<WorkerSnapshot>,
    stop: AtomicBool,
    notify: Notify,
}

impl TaskMonitor {
    pub fn spawn(broker: Arc<dyn BrokerClient>, config: TaskMonitorConfig) -> Self {
        let shared = Arc::new(MonitorShared {
            broker,
            config,
            snapshot: RwLock::new(WorkerSnapshot::default()),
            stop: AtomicBool::new(false),
            notify: Notify::new(),
        });
        tokio::spawn(Self::run(shared.clone()));
        TaskMonitor { shared }
    }

    fn inspection_is_retriable(error: &BrokerError) -> bool {
        matches!(error, BrokerError::Unavailable(_))
    }

    async fn refresh(shared: &MonitorShared) {
        let result = with_retries(
            "broker",
            "inspect",
            None,
            &shared.config.retries,
            &shared.broker,
            |broker| Box::pin(async move { broker.inspect().await }),
            Self::inspection_is_retriable,
        )
        .await;
        match result {
            Ok(snapshot) => {
                *shared.snapshot.write().await = snapshot;
            }
            Err(broker_error) => {
                metrics::record_broker_inspection_failure();
                debug!("Task monitor could not inspect broker: {broker_error}");
            }
        }
    }

    async fn run(shared: Arc<MonitorShared>) {
        loop {
            if shared.stop.load(Ordering::SeqCst) {
                return;
            }
            Self::refresh(&shared).await;
            tokio::select! {
                _ = shared.notify.notified() => {}
                _ = tokio::time::sleep(shared.config.interval) => {}
            }
        }
    }

    pub async fn snapshot(&self) -> WorkerSnapshot {
        self.shared.snapshot.read().await.clone()
    }

    /// Forces an immediate refresh on the next loop turn.
    pub fn nudge(&self) {
        self.shared.notify.notify_waiters();
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }
}

impl Drop for TaskMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
