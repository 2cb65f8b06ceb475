/// Periodic backup of every live key.
///
/// Runs `Custody::backup_all` once per `backupFrequencyHours` as the
/// `system:scheduler` principal. The first sweep happens one full period
/// after `spawn`, not immediately.
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::model::Caller;
use crate::registry::Custody;

pub const SCHEDULER_PRINCIPAL: &str = "system:scheduler";

pub struct BackupScheduler {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl BackupScheduler {
    /// Start the scheduler with the period from the custody config.
    pub fn start(custody: Custody) -> Self {
        let every = custody.config().backup_interval();
        Self::spawn(custody, every)
    }

    pub fn spawn(custody: Custody, every: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown_rx = shutdown_tx.subscribe();
        let handle = tokio::spawn(run_loop(custody, every, shutdown_rx));
        info!(period_secs = every.as_secs(), "Backup scheduler started");
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Stop after any in-flight sweep finishes.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
        info!("Backup scheduler stopped");
    }
}

async fn run_loop(custody: Custody, every: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
    let caller = Caller::new(SCHEDULER_PRINCIPAL);
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!("Backup sweep starting");
                custody.backup_all(&caller).await;
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}
