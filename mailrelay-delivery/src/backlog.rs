//! Alerting on a growing pile of failed-job records.

use std::{sync::Arc, time::Duration};

use mailrelay_common::{Signal, internal};
use mailrelay_spool::{FallbackStore, SpoolError};
use tokio::sync::broadcast;

pub struct BacklogMonitor {
    store: Arc<FallbackStore>,
    threshold: usize,
}

impl BacklogMonitor {
    pub const fn new(store: Arc<FallbackStore>, threshold: usize) -> Self {
        Self { store, threshold }
    }

    /// Counts failed-job records, warning when there are more than the
    /// threshold.
    ///
    /// # Errors
    ///
    /// If the failed directory cannot be listed.
    pub async fn check(&self) -> Result<usize, SpoolError> {
        let count = self.store.count_failed().await?;

        if count > self.threshold {
            internal!(
                level = WARN,
                "Failed-job backlog at {count} records, above the threshold of {}",
                self.threshold
            );
        } else {
            internal!(level = DEBUG, "Failed-job backlog at {count} records");
        }

        Ok(count)
    }

    pub async fn serve(&self, interval: Duration, mut shutdown: broadcast::Receiver<Signal>) {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(err) = self.check().await {
                        internal!(level = ERROR, "Backlog check failed: {err}");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => break,
                        Err(err) => {
                            internal!(level = ERROR, "Backlog monitor lost its shutdown channel: {err}");
                            break;
                        }
                    }
                }
            }
        }
    }
}
