//! Periodic re-delivery of failed-job records.
//!
//! Each sweep lists the failed directory afresh. A record is deleted only
//! after a replay delivered it, and is otherwise left untouched. Sweeps are
//! not serialized against each other: an on-demand run overlapping the timer
//! may pick up the same record, deliver it twice, and have the second delete
//! find nothing.

use std::{sync::Arc, time::Duration};

use mailrelay_common::{Signal, internal};
use mailrelay_spool::{FallbackStore, SpoolError};
use tokio::sync::broadcast;

use crate::dispatcher::Dispatcher;

/// Counts from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub attempted: usize,
    pub delivered: usize,
    /// Records still on disk afterwards, unreadable ones included.
    pub remaining: usize,
    pub unreadable: usize,
}

pub struct ReplaySweep {
    dispatcher: Arc<Dispatcher>,
    store: Arc<FallbackStore>,
}

impl ReplaySweep {
    pub const fn new(dispatcher: Arc<Dispatcher>, store: Arc<FallbackStore>) -> Self {
        Self { dispatcher, store }
    }

    /// Replays every failed-job record once.
    ///
    /// # Errors
    ///
    /// Only a failure to list the failed directory; per-record problems are
    /// logged and counted.
    pub async fn run_once(&self) -> Result<ReplaySummary, SpoolError> {
        let ids = self.store.list_failed().await?;
        let mut summary = ReplaySummary::default();

        if ids.is_empty() {
            internal!(level = DEBUG, "No failed jobs to replay");
            return Ok(summary);
        }

        internal!(level = INFO, "Replaying {} failed jobs", ids.len());

        for id in ids {
            let job = match self.store.read_failed(&id).await {
                Ok(job) => job,
                Err(err) => {
                    internal!(level = ERROR, "[{id}] Unreadable failed-job record: {err}");
                    summary.unreadable += 1;
                    summary.remaining += 1;
                    continue;
                }
            };

            summary.attempted += 1;

            match self.dispatcher.replay(&job).await {
                Ok(_) => {
                    summary.delivered += 1;
                    match self.store.delete_failed(&id).await {
                        Ok(()) | Err(SpoolError::NotFound(_)) => {}
                        Err(err) => {
                            internal!(
                                level = ERROR,
                                "[{id}] Delivered on replay but the record could not be removed: {err}"
                            );
                        }
                    }
                    internal!(level = INFO, "[{id}] Replay delivered");
                }
                Err(err) => {
                    summary.remaining += 1;
                    internal!(level = WARN, "[{id}] Replay failed, keeping record: {err}");
                }
            }
        }

        internal!(
            level = INFO,
            "Replay sweep done: {} delivered, {} remaining",
            summary.delivered,
            summary.remaining
        );

        Ok(summary)
    }

    /// Sweeps every `interval` until a shutdown signal arrives.
    pub async fn serve(&self, interval: Duration, mut shutdown: broadcast::Receiver<Signal>) {
        internal!(level = INFO, "Replay sweep every {interval:?}");

        let mut timer = tokio::time::interval(interval);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(err) = self.run_once().await {
                        internal!(level = ERROR, "Replay sweep failed: {err}");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "Replay sweep stopping");
                            break;
                        }
                        Err(err) => {
                            internal!(level = ERROR, "Replay sweep lost its shutdown channel: {err}");
                            break;
                        }
                    }
                }
            }
        }
    }
}
