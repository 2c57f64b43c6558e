use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use mailrelay_common::{MailJob, Signal, config::RelayConfig, internal};
use mailrelay_delivery::{
    BacklogMonitor, Dispatcher, DnsResolver, JobReport, ReplaySummary, ReplaySweep, Services,
    SmtpTransport, WorkerPool,
};
use mailrelay_dkim::DkimSigner;
use mailrelay_metrics::Metrics;
use mailrelay_spool::FallbackStore;
use tokio::sync::broadcast;

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    Ok(())
}

/// Loads the signing key when signing is enabled. A key that cannot be loaded
/// is logged and the relay sends unsigned.
fn load_signer(config: &RelayConfig) -> Option<Arc<DkimSigner>> {
    if !config.dkim.enabled {
        return None;
    }

    match DkimSigner::from_config(&config.dkim) {
        Ok(signer) => {
            internal!(
                level = INFO,
                "Signing as {} with selector {}",
                config.dkim.domain,
                config.dkim.selector
            );
            Some(Arc::new(signer))
        }
        Err(err) => {
            internal!(level = ERROR, "Signing disabled, failed to load key: {err}");
            None
        }
    }
}

/// The assembled relay: one dispatcher and its collaborators.
pub struct Relay {
    config: RelayConfig,
    dispatcher: Arc<Dispatcher>,
    store: Arc<FallbackStore>,
    metrics: Arc<Metrics>,
}

impl Relay {
    /// Wires every pipeline component from `config`.
    ///
    /// # Errors
    ///
    /// If the storage directories cannot be prepared or the system resolver
    /// configuration cannot be read.
    pub fn new(config: RelayConfig) -> anyhow::Result<Self> {
        let store = Arc::new(FallbackStore::from_config(&config.storage));
        store.init()?;

        if config.providers().is_empty() && !config.direct_delivery.enabled {
            internal!(
                level = WARN,
                "Neither relay providers nor direct delivery are configured, every job will be stored locally"
            );
        }

        let services = Services {
            transport: Arc::new(SmtpTransport::new(config.smtp_timeouts)),
            resolver: Arc::new(DnsResolver::new(config.dns)?),
            store: Arc::clone(&store),
            signer: load_signer(&config),
        };
        let dispatcher = Arc::new(Dispatcher::new(&config, services));

        Ok(Self {
            config,
            dispatcher,
            store,
            metrics: Arc::new(Metrics::new()),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Starts the worker pool sized by configuration.
    pub fn start_pool(&self) -> WorkerPool {
        WorkerPool::start(
            self.config.workers.count,
            self.config.workers.queue_capacity,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.metrics),
        )
    }

    pub fn replay_sweep(&self) -> ReplaySweep {
        ReplaySweep::new(Arc::clone(&self.dispatcher), Arc::clone(&self.store))
    }

    /// Runs one replay sweep now.
    ///
    /// # Errors
    ///
    /// If the failed directory cannot be listed.
    pub async fn replay_once(&self) -> anyhow::Result<ReplaySummary> {
        Ok(self.replay_sweep().run_once().await?)
    }

    /// Delivers one message and waits for the outcome.
    ///
    /// # Errors
    ///
    /// A sender over its rate limit, an invalid job, or a pool that stopped
    /// before the job ran.
    pub async fn send(
        &self,
        from: String,
        to: Vec<String>,
        data: Vec<u8>,
    ) -> anyhow::Result<JobReport> {
        anyhow::ensure!(
            self.metrics.check_rate_limit(&from, &self.config.rate_limits),
            "Rate limit exceeded for {from}"
        );

        let job = MailJob::new(from, to, data)?;
        let pool = WorkerPool::start(
            1,
            1,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.metrics),
        );
        let report = pool.submit_and_wait(job).await;
        pool.shutdown().await;

        Ok(report?)
    }

    /// Runs the worker pool, replay sweep and backlog monitor until Ctrl-C or
    /// SIGTERM, then drains the queue.
    ///
    /// # Errors
    ///
    /// If the signal handlers cannot be installed.
    pub async fn run(self) -> anyhow::Result<()> {
        internal!(level = INFO, "Relay running");

        let pool = self.start_pool();

        let replay = self.replay_sweep();
        let replay_interval = Duration::from_secs(self.config.replay.interval_secs.max(1));
        let replay_task = tokio::spawn({
            let shutdown = SHUTDOWN_BROADCAST.subscribe();
            async move { replay.serve(replay_interval, shutdown).await }
        });

        let backlog = BacklogMonitor::new(Arc::clone(&self.store), self.config.backlog.threshold);
        let backlog_interval = Duration::from_secs(self.config.backlog.interval_secs.max(1));
        let backlog_task = tokio::spawn({
            let shutdown = SHUTDOWN_BROADCAST.subscribe();
            async move { backlog.serve(backlog_interval, shutdown).await }
        });

        let ret = shutdown().await;

        internal!(level = INFO, "Shutting down...");

        pool.shutdown().await;
        for task in [replay_task, backlog_task] {
            if let Err(err) = task.await {
                internal!(level = ERROR, "Background task ended abnormally: {err}");
            }
        }

        let snapshot = self.metrics.snapshot();
        internal!(
            level = INFO,
            "Processed {} jobs ({} successful, {} failed, {} recipients)",
            snapshot.total,
            snapshot.successful,
            snapshot.failed,
            snapshot.recipients
        );

        ret
    }
}
