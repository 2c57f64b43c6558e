//! Fixed set of workers draining a bounded job queue.
//!
//! Submitting waits while the queue is full, which throttles intake once the
//! pipeline is saturated. Each worker runs one job through the dispatcher to
//! completion before taking the next.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use mailrelay_common::{MailJob, internal};
use mailrelay_metrics::Metrics;
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    dispatcher::{Dispatcher, Disposition},
    error::DeliveryError,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("The worker pool has shut down")]
    Closed,
}

/// What happened to one job.
#[derive(Debug)]
pub struct JobReport {
    pub id: String,
    pub outcome: Result<Disposition, DeliveryError>,
    pub duration: Duration,
}

struct QueuedJob {
    job: MailJob,
    done: Option<oneshot::Sender<JobReport>>,
}

pub struct WorkerPool {
    sender: mpsc::Sender<QueuedJob>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` workers (at least one) behind a queue of `capacity`
    /// jobs (at least one).
    pub fn start(
        count: usize,
        capacity: usize,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..count.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let dispatcher = Arc::clone(&dispatcher);
                let metrics = Arc::clone(&metrics);
                tokio::spawn(async move { run_worker(worker, &receiver, &dispatcher, &metrics).await })
            })
            .collect();

        internal!(
            level = INFO,
            "Started {} delivery workers, queue capacity {}",
            count.max(1),
            capacity.max(1)
        );

        Self { sender, workers }
    }

    /// Queues `job`, waiting for space when the queue is full.
    ///
    /// # Errors
    ///
    /// [`PoolError::Closed`] once the workers are gone.
    pub async fn submit(&self, job: MailJob) -> Result<(), PoolError> {
        self.enqueue(QueuedJob { job, done: None }).await
    }

    /// Queues `job` and waits for its report.
    ///
    /// # Errors
    ///
    /// [`PoolError::Closed`] if the pool stopped before the job ran.
    pub async fn submit_and_wait(&self, job: MailJob) -> Result<JobReport, PoolError> {
        let (done, report) = oneshot::channel();
        self.enqueue(QueuedJob {
            job,
            done: Some(done),
        })
        .await?;

        report.await.map_err(|_| PoolError::Closed)
    }

    async fn enqueue(&self, queued: QueuedJob) -> Result<(), PoolError> {
        internal!("[{}] Queued for delivery", queued.job.id);
        self.sender.send(queued).await.map_err(|_| PoolError::Closed)
    }

    /// Stops intake, lets the workers drain what is queued, and waits for them.
    pub async fn shutdown(self) {
        let Self { sender, workers } = self;
        drop(sender);

        internal!(level = INFO, "Draining delivery queue ...");

        for worker in workers {
            if let Err(err) = worker.await {
                internal!(level = ERROR, "Delivery worker ended abnormally: {err}");
            }
        }

        internal!(level = INFO, "All delivery workers stopped");
    }
}

async fn run_worker(
    worker: usize,
    receiver: &Mutex<mpsc::Receiver<QueuedJob>>,
    dispatcher: &Dispatcher,
    metrics: &Metrics,
) {
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(QueuedJob { job, done }) = next else {
            internal!(level = DEBUG, "Worker {worker} exiting, queue closed");
            return;
        };

        let report = process(worker, job, dispatcher, metrics).await;

        if let Some(done) = done {
            let _ = done.send(report);
        }
    }
}

async fn process(
    worker: usize,
    job: MailJob,
    dispatcher: &Dispatcher,
    metrics: &Metrics,
) -> JobReport {
    let started = Instant::now();
    internal!(level = DEBUG, "[{}] Worker {worker} picked up job", job.id);

    let outcome = dispatcher.deliver(&job).await;
    let duration = started.elapsed();

    match &outcome {
        Ok(disposition) => {
            metrics.record_success(job.recipient_count(), duration);
            internal!(
                level = INFO,
                "[{}] Job finished ({disposition:?}) in {duration:?}",
                job.id
            );
        }
        Err(err) => {
            metrics.record_failure(job.recipient_count(), duration);
            internal!(level = ERROR, "[{}] Job unhandled: {err}", job.id);

            match dispatcher.rescue(&job).await {
                Ok(path) => internal!(
                    level = WARN,
                    "[{}] Job rescued to {}",
                    job.id,
                    path.display()
                ),
                Err(rescue_err) => internal!(
                    level = ERROR,
                    "[{}] Job lost, rescue also failed: {rescue_err}",
                    job.id
                ),
            }
        }
    }

    JobReport {
        id: job.id,
        outcome,
        duration,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use mailrelay_common::config::{ProviderEndpoint, RelayConfig, RetryConfig};
    use mailrelay_spool::FallbackStore;
    use pretty_assertions::assert_eq;
    use tokio::sync::{Notify, Semaphore};

    use super::*;
    use crate::{
        dispatcher::Services,
        dns::{DnsError, MailServer, MxResolver},
        transport::Transport,
        types::{Envelope, SessionReport, SessionTarget},
    };

    #[derive(Default)]
    struct Counting {
        sessions: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Counting {
        async fn deliver(
            &self,
            _target: &SessionTarget,
            envelope: &Envelope<'_>,
        ) -> Result<SessionReport, DeliveryError> {
            self.sessions.fetch_add(1, Ordering::SeqCst);
            Ok(SessionReport {
                accepted: envelope.to.to_vec(),
                rejected: Vec::new(),
            })
        }
    }

    /// Holds every session until a permit is released.
    struct Gated {
        entered: Notify,
        gate: Semaphore,
        sessions: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Gated {
        async fn deliver(
            &self,
            _target: &SessionTarget,
            envelope: &Envelope<'_>,
        ) -> Result<SessionReport, DeliveryError> {
            self.entered.notify_one();
            self.gate.acquire().await.unwrap().forget();
            self.sessions.fetch_add(1, Ordering::SeqCst);
            Ok(SessionReport {
                accepted: envelope.to.to_vec(),
                rejected: Vec::new(),
            })
        }
    }

    struct Refusing;

    #[async_trait]
    impl Transport for Refusing {
        async fn deliver(
            &self,
            _target: &SessionTarget,
            _envelope: &Envelope<'_>,
        ) -> Result<SessionReport, DeliveryError> {
            Err(DeliveryError::Transient("421 try later".into()))
        }
    }

    struct Nowhere;

    #[async_trait]
    impl MxResolver for Nowhere {
        async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
            Err(DnsError::NoMailServers(domain.to_string()))
        }
    }

    fn dispatcher(
        local_dir: &Path,
        failed_dir: &Path,
        transport: Arc<dyn Transport>,
    ) -> Arc<Dispatcher> {
        let mut config = RelayConfig {
            forward_smtp: true,
            forward_providers: vec![ProviderEndpoint::new("relay.test", 25)],
            retry: RetryConfig {
                attempts: 1,
                ..RetryConfig::default()
            },
            ..RelayConfig::default()
        };
        config.storage.local_dir = local_dir.to_path_buf();
        config.storage.failed_dir = failed_dir.to_path_buf();

        Arc::new(Dispatcher::new(
            &config,
            Services {
                transport,
                resolver: Arc::new(Nowhere),
                store: Arc::new(FallbackStore::from_config(&config.storage)),
                signer: None,
            },
        ))
    }

    fn pool(dir: &Path, transport: Arc<Counting>, metrics: Arc<Metrics>) -> WorkerPool {
        let dispatcher = dispatcher(&dir.join("local"), &dir.join("failed"), transport);
        WorkerPool::start(3, 2, dispatcher, metrics)
    }

    fn job(n: usize) -> MailJob {
        MailJob::new(
            "sender@example.com",
            vec![format!("rcpt{n}@example.org"), "other@example.org".into()],
            &b"Subject: x\r\n\r\nbody\r\n"[..],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_and_wait_reports_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        let pool = pool(dir.path(), Arc::default(), Arc::clone(&metrics));

        let job = job(0);
        let id = job.id.clone();
        let report = pool.submit_and_wait(job).await.unwrap();

        assert_eq!(report.id, id);
        assert_eq!(report.outcome.unwrap(), Disposition::Delivered { via: "relay" });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.successful, 1);
        assert_eq!(snapshot.recipients, 2);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        let transport = Arc::new(Counting::default());
        let pool = pool(dir.path(), Arc::clone(&transport), Arc::clone(&metrics));

        for n in 0..10 {
            pool.submit(job(n)).await.unwrap();
        }
        pool.shutdown().await;

        assert_eq!(transport.sessions.load(Ordering::SeqCst), 10);
        assert_eq!(metrics.snapshot().successful, 10);
    }

    #[tokio::test]
    async fn test_submit_waits_while_queue_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(Gated {
            entered: Notify::new(),
            gate: Semaphore::new(0),
            sessions: AtomicUsize::new(0),
        });
        let pool = WorkerPool::start(
            1,
            1,
            dispatcher(
                &dir.path().join("local"),
                &dir.path().join("failed"),
                Arc::clone(&transport) as Arc<dyn Transport>,
            ),
            Arc::new(Metrics::new()),
        );

        // The single worker holds the first job, the second fills the queue.
        pool.submit(job(0)).await.unwrap();
        transport.entered.notified().await;
        pool.submit(job(1)).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(100), pool.submit(job(2))).await;
        assert!(blocked.is_err());

        transport.gate.add_permits(3);
        tokio::time::timeout(Duration::from_secs(5), pool.submit(job(2)))
            .await
            .unwrap()
            .unwrap();

        pool.shutdown().await;
        assert_eq!(transport.sessions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_job_is_rescued_as_failed_record() {
        let dir = tempfile::tempdir().unwrap();
        // A plain file where the local directory should be makes local saves fail.
        let local_dir = dir.path().join("local");
        std::fs::write(&local_dir, b"not a directory").unwrap();
        let failed_dir = dir.path().join("failed");

        let metrics = Arc::new(Metrics::new());
        let pool = WorkerPool::start(
            1,
            1,
            dispatcher(&local_dir, &failed_dir, Arc::new(Refusing)),
            Arc::clone(&metrics),
        );

        let job = job(0);
        let id = job.id.clone();
        let report = pool.submit_and_wait(job).await.unwrap();
        pool.shutdown().await;

        assert!(matches!(report.outcome, Err(DeliveryError::Persistence(_))));
        assert_eq!(metrics.snapshot().failed, 1);

        let records: Vec<_> = std::fs::read_dir(&failed_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(records.len(), 1);

        let store = FallbackStore::new(&local_dir, &failed_dir);
        assert_eq!(store.list_failed().await.unwrap(), [id]);
    }
}
