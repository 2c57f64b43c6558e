//! Dispatcher, fallback persistence and replay over a real filesystem
#![allow(clippy::unwrap_used)]

mod support;

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use mailrelay_common::{
    MailJob,
    config::{FallbackMode, ProviderEndpoint, RelayConfig, RetryConfig},
};
use mailrelay_delivery::{
    Dispatcher, Disposition, DnsError, MailServer, MxResolver, ReplaySummary, ReplaySweep,
    Services, SmtpTransport, WorkerPool,
};
use mailrelay_metrics::Metrics;
use mailrelay_spool::FallbackStore;
use pretty_assertions::assert_eq;
use support::{MockSmtpServer, closed_port};

struct Unresolvable;

#[async_trait]
impl MxResolver for Unresolvable {
    async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
        Err(DnsError::NoMailServers(domain.to_string()))
    }
}

fn config(dir: &Path, relay_port: u16, mode: FallbackMode) -> RelayConfig {
    let mut config = RelayConfig {
        forward_smtp: true,
        forward_providers: vec![ProviderEndpoint::new("127.0.0.1", relay_port)],
        retry: RetryConfig {
            attempts: 1,
            initial_backoff_ms: 10,
        },
        ..RelayConfig::default()
    };
    config.storage.local_dir = dir.join("local");
    config.storage.failed_dir = dir.join("failed");
    config.storage.fallback_mode = mode;
    config
}

fn build_dispatcher(config: &RelayConfig) -> (Arc<Dispatcher>, Arc<FallbackStore>) {
    let store = Arc::new(FallbackStore::from_config(&config.storage));
    store.init().unwrap();

    let dispatcher = Dispatcher::new(
        config,
        Services {
            transport: Arc::new(SmtpTransport::new(config.smtp_timeouts)),
            resolver: Arc::new(Unresolvable),
            store: Arc::clone(&store),
            signer: None,
        },
    );

    (Arc::new(dispatcher), store)
}

fn job() -> MailJob {
    MailJob::new(
        "sender@client.test",
        vec!["rcpt@example.org".into()],
        &b"Subject: pipeline\r\n\r\nhello\r\n"[..],
    )
    .unwrap()
}

fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[tokio::test]
async fn test_relay_delivery_leaves_no_files() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockSmtpServer::builder().build().await.unwrap();
    let config = config(dir.path(), server.addr().port(), FallbackMode::LocalCopy);
    let (dispatcher, _) = build_dispatcher(&config);

    let disposition = dispatcher.deliver(&job()).await.unwrap();

    assert_eq!(disposition, Disposition::Delivered { via: "relay" });
    assert_eq!(server.messages().await.len(), 1);
    assert_eq!(file_count(&config.storage.local_dir), 0);
    assert_eq!(file_count(&config.storage.failed_dir), 0);
}

#[tokio::test]
async fn test_local_copy_mode_persists_exactly_one_local_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), closed_port().await, FallbackMode::LocalCopy);
    let (dispatcher, _) = build_dispatcher(&config);
    let job = job();

    let disposition = dispatcher.deliver(&job).await.unwrap();

    assert_eq!(disposition, Disposition::Stored { via: "local-copy" });
    assert_eq!(file_count(&config.storage.local_dir), 1);
    assert_eq!(file_count(&config.storage.failed_dir), 0);

    let saved = std::fs::read_dir(&config.storage.local_dir)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let name = saved.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.contains("sender_at_client.test"), "{name}");
    assert!(name.ends_with(&format!("_{}.eml", job.id)), "{name}");

    let contents = std::fs::read_to_string(saved).unwrap();
    assert!(
        contents.starts_with("From: sender@client.test\r\nTo: rcpt@example.org\r\nDate: ")
    );
    assert!(contents.ends_with("\r\n\r\nSubject: pipeline\r\n\r\nhello\r\n"));
}

#[tokio::test]
async fn test_requeue_mode_persists_exactly_one_failed_record() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), closed_port().await, FallbackMode::Requeue);
    let (dispatcher, store) = build_dispatcher(&config);
    let job = job();

    let disposition = dispatcher.deliver(&job).await.unwrap();

    assert_eq!(disposition, Disposition::Stored { via: "requeue" });
    assert_eq!(file_count(&config.storage.local_dir), 0);
    assert_eq!(store.list_failed().await.unwrap(), [job.id.clone()]);
    assert_eq!(store.read_failed(&job.id).await.unwrap(), job);
}

#[tokio::test]
async fn test_successful_replay_removes_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let failing = config(dir.path(), closed_port().await, FallbackMode::Requeue);
    let (dispatcher, store) = build_dispatcher(&failing);
    let job = job();
    dispatcher.deliver(&job).await.unwrap();
    assert_eq!(store.count_failed().await.unwrap(), 1);

    let server = MockSmtpServer::builder().build().await.unwrap();
    let working = config(dir.path(), server.addr().port(), FallbackMode::Requeue);
    let (dispatcher, store) = build_dispatcher(&working);
    let sweep = ReplaySweep::new(dispatcher, Arc::clone(&store));

    let summary = sweep.run_once().await.unwrap();

    assert_eq!(
        summary,
        ReplaySummary {
            attempted: 1,
            delivered: 1,
            remaining: 0,
            unreadable: 0,
        }
    );
    assert_eq!(store.count_failed().await.unwrap(), 0);
    assert_eq!(server.messages().await.len(), 1);
}

#[tokio::test]
async fn test_failed_replay_leaves_the_record_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), closed_port().await, FallbackMode::Requeue);
    let (dispatcher, store) = build_dispatcher(&config);
    let job = job();
    dispatcher.deliver(&job).await.unwrap();

    let path = store.failed_path(&job.id).unwrap();
    let before = std::fs::read(&path).unwrap();

    let summary = ReplaySweep::new(dispatcher, Arc::clone(&store))
        .run_once()
        .await
        .unwrap();

    assert_eq!(summary.delivered, 0);
    assert_eq!(summary.remaining, 1);
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn test_replay_counts_unreadable_records() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockSmtpServer::builder().build().await.unwrap();
    let config = config(dir.path(), server.addr().port(), FallbackMode::Requeue);
    let (dispatcher, store) = build_dispatcher(&config);

    std::fs::write(config.storage.failed_dir.join("garbage.bin"), b"\xff\xff\xff").unwrap();

    let summary = ReplaySweep::new(dispatcher, Arc::clone(&store))
        .run_once()
        .await
        .unwrap();

    assert_eq!(summary.unreadable, 1);
    assert_eq!(summary.remaining, 1);
    assert_eq!(summary.attempted, 0);
    assert_eq!(store.count_failed().await.unwrap(), 1);
}

#[tokio::test]
async fn test_worker_pool_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockSmtpServer::builder().build().await.unwrap();
    let config = config(dir.path(), server.addr().port(), FallbackMode::LocalCopy);
    let (dispatcher, _) = build_dispatcher(&config);
    let metrics = Arc::new(Metrics::new());
    let pool = WorkerPool::start(2, 4, dispatcher, Arc::clone(&metrics));

    let report = pool.submit_and_wait(job()).await.unwrap();
    assert_eq!(report.outcome.unwrap(), Disposition::Delivered { via: "relay" });

    pool.shutdown().await;

    assert_eq!(metrics.snapshot().successful, 1);
    assert_eq!(server.messages().await.len(), 1);
}
