//! Configuration consumed by the delivery pipeline.
//!
//! Everything here is plain data: it is deserialized once at startup and then
//! shared read-only. Nothing in the pipeline reads configuration files on its
//! own.
//!
//! ## Modules
//!
//! - [`provider`]: upstream relay accounts and their TLS mode
//! - [`timeouts`]: per-step SMTP session timeouts

pub mod provider;
pub mod timeouts;

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

pub use provider::{ProviderEndpoint, Secret, TlsMode, sort_by_priority};
pub use timeouts::SmtpTimeouts;

/// Headers signed when no explicit list is configured.
pub const DEFAULT_SIGNED_HEADERS: [&str; 8] = [
    "From",
    "To",
    "Subject",
    "Date",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
    "Message-ID",
];

/// Top-level relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay switch. With it off no provider is ever tried.
    #[serde(default)]
    pub forward_smtp: bool,

    #[serde(default)]
    pub forward_host: Option<String>,

    #[serde(default = "defaults::forward_port")]
    pub forward_port: u16,

    #[serde(default)]
    pub forward_username: Option<String>,

    #[serde(default)]
    pub forward_password: Option<Secret>,

    /// Legacy flag selecting implicit TLS for the single relay.
    #[serde(default)]
    pub forward_ssl: bool,

    #[serde(default)]
    pub forward_providers: Vec<ProviderEndpoint>,

    #[serde(default)]
    pub direct_delivery: DirectDeliveryConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub dkim: DkimConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub replay: ReplayConfig,

    #[serde(default)]
    pub backlog: BacklogConfig,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    #[serde(default)]
    pub smtp_timeouts: SmtpTimeouts,

    #[serde(default)]
    pub dns: DnsConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            forward_smtp: false,
            forward_host: None,
            forward_port: defaults::forward_port(),
            forward_username: None,
            forward_password: None,
            forward_ssl: false,
            forward_providers: Vec::new(),
            direct_delivery: DirectDeliveryConfig::default(),
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            dkim: DkimConfig::default(),
            storage: StorageConfig::default(),
            replay: ReplayConfig::default(),
            backlog: BacklogConfig::default(),
            workers: WorkerConfig::default(),
            rate_limits: RateLimitConfig::default(),
            smtp_timeouts: SmtpTimeouts::default(),
            dns: DnsConfig::default(),
        }
    }
}

impl RelayConfig {
    /// The relay accounts to try, in attempt order.
    ///
    /// Empty while `forward_smtp` is off. Otherwise a non-empty
    /// `forward_providers` list wins, and the legacy `forward_*` fields are
    /// upgraded to a single provider when a host is set.
    pub fn providers(&self) -> Vec<ProviderEndpoint> {
        if !self.forward_smtp {
            return Vec::new();
        }

        let mut providers = if self.forward_providers.is_empty() {
            self.legacy_provider().into_iter().collect()
        } else {
            self.forward_providers.clone()
        };

        sort_by_priority(&mut providers);
        providers
    }

    /// Whether any relay path is configured.
    pub fn relay_configured(&self) -> bool {
        self.forward_smtp
            && (!self.forward_providers.is_empty() || self.legacy_provider().is_some())
    }

    fn legacy_provider(&self) -> Option<ProviderEndpoint> {
        let host = self.forward_host.as_deref().filter(|h| !h.trim().is_empty())?;

        Some(ProviderEndpoint {
            host: host.to_string(),
            port: self.forward_port,
            username: self.forward_username.clone(),
            password: self.forward_password.clone(),
            tls: if self.forward_ssl {
                TlsMode::Implicit
            } else {
                TlsMode::StartTls
            },
            priority: 0,
        })
    }
}

/// Delivery straight to the recipients' mail exchangers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectDeliveryConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Name announced in EHLO. Falls back to the sender's domain.
    #[serde(default)]
    pub ehlo_domain: Option<String>,

    /// Skip certificate verification when upgrading with STARTTLS.
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Port dialled on every mail exchanger.
    ///
    /// Default: 25
    #[serde(default = "defaults::mx_port")]
    pub port: u16,
}

impl Default for DirectDeliveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ehlo_domain: None,
            insecure_skip_verify: false,
            port: defaults::mx_port(),
        }
    }
}

/// Recipient batching for relay forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Default: 20
    #[serde(default = "defaults::batch_size")]
    pub size: usize,

    /// Pause between consecutive batches.
    ///
    /// Default: 1000 ms
    #[serde(default = "defaults::batch_delay_ms")]
    pub delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: defaults::batch_size(),
            delay_ms: defaults::batch_delay_ms(),
        }
    }
}

impl BatchConfig {
    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Per-provider retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per provider before moving on.
    ///
    /// Default: 3
    #[serde(default = "defaults::retry_attempts")]
    pub attempts: u32,

    /// Wait after the first failed attempt; doubles after each further failure.
    ///
    /// Default: 1000 ms
    #[serde(default = "defaults::initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: defaults::retry_attempts(),
            initial_backoff_ms: defaults::initial_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// The wait after failed attempt number `attempt` (1-based), or `None`
    /// after the last attempt.
    pub fn backoff_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.attempts {
            return None;
        }

        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        Some(Duration::from_millis(
            self.initial_backoff_ms.saturating_mul(factor),
        ))
    }

    /// Every wait a provider can incur, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.attempts)
            .filter_map(|attempt| self.backoff_after(attempt))
            .collect()
    }
}

/// Message signing identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkimConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub domain: String,

    /// Default: `mail`
    #[serde(default = "defaults::dkim_selector")]
    pub selector: String,

    /// Default: `keys/{domain}/{selector}.private`
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    #[serde(default = "defaults::signed_headers")]
    pub headers_to_sign: Vec<String>,

    /// Validity window of a signature; 0 means it never expires.
    #[serde(default)]
    pub signature_expiry_secs: u64,
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            domain: String::new(),
            selector: defaults::dkim_selector(),
            private_key_path: None,
            headers_to_sign: defaults::signed_headers(),
            signature_expiry_secs: 0,
        }
    }
}

impl DkimConfig {
    pub fn key_path(&self) -> PathBuf {
        self.private_key_path.clone().unwrap_or_else(|| {
            PathBuf::from("keys")
                .join(&self.domain)
                .join(format!("{}.private", self.selector))
        })
    }
}

/// Which durable record the last pipeline stage writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Dump the message into the local mail directory.
    #[default]
    LocalCopy,

    /// Write a failed-job record so the replay sweep retries it.
    Requeue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Default: `emails`
    #[serde(default = "defaults::local_dir")]
    pub local_dir: PathBuf,

    /// Default: `emails/failed`
    #[serde(default = "defaults::failed_dir")]
    pub failed_dir: PathBuf,

    #[serde(default)]
    pub fallback_mode: FallbackMode,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_dir: defaults::local_dir(),
            failed_dir: defaults::failed_dir(),
            fallback_mode: FallbackMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Default: 3600 seconds
    #[serde(default = "defaults::replay_interval_secs")]
    pub interval_secs: u64,

    /// Also try direct delivery when replaying a failed job.
    #[serde(default)]
    pub include_direct: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            interval_secs: defaults::replay_interval_secs(),
            include_direct: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BacklogConfig {
    /// Default: 300 seconds
    #[serde(default = "defaults::backlog_interval_secs")]
    pub interval_secs: u64,

    /// Alert when more failed-job records than this are waiting.
    ///
    /// Default: 100
    #[serde(default = "defaults::backlog_threshold")]
    pub threshold: usize,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            interval_secs: defaults::backlog_interval_secs(),
            threshold: defaults::backlog_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Default: 5
    #[serde(default = "defaults::worker_count")]
    pub count: usize,

    /// Default: 1000
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: defaults::worker_count(),
            queue_capacity: defaults::queue_capacity(),
        }
    }
}

/// Per-sender submission limits, checked before a job is queued.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Default: 100
    #[serde(default = "defaults::max_per_hour")]
    pub max_per_hour: usize,

    /// Default: 1000
    #[serde(default = "defaults::max_per_day")]
    pub max_per_day: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_per_hour: defaults::max_per_hour(),
            max_per_day: defaults::max_per_day(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Default: 5 seconds
    #[serde(default = "defaults::dns_timeout_secs")]
    pub timeout_secs: u64,

    /// Floor applied to record TTLs when caching MX lookups. Default: 60
    #[serde(default = "defaults::min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Ceiling applied to record TTLs. Default: 3600
    #[serde(default = "defaults::max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::dns_timeout_secs(),
            min_cache_ttl_secs: defaults::min_cache_ttl_secs(),
            max_cache_ttl_secs: defaults::max_cache_ttl_secs(),
        }
    }
}

impl DnsConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Clamps a record TTL into the configured cache window.
    pub fn cache_ttl(&self, record_ttl: Duration) -> Duration {
        let min = Duration::from_secs(self.min_cache_ttl_secs);
        let max = Duration::from_secs(self.max_cache_ttl_secs).max(min);
        record_ttl.clamp(min, max)
    }
}

mod defaults {
    use std::path::PathBuf;

    pub const fn forward_port() -> u16 {
        587
    }

    pub const fn mx_port() -> u16 {
        25
    }

    pub const fn batch_size() -> usize {
        20
    }

    pub const fn batch_delay_ms() -> u64 {
        1000
    }

    pub const fn retry_attempts() -> u32 {
        3
    }

    pub const fn initial_backoff_ms() -> u64 {
        1000
    }

    pub fn dkim_selector() -> String {
        "mail".to_string()
    }

    pub fn signed_headers() -> Vec<String> {
        super::DEFAULT_SIGNED_HEADERS
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    pub fn local_dir() -> PathBuf {
        PathBuf::from("emails")
    }

    pub fn failed_dir() -> PathBuf {
        PathBuf::from("emails/failed")
    }

    pub const fn replay_interval_secs() -> u64 {
        3600 // 1 hour
    }

    pub const fn backlog_interval_secs() -> u64 {
        300 // 5 minutes
    }

    pub const fn backlog_threshold() -> usize {
        100
    }

    pub const fn worker_count() -> usize {
        5
    }

    pub const fn queue_capacity() -> usize {
        1000
    }

    pub const fn max_per_hour() -> usize {
        100
    }

    pub const fn max_per_day() -> usize {
        1000
    }

    pub const fn dns_timeout_secs() -> u64 {
        5
    }

    pub const fn min_cache_ttl_secs() -> u64 {
        60
    }

    pub const fn max_cache_ttl_secs() -> u64 {
        3600
    }
}
