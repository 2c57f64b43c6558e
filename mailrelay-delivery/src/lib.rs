//! Outbound delivery pipeline for the relay
//!
//! This crate provides:
//! - Relay forwarding with priority failover, retries and recipient batching
//! - Direct delivery to each recipient domain's mail exchangers
//! - The dispatcher that sequences those paths and falls back to local storage
//! - Replay of failed-job records and backlog monitoring
//! - The worker pool that drains the job queue

mod backlog;
mod direct;
mod dispatcher;
mod dns;
mod error;
mod forwarder;
mod pool;
mod replay;
mod session;
mod strategy;
mod transport;
mod types;

pub use backlog::BacklogMonitor;
pub use direct::{DirectReport, DirectRouter};
pub use dispatcher::{Dispatcher, Disposition, Services};
pub use dns::{DnsError, DnsResolver, MailServer, MxResolver};
pub use error::DeliveryError;
pub use forwarder::ProviderForwarder;
pub use pool::{JobReport, PoolError, WorkerPool};
pub use replay::{ReplaySummary, ReplaySweep};
pub use session::SmtpSession;
pub use strategy::DeliveryStrategy;
pub use transport::{SmtpTransport, Transport};
pub use types::{DeliveryOutcome, Envelope, SessionReport, SessionTarget};
