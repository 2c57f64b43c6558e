pub mod address;
pub mod config;
pub mod job;
pub mod logging;

pub use job::{JobError, MailJob};
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
