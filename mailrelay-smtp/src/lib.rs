pub mod client;

pub use client::{AuthMechanism, ClientError, Response, SmtpClient};
