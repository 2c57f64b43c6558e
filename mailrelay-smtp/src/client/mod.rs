//! Outbound SMTP client.
//!
//! Supports:
//!
//! - Plain TCP and implicit-TLS connections
//! - STARTTLS upgrade
//! - AUTH PLAIN and AUTH LOGIN
//! - Dot-stuffed DATA transfer of raw message bytes
//!
//! The client performs single protocol steps; sequencing a full delivery
//! session, and bounding each step with a timeout, is up to the caller.
//!
//! ```no_run
//! use mailrelay_smtp::SmtpClient;
//!
//! # async fn example() -> Result<(), mailrelay_smtp::ClientError> {
//! let mut client = SmtpClient::connect("relay.example.com:587", "relay.example.com").await?;
//! client.read_greeting().await?;
//! let ehlo = client.ehlo("client.example.com").await?;
//! if ehlo.supports("STARTTLS") {
//!     client.starttls().await?;
//!     client.ehlo("client.example.com").await?;
//! }
//! client.mail_from("sender@example.com").await?;
//! client.rcpt_to("recipient@example.org").await?;
//! client.data().await?;
//! client.send_data(b"Subject: Hi\r\n\r\nHello\r\n").await?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod data;
mod error;
mod response;
mod smtp_client;

pub use auth::AuthMechanism;
pub use data::dot_stuff;
pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::SmtpClient;
