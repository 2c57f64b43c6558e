//! Shared fixtures for the delivery integration tests

pub mod mock_server;

pub use mock_server::{MockSmtpServer, SmtpCommand};

/// A local port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
