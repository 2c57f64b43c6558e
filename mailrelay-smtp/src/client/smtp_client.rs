//! SMTP client with plain, implicit-TLS and STARTTLS transports.

use std::sync::Arc;

use mailrelay_common::outgoing;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};

use super::{
    auth::{self, AuthMechanism},
    data::dot_stuff,
    error::{ClientError, Result},
    response::Response,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn upgrade_to_tls(self, domain: &str, accept_invalid_certs: bool) -> Result<Self> {
        match self {
            Self::Plain(stream) => Ok(Self::Tls(Box::new(
                handshake(stream, domain, accept_invalid_certs).await?,
            ))),
            Self::Tls(_) => Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            )),
        }
    }
}

fn tls_connector(accept_invalid_certs: bool) -> Result<TlsConnector> {
    let mut root_store = RootCertStore::empty();

    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        root_store
            .add(cert)
            .map_err(|e| ClientError::TlsError(format!("Failed to add certificate: {e}")))?;
    }
    if !certs.errors.is_empty() {
        tracing::warn!(?certs.errors, "Some certificates could not be loaded");
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if accept_invalid_certs {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(danger::NoVerifier));
    }

    Ok(TlsConnector::from(Arc::new(config)))
}

async fn handshake(
    stream: TcpStream,
    domain: &str,
    accept_invalid_certs: bool,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let connector = tls_connector(accept_invalid_certs)?;
    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ClientError::TlsError(e.to_string()))
}

mod danger {
    use tokio_rustls::rustls::{
        DigitallySignedStruct, Error, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    };

    /// Accepts any certificate. Only installed when verification is
    /// explicitly switched off.
    #[derive(Debug)]
    pub(super) struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ED25519,
            ]
        }
    }
}

/// A single outbound SMTP connection.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_domain: String,
    accept_invalid_certs: bool,
}

impl SmtpClient {
    fn from_connection(connection: ClientConnection, server_domain: String) -> Self {
        Self {
            connection: Some(connection),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_domain,
            accept_invalid_certs: false,
        }
    }

    /// Opens a plaintext connection to `addr` (`host:port`).
    ///
    /// `server_domain` is the name certificates are checked against if the
    /// session is later upgraded with STARTTLS.
    pub async fn connect(addr: &str, server_domain: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_connection(
            ClientConnection::Plain(stream),
            server_domain.into(),
        ))
    }

    /// Opens a connection that is TLS from the first byte (implicit TLS).
    pub async fn connect_tls(
        addr: &str,
        server_domain: impl Into<String>,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let server_domain = server_domain.into();
        let stream = TcpStream::connect(addr).await?;
        let tls = handshake(stream, &server_domain, accept_invalid_certs).await?;

        let mut client =
            Self::from_connection(ClientConnection::Tls(Box::new(tls)), server_domain);
        client.accept_invalid_certs = accept_invalid_certs;
        Ok(client)
    }

    /// Whether certificate verification is skipped on a STARTTLS upgrade.
    ///
    /// Default is `false`.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Reads the initial server greeting.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Sends one command line; CRLF is appended.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        outgoing!("C: {command}");
        self.send_raw(format!("{command}\r\n").as_bytes()).await
    }

    async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(data)
            .await
    }

    /// Sends a command and reads its reply.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_command(command).await?;
        self.read_response().await
    }

    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await
    }

    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("HELO {domain}")).await
    }

    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>")).await
    }

    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Sends the message body after a 354 reply to `DATA` and reads the
    /// final reply.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<Response> {
        outgoing!("C: <{} bytes of message data>", data.len());
        self.send_raw(&dot_stuff(data)).await?;
        self.read_response().await
    }

    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Sends STARTTLS and, on a 2xx reply, upgrades the connection.
    ///
    /// If the handshake itself fails the connection is gone and the client
    /// must be discarded.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;

        if response.is_success() {
            let old_connection = self.connection.take().ok_or(ClientError::ConnectionClosed)?;
            self.buffer_pos = 0;
            self.connection = Some(
                old_connection
                    .upgrade_to_tls(&self.server_domain, self.accept_invalid_certs)
                    .await?,
            );
        }

        Ok(response)
    }

    /// Authenticates with `mechanism`, returning the final reply.
    ///
    /// A non-2xx final reply is returned as [`ClientError::SmtpError`].
    pub async fn authenticate(
        &mut self,
        mechanism: AuthMechanism,
        username: &str,
        password: &str,
    ) -> Result<Response> {
        match mechanism {
            AuthMechanism::Plain => {
                outgoing!("C: AUTH PLAIN <credentials>");
                let line = format!(
                    "AUTH PLAIN {}\r\n",
                    auth::plain_initial_response(username, password)
                );
                self.send_raw(line.as_bytes()).await?;
                self.read_response().await?.ensure_success()
            }
            AuthMechanism::Login => {
                let challenge = self.command("AUTH LOGIN").await?;
                if challenge.code != 334 {
                    return Err(challenge.into_error());
                }

                outgoing!("C: <username>");
                self.send_raw(format!("{}\r\n", auth::encode(username)).as_bytes())
                    .await?;
                let challenge = self.read_response().await?;
                if challenge.code != 334 {
                    return Err(challenge.into_error());
                }

                outgoing!("C: <password>");
                self.send_raw(format!("{}\r\n", auth::encode(password)).as_bytes())
                    .await?;
                self.read_response().await?.ensure_success()
            }
        }
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                outgoing!("S: {} {}", response.code, response.message());
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}
