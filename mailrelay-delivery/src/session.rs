//! One complete SMTP transaction against one server.
//!
//! The session runs greeting, EHLO (falling back to HELO), opportunistic
//! STARTTLS, optional AUTH, MAIL, one RCPT per recipient, DATA and QUIT.
//! Every network step is bounded by its entry in [`SmtpTimeouts`].

use std::{future::Future, time::Duration};

use mailrelay_common::{
    address::summarize_recipients,
    config::{SmtpTimeouts, TlsMode},
    outgoing,
};
use mailrelay_smtp::{AuthMechanism, Response, SmtpClient, client::Result as ClientResult};

use crate::{
    error::DeliveryError,
    types::{Envelope, SessionReport, SessionTarget},
};

/// Runs `fut`, turning an elapsed `limit` into [`DeliveryError::Timeout`].
async fn step<T>(
    what: &str,
    limit: Duration,
    fut: impl Future<Output = ClientResult<T>>,
) -> Result<T, DeliveryError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| DeliveryError::Timeout(format!("{what} timed out after {limit:?}")))?
        .map_err(DeliveryError::from)
}

pub struct SmtpSession<'a> {
    target: &'a SessionTarget,
    timeouts: &'a SmtpTimeouts,
}

impl<'a> SmtpSession<'a> {
    pub const fn new(target: &'a SessionTarget, timeouts: &'a SmtpTimeouts) -> Self {
        Self { target, timeouts }
    }

    /// Delivers `envelope`.
    ///
    /// Individual recipient rejections are collected in the report; the
    /// session only fails on them when nobody was accepted.
    ///
    /// # Errors
    ///
    /// Any connection, protocol, authentication or timeout failure before the
    /// message was accepted. A failing QUIT is logged only.
    pub async fn execute(self, envelope: &Envelope<'_>) -> Result<SessionReport, DeliveryError> {
        let address = &self.target.address;

        if self.target.accept_invalid_certs {
            outgoing!(
                level = WARN,
                "TLS certificate validation is disabled for {address}"
            );
        }

        let (mut client, capabilities) = self.open().await?;
        self.authenticate(&mut client, &capabilities).await?;

        let mail = step(
            "MAIL FROM",
            self.timeouts.mail_from(),
            client.mail_from(envelope.from),
        )
        .await?;
        if !mail.is_success() {
            return Err(DeliveryError::Transient(format!(
                "{address} rejected sender {}: {} {}",
                envelope.from,
                mail.code,
                mail.message()
            )));
        }

        let report = self.declare_recipients(&mut client, envelope.to).await?;

        if report.accepted.is_empty() {
            self.quit(&mut client).await;
            return Err(DeliveryError::AllRecipientsRejected(format!(
                "{address} refused {}",
                summarize_recipients(envelope.to)
            )));
        }

        let data = step("DATA", self.timeouts.data(), client.data()).await?;
        if data.code != 354 {
            return Err(DeliveryError::Transient(format!(
                "{address} rejected DATA: {} {}",
                data.code,
                data.message()
            )));
        }

        let accepted = step(
            "message data",
            self.timeouts.data(),
            client.send_data(envelope.data),
        )
        .await?;
        if !accepted.is_success() {
            return Err(DeliveryError::Transient(format!(
                "{address} rejected message: {} {}",
                accepted.code,
                accepted.message()
            )));
        }

        outgoing!(
            level = INFO,
            "{address} accepted message for {}",
            summarize_recipients(&report.accepted)
        );

        self.quit(&mut client).await;

        Ok(report)
    }

    async fn connect_and_greet(&self) -> Result<SmtpClient, DeliveryError> {
        let SessionTarget {
            address,
            server_name,
            accept_invalid_certs,
            ..
        } = self.target;

        let connect = async {
            match self.target.tls {
                TlsMode::Implicit => {
                    SmtpClient::connect_tls(address, server_name.as_str(), *accept_invalid_certs)
                        .await
                }
                TlsMode::StartTls => SmtpClient::connect(address, server_name.as_str())
                    .await
                    .map(|client| client.accept_invalid_certs(*accept_invalid_certs)),
            }
        };

        let mut client = match step("connect", self.timeouts.connect(), connect).await {
            Ok(client) => client,
            Err(DeliveryError::Timeout(message)) => return Err(DeliveryError::Timeout(message)),
            Err(err) => {
                return Err(DeliveryError::ConnectionFailed(format!(
                    "Failed to connect to {address}: {err}"
                )));
            }
        };

        let greeting = step("greeting", self.timeouts.connect(), client.read_greeting()).await?;
        if !greeting.is_success() {
            return Err(DeliveryError::ConnectionFailed(format!(
                "{address} refused the session: {} {}",
                greeting.code,
                greeting.message()
            )));
        }

        Ok(client)
    }

    /// EHLO, or HELO when EHLO is refused. Returns the accepted reply.
    async fn hello(&self, client: &mut SmtpClient) -> Result<Response, DeliveryError> {
        let name = &self.target.ehlo_name;

        let ehlo = step("EHLO", self.timeouts.ehlo(), client.ehlo(name)).await?;
        if ehlo.is_success() {
            return Ok(ehlo);
        }

        outgoing!(
            level = DEBUG,
            "{} refused EHLO ({}), trying HELO",
            self.target.address,
            ehlo.code
        );

        let helo = step("HELO", self.timeouts.ehlo(), client.helo(name)).await?;
        if helo.is_success() {
            Ok(helo)
        } else {
            Err(DeliveryError::Transient(format!(
                "{} rejected EHLO and HELO: {} {}",
                self.target.address,
                helo.code,
                helo.message()
            )))
        }
    }

    /// Connects, greets and upgrades with STARTTLS when offered.
    ///
    /// A refused STARTTLS keeps the plaintext session. A failed handshake
    /// leaves the connection unusable, so a fresh plaintext session is opened
    /// and STARTTLS is not tried again.
    async fn open(&self) -> Result<(SmtpClient, Response), DeliveryError> {
        let address = &self.target.address;
        let mut client = self.connect_and_greet().await?;
        let capabilities = self.hello(&mut client).await?;

        if self.target.tls != TlsMode::StartTls || !capabilities.supports("STARTTLS") {
            return Ok((client, capabilities));
        }

        match step("STARTTLS", self.timeouts.starttls(), client.starttls()).await {
            Ok(reply) if reply.is_success() => {
                outgoing!(level = DEBUG, "Upgraded {address} to TLS");
                let capabilities = self.hello(&mut client).await?;
                Ok((client, capabilities))
            }
            Ok(reply) => {
                outgoing!(
                    level = INFO,
                    "{address} refused STARTTLS ({} {}), continuing unencrypted",
                    reply.code,
                    reply.message()
                );
                Ok((client, capabilities))
            }
            Err(err) => {
                outgoing!(
                    level = WARN,
                    "STARTTLS with {address} failed ({err}), reconnecting unencrypted"
                );
                drop(client);

                let mut client = self.connect_and_greet().await?;
                let capabilities = self.hello(&mut client).await?;
                Ok((client, capabilities))
            }
        }
    }

    async fn authenticate(
        &self,
        client: &mut SmtpClient,
        capabilities: &Response,
    ) -> Result<(), DeliveryError> {
        let Some((username, password)) = &self.target.credentials else {
            return Ok(());
        };

        let mechanism = AuthMechanism::choose(&capabilities.auth_mechanisms()).ok_or_else(|| {
            DeliveryError::AuthenticationFailed(format!(
                "{} offers no supported AUTH mechanism",
                self.target.address
            ))
        })?;

        step(
            "AUTH",
            self.timeouts.auth(),
            client.authenticate(mechanism, username, password.expose()),
        )
        .await
        .map_err(|err| match err {
            DeliveryError::Timeout(_) => err,
            other => DeliveryError::AuthenticationFailed(format!(
                "{} as {username}: {other}",
                self.target.address
            )),
        })?;

        outgoing!(
            level = DEBUG,
            "Authenticated to {} as {username} using {}",
            self.target.address,
            mechanism.name()
        );

        Ok(())
    }

    async fn declare_recipients(
        &self,
        client: &mut SmtpClient,
        recipients: &[String],
    ) -> Result<SessionReport, DeliveryError> {
        let mut report = SessionReport::default();

        for recipient in recipients {
            let reply = step("RCPT TO", self.timeouts.rcpt_to(), client.rcpt_to(recipient)).await?;

            if reply.is_success() {
                report.accepted.push(recipient.clone());
            } else {
                outgoing!(
                    level = WARN,
                    "{} rejected recipient {recipient}: {} {}",
                    self.target.address,
                    reply.code,
                    reply.message()
                );
                report
                    .rejected
                    .push((recipient.clone(), reply.code, reply.message()));
            }
        }

        Ok(report)
    }

    async fn quit(&self, client: &mut SmtpClient) {
        match tokio::time::timeout(self.timeouts.quit(), client.quit()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                outgoing!(
                    level = DEBUG,
                    "QUIT to {} failed: {err}",
                    self.target.address
                );
            }
            Err(_) => {
                outgoing!(
                    level = DEBUG,
                    "QUIT to {} timed out",
                    self.target.address
                );
            }
        }
    }
}
