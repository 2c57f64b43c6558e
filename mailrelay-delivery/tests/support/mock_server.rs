//! Scriptable SMTP server for delivery tests
//!
//! The server binds to `127.0.0.1:0`, answers every session from one shared
//! script, and records each command it receives so tests can assert on the
//! exact conversation:
#![allow(dead_code)] // Not every test binary uses every knob
//! - EHLO capabilities (AUTH, STARTTLS) and a refusable EHLO
//! - Per-recipient rejections
//! - AUTH PLAIN / LOGIN with a configurable final reply
//! - STARTTLS refusal, or acceptance followed by a dropped connection
//! - Refusing the first N connections with a 421 greeting
//! - Hanging up on QUIT without a reply

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

/// SMTP command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    StartTls,
    /// AUTH with the mechanism name
    Auth(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content as received, still dot-stuffed
    MessageContent(Vec<u8>),
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    message: String,
}

impl Reply {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartTlsBehaviour {
    NotOffered,
    Refuse,
    AcceptThenDrop,
}

#[derive(Clone)]
struct Script {
    capabilities: Vec<String>,
    refuse_ehlo: bool,
    starttls: StartTlsBehaviour,
    auth_reply: Reply,
    mail_from_reply: Reply,
    rejected_recipients: Vec<String>,
    data_end_reply: Reply,
    refuse_first_connections: usize,
    drop_on_quit: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            capabilities: vec!["mock.test".to_string(), "SIZE 10000".to_string()],
            refuse_ehlo: false,
            starttls: StartTlsBehaviour::NotOffered,
            auth_reply: Reply::new(235, "Authentication successful"),
            mail_from_reply: Reply::new(250, "OK"),
            rejected_recipients: Vec::new(),
            data_end_reply: Reply::new(250, "OK: Message accepted"),
            refuse_first_connections: 0,
            drop_on_quit: false,
        }
    }
}

impl Script {
    fn ehlo_bytes(&self) -> Vec<u8> {
        let mut lines = self.capabilities.clone();
        if self.starttls != StartTlsBehaviour::NotOffered {
            lines.push("STARTTLS".to_string());
        }

        let mut response = String::new();
        let last = lines.len() - 1;
        for (i, line) in lines.iter().enumerate() {
            let separator = if i == last { ' ' } else { '-' };
            let _ = write!(&mut response, "250{separator}{line}\r\n");
        }

        response.into_bytes()
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<RwLock<Vec<SmtpCommand>>>,
    connections: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            script: Script::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Every command received, across all sessions, in arrival order
    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands.read().await.clone()
    }

    /// The message bodies received
    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.commands
            .read()
            .await
            .iter()
            .filter_map(|cmd| match cmd {
                SmtpCommand::MessageContent(content) => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn record(commands: &RwLock<Vec<SmtpCommand>>, command: SmtpCommand) {
        commands.write().await.push(command);
    }

    #[allow(clippy::too_many_lines)]
    async fn handle_client(
        mut stream: TcpStream,
        connection: usize,
        script: Arc<Script>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        if connection < script.refuse_first_connections {
            writer
                .write_all(&Reply::new(421, "Service not available").to_bytes())
                .await?;
            writer.flush().await?;
            return Ok(());
        }

        writer
            .write_all(&Reply::new(220, "Mock SMTP Server").to_bytes())
            .await?;
        writer.flush().await?;

        loop {
            line.clear();
            let read = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await;
            let Ok(read) = read else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }

            let cmd_line = line.trim().to_string();
            let (verb, argument) = cmd_line
                .split_once(' ')
                .map_or((cmd_line.as_str(), ""), |(verb, rest)| (verb, rest));

            let response = match verb.to_uppercase().as_str() {
                "EHLO" => {
                    Self::record(&commands, SmtpCommand::Ehlo(argument.to_string())).await;
                    if script.refuse_ehlo {
                        Reply::new(502, "Command not implemented").to_bytes()
                    } else {
                        script.ehlo_bytes()
                    }
                }
                "HELO" => {
                    Self::record(&commands, SmtpCommand::Helo(argument.to_string())).await;
                    Reply::new(250, "Hello").to_bytes()
                }
                "STARTTLS" => {
                    Self::record(&commands, SmtpCommand::StartTls).await;
                    match script.starttls {
                        StartTlsBehaviour::AcceptThenDrop => {
                            writer
                                .write_all(&Reply::new(220, "Go ahead").to_bytes())
                                .await?;
                            writer.flush().await?;
                            return Ok(());
                        }
                        StartTlsBehaviour::Refuse => {
                            Reply::new(454, "TLS not available").to_bytes()
                        }
                        StartTlsBehaviour::NotOffered => {
                            Reply::new(502, "Command not implemented").to_bytes()
                        }
                    }
                }
                "AUTH" => {
                    let mechanism = argument
                        .split_whitespace()
                        .next()
                        .unwrap_or_default()
                        .to_uppercase();
                    Self::record(&commands, SmtpCommand::Auth(mechanism.clone())).await;

                    if mechanism == "LOGIN" {
                        for prompt in ["VXNlcm5hbWU6", "UGFzc3dvcmQ6"] {
                            writer
                                .write_all(&Reply::new(334, prompt).to_bytes())
                                .await?;
                            writer.flush().await?;
                            line.clear();
                            reader.read_line(&mut line).await?;
                        }
                    }

                    script.auth_reply.to_bytes()
                }
                "MAIL" => {
                    Self::record(&commands, SmtpCommand::MailFrom(argument.to_string())).await;
                    script.mail_from_reply.to_bytes()
                }
                "RCPT" => {
                    Self::record(&commands, SmtpCommand::RcptTo(argument.to_string())).await;
                    if script
                        .rejected_recipients
                        .iter()
                        .any(|rejected| argument.contains(rejected.as_str()))
                    {
                        Reply::new(550, "User unknown").to_bytes()
                    } else {
                        Reply::new(250, "OK").to_bytes()
                    }
                }
                "DATA" => {
                    Self::record(&commands, SmtpCommand::Data).await;
                    writer
                        .write_all(
                            &Reply::new(354, "Start mail input; end with <CRLF>.<CRLF>")
                                .to_bytes(),
                        )
                        .await?;
                    writer.flush().await?;

                    let mut content = Vec::new();
                    let mut data_line = String::new();
                    loop {
                        data_line.clear();
                        if reader.read_line(&mut data_line).await? == 0 {
                            return Ok(());
                        }
                        if data_line == ".\r\n" || data_line == ".\n" {
                            break;
                        }
                        content.extend_from_slice(data_line.as_bytes());
                    }

                    Self::record(&commands, SmtpCommand::MessageContent(content)).await;
                    script.data_end_reply.to_bytes()
                }
                "QUIT" => {
                    Self::record(&commands, SmtpCommand::Quit).await;
                    if script.drop_on_quit {
                        return Ok(());
                    }
                    writer.write_all(&Reply::new(221, "Bye").to_bytes()).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                _ => {
                    Self::record(&commands, SmtpCommand::Other(cmd_line.clone())).await;
                    Reply::new(500, "Unknown command").to_bytes()
                }
            };

            writer.write_all(&response).await?;
            writer.flush().await?;
        }
    }
}

pub struct MockSmtpServerBuilder {
    script: Script,
}

impl MockSmtpServerBuilder {
    /// Advertise `AUTH <mechanisms>` in the EHLO reply
    #[must_use]
    pub fn with_auth(mut self, mechanisms: &str) -> Self {
        self.script.capabilities.push(format!("AUTH {mechanisms}"));
        self
    }

    /// Final reply to AUTH
    #[must_use]
    pub fn with_auth_reply(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.auth_reply = Reply::new(code, message);
        self
    }

    /// Answer EHLO with 502 so the client must fall back to HELO
    #[must_use]
    pub const fn refusing_ehlo(mut self) -> Self {
        self.script.refuse_ehlo = true;
        self
    }

    /// Advertise STARTTLS but answer it with 454
    #[must_use]
    pub const fn refusing_starttls(mut self) -> Self {
        self.script.starttls = StartTlsBehaviour::Refuse;
        self
    }

    /// Advertise STARTTLS, accept it, then hang up instead of handshaking
    #[must_use]
    pub const fn dropping_after_starttls(mut self) -> Self {
        self.script.starttls = StartTlsBehaviour::AcceptThenDrop;
        self
    }

    #[must_use]
    pub fn with_mail_from_reply(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.mail_from_reply = Reply::new(code, message);
        self
    }

    /// Reject any RCPT whose argument contains `address`
    #[must_use]
    pub fn rejecting(mut self, address: impl Into<String>) -> Self {
        self.script.rejected_recipients.push(address.into());
        self
    }

    /// Reply sent after the terminating `.`
    #[must_use]
    pub fn with_data_end_reply(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.data_end_reply = Reply::new(code, message);
        self
    }

    /// Greet the first `count` connections with 421 and hang up
    #[must_use]
    pub const fn refusing_first_connections(mut self, count: usize) -> Self {
        self.script.refuse_first_connections = count;
        self
    }

    /// Close the connection on QUIT instead of answering 221
    #[must_use]
    pub const fn dropping_on_quit(mut self) -> Self {
        self.script.drop_on_quit = true;
        self
    }

    /// Bind and start serving
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind
    pub async fn build(self) -> Result<MockSmtpServer, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let commands_clone = Arc::clone(&commands);
        let connections_clone = Arc::clone(&connections);
        let shutdown_clone = Arc::clone(&shutdown);

        tokio::spawn(async move {
            while !shutdown_clone.load(Ordering::Relaxed) {
                let accepted = timeout(Duration::from_millis(100), listener.accept()).await;

                if let Ok(Ok((stream, _peer))) = accepted {
                    let connection = connections_clone.fetch_add(1, Ordering::SeqCst);
                    let script = Arc::clone(&script);
                    let commands = Arc::clone(&commands_clone);

                    tokio::spawn(async move {
                        if let Err(e) =
                            MockSmtpServer::handle_client(stream, connection, script, commands)
                                .await
                        {
                            tracing::debug!("Mock server client error: {e}");
                        }
                    });
                }
            }
        });

        Ok(MockSmtpServer {
            addr,
            commands,
            connections,
            shutdown,
        })
    }
}
