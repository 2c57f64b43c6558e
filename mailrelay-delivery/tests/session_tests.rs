//! SMTP sessions and relay forwarding against a scripted server
#![allow(clippy::unwrap_used)]

mod support;

use std::sync::Arc;

use mailrelay_common::config::{BatchConfig, ProviderEndpoint, RetryConfig, Secret, SmtpTimeouts};
use mailrelay_delivery::{
    DeliveryError, Envelope, ProviderForwarder, SessionReport, SessionTarget, SmtpSession,
    SmtpTransport,
};
use pretty_assertions::assert_eq;
use support::{MockSmtpServer, SmtpCommand, closed_port};

const MESSAGE: &[u8] = b"Subject: hi\r\n\r\n.leading dot\r\nbody\r\n";

fn target(server: &MockSmtpServer) -> SessionTarget {
    SessionTarget::relay(
        &ProviderEndpoint::new("127.0.0.1", server.addr().port()),
        "client.test",
    )
}

fn recipients(list: &[&str]) -> Vec<String> {
    list.iter().map(ToString::to_string).collect()
}

async fn run(target: &SessionTarget, to: &[String]) -> Result<SessionReport, DeliveryError> {
    let timeouts = SmtpTimeouts::default();
    let envelope = Envelope {
        from: "sender@client.test",
        to,
        data: MESSAGE,
    };

    SmtpSession::new(target, &timeouts).execute(&envelope).await
}

#[tokio::test]
async fn test_session_follows_smtp_order() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let to = recipients(&["rcpt@example.org"]);

    let report = run(&target(&server), &to).await.unwrap();

    assert_eq!(report.accepted, to);
    assert_eq!(
        server.commands().await,
        vec![
            SmtpCommand::Ehlo("client.test".into()),
            SmtpCommand::MailFrom("FROM:<sender@client.test>".into()),
            SmtpCommand::RcptTo("TO:<rcpt@example.org>".into()),
            SmtpCommand::Data,
            SmtpCommand::MessageContent(
                b"Subject: hi\r\n\r\n..leading dot\r\nbody\r\n".to_vec()
            ),
            SmtpCommand::Quit,
        ]
    );
}

#[tokio::test]
async fn test_partial_rejection_still_delivers() {
    let server = MockSmtpServer::builder()
        .rejecting("bad@example.org")
        .build()
        .await
        .unwrap();
    let to = recipients(&["good@example.org", "bad@example.org"]);

    let report = run(&target(&server), &to).await.unwrap();

    assert_eq!(report.accepted, ["good@example.org"]);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].0, "bad@example.org");
    assert_eq!(report.rejected[0].1, 550);
    assert_eq!(server.messages().await.len(), 1);
}

#[tokio::test]
async fn test_teardown_failure_after_accepted_data_is_success() {
    let server = MockSmtpServer::builder()
        .dropping_on_quit()
        .build()
        .await
        .unwrap();
    let to = recipients(&["rcpt@example.org"]);

    let report = run(&target(&server), &to).await.unwrap();

    assert_eq!(report.accepted, to);
    assert_eq!(server.messages().await.len(), 1);
    assert_eq!(server.commands().await.last(), Some(&SmtpCommand::Quit));
}

#[tokio::test]
async fn test_all_recipients_rejected_fails_without_data() {
    let server = MockSmtpServer::builder()
        .rejecting("@example.org")
        .build()
        .await
        .unwrap();
    let to = recipients(&["a@example.org", "b@example.org"]);

    let err = run(&target(&server), &to).await.unwrap_err();

    assert!(matches!(err, DeliveryError::AllRecipientsRejected(_)));
    let commands = server.commands().await;
    assert!(!commands.contains(&SmtpCommand::Data));
    assert_eq!(commands.last(), Some(&SmtpCommand::Quit));
}

#[tokio::test]
async fn test_auth_prefers_plain() {
    let server = MockSmtpServer::builder()
        .with_auth("LOGIN PLAIN")
        .build()
        .await
        .unwrap();
    let mut target = target(&server);
    target.credentials = Some(("user".into(), Secret::new("pw")));

    run(&target, &recipients(&["rcpt@example.org"])).await.unwrap();

    assert!(
        server
            .commands()
            .await
            .contains(&SmtpCommand::Auth("PLAIN".into()))
    );
}

#[tokio::test]
async fn test_auth_login_when_only_login_offered() {
    let server = MockSmtpServer::builder()
        .with_auth("LOGIN")
        .build()
        .await
        .unwrap();
    let mut target = target(&server);
    target.credentials = Some(("user".into(), Secret::new("pw")));

    run(&target, &recipients(&["rcpt@example.org"])).await.unwrap();

    assert!(
        server
            .commands()
            .await
            .contains(&SmtpCommand::Auth("LOGIN".into()))
    );
    assert_eq!(server.messages().await.len(), 1);
}

#[tokio::test]
async fn test_rejected_credentials_are_an_auth_failure() {
    let server = MockSmtpServer::builder()
        .with_auth("PLAIN")
        .with_auth_reply(535, "Authentication credentials invalid")
        .build()
        .await
        .unwrap();
    let mut target = target(&server);
    target.credentials = Some(("user".into(), Secret::new("bad")));

    let err = run(&target, &recipients(&["rcpt@example.org"]))
        .await
        .unwrap_err();

    assert!(matches!(err, DeliveryError::AuthenticationFailed(_)));
}

#[tokio::test]
async fn test_helo_fallback() {
    let server = MockSmtpServer::builder()
        .refusing_ehlo()
        .build()
        .await
        .unwrap();

    run(&target(&server), &recipients(&["rcpt@example.org"]))
        .await
        .unwrap();

    let commands = server.commands().await;
    assert_eq!(commands[0], SmtpCommand::Ehlo("client.test".into()));
    assert_eq!(commands[1], SmtpCommand::Helo("client.test".into()));
    assert_eq!(server.messages().await.len(), 1);
}

#[tokio::test]
async fn test_refused_starttls_continues_in_plaintext() {
    let server = MockSmtpServer::builder()
        .refusing_starttls()
        .build()
        .await
        .unwrap();

    run(&target(&server), &recipients(&["rcpt@example.org"]))
        .await
        .unwrap();

    assert!(server.commands().await.contains(&SmtpCommand::StartTls));
    assert_eq!(server.connections(), 1);
    assert_eq!(server.messages().await.len(), 1);
}

#[tokio::test]
async fn test_failed_handshake_reconnects_without_starttls() {
    let server = MockSmtpServer::builder()
        .dropping_after_starttls()
        .build()
        .await
        .unwrap();

    run(&target(&server), &recipients(&["rcpt@example.org"]))
        .await
        .unwrap();

    let starttls_count = server
        .commands()
        .await
        .iter()
        .filter(|cmd| **cmd == SmtpCommand::StartTls)
        .count();
    assert_eq!(starttls_count, 1);
    assert_eq!(server.connections(), 2);
    assert_eq!(server.messages().await.len(), 1);
}

#[tokio::test]
async fn test_refused_greeting_is_a_connection_failure() {
    let server = MockSmtpServer::builder()
        .refusing_first_connections(1)
        .build()
        .await
        .unwrap();

    let err = run(&target(&server), &recipients(&["rcpt@example.org"]))
        .await
        .unwrap_err();

    assert!(matches!(err, DeliveryError::ConnectionFailed(_)));
    assert!(err.is_retryable());
}

fn forwarder(attempts: u32) -> ProviderForwarder {
    ProviderForwarder::new(
        Arc::new(SmtpTransport::default()),
        RetryConfig {
            attempts,
            initial_backoff_ms: 10,
        },
        BatchConfig {
            size: 2,
            delay_ms: 10,
        },
    )
}

#[tokio::test]
async fn test_forwarder_fails_over_to_next_provider() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let providers = vec![
        ProviderEndpoint::new("127.0.0.1", closed_port().await).with_priority(1),
        ProviderEndpoint::new("127.0.0.1", server.addr().port()).with_priority(2),
    ];

    let report = forwarder(2)
        .forward(
            &providers,
            "sender@client.test",
            &recipients(&["rcpt@example.org"]),
            MESSAGE,
        )
        .await
        .unwrap();

    assert_eq!(report.accepted, ["rcpt@example.org"]);
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn test_forwarder_retries_the_same_provider() {
    let server = MockSmtpServer::builder()
        .refusing_first_connections(1)
        .build()
        .await
        .unwrap();
    let providers = vec![ProviderEndpoint::new("127.0.0.1", server.addr().port())];

    forwarder(3)
        .forward(
            &providers,
            "sender@client.test",
            &recipients(&["rcpt@example.org"]),
            MESSAGE,
        )
        .await
        .unwrap();

    assert_eq!(server.connections(), 2);
    assert_eq!(server.messages().await.len(), 1);
}

#[tokio::test]
async fn test_forwarder_sends_batches_as_separate_sessions() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let providers = vec![ProviderEndpoint::new("127.0.0.1", server.addr().port())];
    let to = recipients(&["a@x.test", "b@x.test", "c@x.test", "d@x.test", "e@x.test"]);

    let report = forwarder(1)
        .forward(&providers, "sender@client.test", &to, MESSAGE)
        .await
        .unwrap();

    assert_eq!(report.accepted, to);
    assert_eq!(server.connections(), 3);
    assert_eq!(server.messages().await.len(), 3);

    let rcpts: Vec<_> = server
        .commands()
        .await
        .into_iter()
        .filter_map(|cmd| match cmd {
            SmtpCommand::RcptTo(arg) => Some(arg),
            _ => None,
        })
        .collect();
    assert_eq!(
        rcpts,
        to.iter().map(|r| format!("TO:<{r}>")).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_forwarder_reports_last_error_when_exhausted() {
    let providers = vec![
        ProviderEndpoint::new("127.0.0.1", closed_port().await),
        ProviderEndpoint::new("127.0.0.1", closed_port().await),
    ];

    let err = forwarder(1)
        .forward(
            &providers,
            "sender@client.test",
            &recipients(&["rcpt@example.org"]),
            MESSAGE,
        )
        .await
        .unwrap_err();

    match err {
        DeliveryError::ProvidersExhausted { last } => {
            assert!(matches!(*last, DeliveryError::ConnectionFailed(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}
