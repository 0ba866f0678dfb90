//! SMTP prober against an in-process scripted server. Covers the RCPT
//! code mapping, multiline EHLO replies, pre-RCPT rejections, and the
//! port-blocked preflight path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use verifier_service::behavior::NullBehaviorSink;
use verifier_service::smtp::{ProbeCategory, SmtpIdentity, SmtpProber, SmtpTimeouts};

struct MockSmtp {
    /// Reply sent to RCPT TO.
    rcpt_reply: &'static str,
    /// Reply sent to MAIL FROM.
    mail_reply: &'static str,
    /// Greeting banner.
    greeting: &'static str,
}

impl Default for MockSmtp {
    fn default() -> Self {
        Self {
            rcpt_reply: "250 2.1.5 OK",
            mail_reply: "250 2.1.0 Sender OK",
            greeting: "220 mx.fixture.test ESMTP",
        }
    }
}

/// Serve exactly one SMTP conversation, then exit.
async fn spawn_mock(script: MockSmtp) -> SocketAddr {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        // The prober preflights with a bare connect before conversing.
        let (preflight, _) = listener.accept().await.unwrap();
        drop(preflight);

        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        reader
            .write_all(format!("{}\r\n", script.greeting).as_bytes())
            .await
            .unwrap();
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let upper = line.trim().to_uppercase();
            let reply = if upper.starts_with("EHLO") {
                "250-mx.fixture.test\r\n250-PIPELINING\r\n250 SIZE 35882577".to_string()
            } else if upper.starts_with("HELO") {
                "250 mx.fixture.test".to_string()
            } else if upper.starts_with("MAIL FROM") {
                script.mail_reply.to_string()
            } else if upper.starts_with("RCPT TO") {
                script.rcpt_reply.to_string()
            } else if upper.starts_with("QUIT") {
                reader.write_all(b"221 bye\r\n").await.ok();
                break;
            } else {
                "502 unimplemented".to_string()
            };
            reader
                .write_all(format!("{reply}\r\n").as_bytes())
                .await
                .unwrap();
        }
    });
    addr
}

fn prober(port: u16) -> SmtpProber {
    SmtpProber::new(
        SmtpIdentity {
            helo_domain: "probe.fixture.test".to_string(),
            mail_from: "bounce@probe.fixture.test".to_string(),
        },
        SmtpTimeouts {
            preflight: Duration::from_millis(800),
            connect: Duration::from_secs(2),
            command: Duration::from_secs(2),
        },
        port,
        Arc::new(NullBehaviorSink),
    )
    .unwrap()
}

#[tokio::test]
async fn rcpt_250_is_accept() {
    let addr = spawn_mock(MockSmtp::default()).await;
    let outcome = prober(addr.port()).probe("jane.doe@example.com", "127.0.0.1").await;
    assert_eq!(outcome.category, ProbeCategory::Accept);
    assert_eq!(outcome.code, Some(250));
    assert!(outcome.error.is_none());
    assert!(outcome.elapsed_ms < 5_000);
}

#[tokio::test]
async fn rcpt_200_is_still_accept() {
    let addr = spawn_mock(MockSmtp { rcpt_reply: "200 unusual but fine", ..Default::default() }).await;
    let outcome = prober(addr.port()).probe("jane.doe@example.com", "127.0.0.1").await;
    assert_eq!(outcome.category, ProbeCategory::Accept);
    assert_eq!(outcome.code, Some(200));
}

#[tokio::test]
async fn rcpt_550_is_hard_fail() {
    let addr = spawn_mock(MockSmtp {
        rcpt_reply: "550 5.1.1 user unknown",
        ..Default::default()
    })
    .await;
    let outcome = prober(addr.port()).probe("ghost@example.com", "127.0.0.1").await;
    assert_eq!(outcome.category, ProbeCategory::HardFail);
    assert_eq!(outcome.code, Some(550));
    assert!(outcome.message.contains("user unknown"));
}

#[tokio::test]
async fn rcpt_450_is_temp_fail() {
    let addr = spawn_mock(MockSmtp {
        rcpt_reply: "450 4.2.0 greylisted, try later",
        ..Default::default()
    })
    .await;
    let outcome = prober(addr.port()).probe("jane@example.com", "127.0.0.1").await;
    assert_eq!(outcome.category, ProbeCategory::TempFail);
    assert_eq!(outcome.code, Some(450));
}

#[tokio::test]
async fn mail_from_rejection_degrades_to_unknown() {
    let addr = spawn_mock(MockSmtp {
        mail_reply: "554 5.7.1 sender refused",
        ..Default::default()
    })
    .await;
    let outcome = prober(addr.port()).probe("jane@example.com", "127.0.0.1").await;
    assert_eq!(outcome.category, ProbeCategory::Unknown);
    assert_eq!(outcome.error.as_deref(), Some("mail_from_rejected"));
}

#[tokio::test]
async fn busy_greeting_is_temp_fail() {
    let addr = spawn_mock(MockSmtp {
        greeting: "421 4.3.2 service shutting down",
        ..Default::default()
    })
    .await;
    let outcome = prober(addr.port()).probe("jane@example.com", "127.0.0.1").await;
    assert_eq!(outcome.category, ProbeCategory::TempFail);
    assert_eq!(outcome.code, Some(421));
}

#[tokio::test]
async fn closed_port_is_tcp25_blocked() {
    // Bind and immediately drop to get a port with no listener.
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let outcome = prober(port).probe("anyone@blockedmx.test", "127.0.0.1").await;
    assert_eq!(outcome.category, ProbeCategory::Unknown);
    assert_eq!(outcome.error.as_deref(), Some("tcp25_blocked"));
}
