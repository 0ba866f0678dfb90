//! The RCPT probe: TCP preflight, EHLO, opportunistic STARTTLS, MAIL FROM,
//! RCPT TO. DATA is never issued. The final RCPT reply is the signal;
//! everything else is plumbing that degrades to `unknown`.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::behavior::{BehaviorHint, BehaviorSink};

#[derive(Debug, Clone)]
pub struct SmtpIdentity {
    /// Domain presented at EHLO; must have matching PTR/SPF.
    pub helo_domain: String,
    /// Return-path used for MAIL FROM, conventionally `bounce@{helo_domain}`.
    pub mail_from: String,
}

#[derive(Debug, Clone, Copy)]
pub struct SmtpTimeouts {
    pub preflight: Duration,
    pub connect: Duration,
    pub command: Duration,
}

impl SmtpTimeouts {
    /// Tarpit hosts get shorter command patience, well-behaved hosts more.
    pub fn adjusted(&self, hint: &BehaviorHint) -> Self {
        let scale: f64 = if hint.tarpit {
            0.5
        } else if hint.fast {
            1.5
        } else {
            1.0
        };
        Self {
            preflight: self.preflight,
            connect: self.connect.mul_f64(scale.min(1.0).max(0.5)),
            command: self.command.mul_f64(scale),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeCategory {
    Accept,
    HardFail,
    TempFail,
    Unknown,
}

impl ProbeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeCategory::Accept => "accept",
            ProbeCategory::HardFail => "hard_fail",
            ProbeCategory::TempFail => "temp_fail",
            ProbeCategory::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub category: ProbeCategory,
    pub code: Option<u16>,
    pub message: String,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

impl ProbeOutcome {
    fn unknown(error: &str) -> Self {
        Self {
            category: ProbeCategory::Unknown,
            code: None,
            message: String::new(),
            elapsed_ms: 0,
            error: Some(error.to_string()),
        }
    }
}

/// One SMTP reply, possibly multiline.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    /// Only the reply to RCPT decides mailbox existence: any 2xx is accept
    /// (a nonstandard 200 counts), 5xx is a hard reject, 4xx is transient.
    pub fn rcpt_category(&self) -> ProbeCategory {
        match self.code {
            200..=299 => ProbeCategory::Accept,
            500..=599 => ProbeCategory::HardFail,
            400..=499 => ProbeCategory::TempFail,
            _ => ProbeCategory::Unknown,
        }
    }

    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn offers_starttls(&self) -> bool {
        self.lines.iter().any(|l| l.eq_ignore_ascii_case("starttls"))
    }

    pub fn text(&self) -> String {
        self.lines.join("; ")
    }
}

/// `"250-STARTTLS"` -> `(250, true, "STARTTLS")`; `"250 OK"` -> `(250, false, "OK")`.
pub fn parse_reply_line(line: &str) -> Option<(u16, bool, String)> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.len() < 3 {
        return None;
    }
    let code: u16 = line.get(0..3)?.parse().ok()?;
    let more = matches!(line.as_bytes().get(3), Some(b'-'));
    let text = line.get(4..).unwrap_or("").trim().to_string();
    Some((code, more, text))
}

enum Wire {
    Plain(BufReader<TcpStream>),
    Tls(BufReader<tokio_native_tls::TlsStream<TcpStream>>),
}

#[derive(Debug)]
enum ConvoError {
    Timeout,
    Closed,
    Io(String),
    Tls(String),
}

impl ConvoError {
    fn label(&self) -> String {
        match self {
            ConvoError::Timeout => "timeout".to_string(),
            ConvoError::Closed => "connection_closed".to_string(),
            ConvoError::Io(e) => format!("io: {e}"),
            ConvoError::Tls(e) => format!("tls_handshake_failed: {e}"),
        }
    }
}

impl Wire {
    async fn send(&mut self, command: &str) -> Result<(), ConvoError> {
        let line = format!("{command}\r\n");
        let res = match self {
            Wire::Plain(s) => s.write_all(line.as_bytes()).await.and(s.flush().await),
            Wire::Tls(s) => s.write_all(line.as_bytes()).await.and(s.flush().await),
        };
        res.map_err(|e| ConvoError::Io(e.to_string()))
    }

    async fn read_reply(&mut self, patience: Duration) -> Result<Reply, ConvoError> {
        let mut code = 0u16;
        let mut lines = Vec::new();
        for _ in 0..64 {
            let mut raw = String::new();
            let read = match self {
                Wire::Plain(s) => timeout(patience, s.read_line(&mut raw)).await,
                Wire::Tls(s) => timeout(patience, s.read_line(&mut raw)).await,
            };
            let n = read
                .map_err(|_| ConvoError::Timeout)?
                .map_err(|e| ConvoError::Io(e.to_string()))?;
            if n == 0 {
                return Err(ConvoError::Closed);
            }
            let Some((line_code, more, text)) = parse_reply_line(&raw) else {
                return Err(ConvoError::Io(format!("unparseable reply: {raw:?}")));
            };
            code = line_code;
            lines.push(text);
            if !more {
                return Ok(Reply { code, lines });
            }
        }
        Err(ConvoError::Io(format!("reply too long (code {code})")))
    }
}

pub struct SmtpProber {
    identity: SmtpIdentity,
    timeouts: SmtpTimeouts,
    port: u16,
    tls: tokio_native_tls::TlsConnector,
    behavior: Arc<dyn BehaviorSink>,
}

impl SmtpProber {
    pub fn new(
        identity: SmtpIdentity,
        timeouts: SmtpTimeouts,
        port: u16,
        behavior: Arc<dyn BehaviorSink>,
    ) -> anyhow::Result<Self> {
        // Opportunistic TLS: an invalid certificate still beats plaintext,
        // and verification servers routinely present self-signed certs.
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?;
        Ok(Self {
            identity,
            timeouts,
            port,
            tls: tokio_native_tls::TlsConnector::from(tls),
            behavior,
        })
    }

    /// Probe one recipient on one MX host. Never sends DATA.
    pub async fn probe(&self, email: &str, mx_host: &str) -> ProbeOutcome {
        let started = Instant::now();
        let hint = self.behavior.hint(mx_host).await;
        let timeouts = self.timeouts.adjusted(&hint);

        let preflight = timeout(
            timeouts.preflight,
            TcpStream::connect((mx_host, self.port)),
        )
        .await;
        match preflight {
            Ok(Ok(stream)) => drop(stream),
            Ok(Err(_)) | Err(_) => {
                let mut outcome = ProbeOutcome::unknown("tcp25_blocked");
                outcome.elapsed_ms = started.elapsed().as_millis() as u64;
                self.record(mx_host, &outcome).await;
                return outcome;
            }
        }

        let mut outcome = match self.converse(email, mx_host, &timeouts).await {
            Ok(outcome) => outcome,
            Err(e) => ProbeOutcome::unknown(&e.label()),
        };
        outcome.elapsed_ms = started.elapsed().as_millis() as u64;
        self.record(mx_host, &outcome).await;
        outcome
    }

    async fn record(&self, mx_host: &str, outcome: &ProbeOutcome) {
        self.behavior
            .record_probe(
                mx_host,
                outcome.elapsed_ms,
                outcome.code,
                outcome.category.as_str(),
                outcome.error.as_deref(),
            )
            .await;
    }

    async fn converse(
        &self,
        email: &str,
        mx_host: &str,
        timeouts: &SmtpTimeouts,
    ) -> Result<ProbeOutcome, ConvoError> {
        let stream = timeout(timeouts.connect, TcpStream::connect((mx_host, self.port)))
            .await
            .map_err(|_| ConvoError::Timeout)?
            .map_err(|e| ConvoError::Io(e.to_string()))?;
        let mut wire = Wire::Plain(BufReader::new(stream));

        let greeting = wire.read_reply(timeouts.command).await?;
        if !greeting.is_positive() {
            return Ok(early_exit(&greeting, "greeting_rejected"));
        }

        let mut ehlo = wire.send_ehlo(&self.identity.helo_domain, timeouts).await?;
        if !ehlo.is_positive() {
            // Ancient servers that only speak HELO.
            wire.send(&format!("HELO {}", self.identity.helo_domain)).await?;
            let helo = wire.read_reply(timeouts.command).await?;
            if !helo.is_positive() {
                return Ok(early_exit(&helo, "helo_rejected"));
            }
            ehlo = helo;
        }

        if ehlo.offers_starttls() {
            wire.send("STARTTLS").await?;
            let go_ahead = wire.read_reply(timeouts.command).await?;
            if go_ahead.code == 220 {
                wire = self.upgrade(wire, mx_host, timeouts).await?;
                let resecured = wire.send_ehlo(&self.identity.helo_domain, timeouts).await?;
                if !resecured.is_positive() {
                    return Ok(early_exit(&resecured, "ehlo_after_tls_rejected"));
                }
            } else {
                debug!(%mx_host, code = go_ahead.code, "STARTTLS declined, continuing plaintext");
            }
        }

        wire.send(&format!("MAIL FROM:<{}>", self.identity.mail_from)).await?;
        let mail = wire.read_reply(timeouts.command).await?;
        if !mail.is_positive() {
            return Ok(early_exit(&mail, "mail_from_rejected"));
        }

        wire.send(&format!("RCPT TO:<{email}>")).await?;
        let rcpt = wire.read_reply(timeouts.command).await?;

        wire.send("QUIT").await.ok();

        Ok(ProbeOutcome {
            category: rcpt.rcpt_category(),
            code: Some(rcpt.code),
            message: rcpt.text(),
            elapsed_ms: 0,
            error: None,
        })
    }

    async fn upgrade(
        &self,
        wire: Wire,
        mx_host: &str,
        _timeouts: &SmtpTimeouts,
    ) -> Result<Wire, ConvoError> {
        let Wire::Plain(buf) = wire else {
            return Err(ConvoError::Tls("already upgraded".to_string()));
        };
        let stream = buf.into_inner();
        let tls_stream = self
            .tls
            .connect(mx_host, stream)
            .await
            .map_err(|e| ConvoError::Tls(e.to_string()))?;
        Ok(Wire::Tls(BufReader::new(tls_stream)))
    }
}

impl Wire {
    async fn send_ehlo(
        &mut self,
        helo_domain: &str,
        timeouts: &SmtpTimeouts,
    ) -> Result<Reply, ConvoError> {
        self.send(&format!("EHLO {helo_domain}")).await?;
        self.read_reply(timeouts.command).await
    }
}

/// Pre-RCPT rejections cannot prove anything about the mailbox: 4xx is a
/// transient server condition, anything else degrades to unknown.
fn early_exit(reply: &Reply, stage: &str) -> ProbeOutcome {
    let category = match reply.code {
        400..=499 => ProbeCategory::TempFail,
        _ => ProbeCategory::Unknown,
    };
    ProbeOutcome {
        category,
        code: Some(reply.code),
        message: reply.text(),
        elapsed_ms: 0,
        error: Some(stage.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_and_multiline_markers() {
        assert_eq!(
            parse_reply_line("250 OK\r\n"),
            Some((250, false, "OK".to_string()))
        );
        assert_eq!(
            parse_reply_line("250-STARTTLS\r\n"),
            Some((250, true, "STARTTLS".to_string()))
        );
        assert_eq!(parse_reply_line("250"), Some((250, false, String::new())));
        assert_eq!(parse_reply_line("xy"), None);
        assert_eq!(parse_reply_line("abc def"), None);
    }

    #[test]
    fn rcpt_mapping_follows_reply_class() {
        let reply = |code| Reply { code, lines: vec![] };
        assert_eq!(reply(250).rcpt_category(), ProbeCategory::Accept);
        // Nonstandard but seen in the wild: 200 to RCPT is still a 2xx accept.
        assert_eq!(reply(200).rcpt_category(), ProbeCategory::Accept);
        assert_eq!(reply(550).rcpt_category(), ProbeCategory::HardFail);
        assert_eq!(reply(451).rcpt_category(), ProbeCategory::TempFail);
        assert_eq!(reply(354).rcpt_category(), ProbeCategory::Unknown);
    }

    #[test]
    fn starttls_capability_detection() {
        let reply = Reply {
            code: 250,
            lines: vec!["mx.example.com".into(), "PIPELINING".into(), "StartTLS".into()],
        };
        assert!(reply.offers_starttls());
        let no_tls = Reply { code: 250, lines: vec!["mx.example.com".into()] };
        assert!(!no_tls.offers_starttls());
    }

    #[test]
    fn tarpit_hint_shrinks_command_timeout() {
        let base = SmtpTimeouts {
            preflight: Duration::from_millis(1500),
            connect: Duration::from_secs(8),
            command: Duration::from_secs(20),
        };
        let tarpit = base.adjusted(&BehaviorHint { tarpit: true, fast: false });
        assert!(tarpit.command < base.command);
        let fast = base.adjusted(&BehaviorHint { tarpit: false, fast: true });
        assert!(fast.command > base.command);
        assert!(fast.connect <= base.connect);
    }
}
