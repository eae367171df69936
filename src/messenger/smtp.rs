//! SMTP messenger.
//!
//! Opens one connection per message: greeting, EHLO, optional AUTH, then
//! MAIL/RCPT/DATA and QUIT. With `smtp.tls = "starttls"` the session is
//! upgraded right after the first EHLO; with `"tls"` the socket is wrapped
//! before the greeting. Every command is bounded by the configured timeout.
//!
//! Header and envelope fields are single-line: a CR or LF in a recipient or
//! subject rejects the message before any connection is made.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_native_tls::{native_tls, TlsConnector, TlsStream};

use crate::config::{SmtpAuth, SmtpConfig, SmtpTls};
use crate::messenger::{Message, Messenger, MessengerError, EMAIL_MESSENGER};

enum Security {
    Plain,
    StartTls(TlsConnector),
    Implicit(TlsConnector),
}

pub struct SmtpMessenger {
    config: SmtpConfig,
    timeout: Duration,
    security: Security,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

fn invalid(reason: impl Into<String>) -> MessengerError {
    MessengerError::Invalid {
        name: EMAIL_MESSENGER.to_string(),
        reason: reason.into(),
    }
}

fn single_line(field: &str, value: &str) -> Result<(), MessengerError> {
    if value.contains(['\r', '\n']) {
        return Err(invalid(format!("{} contains a line break", field)));
    }
    Ok(())
}

/// RFC 2047 encoded word for non-ASCII header text.
fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?utf-8?B?{}?=", BASE64.encode(value))
    }
}

impl SmtpMessenger {
    /// Build the `email` messenger, validating its configuration.
    pub fn new(config: SmtpConfig) -> Result<Self, MessengerError> {
        if config.host.trim().is_empty() {
            return Err(invalid("host is empty"));
        }
        if config.port == 0 {
            return Err(invalid("port is 0"));
        }
        if !config.from.contains('@') {
            return Err(invalid("from is not an email address"));
        }
        single_line("from", &config.from)?;
        single_line("hello_hostname", &config.hello_hostname)?;
        if config.auth != SmtpAuth::None && config.username.is_empty() {
            return Err(invalid("auth requires a username"));
        }
        if config.auth != SmtpAuth::None && config.tls == SmtpTls::None {
            return Err(invalid("auth requires starttls or tls"));
        }

        let connector = || {
            native_tls::TlsConnector::new()
                .map(TlsConnector::from)
                .map_err(|e| invalid(format!("TLS setup failed: {}", e)))
        };
        let security = match config.tls {
            SmtpTls::None => Security::Plain,
            SmtpTls::StartTls => Security::StartTls(connector()?),
            SmtpTls::Tls => Security::Implicit(connector()?),
        };

        Ok(Self {
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            config,
            security,
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    async fn deliver(&self, message: &Message) -> Result<(), MessengerError> {
        let data = self.render(message)?;

        let addr = (self.config.host.as_str(), self.config.port);
        let tcp = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MessengerError::Timeout("SMTP connect".into()))??;

        match &self.security {
            Security::Plain => {
                let mut session = Session::new(tcp, self.timeout);
                session.expect(220).await?;
                session.ehlo(&self.config.hello_hostname).await?;
                self.transact(&mut session, message, &data).await
            }
            Security::StartTls(connector) => {
                let mut session = Session::new(tcp, self.timeout);
                session.expect(220).await?;
                let extensions = session.ehlo(&self.config.hello_hostname).await?;
                if !extensions.iter().any(|e| e.eq_ignore_ascii_case("STARTTLS")) {
                    return Err(MessengerError::Transport(format!(
                        "{} does not offer STARTTLS",
                        self.config.host
                    )));
                }
                session.command("STARTTLS", 220).await?;

                let stream = self.handshake(connector, session.into_inner()).await?;
                let mut session = Session::new(stream, self.timeout);
                session.ehlo(&self.config.hello_hostname).await?;
                self.transact(&mut session, message, &data).await
            }
            Security::Implicit(connector) => {
                let stream = self.handshake(connector, tcp).await?;
                let mut session = Session::new(stream, self.timeout);
                session.expect(220).await?;
                session.ehlo(&self.config.hello_hostname).await?;
                self.transact(&mut session, message, &data).await
            }
        }
    }

    async fn handshake<S>(&self, connector: &TlsConnector, stream: S) -> Result<TlsStream<S>, MessengerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tokio::time::timeout(self.timeout, connector.connect(&self.config.host, stream))
            .await
            .map_err(|_| MessengerError::Timeout("TLS handshake".into()))?
            .map_err(|e| {
                MessengerError::Transport(format!("TLS handshake with {}: {}", self.config.host, e))
            })
    }

    /// Everything after EHLO: AUTH, envelope, DATA, QUIT.
    async fn transact<S>(
        &self,
        session: &mut Session<S>,
        message: &Message,
        data: &str,
    ) -> Result<(), MessengerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.config.auth {
            SmtpAuth::None => {}
            SmtpAuth::Plain => {
                let token = BASE64.encode(format!(
                    "\0{}\0{}",
                    self.config.username, self.config.password
                ));
                session.command(&format!("AUTH PLAIN {}", token), 235).await?;
            }
            SmtpAuth::Login => {
                session.command("AUTH LOGIN", 334).await?;
                session
                    .command(&BASE64.encode(&self.config.username), 334)
                    .await?;
                session
                    .command(&BASE64.encode(&self.config.password), 235)
                    .await?;
            }
        }

        session
            .command(&format!("MAIL FROM:<{}>", self.config.from), 250)
            .await?;
        for rcpt in &message.to {
            session.command(&format!("RCPT TO:<{}>", rcpt), 250).await?;
        }
        session.command("DATA", 354).await?;
        session.write_raw(data).await?;
        session.expect(250).await?;
        session.command("QUIT", 221).await?;
        Ok(())
    }

    fn render(&self, message: &Message) -> Result<String, MessengerError> {
        if message.to.is_empty() {
            return Err(invalid("message has no recipients"));
        }
        for rcpt in &message.to {
            single_line("recipient", rcpt)?;
        }
        single_line("subject", &message.subject)?;
        single_line("content type", &message.content_type)?;

        let mut data = String::new();
        data.push_str(&format!("From: {}\r\n", self.config.from));
        data.push_str(&format!("To: {}\r\n", message.to.join(", ")));
        data.push_str(&format!("Subject: {}\r\n", encode_header(&message.subject)));
        data.push_str(&format!("Message-ID: <{}@{}>\r\n", message.id, self.config.hello_hostname));
        data.push_str("MIME-Version: 1.0\r\n");
        data.push_str(&format!("Content-Type: {}; charset=utf-8\r\n\r\n", message.content_type));
        for line in message.body.lines() {
            // Dot-stuffing (RFC 5321 4.5.2)
            if line.starts_with('.') {
                data.push('.');
            }
            data.push_str(line);
            data.push_str("\r\n");
        }
        data.push_str(".\r\n");
        Ok(data)
    }
}

struct Session<S> {
    stream: BufReader<S>,
    timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            timeout,
        }
    }

    fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    /// EHLO, returning the advertised extensions.
    async fn ehlo(&mut self, hostname: &str) -> Result<Vec<String>, MessengerError> {
        let mut lines = self.command(&format!("EHLO {}", hostname), 250).await?;
        // The first line is the server greeting, not an extension.
        if !lines.is_empty() {
            lines.remove(0);
        }
        Ok(lines)
    }

    async fn command(&mut self, line: &str, expected: u16) -> Result<Vec<String>, MessengerError> {
        self.write_raw(&format!("{}\r\n", line)).await?;
        self.expect(expected).await
    }

    async fn write_raw(&mut self, data: &str) -> Result<(), MessengerError> {
        tokio::time::timeout(self.timeout, self.stream.get_mut().write_all(data.as_bytes()))
            .await
            .map_err(|_| MessengerError::Timeout("SMTP write".into()))??;
        Ok(())
    }

    /// Read a (possibly multi-line) reply, check its code and return the
    /// text of each line.
    async fn expect(&mut self, expected: u16) -> Result<Vec<String>, MessengerError> {
        let mut text = Vec::new();
        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(self.timeout, self.stream.read_line(&mut line))
                .await
                .map_err(|_| MessengerError::Timeout("SMTP read".into()))??;
            if read == 0 {
                return Err(MessengerError::Transport("SMTP server closed the connection".into()));
            }

            let line = line.trim_end();
            let code: u16 = line
                .get(..3)
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| MessengerError::Transport(format!("malformed SMTP reply `{}`", line)))?;
            text.push(line.get(4..).unwrap_or_default().to_string());
            let last = line.as_bytes().get(3) != Some(&b'-');
            if !last {
                continue;
            }
            if code != expected {
                return Err(MessengerError::Smtp {
                    code,
                    text: text.join(" "),
                });
            }
            return Ok(text);
        }
    }
}

struct InFlight<'a>(&'a SmtpMessenger);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[async_trait]
impl Messenger for SmtpMessenger {
    fn name(&self) -> &str {
        EMAIL_MESSENGER
    }

    async fn send(&self, message: &Message) -> Result<(), MessengerError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight(self);
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessengerError::Closed(EMAIL_MESSENGER.to_string()));
        }
        self.deliver(message).await
    }

    /// Refuse new sends and wait for in-flight ones to finish.
    async fn close(&self) -> Result<(), MessengerError> {
        self.closed.store(true, Ordering::SeqCst);
        loop {
            let idle = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            idle.await;
        }
    }
}
