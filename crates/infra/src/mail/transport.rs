//! Mail transports: SMTP via lettre, and an in-memory recorder for tests and
//! local runs.

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use lettre::address::{Address, Envelope};
use lettre::message::{Mailbox, Message, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MailError {
    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Clone, PartialEq, Eq)]
pub struct SmtpCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SmtpCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One outgoing message.
///
/// When `signed_message` is set it is sent verbatim and the other content
/// fields only describe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailRequest {
    pub from_email: String,
    pub from_name: Option<String>,
    pub to: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
    pub credentials: Option<SmtpCredentials>,
    pub signed_message: Option<Vec<u8>>,
}

impl MailRequest {
    pub fn html(
        from_email: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        html_body: impl Into<String>,
    ) -> Self {
        Self {
            from_email: from_email.into(),
            from_name: None,
            to: to.into(),
            reply_to: None,
            subject: subject.into(),
            html_body: html_body.into(),
            text_body: None,
            credentials: None,
            signed_message: None,
        }
    }

    pub fn with_from_name(mut self, name: impl Into<String>) -> Self {
        self.from_name = Some(name.into());
        self
    }

    pub fn with_text_body(mut self, text: impl Into<String>) -> Self {
        self.text_body = Some(text.into());
        self
    }

    /// SMTP envelope: the From address as sender, `to` as sole recipient.
    pub fn envelope(&self) -> Result<Envelope, MailError> {
        let from = parse_address(&self.from_email)?;
        let to = parse_address(&self.to)?;
        Envelope::new(Some(from), vec![to]).map_err(|e| MailError::Build(e.to_string()))
    }
}

fn parse_address(address: &str) -> Result<Address, MailError> {
    address
        .parse::<Address>()
        .map_err(|e| MailError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

/// Render `request` into its envelope and RFC 5322 bytes (CRLF line endings).
pub fn compose(request: &MailRequest) -> Result<(Envelope, Vec<u8>), MailError> {
    let message = build_message(request)?;
    Ok((message.envelope().clone(), message.formatted()))
}

/// The lettre message for `request`, before any signing.
pub fn build_message(request: &MailRequest) -> Result<Message, MailError> {
    let from = Mailbox::new(request.from_name.clone(), parse_address(&request.from_email)?);
    let to = Mailbox::new(None, parse_address(&request.to)?);

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(request.subject.clone());
    if let Some(reply_to) = &request.reply_to {
        builder = builder.reply_to(Mailbox::new(None, parse_address(reply_to)?));
    }

    match &request.text_body {
        Some(text) => builder.multipart(MultiPart::alternative_plain_html(
            text.clone(),
            request.html_body.clone(),
        )),
        None => builder.singlepart(SinglePart::html(request.html_body.clone())),
    }
    .map_err(|e| MailError::Build(e.to_string()))
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, request: &MailRequest) -> Result<(), MailError>;
}

/// SMTP relay transport.
pub struct SmtpMailTransport {
    host: String,
    port: u16,
    tls: bool,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailTransport {
    pub fn new(
        host: &str,
        port: u16,
        tls: bool,
        credentials: Option<SmtpCredentials>,
    ) -> Result<Self, MailError> {
        let mailer = build_mailer(host, port, tls, credentials.as_ref())?;
        Ok(Self {
            host: host.to_string(),
            port,
            tls,
            mailer,
        })
    }
}

fn build_mailer(
    host: &str,
    port: u16,
    tls: bool,
    credentials: Option<&SmtpCredentials>,
) -> Result<AsyncSmtpTransport<Tokio1Executor>, MailError> {
    let builder = if tls {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| MailError::Transport(e.to_string()))?
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
    };
    let mut builder = builder.port(port);
    if let Some(creds) = credentials {
        builder = builder.credentials(Credentials::new(
            creds.username.clone(),
            creds.password.clone(),
        ));
    }
    Ok(builder.build())
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    #[instrument(skip(self, request), fields(to = %request.to, signed = request.signed_message.is_some()), err)]
    async fn send(&self, request: &MailRequest) -> Result<(), MailError> {
        let (envelope, raw) = match &request.signed_message {
            Some(signed) => (request.envelope()?, signed.clone()),
            None => compose(request)?,
        };

        // Per-request credentials get a dedicated connection.
        let result = match &request.credentials {
            Some(creds) => {
                let mailer = build_mailer(&self.host, self.port, self.tls, Some(creds))?;
                mailer.send_raw(&envelope, &raw).await
            }
            None => self.mailer.send_raw(&envelope, &raw).await,
        };

        result.map_err(|e| MailError::Transport(e.to_string()))?;
        debug!(host = %self.host, "message accepted by relay");
        Ok(())
    }
}

/// A delivered message as seen by [`InMemoryMailTransport`].
#[derive(Debug, Clone)]
pub struct SentMail {
    pub request: MailRequest,
    pub raw: Vec<u8>,
}

/// Records messages instead of delivering them.
#[derive(Debug, Default)]
pub struct InMemoryMailTransport {
    sent: Mutex<Vec<SentMail>>,
    rejected: Mutex<HashSet<String>>,
}

impl InMemoryMailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send to `address` fail with a transport error.
    pub fn reject(&self, address: &str) {
        self.rejected
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(address.to_ascii_lowercase());
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn sent_to(&self, address: &str) -> Vec<SentMail> {
        self.sent()
            .into_iter()
            .filter(|mail| mail.request.to.eq_ignore_ascii_case(address))
            .collect()
    }
}

#[async_trait]
impl MailTransport for InMemoryMailTransport {
    async fn send(&self, request: &MailRequest) -> Result<(), MailError> {
        let rejected = self
            .rejected
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&request.to.to_ascii_lowercase());
        if rejected {
            return Err(MailError::Transport(format!(
                "550 mailbox unavailable: {}",
                request.to
            )));
        }

        let raw = match &request.signed_message {
            Some(signed) => {
                request.envelope()?;
                signed.clone()
            }
            None => compose(request)?.1,
        };

        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(SentMail {
                request: request.clone(),
                raw,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> MailRequest {
        MailRequest::html(
            "news@acme.example",
            "jane@example.com",
            "Spring sale",
            "<html><body><p>Hello</p></body></html>",
        )
        .with_from_name("Acme News")
    }

    #[test]
    fn compose_produces_crlf_message_with_headers() {
        let (envelope, raw) = compose(&request()).unwrap();
        let text = String::from_utf8(raw).unwrap();

        assert_eq!(envelope.to().len(), 1);
        assert!(text.contains("Subject: Spring sale\r\n"));
        assert!(text.contains("To: jane@example.com\r\n"));
        assert!(text.contains("news@acme.example"));
        assert!(text.contains("\r\n\r\n"));
    }

    #[test]
    fn compose_with_text_body_is_multipart() {
        let (_, raw) = compose(&request().with_text_body("Hello")).unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("multipart/alternative"));
    }

    #[test]
    fn compose_rejects_bad_recipient() {
        let mut request = request();
        request.to = "not-an-address".into();
        assert!(matches!(
            compose(&request),
            Err(MailError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn credentials_are_redacted_in_debug() {
        let creds = SmtpCredentials {
            username: "mailer".into(),
            password: "hunter2".into(),
        };
        let debug = format!("{creds:?}");
        assert!(debug.contains("mailer"));
        assert!(!debug.contains("hunter2"));
    }

    #[tokio::test]
    async fn in_memory_transport_records_and_rejects() {
        let transport = InMemoryMailTransport::new();
        transport.reject("Bounce@Example.com");

        transport.send(&request()).await.unwrap();

        let mut bounced = request();
        bounced.to = "bounce@example.com".into();
        let err = transport.send(&bounced).await.unwrap_err();
        assert!(matches!(err, MailError::Transport(_)));

        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.sent_to("JANE@example.com").len(), 1);
    }

    #[tokio::test]
    async fn in_memory_transport_passes_signed_bytes_through() {
        let transport = InMemoryMailTransport::new();
        let mut request = request();
        request.signed_message = Some(b"DKIM-Signature: v=1\r\n\r\nbody".to_vec());

        transport.send(&request).await.unwrap();
        assert_eq!(
            transport.sent()[0].raw,
            b"DKIM-Signature: v=1\r\n\r\nbody".to_vec()
        );
    }

    #[tokio::test]
    async fn smtp_transport_builds_without_connecting() {
        let transport = SmtpMailTransport::new("localhost", 2525, false, None);
        assert!(transport.is_ok());
    }
}
