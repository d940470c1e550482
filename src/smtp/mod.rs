//! Pooled SMTP clients, one transport per `(host, port, username)` tuple.
//!
//! lettre maintains the idle-connection pool inside each transport; this
//! module keys transports by relay identity, maps the configured
//! encryption mode, applies per-send timeouts and drops a transport on
//! error so the next send reconnects.

use crate::database::emails::{self, Recipient};
use crate::database::smtp_configs::{self, Encryption};
use lettre::{
    message::{
        header::{ContentType, HeaderName, HeaderValue},
        Mailbox, MultiPart, SinglePart,
    },
    transport::smtp::{authentication::Credentials, PoolConfig},
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("SMTP configuration error: {message}")]
    Config { message: String },

    #[error("SMTP connection error: {message}")]
    Connection { message: String },

    #[error("SMTP send error: {message}")]
    Send {
        message: String,
        /// lettre's view of the failure, when the server answered.
        permanent: bool,
        transient: bool,
    },

    #[error("SMTP send timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Email build error: {message}")]
    Build { message: String },
}

impl SmtpError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn build(message: impl Into<String>) -> Self {
        Self::Build {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    /// First line of the server reply, kept as the remote message id hint.
    pub response: String,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct ConnectionTest {
    pub success: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    host: String,
    port: u16,
    username: Option<String>,
}

impl PoolKey {
    fn from_config(config: &smtp_configs::Model) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port as u16,
            username: config.username.clone(),
        }
    }
}

#[derive(Clone, Default)]
pub struct SmtpPool {
    transports: Arc<RwLock<HashMap<PoolKey, Arc<AsyncSmtpTransport<Tokio1Executor>>>>>,
}

impl SmtpPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_transport(
        config: &smtp_configs::Model,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, SmtpError> {
        let encryption = Encryption::from_str(&config.encryption)
            .map_err(|e| SmtpError::config(e))?;

        let mut builder = match encryption {
            Encryption::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| SmtpError::Connection {
                    message: format!("Failed to create TLS relay: {e}"),
                })?,
            Encryption::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host).map_err(|e| {
                    SmtpError::Connection {
                        message: format!("Failed to create STARTTLS relay: {e}"),
                    }
                })?
            }
            Encryption::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            }
        };

        builder = builder
            .port(config.port as u16)
            .timeout(Some(Duration::from_millis(config.timeout_ms as u64)))
            .pool_config(PoolConfig::new().max_size(config.pool_size.max(1) as u32));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(builder.build())
    }

    async fn transport_for(
        &self,
        config: &smtp_configs::Model,
    ) -> Result<Arc<AsyncSmtpTransport<Tokio1Executor>>, SmtpError> {
        let key = PoolKey::from_config(config);

        if let Some(transport) = self.transports.read().await.get(&key) {
            return Ok(transport.clone());
        }

        let mut transports = self.transports.write().await;
        if let Some(transport) = transports.get(&key) {
            return Ok(transport.clone());
        }

        tracing::info!(
            host = %config.host,
            port = config.port,
            encryption = %config.encryption,
            pool_size = config.pool_size,
            "Opening SMTP transport"
        );
        let transport = Arc::new(Self::build_transport(config)?);
        transports.insert(key, transport.clone());
        Ok(transport)
    }

    /// Drop the pooled transport so the next send opens fresh connections.
    async fn discard(&self, config: &smtp_configs::Model) {
        let key = PoolKey::from_config(config);
        self.transports.write().await.remove(&key);
    }

    pub async fn send(
        &self,
        config: &smtp_configs::Model,
        message: &Message,
    ) -> Result<SendOutcome, SmtpError> {
        let transport = self.transport_for(config).await?;
        let timeout_ms = config.timeout_ms as u64;
        let started = Instant::now();

        let result = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            transport.send(message.clone()),
        )
        .await;

        match result {
            Ok(Ok(response)) => Ok(SendOutcome {
                response: response.message().collect::<Vec<_>>().join(" "),
                duration: started.elapsed(),
            }),
            Ok(Err(e)) => {
                self.discard(config).await;
                Err(SmtpError::Send {
                    message: e.to_string(),
                    permanent: e.is_permanent(),
                    transient: e.is_transient(),
                })
            }
            Err(_) => {
                self.discard(config).await;
                Err(SmtpError::Timeout { timeout_ms })
            }
        }
    }

    /// Open a connection, EHLO and (with credentials) AUTH, then QUIT.
    pub async fn test(&self, config: &smtp_configs::Model) -> Result<ConnectionTest, SmtpError> {
        let transport = Self::build_transport(config)?;
        let started = Instant::now();

        let outcome = tokio::time::timeout(
            Duration::from_millis(config.timeout_ms as u64),
            transport.test_connection(),
        )
        .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        Ok(match outcome {
            Ok(Ok(true)) => ConnectionTest {
                success: true,
                latency_ms,
                error: None,
            },
            Ok(Ok(false)) => ConnectionTest {
                success: false,
                latency_ms,
                error: Some("Server rejected the connection test".to_string()),
            },
            Ok(Err(e)) => ConnectionTest {
                success: false,
                latency_ms,
                error: Some(e.to_string()),
            },
            Err(_) => ConnectionTest {
                success: false,
                latency_ms,
                error: Some("Connection test timed out".to_string()),
            },
        })
    }

    pub async fn active_hosts(&self) -> Vec<String> {
        self.transports
            .read()
            .await
            .keys()
            .map(|k| k.host.clone())
            .collect()
    }

    pub async fn shutdown(&self) {
        let mut transports = self.transports.write().await;
        let count = transports.len();
        transports.clear();
        if count > 0 {
            tracing::info!("Closed {} SMTP transports", count);
        }
    }
}

fn recipient_to_mailbox(recipient: &Recipient) -> Result<Mailbox, SmtpError> {
    let address: Address = recipient.email.parse().map_err(|e| {
        SmtpError::build(format!("Invalid email address '{}': {}", recipient.email, e))
    })?;
    Ok(Mailbox::new(recipient.name.clone(), address))
}

/// Build the wire message for an email row. `html_body` is passed
/// separately so the caller can substitute the tracking-rewritten body.
pub fn build_message(
    email: &emails::Model,
    html_body: Option<&str>,
) -> Result<Message, SmtpError> {
    let from = recipient_to_mailbox(&Recipient {
        email: email.from_email.clone(),
        name: email.from_name.clone(),
    })?;

    let mut builder = Message::builder().from(from).subject(&email.subject);

    for to in email.to_recipients() {
        builder = builder.to(recipient_to_mailbox(&to)?);
    }
    for cc in email.cc_recipients() {
        builder = builder.cc(recipient_to_mailbox(&cc)?);
    }
    for bcc in email.bcc_recipients() {
        builder = builder.bcc(recipient_to_mailbox(&bcc)?);
    }
    if let Some(reply_to) = email.reply_to.as_deref() {
        if let Ok(recipient) = serde_json::from_str::<Recipient>(reply_to) {
            builder = builder.reply_to(recipient_to_mailbox(&recipient)?);
        }
    }

    let text_body = email.text_body.as_deref();
    let body = match (html_body, text_body) {
        (Some(html), Some(text)) => MultiPart::alternative()
            .singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_PLAIN)
                    .body(text.to_string()),
            )
            .singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_HTML)
                    .body(html.to_string()),
            ),
        (Some(html), None) => MultiPart::alternative().singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_HTML)
                .body(html.to_string()),
        ),
        (None, Some(text)) => MultiPart::alternative().singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_PLAIN)
                .body(text.to_string()),
        ),
        (None, None) => {
            return Err(SmtpError::build(
                "Email must have either HTML or text body",
            ))
        }
    };

    let mut message = builder
        .multipart(body)
        .map_err(|e| SmtpError::build(format!("Failed to build email message: {e}")))?;

    // Caller-supplied headers are injected raw after the structured build.
    if let Some(headers) = email.headers.as_deref() {
        let parsed: HashMap<String, String> = serde_json::from_str(headers).unwrap_or_default();
        for (name, value) in parsed {
            match HeaderName::new_from_ascii(name.clone()) {
                Ok(header_name) => {
                    message
                        .headers_mut()
                        .insert_raw(HeaderValue::new(header_name, value));
                }
                Err(_) => {
                    tracing::warn!(header = %name, "Skipping invalid custom header name");
                }
            }
        }
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn email_model(html: Option<&str>, text: Option<&str>) -> emails::Model {
        let now = chrono::Utc::now().timestamp_micros();
        emails::Model {
            id: Uuid::now_v7().to_string(),
            app_id: "app".to_string(),
            queue_id: "queue".to_string(),
            idempotency_key: None,
            message_id: None,
            from_email: "sender@example.com".to_string(),
            from_name: Some("Sender".to_string()),
            to_recipients: r#"[{"email":"user@example.com"}]"#.to_string(),
            cc_recipients: None,
            bcc_recipients: None,
            reply_to: None,
            subject: "Test".to_string(),
            html_body: html.map(|s| s.to_string()),
            text_body: text.map(|s| s.to_string()),
            headers: Some(r#"{"X-Campaign":"welcome"}"#.to_string()),
            personalization: None,
            metadata: None,
            status: "queued".to_string(),
            retry_count: 0,
            last_error: None,
            scheduled_at: None,
            sent_at: None,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn builds_multipart_message_with_custom_headers() {
        let email = email_model(Some("<p>Hi</p>"), Some("Hi"));
        let message = build_message(&email, email.html_body.as_deref()).unwrap();
        let rendered = String::from_utf8(message.formatted()).unwrap();
        assert!(rendered.contains("X-Campaign: welcome"));
        assert!(rendered.contains("Subject: Test"));
    }

    #[test]
    fn rejects_bodyless_email() {
        let email = email_model(None, None);
        assert!(build_message(&email, None).is_err());
    }

    #[test]
    fn rejects_malformed_from_address() {
        let mut email = email_model(None, Some("Hi"));
        email.from_email = "not-an-address".to_string();
        assert!(build_message(&email, None).is_err());
    }

    #[test]
    fn build_transport_rejects_unknown_encryption() {
        let config = smtp_configs::Model {
            id: "c1".to_string(),
            app_id: "app".to_string(),
            name: "primary".to_string(),
            host: "smtp.example.com".to_string(),
            port: 587,
            username: None,
            password: None,
            encryption: "ssl3".to_string(),
            pool_size: 5,
            timeout_ms: 30000,
            active: true,
            created_at: 0,
        };
        assert!(SmtpPool::build_transport(&config).is_err());
    }
}
