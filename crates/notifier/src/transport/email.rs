//! Email transport over SMTP.
//!
//! Uses lettre's pooled async SMTP transport. `open` builds the transport
//! and verifies the relay answers; a failed check leaves the channel
//! unavailable until the supervisor reconnects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use parking_lot::RwLock;

use herald_common::config::{SmtpSettings, SmtpTls};
use herald_common::types::{Channel, NotificationPayload};

use super::{ChannelTransport, TransportError};

/// SMTP command timeout.
const SMTP_TIMEOUT: Duration = Duration::from_secs(20);

type Mailer = AsyncSmtpTransport<Tokio1Executor>;

/// Email notification transport.
pub struct EmailTransport {
    settings: SmtpSettings,
    from: Mailbox,
    mailer: RwLock<Option<Arc<Mailer>>>,
}

impl EmailTransport {
    /// Fails when the configured sender is not a valid mailbox.
    pub fn new(settings: SmtpSettings) -> Result<Self, TransportError> {
        let from: Mailbox = settings.from.parse().map_err(|e| {
            TransportError::Permanent(format!("invalid sender '{}': {}", settings.from, e))
        })?;
        Ok(Self {
            settings,
            from,
            mailer: RwLock::new(None),
        })
    }

    fn build_mailer(&self) -> Result<Mailer, TransportError> {
        let host = self.settings.host.as_str();
        let builder = match self.settings.tls {
            SmtpTls::Starttls => Mailer::starttls_relay(host),
            SmtpTls::Tls => Mailer::relay(host),
            SmtpTls::None => Ok(Mailer::builder_dangerous(host)),
        }
        .map_err(|e| TransportError::Permanent(format!("invalid SMTP relay '{}': {}", host, e)))?;

        let mut builder = builder.port(self.settings.port).timeout(Some(SMTP_TIMEOUT));
        if let (Some(user), Some(pass)) = (&self.settings.username, &self.settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.expose().to_string()));
        }
        Ok(builder.build())
    }

    fn compose(&self, recipient: &str, payload: &NotificationPayload) -> Result<Message, TransportError> {
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(TransportError::Permanent("empty email recipient".to_string()));
        }
        let to: Mailbox = recipient.parse().map_err(|e| {
            TransportError::Permanent(format!("invalid recipient '{}': {}", recipient, e))
        })?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(payload.title.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(payload.body.clone())
            .map_err(|e| TransportError::Permanent(format!("failed to build email: {}", e)))
    }
}

#[async_trait]
impl ChannelTransport for EmailTransport {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn open(&self) -> Result<(), TransportError> {
        let mailer = self.build_mailer()?;
        match mailer.test_connection().await {
            Ok(true) => {}
            Ok(false) => {
                return Err(TransportError::Unavailable(format!(
                    "SMTP relay {}:{} did not accept the connection",
                    self.settings.host, self.settings.port
                )));
            }
            Err(e) => return Err(classify_smtp_error(&e)),
        }

        *self.mailer.write() = Some(Arc::new(mailer));
        tracing::info!(
            host = %self.settings.host,
            port = self.settings.port,
            "SMTP relay connected"
        );
        Ok(())
    }

    async fn close(&self) {
        if self.mailer.write().take().is_some() {
            tracing::info!("SMTP transport closed");
        }
    }

    fn is_open(&self) -> bool {
        self.mailer.read().is_some()
    }

    async fn send(
        &self,
        recipient: &str,
        payload: &NotificationPayload,
    ) -> Result<(), TransportError> {
        let message = self.compose(recipient, payload)?;
        let mailer = self
            .mailer
            .read()
            .clone()
            .ok_or_else(|| TransportError::Unavailable("SMTP transport not connected".to_string()))?;

        mailer
            .send(message)
            .await
            .map_err(|e| classify_smtp_error(&e))?;

        tracing::debug!(recipient, "Email sent");
        Ok(())
    }
}

/// 5xx replies are permanent, 4xx replies and network trouble are retried.
fn classify_smtp_error(err: &lettre::transport::smtp::Error) -> TransportError {
    let message = err.to_string();
    if err.is_permanent() {
        TransportError::Permanent(message)
    } else if err.is_timeout() {
        TransportError::Timeout(message)
    } else {
        TransportError::Transient(message)
    }
}
