use crate::config::Config;
use lettre::message::header::ContentType;
use lettre::{Message, SmtpTransport, Transport};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid mail address: {0}")]
    Address(String),
    #[error("failed to build mail: {0}")]
    Build(String),
    #[error("smtp delivery failed: {0}")]
    Delivery(String),
}

/// A rendered mail waiting for submission. Kept as plain strings so the
/// decision path can be tested without a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMail {
    pub to: String,
    /// Command address the recipient replies to; the configured sender
    /// is used when the mail offers no toggle.
    pub reply_to: Option<String>,
    pub subject: String,
    pub body: String,
}

/// Synchronous submission to the configured relay. Plain RFC 5321, no
/// TLS negotiation; the relay is expected to be local.
pub struct Mailer {
    host: String,
    port: u16,
    from: String,
}

impl Mailer {
    pub fn new(config: &Config) -> Self {
        Mailer {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            from: config.sender.clone(),
        }
    }

    pub fn send(&self, mail: &OutboundMail) -> Result<(), MailError> {
        let from = self
            .from
            .parse()
            .map_err(|e| MailError::Address(format!("from {}: {e}", self.from)))?;
        let to = mail
            .to
            .parse()
            .map_err(|e| MailError::Address(format!("to {}: {e}", mail.to)))?;
        let reply_to = mail.reply_to.as_deref().unwrap_or(&self.from);
        let reply_to = reply_to
            .parse()
            .map_err(|e| MailError::Address(format!("reply-to {reply_to}: {e}")))?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .reply_to(reply_to)
            .subject(mail.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(mail.body.clone())
            .map_err(|e| MailError::Build(e.to_string()))?;

        let transport = SmtpTransport::builder_dangerous(&self.host)
            .port(self.port)
            .timeout(Some(Duration::from_secs(30)))
            .build();

        transport
            .send(&message)
            .map(|_| ())
            .map_err(|e| MailError::Delivery(e.to_string()))?;

        log::info!("submitted mail for {} to {}:{}", mail.to, self.host, self.port);
        Ok(())
    }
}
