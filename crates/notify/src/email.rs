//! SMTP email notifier via `lettre`.
//!
//! One [`Mailer`] (transport plus default sender) is built from the SMTP
//! configuration at startup and shared by every email channel. Port 465
//! uses implicit TLS; any other port upgrades with STARTTLS when the
//! server offers it.

use std::sync::Arc;

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use beacon_core::config::SmtpConfig;

use crate::templating::MessageFormat;
use crate::traits::{Notification, Notifier, NotifyError};

const IMPLICIT_TLS_PORT: u16 = 465;

/// Shared SMTP transport.
#[derive(Debug)]
pub struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    default_from: Mailbox,
}

impl Mailer {
    pub fn from_config(smtp: &SmtpConfig) -> Result<Self, NotifyError> {
        let host = smtp
            .host
            .as_deref()
            .ok_or_else(|| NotifyError::Config("SMTP host is not configured".to_string()))?;

        let mut builder = if smtp.port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| NotifyError::Config(e.to_string()))?
                .port(smtp.port)
        } else {
            let tls = TlsParameters::new(host.to_string())
                .map_err(|e| NotifyError::Config(e.to_string()))?;
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
                .port(smtp.port)
                .tls(Tls::Opportunistic(tls))
        };

        if let (Some(user), Some(pass)) = (&smtp.username, &smtp.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            default_from: parse_mailbox(&smtp.from)?,
        })
    }

    pub fn default_from(&self) -> &Mailbox {
        &self.default_from
    }

    async fn deliver(&self, message: Message) -> Result<(), NotifyError> {
        self.transport
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| NotifyError::Smtp(e.to_string()))
    }
}

/// One email channel: recipients and optional sender/subject overrides.
#[derive(Debug)]
pub struct EmailNotifier {
    mailer: Arc<Mailer>,
    to: Vec<Mailbox>,
    from: Option<Mailbox>,
    subject: Option<String>,
    format: MessageFormat,
}

impl EmailNotifier {
    /// `to` may list several addresses separated by commas.
    pub fn new(
        mailer: Arc<Mailer>,
        to: &str,
        from: Option<&str>,
        subject: Option<String>,
        format: MessageFormat,
    ) -> Result<Self, NotifyError> {
        let to = to
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_mailbox)
            .collect::<Result<Vec<_>, _>>()?;
        if to.is_empty() {
            return Err(NotifyError::Config("at least one recipient is required".to_string()));
        }

        Ok(Self {
            mailer,
            to,
            from: from.map(parse_mailbox).transpose()?,
            subject: subject.filter(|s| !s.is_empty()),
            format,
        })
    }

    /// Build the message: subject override or the title, body is the
    /// plain message (or the rendered template).
    pub fn message(&self, notification: &Notification) -> Result<Message, NotifyError> {
        let from = self.from.clone().unwrap_or_else(|| self.mailer.default_from().clone());
        let mut builder = Message::builder().from(from);
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }

        let subject = self.subject.as_deref().unwrap_or(&notification.title);
        let body = self.format.text(notification, |n| n.message.clone())?;

        builder
            .subject(subject)
            .body(body)
            .map_err(|e| NotifyError::Smtp(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Notifier for EmailNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let message = self.message(notification)?;
        self.mailer.deliver(message).await?;

        tracing::debug!(recipients = self.to.len(), "email notification delivered");
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "email"
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address
        .parse()
        .map_err(|e: lettre::address::AddressError| {
            NotifyError::Config(format!("invalid address '{address}': {e}"))
        })
}
