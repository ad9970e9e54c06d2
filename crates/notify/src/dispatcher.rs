//! Routes a notification to every enabled channel of a workspace.
//!
//! Channels are turned into notifiers by a [`NotifierFactory`] and
//! delivered to concurrently. The caller awaits the whole batch; a
//! failing or misconfigured channel is logged and never blocks or fails
//! the others.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;

use beacon_core::config::{NotifyConfig, SmtpConfig};
use beacon_core::{ChannelConfig, NotificationChannel};

use crate::chat::{ChatNotifier, ChatService};
use crate::email::{EmailNotifier, Mailer};
use crate::telegram::TelegramNotifier;
use crate::templating::{MessageFormat, TemplateRenderer};
use crate::traits::{DispatchResult, Notification, Notifier, NotifyError};
use crate::webhook::WebhookNotifier;

/// Builds a notifier for a channel. `Ok(None)` means the channel lacks the
/// address it needs and is skipped without error.
pub trait NotifierFactory: Send + Sync {
    fn build(&self, channel: &NotificationChannel) -> Result<Option<Box<dyn Notifier>>, NotifyError>;
}

/// The production factory: shared HTTP client, shared SMTP transport.
pub struct ChannelFactory {
    client: reqwest::Client,
    mailer: Option<Arc<Mailer>>,
    renderer: Arc<TemplateRenderer>,
}

impl ChannelFactory {
    pub fn new(client: reqwest::Client, mailer: Option<Mailer>) -> Self {
        Self {
            client,
            mailer: mailer.map(Arc::new),
            renderer: Arc::new(TemplateRenderer::new()),
        }
    }

    /// Email channels fail with a configuration error when SMTP is not set up.
    pub fn from_config(smtp: &SmtpConfig, notify: &NotifyConfig) -> Result<Self, NotifyError> {
        let mailer = if smtp.is_configured() {
            Some(Mailer::from_config(smtp)?)
        } else {
            tracing::warn!("SMTP not configured, email channels will fail");
            None
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(notify.timeout_ms))
            .build()?;
        Ok(Self::new(client, mailer))
    }
}

/// Absent or blank addresses both mean "not configured".
fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl NotifierFactory for ChannelFactory {
    fn build(&self, channel: &NotificationChannel) -> Result<Option<Box<dyn Notifier>>, NotifyError> {
        let format = MessageFormat::new(channel.template.clone(), self.renderer.clone())?;

        let notifier: Box<dyn Notifier> = match &channel.config {
            ChannelConfig::Email(cfg) => {
                let Some(to) = present(&cfg.to) else {
                    return Ok(None);
                };
                let mailer = self
                    .mailer
                    .clone()
                    .ok_or_else(|| NotifyError::Config("SMTP host is not configured".to_string()))?;
                Box::new(EmailNotifier::new(
                    mailer,
                    to,
                    present(&cfg.from),
                    cfg.subject.clone(),
                    format,
                )?)
            }
            ChannelConfig::Slack(cfg) | ChannelConfig::Discord(cfg) | ChannelConfig::Teams(cfg) => {
                let Some(url) = present(&cfg.webhook_url) else {
                    return Ok(None);
                };
                let service = match &channel.config {
                    ChannelConfig::Slack(_) => ChatService::Slack,
                    ChannelConfig::Discord(_) => ChatService::Discord,
                    _ => ChatService::Teams,
                };
                Box::new(ChatNotifier::new(service, url.to_string(), format, self.client.clone()))
            }
            ChannelConfig::Telegram(cfg) => {
                let (Some(token), Some(chat_id)) = (present(&cfg.bot_token), present(&cfg.chat_id)) else {
                    return Ok(None);
                };
                Box::new(TelegramNotifier::new(
                    token.to_string(),
                    chat_id.to_string(),
                    format,
                    self.client.clone(),
                ))
            }
            ChannelConfig::Webhook(cfg) => {
                let Some(url) = present(&cfg.url) else {
                    return Ok(None);
                };
                Box::new(WebhookNotifier::new(
                    url.to_string(),
                    present(&cfg.method),
                    cfg.headers.clone(),
                    format,
                    self.client.clone(),
                )?)
            }
        };
        Ok(Some(notifier))
    }
}

/// Each delivery is cut off after this long unless configured otherwise.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct Dispatcher {
    factory: Arc<dyn NotifierFactory>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(factory: Arc<dyn NotifierFactory>) -> Self {
        Self {
            factory,
            timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_config(smtp: &SmtpConfig, notify: &NotifyConfig) -> Result<Self, NotifyError> {
        let factory = ChannelFactory::from_config(smtp, notify)?;
        Ok(Self::new(Arc::new(factory)).with_timeout(Duration::from_millis(notify.timeout_ms)))
    }

    /// Deliver `notification` to every enabled channel concurrently.
    ///
    /// Returns one result per channel that was attempted. Disabled and
    /// unaddressed channels are skipped and produce no result.
    pub async fn dispatch(
        &self,
        channels: &[NotificationChannel],
        notification: &Notification,
    ) -> Vec<DispatchResult> {
        let mut pending = Vec::with_capacity(channels.len());
        let mut results = Vec::new();

        for channel in channels.iter().filter(|c| c.enabled) {
            match self.factory.build(channel) {
                Ok(Some(notifier)) => pending.push((channel.id.clone(), notifier)),
                Ok(None) => {
                    tracing::debug!(
                        channel_id = %channel.id,
                        channel = channel.kind().as_str(),
                        "Channel has no destination, skipping"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        channel_id = %channel.id,
                        channel = channel.kind().as_str(),
                        error = %e,
                        "Channel could not be built"
                    );
                    results.push(DispatchResult {
                        channel_id: channel.id.clone(),
                        channel: channel.kind().as_str().to_string(),
                        success: false,
                        error: Some(e.to_string()),
                        duration_ms: 0,
                    });
                }
            }
        }

        if pending.is_empty() && results.is_empty() {
            tracing::debug!("No notification channels to deliver to");
            return results;
        }

        let deliveries = pending.iter().map(|(channel_id, notifier)| {
            deliver(channel_id, notifier.as_ref(), notification, self.timeout)
        });
        results.extend(join_all(deliveries).await);
        results
    }
}

async fn deliver(
    channel_id: &str,
    notifier: &dyn Notifier,
    notification: &Notification,
    timeout: Duration,
) -> DispatchResult {
    let start = Instant::now();
    let result = match tokio::time::timeout(timeout, notifier.send(notification)).await {
        Ok(result) => result,
        Err(_) => Err(NotifyError::Timeout(timeout.as_millis() as u64)),
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    let error = match result {
        Ok(()) => {
            tracing::info!(
                channel_id,
                channel = notifier.channel_name(),
                duration_ms,
                "Notification delivered"
            );
            None
        }
        Err(e) => {
            tracing::warn!(
                channel_id,
                channel = notifier.channel_name(),
                error = %e,
                duration_ms,
                "Notification delivery failed"
            );
            Some(e.to_string())
        }
    };

    DispatchResult {
        channel_id: channel_id.to_string(),
        channel: notifier.channel_name().to_string(),
        success: error.is_none(),
        error,
        duration_ms,
    }
}
