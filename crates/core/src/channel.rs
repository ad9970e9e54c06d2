//! Notification channel definitions.
//!
//! A channel's provider-specific configuration is a tagged enum: the
//! `type` tag selects the variant and `config` holds its fields, matching
//! the `{ "type": "SLACK", "config": { "webhookUrl": ... } }` shape the
//! configuration layer stores.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::WorkspaceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelKind {
    Email,
    Slack,
    Telegram,
    Discord,
    Teams,
    Webhook,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Slack => "slack",
            ChannelKind::Telegram => "telegram",
            ChannelKind::Discord => "discord",
            ChannelKind::Teams => "teams",
            ChannelKind::Webhook => "webhook",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailChannelConfig {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
}

/// Incoming-webhook style chat integrations (Slack, Discord, Teams).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatWebhookConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannelConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookChannelConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelConfig {
    Email(EmailChannelConfig),
    Slack(ChatWebhookConfig),
    Telegram(TelegramChannelConfig),
    Discord(ChatWebhookConfig),
    Teams(ChatWebhookConfig),
    Webhook(WebhookChannelConfig),
}

impl ChannelConfig {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelConfig::Email(_) => ChannelKind::Email,
            ChannelConfig::Slack(_) => ChannelKind::Slack,
            ChannelConfig::Telegram(_) => ChannelKind::Telegram,
            ChannelConfig::Discord(_) => ChannelKind::Discord,
            ChannelConfig::Teams(_) => ChannelKind::Teams,
            ChannelConfig::Webhook(_) => ChannelKind::Webhook,
        }
    }
}

/// A configured alert destination owned by a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationChannel {
    pub id: String,
    pub workspace_id: WorkspaceId,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Optional minijinja template replacing the channel's default text layout.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(flatten)]
    pub config: ChannelConfig,
}

fn enabled_by_default() -> bool {
    true
}

impl NotificationChannel {
    pub fn new(id: impl Into<String>, workspace_id: impl Into<String>, config: ChannelConfig) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            enabled: true,
            template: None,
            config,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.config.kind()
    }
}
