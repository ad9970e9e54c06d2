//! Telegram Bot API notifier.
//!
//! Delivers notifications via the `sendMessage` endpoint as plain text.

use crate::templating::MessageFormat;
use crate::traits::{Notification, Notifier, NotifyError};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug)]
pub struct TelegramNotifier {
    bot_token: String,
    chat_id: String,
    api_base: String,
    format: MessageFormat,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(
        bot_token: String,
        chat_id: String,
        format: MessageFormat,
        client: reqwest::Client,
    ) -> Self {
        Self {
            bot_token,
            chat_id,
            api_base: DEFAULT_API_BASE.to_string(),
            format,
            client,
        }
    }

    /// Point the notifier at a different Bot API host (local bot API
    /// servers, tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.bot_token
        )
    }

    pub fn body(&self, notification: &Notification) -> Result<serde_json::Value, NotifyError> {
        let text = self
            .format
            .text(notification, |n| format!("{}\n{}", n.title, n.message))?;
        Ok(serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
        }))
    }
}

#[async_trait::async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let body = self.body(notification)?;
        let response = self.client.post(self.endpoint()).json(&body).send().await?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(chat_id = %self.chat_id, "telegram notification delivered");
            return Ok(());
        }

        // The Bot API explains rejections in `description`.
        let text = response.text().await.unwrap_or_default();
        let description = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("description").and_then(|d| d.as_str()).map(str::to_string))
            .unwrap_or(text);

        Err(NotifyError::Rejected {
            channel: "telegram",
            status: status.as_u16(),
            body: description,
        })
    }

    fn channel_name(&self) -> &str {
        "telegram"
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    use super::*;

    fn notifier() -> TelegramNotifier {
        TelegramNotifier::new(
            "123:ABC".into(),
            "-100123".into(),
            MessageFormat::plain(),
            reqwest::Client::new(),
        )
    }

    #[test]
    fn endpoint_embeds_token() {
        assert_eq!(
            notifier().endpoint(),
            "https://api.telegram.org/bot123:ABC/sendMessage"
        );
    }

    #[test]
    fn body_joins_title_and_message() {
        let body = notifier()
            .body(&Notification::new("Schedule failed: sync", "HTTP timeout"))
            .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"chat_id": "-100123", "text": "Schedule failed: sync\nHTTP timeout"})
        );
    }

    #[tokio::test]
    async fn api_description_surfaces_in_error() {
        let router = Router::new().route(
            "/bot123:ABC/sendMessage",
            post(|Json(_): Json<serde_json::Value>| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"ok": false, "description": "Bad Request: chat not found"})),
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let err = notifier()
            .with_api_base(base)
            .send(&Notification::new("t", "m"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "telegram endpoint returned 400: Bad Request: chat not found"
        );
    }
}
