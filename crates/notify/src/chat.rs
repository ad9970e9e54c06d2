//! Incoming-webhook chat integrations: Slack, Discord and Microsoft Teams.
//!
//! All three accept a single JSON POST; they differ only in the field
//! name and the markup used for the title.

use crate::templating::MessageFormat;
use crate::traits::{ensure_success, Notification, Notifier, NotifyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatService {
    Slack,
    Discord,
    Teams,
}

impl ChatService {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatService::Slack => "slack",
            ChatService::Discord => "discord",
            ChatService::Teams => "teams",
        }
    }

    fn default_text(&self, n: &Notification) -> String {
        match self {
            ChatService::Slack => format!("*{}*\n{}", n.title, n.message),
            ChatService::Discord => format!("**{}**\n{}", n.title, n.message),
            ChatService::Teams => format!("{}\n{}", n.title, n.message),
        }
    }

    fn payload(&self, text: String) -> serde_json::Value {
        match self {
            ChatService::Discord => serde_json::json!({ "content": text }),
            ChatService::Slack | ChatService::Teams => serde_json::json!({ "text": text }),
        }
    }
}

#[derive(Debug)]
pub struct ChatNotifier {
    service: ChatService,
    webhook_url: String,
    format: MessageFormat,
    client: reqwest::Client,
}

impl ChatNotifier {
    pub fn new(
        service: ChatService,
        webhook_url: String,
        format: MessageFormat,
        client: reqwest::Client,
    ) -> Self {
        Self {
            service,
            webhook_url,
            format,
            client,
        }
    }

    pub fn body(&self, notification: &Notification) -> Result<serde_json::Value, NotifyError> {
        let text = self
            .format
            .text(notification, |n| self.service.default_text(n))?;
        Ok(self.service.payload(text))
    }
}

#[async_trait::async_trait]
impl Notifier for ChatNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let body = self.body(notification)?;
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&body)
            .send()
            .await?;
        ensure_success(self.service.as_str(), response).await?;

        tracing::debug!(channel = self.service.as_str(), "chat notification delivered");
        Ok(())
    }

    fn channel_name(&self) -> &str {
        self.service.as_str()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::sync::Mutex;

    use super::*;

    fn notifier(service: ChatService, url: &str) -> ChatNotifier {
        ChatNotifier::new(service, url.to_string(), MessageFormat::plain(), reqwest::Client::new())
    }

    fn alert() -> Notification {
        Notification::new("Monitor failed: api", "Expected 200, got 503")
    }

    #[test]
    fn slack_payload_bolds_title() {
        let body = notifier(ChatService::Slack, "http://unused").body(&alert()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"text": "*Monitor failed: api*\nExpected 200, got 503"})
        );
    }

    #[test]
    fn discord_payload_uses_content() {
        let body = notifier(ChatService::Discord, "http://unused").body(&alert()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"content": "**Monitor failed: api**\nExpected 200, got 503"})
        );
    }

    #[test]
    fn teams_payload_is_plain() {
        let body = notifier(ChatService::Teams, "http://unused").body(&alert()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"text": "Monitor failed: api\nExpected 200, got 503"})
        );
    }

    #[tokio::test]
    async fn posts_payload_to_webhook() {
        let received = Arc::new(Mutex::new(None::<serde_json::Value>));
        let sink = received.clone();
        let router = Router::new().route(
            "/hook",
            post(move |Json(body): Json<serde_json::Value>| {
                let sink = sink.clone();
                async move {
                    *sink.lock().await = Some(body);
                    StatusCode::OK
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        notifier(ChatService::Slack, &url).send(&alert()).await.unwrap();
        assert_eq!(
            received.lock().await.clone(),
            Some(serde_json::json!({"text": "*Monitor failed: api*\nExpected 200, got 503"}))
        );
    }

    #[tokio::test]
    async fn non_2xx_is_an_error() {
        let router = Router::new().route(
            "/hook",
            post(|| async { (StatusCode::FORBIDDEN, "invalid_token") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let err = notifier(ChatService::Discord, &url).send(&alert()).await.unwrap_err();
        assert_eq!(err.to_string(), "discord endpoint returned 403: invalid_token");
    }
}
