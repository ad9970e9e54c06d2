//! Generic HTTP webhook notifier.
//!
//! Sends `{title, message}` as JSON with a configurable method and extra
//! headers. When the channel has a template, the rendered text replaces
//! `message`.

use std::collections::BTreeMap;

use crate::templating::MessageFormat;
use crate::traits::{ensure_success, Notification, Notifier, NotifyError};

#[derive(Debug)]
pub struct WebhookNotifier {
    url: String,
    method: reqwest::Method,
    headers: BTreeMap<String, String>,
    format: MessageFormat,
    client: reqwest::Client,
}

impl WebhookNotifier {
    /// `method` defaults to POST and is matched case-insensitively.
    pub fn new(
        url: String,
        method: Option<&str>,
        headers: BTreeMap<String, String>,
        format: MessageFormat,
        client: reqwest::Client,
    ) -> Result<Self, NotifyError> {
        let method = match method {
            Some(m) => m
                .to_uppercase()
                .parse::<reqwest::Method>()
                .map_err(|_| NotifyError::Config(format!("invalid HTTP method: {m}")))?,
            None => reqwest::Method::POST,
        };

        Ok(Self {
            url,
            method,
            headers,
            format,
            client,
        })
    }

    pub fn body(&self, notification: &Notification) -> Result<serde_json::Value, NotifyError> {
        let message = self.format.text(notification, |n| n.message.clone())?;
        Ok(serde_json::json!({
            "title": notification.title,
            "message": message,
        }))
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let body = serde_json::to_vec(&self.body(notification)?)
            .map_err(|e| NotifyError::Config(format!("failed to serialize payload: {e}")))?;

        let mut request = self
            .client
            .request(self.method.clone(), &self.url)
            .body(body);
        let has_content_type = self
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("content-type"));
        if !has_content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, "application/json");
        }
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await?;
        ensure_success("webhook", response).await?;

        tracing::debug!(
            url = %self.url,
            method = %self.method,
            "webhook notification delivered"
        );
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "webhook"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::{HeaderMap, Method, StatusCode};
    use axum::routing::any;
    use axum::Router;
    use tokio::sync::Mutex;

    use super::*;
    use crate::templating::TemplateRenderer;

    fn alert() -> Notification {
        Notification::new("Schedule recovered: billing", "Recovered after failures")
    }

    #[test]
    fn default_method_is_post() {
        let n = WebhookNotifier::new(
            "https://example.com".into(),
            None,
            BTreeMap::new(),
            MessageFormat::plain(),
            reqwest::Client::new(),
        )
        .unwrap();
        assert_eq!(n.method, reqwest::Method::POST);
        assert_eq!(n.channel_name(), "webhook");
    }

    #[test]
    fn method_is_case_insensitive() {
        let n = WebhookNotifier::new(
            "https://example.com".into(),
            Some("put"),
            BTreeMap::new(),
            MessageFormat::plain(),
            reqwest::Client::new(),
        )
        .unwrap();
        assert_eq!(n.method, reqwest::Method::PUT);
    }

    #[test]
    fn invalid_method_rejected() {
        let result = WebhookNotifier::new(
            "https://example.com".into(),
            Some("NOT A METHOD"),
            BTreeMap::new(),
            MessageFormat::plain(),
            reqwest::Client::new(),
        );
        assert!(matches!(result, Err(NotifyError::Config(_))));
    }

    #[test]
    fn template_replaces_message_only() {
        let format = MessageFormat::new(
            Some("{{ title }} :: {{ message }}".into()),
            Arc::new(TemplateRenderer::new()),
        )
        .unwrap();
        let n = WebhookNotifier::new(
            "https://example.com".into(),
            None,
            BTreeMap::new(),
            format,
            reqwest::Client::new(),
        )
        .unwrap();
        assert_eq!(
            n.body(&alert()).unwrap(),
            serde_json::json!({
                "title": "Schedule recovered: billing",
                "message": "Schedule recovered: billing :: Recovered after failures",
            })
        );
    }

    #[tokio::test]
    async fn sends_method_headers_and_body() {
        type Seen = (Method, Option<String>, String);
        let seen = Arc::new(Mutex::new(None::<Seen>));
        let sink = seen.clone();
        let router = Router::new().route(
            "/in",
            any(move |method: Method, headers: HeaderMap, body: String| {
                let sink = sink.clone();
                async move {
                    let token = headers
                        .get("x-token")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    *sink.lock().await = Some((method, token, body));
                    StatusCode::NO_CONTENT
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/in", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let n = WebhookNotifier::new(
            url,
            Some("PUT"),
            BTreeMap::from([("X-Token".to_string(), "s3cret".to_string())]),
            MessageFormat::plain(),
            reqwest::Client::new(),
        )
        .unwrap();
        n.send(&alert()).await.unwrap();

        let (method, token, body) = seen.lock().await.clone().unwrap();
        assert_eq!(method, Method::PUT);
        assert_eq!(token.as_deref(), Some("s3cret"));
        let body: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["message"], "Recovered after failures");
    }
}
