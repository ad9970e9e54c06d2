//! Minijinja rendering for channel message templates.
//!
//! Templates are arbitrary strings stored on the channel, so a fresh
//! [`minijinja::Environment`] is created per render call. The context
//! exposes `title`, `message` and `now` (RFC 3339, UTC).

use std::sync::Arc;

use crate::traits::{Notification, NotifyError};

#[derive(Debug, serde::Serialize)]
struct TemplateContext<'a> {
    title: &'a str,
    message: &'a str,
    now: String,
}

#[derive(Debug, Default)]
pub struct TemplateRenderer {
    _private: (),
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self { _private: () }
    }

    fn build_env() -> minijinja::Environment<'static> {
        let mut env = minijinja::Environment::new();
        env.add_filter("bold", |value: String| format!("*{value}*"));
        env
    }

    pub fn render(&self, template: &str, notification: &Notification) -> Result<String, NotifyError> {
        let ctx = TemplateContext {
            title: &notification.title,
            message: &notification.message,
            now: chrono::Utc::now().to_rfc3339(),
        };
        Self::build_env()
            .render_str(template, ctx)
            .map_err(|e| NotifyError::Template(e.to_string()))
    }

    /// Check template syntax without evaluating it.
    pub fn validate(&self, template: &str) -> Result<(), NotifyError> {
        let env = Self::build_env();
        env.template_from_str(template)
            .map_err(|e| NotifyError::Template(e.to_string()))?;
        Ok(())
    }
}

/// How a channel turns a [`Notification`] into text: its own default
/// layout, or the channel's template when one is configured.
#[derive(Debug, Clone)]
pub struct MessageFormat {
    template: Option<String>,
    renderer: Arc<TemplateRenderer>,
}

impl MessageFormat {
    /// Validates the template up front so a broken one surfaces when the
    /// channel is built rather than on every alert.
    pub fn new(template: Option<String>, renderer: Arc<TemplateRenderer>) -> Result<Self, NotifyError> {
        if let Some(t) = &template {
            renderer
                .validate(t)
                .map_err(|e| NotifyError::Config(format!("invalid message template: {e}")))?;
        }
        Ok(Self { template, renderer })
    }

    pub fn plain() -> Self {
        Self {
            template: None,
            renderer: Arc::new(TemplateRenderer::new()),
        }
    }

    pub fn is_templated(&self) -> bool {
        self.template.is_some()
    }

    /// Render the template, or fall back to `default` applied to the
    /// notification.
    pub fn text(
        &self,
        notification: &Notification,
        default: impl FnOnce(&Notification) -> String,
    ) -> Result<String, NotifyError> {
        match &self.template {
            Some(t) => self.renderer.render(t, notification),
            None => Ok(default(notification)),
        }
    }
}
