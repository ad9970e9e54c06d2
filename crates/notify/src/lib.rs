//! Alert delivery for schedule and monitor outcomes.
//!
//! This crate provides:
//! - `Notifier` trait with one implementation per channel kind
//!   (email, Slack, Discord, Teams, Telegram, generic webhook)
//! - Minijinja templates that replace a channel's default text layout
//! - `Dispatcher`, which fans one notification out to every enabled
//!   channel concurrently and never lets a failing channel block the rest

pub mod chat;
pub mod dispatcher;
pub mod email;
pub mod telegram;
pub mod templating;
pub mod traits;
pub mod webhook;

pub use dispatcher::{ChannelFactory, Dispatcher, NotifierFactory};
pub use email::Mailer;
pub use traits::{DispatchResult, Notification, Notifier, NotifyError};
