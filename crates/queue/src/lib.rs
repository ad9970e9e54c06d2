//! Job delivery for the dispatch worker.
//!
//! This crate provides:
//! - [`JobPayload`], the `{kind, entityId}` body every job carries
//! - [`QueueConsumer`], the at-least-once consumer seam (poll/ack/nack)
//! - [`JobRegistry`] and [`Registration`] for recurring and one-shot jobs
//! - [`LocalQueue`], an in-process queue implementing both traits
//! - [`SqsConsumer`], an AWS SQS consumer that applies each job's retry
//!   budget and dead-letters exhausted or malformed jobs

pub mod consumer;
pub mod error;
pub mod job;
pub mod local;
pub mod registry;
pub mod sqs;

pub use consumer::{QueueConsumer, QueueHealth, QueueMessage};
pub use error::QueueError;
pub use job::JobPayload;
pub use local::LocalQueue;
pub use registry::{JobRegistry, JobTrigger, Registration, DEFAULT_MONITOR_INTERVAL};
pub use sqs::{NackAction, RetryBudget, SqsConsumer};
