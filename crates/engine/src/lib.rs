//! The beacon execution engine.
//!
//! This crate provides:
//! - active-window, run-condition and circuit-breaker evaluation
//! - [`RunStore`], the persistence seam, with memory and PostgreSQL stores
//! - [`DispatchWorker`], which turns one queue job into one outcome
//! - [`WorkerPool`], which feeds queue messages to the worker concurrently

pub mod breaker;
pub mod catalog;
pub mod conditions;
pub mod error;
pub mod runner;
pub mod store;
pub mod window;
pub mod worker;

pub use breaker::{AlertKind, AlertPolicy, BreakerPolicy, StateChange};
pub use catalog::{register_all, Catalog};
pub use error::EngineError;
pub use runner::{shutdown_signal, PoolConfig, WorkerPool};
pub use store::{MemoryStore, PgStore, RunStore};
pub use worker::{DispatchOutcome, DispatchWorker};
