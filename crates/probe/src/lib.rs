//! Network probe execution for schedules and monitors.
//!
//! This crate provides:
//! - [`ProbeSpec`], the normalized description of one network action
//! - HTTP, TCP, TLS and ping-equivalent probe implementations
//! - [`Prober`], the seam the dispatch worker calls, with
//!   [`NetworkProber`] as the real implementation
//!
//! Probes never fail: every error path is captured in [`ProbeResult::error`]
//! with the elapsed latency still populated.

pub mod http;
pub mod prober;
pub mod result;
pub mod socket;
pub mod spec;
pub mod tls;

pub use prober::{NetworkProber, ProbeError, Prober};
pub use result::ProbeResult;
pub use spec::{HttpProbe, ProbeSpec, SocketProbe};
