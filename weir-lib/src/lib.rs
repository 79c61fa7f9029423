#![forbid(unsafe_code)]

//! Weir: distributed per-user bandwidth rate limiting.
//!
//! Two cooperating halves share this crate. The [`limit`] and [`throttle`]
//! modules form the in-proxy enforcer: per-stream bandwidth decisions
//! against sliding-window shares, plus controller-driven connection
//! throttling. The [`aggregator`] and [`store`] modules form the ingest
//! daemon: a UDP receiver that coalesces the enforcer's event lines and
//! pipelines per-second counters into a shared key-value store, from which
//! a central controller redistributes shares across the proxy fleet.
//!
//! Enforcement is approximate: each instance applies its own share with
//! local sliding windows, and short-term overshoot during share propagation
//! is accepted. Event delivery is lossy under overload and degrades
//! gracefully.

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod limit;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod throttle;

pub use error::{Result, WeirError};
