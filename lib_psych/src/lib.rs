//! # lib_psych
//!
//! Polls tabular sentiment feeds over HTTP on a fixed cadence, parses each
//! feed into rows of numeric values, and publishes the mapped rows as
//! entitlement-locked, field-keyed updates through a [`core::Publisher`].
//!
//! The folders are feature gated the same way as the rest of the workspace:
//!
//! - **`configs`**: JSON configuration for resources, timings and transport.
//! - **`markets`**: the feed body format and its rounding rules.
//! - **`retrieve`**: the HTTP transport (conditional GET, DNS cache).
//! - **`core`**: catalog, counters, retry policy, mapper and the provider facade,
//!   plus the scheduler and polling worker under `ingestors`.

#![forbid(unsafe_code)]

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "core")]
pub mod ingestors;
#[cfg(feature = "markets")]
pub mod markets;
#[cfg(feature = "retrieve")]
pub mod retrieve;
