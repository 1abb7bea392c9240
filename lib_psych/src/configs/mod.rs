//! # Configuration Module
//!
//! Loads the provider configuration from a JSON document and validates it
//! before anything else is constructed. A configuration that fails
//! validation never reaches the core; startup aborts with a [`ConfigError`].

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Provider, resource and transport settings.
pub mod config_psych;

// --- Public API Re-exports ---
pub use config_psych::{ConfigError, HttpEncoding, ItemConfig, PsychConfig, ResourceConfig};
