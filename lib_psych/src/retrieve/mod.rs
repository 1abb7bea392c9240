//! # Data Retrieval Module
//!
//! The network side of a poll cycle. The polling worker only sees the
//! [`FeedTransport`] trait; the production implementation is
//! [`HttpFeedClient`], built on `reqwest`.
//!
//! ## Contained Modules:
//!
//! - **`feed_http`**: conditional and full GET requests, timestamp headers,
//!   response size guards, proxy and encoding settings.
//! - **`dns_cache`**: a `reqwest` resolver that keeps answers for a fixed time.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// DNS answers reused for a configured number of seconds.
pub mod dns_cache;
/// HTTP transport for feed resources.
pub mod feed_http;

// --- Public API Re-exports ---
pub use dns_cache::CachingResolver;
pub use feed_http::{
    FeedTransport, FetchMode, FetchRequest, FetchResponse, HttpFeedClient, TransportError,
    TransportOptions,
};
