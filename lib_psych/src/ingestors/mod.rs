//! # Feed Ingestors
//!
//! The two long-running tasks of the provider.
//!
//! ## Contained Modules:
//! - **`scheduler`**: computes the next poll instant on the configured grid and
//!   asks the worker for a cycle when it fires.
//! - **`psych_polling`**: the polling worker. Owns every in-flight transfer,
//!   applies the retry policy, parses and maps completed feeds and answers
//!   manual republish requests.
//!
//! Both talk over one command channel; the worker is the only writer of the
//! shared pipeline state.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The polling worker.
pub mod psych_polling;
/// The interval timer.
pub mod scheduler;

// --- Public API Re-exports ---
pub use psych_polling::{PollSettings, PollingWorker, WorkerCommand};
pub use scheduler::{next_fire, Scheduler};
