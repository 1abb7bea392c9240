//! # Core Pipeline Module
//!
//! Everything between a configured resource and a published update.
//!
//! ## Core Components:
//!
//! - **`catalog`**: immutable snapshots of the configured resources, swapped
//!   whole on reload.
//! - **`policy`**: the per-resource cycle state machine and the retry rules.
//! - **`mapper`**: turns parsed feed rows into field-keyed updates and keeps
//!   the per-instrument stream table, including staleness withdrawal.
//! - **`dispatcher`**: the [`Publisher`] seam and an in-process fan-out
//!   implementation of it.
//! - **`entitlement`**: the lock attached to each update.
//! - **`counters`**: cumulative and windowed outcome counters.
//! - **`state`**: the worker's shared state behind one `RwLock`.
//! - **`provider`**: the facade a host owns: lifecycle, manual republish and
//!   diagnostics.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Resource definitions and catalog snapshots.
pub mod catalog;
/// Cumulative and windowed counters.
pub mod counters;
/// The publication boundary and the in-process fan-out.
pub mod dispatcher;
/// Entitlement locks.
pub mod entitlement;
/// Feed rows to item updates.
pub mod mapper;
/// Retry rules and the per-resource state machine.
pub mod policy;
/// The host-facing provider.
pub mod provider;
/// Worker state shared with diagnostics.
pub mod state;

// --- Public API Re-exports ---
pub use catalog::{CatalogSnapshot, ItemMapping, ResourceCatalog, ResourceDefinition};
pub use counters::{CounterKind, CounterSnapshot, Counters, DriftGauges};
pub use dispatcher::{
    Dispatcher, FieldEntry, FieldValue, ItemUpdate, PsychFrame, PublishError, Publisher, StreamHandle,
    UpdateHeader,
};
pub use entitlement::EntitlementLock;
pub use mapper::{MapOutcome, PublicationMapper, StreamTable};
pub use policy::{CycleOutcome, ResourcePhase, RetryPolicy, Verdict};
pub use provider::{
    CoreError, CycleReport, Diagnostics, Lifecycle, PsychProvider, Republish, RepublishMode, ResourceStatus,
};
