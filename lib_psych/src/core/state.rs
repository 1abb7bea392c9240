//! Shared pipeline state.
//!
//! One value behind one `tokio::sync::RwLock`. The polling worker takes the
//! write side to start and commit cycles; diagnostics take the read side.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::core::counters::Counters;
use crate::core::mapper::StreamTable;
use crate::core::policy::ResourceState;

/// Everything the worker mutates between cycles.
#[derive(Debug)]
pub struct PipelineState {
    /// Cycle bookkeeping per resource name.
    pub resources: BTreeMap<String, ResourceState>,
    /// Live publication streams.
    pub streams: StreamTable,
    /// Outcome counters.
    pub counters: Counters,
    /// Set by a panic-level drift; the core accepts no new work afterwards.
    pub shutdown: bool,
}

impl PipelineState {
    /// Empty state with counters windowed from `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            resources: BTreeMap::new(),
            streams: StreamTable::new(),
            counters: Counters::new(now),
            shutdown: false,
        }
    }
}

/// Handle shared between the worker and the provider facade.
pub type SharedState = Arc<RwLock<PipelineState>>;

/// A fresh [`SharedState`].
pub fn shared_state(now: DateTime<Utc>) -> SharedState {
    Arc::new(RwLock::new(PipelineState::new(now)))
}
