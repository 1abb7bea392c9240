//! # Publisher and Fan-out Dispatcher
//!
//! The [`Publisher`] trait is everything the core knows about the downstream
//! publication layer: it asks for a stream handle per instrument, submits
//! field-keyed updates against it and withdraws it when the instrument goes
//! stale. Session management and wire encoding live behind the trait.
//!
//! [`Dispatcher`] is the in-process implementation. Each accepted frame is
//! wrapped in an `Arc` once and every subscriber receives a clone of the
//! pointer, so a fan-out to many clients never copies the update itself.
//! Subscribers whose receiver has been dropped are pruned on the next send.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::entitlement::EntitlementLock;
use crate::markets::psych::PRICE_EXPONENT;

/// Header field: instrument display name.
pub const FID_STOCK_RIC: i32 = 1026;
/// Header field: source feed name.
pub const FID_SF_NAME: i32 = 1686;
/// Header field: feed close timestamp.
pub const FID_TIMESTAMP: i32 = 6378;
/// Header field: analytics engine version.
pub const FID_ENGINE_VER: i32 = 8569;

/// Opaque per-instrument publication handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StreamHandle {
    id: u64,
    name: String,
}

impl StreamHandle {
    /// A handle with a publisher-assigned id.
    pub fn new(id: u64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
        }
    }

    /// Publisher-assigned id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Instrument name the stream was opened for.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// A published value: a mantissa with exponent [`PRICE_EXPONENT`], or blank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldValue {
    /// Fixed-point value.
    Real(i64),
    /// No value (NaN in the feed).
    Blank,
}

impl FieldValue {
    /// The decimal value, `None` when blank.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Real(mantissa) => Some(*mantissa as f64 / 10f64.powi(-PRICE_EXPONENT)),
            FieldValue::Blank => None,
        }
    }
}

/// One field of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldEntry {
    /// Field id from the resource's field map.
    pub field_id: i32,
    /// Value.
    pub value: FieldValue,
}

/// Fixed fields every update carries in front of the mapped values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateHeader {
    /// Instrument display name.
    pub display_name: String,
    /// Topic from the item map.
    pub topic: String,
    /// Source feed identifier of the resource.
    pub source: String,
    /// Engine version from the feed preamble.
    pub engine_version: Option<String>,
    /// Feed close time from the preamble.
    pub timestamp: Option<DateTime<Utc>>,
}

impl UpdateHeader {
    /// Header values keyed by field id. Absent preamble values are omitted.
    pub fn fields(&self) -> Vec<(i32, String)> {
        let mut out = vec![
            (FID_STOCK_RIC, self.display_name.clone()),
            (FID_SF_NAME, self.source.clone()),
        ];
        if let Some(version) = &self.engine_version {
            out.push((FID_ENGINE_VER, version.clone()));
        }
        if let Some(ts) = self.timestamp {
            out.push((FID_TIMESTAMP, ts.format("%Y-%m-%d %H:%M:%S.000").to_string()));
        }
        out
    }
}

/// A refresh for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemUpdate {
    /// Target stream.
    pub stream: StreamHandle,
    /// Entitlement lock; `None` publishes unlocked.
    pub lock: Option<EntitlementLock>,
    /// Fixed header fields.
    pub header: UpdateHeader,
    /// Mapped values in header column order.
    pub fields: Vec<FieldEntry>,
}

impl ItemUpdate {
    /// Value of one mapped field.
    pub fn field(&self, field_id: i32) -> Option<FieldValue> {
        self.fields.iter().find(|f| f.field_id == field_id).map(|f| f.value)
    }
}

/// Publication failures. All of them count as a negative acknowledgement.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The publication layer refused the update.
    #[error("update rejected: {0}")]
    Rejected(String),
    /// The handle is not (or no longer) open.
    #[error("unknown stream {0}")]
    UnknownStream(String),
    /// The publication layer is shut down.
    #[error("publisher closed")]
    Closed,
}

/// # Publisher
///
/// The downstream publication boundary. Calls are synchronous and must not
/// block on network I/O; implementations queue internally.
pub trait Publisher: Send + Sync {
    /// Opens a stream for an instrument.
    fn create_stream(&self, name: &str) -> Result<StreamHandle, PublishError>;
    /// Submits an update. `Ok` is the positive acknowledgement.
    fn publish(&self, update: &ItemUpdate) -> Result<(), PublishError>;
    /// Sends the terminal update for a stream and forgets it.
    fn withdraw(&self, stream: &StreamHandle);
}

/// What subscribers of the [`Dispatcher`] receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PsychFrame {
    /// New values for a stream.
    Refresh(ItemUpdate),
    /// The stream is closed.
    Withdraw {
        /// The closed stream.
        stream: StreamHandle,
    },
}

struct ClientHandle {
    id: String,
    sender: mpsc::UnboundedSender<Arc<PsychFrame>>,
}

/// # Dispatcher
///
/// In-process [`Publisher`]: tracks open streams and fans frames out to
/// every registered client.
#[derive(Default)]
pub struct Dispatcher {
    clients: Mutex<Vec<ClientHandle>>,
    streams: Mutex<HashSet<u64>>,
    next_stream: AtomicU64,
}

impl Dispatcher {
    /// A dispatcher with no clients and no streams.
    pub fn new() -> Self {
        Self::default()
    }

    /// # Add Client
    ///
    /// Registers a subscriber and returns the receiving end of its queue.
    pub fn add_client(&self, id: &str) -> mpsc::UnboundedReceiver<Arc<PsychFrame>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut clients = self.clients.lock().expect("Dispatcher lock poisoned");
        clients.push(ClientHandle {
            id: id.to_string(),
            sender: tx,
        });
        log::info!("Client '{}' registered", id);
        rx
    }

    /// Removes a subscriber by id.
    pub fn remove_client(&self, id: &str) {
        let mut clients = self.clients.lock().expect("Dispatcher lock poisoned");
        clients.retain(|c| c.id != id);
        log::info!("Client '{}' explicitly removed.", id);
    }

    /// Number of registered subscribers.
    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("Dispatcher lock poisoned").len()
    }

    /// Number of open streams.
    pub fn open_streams(&self) -> usize {
        self.streams.lock().expect("Dispatcher lock poisoned").len()
    }

    fn broadcast(&self, frame: PsychFrame) {
        let frame = Arc::new(frame);
        let mut clients = self.clients.lock().expect("Dispatcher lock poisoned");
        clients.retain(|client| match client.sender.send(Arc::clone(&frame)) {
            Ok(()) => true,
            Err(_) => {
                log::info!("Client '{}' disconnected. Removing from dispatcher.", client.id);
                false
            }
        });
    }
}

impl Publisher for Dispatcher {
    fn create_stream(&self, name: &str) -> Result<StreamHandle, PublishError> {
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed) + 1;
        self.streams
            .lock()
            .expect("Dispatcher lock poisoned")
            .insert(id);
        log::debug!("Opened stream {}#{}", name, id);
        Ok(StreamHandle::new(id, name))
    }

    fn publish(&self, update: &ItemUpdate) -> Result<(), PublishError> {
        let open = self
            .streams
            .lock()
            .expect("Dispatcher lock poisoned")
            .contains(&update.stream.id());
        if !open {
            return Err(PublishError::UnknownStream(update.stream.to_string()));
        }
        self.broadcast(PsychFrame::Refresh(update.clone()));
        Ok(())
    }

    fn withdraw(&self, stream: &StreamHandle) {
        let removed = self
            .streams
            .lock()
            .expect("Dispatcher lock poisoned")
            .remove(&stream.id());
        if removed {
            log::info!("Withdrawing stream {}", stream);
            self.broadcast(PsychFrame::Withdraw {
                stream: stream.clone(),
            });
        }
    }
}
