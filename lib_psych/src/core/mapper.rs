//! # Publication Mapper
//!
//! Joins a parsed feed with its resource's item and field maps and turns
//! every mapped row into one [`ItemUpdate`].
//!
//! ## Rules
//! - Rows whose key has no item mapping are dropped silently.
//! - Columns without a field id are ignored; field ids whose column is not
//!   in the feed are left out of the update, never filled with a default.
//! - Values are rounded half-up to six decimals; NaN publishes as blank.
//! - A refused update is counted and left for the next poll.
//! - Every (resource, row key) owns its publisher stream, even when two
//!   resources publish the same display name.
//! - A row key missing from [`STALE_AFTER_MISSES`] consecutive feeds of its
//!   resource gets exactly one withdraw.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::core::catalog::ResourceDefinition;
use crate::core::dispatcher::{FieldEntry, FieldValue, ItemUpdate, Publisher, StreamHandle, UpdateHeader};
use crate::core::entitlement::EntitlementLock;
use crate::markets::psych::{mantissa, ParsedFeed};

/// Consecutive 200 feeds a row key may be absent from before it is withdrawn.
pub const STALE_AFTER_MISSES: u32 = 2;

/// Publication state of one (resource, row key).
#[derive(Debug, Clone, Serialize)]
pub struct ItemStream {
    /// Owning resource.
    pub resource: String,
    /// Row key in the feed.
    pub row_key: String,
    /// Publisher handle.
    pub handle: StreamHandle,
    /// Lock attached to the last update.
    pub lock: Option<EntitlementLock>,
    /// Fields of the last acknowledged update.
    pub last_delivered: Option<Vec<FieldEntry>>,
    /// Consecutive feeds without this row key.
    pub misses: u32,
}

/// Every live [`ItemStream`].
#[derive(Debug, Default)]
pub struct StreamTable {
    streams: BTreeMap<(String, String), ItemStream>,
}

impl StreamTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up one stream.
    pub fn get(&self, resource: &str, row_key: &str) -> Option<&ItemStream> {
        self.streams.get(&(resource.to_string(), row_key.to_string()))
    }

    /// Streams belonging to one resource.
    pub fn for_resource<'a>(&'a self, resource: &'a str) -> impl Iterator<Item = &'a ItemStream> + 'a {
        self.streams.values().filter(move |s| s.resource == resource)
    }

    /// Number of streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// True when nothing is published.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Withdraws every stream of `resource`. Returns how many were dropped.
    pub fn remove_resource(&mut self, resource: &str, publisher: &dyn Publisher) -> usize {
        let keys: Vec<(String, String)> = self
            .streams
            .keys()
            .filter(|(r, _)| r == resource)
            .cloned()
            .collect();
        self.withdraw_keys(keys, publisher)
    }

    fn withdraw_keys(&mut self, keys: Vec<(String, String)>, publisher: &dyn Publisher) -> usize {
        let mut withdrawn = 0;
        for key in keys {
            if let Some(stream) = self.streams.remove(&key) {
                publisher.withdraw(&stream.handle);
                withdrawn += 1;
            }
        }
        withdrawn
    }

    // Bumps the miss count of every stream of `resource` not in `seen` and
    // withdraws the ones that reached the staleness limit.
    fn age_missing(&mut self, resource: &str, seen: &HashSet<&str>, publisher: &dyn Publisher) -> usize {
        let mut stale = Vec::new();
        for (key, stream) in self.streams.iter_mut() {
            if stream.resource != resource || seen.contains(stream.row_key.as_str()) {
                continue;
            }
            stream.misses += 1;
            if stream.misses >= STALE_AFTER_MISSES {
                log::info!(
                    "Row {:?} of {} missing from {} feeds, withdrawing {}",
                    stream.row_key,
                    resource,
                    stream.misses,
                    stream.handle
                );
                stale.push(key.clone());
            }
        }
        self.withdraw_keys(stale, publisher)
    }
}

/// Result of mapping one feed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MapOutcome {
    /// Updates acknowledged.
    pub published: usize,
    /// Updates or stream opens refused.
    pub nacked: usize,
    /// Rows without an item mapping.
    pub unmapped: usize,
    /// Streams withdrawn as stale.
    pub withdrawn: usize,
}

/// # Publication Mapper
#[derive(Debug, Clone)]
pub struct PublicationMapper {
    service_id: u32,
}

impl PublicationMapper {
    /// A mapper stamping locks with `service_id`.
    pub fn new(service_id: u32) -> Self {
        Self { service_id }
    }

    /// Field entries for one row, in column order.
    pub fn resolve_fields(columns: &[String], values: &[f64], fields: &BTreeMap<String, i32>) -> Vec<FieldEntry> {
        columns
            .iter()
            .zip(values)
            .filter_map(|(column, value)| {
                let field_id = *fields.get(column)?;
                let value = mantissa(*value).map_or(FieldValue::Blank, FieldValue::Real);
                Some(FieldEntry { field_id, value })
            })
            .collect()
    }

    /// # Map Feed
    ///
    /// Publishes every mapped row of `feed` and applies the staleness rule
    /// to the resource's other streams. Only call this for 200 responses.
    pub fn map_feed(
        &self,
        table: &mut StreamTable,
        resource: &ResourceDefinition,
        feed: &ParsedFeed,
        publisher: &dyn Publisher,
    ) -> MapOutcome {
        let mut outcome = MapOutcome::default();
        let lock = EntitlementLock::for_code(self.service_id, resource.entitlement_code);
        let engine_version = feed.engine_version().map(str::to_string);
        let timestamp = feed.close_time();
        let mut seen: HashSet<&str> = HashSet::new();

        for row in &feed.rows {
            let Some(item) = resource.items.get(&row.key) else {
                log::trace!("Unmapped row {:?} in {}", row.key, resource.name);
                outcome.unmapped += 1;
                continue;
            };
            seen.insert(row.key.as_str());

            let key = (resource.name.clone(), row.key.clone());
            // A reload may have renamed the instrument.
            if table.streams.get(&key).is_some_and(|s| s.handle.name() != item.display_name) {
                table.withdraw_keys(vec![key.clone()], publisher);
            }

            let stream = match table.streams.entry(key) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => match publisher.create_stream(&item.display_name) {
                    Ok(handle) => entry.insert(ItemStream {
                        resource: resource.name.clone(),
                        row_key: row.key.clone(),
                        handle,
                        lock: None,
                        last_delivered: None,
                        misses: 0,
                    }),
                    Err(e) => {
                        log::warn!("Cannot open stream {} for {}: {}", item.display_name, resource.name, e);
                        outcome.nacked += 1;
                        continue;
                    }
                },
            };
            stream.misses = 0;
            stream.lock = lock.clone();

            let update = ItemUpdate {
                stream: stream.handle.clone(),
                lock: lock.clone(),
                header: UpdateHeader {
                    display_name: item.display_name.clone(),
                    topic: item.topic.clone(),
                    source: resource.source.clone(),
                    engine_version: engine_version.clone(),
                    timestamp,
                },
                fields: Self::resolve_fields(&feed.columns, &row.values, &resource.fields),
            };

            match publisher.publish(&update) {
                Ok(()) => {
                    log::trace!("Published {} from {}", stream.handle, resource.name);
                    stream.last_delivered = Some(update.fields);
                    outcome.published += 1;
                }
                Err(e) => {
                    log::warn!("Publish to {} refused: {}", stream.handle, e);
                    outcome.nacked += 1;
                }
            }
        }

        outcome.withdrawn = table.age_missing(&resource.name, &seen, publisher);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::ItemMapping;
    use crate::core::dispatcher::{PsychFrame, Dispatcher, PublishError};
    use crate::markets::psych::parse_feed;
    use std::sync::Mutex;
    use url::Url;

    fn fx_resource(code: u32) -> ResourceDefinition {
        ResourceDefinition {
            name: "fx".to_string(),
            source: "News".to_string(),
            url: Url::parse("http://127.0.0.1/fx.txt").unwrap(),
            entitlement_code: code,
            fields: BTreeMap::from([("bid".to_string(), 22), ("ask".to_string(), 25)]),
            items: BTreeMap::from([(
                "FX.EUR".to_string(),
                ItemMapping {
                    display_name: "EURUSD".to_string(),
                    topic: "FX".to_string(),
                },
            )]),
        }
    }

    fn refreshes(rx: &mut tokio::sync::mpsc::UnboundedReceiver<std::sync::Arc<PsychFrame>>) -> Vec<ItemUpdate> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let PsychFrame::Refresh(update) = frame.as_ref() {
                out.push(update.clone());
            }
        }
        out
    }

    #[test]
    fn test_example_feed_maps_to_one_update() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.add_client("test");
        let mut table = StreamTable::new();
        let mapper = PublicationMapper::new(0);

        let feed = parse_feed("RIC,bid,ask\nFX.EUR,1.1000,1.1005\n").unwrap();
        let outcome = mapper.map_feed(&mut table, &fx_resource(0), &feed, &dispatcher);
        assert_eq!(outcome.published, 1);

        let updates = refreshes(&mut rx);
        assert_eq!(updates.len(), 1);
        let update = &updates[0];
        assert_eq!(update.stream.name(), "EURUSD");
        assert_eq!(update.header.topic, "FX");
        assert_eq!(update.lock, None);
        assert_eq!(
            update.fields,
            vec![
                FieldEntry { field_id: 22, value: FieldValue::Real(1_100_000) },
                FieldEntry { field_id: 25, value: FieldValue::Real(1_100_500) },
            ]
        );
        assert_eq!(
            table.get("fx", "FX.EUR").unwrap().last_delivered.as_ref(),
            Some(&update.fields)
        );
    }

    #[test]
    fn test_unmapped_rows_and_columns_are_dropped() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.add_client("test");
        let mut table = StreamTable::new();
        let mapper = PublicationMapper::new(77);

        let feed = parse_feed("RIC,ask,volume\nFX.GBP,1.3,5\nFX.EUR,NaN,7\n").unwrap();
        let outcome = mapper.map_feed(&mut table, &fx_resource(6205), &feed, &dispatcher);
        assert_eq!(outcome.unmapped, 1);
        assert_eq!(outcome.published, 1);

        let updates = refreshes(&mut rx);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].stream.name(), "EURUSD");
        // bid absent from the feed, volume absent from the field map.
        assert_eq!(updates[0].fields, vec![FieldEntry { field_id: 25, value: FieldValue::Blank }]);
        let lock = updates[0].lock.as_ref().unwrap();
        assert_eq!((lock.service_id(), lock.codes()), (77, &[6205u32][..]));
        assert!(table.get("fx", "FX.GBP").is_none());
    }

    #[test]
    fn test_two_missing_feeds_withdraw_once() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.add_client("test");
        let mut table = StreamTable::new();
        let mapper = PublicationMapper::new(0);
        let resource = fx_resource(0);

        let present = parse_feed("RIC,bid\nFX.EUR,1\n").unwrap();
        let absent = parse_feed("RIC,bid\nFX.JPY,1\n").unwrap();

        mapper.map_feed(&mut table, &resource, &present, &dispatcher);
        assert_eq!(mapper.map_feed(&mut table, &resource, &absent, &dispatcher).withdrawn, 0);
        assert_eq!(table.get("fx", "FX.EUR").unwrap().misses, 1);
        assert_eq!(mapper.map_feed(&mut table, &resource, &absent, &dispatcher).withdrawn, 1);
        assert_eq!(mapper.map_feed(&mut table, &resource, &absent, &dispatcher).withdrawn, 0);

        let mut withdraws = 0;
        while let Ok(frame) = rx.try_recv() {
            if matches!(frame.as_ref(), PsychFrame::Withdraw { .. }) {
                withdraws += 1;
            }
        }
        assert_eq!(withdraws, 1);
        assert!(table.get("fx", "FX.EUR").is_none());
        assert_eq!(dispatcher.open_streams(), 0);
    }

    #[test]
    fn test_reappearing_row_resets_misses() {
        let dispatcher = Dispatcher::new();
        let mut table = StreamTable::new();
        let mapper = PublicationMapper::new(0);
        let resource = fx_resource(0);
        let present = parse_feed("RIC,bid\nFX.EUR,1\n").unwrap();
        let absent = parse_feed("RIC,bid\n").unwrap();

        mapper.map_feed(&mut table, &resource, &present, &dispatcher);
        mapper.map_feed(&mut table, &resource, &absent, &dispatcher);
        mapper.map_feed(&mut table, &resource, &present, &dispatcher);
        assert_eq!(mapper.map_feed(&mut table, &resource, &absent, &dispatcher).withdrawn, 0);
        assert_eq!(table.len(), 1);
    }

    struct RefusingPublisher {
        attempts: Mutex<usize>,
    }

    impl Publisher for RefusingPublisher {
        fn create_stream(&self, name: &str) -> Result<StreamHandle, PublishError> {
            Ok(StreamHandle::new(1, name))
        }
        fn publish(&self, _update: &ItemUpdate) -> Result<(), PublishError> {
            *self.attempts.lock().unwrap() += 1;
            Err(PublishError::Rejected("no session".to_string()))
        }
        fn withdraw(&self, _stream: &StreamHandle) {}
    }

    #[test]
    fn test_nack_is_counted_not_retried() {
        let publisher = RefusingPublisher { attempts: Mutex::new(0) };
        let mut table = StreamTable::new();
        let mapper = PublicationMapper::new(0);
        let feed = parse_feed("RIC,bid\nFX.EUR,1\n").unwrap();

        let outcome = mapper.map_feed(&mut table, &fx_resource(0), &feed, &publisher);
        assert_eq!(outcome.nacked, 1);
        assert_eq!(outcome.published, 0);
        assert_eq!(*publisher.attempts.lock().unwrap(), 1);
        assert!(table.get("fx", "FX.EUR").unwrap().last_delivered.is_none());
    }

    #[test]
    fn test_renamed_item_moves_stream() {
        let dispatcher = Dispatcher::new();
        let mut table = StreamTable::new();
        let mapper = PublicationMapper::new(0);
        let feed = parse_feed("RIC,bid\nFX.EUR,1\n").unwrap();
        let mut resource = fx_resource(0);
        mapper.map_feed(&mut table, &resource, &feed, &dispatcher);

        resource.items.get_mut("FX.EUR").unwrap().display_name = "EUR=".to_string();
        mapper.map_feed(&mut table, &resource, &feed, &dispatcher);
        assert_eq!(table.get("fx", "FX.EUR").unwrap().handle.name(), "EUR=");
        assert_eq!(dispatcher.open_streams(), 1);
    }

    #[test]
    fn test_remove_resource_withdraws_streams() {
        let dispatcher = Dispatcher::new();
        let mut table = StreamTable::new();
        let mapper = PublicationMapper::new(0);
        let feed = parse_feed("RIC,bid\nFX.EUR,1\n").unwrap();
        mapper.map_feed(&mut table, &fx_resource(0), &feed, &dispatcher);

        assert_eq!(table.remove_resource("fx", &dispatcher), 1);
        assert!(table.is_empty());
        assert_eq!(dispatcher.open_streams(), 0);
    }

    #[test]
    fn test_shared_display_name_withdraws_per_resource() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.add_client("test");
        let mut table = StreamTable::new();
        let mapper = PublicationMapper::new(0);
        let fx = fx_resource(0);
        let mut mirror = fx_resource(0);
        mirror.name = "fx-mirror".to_string();

        let present = parse_feed("RIC,bid\nFX.EUR,1\n").unwrap();
        let absent = parse_feed("RIC,bid\n").unwrap();
        mapper.map_feed(&mut table, &fx, &present, &dispatcher);
        mapper.map_feed(&mut table, &mirror, &present, &dispatcher);
        assert_eq!(dispatcher.open_streams(), 2);

        mapper.map_feed(&mut table, &mirror, &absent, &dispatcher);
        assert_eq!(mapper.map_feed(&mut table, &mirror, &absent, &dispatcher).withdrawn, 1);

        let mut withdrawn = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let PsychFrame::Withdraw { stream } = frame.as_ref() {
                withdrawn.push(stream.clone());
            }
        }
        assert_eq!(withdrawn.len(), 1);
        assert_ne!(Some(&withdrawn[0]), table.get("fx", "FX.EUR").map(|s| &s.handle));
        assert_eq!(dispatcher.open_streams(), 1);
        assert!(table.get("fx", "FX.EUR").is_some());
        assert!(table.get("fx-mirror", "FX.EUR").is_none());
    }
}
