//! # Resource Catalog
//!
//! The configured feeds as an immutable snapshot. `load` swaps the whole
//! snapshot in one step; cycles already running keep the `Arc` of the
//! definition they started with, so a reload never changes a transfer in
//! flight.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use url::Url;

use crate::configs::{ConfigError, PsychConfig, ResourceConfig};

/// Where a row key is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMapping {
    /// Instrument name of the stream.
    pub display_name: String,
    /// Topic carried in the update header.
    pub topic: String,
}

/// One feed, resolved and ready to poll.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDefinition {
    /// Unique key.
    pub name: String,
    /// Source feed identifier.
    pub source: String,
    /// Absolute feed URL.
    pub url: Url,
    /// Permission code; 0 means unlocked.
    pub entitlement_code: u32,
    /// Column name to field id.
    pub fields: BTreeMap<String, i32>,
    /// Row key to published item.
    pub items: BTreeMap<String, ItemMapping>,
}

impl ResourceDefinition {
    /// Resolves a configured resource against the provider base URL.
    pub fn from_config(config: &ResourceConfig, base_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            name: config.name.clone(),
            source: config.source.clone(),
            url: config.url(base_url)?,
            entitlement_code: config.entitlement_code,
            fields: config.fields.clone(),
            items: config
                .items
                .iter()
                .map(|(key, item)| {
                    (
                        key.clone(),
                        ItemMapping {
                            display_name: item.name.clone(),
                            topic: item.topic.clone(),
                        },
                    )
                })
                .collect(),
        })
    }

    /// Every resource of a configuration.
    pub fn all_from_config(config: &PsychConfig) -> Result<Vec<Self>, ConfigError> {
        config
            .resources
            .iter()
            .map(|r| Self::from_config(r, &config.base_url))
            .collect()
    }
}

/// An immutable view of the catalog.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    generation: u64,
    resources: BTreeMap<String, Arc<ResourceDefinition>>,
}

impl CatalogSnapshot {
    /// Increments on every load.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Looks up one resource.
    pub fn get(&self, name: &str) -> Option<&Arc<ResourceDefinition>> {
        self.resources.get(name)
    }

    /// Resources in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResourceDefinition>> {
        self.resources.values()
    }

    /// Resource names in order.
    pub fn names(&self) -> Vec<String> {
        self.resources.keys().cloned().collect()
    }

    /// Number of resources.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// True for an empty catalog.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// # Resource Catalog
///
/// Shared between the provider facade (reloads, lookups) and the polling
/// worker (cycle starts).
#[derive(Debug, Default)]
pub struct ResourceCatalog {
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl ResourceCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// # Load
    ///
    /// Replaces the catalog. Fails without touching the current snapshot if
    /// two definitions share a name.
    pub fn load(&self, definitions: Vec<ResourceDefinition>) -> Result<Arc<CatalogSnapshot>, ConfigError> {
        let mut resources = BTreeMap::new();
        for definition in definitions {
            let name = definition.name.clone();
            if resources.insert(name.clone(), Arc::new(definition)).is_some() {
                return Err(ConfigError::DuplicateResource(name));
            }
        }

        let mut current = self.current.write().expect("Catalog lock poisoned");
        let snapshot = Arc::new(CatalogSnapshot {
            generation: current.generation + 1,
            resources,
        });
        *current = Arc::clone(&snapshot);
        log::info!(
            "Catalog generation {} loaded with {} resources",
            snapshot.generation,
            snapshot.len()
        );
        Ok(snapshot)
    }

    /// Looks up one resource in the current snapshot.
    pub fn lookup(&self, name: &str) -> Option<Arc<ResourceDefinition>> {
        self.snapshot().get(name).cloned()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.current.read().expect("Catalog lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(name: &str) -> ResourceDefinition {
        ResourceDefinition {
            name: name.to_string(),
            source: "News".to_string(),
            url: Url::parse(&format!("http://127.0.0.1/{}.txt", name)).unwrap(),
            entitlement_code: 0,
            fields: BTreeMap::from([("bid".to_string(), 22)]),
            items: BTreeMap::new(),
        }
    }

    #[test]
    fn test_load_replaces_snapshot() {
        let catalog = ResourceCatalog::new();
        assert!(catalog.lookup("fx").is_none());

        catalog.load(vec![definition("fx"), definition("eq")]).unwrap();
        let held = catalog.lookup("fx").unwrap();
        assert_eq!(catalog.snapshot().generation(), 1);
        assert_eq!(catalog.snapshot().names(), vec!["eq", "fx"]);

        catalog.load(vec![definition("eq")]).unwrap();
        assert!(catalog.lookup("fx").is_none());
        assert_eq!(catalog.snapshot().generation(), 2);
        // Holders of the old definition are unaffected.
        assert_eq!(held.name, "fx");
    }

    #[test]
    fn test_duplicate_load_keeps_previous_snapshot() {
        let catalog = ResourceCatalog::new();
        catalog.load(vec![definition("fx")]).unwrap();

        let err = catalog.load(vec![definition("eq"), definition("eq")]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateResource(name) if name == "eq"));
        assert!(catalog.lookup("fx").is_some());
        assert_eq!(catalog.snapshot().generation(), 1);
    }
}
