//! # Caching DNS Resolver
//!
//! Feed hosts are resolved once per TTL window instead of once per request.
//! Lookups go through `tokio::net::lookup_host`; failures are never cached.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::dns::{Addrs, Name, Resolve, Resolving};

/// Host to addresses, with the instant each entry was stored.
#[derive(Debug, Default)]
pub struct DnsTable {
    entries: HashMap<String, (Instant, Vec<SocketAddr>)>,
}

impl DnsTable {
    /// Cached addresses for `host` if the entry is younger than `ttl`.
    pub fn get(&self, host: &str, ttl: Duration, now: Instant) -> Option<Vec<SocketAddr>> {
        self.entries
            .get(host)
            .filter(|(stored, _)| now.saturating_duration_since(*stored) < ttl)
            .map(|(_, addrs)| addrs.clone())
    }

    /// Stores a fresh answer.
    pub fn put(&mut self, host: &str, addrs: Vec<SocketAddr>, now: Instant) {
        self.entries.insert(host.to_string(), (now, addrs));
    }

    /// Drops entries older than `ttl`.
    pub fn purge(&mut self, ttl: Duration, now: Instant) {
        self.entries
            .retain(|_, (stored, _)| now.saturating_duration_since(*stored) < ttl);
    }

    /// Number of stored hosts.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `reqwest` resolver backed by a [`DnsTable`].
#[derive(Debug, Clone)]
pub struct CachingResolver {
    ttl: Duration,
    table: Arc<Mutex<DnsTable>>,
}

impl CachingResolver {
    /// A resolver that reuses answers for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            table: Arc::new(Mutex::new(DnsTable::default())),
        }
    }
}

impl Resolve for CachingResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        let ttl = self.ttl;
        let table = Arc::clone(&self.table);

        Box::pin(async move {
            let cached = {
                let table = table.lock().expect("DNS cache lock poisoned");
                table.get(&host, ttl, Instant::now())
            };
            if let Some(addrs) = cached {
                log::trace!("DNS cache hit for {}", host);
                let addrs: Addrs = Box::new(addrs.into_iter());
                return Ok(addrs);
            }

            // Port is replaced by the connector.
            let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await?
                .collect();
            log::debug!("Resolved {} to {} addresses", host, resolved.len());

            {
                let now = Instant::now();
                let mut table = table.lock().expect("DNS cache lock poisoned");
                table.purge(ttl, now);
                table.put(&host, resolved.clone(), now);
            }
            let addrs: Addrs = Box::new(resolved.into_iter());
            Ok(addrs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let ttl = Duration::from_secs(60);
        let start = Instant::now();
        let mut table = DnsTable::default();
        table.put("feeds.example.com", vec![addr("10.0.0.1:0")], start);

        assert_eq!(
            table.get("feeds.example.com", ttl, start + Duration::from_secs(59)),
            Some(vec![addr("10.0.0.1:0")])
        );
        assert_eq!(table.get("feeds.example.com", ttl, start + ttl), None);
        assert_eq!(table.get("other.example.com", ttl, start), None);
    }

    #[test]
    fn test_purge_keeps_fresh_entries() {
        let ttl = Duration::from_secs(10);
        let start = Instant::now();
        let mut table = DnsTable::default();
        table.put("old", vec![addr("10.0.0.1:0")], start);
        table.put("new", vec![addr("10.0.0.2:0")], start + Duration::from_secs(8));

        table.purge(ttl, start + Duration::from_secs(12));
        assert_eq!(table.len(), 1);
        assert!(table.get("new", ttl, start + Duration::from_secs(12)).is_some());
    }
}
