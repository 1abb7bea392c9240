//! # Performance Counters
//!
//! Two parallel arrays over a closed set of counter kinds. The cumulative
//! array only ever grows; the windowed array is copied and zeroed by
//! [`Counters::snapshot`], giving callers a per-interval rate without
//! disturbing the totals. The last observed clock offsets are kept beside
//! them as gauges.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Every counted outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    /// Scheduler fires received.
    TimerQueries,
    /// Manual republish commands received.
    ManualQueries,
    /// Resources skipped because their previous cycle was still running too long.
    LateCycles,
    /// HTTP requests issued, retries included.
    RequestsSent,
    /// 1xx responses.
    Http1xxReceived,
    /// 2xx responses.
    Http2xxReceived,
    /// 3xx responses.
    Http3xxReceived,
    /// 4xx responses.
    Http4xxReceived,
    /// 5xx responses.
    Http5xxReceived,
    /// 200 responses.
    Http200Received,
    /// 304 responses.
    Http304Received,
    /// Rejected feeds plus dropped rows.
    Malformed,
    /// Cycles abandoned after the retry budget ran out.
    RetriesExceeded,
    /// Server `Date` offset beyond tolerance.
    WebserverClockDrift,
    /// Content `Last-Modified` offset beyond tolerance.
    FilesystemClockDrift,
    /// Feed close time offset beyond tolerance.
    FeedClockDrift,
    /// Updates refused by the publisher.
    PublishNacks,
}

impl CounterKind {
    /// Every kind, in array order.
    pub const ALL: [CounterKind; COUNTER_KINDS] = [
        CounterKind::TimerQueries,
        CounterKind::ManualQueries,
        CounterKind::LateCycles,
        CounterKind::RequestsSent,
        CounterKind::Http1xxReceived,
        CounterKind::Http2xxReceived,
        CounterKind::Http3xxReceived,
        CounterKind::Http4xxReceived,
        CounterKind::Http5xxReceived,
        CounterKind::Http200Received,
        CounterKind::Http304Received,
        CounterKind::Malformed,
        CounterKind::RetriesExceeded,
        CounterKind::WebserverClockDrift,
        CounterKind::FilesystemClockDrift,
        CounterKind::FeedClockDrift,
        CounterKind::PublishNacks,
    ];

    /// Stable name used in logs and diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            CounterKind::TimerQueries => "timer_queries",
            CounterKind::ManualQueries => "manual_queries",
            CounterKind::LateCycles => "late_cycles",
            CounterKind::RequestsSent => "requests_sent",
            CounterKind::Http1xxReceived => "http_1xx_received",
            CounterKind::Http2xxReceived => "http_2xx_received",
            CounterKind::Http3xxReceived => "http_3xx_received",
            CounterKind::Http4xxReceived => "http_4xx_received",
            CounterKind::Http5xxReceived => "http_5xx_received",
            CounterKind::Http200Received => "http_200_received",
            CounterKind::Http304Received => "http_304_received",
            CounterKind::Malformed => "malformed",
            CounterKind::RetriesExceeded => "retries_exceeded",
            CounterKind::WebserverClockDrift => "webserver_clock_drift",
            CounterKind::FilesystemClockDrift => "filesystem_clock_drift",
            CounterKind::FeedClockDrift => "feed_clock_drift",
            CounterKind::PublishNacks => "publish_nacks",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Status-class counter for an HTTP status, if it falls in 100..=599.
    pub fn status_class(status: u16) -> Option<CounterKind> {
        match status {
            100..=199 => Some(CounterKind::Http1xxReceived),
            200..=299 => Some(CounterKind::Http2xxReceived),
            300..=399 => Some(CounterKind::Http3xxReceived),
            400..=499 => Some(CounterKind::Http4xxReceived),
            500..=599 => Some(CounterKind::Http5xxReceived),
            _ => None,
        }
    }
}

/// Number of counter kinds.
pub const COUNTER_KINDS: usize = 17;

/// Clock offsets in seconds from the most recent 200 response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriftGauges {
    /// Server `Date` minus request time.
    pub webserver: Option<i64>,
    /// Content `Last-Modified` minus request time.
    pub filesystem: Option<i64>,
    /// Feed close time minus request time.
    pub feed: Option<i64>,
}

/// A copy of the counters at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    /// When the copy was taken.
    pub taken_at: DateTime<Utc>,
    /// Start of the window the windowed values cover.
    pub window_started: DateTime<Utc>,
    /// Totals since the counters were created.
    pub cumulative: BTreeMap<&'static str, u64>,
    /// Totals since `window_started`.
    pub windowed: BTreeMap<&'static str, u64>,
    /// Last observed clock offsets.
    pub drift: DriftGauges,
}

impl CounterSnapshot {
    /// Cumulative value of one kind.
    pub fn cumulative(&self, kind: CounterKind) -> u64 {
        self.cumulative.get(kind.name()).copied().unwrap_or(0)
    }

    /// Windowed value of one kind.
    pub fn windowed(&self, kind: CounterKind) -> u64 {
        self.windowed.get(kind.name()).copied().unwrap_or(0)
    }
}

/// # Counters
///
/// Owned by the pipeline state; the worker increments under the write lock
/// and diagnostics read under the read lock.
#[derive(Debug, Clone)]
pub struct Counters {
    cumulative: [u64; COUNTER_KINDS],
    windowed: [u64; COUNTER_KINDS],
    window_started: DateTime<Utc>,
    drift: DriftGauges,
}

impl Counters {
    /// Zeroed counters with a window starting at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            cumulative: [0; COUNTER_KINDS],
            windowed: [0; COUNTER_KINDS],
            window_started: now,
            drift: DriftGauges::default(),
        }
    }

    /// Adds one to both arrays.
    pub fn increment(&mut self, kind: CounterKind) {
        self.add(kind, 1);
    }

    /// Adds `n` to both arrays.
    pub fn add(&mut self, kind: CounterKind, n: u64) {
        let i = kind.index();
        self.cumulative[i] = self.cumulative[i].saturating_add(n);
        self.windowed[i] = self.windowed[i].saturating_add(n);
    }

    /// Current cumulative value.
    pub fn cumulative(&self, kind: CounterKind) -> u64 {
        self.cumulative[kind.index()]
    }

    /// Current windowed value.
    pub fn windowed(&self, kind: CounterKind) -> u64 {
        self.windowed[kind.index()]
    }

    /// Mutable access to the drift gauges.
    pub fn drift_mut(&mut self) -> &mut DriftGauges {
        &mut self.drift
    }

    /// Copy without resetting anything.
    pub fn view(&self, now: DateTime<Utc>) -> CounterSnapshot {
        CounterSnapshot {
            taken_at: now,
            window_started: self.window_started,
            cumulative: named(&self.cumulative),
            windowed: named(&self.windowed),
            drift: self.drift,
        }
    }

    /// # Snapshot
    ///
    /// Copies both arrays, then zeroes the windowed one and starts a new
    /// window at `now`.
    pub fn snapshot(&mut self, now: DateTime<Utc>) -> CounterSnapshot {
        let copy = self.view(now);
        self.windowed = [0; COUNTER_KINDS];
        self.window_started = now;
        copy
    }
}

fn named(values: &[u64; COUNTER_KINDS]) -> BTreeMap<&'static str, u64> {
    CounterKind::ALL
        .iter()
        .map(|kind| (kind.name(), values[kind.index()]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_all_matches_discriminants() {
        for (i, kind) in CounterKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i, "{:?}", kind);
        }
    }

    #[test]
    fn test_snapshot_resets_window_only() {
        let start = Utc::now();
        let mut counters = Counters::new(start);
        counters.increment(CounterKind::RequestsSent);
        counters.add(CounterKind::Malformed, 3);

        let later = start + Duration::seconds(60);
        let first = counters.snapshot(later);
        assert_eq!(first.windowed(CounterKind::RequestsSent), 1);
        assert_eq!(first.windowed(CounterKind::Malformed), 3);
        assert_eq!(first.window_started, start);
        assert_eq!(first.taken_at, later);

        assert_eq!(counters.windowed(CounterKind::RequestsSent), 0);
        assert_eq!(counters.windowed(CounterKind::Malformed), 0);
        assert_eq!(counters.cumulative(CounterKind::RequestsSent), 1);

        counters.increment(CounterKind::RequestsSent);
        let second = counters.snapshot(later + Duration::seconds(60));
        assert_eq!(second.windowed(CounterKind::RequestsSent), 1);
        assert_eq!(second.cumulative(CounterKind::RequestsSent), 2);
        assert_eq!(second.window_started, later);
    }

    #[test]
    fn test_view_does_not_reset() {
        let mut counters = Counters::new(Utc::now());
        counters.increment(CounterKind::Http304Received);
        counters.drift_mut().webserver = Some(-2);
        let view = counters.view(Utc::now());
        assert_eq!(view.windowed(CounterKind::Http304Received), 1);
        assert_eq!(view.drift.webserver, Some(-2));
        assert_eq!(counters.windowed(CounterKind::Http304Received), 1);
    }

    #[test]
    fn test_status_classes() {
        assert_eq!(CounterKind::status_class(101), Some(CounterKind::Http1xxReceived));
        assert_eq!(CounterKind::status_class(304), Some(CounterKind::Http3xxReceived));
        assert_eq!(CounterKind::status_class(503), Some(CounterKind::Http5xxReceived));
        assert_eq!(CounterKind::status_class(42), None);
    }
}
