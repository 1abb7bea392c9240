//! # Provider Configuration
//!
//! A single JSON document describes the publication service, the poll
//! cadence, the retry budget, the HTTP transport and the list of feed
//! resources. Every optional timing has a default; resources have none.
//!
//! ```json
//! {
//!   "serviceName": "MARKETPSYCH",
//!   "entitlementServiceId": 1234,
//!   "baseUrl": "https://feeds.example.com/",
//!   "interval": 60,
//!   "timeOffsetConstant": "00:00:30",
//!   "resources": [
//!     {
//!       "name": "currencies",
//!       "source": "News_Social",
//!       "path": "cur/latest.txt",
//!       "entitlementCode": 6205,
//!       "fields": { "Buzz": 3001, "Sentiment": 3002 },
//!       "items": { "EUR": { "name": "EUR=MP", "topic": "MP/CUR" } }
//!     }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid JSON or does not match the expected shape.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// A provider-level setting is out of range.
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// The offending key.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// Two resources share a name.
    #[error("Duplicate resource name: {0}")]
    DuplicateResource(String),

    /// A single resource definition is unusable.
    #[error("Resource {resource}: {reason}")]
    Resource {
        /// Name of the resource.
        resource: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Content encoding requested from the feed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpEncoding {
    /// No compression.
    #[default]
    Identity,
    /// `Accept-Encoding: gzip`.
    Gzip,
    /// `Accept-Encoding: deflate`.
    Deflate,
}

/// Display name and topic a row key publishes under.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ItemConfig {
    /// Instrument name of the published stream.
    pub name: String,
    /// Topic carried in the update header.
    pub topic: String,
}

/// One configured feed.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    /// Unique key, used in logs and diagnostics.
    pub name: String,
    /// Source feed identifier, published as the source name field.
    pub source: String,
    /// Path relative to `baseUrl`, or an absolute URL.
    pub path: String,
    /// Permission code; 0 publishes unlocked.
    #[serde(default)]
    pub entitlement_code: u32,
    /// Column name to field id.
    pub fields: BTreeMap<String, i32>,
    /// Row key to published item.
    pub items: BTreeMap<String, ItemConfig>,
}

impl ResourceConfig {
    /// Resolves the feed URL against the provider base URL.
    pub fn url(&self, base_url: &str) -> Result<Url, ConfigError> {
        if let Ok(url) = Url::parse(&self.path) {
            return Ok(url);
        }
        Url::parse(&format!("{}{}", base_url, self.path)).map_err(|e| ConfigError::Resource {
            resource: self.name.clone(),
            reason: format!("invalid url {}{}: {}", base_url, self.path, e),
        })
    }
}

/// The complete provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PsychConfig {
    /// Publication service name.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Numeric service id stamped into entitlement locks.
    #[serde(default)]
    pub entitlement_service_id: u32,
    /// Prefix joined with each resource path.
    #[serde(default)]
    pub base_url: String,

    /// Poll interval in seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Time of day the interval grid is anchored to, `HH:MM:SS`.
    #[serde(default = "default_time_offset")]
    pub time_offset_constant: String,
    /// How late a timer or an outstanding cycle may run before it is reported, in milliseconds.
    #[serde(default = "default_tolerable_delay")]
    pub tolerable_delay: u64,

    /// Attempts per cycle, the first request included.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Pause between attempts; 0 selects exponential backoff.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Budget for all attempts of one cycle.
    #[serde(default = "default_retry_timeout_ms")]
    pub retry_timeout_ms: u64,

    /// Whole-request timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Connection phase timeout.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Allow multiplexed HTTP/2 connections; HTTP/1.1 only when off.
    #[serde(default)]
    pub enable_http_pipelining: bool,
    /// Requested content encoding.
    #[serde(default)]
    pub request_http_encoding: HttpEncoding,
    /// Proxy for every request, e.g. `http://proxy:3128`.
    #[serde(default)]
    pub http_proxy: Option<String>,
    /// Seconds a DNS answer is reused; 0 disables the cache.
    #[serde(default = "default_dns_cache_timeout")]
    pub dns_cache_timeout: u64,

    /// Smallest acceptable body in bytes.
    #[serde(default = "default_minimum_response_size")]
    pub minimum_response_size: usize,
    /// Largest acceptable body in bytes; 0 disables the limit.
    #[serde(default = "default_maximum_response_size")]
    pub maximum_response_size: usize,
    /// Required `Content-Type` prefix, if any.
    #[serde(default = "default_content_type")]
    pub expected_content_type: Option<String>,

    /// Clock offsets above this many seconds are counted as drift.
    #[serde(default = "default_drift_tolerance")]
    pub drift_tolerance: u64,
    /// Clock offsets at or above this many seconds shut the core down; 0 disables.
    #[serde(default)]
    pub panic_threshold: u64,

    /// Feed resources.
    pub resources: Vec<ResourceConfig>,
}

fn default_service_name() -> String {
    "MARKETPSYCH".to_string()
}
fn default_interval() -> u64 {
    60
}
fn default_time_offset() -> String {
    "00:00:00".to_string()
}
fn default_tolerable_delay() -> u64 {
    1000
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_retry_timeout_ms() -> u64 {
    30_000
}
fn default_timeout_ms() -> u64 {
    15_000
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_dns_cache_timeout() -> u64 {
    60
}
fn default_minimum_response_size() -> usize {
    8
}
fn default_maximum_response_size() -> usize {
    8 * 1024 * 1024
}
fn default_content_type() -> Option<String> {
    Some("text/plain".to_string())
}
fn default_drift_tolerance() -> u64 {
    5
}

impl PsychConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: PsychConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config = Self::from_json_str(&raw)?;
        log::info!(
            "Loaded configuration from {}: {} resources, interval {}s",
            path.display(),
            config.resources.len(),
            config.interval
        );
        Ok(config)
    }

    /// # Validate
    ///
    /// Checks every value the core relies on. Called by both loaders; call it
    /// again after mutating a configuration by hand.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval == 0 {
            return Err(invalid("interval", "must be at least one second"));
        }
        if self.interval > 86_400 {
            return Err(invalid("interval", "must not exceed one day"));
        }
        self.time_offset()?;
        if self.retry_count == 0 {
            return Err(invalid("retryCount", "must allow at least one attempt"));
        }
        if self.timeout_ms == 0 {
            return Err(invalid("timeoutMs", "must be positive"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(invalid("connectTimeoutMs", "must be positive"));
        }
        if self.maximum_response_size != 0 && self.minimum_response_size > self.maximum_response_size {
            return Err(invalid(
                "minimumResponseSize",
                "is larger than maximumResponseSize",
            ));
        }
        if let Some(proxy) = &self.http_proxy {
            if Url::parse(proxy).is_err() {
                return Err(invalid("httpProxy", &format!("{} is not a URL", proxy)));
            }
        }

        let mut names = HashSet::new();
        for resource in &self.resources {
            if !names.insert(resource.name.as_str()) {
                return Err(ConfigError::DuplicateResource(resource.name.clone()));
            }
            if resource.path.is_empty() {
                return Err(ConfigError::Resource {
                    resource: resource.name.clone(),
                    reason: "empty path".to_string(),
                });
            }
            if resource.fields.is_empty() {
                return Err(ConfigError::Resource {
                    resource: resource.name.clone(),
                    reason: "no field mappings".to_string(),
                });
            }
            let mut ids = HashSet::new();
            for id in resource.fields.values() {
                if !ids.insert(*id) {
                    return Err(ConfigError::Resource {
                        resource: resource.name.clone(),
                        reason: format!("field id {} mapped twice", id),
                    });
                }
            }
            resource.url(&self.base_url)?;
        }
        Ok(())
    }

    /// Anchor of the poll grid.
    pub fn time_offset(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(&self.time_offset_constant, "%H:%M:%S").map_err(|e| {
            invalid(
                "timeOffsetConstant",
                &format!("{:?} is not HH:MM:SS: {}", self.time_offset_constant, e),
            )
        })
    }

    /// Poll interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// Tolerable timer and cycle lateness.
    pub fn tolerable_delay(&self) -> Duration {
        Duration::from_millis(self.tolerable_delay)
    }

    /// Whole-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"{
        "baseUrl": "http://127.0.0.1:8080/",
        "resources": [
            {
                "name": "fx",
                "source": "News",
                "path": "fx.txt",
                "fields": { "bid": 22, "ask": 25 },
                "items": { "FX.EUR": { "name": "EURUSD", "topic": "FX" } }
            }
        ]
    }"#;

    #[test]
    fn test_defaults_fill_optional_timings() {
        let config = PsychConfig::from_json_str(MINIMAL).unwrap();
        assert_eq!(config.interval, 60);
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.request_http_encoding, HttpEncoding::Identity);
        assert_eq!(config.expected_content_type.as_deref(), Some("text/plain"));
        assert_eq!(config.time_offset().unwrap(), NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        assert_eq!(
            config.resources[0].url(&config.base_url).unwrap().as_str(),
            "http://127.0.0.1:8080/fx.txt"
        );
    }

    #[test]
    fn test_absolute_path_ignores_base_url() {
        let json = MINIMAL.replace("\"fx.txt\"", "\"https://other.example.com/a.txt\"");
        let config = PsychConfig::from_json_str(&json).unwrap();
        assert_eq!(
            config.resources[0].url(&config.base_url).unwrap().host_str(),
            Some("other.example.com")
        );
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let mut config = PsychConfig::from_json_str(MINIMAL).unwrap();
        config.resources.push(config.resources[0].clone());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateResource(name)) if name == "fx"
        ));
    }

    #[test]
    fn test_bad_time_offset_rejected() {
        let json = MINIMAL.replace("\"resources\"", "\"timeOffsetConstant\": \"25:99\", \"resources\"");
        let err = PsychConfig::from_json_str(&json).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "timeOffsetConstant", .. }));
    }

    #[test]
    fn test_zero_retry_count_rejected() {
        let json = MINIMAL.replace("\"resources\"", "\"retryCount\": 0, \"resources\"");
        assert!(PsychConfig::from_json_str(&json).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = PsychConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.resources.len(), 1);

        let missing = PsychConfig::load_from_file(Path::new("/nonexistent/psych.json"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
