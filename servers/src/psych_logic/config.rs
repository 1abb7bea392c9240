use anyhow::{Context, Result};
use clap::Parser;
use lib_psych::configs::PsychConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "MarketPsych sentiment feed provider", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "PSYCH_CONFIG_PATH", help = "Path to the server JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "PSYCH_FEED_CONFIG", help = "Path to the feed JSON (resources, timings, transport).")]
    pub feed_config: Option<PathBuf>,

    #[clap(long, env = "PSYCH_ADMIN_HOST", help = "Address the admin server binds to.")]
    pub admin_host: Option<String>,

    #[clap(long, env = "PSYCH_ADMIN_PORT", help = "Port of the admin server.")]
    pub admin_port: Option<u16>,

    #[clap(long, env = "PSYCH_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "PSYCH_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error, fatal).")]
    pub log_level: Option<String>,

    #[clap(long, env = "PSYCH_BASE_URL", help = "Overrides baseUrl of the feed configuration.")]
    pub base_url: Option<String>,

    #[clap(long, env = "PSYCH_INTERVAL", help = "Overrides the poll interval, in seconds.")]
    pub interval: Option<u64>,

    #[clap(long, env = "PSYCH_HTTP_PROXY", help = "Overrides the HTTP proxy.")]
    pub http_proxy: Option<String>,

    #[clap(long, env = "PSYCH_NO_TIMER", help = "Poll only on manual republish (true/false).")]
    pub no_timer: Option<bool>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            feed_config: other.feed_config.or(self.feed_config),
            admin_host: other.admin_host.or(self.admin_host),
            admin_port: other.admin_port.or(self.admin_port),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            base_url: other.base_url.or(self.base_url),
            interval: other.interval.or(self.interval),
            http_proxy: other.http_proxy.or(self.http_proxy),
            no_timer: other.no_timer.or(self.no_timer),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn admin_addr(&self) -> Result<SocketAddr> {
        let host = self.admin_host.as_deref().unwrap_or("127.0.0.1");
        let port = self.admin_port.unwrap_or(9010);
        format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid admin address {}:{}", host, port))
    }

    /// Loads the feed configuration and applies the overrides of this config.
    pub fn load_feed_config(&self) -> Result<PsychConfig> {
        let path = self.feed_config.clone().unwrap_or_else(default_feed_config_path);
        let mut feed = PsychConfig::load_from_file(&path)
            .with_context(|| format!("loading feed configuration {}", path.display()))?;

        if let Some(base_url) = &self.base_url {
            feed.base_url = base_url.clone();
        }
        if let Some(interval) = self.interval {
            feed.interval = interval;
        }
        if let Some(proxy) = &self.http_proxy {
            feed.http_proxy = Some(proxy.clone());
        }
        feed.validate().context("feed configuration after overrides")?;
        Ok(feed)
    }
}

// $XDG_CONFIG_HOME/psych/psych.json, or ./psych.json without a config dir.
fn default_feed_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("psych").join("psych.json"))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from("psych.json"))
}

pub fn load_config() -> Config {
    // 1. Load defaults
    let default_config = Config {
        admin_host: Some("127.0.0.1".to_string()),
        admin_port: Some(9010),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        no_timer: Some(false),
        ..Default::default()
    };

    // 2. Load from config file (server_psych.conf) if present.
    //    Allow overriding default config file path with CLI arg.
    let cli_args = Config::parse();

    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_psych.conf"));

    let mut current_config = default_config;

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
                Ok(file_config) => current_config = current_config.merge(file_config),
                Err(e) => eprintln!(
                    "Failed to parse config file {}: {}. Falling back to other sources.",
                    config_file_path.display(),
                    e
                ),
            },
            Err(e) => eprintln!(
                "Failed to read config file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                e
            ),
        }
    }

    // 3. Override with environment variables and CLI arguments
    current_config.merge(cli_args)
}
