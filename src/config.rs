//! Configuration for livewire.
//!
//! Loads TOML with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3000
//!
//! [sync]
//! lanes = 4
//! relay_channel = "livewire:sync"
//!
//! [routes]
//! "submission_created" = ["chat:announcements", "log:stream"]
//! "leaderboard_updated" = ["chat:leaderboard"]
//!
//! [handlers.chat.announcements]
//! url = "${CHAT_WEBHOOK_URL}"
//! format = "embed"
//! ```

use crate::dispatch::DispatcherBuilder;
use crate::event::EventKind;
use crate::handlers::{ChatHandler, Handler, LogHandler};
use crate::registry::RegistryConfig;
use crate::relay::{BackoffPolicy, RelayConfig};
use crate::scheduler::SchedulerConfig;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default priority for handlers registered from the config file.
const ROUTE_PRIORITY: u8 = 3;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Root configuration structure.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub sync: EngineConfig,

    #[serde(default)]
    pub scheduler: TimersConfig,

    /// Routing rules: event kind -> [handler refs] (`log:name`, `chat:name`).
    #[serde(default)]
    pub routes: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub handlers: HandlersConfig,
}

/// HTTP server settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

/// Redis connection settings.
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Core engine tunables.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Instance identifier; defaults to hostname, else a UUID.
    #[serde(default)]
    pub instance_id: Option<String>,

    #[serde(default = "default_lanes")]
    pub lanes: usize,

    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_max_send_timeouts")]
    pub max_send_timeouts: u32,

    #[serde(default = "default_snapshot_limit")]
    pub snapshot_limit: usize,

    #[serde(default = "default_relay_channel")]
    pub relay_channel: String,

    #[serde(default = "default_relay_buffer")]
    pub relay_buffer: usize,

    #[serde(default = "default_backoff_first_ms")]
    pub backoff_first_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            lanes: default_lanes(),
            queue_depth: default_queue_depth(),
            outbound_buffer: default_outbound_buffer(),
            send_timeout_ms: default_send_timeout_ms(),
            max_send_timeouts: default_max_send_timeouts(),
            snapshot_limit: default_snapshot_limit(),
            relay_channel: default_relay_channel(),
            relay_buffer: default_relay_buffer(),
            backoff_first_ms: default_backoff_first_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

fn default_lanes() -> usize {
    4
}

fn default_queue_depth() -> usize {
    1024
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_send_timeout_ms() -> u64 {
    5000
}

fn default_max_send_timeouts() -> u32 {
    3
}

fn default_snapshot_limit() -> usize {
    10
}

fn default_relay_channel() -> String {
    "livewire:sync".to_string()
}

fn default_relay_buffer() -> usize {
    256
}

fn default_backoff_first_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30000
}

fn default_backoff_factor() -> f64 {
    2.0
}

/// Aggregate refresh intervals.
#[derive(Debug, Deserialize, Clone)]
pub struct TimersConfig {
    #[serde(default = "default_leaderboard_secs")]
    pub leaderboard_secs: u64,

    #[serde(default = "default_trending_secs")]
    pub trending_secs: u64,

    #[serde(default = "default_live_stats_secs")]
    pub live_stats_secs: u64,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            leaderboard_secs: default_leaderboard_secs(),
            trending_secs: default_trending_secs(),
            live_stats_secs: default_live_stats_secs(),
        }
    }
}

fn default_leaderboard_secs() -> u64 {
    30
}

fn default_trending_secs() -> u64 {
    300
}

fn default_live_stats_secs() -> u64 {
    10
}

/// Handler configuration container.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HandlersConfig {
    #[serde(default)]
    pub log: HashMap<String, LogHandlerConfig>,

    #[serde(default)]
    pub chat: HashMap<String, ChatHandlerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogHandlerConfig {
    #[serde(default = "default_log_prefix")]
    pub prefix: String,
}

fn default_log_prefix() -> String {
    "livewire".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatHandlerConfig {
    pub url: String,

    #[serde(default = "default_chat_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_chat_retries")]
    pub retries: u32,

    /// "json" (default) or "embed".
    #[serde(default = "default_chat_format")]
    pub format: String,
}

fn default_chat_timeout_ms() -> u64 {
    10000
}

fn default_chat_retries() -> u32 {
    2
}

fn default_chat_format() -> String {
    "json".to_string()
}

impl SyncConfig {
    /// Load configuration from the default path or the `LIVEWIRE_CONFIG`
    /// env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("LIVEWIRE_CONFIG").unwrap_or_else(|_| "config/livewire.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path; missing file means defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        let config: SyncConfig = toml::from_str(&content)?;
        config.validate()?;

        info!(
            routes = config.routes.len(),
            chat_handlers = config.handlers.chat.len(),
            log_handlers = config.handlers.log.len(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// The local instance id: configured value, else hostname, else a UUID.
    pub fn instance_id(&self) -> String {
        if let Some(id) = &self.sync.instance_id {
            return id.clone();
        }

        if let Ok(name) = hostname::get() {
            if let Some(name) = name.to_str() {
                return format!("livewire-{name}");
            }
        }

        format!("livewire-{}", uuid::Uuid::new_v4())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            outbound_buffer: self.sync.outbound_buffer,
            send_timeout: Duration::from_millis(self.sync.send_timeout_ms),
            max_send_timeouts: self.sync.max_send_timeouts,
            snapshot_limit: self.sync.snapshot_limit,
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            channel: self.sync.relay_channel.clone(),
            buffer: self.sync.relay_buffer,
            backoff: BackoffPolicy {
                first: Duration::from_millis(self.sync.backoff_first_ms),
                max: Duration::from_millis(self.sync.backoff_max_ms),
                factor: self.sync.backoff_factor,
            },
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            leaderboard_interval: Duration::from_secs(self.scheduler.leaderboard_secs),
            trending_interval: Duration::from_secs(self.scheduler.trending_secs),
            live_stats_interval: Duration::from_secs(self.scheduler.live_stats_secs),
            leaderboard_limit: self.sync.snapshot_limit,
        }
    }

    /// Registers the configured routes on a dispatcher builder.
    ///
    /// Handler instances are shared across routes that reference the same
    /// name.
    pub fn register_routes(&self, mut builder: DispatcherBuilder) -> DispatcherBuilder {
        let mut log_handlers: HashMap<String, Arc<dyn Handler>> = HashMap::new();
        for (name, config) in &self.handlers.log {
            log_handlers.insert(
                name.clone(),
                Arc::new(LogHandler::with_prefix(&config.prefix)),
            );
        }

        let mut chat_handlers: HashMap<String, Arc<dyn Handler>> = HashMap::new();
        for (name, config) in &self.handlers.chat {
            // A webhook left with an unsubstituted env var is disabled, not
            // fatal.
            if config.url.contains("${") {
                warn!(chat = %name, url = %config.url, "Skipping chat handler with unsubstituted URL");
                continue;
            }

            let mut handler = ChatHandler::new(&config.url)
                .with_timeout(Duration::from_millis(config.timeout_ms))
                .with_retries(config.retries);
            if config.format == "embed" {
                handler = handler.with_embed_format();
            }
            chat_handlers.insert(name.clone(), Arc::new(handler));
        }

        for (kind_str, refs) in &self.routes {
            let kind: EventKind = match kind_str.parse() {
                Ok(kind) => kind,
                Err(e) => {
                    warn!(route = %kind_str, error = %e, "Skipping route for unknown event kind");
                    continue;
                }
            };

            for handler_ref in refs {
                let resolved = match handler_ref.split_once(':') {
                    Some(("log", name)) => log_handlers.get(name).cloned(),
                    Some(("chat", name)) => chat_handlers.get(name).cloned(),
                    Some((other, _)) => {
                        warn!(route = %kind_str, handler = %handler_ref, "Unknown handler type: {other}");
                        continue;
                    }
                    // Bare "log" means a default log handler.
                    None if handler_ref == "log" => {
                        Some(Arc::new(LogHandler::new()) as Arc<dyn Handler>)
                    }
                    None => {
                        warn!(route = %kind_str, handler = %handler_ref, "Invalid handler reference");
                        continue;
                    }
                };

                match resolved {
                    Some(handler) => {
                        debug!(route = %kind_str, handler = %handler_ref, "Registering handler");
                        builder = builder.on(kind, ROUTE_PRIORITY, handler);
                    }
                    None => {
                        warn!(
                            route = %kind_str,
                            handler = %handler_ref,
                            "Route references undefined handler"
                        );
                    }
                }
            }
        }

        builder
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, chat) in &self.handlers.chat {
            if chat.url.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "chat handler '{name}' has empty URL"
                )));
            }

            if chat.url.contains("${") {
                warn!(chat = %name, url = %chat.url, "Chat URL contains unsubstituted environment variable");
            } else if !chat.url.starts_with("http://") && !chat.url.starts_with("https://") {
                return Err(ConfigError::Validation(format!(
                    "chat handler '{name}' URL must start with http:// or https://"
                )));
            }

            if chat.format != "json" && chat.format != "embed" {
                return Err(ConfigError::Validation(format!(
                    "chat handler '{name}' format must be 'json' or 'embed'"
                )));
            }
        }

        if self.sync.backoff_factor < 1.0 {
            return Err(ConfigError::Validation(
                "sync.backoff_factor must be >= 1.0".to_string(),
            ));
        }

        for kind_str in self.routes.keys() {
            if kind_str.parse::<EventKind>().is_err() {
                warn!(route = %kind_str, "Route key is not a known event kind");
            }
        }

        Ok(())
    }
}

/// Substitute environment variables in the form `${VAR_NAME}`.
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("LIVEWIRE_TEST_VAR", "substituted");
        let output = substitute_env_vars("url = \"${LIVEWIRE_TEST_VAR}\"");
        assert_eq!(output, "url = \"substituted\"");
        env::remove_var("LIVEWIRE_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set_keeps_placeholder() {
        let output = substitute_env_vars("url = \"${LIVEWIRE_UNSET_VAR}\"");
        assert_eq!(output, "url = \"${LIVEWIRE_UNSET_VAR}\"");
    }

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert_eq!(config.sync.lanes, 4);
        assert_eq!(config.sync.relay_channel, "livewire:sync");
        assert_eq!(config.scheduler.leaderboard_secs, 30);
        assert_eq!(config.scheduler.live_stats_secs, 10);
    }

    #[test]
    fn test_parse_minimal() {
        let toml = r#"
            [server]
            port = 4000

            [sync]
            lanes = 8
        "#;

        let config: SyncConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.sync.lanes, 8);
        assert_eq!(config.sync.queue_depth, 1024);
    }

    #[test]
    fn test_parse_routes_and_handlers() {
        let toml = r#"
            [routes]
            "submission_created" = ["chat:announcements", "log:stream"]
            "leaderboard_updated" = ["chat:leaderboard"]

            [handlers.log.stream]
            prefix = "stream"

            [handlers.chat.announcements]
            url = "https://chat.example.com/hooks/a"
            format = "embed"

            [handlers.chat.leaderboard]
            url = "https://chat.example.com/hooks/b"
            timeout_ms = 5000
            retries = 1
        "#;

        let config: SyncConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.handlers.chat.len(), 2);
        let announcements = config.handlers.chat.get("announcements").unwrap();
        assert_eq!(announcements.format, "embed");
        let leaderboard = config.handlers.chat.get("leaderboard").unwrap();
        assert_eq!(leaderboard.timeout_ms, 5000);
    }

    #[test]
    fn test_validation_rejects_bad_url() {
        let toml = r#"
            [handlers.chat.bad]
            url = "not-a-url"
        "#;

        let config: SyncConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_format() {
        let toml = r#"
            [handlers.chat.bad]
            url = "https://example.com"
            format = "carrier-pigeon"
        "#;

        let config: SyncConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_shrinking_backoff() {
        let toml = r#"
            [sync]
            backoff_factor = 0.5
        "#;

        let config: SyncConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_instance_id_prefers_configured_value() {
        let mut config = SyncConfig::default();
        config.sync.instance_id = Some("inst-override".to_string());
        assert_eq!(config.instance_id(), "inst-override");

        config.sync.instance_id = None;
        assert!(config.instance_id().starts_with("livewire-"));
    }

    #[test]
    fn test_conversion_helpers() {
        let toml = r#"
            [sync]
            send_timeout_ms = 250
            relay_buffer = 32
            backoff_first_ms = 100

            [scheduler]
            live_stats_secs = 5
        "#;

        let config: SyncConfig = toml::from_str(toml).unwrap();
        assert_eq!(
            config.registry_config().send_timeout,
            Duration::from_millis(250)
        );
        assert_eq!(config.relay_config().buffer, 32);
        assert_eq!(
            config.relay_config().backoff.first,
            Duration::from_millis(100)
        );
        assert_eq!(
            config.scheduler_config().live_stats_interval,
            Duration::from_secs(5)
        );
    }
}
