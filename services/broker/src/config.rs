//! Broker configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Every field has a default, so the broker runs with no config file at
//! all.  When a file is given, `schema_version = 1` is required.
//!
//! The tunables that were compile-time literals in earlier drafts live
//! here: the batch grow cap, the per-frame size limit, the router queue
//! capacity, and the subscription sweep interval.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub listeners: ListenerConfig,
    pub batch: BatchConfig,
    pub router: RouterConfig,
}

/// The three listener endpoints.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: String,
    pub subscriber_port: u16,
    pub publisher_port: u16,
    pub command_port: u16,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// A batch is sealed once it holds at least this many bytes.
    pub grow_cap_bytes: usize,
    /// A single frame may not declare a longer content length.
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Bounded queue between publishers and the fan-out drain; pushes
    /// suspend when full.
    pub queue_capacity: usize,
    /// How often expired subscriptions are purged and disconnected
    /// subscribers reaped.
    pub sweep_interval_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            bind_addr: "0.0.0.0".to_owned(),
            subscriber_port: 5875,
            publisher_port: 5876,
            command_port: 5877,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            grow_cap_bytes: 64 * 1024 * 128,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            queue_capacity: 1_000_000,
            sweep_interval_ms: 1000,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            listeners: ListenerConfig::default(),
            batch: BatchConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    listeners: Option<RawListenerConfig>,
    batch: Option<RawBatchConfig>,
    router: Option<RawRouterConfig>,
}

#[derive(Debug, Deserialize)]
struct RawListenerConfig {
    bind_addr: Option<String>,
    subscriber_port: Option<u16>,
    publisher_port: Option<u16>,
    command_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawBatchConfig {
    grow_cap_bytes: Option<usize>,
    max_frame_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawRouterConfig {
    queue_capacity: Option<usize>,
    sweep_interval_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load broker config from a TOML file.
pub fn load_config_from_path(path: &Path) -> Result<BrokerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load broker config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<BrokerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let defaults = BrokerConfig::default();

    let listeners = match raw.listeners {
        Some(l) => ListenerConfig {
            bind_addr: l.bind_addr.unwrap_or(defaults.listeners.bind_addr),
            subscriber_port: l
                .subscriber_port
                .unwrap_or(defaults.listeners.subscriber_port),
            publisher_port: l
                .publisher_port
                .unwrap_or(defaults.listeners.publisher_port),
            command_port: l.command_port.unwrap_or(defaults.listeners.command_port),
        },
        None => defaults.listeners,
    };

    let batch = match raw.batch {
        Some(b) => BatchConfig {
            grow_cap_bytes: b.grow_cap_bytes.unwrap_or(defaults.batch.grow_cap_bytes),
            max_frame_bytes: b.max_frame_bytes.unwrap_or(defaults.batch.max_frame_bytes),
        },
        None => defaults.batch,
    };
    if batch.grow_cap_bytes == 0 {
        return Err(ConfigError::InvalidValue(
            "batch.grow_cap_bytes must be > 0".to_owned(),
        ));
    }
    if batch.max_frame_bytes == 0 {
        return Err(ConfigError::InvalidValue(
            "batch.max_frame_bytes must be > 0".to_owned(),
        ));
    }

    let router = match raw.router {
        Some(r) => RouterConfig {
            queue_capacity: r.queue_capacity.unwrap_or(defaults.router.queue_capacity),
            sweep_interval_ms: r
                .sweep_interval_ms
                .unwrap_or(defaults.router.sweep_interval_ms),
        },
        None => defaults.router,
    };
    if router.queue_capacity == 0 {
        return Err(ConfigError::InvalidValue(
            "router.queue_capacity must be > 0".to_owned(),
        ));
    }
    if router.sweep_interval_ms == 0 {
        return Err(ConfigError::InvalidValue(
            "router.sweep_interval_ms must be > 0".to_owned(),
        ));
    }

    Ok(BrokerConfig {
        listeners,
        batch,
        router,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
