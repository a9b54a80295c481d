//! Broker configuration.
//!
//! [`BrokerConfig`] is the fully resolved form every participant captures at
//! construction. [`BrokerOptions`] is an all-optional overlay: unset fields
//! fall back to the process-wide defaults registry, then to built-ins.
//!
//! Configuration can also be loaded from YAML files or environment variables
//! with the `RRB_` prefix.

use std::sync::RwLock;
use std::time::Duration;

use serde::Deserialize;

/// Default keyspace prefix applied to all generated names.
pub const DEFAULT_PREFIX: &str = "rrb:";

/// Default backend URL.
pub const DEFAULT_URL: &str = "redis://127.0.0.1:6379";

/// Default client request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Backend connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Keyspace prefix isolating applications that share a backend.
    pub prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

/// Fully resolved broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Backend connection configuration.
    pub redis: RedisConfig,
    /// Client request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Minimum recipient count a publisher requires.
    pub minimum_recipients: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            minimum_recipients: 0,
        }
    }
}

impl BrokerConfig {
    /// The request timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Load configuration from file and environment.
    ///
    /// Sources (later overrides earlier):
    /// 1. `rrb.yaml` in the current directory (if present)
    /// 2. File named by the `RRB_CONFIG` environment variable (if set)
    /// 3. Environment variables with `RRB_` prefix (`__` as separator,
    ///    e.g. `RRB_REDIS__PREFIX`)
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new("rrb", FileFormat::Yaml).required(false))
            .add_source(File::new("rrb.yaml", FileFormat::Yaml).required(false));

        if let Ok(config_path) = std::env::var("RRB_CONFIG") {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("RRB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Backend connection overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedisOptions {
    pub url: Option<String>,
    pub prefix: Option<String>,
}

/// All-optional configuration overlay accepted by every participant
/// constructor. Unset fields resolve through [`set_defaults`] and built-ins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerOptions {
    pub redis: Option<RedisOptions>,
    pub timeout_ms: Option<u64>,
    pub minimum_recipients: Option<u64>,
}

impl BrokerOptions {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.redis.get_or_insert_with(Default::default).url = Some(url.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.redis.get_or_insert_with(Default::default).prefix = Some(prefix.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_minimum_recipients(mut self, minimum_recipients: u64) -> Self {
        self.minimum_recipients = Some(minimum_recipients);
        self
    }

    /// Overlay `self` on top of `base`; fields set in `self` win.
    fn merge(self, base: BrokerOptions) -> BrokerOptions {
        let redis = match (self.redis, base.redis) {
            (Some(over), Some(under)) => Some(RedisOptions {
                url: over.url.or(under.url),
                prefix: over.prefix.or(under.prefix),
            }),
            (over, under) => over.or(under),
        };
        BrokerOptions {
            redis,
            timeout_ms: self.timeout_ms.or(base.timeout_ms),
            minimum_recipients: self.minimum_recipients.or(base.minimum_recipients),
        }
    }

    fn resolve(self) -> BrokerConfig {
        let built_in = BrokerConfig::default();
        let redis = self.redis.unwrap_or_default();
        BrokerConfig {
            redis: RedisConfig {
                url: redis.url.unwrap_or(built_in.redis.url),
                prefix: redis.prefix.unwrap_or(built_in.redis.prefix),
            },
            timeout_ms: self.timeout_ms.unwrap_or(built_in.timeout_ms),
            minimum_recipients: self
                .minimum_recipients
                .unwrap_or(built_in.minimum_recipients),
        }
    }
}

static DEFAULTS: RwLock<Option<BrokerOptions>> = RwLock::new(None);

/// Install process-wide default options.
///
/// Only participants constructed afterwards see the new defaults; open
/// participants keep the configuration they resolved at construction.
pub fn set_defaults(options: BrokerOptions) {
    *DEFAULTS.write().expect("defaults lock poisoned") = Some(options);
}

/// Resolve options against the process-wide defaults and built-ins.
///
/// Precedence: explicit `options`, then [`set_defaults`], then built-ins.
pub fn apply(options: BrokerOptions) -> BrokerConfig {
    let defaults = DEFAULTS
        .read()
        .expect("defaults lock poisoned")
        .clone()
        .unwrap_or_default();
    options.merge(defaults).resolve()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_built_in_defaults() {
        let config = BrokerOptions::default().resolve();
        assert_eq!(config.redis.url, DEFAULT_URL);
        assert_eq!(config.redis.prefix, DEFAULT_PREFIX);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.minimum_recipients, 0);
        assert_eq!(config.timeout(), Duration::from_millis(1000));
    }

    #[test]
    fn test_options_override_built_ins() {
        let config = BrokerOptions::default()
            .with_url("redis://example:6379")
            .with_prefix("app:")
            .with_timeout_ms(70)
            .with_minimum_recipients(2)
            .resolve();
        assert_eq!(config.redis.url, "redis://example:6379");
        assert_eq!(config.redis.prefix, "app:");
        assert_eq!(config.timeout_ms, 70);
        assert_eq!(config.minimum_recipients, 2);
    }

    #[test]
    fn test_merge_partial_redis_options() {
        let merged = BrokerOptions::default()
            .with_prefix("app:")
            .merge(BrokerOptions::default().with_url("redis://other:6379"));
        let config = merged.resolve();
        assert_eq!(config.redis.prefix, "app:");
        assert_eq!(config.redis.url, "redis://other:6379");
    }

    // Single test touching the process-wide registry: unit tests share one
    // process, so precedence and restoration are asserted together.
    #[test]
    fn test_defaults_registry_precedence() {
        set_defaults(
            BrokerOptions::default()
                .with_timeout_ms(250)
                .with_prefix("app:"),
        );

        let from_defaults = apply(BrokerOptions::default());
        assert_eq!(from_defaults.timeout_ms, 250);
        assert_eq!(from_defaults.redis.prefix, "app:");

        let explicit = apply(BrokerOptions::default().with_timeout_ms(70));
        assert_eq!(explicit.timeout_ms, 70);
        assert_eq!(explicit.redis.prefix, "app:");

        set_defaults(BrokerOptions::default());
        assert_eq!(
            apply(BrokerOptions::default()).timeout_ms,
            DEFAULT_TIMEOUT_MS
        );
    }
}
