//! Configuration Module
//!
//! Cache construction options: defaults, environment variables, loosely
//! typed option maps with legacy key names, and validation.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::cache::ttl_millis;
use crate::error::{CacheError, Result};

/// Entry capacity of the preset caches.
pub const DEFAULT_MAX: usize = 40_000;

/// Legacy option names and their replacements.
const LEGACY_OPTIONS: [(&str, &str); 3] = [
    ("stale", "allowStale"),
    ("maxAge", "ttl"),
    ("length", "sizeCalculation"),
];

/// Cache configuration parameters.
///
/// Field names deserialize in camelCase (`maxSize`, `allowStale`) and `ttl`
/// is expressed in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Logical cache name, shared by every instance that must stay consistent
    pub name: String,
    /// Maximum number of entries, 0 = bounded by `max_size` only
    pub max: usize,
    /// Maximum total calculated size, 0 = unbounded
    pub max_size: usize,
    /// Default TTL in milliseconds, 0 = never expire
    pub ttl: u64,
    /// Serve an expired value once before dropping it
    pub allow_stale: bool,
    /// Initial state of the read/write gate
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max: DEFAULT_MAX,
            max_size: 0,
            ttl: 0,
            allow_stale: false,
            enabled: true,
        }
    }
}

impl CacheConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    // == Presets ==
    /// The process-wide general purpose cache.
    pub fn local() -> Self {
        Self::new("local")
    }

    /// Object cache sitting in front of a database connection named `name`.
    pub fn database_objects(name: &str) -> Self {
        Self::new(format!("{name}-object"))
    }

    // == Builders ==
    pub fn with_max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the default TTL. Sub-millisecond durations round up to 1ms.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl_millis(ttl);
        self
    }

    pub fn with_allow_stale(mut self, allow_stale: bool) -> Self {
        self.allow_stale = allow_stale;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Default TTL as a Duration, zero = never expire.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.ttl)
    }

    // == Environment ==
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_NAME` - Cache name (default: "local")
    /// - `CACHE_MAX` - Maximum entries (default: 40000)
    /// - `CACHE_MAX_SIZE` - Maximum calculated size (default: 0)
    /// - `CACHE_TTL_MS` - Default TTL in milliseconds (default: 0)
    /// - `CACHE_ALLOW_STALE` - Serve stale values once (default: false)
    /// - `CACHE_ENABLED` - Read/write gate (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::local();
        Self {
            name: env::var("CACHE_NAME").unwrap_or(defaults.name),
            max: env_or("CACHE_MAX", defaults.max),
            max_size: env_or("CACHE_MAX_SIZE", defaults.max_size),
            ttl: env_or("CACHE_TTL_MS", defaults.ttl),
            allow_stale: env_or("CACHE_ALLOW_STALE", defaults.allow_stale),
            enabled: env_or("CACHE_ENABLED", defaults.enabled),
        }
    }

    // == Option Maps ==
    /// Builds a config from a loosely typed option map, translating legacy
    /// option names first.
    ///
    /// `sizeCalculation` is a function and cannot be carried in data; it is
    /// dropped with a warning and must be passed to
    /// [`crate::CacheInstance::create_sized`] instead.
    pub fn from_options(mut options: Map<String, Value>) -> Result<Self> {
        translate_legacy_options(&mut options);

        if options.remove("sizeCalculation").is_some() {
            warn!(
                cache = option_name(&options),
                "sizeCalculation cannot be set from options, pass it to CacheInstance::create_sized"
            );
        }

        serde_json::from_value(Value::Object(options))
            .map_err(|err| CacheError::InvalidConfig(err.to_string()))
    }

    // == Validation ==
    /// Rejects configurations that would grow without bound or could never
    /// enforce their size limit.
    pub fn validate(&self, has_size_calculation: bool) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CacheError::InvalidConfig("name is required".to_string()));
        }
        if self.max == 0 && self.max_size == 0 {
            return Err(CacheError::InvalidConfig(format!(
                "cache {}: at least one of max or maxSize must be positive",
                self.name
            )));
        }
        if self.max_size > 0 && !has_size_calculation {
            return Err(CacheError::InvalidConfig(format!(
                "cache {}: maxSize requires a size calculation",
                self.name
            )));
        }
        if has_size_calculation && self.max_size == 0 {
            return Err(CacheError::InvalidConfig(format!(
                "cache {}: a size calculation requires maxSize",
                self.name
            )));
        }
        Ok(())
    }
}

/// Rewrites legacy option names in place, logging a deprecation warning for
/// each one.
///
/// `length` without `maxSize` has no effect and is removed. An old name is
/// only translated when its replacement is not also present.
pub fn translate_legacy_options(options: &mut Map<String, Value>) {
    let name = option_name(options).to_string();

    if options.contains_key("length") && !options.contains_key("maxSize") {
        warn!(
            cache = %name,
            "DEPRECATION: length was passed without a corresponding maxSize, both are required"
        );
        options.remove("length");
    }

    for (old, new) in LEGACY_OPTIONS {
        if options.contains_key(new) {
            continue;
        }
        if let Some(value) = options.remove(old) {
            warn!(
                cache = %name,
                option = old,
                replacement = new,
                "DEPRECATION: option has been renamed"
            );
            options.insert(new.to_string(), value);
        }
    }
}

fn option_name(options: &Map<String, Value>) -> &str {
    options.get("name").and_then(Value::as_str).unwrap_or("")
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
