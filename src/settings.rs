//! Service configuration: a YAML file plus an environment-variable overlay.
//!
//! ```yaml
//! upstream:
//!   context_timeout: 5s
//!   http:
//!     host: 0.0.0.0
//!     port: 8080
//!     base_path: /encoder
//! downstream:
//!   backend:
//!     service_url: http://backend.internal:9000
//!     client_timeout: 2s
//! admin:
//!   port: 9090
//! app:
//!   greeting: hello
//! ```
//!
//! With prefix `APP`, the variable `APP_UPSTREAM_HTTP_PORT` overrides
//! `upstream.http.port`. An override only applies when its key already
//! exists in the file; variables for absent keys are ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use ::config::{Config, ConfigBuilder, File, FileFormat, Source as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::secret::Secret;
use crate::validate::{FieldRule, RuleError, RuleSet, ValidationErrors, Validator};

/// Failure to read or validate configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or a value could not be deserialized.
    #[error("reading configuration: {0}")]
    Source(#[from] ::config::ConfigError),
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(ValidationErrors),
}

/// Serde adapter for human-readable durations such as `"250ms"` or `"1m 30s"`.
pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Writes `value` as a humantime string.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    /// Reads a humantime string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

/// Everything the runtime reads from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// The inbound binding.
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// One entry per downstream dependency, keyed by downstream name.
    #[serde(default)]
    pub downstream: BTreeMap<String, DownstreamConfig>,
    /// The admin binding serving status and metrics; disabled when absent.
    #[serde(default)]
    pub admin: Option<AdminConfig>,
    /// Remote log shipping; disabled when absent.
    #[serde(default)]
    pub shipping: Option<ShippingConfig>,
}

/// Inbound binding and request budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Transport binding.
    #[serde(default)]
    pub http: HttpBinding,
    /// Budget of each inbound request.
    #[serde(default = "default_context_timeout", with = "duration")]
    pub context_timeout: Duration,
    /// Whether protocol reflection is advertised.
    #[serde(default)]
    pub reflection: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            http: HttpBinding::default(),
            context_timeout: default_context_timeout(),
            reflection: false,
        }
    }
}

/// Host, port and base path of an HTTP listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpBinding {
    /// Interface to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Prefix of every operation path.
    #[serde(default = "default_base_path")]
    pub base_path: String,
}

impl Default for HttpBinding {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_path: default_base_path(),
        }
    }
}

/// The admin-only listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Interface to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind.
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

/// Connection settings of one downstream dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownstreamConfig {
    /// Base URL every operation path is appended to.
    #[serde(default)]
    pub service_url: String,
    /// Upper bound of each call. The effective timeout is also capped by
    /// the caller's remaining deadline.
    #[serde(default = "default_client_timeout", with = "duration")]
    pub client_timeout: Duration,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            service_url: String::new(),
            client_timeout: default_client_timeout(),
        }
    }
}

/// Where and how log events are shipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingConfig {
    /// Collector endpoint URL.
    pub target: String,
    /// Collector token.
    pub token: Secret<String>,
    /// Destination index.
    #[serde(default)]
    pub index: String,
    /// Event source.
    #[serde(default)]
    pub source: String,
    /// Event source type.
    #[serde(default)]
    pub source_type: String,
    /// Events buffered before a flush is forced.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
    /// Longest time an event waits before a flush.
    #[serde(default = "default_flush_interval", with = "duration")]
    pub flush_interval: Duration,
    /// Capacity of the event queue; `fire` fails when it is full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_context_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_client_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_admin_port() -> u16 {
    9090
}

fn default_base_path() -> String {
    "/".to_string()
}

fn default_flush_threshold() -> usize {
    10
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_queue_capacity() -> usize {
    1024
}

impl ServiceConfig {
    /// Parses and validates a YAML document without environment overlay.
    ///
    /// # Errors
    ///
    /// See [`ConfigLoader::load`] and [`LoadedConfig::service`].
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        ConfigLoader::new().yaml(text).load()?.service()
    }

    /// Settings of downstream `name`, or the defaults when it is not configured.
    pub fn downstream(&self, name: &str) -> DownstreamConfig {
        self.downstream.get(name).cloned().unwrap_or_default()
    }

    /// Checks ranges: ports, base path shape, positive timeouts.
    ///
    /// # Errors
    ///
    /// A report of every out-of-range value.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let value =
            serde_json::to_value(self).map_err(|err| ValidationErrors::decode(err.to_string()))?;
        let rules = self
            .rules()
            .map_err(|err| ValidationErrors::decode(err.to_string()))?;
        Validator::default().validate(&value, &rules)
    }

    fn rules(&self) -> Result<RuleSet, RuleError> {
        let binding = RuleSet::new()
            .field("port", "min=0,max=65535")?
            .field("base_path", "required,regexp='^/'")?;
        let upstream = RuleSet::new()
            .field("context_timeout", "required,timeout=1ms:")?
            .rule(FieldRule::new("http").nested(binding));

        let mut downstream = RuleSet::new();
        for name in self.downstream.keys() {
            let entry = RuleSet::new().field("client_timeout", "required,timeout=1ms:")?;
            downstream = downstream.rule(FieldRule::new(name.as_str()).nested(entry));
        }

        let shipping = RuleSet::new()
            .field("target", "required,regexp='^https?://'")?
            .field("flush_threshold", "min=1")?
            .field("queue_capacity", "min=1")?
            .field("flush_interval", "timeout=1ms:")?;

        Ok(RuleSet::new()
            .rule(FieldRule::new("upstream").nested(upstream))
            .rule(FieldRule::new("downstream").nested(downstream))
            .rule(FieldRule::new("shipping").nested(shipping)))
    }
}

enum Source {
    Path(PathBuf),
    Text(String),
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads configuration from YAML sources with an environment overlay.
///
/// Later sources override earlier ones key by key.
///
/// ```
/// use std::collections::HashMap;
/// use service_core::ConfigLoader;
///
/// let env = HashMap::from([
///     ("SVC_UPSTREAM_HTTP_PORT".to_string(), "9000".to_string()),
///     ("SVC_UPSTREAM_HTTP_HOST".to_string(), "0.0.0.0".to_string()),
/// ]);
/// let loaded = ConfigLoader::new()
///     .yaml("upstream:\n  http:\n    port: 8080\n")
///     .env_prefix("SVC")
///     .env_lookup(move |key| env.get(key).cloned())
///     .load()
///     .unwrap();
/// let service = loaded.service().unwrap();
/// assert_eq!(service.upstream.http.port, 9000);
/// // host is not in the file, so its variable is ignored
/// assert_eq!(service.upstream.http.host, "localhost");
/// ```
pub struct ConfigLoader {
    sources: Vec<Source>,
    env_prefix: Option<String>,
    lookup: EnvLookup,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            env_prefix: None,
            lookup: Box::new(|key| std::env::var(key).ok()),
        }
    }
}

impl fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigLoader")
            .field("sources", &self.sources.len())
            .field("env_prefix", &self.env_prefix)
            .finish()
    }
}

impl ConfigLoader {
    /// A loader with no sources that reads the process environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a YAML file.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sources.push(Source::Path(path.into()));
        self
    }

    /// Adds an in-memory YAML document.
    pub fn yaml(mut self, text: impl Into<String>) -> Self {
        self.sources.push(Source::Text(text.into()));
        self
    }

    /// Enables the environment overlay for variables starting with `PREFIX_`.
    pub fn env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Replaces the environment lookup.
    pub fn env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.lookup = Box::new(lookup);
        self
    }

    fn builder(&self) -> ConfigBuilder<::config::builder::DefaultState> {
        self.sources
            .iter()
            .fold(Config::builder(), |builder, source| match source {
                Source::Path(path) => {
                    builder.add_source(File::new(&path.to_string_lossy(), FileFormat::Yaml))
                }
                Source::Text(text) => builder.add_source(File::from_str(text, FileFormat::Yaml)),
            })
    }

    /// Reads every source and applies the overlay.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Source`] when a file is missing or malformed.
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let base = self.builder().build()?;
        let Some(prefix) = &self.env_prefix else {
            return Ok(LoadedConfig { raw: base });
        };

        let mut keys = Vec::new();
        collect_keys("", base.collect()?, &mut keys);

        let mut builder = self.builder();
        for key in keys {
            let variable = format!("{}_{}", prefix, key.replace('.', "_")).to_uppercase();
            if let Some(value) = (self.lookup)(&variable) {
                tracing::debug!(%key, %variable, "configuration key overridden from environment");
                builder = builder.set_override(key.as_str(), value)?;
            }
        }
        Ok(LoadedConfig {
            raw: builder.build()?,
        })
    }
}

fn collect_keys(prefix: &str, table: ::config::Map<String, ::config::Value>, out: &mut Vec<String>) {
    for (key, value) in table {
        let path = if prefix.is_empty() {
            key
        } else {
            format!("{}.{}", prefix, key)
        };
        match value.into_table() {
            Ok(nested) => collect_keys(&path, nested, out),
            Err(_) => out.push(path),
        }
    }
}

/// Merged configuration, ready to be decoded.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    raw: Config,
}

impl LoadedConfig {
    /// Decodes and validates the runtime sections.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Source`] for undecodable values,
    /// [`ConfigError::Invalid`] for out-of-range ones.
    pub fn service(&self) -> Result<ServiceConfig, ConfigError> {
        let service: ServiceConfig = self.raw.clone().try_deserialize()?;
        service.validate().map_err(ConfigError::Invalid)?;
        Ok(service)
    }

    /// Decodes the application's own `app` section.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Source`] when the section is missing or does not fit `T`.
    pub fn app<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        Ok(self.raw.get::<T>("app")?)
    }

    /// Decodes any key.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Source`] when the key is missing or does not fit `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        Ok(self.raw.get::<T>(key)?)
    }
}
