//! Deployment configuration.
//!
//! [`ReloadConfig`] is what the configuration-collection layer hands to
//! [`ReloadOrchestrator::start`](crate::ReloadOrchestrator::start). The
//! free-form [`Settings`] mapping is interpreted through [`DevSettings`],
//! which looks every key up in the mapping first, then in the environment,
//! then falls back to a default.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::generation::ArtifactSet;

pub const HTTP_HOST: &str = "relive.http.host";
pub const HTTP_PORT: &str = "relive.http.port";
pub const HEALTH_PATH: &str = "relive.http.health";
pub const HEALTH_STATUS: &str = "relive.http.health.status";
pub const HEALTH_BODY: &str = "relive.http.health.body";
pub const PROXY_HOST: &str = "relive.proxy.host";
pub const PROXY_PORT: &str = "relive.proxy.port";
pub const STARTUP_TIMEOUT_MS: &str = "relive.startup.timeout.ms";
pub const STARTUP_DELAY_MS: &str = "relive.startup.delay.ms";
pub const SHUTDOWN_TIMEOUT_MS: &str = "relive.shutdown.timeout.ms";
pub const SHUTDOWN_GRACE_MS: &str = "relive.shutdown.grace.ms";
pub const DEBUG: &str = "relive.debug";

/// Startup hooks used when none are configured.
pub const DEFAULT_STARTUP_HOOKS: &[&str] = &["health-check"];

/// Shutdown hooks used when none are configured.
pub const DEFAULT_SHUTDOWN_HOOKS: &[&str] = &["interrupt", "force-stop", "health-check-negative"];

/// Ordered string-to-string settings.
///
/// Insertion order is preserved; inserting an existing key replaces its
/// value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    entries: Vec<(String, String)>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut settings = Settings::new();
        settings.extend(iter);
        settings
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for Settings {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

/// Scalar accepted as a setting value in config files.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl From<RawValue> for String {
    fn from(value: RawValue) -> Self {
        match value {
            RawValue::Text(s) => s,
            RawValue::Integer(i) => i.to_string(),
            RawValue::Float(f) => f.to_string(),
            RawValue::Bool(b) => b.to_string(),
        }
    }
}

impl<'de> Deserialize<'de> for Settings {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct SettingsVisitor;

        impl<'de> Visitor<'de> for SettingsVisitor {
            type Value = Settings;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a table of setting names to scalar values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Settings, A::Error> {
                let mut settings = Settings::new();
                while let Some((key, value)) = map.next_entry::<String, RawValue>()? {
                    settings.insert(key, String::from(value));
                }
                Ok(settings)
            }
        }

        deserializer.deserialize_map(SettingsVisitor)
    }
}

/// Configuration consumed by the orchestrator.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReloadConfig {
    /// Executable name, path, or in-process entry point identifier.
    pub entry_point: String,

    #[serde(default)]
    pub settings: Settings,

    #[serde(default = "default_startup_hooks")]
    pub startup_hooks: Vec<String>,

    #[serde(default = "default_shutdown_hooks")]
    pub shutdown_hooks: Vec<String>,

    /// Artifacts for generation 0. When absent, `start` asks the compile gate.
    #[serde(skip)]
    pub artifacts: Option<ArtifactSet>,
}

fn default_startup_hooks() -> Vec<String> {
    DEFAULT_STARTUP_HOOKS.iter().map(|s| s.to_string()).collect()
}

fn default_shutdown_hooks() -> Vec<String> {
    DEFAULT_SHUTDOWN_HOOKS.iter().map(|s| s.to_string()).collect()
}

impl ReloadConfig {
    /// Configuration with default hooks and no settings.
    pub fn new(entry_point: impl Into<String>) -> Self {
        Self {
            entry_point: entry_point.into(),
            settings: Settings::new(),
            startup_hooks: default_startup_hooks(),
            shutdown_hooks: default_shutdown_hooks(),
            artifacts: None,
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key, value);
        self
    }

    pub fn with_startup_hooks<I, S>(mut self, hooks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.startup_hooks = hooks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_shutdown_hooks<I, S>(mut self, hooks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shutdown_hooks = hooks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactSet) -> Self {
        self.artifacts = Some(artifacts);
        self
    }
}

/// Environment variable name for a setting key (`relive.http.port` -> `RELIVE_HTTP_PORT`).
pub fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '.' | '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

/// Typed view over the settings the core itself understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevSettings {
    pub http_host: String,
    /// `0` allocates a fresh port for every generation.
    pub http_port: u16,
    pub health_path: String,
    pub health_status: u16,
    pub health_body: Option<String>,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub startup_timeout: Duration,
    pub startup_delay: Duration,
    pub shutdown_timeout: Duration,
    pub shutdown_grace: Duration,
    pub debug: bool,
}

impl Default for DevSettings {
    fn default() -> Self {
        Self {
            http_host: "127.0.0.1".to_string(),
            http_port: 0,
            health_path: "/health".to_string(),
            health_status: 200,
            health_body: None,
            proxy_host: "127.0.0.1".to_string(),
            proxy_port: 9000,
            startup_timeout: Duration::from_secs(30),
            startup_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            debug: false,
        }
    }
}

impl DevSettings {
    /// Resolve against the settings mapping and the process environment.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::resolve(settings, |name| std::env::var(name).ok())
    }

    /// Resolve against the settings mapping and a custom environment lookup.
    pub fn resolve(settings: &Settings, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = |key: &str| -> Option<String> {
            settings
                .get(key)
                .map(str::to_string)
                .or_else(|| env(&env_key(key)))
        };
        let defaults = DevSettings::default();

        Ok(Self {
            http_host: lookup(HTTP_HOST).unwrap_or(defaults.http_host),
            http_port: parse(HTTP_PORT, lookup(HTTP_PORT))?.unwrap_or(defaults.http_port),
            health_path: lookup(HEALTH_PATH).unwrap_or(defaults.health_path),
            health_status: parse(HEALTH_STATUS, lookup(HEALTH_STATUS))?.unwrap_or(defaults.health_status),
            health_body: lookup(HEALTH_BODY),
            proxy_host: lookup(PROXY_HOST).unwrap_or(defaults.proxy_host),
            proxy_port: parse(PROXY_PORT, lookup(PROXY_PORT))?.unwrap_or(defaults.proxy_port),
            startup_timeout: millis(STARTUP_TIMEOUT_MS, lookup(STARTUP_TIMEOUT_MS))?
                .unwrap_or(defaults.startup_timeout),
            startup_delay: millis(STARTUP_DELAY_MS, lookup(STARTUP_DELAY_MS))?
                .unwrap_or(defaults.startup_delay),
            shutdown_timeout: millis(SHUTDOWN_TIMEOUT_MS, lookup(SHUTDOWN_TIMEOUT_MS))?
                .unwrap_or(defaults.shutdown_timeout),
            shutdown_grace: millis(SHUTDOWN_GRACE_MS, lookup(SHUTDOWN_GRACE_MS))?
                .unwrap_or(defaults.shutdown_grace),
            debug: parse(DEBUG, lookup(DEBUG))?.unwrap_or(defaults.debug),
        })
    }
}

fn parse<T: FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>> {
    raw.map(|value| {
        value
            .trim()
            .parse::<T>()
            .map_err(|_| Error::Config(format!("invalid value for {}: {:?}", key, value)))
    })
    .transpose()
}

fn millis(key: &str, raw: Option<String>) -> Result<Option<Duration>> {
    Ok(parse::<u64>(key, raw)?.map(Duration::from_millis))
}
