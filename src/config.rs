//! Configuration management

use std::{
    collections::{BTreeMap, HashMap},
    env,
    net::IpAddr,
    path::Path,
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionSpec, ConnectionStringBuilder, ConnectionTarget};
use crate::{Error, Result};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "DEPGUARD_";

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving `env:` references.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Operator endpoints
    pub admin: AdminConfig,
    /// Name resolution
    pub resolver: ResolverConfig,
    /// Guarded dependencies, keyed by name
    pub dependencies: BTreeMap<String, DependencyConfig>,
    /// Cached credential validation
    pub auth: AuthConfig,
    /// Health aggregation
    pub health: HealthConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Upper bound for any single request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Grace period for in-flight requests on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(15),
        }
    }
}

/// Operator endpoint configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token for `/admin/*` (supports `env:VAR_NAME`).
    /// Admin routes are refused when unset.
    pub token: Option<String>,
}

impl AdminConfig {
    /// Resolve the admin token (expand `env:` references)
    pub fn resolve_token(&self) -> Result<Option<String>> {
        self.token.as_deref().map(resolve_secret).transpose()
    }
}

/// Name resolution configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// How long a live resolution stays fresh
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Deadline for a single live lookup
    #[serde(with = "humantime_serde")]
    pub lookup_timeout: Duration,
    /// Addresses used when a name has never resolved successfully
    pub static_overrides: HashMap<String, String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            lookup_timeout: Duration::from_millis(500),
            static_overrides: HashMap::new(),
        }
    }
}

impl ResolverConfig {
    /// Parse the static override table
    pub fn parsed_overrides(&self) -> Result<HashMap<String, IpAddr>> {
        self.static_overrides
            .iter()
            .map(|(name, addr)| {
                addr.trim()
                    .parse::<IpAddr>()
                    .map(|ip| (name.to_ascii_lowercase(), ip))
                    .map_err(|_| {
                        Error::Config(format!(
                            "resolver.static_overrides.{name}: '{addr}' is not an IP address"
                        ))
                    })
            })
            .collect()
    }
}

/// Kind of downstream dependency; selects the accepted scheme set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Key-value cache (`redis://` / `rediss://`)
    #[default]
    Redis,
    /// HTTP service (`http://` / `https://`)
    Http,
    /// Message broker (`amqp://` / `amqps://`)
    Amqp,
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Redis => "redis",
            Self::Http => "http",
            Self::Amqp => "amqp",
        })
    }
}

/// A guarded downstream dependency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyConfig {
    /// Dependency kind
    pub kind: DependencyKind,
    /// Full connection string; takes precedence over discrete fields
    pub connection_string: Option<String>,
    /// Host (or logical service-discovery name)
    pub host: Option<String>,
    /// Port; defaulted per kind and TLS flag when unset
    pub port: Option<u16>,
    /// Optional username
    pub username: Option<String>,
    /// Credential (supports `env:VAR_NAME`)
    pub credential: Option<String>,
    /// Optional path (e.g. a Redis database index `/0`)
    pub path: Option<String>,
    /// Use the encrypted scheme for bare hosts and discrete fields
    pub tls_enabled: bool,
    /// Whether losing this dependency makes the service unhealthy
    pub critical: bool,
    /// Run a direct TCP probe during health checks
    pub probe: bool,
    /// Circuit breaker settings
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            kind: DependencyKind::default(),
            connection_string: None,
            host: None,
            port: None,
            username: None,
            credential: None,
            path: None,
            tls_enabled: false,
            critical: false,
            probe: true,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl DependencyConfig {
    /// Produce the builder input, resolving `env:` secrets
    pub fn connection_spec(&self) -> Result<ConnectionSpec> {
        Ok(ConnectionSpec {
            kind: self.kind,
            connection_string: self.connection_string.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            credential: self.credential.as_deref().map(resolve_secret).transpose()?,
            path: self.path.clone(),
            tls_enabled: self.tls_enabled,
        })
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Consecutive probe successes to close
    pub success_threshold: u32,
    /// Time to wait before admitting a probe
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
    /// Failed probes before the breaker stays open until reset
    pub max_recovery_attempts: u32,
    /// How the recovery timeout grows after failed probes
    pub recovery_backoff: RecoveryBackoff,
    /// Upper bound for the grown recovery timeout
    #[serde(with = "humantime_serde")]
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
            max_recovery_attempts: 5,
            recovery_backoff: RecoveryBackoff::Exponential,
            max_recovery_timeout: Duration::from_secs(300),
        }
    }
}

/// Growth of the recovery timeout after failed half-open probes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryBackoff {
    /// Always `recovery_timeout`
    Fixed,
    /// `recovery_timeout * (attempts + 1)`
    Linear,
    /// `recovery_timeout * 2^attempts`
    #[default]
    Exponential,
}

/// Which cache backs credential validation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthCacheKind {
    /// In-process map
    #[default]
    Memory,
    /// Redis dependency named by `auth.cache_dependency`
    Redis,
}

/// What to do when no verdict can be reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicyKind {
    /// Reject the request
    #[default]
    FailClosed,
    /// Admit as unverified for `auth.grace_window`, then reject
    FailOpen,
}

/// Cached credential validation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable the auth middleware
    pub enabled: bool,
    /// Name of the `http` dependency that validates credentials
    pub authority: String,
    /// Path of the validation call on the authority
    pub validate_path: String,
    /// Cache backend
    pub cache: AuthCacheKind,
    /// Name of the `redis` dependency used when `cache = redis`
    pub cache_dependency: String,
    /// How long a validated principal is served from cache
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Deadline for each cache read or write
    #[serde(with = "humantime_serde")]
    pub cache_timeout: Duration,
    /// Deadline for the authority call
    #[serde(with = "humantime_serde")]
    pub authority_timeout: Duration,
    /// Policy when the validator is unavailable
    pub failure_policy: FailurePolicyKind,
    /// Fail-open admission window, measured from the start of an outage
    #[serde(with = "humantime_serde")]
    pub grace_window: Duration,
    /// Paths that bypass authentication
    pub public_paths: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            authority: "authority".to_string(),
            validate_path: "/v1/validate".to_string(),
            cache: AuthCacheKind::Memory,
            cache_dependency: "cache".to_string(),
            cache_ttl: Duration::from_secs(300),
            cache_timeout: Duration::from_millis(150),
            authority_timeout: Duration::from_millis(400),
            failure_policy: FailurePolicyKind::FailClosed,
            grace_window: Duration::from_secs(60),
            public_paths: vec!["/health".to_string()],
        }
    }
}

/// Health aggregation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Deadline for each individual probe
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Background poll interval
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_secs(15),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();

        Ok(config)
    }

    /// Load and validate; the startup path
    pub fn load_validated(path: Option<&Path>) -> Result<Self> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Build the connection target of every dependency
    pub fn connection_targets(&self) -> Result<BTreeMap<String, ConnectionTarget>> {
        self.dependencies
            .iter()
            .map(|(name, dep)| {
                let target = dep
                    .connection_spec()
                    .and_then(|spec| ConnectionStringBuilder::build(&spec))
                    .map_err(|e| Error::Config(format!("dependencies.{name}: {}", strip_config_prefix(&e))))?;
                Ok((name.clone(), target))
            })
            .collect()
    }

    /// Validate everything that can be checked without touching the network
    pub fn validate(&self) -> Result<()> {
        self.connection_targets()?;
        self.resolver.parsed_overrides()?;
        self.admin.resolve_token()?;

        if self.resolver.lookup_timeout.is_zero() {
            return Err(Error::Config("resolver.lookup_timeout must be > 0".into()));
        }

        for (name, dep) in &self.dependencies {
            let cb = &dep.circuit_breaker;
            if cb.failure_threshold == 0 || cb.success_threshold == 0 || cb.max_recovery_attempts == 0 {
                return Err(Error::Config(format!(
                    "dependencies.{name}.circuit_breaker: thresholds must be >= 1"
                )));
            }
            if cb.max_recovery_timeout < cb.recovery_timeout {
                return Err(Error::Config(format!(
                    "dependencies.{name}.circuit_breaker: max_recovery_timeout is below recovery_timeout"
                )));
            }
        }

        if self.auth.enabled {
            self.require_dependency(&self.auth.authority, DependencyKind::Http, "auth.authority")?;
            if self.auth.cache == AuthCacheKind::Redis {
                self.require_dependency(
                    &self.auth.cache_dependency,
                    DependencyKind::Redis,
                    "auth.cache_dependency",
                )?;
            }
            if self.auth.cache_timeout.is_zero() || self.auth.authority_timeout.is_zero() {
                return Err(Error::Config("auth timeouts must be > 0".into()));
            }
        }

        if self.health.probe_timeout.is_zero() {
            return Err(Error::Config("health.probe_timeout must be > 0".into()));
        }

        Ok(())
    }

    fn require_dependency(&self, name: &str, kind: DependencyKind, field: &str) -> Result<()> {
        match self.dependencies.get(name) {
            Some(dep) if dep.kind == kind => Ok(()),
            Some(dep) => Err(Error::Config(format!(
                "{field}: dependency '{name}' is of kind {}, expected {kind}",
                dep.kind
            ))),
            None => Err(Error::Config(format!(
                "{field}: no dependency named '{name}'"
            ))),
        }
    }
}

fn strip_config_prefix(err: &Error) -> String {
    match err {
        Error::Config(msg) => msg.clone(),
        other => other.to_string(),
    }
}

/// Resolve a secret reference.
///
/// `env:VAR_NAME` reads the variable; anything else is a literal.
pub fn resolve_secret(value: &str) -> Result<String> {
    match value.strip_prefix("env:") {
        Some(var_name) => env::var(var_name)
            .map_err(|_| Error::Config(format!("environment variable '{var_name}' is not set"))),
        None => Ok(value.to_string()),
    }
}

/// Duration (de)serialization accepting `"250ms"`, `"30s"`, `"5m"`, `"1h"`,
/// or a bare number of seconds.
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    /// Serialize Duration to a human-readable string (`"250ms"` or `"30s"`)
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse(&s).map_err(serde::de::Error::custom),
        }
    }

    /// Parse a duration string
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let number = |digits: &str| {
            digits
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        };

        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            number(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            number(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            number(mins).map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            number(hours).map(|h| Duration::from_secs(h * 3600))
        } else {
            number(s).map(Duration::from_secs)
        }
    }
}
