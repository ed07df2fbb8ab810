//! Connection string assembly
//!
//! [`ConnectionStringBuilder`] turns fragmented dependency configuration into
//! a single [`ConnectionTarget`]. The scheme always agrees with the TLS flag
//! unless the operator spelled out a full URL, in which case that URL is kept
//! exactly as written.

use std::fmt;

use tracing::warn;
use url::Url;

use crate::config::DependencyKind;
use crate::{Error, Result};

/// Raw builder input, after secret resolution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSpec {
    /// Dependency kind (selects the scheme set)
    pub kind: DependencyKind,
    /// Full or partial connection string
    pub connection_string: Option<String>,
    /// Host for discrete assembly
    pub host: Option<String>,
    /// Port for discrete assembly
    pub port: Option<u16>,
    /// Username
    pub username: Option<String>,
    /// Credential
    pub credential: Option<String>,
    /// Path suffix
    pub path: Option<String>,
    /// Explicit TLS flag
    pub tls_enabled: bool,
}

/// A scheme from the fixed set accepted for a dependency kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scheme {
    kind: DependencyKind,
    encrypted: bool,
}

impl Scheme {
    /// The scheme for `kind` matching the TLS flag
    #[must_use]
    pub const fn for_kind(kind: DependencyKind, tls: bool) -> Self {
        Self {
            kind,
            encrypted: tls,
        }
    }

    /// Look up an explicit scheme in the accepted set for `kind`
    #[must_use]
    pub fn parse(kind: DependencyKind, scheme: &str) -> Option<Self> {
        [false, true]
            .into_iter()
            .map(|tls| Self::for_kind(kind, tls))
            .find(|s| s.as_str().eq_ignore_ascii_case(scheme))
    }

    /// Scheme text
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match (self.kind, self.encrypted) {
            (DependencyKind::Redis, false) => "redis",
            (DependencyKind::Redis, true) => "rediss",
            (DependencyKind::Http, false) => "http",
            (DependencyKind::Http, true) => "https",
            (DependencyKind::Amqp, false) => "amqp",
            (DependencyKind::Amqp, true) => "amqps",
        }
    }

    /// Whether this is the TLS variant
    #[must_use]
    pub const fn is_encrypted(self) -> bool {
        self.encrypted
    }

    /// Port used when none is supplied
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match (self.kind, self.encrypted) {
            (DependencyKind::Redis, _) => 6379,
            (DependencyKind::Http, false) => 80,
            (DependencyKind::Http, true) => 443,
            (DependencyKind::Amqp, false) => 5672,
            (DependencyKind::Amqp, true) => 5671,
        }
    }

    fn accepted(kind: DependencyKind) -> String {
        format!(
            "{} or {}",
            Self::for_kind(kind, false).as_str(),
            Self::for_kind(kind, true).as_str()
        )
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated connection target
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    /// Scheme, consistent with `tls_enabled`
    pub scheme: Scheme,
    /// Host name or address
    pub host: String,
    /// Port (always present)
    pub port: u16,
    /// Username, percent-encoded
    pub username: Option<String>,
    /// Credential, percent-encoded
    pub credential: Option<String>,
    /// Path suffix, starting with `/`
    pub path: Option<String>,
    /// Whether the encrypted scheme is in use
    pub tls_enabled: bool,
    /// Operator-supplied string, returned unchanged
    verbatim: Option<String>,
}

impl ConnectionTarget {
    /// The connection string to hand to a client library
    #[must_use]
    pub fn connection_string(&self) -> String {
        if let Some(raw) = &self.verbatim {
            return raw.clone();
        }
        self.render(self.credential.as_deref())
    }

    /// Connection string with the credential masked, for logs
    #[must_use]
    pub fn redacted(&self) -> String {
        self.render(self.credential.as_ref().map(|_| "***"))
    }

    /// Whether the target came from a fully-qualified operator string
    #[must_use]
    pub fn is_verbatim(&self) -> bool {
        self.verbatim.is_some()
    }

    /// `host:port`, bracketing IPv6 literals
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", bracket_host(&self.host), self.port)
    }

    fn render(&self, credential: Option<&str>) -> String {
        let userinfo = match (self.username.as_deref(), credential) {
            (Some(user), Some(cred)) => format!("{user}:{cred}@"),
            (Some(user), None) => format!("{user}@"),
            (None, Some(cred)) => format!(":{cred}@"),
            (None, None) => String::new(),
        };
        format!(
            "{}://{userinfo}{}{}",
            self.scheme,
            self.authority(),
            self.path.as_deref().unwrap_or("")
        )
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.connection_string())
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("scheme", &self.scheme.as_str())
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("credential", &self.credential.as_ref().map(|_| "***"))
            .field("path", &self.path)
            .field("tls_enabled", &self.tls_enabled)
            .field("verbatim", &self.verbatim.is_some())
            .finish()
    }
}

/// Builds [`ConnectionTarget`]s. Pure: the same input always yields the same target.
pub struct ConnectionStringBuilder;

impl ConnectionStringBuilder {
    /// Build a target from a [`ConnectionSpec`]
    ///
    /// Precedence: `connection_string` (fully-qualified strings are kept
    /// verbatim; bare `host[:port]` strings get a scheme from the TLS flag),
    /// then discrete fields. There is no loopback fallback.
    pub fn build(spec: &ConnectionSpec) -> Result<ConnectionTarget> {
        if let Some(raw) = non_empty(spec.connection_string.as_deref()) {
            // `host:port` also parses as `scheme:opaque`, so only `://` marks a scheme
            return if raw.contains("://") {
                Self::from_qualified(spec, raw)
            } else {
                Self::from_bare(spec, raw)
            };
        }

        let Some(host) = non_empty(spec.host.as_deref()) else {
            return Err(Error::Config(
                "neither connection_string nor host is set".to_string(),
            ));
        };
        if host.contains("://") {
            return Err(Error::Config(format!(
                "host '{host}' contains a scheme; use connection_string for full URLs"
            )));
        }

        // Parse through a URL so that `host` may carry a port or IPv6 brackets
        let scheme = Scheme::for_kind(spec.kind, spec.tls_enabled);
        let url = parse_url(&format!("{scheme}://{host}"))?;
        Self::assemble(spec, scheme, &url, host)
    }

    fn from_qualified(spec: &ConnectionSpec, raw: &str) -> Result<ConnectionTarget> {
        let scheme_text = raw.split("://").next().unwrap_or_default();
        let scheme = Scheme::parse(spec.kind, scheme_text).ok_or_else(|| {
            Error::Config(format!(
                "unsupported scheme '{scheme_text}' for {} dependency (expected {})",
                spec.kind,
                Scheme::accepted(spec.kind)
            ))
        })?;
        let url = parse_url(raw)?;
        let host = url_host(&url)?;
        let port = url.port().unwrap_or_else(|| scheme.default_port());
        if port == 0 {
            return Err(Error::Config("port must be > 0".to_string()));
        }

        if spec.tls_enabled && !scheme.is_encrypted() {
            warn!(
                scheme = %scheme,
                "tls_enabled is set but connection_string uses a plaintext scheme; keeping the explicit scheme"
            );
        }

        Ok(ConnectionTarget {
            scheme,
            host,
            port,
            username: non_empty(Some(url.username())).map(str::to_string),
            credential: url.password().map(str::to_string),
            path: non_root_path(url.path()),
            tls_enabled: scheme.is_encrypted(),
            verbatim: spec.connection_string.clone(),
        })
    }

    fn from_bare(spec: &ConnectionSpec, raw: &str) -> Result<ConnectionTarget> {
        let scheme = Scheme::for_kind(spec.kind, spec.tls_enabled);
        let url = parse_url(&format!("{scheme}://{raw}"))?;
        Self::assemble(spec, scheme, &url, raw)
    }

    /// Merge what the URL carries with the discrete fields, URL first
    fn assemble(spec: &ConnectionSpec, scheme: Scheme, url: &Url, raw: &str) -> Result<ConnectionTarget> {
        let host = url_host(url)?;
        let port = explicit_port(url, raw)
            .or(spec.port)
            .unwrap_or_else(|| scheme.default_port());
        if port == 0 {
            return Err(Error::Config("port must be > 0".to_string()));
        }

        let (username, credential) = if url.username().is_empty() && url.password().is_none() {
            encode_userinfo(spec.username.as_deref(), spec.credential.as_deref())?
        } else {
            (
                non_empty(Some(url.username())).map(str::to_string),
                url.password().map(str::to_string),
            )
        };

        let path = non_root_path(url.path()).or_else(|| {
            non_empty(spec.path.as_deref()).map(|p| {
                if p.starts_with('/') {
                    p.to_string()
                } else {
                    format!("/{p}")
                }
            })
        });

        Ok(ConnectionTarget {
            scheme,
            host,
            port,
            username,
            credential,
            path,
            tls_enabled: scheme.is_encrypted(),
            verbatim: None,
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Port written in `raw`, including one the URL parser drops because it is
/// the scheme's default
fn explicit_port(url: &Url, raw: &str) -> Option<u16> {
    if let Some(port) = url.port() {
        return Some(port);
    }
    let authority = raw.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or_default();
    let after_host = host_port.rsplit(']').next().unwrap_or_default();
    if after_host.rsplit_once(':').is_some_and(|(_, port)| !port.is_empty()) {
        url.port_or_known_default()
    } else {
        None
    }
}

fn non_root_path(path: &str) -> Option<String> {
    (!path.is_empty() && path != "/").then(|| path.to_string())
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| Error::Config(format!("invalid connection string: {e}")))
}

fn url_host(url: &Url) -> Result<String> {
    url.host_str()
        .filter(|h| !h.is_empty())
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .ok_or_else(|| Error::Config("connection string has no host".to_string()))
}

fn bracket_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// Percent-encode userinfo the way a URL would carry it
fn encode_userinfo(
    username: Option<&str>,
    credential: Option<&str>,
) -> Result<(Option<String>, Option<String>)> {
    if username.is_none() && credential.is_none() {
        return Ok((None, None));
    }
    let mut scratch = parse_url("depguard://userinfo")?;
    if let Some(user) = username {
        scratch
            .set_username(user)
            .map_err(|()| Error::Config("invalid username".to_string()))?;
    }
    scratch
        .set_password(credential)
        .map_err(|()| Error::Config("invalid credential".to_string()))?;
    Ok((
        non_empty(Some(scratch.username())).map(str::to_string),
        scratch.password().map(str::to_string),
    ))
}
