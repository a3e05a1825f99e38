//! Tunnel specification parsing and application settings
//!
//! A tunnel is described by one token:
//!
//! ```text
//! <scheme>:<host>:<port>><scheme>:<host>:<port>[|rewritepath=<pattern>><replacement>][|overwrite=<path>><file>]...
//! ```

use crate::hosts::DEFAULT_HOSTS_PATH;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Fatal configuration errors, raised before any listener starts
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid tunnel '{0}', src>dst expected")]
    InvalidShape(String),

    #[error("Invalid {side} scheme '{scheme}', could only be http or https")]
    InvalidScheme { side: &'static str, scheme: String },

    #[error("Invalid {side} endpoint '{endpoint}', scheme:host:port expected")]
    InvalidEndpoint { side: &'static str, endpoint: String },

    #[error("Invalid {side} port '{port}'")]
    InvalidPort { side: &'static str, port: String },

    #[error("Invalid rewrite '{0}', pattern>replacement expected")]
    InvalidRewrite(String),

    #[error("Invalid rewrite pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Port {0} is used with different schemes: http & https")]
    ConflictingSchemes(u16),

    #[error("Failed to read settings file {path}: {source}")]
    SettingsRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings file {path}: {source}")]
    SettingsParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn parse(value: &str, side: &'static str) -> Result<Self, ConfigError> {
        if value.eq_ignore_ascii_case("http") {
            Ok(Scheme::Http)
        } else if value.eq_ignore_ascii_case("https") {
            Ok(Scheme::Https)
        } else {
            Err(ConfigError::InvalidScheme {
                side,
                scheme: value.to_string(),
            })
        }
    }

    pub fn is_tls(self) -> bool {
        self == Scheme::Https
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => f.write_str("http"),
            Scheme::Https => f.write_str("https"),
        }
    }
}

/// One side of a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    fn parse(value: &str, side: &'static str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = value.trim().split(':').collect();
        let [scheme, host, port] = parts.as_slice() else {
            return Err(ConfigError::InvalidEndpoint {
                side,
                endpoint: value.to_string(),
            });
        };

        let scheme = Scheme::parse(scheme, side)?;
        if host.is_empty() {
            return Err(ConfigError::InvalidEndpoint {
                side,
                endpoint: value.to_string(),
            });
        }
        let port = port.parse::<u16>().map_err(|_| ConfigError::InvalidPort {
            side,
            port: port.to_string(),
        })?;

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.scheme, self.host, self.port)
    }
}

/// Regex path rewrite; the replacement may use `$1` / `${name}` references
#[derive(Debug, Clone)]
pub struct PathRewriteRule {
    pub pattern: Regex,
    pub replacement: String,
}

impl PathRewriteRule {
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern: regex,
            replacement: replacement.to_string(),
        })
    }

    pub fn apply(&self, path: &str) -> String {
        self.pattern
            .replace_all(path, self.replacement.as_str())
            .into_owned()
    }
}

/// A parsed tunnel, before DNS resolution
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub source: Endpoint,
    pub destination: Endpoint,
    pub path_rewrites: Vec<PathRewriteRule>,
    pub overrides: HashMap<String, PathBuf>,
}

impl TunnelConfig {
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let mut segments = spec.split('|').filter(|s| !s.is_empty());
        let core = segments.next().unwrap_or_default().trim();

        let sides: Vec<&str> = core.split('>').collect();
        let [source, destination] = sides.as_slice() else {
            return Err(ConfigError::InvalidShape(core.to_string()));
        };

        let mut tunnel = Self {
            source: Endpoint::parse(source, "source")?,
            destination: Endpoint::parse(destination, "destination")?,
            path_rewrites: Vec::new(),
            overrides: HashMap::new(),
        };

        for option in segments {
            let Some((key, value)) = option.split_once('=') else {
                continue;
            };
            let value = value.trim();

            match key.trim().to_ascii_lowercase().as_str() {
                "rewritepath" => {
                    let (pattern, replacement) = value
                        .split_once('>')
                        .ok_or_else(|| ConfigError::InvalidRewrite(value.to_string()))?;
                    tunnel
                        .path_rewrites
                        .push(PathRewriteRule::new(pattern, replacement)?);
                }
                "overwrite" => match value.find('>') {
                    Some(sep) if sep > 0 => {
                        tunnel
                            .overrides
                            .insert(value[..sep].to_string(), PathBuf::from(&value[sep + 1..]));
                    }
                    _ => warn!(value, "ignoring overwrite option, path>file expected"),
                },
                other => warn!(option = other, "ignoring unknown tunnel option"),
            }
        }

        Ok(tunnel)
    }
}

impl FromStr for TunnelConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Settings read from a JSON file; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    pub tunnels: Vec<String>,
    pub add_to_hosts: bool,
    pub install_root_cert: bool,
    pub uninstall_root_cert: bool,
    pub certs_dir: Option<PathBuf>,
    pub hosts_file: Option<PathBuf>,
    pub bind: Option<IpAddr>,
}

impl FileSettings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::SettingsRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::SettingsParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Values given on the command line; `None` means "not given"
#[derive(Debug, Default)]
pub struct CliSettings {
    pub tunnels: Vec<TunnelConfig>,
    pub add_to_hosts: bool,
    pub install_root_cert: bool,
    pub uninstall_root_cert: bool,
    pub certs_dir: Option<PathBuf>,
    pub hosts_file: Option<PathBuf>,
    pub bind: Option<IpAddr>,
}

/// Effective application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub tunnels: Vec<TunnelConfig>,
    pub add_to_hosts: bool,
    pub install_root_cert: bool,
    pub uninstall_root_cert: bool,
    pub certs_dir: PathBuf,
    pub hosts_file: PathBuf,
    pub bind: IpAddr,
}

impl Settings {
    /// Merge command line values over an optional settings file.
    /// File tunnels come first, flags are OR-ed, explicit paths on the command line win.
    pub fn resolve(cli: CliSettings, file: Option<FileSettings>) -> Result<Self, ConfigError> {
        let file = file.unwrap_or_default();

        let mut tunnels = file
            .tunnels
            .iter()
            .map(|spec| TunnelConfig::parse(spec))
            .collect::<Result<Vec<_>, _>>()?;
        tunnels.extend(cli.tunnels);

        Ok(Self {
            tunnels,
            add_to_hosts: cli.add_to_hosts || file.add_to_hosts,
            install_root_cert: cli.install_root_cert || file.install_root_cert,
            uninstall_root_cert: cli.uninstall_root_cert || file.uninstall_root_cert,
            certs_dir: cli
                .certs_dir
                .or(file.certs_dir)
                .unwrap_or_else(|| PathBuf::from("./certs")),
            hosts_file: cli
                .hosts_file
                .or(file.hosts_file)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HOSTS_PATH)),
            bind: cli
                .bind
                .or(file.bind)
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        })
    }

    /// Distinct source domains, first occurrence order, case-insensitive
    pub fn source_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = Vec::new();
        for tunnel in &self.tunnels {
            if !domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(&tunnel.source.host))
            {
                domains.push(tunnel.source.host.clone());
            }
        }
        domains
    }

    /// True when any tunnel terminates TLS locally
    pub fn needs_tls(&self) -> bool {
        self.tunnels.iter().any(|t| t.source.scheme.is_tls())
    }
}
