//! Routing table: source host/port to destination
//!
//! Routes are built in two phases. [`TunnelConfig`] is the mutable, parsed
//! form; DNS resolution happens once while turning it into a [`TunnelRoute`],
//! which is never modified afterwards and is shared read-only between every
//! connection task.

use crate::config::{ConfigError, Endpoint, PathRewriteRule, TunnelConfig};
use futures_util::future::try_join_all;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::lookup_host;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to resolve destination {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("Destination {0} resolved to no address")]
    NoAddress(String),
}

/// A configured tunnel with its resolved destination
#[derive(Debug)]
pub struct TunnelRoute {
    pub source: Endpoint,
    pub destination: Endpoint,
    pub destination_addrs: Vec<IpAddr>,
    pub path_rewrites: Vec<PathRewriteRule>,
    pub overrides: HashMap<String, PathBuf>,
}

impl TunnelRoute {
    pub fn new(config: TunnelConfig, destination_addrs: Vec<IpAddr>) -> Self {
        Self {
            source: config.source,
            destination: config.destination,
            destination_addrs,
            path_rewrites: config.path_rewrites,
            overrides: config.overrides,
        }
    }

    /// Resolve the destination host and freeze the route.
    pub async fn resolve(config: TunnelConfig) -> Result<Self, RoutingError> {
        let host = config.destination.host.clone();
        let addrs: Vec<IpAddr> = lookup_host((host.as_str(), config.destination.port))
            .await
            .map_err(|source| RoutingError::Resolve {
                host: host.clone(),
                source,
            })?
            .map(|addr| addr.ip())
            .collect();

        if addrs.is_empty() {
            return Err(RoutingError::NoAddress(host));
        }
        debug!(host = %host, addrs = ?addrs, "Resolved destination");

        Ok(Self::new(config, addrs))
    }

    /// Socket address used for the remote connection
    pub fn destination_addr(&self) -> Option<SocketAddr> {
        self.destination_addrs
            .first()
            .map(|ip| SocketAddr::new(*ip, self.destination.port))
    }

    /// `Host` value to send upstream when `host_value` targets this route.
    ///
    /// Matches the bare source host, or `host:port` carrying the source port,
    /// in which case the destination port is carried over as well.
    pub fn destination_host_value(&self, host_value: &str) -> Option<String> {
        if host_value.eq_ignore_ascii_case(&self.source.host) {
            return Some(self.destination.host.clone());
        }
        let (host, port) = host_value.rsplit_once(':')?;
        if host.eq_ignore_ascii_case(&self.source.host)
            && port.parse::<u16>().ok() == Some(self.source.port)
        {
            return Some(format!("{}:{}", self.destination.host, self.destination.port));
        }
        None
    }

    /// New path if the rewrite rules change it.
    ///
    /// Every rule is applied to the original path and only the last rule's
    /// output is kept; rules do not chain.
    pub fn rewrite_path(&self, path: &str) -> Option<String> {
        let mut rewritten = None;
        for rule in &self.path_rewrites {
            rewritten = Some(rule.apply(path));
        }
        rewritten.filter(|new_path| new_path != path)
    }

    pub fn override_for(&self, path: &str) -> Option<&Path> {
        self.overrides.get(path).map(PathBuf::as_path)
    }
}

/// Routes sharing one listening port
#[derive(Debug)]
pub struct PortRoutes {
    pub port: u16,
    /// Terminate TLS on accepted connections
    pub use_tls: bool,
    routes: Vec<Arc<TunnelRoute>>,
}

impl PortRoutes {
    /// Route for a `Host` header value, with the value to send upstream
    pub fn find(&self, host_value: &str) -> Option<(&Arc<TunnelRoute>, String)> {
        self.routes.iter().find_map(|route| {
            route
                .destination_host_value(host_value)
                .map(|upstream| (route, upstream))
        })
    }

    pub fn routes(&self) -> &[Arc<TunnelRoute>] {
        &self.routes
    }
}

/// All routes grouped by source port
#[derive(Debug, Default)]
pub struct RoutingTable {
    ports: BTreeMap<u16, Arc<PortRoutes>>,
}

impl RoutingTable {
    /// Routes on one port must agree on whether the destination uses TLS.
    pub fn validate(configs: &[TunnelConfig]) -> Result<(), ConfigError> {
        let mut schemes: BTreeMap<u16, Vec<bool>> = BTreeMap::new();
        for config in configs {
            let seen = schemes.entry(config.source.port).or_default();
            let tls = config.destination.scheme.is_tls();
            if !seen.contains(&tls) {
                seen.push(tls);
            }
        }

        let conflicts: Vec<u16> = schemes
            .into_iter()
            .filter(|(_, seen)| seen.len() > 1)
            .map(|(port, _)| port)
            .collect();
        for port in &conflicts {
            error!(port, "Port is used with different schemes: http & https");
        }

        match conflicts.first() {
            Some(port) => Err(ConfigError::ConflictingSchemes(*port)),
            None => Ok(()),
        }
    }

    /// Validate, resolve every destination concurrently and build the table.
    pub async fn build(configs: Vec<TunnelConfig>) -> Result<Self, RoutingError> {
        Self::validate(&configs)?;
        let routes = try_join_all(configs.into_iter().map(TunnelRoute::resolve)).await?;
        Ok(Self::from_routes(routes)?)
    }

    /// Group already-resolved routes by source port.
    pub fn from_routes(routes: Vec<TunnelRoute>) -> Result<Self, ConfigError> {
        let mut grouped: BTreeMap<u16, Vec<Arc<TunnelRoute>>> = BTreeMap::new();
        for route in routes {
            info!(
                source = %route.source,
                destination = %route.destination,
                rewrites = route.path_rewrites.len(),
                overrides = route.overrides.len(),
                "Registered tunnel"
            );
            grouped
                .entry(route.source.port)
                .or_default()
                .push(Arc::new(route));
        }

        let mut ports = BTreeMap::new();
        for (port, routes) in grouped {
            let tls: Vec<bool> = routes
                .iter()
                .map(|r| r.destination.scheme.is_tls())
                .collect();
            if tls.iter().any(|t| *t != tls[0]) {
                return Err(ConfigError::ConflictingSchemes(port));
            }
            let use_tls = routes.iter().any(|r| r.source.scheme.is_tls());
            ports.insert(
                port,
                Arc::new(PortRoutes {
                    port,
                    use_tls,
                    routes,
                }),
            );
        }

        Ok(Self { ports })
    }

    pub fn ports(&self) -> impl Iterator<Item = &Arc<PortRoutes>> {
        self.ports.values()
    }

    pub fn port(&self, port: u16) -> Option<&Arc<PortRoutes>> {
        self.ports.get(&port)
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn route(spec: &str) -> TunnelRoute {
        TunnelRoute::new(
            TunnelConfig::parse(spec).unwrap(),
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        )
    }

    #[test]
    fn test_rewrite_rules_do_not_chain() {
        let route = route("http:a:80>http:b:80|rewritepath=(.*)>/x$1|rewritepath=(.*)>/y$1");
        assert_eq!(route.rewrite_path("/a"), Some("/y/a".to_string()));
    }

    #[test]
    fn test_last_rule_decides_even_without_match() {
        let route = route("http:a:80>http:b:80|rewritepath=^/api(.*)>/v2$1|rewritepath=^/static(.*)>/assets$1");
        // The first rule matches but the last one leaves the path untouched.
        assert_eq!(route.rewrite_path("/api/users"), None);
        assert_eq!(route.rewrite_path("/static/app.js"), Some("/assets/app.js".to_string()));
    }

    #[test]
    fn test_no_rules_no_rewrite() {
        let route = route("http:a:80>http:b:80");
        assert_eq!(route.rewrite_path("/anything"), None);
    }

    #[test]
    fn test_host_matching() {
        let route = route("http:Local.Test:8080>http:backend.test:9090");
        assert_eq!(route.destination_host_value("local.test"), Some("backend.test".to_string()));
        assert_eq!(
            route.destination_host_value("LOCAL.TEST:8080"),
            Some("backend.test:9090".to_string())
        );
        assert_eq!(route.destination_host_value("local.test:1234"), None);
        assert_eq!(route.destination_host_value("other.test"), None);
    }

    #[test]
    fn test_table_groups_by_port() {
        let table = RoutingTable::from_routes(vec![
            route("http:a.test:8080>http:x:80"),
            route("https:b.test:8080>http:y:80"),
            route("http:c.test:9090>https:z:443"),
        ])
        .unwrap();

        let port = table.port(8080).unwrap();
        assert!(port.use_tls);
        assert_eq!(port.routes().len(), 2);
        assert_eq!(port.find("B.TEST").unwrap().0.destination.host, "y");
        assert!(port.find("c.test").is_none());

        let other = table.port(9090).unwrap();
        assert!(!other.use_tls);
        assert_eq!(table.ports().count(), 2);
    }

    #[test]
    fn test_conflicting_destination_schemes() {
        let configs = vec![
            TunnelConfig::parse("http:a.test:8080>http:x:80").unwrap(),
            TunnelConfig::parse("http:b.test:8080>https:y:443").unwrap(),
        ];
        assert!(matches!(
            RoutingTable::validate(&configs),
            Err(ConfigError::ConflictingSchemes(8080))
        ));

        let routes = configs
            .into_iter()
            .map(|c| TunnelRoute::new(c, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]))
            .collect();
        assert!(RoutingTable::from_routes(routes).is_err());
    }

    #[tokio::test]
    async fn test_build_resolves_destinations() {
        let configs = vec![TunnelConfig::parse("http:local.test:8080>http:127.0.0.1:9090").unwrap()];
        let table = RoutingTable::build(configs).await.unwrap();
        let (route, _) = table.port(8080).unwrap().find("local.test").unwrap();
        assert_eq!(
            route.destination_addr(),
            Some("127.0.0.1:9090".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_build_fails_on_unresolvable_destination() {
        let configs = vec![TunnelConfig::parse("http:a.test:80>http:does-not-exist.invalid:80").unwrap()];
        assert!(RoutingTable::build(configs).await.is_err());
    }
}
