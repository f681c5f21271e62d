// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::routing::{
    AuthorizationMode, Balancer, BalancerType, ClusterConfig, DefaultAction, DefaultRoute, Route,
    RouteConfig,
};

#[derive(Deserialize, Debug)]
struct RawBalancer {
    #[serde(rename = "type", default)]
    balancer_type: Option<String>,
    #[serde(default)]
    header: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawRoute {
    prefix: String,
    cluster: String,
    #[serde(default)]
    authorization: Option<String>,
    #[serde(default)]
    balancer: Option<RawBalancer>,
}

#[derive(Deserialize, Debug)]
struct RawDefault {
    action: String,
    #[serde(default)]
    use_cluster: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawCluster {
    #[serde(rename = "type")]
    cluster_type: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    discoverer_url: Option<String>,
    #[serde(default)]
    discoverer_interval_ms: Option<u64>,
}

#[derive(Deserialize, Debug)]
struct RawConfig {
    default: RawDefault,
    routes: Vec<RawRoute>,
    clusters: HashMap<String, RawCluster>,
}

/// Fully validated configuration produced from the YAML file plus environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub secret: Vec<u8>,
    pub retry_count: u32,
    pub retry_timeout: Duration,
    pub route_config: RouteConfig,
    pub clusters: HashMap<String, ClusterConfig>,
}

/// Reads `SERVICE_PORT_GRPC`, `JWT_SECRET`, `RETRY_COUNT`, `RETRY_TIMEOUT_MS` from the
/// process environment and parses+validates the YAML file at `config_path` against them.
pub fn load(config_yaml: &str, env: &HashMap<String, String>) -> Result<Config, String> {
    let raw: RawConfig =
        serde_yaml::from_str(config_yaml).map_err(|err| format!("failed to parse config: {err}"))?;

    let listen_port: u16 = env
        .get("SERVICE_PORT_GRPC")
        .ok_or("SERVICE_PORT_GRPC is required")?
        .parse()
        .map_err(|_| "SERVICE_PORT_GRPC must be a valid port number".to_owned())?;
    if listen_port == 0 {
        return Err("SERVICE_PORT_GRPC must be in [1, 65535]".to_owned());
    }

    let retry_count: u32 = env
        .get("RETRY_COUNT")
        .ok_or("RETRY_COUNT is required")?
        .parse()
        .map_err(|_| "RETRY_COUNT must be a valid integer".to_owned())?;
    if retry_count < 1 {
        return Err("RETRY_COUNT must be >= 1".to_owned());
    }

    let retry_timeout_ms: u64 = env
        .get("RETRY_TIMEOUT_MS")
        .ok_or("RETRY_TIMEOUT_MS is required")?
        .parse()
        .map_err(|_| "RETRY_TIMEOUT_MS must be a valid integer".to_owned())?;
    if retry_timeout_ms == 0 {
        return Err("RETRY_TIMEOUT_MS must be > 0".to_owned());
    }

    let clusters = raw
        .clusters
        .into_iter()
        .map(|(id, raw_cluster)| {
            let cluster = match raw_cluster.cluster_type.as_str() {
                "static" => ClusterConfig::Static {
                    address: raw_cluster
                        .address
                        .ok_or_else(|| format!("cluster {id}: static clusters require 'address'"))?,
                },
                "dynamic" => ClusterConfig::Dynamic {
                    discovery_url: raw_cluster.discoverer_url.ok_or_else(|| {
                        format!("cluster {id}: dynamic clusters require 'discoverer_url'")
                    })?,
                    refresh_interval: Duration::from_millis(
                        raw_cluster.discoverer_interval_ms.ok_or_else(|| {
                            format!("cluster {id}: dynamic clusters require 'discoverer_interval_ms'")
                        })?,
                    ),
                },
                other => return Err(format!("cluster {id}: unknown cluster type '{other}'")),
            };
            Ok((id, cluster))
        })
        .collect::<Result<HashMap<_, _>, String>>()?;

    let mut any_requires_auth = false;
    let routes = raw
        .routes
        .into_iter()
        .map(|raw_route| -> Result<Route, String> {
            let prefix = normalize_prefix(&raw_route.prefix);
            let authorization = match raw_route.authorization.as_deref() {
                None | Some("") | Some("none") => AuthorizationMode::None,
                Some("required") => {
                    any_requires_auth = true;
                    AuthorizationMode::Required
                }
                Some(other) => {
                    return Err(format!("route {prefix}: unknown authorization mode '{other}'"))
                }
            };

            let balancer = match raw_route.balancer {
                None => Balancer::default(),
                Some(raw_balancer) => {
                    let balancer_type = match raw_balancer.balancer_type.as_deref() {
                        None | Some("") | Some("round_robin") | Some("round-robin") => {
                            BalancerType::RoundRobin
                        }
                        Some("sticky_session") | Some("sticky-session") => {
                            BalancerType::StickySession
                        }
                        Some(other) => {
                            return Err(format!(
                                "route {prefix}: unknown balancer type '{other}'"
                            ))
                        }
                    };
                    let sticky_header_name = raw_balancer.header.unwrap_or_default();
                    if balancer_type == BalancerType::StickySession && sticky_header_name.is_empty()
                    {
                        // Filled in with "session-id" by the route matcher; nothing to
                        // validate here beyond accepting the empty value.
                    }
                    Balancer {
                        balancer_type,
                        sticky_header_name,
                    }
                }
            };

            if !clusters.contains_key(&raw_route.cluster) {
                return Err(format!(
                    "route {prefix}: references unknown cluster '{}'",
                    raw_route.cluster
                ));
            }

            Ok(Route {
                prefix,
                cluster_id: raw_route.cluster,
                authorization,
                balancer,
            })
        })
        .collect::<Result<Vec<_>, String>>()?;

    let default_action = match raw.default.action.as_str() {
        "error" => DefaultAction::Error,
        "use_cluster" => {
            let cluster_id = raw
                .default
                .use_cluster
                .ok_or("default.action is 'use_cluster' but 'use_cluster' was not set")?;
            if !clusters.contains_key(&cluster_id) {
                return Err(format!(
                    "default route references unknown cluster '{cluster_id}'"
                ));
            }
            DefaultAction::UseCluster { cluster_id }
        }
        other => return Err(format!("unknown default.action '{other}'")),
    };

    let secret = env.get("JWT_SECRET").cloned().unwrap_or_default();
    if any_requires_auth && secret.is_empty() {
        return Err("JWT_SECRET is required because at least one route requires authorization"
            .to_owned());
    }

    Ok(Config {
        listen_port,
        secret: secret.into_bytes(),
        retry_count,
        retry_timeout: Duration::from_millis(retry_timeout_ms),
        route_config: RouteConfig {
            routes,
            default: DefaultRoute {
                action: default_action,
            },
        },
        clusters,
    })
}

/// Trims whitespace, strips a trailing "*" (used by some authors to mean "prefix match",
/// which is already this matcher's only mode), and prepends "/" if missing.
fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_star = trimmed.strip_suffix('*').unwrap_or(trimmed);
    if without_star.starts_with('/') {
        without_star.to_owned()
    } else {
        format!("/{without_star}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const MINIMAL_YAML: &str = r#"
default:
  action: error
routes:
  - prefix: "/worker.v1.Worker/Echo*"
    cluster: workers
    authorization: required
clusters:
  workers:
    type: dynamic
    discoverer_url: "http://discovery:8080"
    discoverer_interval_ms: 5000
"#;

    #[test]
    fn loads_valid_config() {
        let config = load(
            MINIMAL_YAML,
            &env(&[
                ("SERVICE_PORT_GRPC", "8443"),
                ("RETRY_COUNT", "3"),
                ("RETRY_TIMEOUT_MS", "1000"),
                ("JWT_SECRET", "shared-secret"),
            ]),
        )
        .unwrap();

        assert_eq!(config.listen_port, 8443);
        assert_eq!(config.route_config.routes.len(), 1);
        assert_eq!(config.route_config.routes[0].prefix, "/worker.v1.Worker/Echo");
    }

    #[test]
    fn requires_secret_when_auth_required() {
        let err = load(
            MINIMAL_YAML,
            &env(&[
                ("SERVICE_PORT_GRPC", "8443"),
                ("RETRY_COUNT", "3"),
                ("RETRY_TIMEOUT_MS", "1000"),
            ]),
        )
        .unwrap_err();
        assert!(err.contains("JWT_SECRET"));
    }

    #[test]
    fn rejects_retry_count_zero() {
        let err = load(
            MINIMAL_YAML,
            &env(&[
                ("SERVICE_PORT_GRPC", "8443"),
                ("RETRY_COUNT", "0"),
                ("RETRY_TIMEOUT_MS", "1000"),
                ("JWT_SECRET", "shared-secret"),
            ]),
        )
        .unwrap_err();
        assert!(err.contains("RETRY_COUNT"));
    }

    #[test]
    fn rejects_route_to_unknown_cluster() {
        let yaml = r#"
default:
  action: error
routes:
  - prefix: "/x"
    cluster: missing
clusters: {}
"#;
        let err = load(
            yaml,
            &env(&[
                ("SERVICE_PORT_GRPC", "8443"),
                ("RETRY_COUNT", "3"),
                ("RETRY_TIMEOUT_MS", "1000"),
            ]),
        )
        .unwrap_err();
        assert!(err.contains("unknown cluster"));
    }

    #[test]
    fn normalizes_prefixes() {
        assert_eq!(normalize_prefix("  /foo*  "), "/foo");
        assert_eq!(normalize_prefix("foo"), "/foo");
        assert_eq!(normalize_prefix("/foo"), "/foo");
    }
}
