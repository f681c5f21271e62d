// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::time::Duration;

/// Per-route authentication requirement.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum AuthorizationMode {
    #[default]
    None,
    Required,
}

/// Per-route instance-selection strategy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum BalancerType {
    #[default]
    RoundRobin,
    StickySession,
}

#[derive(Clone, Debug)]
pub struct Balancer {
    pub balancer_type: BalancerType,
    /// Metadata key to extract the sticky key from. Defaults to "session-id" when
    /// `balancer_type` is `StickySession`.
    pub sticky_header_name: String,
}

impl Default for Balancer {
    fn default() -> Self {
        Balancer {
            balancer_type: BalancerType::RoundRobin,
            sticky_header_name: String::new(),
        }
    }
}

/// Immutable route record, built once at startup and never mutated.
#[derive(Clone, Debug)]
pub struct Route {
    pub prefix: String,
    pub cluster_id: String,
    pub authorization: AuthorizationMode,
    pub balancer: Balancer,
}

/// What to do when no configured route matches a method.
#[derive(Clone, Debug)]
pub enum DefaultAction {
    Error,
    UseCluster { cluster_id: String },
}

#[derive(Clone, Debug)]
pub struct DefaultRoute {
    pub action: DefaultAction,
}

/// Tagged union describing how a cluster's instances are reached.
#[derive(Clone, Debug)]
pub enum ClusterConfig {
    Static {
        address: String,
    },
    Dynamic {
        discovery_url: String,
        refresh_interval: Duration,
    },
}

/// Ordered collection of routes plus the default route, validated at construction time.
#[derive(Clone, Debug)]
pub struct RouteConfig {
    pub routes: Vec<Route>,
    pub default: DefaultRoute,
}

/// Resolves method names to routes using longest-prefix matching.
///
/// Routes are stored sorted by prefix length descending so `match_method` can return the
/// first match without any further searching.
#[derive(Clone, Debug)]
pub struct RouteMatcher {
    routes: Vec<Route>,
    default: DefaultRoute,
}

impl RouteMatcher {
    /// Builds a matcher from a validated [`RouteConfig`]. Fills in route defaults
    /// (authorization = none, balancer type = round-robin, sticky header name = "session-id"
    /// when the balancer is sticky-session and none was configured).
    pub fn new(config: RouteConfig) -> Self {
        let mut routes = config
            .routes
            .into_iter()
            .map(|mut route| {
                if route.balancer.balancer_type == BalancerType::StickySession
                    && route.balancer.sticky_header_name.is_empty()
                {
                    route.balancer.sticky_header_name = "session-id".to_owned();
                }
                route
            })
            .collect::<Vec<_>>();
        routes.sort_by_key(|r| std::cmp::Reverse(r.prefix.len()));

        RouteMatcher {
            routes,
            default: config.default,
        }
    }

    /// Returns the route bound to `method`: the longest configured prefix of `method`, or a
    /// synthesized default route when `default.action == use-cluster`. Returns `None`
    /// ("not routed") when nothing matches and the default action is `error`.
    pub fn match_method(&self, method: &str) -> Option<Route> {
        if let Some(route) = self.routes.iter().find(|r| method.starts_with(&r.prefix)) {
            return Some(route.clone());
        }

        match &self.default.action {
            DefaultAction::UseCluster { cluster_id } => Some(Route {
                prefix: String::new(),
                cluster_id: cluster_id.clone(),
                authorization: AuthorizationMode::None,
                balancer: Balancer::default(),
            }),
            DefaultAction::Error => None,
        }
    }
}

/// Validates a raw route configuration against the cluster table. Invariants enforced:
/// every referenced cluster-id must exist, prefixes begin with "/", sticky-session routes
/// must have a non-empty header name (post defaulting is allowed to be empty, it is filled
/// in by [`RouteMatcher::new`]).
pub fn validate_route_config(
    config: &RouteConfig,
    clusters: &HashMap<String, ClusterConfig>,
) -> Result<(), String> {
    for route in &config.routes {
        if !route.prefix.starts_with('/') {
            return Err(format!(
                "route prefix must start with '/': {:?}",
                route.prefix
            ));
        }
        if !clusters.contains_key(&route.cluster_id) {
            return Err(format!("route references unknown cluster: {}", route.cluster_id));
        }
    }

    match &config.default.action {
        DefaultAction::UseCluster { cluster_id } if !clusters.contains_key(cluster_id) => {
            return Err(format!("default route references unknown cluster: {cluster_id}"));
        }
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(prefix: &str, cluster_id: &str) -> Route {
        Route {
            prefix: prefix.to_owned(),
            cluster_id: cluster_id.to_owned(),
            authorization: AuthorizationMode::None,
            balancer: Balancer::default(),
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let matcher = RouteMatcher::new(RouteConfig {
            routes: vec![
                route("/worker.v1", "cluster-a"),
                route("/worker.v1.Worker/Echo", "cluster-b"),
            ],
            default: DefaultRoute {
                action: DefaultAction::Error,
            },
        });

        let matched = matcher.match_method("/worker.v1.Worker/Echo").unwrap();
        assert_eq!(matched.cluster_id, "cluster-b");
    }

    #[test]
    fn falls_back_to_default_use_cluster() {
        let matcher = RouteMatcher::new(RouteConfig {
            routes: vec![route("/worker.v1.Worker/Echo", "cluster-a")],
            default: DefaultRoute {
                action: DefaultAction::UseCluster {
                    cluster_id: "catchall".to_owned(),
                },
            },
        });

        let matched = matcher.match_method("/other.Service/Method").unwrap();
        assert_eq!(matched.cluster_id, "catchall");
        assert_eq!(matched.authorization, AuthorizationMode::None);
    }

    #[test]
    fn default_error_yields_no_route() {
        let matcher = RouteMatcher::new(RouteConfig {
            routes: vec![route("/worker.v1.Worker/Echo", "cluster-a")],
            default: DefaultRoute {
                action: DefaultAction::Error,
            },
        });

        assert!(matcher.match_method("/other.Service/Method").is_none());
    }

    #[test]
    fn sticky_session_route_defaults_header_name() {
        let matcher = RouteMatcher::new(RouteConfig {
            routes: vec![Route {
                balancer: Balancer {
                    balancer_type: BalancerType::StickySession,
                    sticky_header_name: String::new(),
                },
                ..route("/worker.v1.Worker/Echo", "cluster-a")
            }],
            default: DefaultRoute {
                action: DefaultAction::Error,
            },
        });

        let matched = matcher.match_method("/worker.v1.Worker/Echo").unwrap();
        assert_eq!(matched.balancer.sticky_header_name, "session-id");
    }

    #[test]
    fn rejects_route_with_unknown_cluster() {
        let config = RouteConfig {
            routes: vec![route("/worker.v1.Worker/Echo", "missing")],
            default: DefaultRoute {
                action: DefaultAction::Error,
            },
        };
        let clusters = HashMap::new();
        assert!(validate_route_config(&config, &clusters).is_err());
    }
}
