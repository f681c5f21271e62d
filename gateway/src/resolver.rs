// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use gateway_util::backend::construct_channel;
use http::HeaderMap;
use tonic::transport::Channel;

use crate::error::GatewayError;
use crate::pool::{ConnectionPool, PoolError};
use crate::routing::{BalancerType, Route};

/// Dispatches a resolved route to either a static cluster's single connection or a dynamic
/// cluster's pool.
pub struct ConnectionResolver {
    static_connections: HashMap<String, Channel>,
    pools: HashMap<String, Arc<ConnectionPool>>,
}

/// The outcome of resolving a route: a live connection plus the bookkeeping the proxy needs
/// to report failures back to the same pool/key/instance later.
pub struct Resolved {
    pub channel: Channel,
    pub sticky_key: String,
    pub instance_id: String,
}

impl ConnectionResolver {
    pub fn new(
        static_connections: HashMap<String, Channel>,
        pools: HashMap<String, Arc<ConnectionPool>>,
    ) -> Self {
        ConnectionResolver {
            static_connections,
            pools,
        }
    }

    /// Dials every statically configured cluster up front. Dynamic clusters are resolved
    /// lazily through their pool instead.
    pub async fn dial_static_clusters(
        addresses: &HashMap<String, String>,
    ) -> Result<HashMap<String, Channel>, String> {
        let mut connections = HashMap::with_capacity(addresses.len());
        for (cluster_id, address) in addresses {
            let channel = construct_channel(address)
                .await
                .map_err(|err| format!("failed to dial static cluster {cluster_id}: {err}"))?;
            connections.insert(cluster_id.clone(), channel);
        }
        Ok(connections)
    }

    pub async fn resolve(
        &self,
        route: &Route,
        headers: &HeaderMap,
    ) -> Result<Resolved, GatewayError> {
        if let Some(channel) = self.static_connections.get(&route.cluster_id) {
            return Ok(Resolved {
                channel: channel.clone(),
                sticky_key: String::new(),
                instance_id: route.cluster_id.clone(),
            });
        }

        let pool = self
            .pools
            .get(&route.cluster_id)
            .ok_or_else(|| GatewayError::BackendUnavailable(format!(
                "unknown cluster: {}",
                route.cluster_id
            )))?;

        if route.balancer.balancer_type == BalancerType::StickySession {
            let sticky_key = headers
                .get(&route.balancer.sticky_header_name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .trim()
                .to_owned();
            if sticky_key.is_empty() {
                return Err(GatewayError::Authentication(tonic::Status::unauthenticated(
                    "missing or invalid token",
                )));
            }

            let (channel, instance_id) = pool
                .acquire_for_key(&sticky_key)
                .await
                .map_err(map_pool_error)?;
            return Ok(Resolved {
                channel,
                sticky_key,
                instance_id,
            });
        }

        let (channel, instance_id) = pool.acquire_round_robin().await.map_err(map_pool_error)?;
        Ok(Resolved {
            channel,
            sticky_key: String::new(),
            instance_id,
        })
    }

    /// Delegates failure handling to the appropriate pool; a no-op for static clusters, which
    /// have no eviction bookkeeping.
    pub async fn on_failure(&self, route: &Route, sticky_key: &str, instance_id: &str) {
        if let Some(pool) = self.pools.get(&route.cluster_id) {
            pool.on_failure(sticky_key, instance_id).await;
        }
    }

    pub async fn close(&self) {
        for pool in self.pools.values() {
            pool.close().await;
        }
    }
}

fn map_pool_error(err: PoolError) -> GatewayError {
    match err {
        PoolError::PoolClosed => GatewayError::BackendUnavailable("pool is closed".to_owned()),
        PoolError::NoInstance => GatewayError::NoCapacity,
    }
}
