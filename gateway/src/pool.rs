// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gateway_util::backend::construct_channel;
use tokio::sync::Mutex;
use tonic::transport::Channel;

use crate::discovery::{DiscoveryClient, ServiceInstance};

/// Mutable state for one dynamic cluster, protected by a single mutex. Connection dialing is
/// performed intentionally inside the critical section: this serializes connection creation
/// per instance and keeps `instances`, bindings, and connections consistent as one snapshot.
struct PoolState {
    instances: Vec<ServiceInstance>,
    connection_by_instance: HashMap<String, Channel>,
    key_to_instance: HashMap<String, String>,
    rr_cursor: usize,
    closed: bool,
}

impl PoolState {
    fn new() -> Self {
        PoolState {
            instances: Vec::new(),
            connection_by_instance: HashMap::new(),
            key_to_instance: HashMap::new(),
            rr_cursor: 0,
            closed: false,
        }
    }

    fn remove_instance(&mut self, instance_id: &str) {
        self.connection_by_instance.remove(instance_id);
        self.key_to_instance
            .retain(|_, bound_instance| bound_instance != instance_id);
        self.instances.retain(|i| i.instance_id != instance_id);
        if self.rr_cursor >= self.instances.len() {
            self.rr_cursor = 0;
        }
    }
}

/// Per-dynamic-cluster connection pool: maintains the instance set and connections, and
/// implements round-robin and sticky-key selection with eviction on failure.
pub struct ConnectionPool {
    cluster_id: String,
    discovery: DiscoveryClient,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(cluster_id: impl Into<String>, discovery: DiscoveryClient) -> Arc<Self> {
        Arc::new(ConnectionPool {
            cluster_id: cluster_id.into(),
            discovery,
            state: Mutex::new(PoolState::new()),
        })
    }

    /// Spawns the background refresh loop: an initial fetch, then a fetch on every tick of
    /// `refresh_interval`. Stops once the pool has been closed.
    pub fn spawn_refresh_loop(self: &Arc<Self>, refresh_interval: Duration) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.refresh_once().await;
            let mut interval = tokio::time::interval(refresh_interval);
            interval.tick().await; // consume the immediate first tick
            loop {
                interval.tick().await;
                if pool.state.lock().await.closed {
                    return;
                }
                pool.refresh_once().await;
            }
        });
    }

    async fn refresh_once(&self) {
        match self.discovery.list_instances().await {
            Ok(new_instances) => {
                let mut state = self.state.lock().await;
                if state.closed {
                    return;
                }
                let new_ids: std::collections::HashSet<&str> =
                    new_instances.iter().map(|i| i.instance_id.as_str()).collect();
                let removed_ids = state
                    .instances
                    .iter()
                    .map(|i| i.instance_id.clone())
                    .filter(|id| !new_ids.contains(id.as_str()))
                    .collect::<Vec<_>>();
                for id in removed_ids {
                    state.connection_by_instance.remove(&id);
                    state.key_to_instance.retain(|_, bound| bound != &id);
                }
                state.instances = new_instances;
                if state.rr_cursor >= state.instances.len() {
                    state.rr_cursor = 0;
                }
                metrics::gauge!(
                    "gateway_pool_instances",
                    state.instances.len() as f64,
                    "cluster" => self.cluster_id.clone(),
                );
            }
            Err(err) => {
                tracing::warn!(%err, "discovery refresh failed, keeping previous instance set");
            }
        }
    }

    async fn get_or_dial(
        state: &mut PoolState,
        instance: &ServiceInstance,
    ) -> Result<Channel, String> {
        if let Some(channel) = state.connection_by_instance.get(&instance.instance_id) {
            return Ok(channel.clone());
        }
        let channel = construct_channel(&instance.address()).await?;
        state
            .connection_by_instance
            .insert(instance.instance_id.clone(), channel.clone());
        Ok(channel)
    }

    /// Round-robins across healthy instances starting from the cursor. Dial failures merely
    /// skip that instance for this attempt; they do not poison it.
    pub async fn acquire_round_robin(&self) -> Result<(Channel, String), PoolError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(PoolError::PoolClosed);
        }
        if state.instances.is_empty() {
            return Err(PoolError::NoInstance);
        }

        let count = state.instances.len();
        let start = state.rr_cursor % count;
        for offset in 0..count {
            let idx = (start + offset) % count;
            let instance = state.instances[idx].clone();
            match Self::get_or_dial(&mut state, &instance).await {
                Ok(channel) => {
                    state.rr_cursor = (idx + 1) % count;
                    return Ok((channel, instance.instance_id));
                }
                Err(err) => {
                    tracing::debug!(instance_id = %instance.instance_id, %err, "dial failed during round-robin acquire");
                }
            }
        }
        Err(PoolError::NoInstance)
    }

    /// Binds `key` to an instance, reusing the existing binding if still connected. Instances
    /// already bound to a *different* non-empty key are skipped (sticky isolation).
    pub async fn acquire_for_key(&self, key: &str) -> Result<(Channel, String), PoolError> {
        if key.is_empty() {
            return Err(PoolError::NoInstance);
        }

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(PoolError::PoolClosed);
        }

        if let Some(bound_instance_id) = state.key_to_instance.get(key).cloned() {
            if let Some(channel) = state.connection_by_instance.get(&bound_instance_id) {
                return Ok((channel.clone(), bound_instance_id));
            }
        }

        let candidates = state.instances.clone();
        for instance in candidates {
            let bound_to_other = state
                .key_to_instance
                .values()
                .any(|bound| bound == &instance.instance_id)
                && state.key_to_instance.get(key) != Some(&instance.instance_id);
            if bound_to_other {
                continue;
            }

            match Self::get_or_dial(&mut state, &instance).await {
                Ok(channel) => {
                    state
                        .key_to_instance
                        .insert(key.to_owned(), instance.instance_id.clone());
                    return Ok((channel, instance.instance_id));
                }
                Err(err) => {
                    tracing::debug!(instance_id = %instance.instance_id, %err, "dial failed during sticky acquire");
                }
            }
        }

        Err(PoolError::NoInstance)
    }

    /// Evicts `instance_id` after a request observed a transport failure against it: drops
    /// the sticky binding (if any), closes and removes its connection, and removes it from
    /// the instance list so same-request retries do not re-select it. Best-effort notifies
    /// discovery.
    pub async fn on_failure(&self, key: &str, instance_id: &str) {
        {
            let mut state = self.state.lock().await;
            if !key.is_empty() {
                state.key_to_instance.remove(key);
            }
            state.remove_instance(instance_id);
        }
        self.discovery.unregister(instance_id).await;
    }

    /// Idempotent. Marks the pool closed and drops every connection and binding.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.connection_by_instance.clear();
        state.key_to_instance.clear();
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum PoolError {
    #[error("pool is closed")]
    PoolClosed,
    #[error("no instance available")]
    NoInstance,
}
