// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use gateway::headers::{AuthenticationProcessor, HeaderChain};
use gateway::pool::ConnectionPool;
use gateway::routing::ClusterConfig;
use gateway::{ConnectionResolver, DiscoveryClient, GatewayProxy, RouteMatcher, SystemTimeProvider, TokenVerifier};
use gateway_util::infra::{setup_infra_endpoints, InfraConfig, ReadinessHandle};
use gateway_util::logging::setup_logging;
use gateway_util::services::GrpcMetrics;
use hyper::server::conn::AddrIncoming;
use hyper::service::{make_service_fn, service_fn};
use tonic::transport::Channel;
use tower::Service;

const REQUIRED_ENV_VARS: &[&str] = &["SERVICE_PORT_GRPC", "JWT_SECRET", "RETRY_COUNT", "RETRY_TIMEOUT_MS"];

#[tokio::main]
async fn main() -> ExitCode {
    setup_logging("gateway-server");

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "gateway-server failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), String> {
    let config_path =
        std::env::var("CONFIG_PATH").map_err(|_| "CONFIG_PATH is required".to_owned())?;
    let config_yaml = tokio::fs::read_to_string(&config_path)
        .await
        .map_err(|err| format!("failed to read config from {config_path}: {err}"))?;

    let env: HashMap<String, String> = REQUIRED_ENV_VARS
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect();

    let config = gateway::config::load(&config_yaml, &env)?;
    tracing::info!(listen_port = config.listen_port, "loaded gateway config");

    let readiness = ReadinessHandle::new();
    let admin_bind_addr =
        std::env::var("ADMIN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:9090".to_owned());
    let shutdown_receiver = setup_infra_endpoints(
        InfraConfig {
            admin_bind_addr,
        },
        readiness.clone(),
    )?;

    let (static_connections, pools, retryable_clusters) = dial_clusters(&config.clusters).await?;
    let resolver = ConnectionResolver::new(static_connections, pools);

    let verifier = TokenVerifier::new(config.secret.clone());
    let auth_processor = AuthenticationProcessor::new(
        &config.route_config.routes,
        verifier,
        Box::new(SystemTimeProvider),
    );
    let header_chain = HeaderChain::new(vec![Box::new(auth_processor)]);
    let route_matcher = RouteMatcher::new(config.route_config.clone());

    let proxy = GatewayProxy::new(
        route_matcher,
        header_chain,
        resolver,
        retryable_clusters,
        config.retry_count,
        config.retry_timeout,
    );
    let service = GrpcMetrics::new(proxy);

    readiness.mark_ready();

    let address: SocketAddr = format!("0.0.0.0:{}", config.listen_port)
        .parse()
        .map_err(|err| format!("failed to build listen address: {err}"))?;
    let incoming = AddrIncoming::bind(&address)
        .map_err(|err| format!("failed to bind {address}: {err}"))?;
    tracing::info!(%address, "serving gateway");

    let make_service = make_service_fn(move |_conn| {
        let service = service.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let mut service = service.clone();
                async move { service.call(req).await }
            }))
        }
    });

    let mut shutdown_receiver = shutdown_receiver;
    hyper::Server::builder(incoming)
        .http2_only(true)
        .serve(make_service)
        .with_graceful_shutdown(async move {
            while shutdown_receiver.changed().await.is_ok() {}
        })
        .await
        .map_err(|err| format!("server error: {err}"))
}

/// Dials every static cluster up front and starts a background refresh loop + pool for every
/// dynamic cluster. Dynamic clusters are the ones eligible for mid-stream transfer.
async fn dial_clusters(
    clusters: &HashMap<String, ClusterConfig>,
) -> Result<(HashMap<String, Channel>, HashMap<String, Arc<ConnectionPool>>, HashSet<String>), String>
{
    let mut static_addresses = HashMap::new();
    let mut pools = HashMap::new();
    let mut retryable_clusters = HashSet::new();

    for (cluster_id, cluster_config) in clusters {
        match cluster_config {
            ClusterConfig::Static { address } => {
                static_addresses.insert(cluster_id.clone(), address.clone());
            }
            ClusterConfig::Dynamic {
                discovery_url,
                refresh_interval,
            } => {
                let discovery = DiscoveryClient::new(discovery_url.clone());
                let pool = ConnectionPool::new(cluster_id.clone(), discovery);
                pool.spawn_refresh_loop(*refresh_interval);
                pools.insert(cluster_id.clone(), pool);
                retryable_clusters.insert(cluster_id.clone());
            }
        }
    }

    let static_connections = ConnectionResolver::dial_static_clusters(&static_addresses).await?;
    Ok((static_connections, pools, retryable_clusters))
}
