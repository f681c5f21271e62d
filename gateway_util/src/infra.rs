// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use tokio::runtime::Builder;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use warp::Filter;

/// Default Prometheus histogram buckets.
/// These have been chosen to hopefully be better for latencies internal to a data center than
/// the defaults most client libraries ship with, which are tuned for Internet-facing Web APIs.
const DEFAULT_PROMETHEUS_BUCKETS: &[f64] = &[
    0.0005, // 0.5 ms
    0.001,  // 1 ms
    0.002,  // 2 ms
    0.003,  // 3 ms
    0.004,  // 4 ms
    0.005,  // 5 ms
    0.010,  // 10 ms
    0.020,  // 20 ms
    0.030,  // 30 ms
    0.040,  // 40 ms
    0.050,  // 50 ms
    0.100,  // 100 ms
    0.250,  // 250 ms
    0.5,    // 500 ms
    1.0,    // 1 sec
    2.5,    // 2.5 secs
    5.0,    // 5 secs
    10.0,   // 10 secs
    30.0,   // 30 secs
];

/// Admin endpoints configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct InfraConfig {
    /// Bind address for the `/healthz` and `/metricsz` endpoints.
    #[serde(default = "default_bind_addr")]
    pub admin_bind_addr: String,
}

impl Default for InfraConfig {
    fn default() -> Self {
        InfraConfig {
            admin_bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:9090".to_owned()
}

/// A handle the caller flips once startup (route table, pools, static connections) has
/// finished, so `/healthz` does not report ready before the gateway can actually serve.
#[derive(Clone, Default)]
pub struct ReadinessHandle(Arc<AtomicBool>);

impl ReadinessHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn setup_metrics_handler() -> Result<PrometheusHandle, String> {
    let recorder = PrometheusBuilder::new()
        .set_buckets(DEFAULT_PROMETHEUS_BUCKETS)
        .map_err(|err| format!("Failed to install set histogram buckets: {err}"))?
        .build_recorder();
    let handle = recorder.handle();
    metrics::set_boxed_recorder(Box::new(recorder))
        .map_err(|err| format!("Failed to install Prometheus metrics recorder: {err}"))?;
    Ok(handle)
}

/// Setup infra endpoints (`/healthz`, `/metricsz`) for use by devops systems.
///
/// Returns a `sync::watch` receiver that should be used by all servers as a signal for when
/// they should be shut down, by looking for `RecvError` when calling `.changed()`.
pub fn setup_infra_endpoints(
    config: InfraConfig,
    readiness: ReadinessHandle,
) -> Result<watch::Receiver<()>, String> {
    let metrics_handle = setup_metrics_handler()?;

    let bind_addr: SocketAddr = config
        .admin_bind_addr
        .parse()
        .map_err(|err| format!("Failed to parse admin bind address: {err}"))?;

    let (shutdown_sender, shutdown_receiver) = watch::channel(());

    // Spawn a thread for all admin tasks to isolate them from the main event loop.
    std::thread::spawn(move || {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name("admin")
            .build()
            .expect("initialize admin event loop");

        runtime.block_on(async move {
            let mut sigint_stream = signal(SignalKind::interrupt())
                .map_err(|err| format!("Failed to create SIGINT handler: {err}"))
                .expect("attach SIGINT handler");
            let mut sigterm_stream = signal(SignalKind::terminate())
                .map_err(|err| format!("Failed to create SIGTERM handler: {err}"))
                .expect("attach SIGTERM handler");
            tokio::spawn(async move {
                futures::future::select(
                    sigint_stream.recv().boxed(),
                    sigterm_stream.recv().boxed(),
                )
                .await;
                tracing::info!("received shutdown signal, starting graceful shutdown");
                // This will cause all receivers to get RecvError when calling `.changed()`.
                drop(shutdown_sender);
            });

            let healthz = warp::path("healthz").and(warp::get()).map(move || {
                if readiness.is_ready() {
                    warp::reply::with_status("OK", warp::http::StatusCode::OK)
                } else {
                    warp::reply::with_status(
                        "not ready",
                        warp::http::StatusCode::SERVICE_UNAVAILABLE,
                    )
                }
            });

            let metricsz = warp::path("metricsz")
                .and(warp::get())
                .map(move || metrics_handle.render());

            warp::serve(healthz.or(metricsz)).bind(bind_addr).await
        });
    });

    Ok(shutdown_receiver)
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use tokio::time::{sleep, Duration};

    use super::{setup_infra_endpoints, InfraConfig, ReadinessHandle};

    #[tokio::test]
    async fn infra_endpoints_respond() {
        let config = InfraConfig {
            admin_bind_addr: "127.0.0.1:19090".to_owned(),
        };
        let readiness = ReadinessHandle::new();
        setup_infra_endpoints(config, readiness.clone()).unwrap();

        // `warp` does not give us a way to wait until it has finished binding.
        sleep(Duration::from_millis(500)).await;

        let response = reqwest::get("http://127.0.0.1:19090/healthz")
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        readiness.mark_ready();
        let response = reqwest::get("http://127.0.0.1:19090/healthz")
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        metrics::increment_counter!("test_counter");
        let response = reqwest::get("http://127.0.0.1:19090/metricsz")
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.text().await.unwrap().contains("test_counter"));
    }
}
