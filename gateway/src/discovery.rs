// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use serde::Deserialize;

/// One concrete backend endpoint within a dynamic cluster, as produced by the discovery
/// service. `instance_id` is the primary key.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Deserialize)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub ipv4: String,
    pub port: u16,
}

impl ServiceInstance {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ipv4, self.port)
    }
}

#[derive(Deserialize)]
struct ListInstancesResponse {
    instances: Vec<ServiceInstance>,
}

/// HTTP client for the discovery registry contract in the external interfaces section:
/// `GET /v1/instances` and `POST /v1/unregister/{instance_id}`.
#[derive(Clone)]
pub struct DiscoveryClient {
    base_url: String,
    http: reqwest::Client,
}

impl DiscoveryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        DiscoveryClient {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Returns the current instance set. An empty set is legal and is not an error; only
    /// transport/status failures are.
    pub async fn list_instances(&self) -> Result<Vec<ServiceInstance>, String> {
        let url = format!("{}/v1/instances", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| format!("discovery request failed: {err}"))?;
        if !response.status().is_success() {
            return Err(format!(
                "discovery returned non-2xx status: {}",
                response.status()
            ));
        }
        let parsed: ListInstancesResponse = response
            .json()
            .await
            .map_err(|err| format!("discovery returned malformed body: {err}"))?;
        Ok(parsed.instances)
    }

    /// Best-effort unregistration. Callers log failures and swallow them; this is never on
    /// the critical path of a request.
    pub async fn unregister(&self, instance_id: &str) {
        let url = format!("{}/v1/unregister/{instance_id}", self.base_url);
        match self.http.post(&url).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::warn!(
                    instance_id,
                    status = %response.status(),
                    "discovery unregister returned non-2xx status"
                );
            }
            Err(err) => {
                tracing::warn!(instance_id, %err, "discovery unregister request failed");
            }
        }
    }
}
