// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

/// Dial a single cleartext HTTP/2 backend and return its channel.
///
/// Used both for statically configured clusters and for dialing individual discovered
/// instances of a dynamic cluster.
pub async fn construct_channel(address: &str) -> Result<Channel, String> {
    let (hostname, port_str) = match address.split_once(':') {
        Some((h, p)) => (h, p),
        None => return Err("Expected HOST:PORT".to_owned()),
    };
    if hostname.is_empty() || port_str.is_empty() {
        return Err("Expected HOST:PORT".to_owned());
    }
    let port: u16 = port_str
        .parse()
        .map_err(|_| "Unable to parse port".to_owned())?;

    let endpoint = Endpoint::from_shared(format!("http://{hostname}:{port}"))
        .map_err(|err| format!("failed to build endpoint for {address}: {err}"))?
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10))
        .connect_timeout(Duration::from_secs(5));

    endpoint
        .connect()
        .await
        .map_err(|err| format!("failed to dial {address}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::construct_channel;

    #[tokio::test]
    async fn rejects_malformed_address() {
        let err = construct_channel("not-an-address").await.unwrap_err();
        assert!(err.contains("Expected HOST:PORT"));

        let err = construct_channel("host:notaport").await.unwrap_err();
        assert!(err.contains("Unable to parse port"));
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        // Port 0 is never listening; connect() should fail quickly rather than hang.
        let err = construct_channel("127.0.0.1:0").await.unwrap_err();
        assert!(err.contains("failed to dial"));
    }
}
