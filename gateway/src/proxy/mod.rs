// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The transparent proxy: the handler registered for every method the gateway receives. It
//! never decodes application payloads — every message is forwarded as opaque bytes via
//! [`codec::RawCodec`] — and it is the only place that opens, retries, and transfers backend
//! streams.

mod codec;
mod first_message;

use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::body::BoxBody;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status, Streaming};

use self::codec::RawCodec;
use self::first_message::FirstMessageSlot;
use crate::error::GatewayError;
use crate::headers::HeaderChain;
use crate::resolver::{ConnectionResolver, Resolved};
use crate::routing::{Route, RouteMatcher};

/// Backpressure-bounded channel capacity for both the inbound-to-backend request stream and
/// the backend-to-inbound response stream. Small and finite, as opposed to unbounded, since an
/// unbounded channel would let a fast backend or a fast client outrun the other side's ability
/// to drain it.
const FORWARD_CHANNEL_CAPACITY: usize = 16;

/// The stream type handed back to `tonic`'s low-level server machinery: a channel fed by the
/// backend-to-client forwarder.
type ProxyResponseStream = ReceiverStream<Result<Bytes, Status>>;

struct GatewayProxyInner {
    routes: RouteMatcher,
    header_chain: HeaderChain,
    resolver: ConnectionResolver,
    retryable_clusters: HashSet<String>,
    retry_count: u32,
    retry_timeout: Duration,
}

/// Registered as the handler for every method the gateway receives. Generalizes the teacher's
/// per-service `GrpcMetrics` wrapping (a `tower::Service` sitting directly on raw HTTP/2
/// requests/responses) to the entire inbound surface, since unlike the teacher's fixed REAPI
/// service set, MyGateway has no closed set of methods to generate typed clients for.
#[derive(Clone)]
pub struct GatewayProxy {
    inner: Arc<GatewayProxyInner>,
}

impl GatewayProxy {
    pub fn new(
        routes: RouteMatcher,
        header_chain: HeaderChain,
        resolver: ConnectionResolver,
        retryable_clusters: HashSet<String>,
        retry_count: u32,
        retry_timeout: Duration,
    ) -> Self {
        GatewayProxy {
            inner: Arc::new(GatewayProxyInner {
                routes,
                header_chain,
                resolver,
                retryable_clusters,
                retry_count,
                retry_timeout,
            }),
        }
    }

    /// Runs the full algorithm up through opening the first backend stream, then hands the
    /// rest of the call (forwarding, mid-stream failover) to a detached task so this future
    /// resolves as soon as there's a response stream to hand back to the client.
    #[tracing::instrument(skip_all, fields(opentelemetry = true, method = %method, cluster = tracing::field::Empty))]
    async fn handle(
        &self,
        method: String,
        request: Request<Streaming<Bytes>>,
    ) -> Result<Response<ProxyResponseStream>, GatewayError> {
        if method.is_empty() {
            return Err(GatewayError::Internal("missing method context".to_owned()));
        }

        let route = self
            .inner
            .routes
            .match_method(&method)
            .ok_or(GatewayError::Routing)?;
        tracing::Span::current()
            .record("cluster", &tracing::field::display(&route.cluster_id));

        let incoming_headers = request.metadata().clone().into_headers();
        let outgoing_headers = self
            .inner
            .header_chain
            .run(&method, incoming_headers)
            .map_err(GatewayError::Authentication)?;

        let retryable = self.inner.retryable_clusters.contains(&route.cluster_id);
        let inbound = request.into_inner();

        let (backend_tx, backend_response, resolved) = self
            .open_backend_stream(&method, &route, &outgoing_headers, retryable)
            .await?;
        let backend_metadata = backend_response.metadata().clone();
        let backend_stream = backend_response.into_inner();

        let (response_tx, response_rx) = mpsc::channel(FORWARD_CHANNEL_CAPACITY);
        let first_message = FirstMessageSlot::new();

        let call = ProxyCall {
            proxy: self.clone(),
            method,
            route,
            headers: outgoing_headers.clone(),
            retryable,
        };
        tokio::spawn(call.run(
            inbound,
            backend_tx,
            backend_stream,
            resolved,
            first_message,
            response_tx,
        ));

        let mut response = Response::new(ReceiverStream::new(response_rx));
        *response.metadata_mut() = backend_metadata;
        Ok(response)
    }

    /// Opens a backend stream per the opening protocol: for retryable (dynamic) clusters, up
    /// to `retry_count` dial+open attempts each guarded by a `retry_timeout` timer; for static
    /// clusters, a single attempt. Every failed attempt notifies the resolver before retrying.
    async fn open_backend_stream(
        &self,
        method: &str,
        route: &Route,
        headers: &http::HeaderMap,
        retryable: bool,
    ) -> Result<(mpsc::Sender<Bytes>, Response<Streaming<Bytes>>, Resolved), GatewayError> {
        let attempts = if retryable { self.inner.retry_count.max(1) } else { 1 };

        let mut last_error = GatewayError::BackendUnavailable("no attempts made".to_owned());
        for attempt in 0..attempts {
            let resolved = match self.inner.resolver.resolve(route, headers).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    last_error = err;
                    continue;
                }
            };

            match self
                .try_open_once(method, headers, resolved.channel.clone())
                .await
            {
                Ok((tx, response)) => return Ok((tx, response, resolved)),
                Err(err) => {
                    self.inner
                        .resolver
                        .on_failure(route, &resolved.sticky_key, &resolved.instance_id)
                        .await;
                    last_error = err;
                    if attempt > 0 {
                        metrics::increment_counter!(
                            "gateway_backend_retry_total",
                            "cluster" => route.cluster_id.clone(),
                        );
                    }
                    tracing::debug!(
                        method,
                        cluster = %route.cluster_id,
                        attempt,
                        "backend stream open attempt failed"
                    );
                }
            }
        }

        Err(last_error)
    }

    /// One dial+open attempt, bounded by `retry_timeout`. Returns the sender half of the
    /// request stream fed to the backend, and the backend's response stream.
    async fn try_open_once(
        &self,
        method: &str,
        headers: &http::HeaderMap,
        channel: tonic::transport::Channel,
    ) -> Result<(mpsc::Sender<Bytes>, Response<Streaming<Bytes>>), GatewayError> {
        let (tx, rx) = mpsc::channel::<Bytes>(FORWARD_CHANNEL_CAPACITY);
        let mut outbound = Request::new(ReceiverStream::new(rx));
        *outbound.metadata_mut() = MetadataMap::from_headers(headers.clone());

        let path = method
            .parse()
            .map_err(|_| GatewayError::Internal(format!("invalid method path: {method}")))?;

        let mut client = tonic::client::Grpc::new(channel);
        client
            .ready()
            .await
            .map_err(|err| GatewayError::BackendUnavailable(err.to_string()))?;

        match tokio::time::timeout(
            self.inner.retry_timeout,
            client.streaming(outbound, path, RawCodec),
        )
        .await
        {
            Ok(Ok(response)) => Ok((tx, response)),
            Ok(Err(status)) => Err(GatewayError::from(status)),
            Err(_elapsed) => Err(GatewayError::BackendUnavailable(
                "backend stream open timed out".to_owned(),
            )),
        }
    }
}

impl tower::Service<http::Request<hyper::Body>> for GatewayProxy {
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<hyper::Body>) -> Self::Future {
        let method = req.uri().path().to_owned();
        let handler = MethodHandler {
            proxy: self.clone(),
            method,
        };
        Box::pin(async move {
            let mut grpc = tonic::server::Grpc::new(RawCodec);
            Ok(grpc.streaming(handler, req).await)
        })
    }
}

/// Binds a captured method name to the shared [`GatewayProxy`] for a single incoming HTTP/2
/// request, since `tonic::server::Grpc::streaming` only gives the handler the already-decoded
/// message stream, not the original `:path`.
#[derive(Clone)]
struct MethodHandler {
    proxy: GatewayProxy,
    method: String,
}

impl tonic::server::StreamingService<Bytes> for MethodHandler {
    type Response = Bytes;
    type ResponseStream = ProxyResponseStream;
    type Future =
        Pin<Box<dyn Future<Output = Result<Response<Self::ResponseStream>, Status>> + Send>>;

    fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
        let proxy = self.proxy.clone();
        let method = self.method.clone();
        Box::pin(async move {
            proxy
                .handle(method, request)
                .await
                .map_err(GatewayError::into_status)
        })
    }
}

/// Per-call state once a first backend stream is open: owns the inbound client stream, the
/// current backend connection, and the bookkeeping needed to transfer to a different instance
/// on mid-stream failure.
struct ProxyCall {
    proxy: GatewayProxy,
    method: String,
    route: Route,
    /// Headers produced by the header chain for the original call. Reused on transfer so a
    /// sticky-session route resolves to the same sticky key it started with.
    headers: http::HeaderMap,
    retryable: bool,
}

/// Why one direction of forwarding stopped.
enum ForwardOutcome {
    /// The client finished sending (clean half-close). Only returned by the
    /// client-to-backend direction.
    InboundEof,
    /// The backend finished sending (clean half-close). Only returned by the
    /// backend-to-client direction.
    BackendEof,
    /// The client disconnected (its response receiver was dropped).
    ClientGone,
    Failure(GatewayError),
}

impl ProxyCall {
    async fn run(
        self,
        inbound: Streaming<Bytes>,
        backend_tx: mpsc::Sender<Bytes>,
        backend_stream: Streaming<Bytes>,
        resolved: Resolved,
        first_message: FirstMessageSlot,
        response_tx: mpsc::Sender<Result<Bytes, Status>>,
    ) {
        let mut inbound = inbound;
        let mut backend_tx = backend_tx;
        let mut backend_stream = backend_stream;
        let mut resolved = resolved;
        let mut transfers_used: u32 = 0;

        loop {
            let outcome = Self::run_forwarders(
                &mut inbound,
                backend_tx,
                backend_stream,
                first_message.clone(),
                response_tx.clone(),
            )
            .await;

            match outcome {
                ForwardOutcome::BackendEof | ForwardOutcome::ClientGone => return,
                ForwardOutcome::InboundEof => {
                    unreachable!("run_forwarders never returns InboundEof directly")
                }
                ForwardOutcome::Failure(err) => {
                    tracing::warn!(
                        method = %self.method,
                        cluster = %self.route.cluster_id,
                        instance_id = %resolved.instance_id,
                        sticky_key = %resolved.sticky_key,
                        %err,
                        "backend stream failed mid-call"
                    );
                    self.proxy
                        .inner
                        .resolver
                        .on_failure(&self.route, &resolved.sticky_key, &resolved.instance_id)
                        .await;

                    let replay = first_message.get();
                    let budget_remains = transfers_used < self.proxy.inner.retry_count;
                    if self.retryable && replay.is_some() && budget_remains && !response_tx.is_closed()
                    {
                        transfers_used += 1;
                        match self.transfer(replay.unwrap()).await {
                            Ok((new_tx, new_stream, new_resolved)) => {
                                tracing::info!(
                                    method = %self.method,
                                    cluster = %self.route.cluster_id,
                                    from_instance = %resolved.instance_id,
                                    to_instance = %new_resolved.instance_id,
                                    "transferred stream to a new instance"
                                );
                                backend_tx = new_tx;
                                backend_stream = new_stream;
                                resolved = new_resolved;
                                continue;
                            }
                            Err(transfer_err) => {
                                let _ = response_tx.send(Err(transfer_err.into_status())).await;
                                return;
                            }
                        }
                    }

                    let _ = response_tx.send(Err(err.into_status())).await;
                    return;
                }
            }
        }
    }

    /// Opens a new backend stream on (typically) a different instance and replays the
    /// captured first client message into it, closing send immediately after since a
    /// transferred call is always a retry of a call that had sent exactly one message so far.
    async fn transfer(
        &self,
        first_message: Bytes,
    ) -> Result<(mpsc::Sender<Bytes>, Streaming<Bytes>, Resolved), GatewayError> {
        let (tx, response, resolved) = self
            .proxy
            .open_backend_stream(&self.method, &self.route, &self.headers, self.retryable)
            .await?;
        metrics::increment_counter!(
            "gateway_stream_transfer_total",
            "cluster" => self.route.cluster_id.clone(),
        );
        // The opening attempt already created its own request stream; replay onto that one.
        let _ = tx.send(first_message).await;
        Ok((tx, response.into_inner(), resolved))
    }

    /// Runs both forwarding directions concurrently and reports why the pair stopped. A clean
    /// client half-close does not stop the pair: this function keeps waiting for the backend
    /// side (close-send has already happened because `backend_tx` was dropped inside the
    /// finished client-to-backend task).
    async fn run_forwarders(
        inbound: &mut Streaming<Bytes>,
        backend_tx: mpsc::Sender<Bytes>,
        mut backend_stream: Streaming<Bytes>,
        first_message: FirstMessageSlot,
        response_tx: mpsc::Sender<Result<Bytes, Status>>,
    ) -> ForwardOutcome {
        let client_to_backend = forward_client_to_backend(inbound, backend_tx, first_message);
        let backend_to_client = forward_backend_to_client(&mut backend_stream, response_tx);
        tokio::pin!(client_to_backend);
        tokio::pin!(backend_to_client);

        tokio::select! {
            outcome = &mut client_to_backend => {
                match outcome {
                    ForwardOutcome::InboundEof => backend_to_client.await,
                    other => other,
                }
            }
            outcome = &mut backend_to_client => outcome,
        }
    }
}

/// Client -> backend: reads opaque messages from the inbound stream and forwards them to the
/// backend's request channel, cloning the first one into `first_message` for possible replay.
async fn forward_client_to_backend(
    inbound: &mut Streaming<Bytes>,
    backend_tx: mpsc::Sender<Bytes>,
    first_message: FirstMessageSlot,
) -> ForwardOutcome {
    loop {
        match inbound.next().await {
            None => return ForwardOutcome::InboundEof,
            Some(Err(status)) => return ForwardOutcome::Failure(status.into()),
            Some(Ok(message)) => {
                first_message.set_if_empty(message.clone());
                if backend_tx.send(message).await.is_err() {
                    return ForwardOutcome::Failure(GatewayError::BackendUnavailable(
                        "backend request stream closed".to_owned(),
                    ));
                }
            }
        }
    }
    // `backend_tx` drops here, which is this call's close-send on the backend stream.
}

/// Backend -> client: reads opaque messages from the backend's response stream and forwards
/// them to the client's response channel. On a clean backend EOF, the backend's trailer
/// snapshot is copied onto the client stream as a final trailers-only frame before the
/// response channel closes.
async fn forward_backend_to_client(
    backend_stream: &mut Streaming<Bytes>,
    response_tx: mpsc::Sender<Result<Bytes, Status>>,
) -> ForwardOutcome {
    loop {
        match backend_stream.next().await {
            None => {
                if let Ok(Some(trailers)) = backend_stream.trailers().await {
                    if !trailers.is_empty() {
                        let mut status = Status::ok("");
                        *status.metadata_mut() = trailers;
                        let _ = response_tx.send(Err(status)).await;
                    }
                }
                return ForwardOutcome::BackendEof;
            }
            Some(Err(status)) => return ForwardOutcome::Failure(status.into()),
            Some(Ok(message)) => {
                if response_tx.send(Ok(message)).await.is_err() {
                    return ForwardOutcome::ClientGone;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_message_slot_is_reused_across_transfer_boundary() {
        // Exercises the same slot type the forwarder uses; full transfer behavior is covered
        // by `gateway-server`'s integration tests, which can actually run two backends.
        let slot = FirstMessageSlot::new();
        slot.set_if_empty(Bytes::from_static(b"echo request"));
        assert_eq!(slot.get().unwrap(), Bytes::from_static(b"echo request"));
    }
}
