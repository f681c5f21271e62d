// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Shared test infrastructure: a pass-through codec (mirroring `gateway::proxy`'s private
//! `RawCodec`, duplicated here since it isn't part of the crate's public surface), a minimal
//! echoing backend, and a helper to serve any raw `tower::Service` over loopback HTTP/2 —
//! the same shape `gateway-server`'s own `main` uses to serve a `GatewayProxy`.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, Bytes};
use futures::StreamExt;
use hyper::server::conn::AddrIncoming;
use hyper::service::{make_service_fn, service_fn};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::body::BoxBody;
use tonic::codec::{DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::{Request, Response, Status, Streaming};
use tower::Service;

#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl tonic::codec::Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = BytesCodec;
    type Decoder = BytesCodec;

    fn encoder(&mut self) -> Self::Encoder {
        BytesCodec
    }

    fn decoder(&mut self) -> Self::Decoder {
        BytesCodec
    }
}

impl Encoder for BytesCodec {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        dst.put_slice(&item);
        Ok(())
    }
}

impl Decoder for BytesCodec {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Bytes>, Status> {
        if !src.has_remaining() {
            return Ok(None);
        }
        let len = src.remaining();
        Ok(Some(src.copy_to_bytes(len)))
    }
}

/// Binds `service` to a loopback port and serves it over HTTP/2, forever, in a background
/// task. Returns the address clients should dial.
pub async fn serve<S>(service: S) -> SocketAddr
where
    S: Service<http::Request<hyper::Body>, Response = http::Response<BoxBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    let incoming = AddrIncoming::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = incoming.local_addr();

    let make_service = make_service_fn(move |_conn| {
        let service = service.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let mut service = service.clone();
                async move { service.call(req).await }
            }))
        }
    });

    tokio::spawn(async move {
        let _ = hyper::Server::builder(incoming)
            .http2_only(true)
            .serve(make_service)
            .await;
    });

    addr
}

#[derive(Clone)]
struct EchoHandler;

impl tonic::server::StreamingService<Bytes> for EchoHandler {
    type Response = Bytes;
    type ResponseStream = ReceiverStream<Result<Bytes, Status>>;
    type Future =
        Pin<Box<dyn Future<Output = Result<Response<Self::ResponseStream>, Status>> + Send>>;

    fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
        Box::pin(async move {
            let mut inbound = request.into_inner();
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                while let Some(item) = inbound.next().await {
                    match item {
                        Ok(message) => {
                            if tx.send(Ok(message)).await.is_err() {
                                return;
                            }
                        }
                        Err(status) => {
                            let _ = tx.send(Err(status)).await;
                            return;
                        }
                    }
                }
            });
            Ok(Response::new(ReceiverStream::new(rx)))
        })
    }
}

#[derive(Clone)]
struct EchoBackend;

impl Service<http::Request<hyper::Body>> for EchoBackend {
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<hyper::Body>) -> Self::Future {
        Box::pin(async move {
            let mut grpc = tonic::server::Grpc::new(BytesCodec);
            Ok(grpc.streaming(EchoHandler, req).await)
        })
    }
}

/// Spawns a backend that echoes every inbound message back out, in declaration order, closing
/// its response stream once the client closes its request stream.
pub async fn spawn_echo_backend() -> SocketAddr {
    serve(EchoBackend).await
}

#[derive(Clone)]
struct TrailingEchoHandler;

impl tonic::server::StreamingService<Bytes> for TrailingEchoHandler {
    type Response = Bytes;
    type ResponseStream = ReceiverStream<Result<Bytes, Status>>;
    type Future =
        Pin<Box<dyn Future<Output = Result<Response<Self::ResponseStream>, Status>> + Send>>;

    fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
        Box::pin(async move {
            let mut inbound = request.into_inner();
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                while let Some(item) = inbound.next().await {
                    match item {
                        Ok(message) => {
                            if tx.send(Ok(message)).await.is_err() {
                                return;
                            }
                        }
                        Err(status) => {
                            let _ = tx.send(Err(status)).await;
                            return;
                        }
                    }
                }
                let mut trailers_only = Status::ok("");
                trailers_only
                    .metadata_mut()
                    .insert("x-pod-name", "pod-1".parse().unwrap());
                let _ = tx.send(Err(trailers_only)).await;
            });
            Ok(Response::new(ReceiverStream::new(rx)))
        })
    }
}

#[derive(Clone)]
struct TrailingEchoBackend;

impl Service<http::Request<hyper::Body>> for TrailingEchoBackend {
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<hyper::Body>) -> Self::Future {
        Box::pin(async move {
            let mut grpc = tonic::server::Grpc::new(BytesCodec);
            Ok(grpc.streaming(TrailingEchoHandler, req).await)
        })
    }
}

/// Spawns a backend that echoes every inbound message back out, then closes with a custom
/// `x-pod-name` trailer, so tests can assert the gateway propagates backend trailers to the
/// client on clean EOF.
pub async fn spawn_trailing_echo_backend() -> SocketAddr {
    serve(TrailingEchoBackend).await
}

/// Spawns a minimal discovery registry that always answers `GET /v1/instances` with the given
/// JSON body, enough to exercise `DiscoveryClient` + `ConnectionPool` against a real HTTP
/// server rather than a stub.
pub async fn spawn_discovery_server(instances_json: String) -> SocketAddr {
    let incoming = AddrIncoming::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = incoming.local_addr();

    let make_service = make_service_fn(move |_conn| {
        let body = instances_json.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |_req: http::Request<hyper::Body>| {
                let body = body.clone();
                async move {
                    Ok::<_, Infallible>(
                        http::Response::builder()
                            .status(200)
                            .body(hyper::Body::from(body))
                            .unwrap(),
                    )
                }
            }))
        }
    });

    tokio::spawn(async move {
        let _ = hyper::Server::builder(incoming).serve(make_service).await;
    });

    addr
}
