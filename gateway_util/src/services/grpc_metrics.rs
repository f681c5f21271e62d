// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use http_body::SizeHint;
use hyper::body::HttpBody;
use hyper::header::HeaderValue;
use hyper::{Body, HeaderMap, Request as HyperRequest, Response as HyperResponse};
use metrics::{histogram, increment_counter};
use pin_project::{pin_project, pinned_drop};
use tonic::body::BoxBody;
use tower::{Service, ServiceExt};

const GRPC_STATUS_HEADER_CODE: &str = "grpc-status";

/// Callbacks for RPC events.
pub trait GrpcMetricReporter {
    /// Called at the start of an RPC.
    fn report_rpc_start(&self, grpc_method: &str);

    /// Called upon completion of an RPC.
    fn report_rpc_complete(&self, grpc_method: &str, code: &'static str, elapsed: Duration);
}

/// Logs RPC start and end as time-series metrics. The counters are named after
/// the equivalent counters in
/// https://github.com/grpc-ecosystem/go-grpc-prometheus/blob/master/server_metrics.go.
#[derive(Clone, Default)]
pub struct DefaultGrpcMetricsReporter;

impl GrpcMetricReporter for DefaultGrpcMetricsReporter {
    fn report_rpc_start(&self, grpc_method: &str) {
        increment_counter!(
            "grpc_server_started_total",
            "grpc_method" => grpc_method.to_owned(),
        );
    }

    fn report_rpc_complete(&self, grpc_method: &str, code: &'static str, elapsed: Duration) {
        histogram!(
            "grpc_server_handling_seconds",
            elapsed,
            "grpc_method" => grpc_method.to_owned(),
        );

        increment_counter!(
            "grpc_server_handled_total",
            "grpc_method" => grpc_method.to_owned(),
            "grpc_code" => code,
        );
    }
}

/// A `tower::Service` that reports the start and end of RPCs passing through it to an
/// underlying gRPC service. An associated "reporter" receives the events.
///
/// Unlike a metrics layer built for a fixed, known set of codegen'd services, this one does not
/// require `S: NamedService` — it reads `service/method` directly off the request path, which is
/// what lets it sit in front of a handler that accepts every method name.
#[derive(Debug, Clone)]
pub struct GrpcMetrics<S, R> {
    inner: S,
    reporter: R,
}

impl<S> GrpcMetrics<S, DefaultGrpcMetricsReporter> {
    pub fn new(service: S) -> Self {
        Self::with_reporter(service, DefaultGrpcMetricsReporter)
    }
}

impl<S, R> GrpcMetrics<S, R> {
    pub fn with_reporter(service: S, reporter: R) -> Self {
        GrpcMetrics {
            inner: service,
            reporter,
        }
    }
}

impl<S, R> Service<HyperRequest<Body>> for GrpcMetrics<S, R>
where
    S: Service<HyperRequest<Body>, Response = HyperResponse<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    R: GrpcMetricReporter + Send + Sync + Clone + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: HyperRequest<Body>) -> Self::Future {
        let svc = self.inner.clone();
        let reporter = self.reporter.clone();

        Box::pin(async move {
            // The path is `/package.Service/Method`; keep the leading slash off so logs read
            // the same way the wire error dictionary spells method names.
            let grpc_method = request.uri().path().trim_start_matches('/').to_owned();

            reporter.report_rpc_start(&grpc_method);

            let start_time = Instant::now();

            let grpc_method2 = grpc_method.clone();
            let reporter2 = reporter.clone();
            let mut svc = svc.map_response(move |r| {
                let (parts, body) = r.into_parts();
                HyperResponse::from_parts(
                    parts,
                    BoxBody::new(OutboundBody::new(
                        body,
                        grpc_method2,
                        start_time,
                        reporter2,
                    )),
                )
            });

            // Call the underlying service.
            let response = match svc.call(request).await {
                Ok(response) => {
                    if let Some(hv) = response.headers().get(GRPC_STATUS_HEADER_CODE) {
                        let code = parse_status_code(hv);
                        let call_duration = start_time.elapsed();
                        reporter.report_rpc_complete(&grpc_method, code, call_duration);
                    }
                    response
                }
                Err(_) => {
                    tracing::debug!("illegal state - service should have only returned a response");
                    let mut response = HyperResponse::new(tonic::body::empty_body());
                    *response.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;

                    let call_duration = start_time.elapsed();
                    reporter.report_rpc_complete(&grpc_method, "Internal", call_duration);

                    return Ok(response);
                }
            };

            Ok(response)
        })
    }
}

/// Wraps the response BoxBody so that GrpcMetrics may monitor for completion.
#[pin_project(PinnedDrop)]
struct OutboundBody<R: GrpcMetricReporter> {
    #[pin]
    inner: BoxBody,
    grpc_method: String,
    start_time: Instant,
    reporter: R,
    complete: bool,
}

impl<R: GrpcMetricReporter> OutboundBody<R> {
    pub fn new(inner: BoxBody, grpc_method: String, start_time: Instant, reporter: R) -> Self {
        OutboundBody {
            inner,
            grpc_method,
            start_time,
            reporter,
            complete: false,
        }
    }
}

impl<R> HttpBody for OutboundBody<R>
where
    R: GrpcMetricReporter + Clone,
{
    type Data = <BoxBody as HttpBody>::Data;
    type Error = <BoxBody as HttpBody>::Error;

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }

    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        let this = self.project();
        this.inner.poll_data(cx)
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap<HeaderValue>>, Self::Error>> {
        let this = self.project();

        let trailers_opt = match futures::ready!(this.inner.poll_trailers(cx)) {
            Ok(t) => t,
            Err(err) => return Poll::Ready(Err(err)),
        };

        let code_opt = trailers_opt
            .as_ref()
            .and_then(|t| t.get(GRPC_STATUS_HEADER_CODE))
            .map(parse_status_code);
        if let Some(code) = code_opt {
            let call_duration = this.start_time.elapsed();
            *this.complete = true;
            this.reporter
                .report_rpc_complete(this.grpc_method, code, call_duration);
        }

        Poll::Ready(Ok(trailers_opt))
    }
}

#[pinned_drop]
impl<R: GrpcMetricReporter> PinnedDrop for OutboundBody<R> {
    fn drop(self: Pin<&mut Self>) {
        if !self.complete {
            let call_duration = self.start_time.elapsed();
            self.reporter
                .report_rpc_complete(&self.grpc_method, "Canceled", call_duration);
        }
    }
}

pub fn convert_status_code(code: u16) -> &'static str {
    match code {
        0 => "OK",
        1 => "Canceled",
        2 => "Unknown",
        3 => "InvalidArgument",
        4 => "DeadlineExceeded",
        5 => "NotFound",
        6 => "AlreadyExists",
        7 => "PermissionDenied",
        8 => "ResourceExhausted",
        9 => "FailedPrecondition",
        10 => "Aborted",
        11 => "OutOfRange",
        12 => "Unimplemented",
        13 => "Internal",
        14 => "Unavailable",
        15 => "DataLoss",
        16 => "Unauthenticated",
        _ => "--INVALID--",
    }
}

/// Parse the gRPC status from headers.
/// Note: This should be replaced with the Tonic version once it is made public:
/// https://github.com/hyperium/tonic/blob/61555ff2b5b76e4e3172717354aed1e6f31d6611/tonic/src/status.rs#L383.
fn parse_status_code(value: &HeaderValue) -> &'static str {
    let value_as_str: Result<&str, _> = value.to_str().map_err(|_| "--INVALID--");
    value_as_str
        .and_then(|x| {
            x.parse::<u16>()
                .map(convert_status_code)
                .map_err(|_| "--INVALID--")
        })
        .unwrap_or("--INVALID--")
}
