// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use tonic::{Code, Status};

/// Internal error taxonomy for every operation the gateway performs on the request path.
///
/// A single [`Status`]-producing function (see [`GatewayError::into_status`]) is the only
/// place that translates these into the wire-level statuses clients observe.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The incoming method did not match any configured route and the default action was
    /// `error`.
    #[error("method not routed")]
    Routing,

    /// A header processor rejected the call. Already carries the exact wire status to return.
    #[error("authentication failed: {0}")]
    Authentication(Status),

    /// No instance could be acquired: either none are healthy, or (for sticky selection)
    /// every instance is already bound to a different key.
    #[error("no capacity available")]
    NoCapacity,

    /// Dial failure, transport error, a closed pool, or a reference to an unknown cluster.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A non-`Unknown` status returned by the backend itself, to be preserved verbatim
    /// (except `Unavailable`, which the mapper normalizes).
    #[error("backend returned {0}")]
    BackendApplication(Status),

    /// Programmer errors / conditions that should be unreachable given a well-formed request:
    /// a missing method context, or a failed clone of the replay message.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Wire error dictionary from the gateway's external interface contract. Messages are
    /// asserted verbatim by integration tests, so they must never be reworded here.
    pub fn into_status(self) -> Status {
        match self {
            GatewayError::Routing => Status::unimplemented("method not routed"),
            GatewayError::Authentication(status) => status,
            GatewayError::NoCapacity => {
                Status::resource_exhausted("all instances are busy")
            }
            GatewayError::BackendUnavailable(_) => {
                Status::unavailable("backend service unavailable")
            }
            GatewayError::BackendApplication(status) => {
                if status.code() == Code::Unavailable {
                    Status::unavailable("backend service unavailable")
                } else {
                    status
                }
            }
            GatewayError::Internal(_) => Status::unavailable("backend service unavailable"),
        }
    }

    /// True for cluster-level dial/transport failures that should trigger the resolver's
    /// `on-failure` bookkeeping and, for retryable clusters, a transfer attempt.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::NoCapacity | GatewayError::BackendUnavailable(_)
        )
    }
}

impl From<Status> for GatewayError {
    /// Any status surfaced directly from a backend call that is not itself one of the
    /// gateway's sentinel conditions is treated as a backend application error, to be
    /// preserved verbatim by the mapper (modulo `Unavailable` normalization).
    fn from(status: Status) -> Self {
        GatewayError::BackendApplication(status)
    }
}

#[cfg(test)]
mod tests {
    use super::GatewayError;
    use tonic::{Code, Status};

    #[test]
    fn maps_sentinels_to_exact_wire_messages() {
        assert_eq!(
            GatewayError::Routing.into_status().message(),
            "method not routed"
        );
        assert_eq!(GatewayError::Routing.into_status().code(), Code::Unimplemented);

        assert_eq!(
            GatewayError::NoCapacity.into_status().message(),
            "all instances are busy"
        );
        assert_eq!(
            GatewayError::NoCapacity.into_status().code(),
            Code::ResourceExhausted
        );

        assert_eq!(
            GatewayError::BackendUnavailable("dial failed".to_owned())
                .into_status()
                .message(),
            "backend service unavailable"
        );
    }

    #[test]
    fn preserves_non_unavailable_backend_statuses() {
        let status = Status::permission_denied("Server session is not set");
        let mapped = GatewayError::BackendApplication(status.clone()).into_status();
        assert_eq!(mapped.code(), status.code());
        assert_eq!(mapped.message(), status.message());
    }

    #[test]
    fn normalizes_backend_unavailable() {
        let mapped =
            GatewayError::BackendApplication(Status::unavailable("connection reset")).into_status();
        assert_eq!(mapped.code(), Code::Unavailable);
        assert_eq!(mapped.message(), "backend service unavailable");
    }
}
