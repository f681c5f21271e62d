// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use http::HeaderMap;
use tonic::Status;

use crate::auth::TimeProvider;
use crate::auth::TokenVerifier;
use crate::routing::{AuthorizationMode, Route};

/// One step of the header processor chain. Each processor receives the output of the
/// previous and must not mutate its input in place — it works on (and returns) a defensive
/// copy.
pub trait HeaderProcessor: Send + Sync {
    fn process(&self, method: &str, headers: HeaderMap) -> Result<HeaderMap, Status>;
}

/// Runs a sequence of processors in order. Aborts and returns the first error encountered.
pub struct HeaderChain {
    processors: Vec<Box<dyn HeaderProcessor>>,
}

impl HeaderChain {
    pub fn new(processors: Vec<Box<dyn HeaderProcessor>>) -> Self {
        HeaderChain { processors }
    }

    pub fn run(&self, method: &str, headers: HeaderMap) -> Result<HeaderMap, Status> {
        let mut current = headers;
        for processor in &self.processors {
            current = processor.process(method, current)?;
        }
        Ok(current)
    }
}

/// A (prefix, mode) authorization rule extracted from the route table, sorted by prefix
/// length descending so the longest match wins, matching the route matcher's own policy.
struct AuthRule {
    prefix: String,
    mode: AuthorizationMode,
}

/// The only production header processor: per-route authentication.
pub struct AuthenticationProcessor {
    rules: Vec<AuthRule>,
    verifier: TokenVerifier,
    time: Box<dyn TimeProvider>,
}

impl AuthenticationProcessor {
    pub fn new(routes: &[Route], verifier: TokenVerifier, time: Box<dyn TimeProvider>) -> Self {
        let mut rules = routes
            .iter()
            .map(|r| AuthRule {
                prefix: r.prefix.clone(),
                mode: r.authorization,
            })
            .collect::<Vec<_>>();
        rules.sort_by_key(|r| std::cmp::Reverse(r.prefix.len()));

        AuthenticationProcessor {
            rules,
            verifier,
            time,
        }
    }

    fn mode_for(&self, method: &str) -> AuthorizationMode {
        self.rules
            .iter()
            .find(|r| method.starts_with(&r.prefix))
            .map(|r| r.mode)
            .unwrap_or(AuthorizationMode::None)
    }
}

fn get_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

impl HeaderProcessor for AuthenticationProcessor {
    fn process(&self, method: &str, headers: HeaderMap) -> Result<HeaderMap, Status> {
        if self.mode_for(method) == AuthorizationMode::None {
            return Ok(headers);
        }

        let session_id = get_header(&headers, "session-id")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Status::unauthenticated("missing session-id"))?;

        let token = get_header(&headers, "authorization")
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Status::unauthenticated("missing or invalid token"))?;

        self.verifier
            .verify_session(token, session_id, self.time.as_ref())
            .map_err(|_| Status::unauthenticated("missing or invalid token"))?;

        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{FixedTimeProvider, TokenClaims};
    use crate::routing::{Balancer, BalancerType};
    use chrono::{Duration, Utc};
    use http::HeaderValue;

    fn route(prefix: &str, mode: AuthorizationMode) -> Route {
        Route {
            prefix: prefix.to_owned(),
            cluster_id: "cluster-a".to_owned(),
            authorization: mode,
            balancer: Balancer {
                balancer_type: BalancerType::RoundRobin,
                sticky_header_name: String::new(),
            },
        }
    }

    fn processor() -> AuthenticationProcessor {
        AuthenticationProcessor::new(
            &[route("/worker.v1.Worker/Echo", AuthorizationMode::Required)],
            TokenVerifier::new("shared-secret"),
            Box::new(FixedTimeProvider(Utc::now())),
        )
    }

    fn valid_token(verifier: &TokenVerifier) -> String {
        verifier
            .create(&TokenClaims {
                login: "TestUser".to_owned(),
                role: "admin".to_owned(),
                session_id: "S1".to_owned(),
                expires_at: Utc::now() + Duration::hours(1),
                issued_at: Utc::now(),
            })
            .unwrap()
    }

    #[test]
    fn no_metadata_reports_missing_session_id() {
        let processor = processor();
        let err = processor
            .process("/worker.v1.Worker/Echo", HeaderMap::new())
            .unwrap_err();
        assert_eq!(err.message(), "missing session-id");
    }

    #[test]
    fn session_id_only_reports_missing_token() {
        let processor = processor();
        let mut headers = HeaderMap::new();
        headers.insert("session-id", HeaderValue::from_static("S1"));
        let err = processor.process("/worker.v1.Worker/Echo", headers).unwrap_err();
        assert_eq!(err.message(), "missing or invalid token");
    }

    #[test]
    fn authorization_only_reports_missing_session_id() {
        let processor = processor();
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("sometoken"));
        let err = processor.process("/worker.v1.Worker/Echo", headers).unwrap_err();
        assert_eq!(err.message(), "missing session-id");
    }

    #[test]
    fn valid_token_and_session_pass_through() {
        let verifier = TokenVerifier::new("shared-secret");
        let processor = AuthenticationProcessor::new(
            &[route("/worker.v1.Worker/Echo", AuthorizationMode::Required)],
            verifier.clone(),
            Box::new(FixedTimeProvider(Utc::now())),
        );
        let token = valid_token(&verifier);

        let mut headers = HeaderMap::new();
        headers.insert("session-id", HeaderValue::from_static("S1"));
        headers.insert("authorization", HeaderValue::from_str(&token).unwrap());

        let result = processor.process("/worker.v1.Worker/Echo", headers);
        assert!(result.is_ok());
    }

    #[test]
    fn unauthenticated_route_passes_through_without_metadata() {
        let processor = processor();
        let result = processor.process("/other.Service/Method", HeaderMap::new());
        assert!(result.is_ok());
    }
}
