// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

pub mod auth;
pub mod config;
pub mod discovery;
pub mod error;
pub mod headers;
pub mod pool;
pub mod proxy;
pub mod resolver;
pub mod routing;

pub use auth::{SystemTimeProvider, TimeProvider, TokenClaims, TokenVerifier};
pub use config::Config;
pub use discovery::{DiscoveryClient, ServiceInstance};
pub use error::GatewayError;
pub use proxy::GatewayProxy;
pub use resolver::ConnectionResolver;
pub use routing::{AuthorizationMode, BalancerType, Route, RouteConfig, RouteMatcher};
