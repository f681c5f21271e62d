// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use tracing_subscriber::filter::targets::Targets;
use tracing_subscriber::prelude::*;

/// Configure structured logging for a binary.
///
/// `service_name` is attached to every event so that logs from multiple gateway processes can
/// be told apart once aggregated.
pub fn setup_logging(service_name: &'static str) {
    let filter_layer = {
        let directive = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_owned());
        directive
            .parse::<Targets>()
            .expect("Failed to parse RUST_LOG")
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_filter(filter_layer);

    tracing_subscriber::registry().with(fmt_layer).init();

    tracing::info!(service_name, "logging initialized");
}
