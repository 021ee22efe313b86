/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Create a default subscriber logging messages to `stdout` and respecting the `RUST_LOG`
/// environment variable.
///
/// If the environment variable is not set - then the "info" level will be used.
pub fn init_subscriber() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(true))
        .init();
}

/// Create a subscriber for tests.
///
/// The returned guard installs the subscriber for the current thread only, so concurrent
/// tests do not conflict.
pub fn init_test_subscriber() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(true).with_test_writer())
        .set_default()
}
