//! Distributed tracing integration for observability and debugging.
//!
//! This module provides tracing setup for Ika applications using the
//! `tracing` ecosystem. It configures structured logging with file names,
//! line numbers, log levels, and span events, which is usually all a cache
//! or RPC node wants before wiring in its own subscriber stack.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    Layer, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Initializes the global tracing subscriber with formatted output.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_file(true)
                .with_line_number(true)
                .with_level(true)
                .with_filter(LevelFilter::DEBUG),
        )
        .init();
}
