//! Tracing subscriber setup for binaries, demos and tests

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install a formatted subscriber filtered by `RUST_LOG`, or by
/// `default_filter` when `RUST_LOG` is unset
///
/// Safe to call more than once. If another global subscriber is already
/// installed it is left in place.
pub fn init_tracing(default_filter: &str) {
    TRACING_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));

        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true),
        );

        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already set; keeping it");
        }
    });
}
