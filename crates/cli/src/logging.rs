//! Tracing + log integration.
//!
//! stdout is the MCP channel, so everything human-readable goes to stderr.
//! `RUST_LOG` wins over the config file's `logging.level`.

use tracing_log::LogTracer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

pub fn init(config_level: Option<&str>) {
    if LogTracer::init().is_err() {
        // Already initialized (tests); keep the existing setup.
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config_level.unwrap_or("info")));
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    let subscriber = Registry::default().with(filter).with(fmt_layer);
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("clip: tracing subscriber was already set");
    }
}
