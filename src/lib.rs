#![forbid(unsafe_code)]

//! Mirrors creators' recent videos into local storage and publishes one RSS
//! feed per creator pointing at the mirrored copies.

pub mod batch;
pub mod cli;
pub mod config;
pub mod feed;
pub mod layout;
pub mod mirror;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod resolve;
pub mod thumbnail;
pub mod upstream;

#[cfg(test)]
mod test_support;

/// Console logging for the binaries. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
