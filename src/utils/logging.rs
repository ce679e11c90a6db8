use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
///
/// Output goes to stderr so response bodies printed on stdout stay pipeable.
pub fn init(default_level: &str) {
    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
