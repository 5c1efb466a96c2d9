use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILTER_ENV: &str = "INGEST_LOG";

fn default_filter(verbose: bool) -> &'static str {
    if verbose { "jsaingest=debug,info" } else { "info" }
}

/// Install the global subscriber. Logs go to stderr so stdout only ever
/// carries the command report.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}
