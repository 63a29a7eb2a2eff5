use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter directive for `-v` counts, falling back to the configured level.
pub fn level_for(verbose: u8, log_level: &str) -> String {
    match verbose {
        0 => log_level.to_ascii_lowercase(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Installs the logfmt subscriber on stderr. `RUST_LOG` wins when set.
pub fn init_logging(verbose: u8, log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(verbose, log_level)));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_logfmt::builder().layer().with_writer(std::io::stderr))
        .try_init();
}
