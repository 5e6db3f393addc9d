use tracing_subscriber::EnvFilter;

use crate::settings::{LogFormat, Settings};

/// Install the global subscriber honouring `LOG_LEVEL` and `LOG_FORMAT`.
pub fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_new(&settings.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    match settings.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
