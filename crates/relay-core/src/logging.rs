use tracing_subscriber::{fmt, EnvFilter};

use crate::{config::LogFormat, errors::Error, Result};

/// Initialize tracing for the relay.
///
/// `RUST_LOG` wins when set; otherwise `level` applies to the relay crates and
/// everything else stays at `warn`.
pub fn init(service_name: &str, level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let crate_name = service_name.replace('-', "_");
        EnvFilter::new(format!(
            "warn,{crate_name}={level},relay_core={level},relay_telegram={level},\
             relay_deepseek={level},relay_twitter={level}"
        ))
    });

    let builder = fmt().with_env_filter(filter).with_target(false);
    let installed = match format {
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
        LogFormat::Text => builder.with_ansi(true).try_init(),
    };

    installed.map_err(|e| Error::Config(format!("failed to initialize logging: {e}")))
}
