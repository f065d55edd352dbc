//! Tracing subscriber setup for binaries and tests embedding this crate.

use tracing_subscriber::EnvFilter;

/// Filter directives, e.g. `launch_sandbox=debug`. Falls back to `RUST_LOG`.
pub const LOG_ENV: &str = "LAUNCH_SANDBOX_LOG";
/// `json` switches to one JSON object per line.
pub const LOG_FORMAT_ENV: &str = "LAUNCH_SANDBOX_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var(LOG_FORMAT_ENV) {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber using the format chosen by the environment.
pub fn init() -> anyhow::Result<()> {
    init_with(LogFormat::from_env())
}

pub fn init_with(format: LogFormat) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_target(true);

    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error() {
        // Either this call installs the subscriber or another test already did.
        let _ = init_with(LogFormat::Pretty);
        assert!(init_with(LogFormat::Json).is_err());
    }
}
