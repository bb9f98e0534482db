//! Tracing initialization. Level comes from the persisted agent info
//! (fleet-settable) with `RUST_LOG`/`WARDEN_LOG_LEVEL` as overrides.

use tracing_subscriber::{fmt, EnvFilter};

pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            std::env::var("WARDEN_LOG_LEVEL")
                .map_err(anyhow::Error::from)
                .and_then(|l| EnvFilter::try_new(l).map_err(anyhow::Error::from))
        })
        .unwrap_or_else(|_| EnvFilter::new(normalize_level(default_level)));

    let to_stderr = std::env::var("WARDEN_LOG_TO_STDERR")
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(true);

    if to_stderr {
        let _ = fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }

    if std::env::var("ELASTIC_APM_SERVER_URL").map_or(false, |v| !v.is_empty()) {
        // APM export is not wired yet; spans stay in the local
        // subscriber so enabling the env vars is not silently ignored.
        tracing::warn!(
            "ELASTIC_APM_SERVER_URL is set but APM export is not implemented; using plain tracing"
        );
    } else {
        tracing::debug!("APM instrumentation disabled");
    }
}

/// Fleet log levels map onto tracing directives; `warning` is the one
/// name the two vocabularies disagree on.
pub fn normalize_level(level: &str) -> &str {
    match level {
        "warning" => "warn",
        "" => "info",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_maps_to_warn() {
        assert_eq!(normalize_level("warning"), "warn");
        assert_eq!(normalize_level("debug"), "debug");
        assert_eq!(normalize_level(""), "info");
    }
}
