use std::str::FromStr;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const QUIET_MODULES: &str = "h2=info,hyper=info,hyper_util=info,reqwest=info,alloy_transport_http=info,alloy_rpc_client=info,sqlx=warn";

/// Filter directives for a log level; a bare level gets quiet defaults for the transport crates.
fn filter_spec(log_level: &str) -> String {
    let normalized = log_level.trim();
    if normalized.contains(',') || normalized.contains('=') {
        normalized.to_string()
    } else {
        format!("{normalized},{QUIET_MODULES}")
    }
}

pub fn setup_logging(log_level: &str, json_format: bool, worker: &str) {
    let spec = filter_spec(log_level);
    let filter = EnvFilter::from_str(&spec).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(filter);

    if json_format {
        let json_layer = fmt::layer().json().with_target(false).with_current_span(false);
        subscriber.with(json_layer).init();
    } else {
        let fmt_layer = fmt::layer().with_target(true).compact();
        subscriber.with(fmt_layer).init();
    }

    tracing::info!(
        worker,
        format = if json_format { "json" } else { "compact" },
        "Logging initialized ({spec})"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_level_expands() {
        let spec = filter_spec(" debug ");
        assert!(spec.starts_with("debug,"));
        assert!(spec.contains("sqlx=warn"));
    }

    #[test]
    fn test_custom_directives_kept() {
        assert_eq!(filter_spec("info,arb_relay=trace"), "info,arb_relay=trace");
    }
}
