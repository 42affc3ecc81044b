//! Bootstrap utilities for the provisioner binary.

use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LOG_ENV_VAR, LOG_FORMAT_ENV_VAR};

/// Initialize tracing with the PROVISIONER_LOG environment variable.
///
/// Defaults to "info" level if PROVISIONER_LOG is not set. Set
/// PROVISIONER_LOG_FORMAT=json for one JSON object per line.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json_logs(std::env::var(LOG_FORMAT_ENV_VAR).ok().as_deref()) {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn json_logs(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.eq_ignore_ascii_case("json"))
}

/// Shutdown signal that flips to `true` on Ctrl+C.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Shutdown requested");
        signal_shutdown(&tx);
    });
    rx
}

/// Flip `tx` to `true`. Returns `false` when nothing is listening anymore.
fn signal_shutdown(tx: &watch::Sender<bool>) -> bool {
    match tx.send(true) {
        Ok(()) => true,
        Err(_) => {
            debug!("Shutdown signalled with no remaining receivers");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_logs_selection() {
        assert!(json_logs(Some("json")));
        assert!(json_logs(Some("JSON")));
        assert!(!json_logs(Some("pretty")));
        assert!(!json_logs(None));
    }

    #[test]
    fn test_signal_shutdown_reaches_receivers() {
        let (tx, rx) = watch::channel(false);

        assert!(signal_shutdown(&tx));
        assert!(*rx.borrow());
    }

    #[test]
    fn test_signal_shutdown_without_receivers() {
        let (tx, rx) = watch::channel(false);
        drop(rx);

        assert!(!signal_shutdown(&tx));
    }
}
