//! Tracing setup for the baily CLI.
//!
//! The library crates only emit events; the subscriber lives here. The
//! interesting traffic is `baily_core`'s dev-server activity: watcher
//! events and coalesced file batches at DEBUG, hmr updates / reloads /
//! optimizer runs at INFO, hook failures at WARN. The infrastructure
//! underneath (hyper's connection churn, notify's raw event stream) is
//! held at WARN unless `RUST_LOG` asks for it explicitly.
//!
//! With `--json`, events go to stderr as one JSON object per line
//! carrying `timestamp`, `level`, `target` and the event fields, which
//! is what editor integrations scrape.

use tracing_subscriber::fmt;
use tracing_subscriber::{prelude::*, registry, EnvFilter};

/// Level for the baily crates by verbosity step (`-v`, `-vv`).
fn own_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. `RUST_LOG` overrides everything;
/// otherwise baily crates log at the verbosity-selected level and the
/// transport crates stay quiet.
///
/// # Panics
/// Panics if a subscriber is already installed (init is called once,
/// from `main`).
pub fn init(verbosity: u8, json: bool) {
    let level = own_level(verbosity);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,baily={level},baily_core={level},baily_proto={level},baily_util={level}"
        ))
    });

    let output = if json {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    registry().with(filter).with(output).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_level_steps() {
        assert_eq!(own_level(0), "info");
        assert_eq!(own_level(1), "debug");
        assert_eq!(own_level(2), "trace");
        assert_eq!(own_level(9), "trace");
    }
}
