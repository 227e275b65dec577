//! `baily dev` command implementation.
//!
//! Resolves the config, assembles the plugin chain and the server, then
//! serves until Ctrl+C, closing the server on the way out.

use baily_core::plugin::{Plugin, ReplacePlugin};
use baily_core::{resolve_config, DevConfig, DevServer, FlatBundler};
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;
use tracing::info;

/// Dev server action.
#[derive(Debug, Clone, Default)]
pub struct DevAction {
    pub root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub base: Option<String>,
    pub hmr: bool,
    pub open: bool,
}

/// Run the dev server until interrupted.
pub async fn run(action: DevAction) -> Result<()> {
    let config = resolve_config(DevConfig {
        root: action.root,
        port: action.port,
        host: action.host,
        base: action.base,
        hmr: Some(action.hmr),
        ..Default::default()
    })
    .into_diagnostic()?;

    let url = format!("http://{}:{}{}", config.host, config.port, config.base);
    let plugins: Vec<Box<dyn Plugin>> =
        vec![Box::new(ReplacePlugin::new().env("NODE_ENV", "development"))];

    let server = DevServer::new(config, plugins, Box::new(FlatBundler)).into_diagnostic()?;

    if action.open {
        let _ = open_browser(&url);
    }

    tokio::select! {
        result = server.listen() => {
            result.into_diagnostic()?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            server.close();
        }
    }

    Ok(())
}

/// Open a URL in the default browser.
fn open_browser(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).spawn()?;
    }
    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open").arg(url).spawn()?;
    }
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd")
            .args(["/C", "start", url])
            .spawn()?;
    }
    Ok(())
}
