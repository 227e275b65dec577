//! `baily optimize` command implementation.
//!
//! Runs dependency pre-bundling without starting a server, so a cold
//! `baily dev` afterwards reuses the warm cache.

use baily_core::{resolve_config, DepOptimizer, DevConfig, FlatBundler};
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;

pub fn run(root: Option<PathBuf>, force: bool, json: bool) -> Result<()> {
    let config = resolve_config(DevConfig {
        root,
        ..Default::default()
    })
    .into_diagnostic()?;

    if force {
        let _ = std::fs::remove_dir_all(&config.deps_cache_dir);
    }

    let optimizer = DepOptimizer::new(
        config.root.clone(),
        config.deps_cache_dir.clone(),
        config.optimize_include.clone(),
        config.optimize_exclude.clone(),
        Box::new(FlatBundler),
    );
    optimizer.run_initial().into_diagnostic()?;

    let metadata = optimizer.metadata();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&metadata).into_diagnostic()?
        );
        return Ok(());
    }

    println!(
        "Optimized {} dependencies (browser hash {})",
        metadata.optimized.len(),
        metadata.browser_hash
    );
    for (specifier, info) in &metadata.optimized {
        let interop = if info.needs_interop { " (cjs interop)" } else { "" };
        println!("  {specifier}{interop}");
    }

    Ok(())
}
