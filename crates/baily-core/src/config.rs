//! Dev-server configuration: file discovery, defaults, resolution.
//!
//! Configuration arrives from two places: an optional `baily.config.json`
//! in the project root and overrides from the CLI. [`resolve_config`]
//! merges them into a [`ResolvedConfig`] with every field concrete; the
//! rest of the core only ever sees the resolved form.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file names in priority order.
const CONFIG_FILES: &[&str] = &["baily.config.json", ".bailyrc.json"];

/// Directory (under the project root) holding the optimized-dep cache.
pub const DEPS_CACHE_DIR: &str = ".baily/deps";

/// User-facing configuration, all fields optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DevConfig {
    /// Project root directory. Defaults to the current directory.
    pub root: Option<PathBuf>,
    /// Public base path every served URL is mounted under.
    pub base: Option<String>,
    /// Dev server port.
    pub port: Option<u16>,
    /// Dev server host.
    pub host: Option<String>,
    /// `false` disables the HMR channel entirely.
    pub hmr: Option<bool>,
    /// Extra workspace roots files may be served from via `/@fs/`.
    pub fs_allow: Vec<PathBuf>,
    /// Bare specifiers to always pre-bundle.
    pub optimize_include: Vec<String>,
    /// Bare specifiers to never pre-bundle.
    pub optimize_exclude: Vec<String>,
    /// Substring patterns the watcher ignores, in addition to defaults.
    pub watch_ignore: Vec<String>,
    /// File suffixes whose change forces a full reload when no module
    /// maps to them.
    pub full_reload_patterns: Vec<String>,
}

/// Fully resolved configuration. Constructed once per server.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub root: PathBuf,
    /// Always starts and ends with `/`.
    pub base: String,
    pub port: u16,
    pub host: String,
    pub hmr: bool,
    /// Allow-list for `/@fs/` serving; always contains the root.
    pub fs_allow: Vec<PathBuf>,
    pub optimize_include: Vec<String>,
    pub optimize_exclude: Vec<String>,
    pub watch_ignore: Vec<String>,
    pub full_reload_patterns: Vec<String>,
    /// `<root>/.baily/deps`.
    pub deps_cache_dir: PathBuf,
    /// `<root>/public`, served verbatim when present.
    pub public_dir: PathBuf,
}

/// Find a config file in the given root directory.
#[must_use]
pub fn find_config_file(root: &Path) -> Option<PathBuf> {
    CONFIG_FILES.iter().map(|n| root.join(n)).find(|p| p.exists())
}

/// Load a [`DevConfig`] from disk.
///
/// # Errors
/// Returns [`Error::ConfigRead`] / [`Error::ConfigParse`], both fatal at
/// startup.
pub fn load_config_file(path: &Path) -> Result<DevConfig> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| Error::ConfigParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Merge a config file (if any) under `overrides` and fill defaults.
///
/// `overrides` wins field-by-field; list fields are concatenated
/// (file first, then overrides).
///
/// # Errors
/// Returns an error when the root does not exist or a config file is
/// malformed.
pub fn resolve_config(overrides: DevConfig) -> Result<ResolvedConfig> {
    let cwd = overrides
        .root
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let root = dunce::canonicalize(&cwd).map_err(|source| Error::ConfigRead {
        path: cwd.clone(),
        source,
    })?;

    let file = match find_config_file(&root) {
        Some(path) => load_config_file(&path)?,
        None => DevConfig::default(),
    };

    let base = normalize_base(
        overrides
            .base
            .or(file.base)
            .as_deref()
            .unwrap_or("/"),
    );

    let mut fs_allow = vec![root.clone()];
    fs_allow.extend(file.fs_allow.iter().map(|p| absolute(&root, p)));
    fs_allow.extend(overrides.fs_allow.iter().map(|p| absolute(&root, p)));

    let mut optimize_include = file.optimize_include;
    optimize_include.extend(overrides.optimize_include);
    let mut optimize_exclude = file.optimize_exclude;
    optimize_exclude.extend(overrides.optimize_exclude);

    let mut watch_ignore = file.watch_ignore;
    watch_ignore.extend(overrides.watch_ignore);

    let mut full_reload_patterns = file.full_reload_patterns;
    full_reload_patterns.extend(overrides.full_reload_patterns);
    if full_reload_patterns.is_empty() {
        full_reload_patterns.push(".html".to_string());
    }

    Ok(ResolvedConfig {
        deps_cache_dir: root.join(DEPS_CACHE_DIR),
        public_dir: root.join("public"),
        root,
        base,
        port: overrides.port.or(file.port).unwrap_or(3000),
        host: overrides
            .host
            .or(file.host)
            .unwrap_or_else(|| "localhost".to_string()),
        hmr: overrides.hmr.or(file.hmr).unwrap_or(true),
        fs_allow,
        optimize_include,
        optimize_exclude,
        watch_ignore,
        full_reload_patterns,
    })
}

fn absolute(root: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

/// Bases always start and end with a slash so stripping and joining stay
/// uniform.
fn normalize_base(base: &str) -> String {
    let mut b = String::new();
    if !base.starts_with('/') {
        b.push('/');
    }
    b.push_str(base);
    if !b.ends_with('/') {
        b.push('/');
    }
    b
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_defaults() {
        let dir = tempdir().unwrap();
        let config = resolve_config(DevConfig {
            root: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(config.base, "/");
        assert_eq!(config.port, 3000);
        assert!(config.hmr);
        assert_eq!(config.fs_allow, vec![config.root.clone()]);
        assert!(config.deps_cache_dir.ends_with(".baily/deps"));
        assert_eq!(config.full_reload_patterns, vec![".html".to_string()]);
    }

    #[test]
    fn test_config_file_discovered_and_overridden() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("baily.config.json"),
            r#"{"port": 4000, "base": "app", "optimizeInclude": ["react"]}"#,
        )
        .unwrap();

        let config = resolve_config(DevConfig {
            root: Some(dir.path().to_path_buf()),
            port: Some(5000),
            optimize_include: vec!["lodash".to_string()],
            ..Default::default()
        })
        .unwrap();

        // CLI override wins; lists concatenate.
        assert_eq!(config.port, 5000);
        assert_eq!(config.base, "/app/");
        assert_eq!(config.optimize_include, vec!["react", "lodash"]);
    }

    #[test]
    fn test_malformed_config_is_fatal() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("baily.config.json"), "{not json").unwrap();

        let err = resolve_config(DevConfig {
            root: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let err = resolve_config(DevConfig {
            root: Some(PathBuf::from("/definitely/not/here")),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }

    #[test]
    fn test_normalize_base() {
        assert_eq!(normalize_base("/"), "/");
        assert_eq!(normalize_base("app"), "/app/");
        assert_eq!(normalize_base("/app"), "/app/");
        assert_eq!(normalize_base("/app/"), "/app/");
    }
}
