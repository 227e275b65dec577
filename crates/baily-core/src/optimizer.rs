//! Dependency pre-bundling.
//!
//! Bare (node_modules) imports are resolved once, handed to an external
//! bundler, and served as flat ES modules out of a content-hashed cache
//! directory under `<root>/.baily/deps`. Each optimization writes into a
//! fresh generation directory named by its browser hash; superseded
//! generations stay on disk until the next server start so in-flight
//! requests against old URLs never 404.

use crate::error::{Error, Result};
use crate::paths::{fs_path_to_url, inject_query, normalize_path};
use crate::rewrite::{is_bare_specifier, package_name_of, scan_imports};
use baily_util::{fs as ufs, hash};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Manifest file sitting beside the generation directories.
const METADATA_FILE: &str = "_metadata.json";

/// Lockfile guarding re-optimization against concurrent server starts.
const LOCK_FILE: &str = "_lock";

/// A lock older than this is considered abandoned.
const STALE_LOCK: Duration = Duration::from_secs(60);

/// One optimized entry, keyed by its import specifier in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizedDepInfo {
    /// Resolved source file inside the package.
    pub src: PathBuf,
    /// Bundled output under the cache directory.
    pub file: PathBuf,
    /// Content hash of the bundled output.
    pub file_hash: String,
    /// CommonJS sources need default-export interop wrapping.
    pub needs_interop: bool,
}

/// Persisted manifest describing one optimization generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepMetadata {
    /// Shared hash over the sorted entry set; changes iff the set of
    /// optimized entries or any of their content hashes changes.
    pub browser_hash: String,
    /// Generation directory name under the cache dir.
    pub generation: String,
    pub optimized: BTreeMap<String, OptimizedDepInfo>,
}

/// What a bundler produced for one specifier.
#[derive(Debug, Clone)]
pub struct BundledOutput {
    pub specifier: String,
    /// File name inside the output directory.
    pub file_name: String,
    pub needs_interop: bool,
}

/// A specifier scheduled for bundling.
#[derive(Debug, Clone)]
pub struct DepEntry {
    pub specifier: String,
    pub src: PathBuf,
}

/// The external bundler interface. The production build pipeline owns a
/// real implementation; [`FlatBundler`] is the minimal built-in used for
/// tests and standalone runs.
pub trait DepBundler: Send + Sync {
    /// Bundle every entry into `out_dir` as an ES module.
    ///
    /// # Errors
    /// Any failure aborts the whole optimization; the previous generation
    /// stays current.
    fn bundle(&self, entries: &[DepEntry], out_dir: &Path) -> Result<Vec<BundledOutput>>;
}

/// Single-file bundler: copies ESM sources verbatim and wraps CommonJS
/// sources in a default-export shim. Packages whose entry imports further
/// package-internal files need a real bundler.
#[derive(Debug, Default)]
pub struct FlatBundler;

impl DepBundler for FlatBundler {
    fn bundle(&self, entries: &[DepEntry], out_dir: &Path) -> Result<Vec<BundledOutput>> {
        let mut outputs = Vec::with_capacity(entries.len());
        for entry in entries {
            let source = ufs::read_source_lossy(&entry.src).map_err(|e| Error::Optimize {
                specifier: Some(entry.specifier.clone()),
                message: format!("failed to read {}: {e}", entry.src.display()),
            })?;

            let needs_interop = !source_is_esm(&source);
            let code = if needs_interop {
                wrap_commonjs(&entry.specifier, &source)
            } else {
                source
            };

            let file_name = format!("{}.js", sanitize_specifier(&entry.specifier));
            fs::write(out_dir.join(&file_name), code).map_err(|e| Error::Optimize {
                specifier: Some(entry.specifier.clone()),
                message: format!("failed to write bundle: {e}"),
            })?;

            outputs.push(BundledOutput {
                specifier: entry.specifier.clone(),
                file_name,
                needs_interop,
            });
        }
        Ok(outputs)
    }
}

/// Outcome of asking the optimizer about a bare import.
#[derive(Debug, Clone, PartialEq)]
pub enum DepRequest {
    /// Rewrite to this URL; apply interop when flagged.
    Optimized { url: String, needs_interop: bool },
    /// Declared excluded: leave the specifier alone.
    Excluded,
}

/// The per-server dependency optimizer.
pub struct DepOptimizer {
    root: PathBuf,
    cache_dir: PathBuf,
    include: Vec<String>,
    exclude: Vec<String>,
    bundler: Box<dyn DepBundler>,
    metadata: RwLock<DepMetadata>,
}

impl DepOptimizer {
    #[must_use]
    pub fn new(
        root: PathBuf,
        cache_dir: PathBuf,
        include: Vec<String>,
        exclude: Vec<String>,
        bundler: Box<dyn DepBundler>,
    ) -> Self {
        Self {
            root,
            cache_dir,
            include,
            exclude,
            bundler,
            metadata: RwLock::new(DepMetadata::default()),
        }
    }

    /// Startup: scan the entry graph for bare imports, reuse the on-disk
    /// manifest when it covers the same specifier set, otherwise bundle.
    pub fn run_initial(&self) -> Result<()> {
        let mut specifiers = discover_bare_imports(&self.root);
        specifiers.extend(self.include.iter().cloned());
        specifiers.retain(|s| !self.exclude.contains(s));

        if let Some(manifest) = self.load_manifest() {
            let cached: BTreeSet<String> = manifest.optimized.keys().cloned().collect();
            let generation_ok = manifest.generation.is_empty()
                || self.cache_dir.join(&manifest.generation).is_dir();
            if cached == specifiers && generation_ok {
                debug!(hash = %manifest.browser_hash, "dep cache fresh, reusing");
                *self.metadata.write().unwrap() = manifest;
                self.prune_stale_generations();
                return Ok(());
            }
        }

        self.optimize(&specifiers)?;
        self.prune_stale_generations();
        Ok(())
    }

    /// Bundle `specifiers` into a new generation and swap it in.
    pub fn optimize(&self, specifiers: &BTreeSet<String>) -> Result<()> {
        fs::create_dir_all(&self.cache_dir)?;
        let _lock = CacheLock::acquire(&self.cache_dir)?;

        let mut entries = Vec::new();
        for specifier in specifiers {
            match resolve_bare_specifier(&self.root, specifier) {
                Some(src) => entries.push(DepEntry {
                    specifier: specifier.clone(),
                    src,
                }),
                None => {
                    return Err(Error::Optimize {
                        specifier: Some(specifier.clone()),
                        message: "not found in node_modules".to_string(),
                    })
                }
            }
        }

        let tmp_dir = self.cache_dir.join(format!(".tmp-{}", std::process::id()));
        let _ = fs::remove_dir_all(&tmp_dir);
        fs::create_dir_all(&tmp_dir)?;

        let outputs = match self.bundler.bundle(&entries, &tmp_dir) {
            Ok(outputs) => outputs,
            Err(e) => {
                let _ = fs::remove_dir_all(&tmp_dir);
                return Err(e);
            }
        };

        let mut optimized = BTreeMap::new();
        let mut hashes = Vec::new();
        for output in &outputs {
            let file_hash = hash::file_hash(&tmp_dir.join(&output.file_name))?;
            hashes.push((output.specifier.clone(), file_hash.clone()));
            let Some(entry) = entries.iter().find(|e| e.specifier == output.specifier) else {
                return Err(Error::Optimize {
                    specifier: Some(output.specifier.clone()),
                    message: "bundler produced an undeclared entry".to_string(),
                });
            };
            optimized.insert(
                output.specifier.clone(),
                OptimizedDepInfo {
                    src: entry.src.clone(),
                    // Final path is fixed up after the generation rename.
                    file: PathBuf::from(&output.file_name),
                    file_hash,
                    needs_interop: output.needs_interop,
                },
            );
        }

        let browser_hash =
            hash::combined_hash(hashes.iter().map(|(s, h)| (s.as_str(), h.as_str())));

        let generation = if optimized.is_empty() {
            let _ = fs::remove_dir_all(&tmp_dir);
            String::new()
        } else {
            let gen_dir = self.cache_dir.join(&browser_hash);
            if gen_dir.is_dir() {
                // Identical generation already on disk.
                let _ = fs::remove_dir_all(&tmp_dir);
            } else {
                fs::rename(&tmp_dir, &gen_dir)?;
            }
            for info in optimized.values_mut() {
                info.file = gen_dir.join(&info.file);
            }
            browser_hash.clone()
        };

        let manifest = DepMetadata {
            browser_hash,
            generation,
            optimized,
        };
        ufs::persist_atomic(
            &self.cache_dir.join(METADATA_FILE),
            serde_json::to_string_pretty(&manifest)
                .map_err(|e| Error::other(e.to_string()))?
                .as_bytes(),
        )?;

        info!(
            deps = manifest.optimized.len(),
            hash = %manifest.browser_hash,
            "optimized dependencies"
        );
        *self.metadata.write().unwrap() = manifest;
        Ok(())
    }

    /// Look up a bare import; `None` when it is not (yet) optimized.
    #[must_use]
    pub fn optimized_import(&self, specifier: &str) -> Option<DepRequest> {
        if self.exclude.iter().any(|e| e == specifier) {
            return Some(DepRequest::Excluded);
        }
        let metadata = self.metadata.read().unwrap();
        let info = metadata.optimized.get(specifier)?;
        Some(DepRequest::Optimized {
            url: inject_query(
                &fs_path_to_url(&info.file),
                &format!("v={}", metadata.browser_hash),
            ),
            needs_interop: info.needs_interop,
        })
    }

    /// Handle a bare import discovered during import analysis. Returns the
    /// rewrite target plus whether a re-optimization ran (the caller owes
    /// the clients a `full-reload` when it did).
    pub fn ensure_registered(&self, specifier: &str) -> Result<(DepRequest, bool)> {
        if let Some(found) = self.optimized_import(specifier) {
            return Ok((found, false));
        }

        info!(specifier, "new dependency discovered, re-optimizing");
        let mut specifiers: BTreeSet<String> = self
            .metadata
            .read()
            .unwrap()
            .optimized
            .keys()
            .cloned()
            .collect();
        specifiers.insert(specifier.to_string());
        self.optimize(&specifiers)?;

        let found = self.optimized_import(specifier).ok_or_else(|| Error::Optimize {
            specifier: Some(specifier.to_string()),
            message: "missing after re-optimization".to_string(),
        })?;
        Ok((found, true))
    }

    #[must_use]
    pub fn browser_hash(&self) -> String {
        self.metadata.read().unwrap().browser_hash.clone()
    }

    #[must_use]
    pub fn metadata(&self) -> DepMetadata {
        self.metadata.read().unwrap().clone()
    }

    /// Whether an absolute path points into the dep cache.
    #[must_use]
    pub fn is_cache_path(&self, path: &Path) -> bool {
        path.starts_with(&self.cache_dir)
    }

    fn load_manifest(&self) -> Option<DepMetadata> {
        let text = fs::read_to_string(self.cache_dir.join(METADATA_FILE)).ok()?;
        match serde_json::from_str(&text) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(error = %e, "dep cache manifest unreadable, re-optimizing");
                None
            }
        }
    }

    /// Drop generation directories other than the current one. Runs at
    /// startup only, so generations superseded mid-session survive for
    /// in-flight requests.
    fn prune_stale_generations(&self) {
        let current = self.metadata.read().unwrap().generation.clone();
        let Ok(entries) = fs::read_dir(&self.cache_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() && name != current {
                debug!(generation = %name, "pruning stale dep generation");
                let _ = fs::remove_dir_all(entry.path());
            }
        }
    }
}

/// Held for the duration of one optimization run.
#[derive(Debug)]
struct CacheLock {
    path: PathBuf,
}

impl CacheLock {
    fn acquire(cache_dir: &Path) -> Result<Self> {
        let path = cache_dir.join(LOCK_FILE);
        for _ in 0..2 {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let abandoned = fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|t| t.elapsed().ok())
                        .is_some_and(|age| age > STALE_LOCK);
                    if abandoned {
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    return Err(Error::Optimize {
                        specifier: None,
                        message: "another optimization holds the cache lock".to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Optimize {
            specifier: None,
            message: "could not acquire the cache lock".to_string(),
        })
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Resolve a bare specifier to a file inside `node_modules`.
///
/// Subpath imports resolve against the package directory; package roots
/// follow `package.json` `module` then `main`, then `index.js`.
#[must_use]
pub fn resolve_bare_specifier(root: &Path, specifier: &str) -> Option<PathBuf> {
    let node_modules = root.join("node_modules");
    let package = package_name_of(specifier);
    let package_dir = node_modules.join(&package);
    if !package_dir.is_dir() {
        return None;
    }

    if specifier != package {
        let subpath = &specifier[package.len() + 1..];
        let candidate = package_dir.join(subpath);
        if candidate.is_file() {
            return Some(candidate);
        }
        for ext in [".js", ".mjs", ".cjs"] {
            let with_ext = package_dir.join(format!("{subpath}{ext}"));
            if with_ext.is_file() {
                return Some(with_ext);
            }
        }
        let index = candidate.join("index.js");
        return index.is_file().then_some(index);
    }

    if let Ok(text) = fs::read_to_string(package_dir.join("package.json")) {
        if let Ok(pkg) = serde_json::from_str::<serde_json::Value>(&text) {
            for field in ["module", "main"] {
                if let Some(rel) = pkg.get(field).and_then(|v| v.as_str()) {
                    let candidate = package_dir.join(rel);
                    if candidate.is_file() {
                        return Some(candidate);
                    }
                }
            }
        }
    }

    let index = package_dir.join("index.js");
    index.is_file().then_some(index)
}

/// Find project entries: module scripts in HTML files near the root,
/// falling back to the conventional `src/main.*`.
#[must_use]
pub fn find_entries(root: &Path) -> Vec<PathBuf> {
    let mut entries = Vec::new();

    let walker = walkdir::WalkDir::new(root)
        .max_depth(2)
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            !(name == "node_modules" || name.starts_with('.') || name == "dist")
        });
    for entry in walker.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "html") {
            if let Ok(html) = fs::read_to_string(path) {
                for src in module_script_srcs(&html) {
                    let file = root.join(src.trim_start_matches('/'));
                    if file.is_file() {
                        entries.push(file);
                    }
                }
            }
        }
    }

    if entries.is_empty() {
        for name in ["src/main.js", "src/main.mjs", "src/index.js", "main.js"] {
            let candidate = root.join(name);
            if candidate.is_file() {
                entries.push(candidate);
                break;
            }
        }
    }

    entries
}

/// Walk the entry graph along relative imports, collecting bare specifiers.
#[must_use]
pub fn discover_bare_imports(root: &Path) -> BTreeSet<String> {
    let mut bare = BTreeSet::new();
    let mut visited = HashSet::new();
    let mut queue = find_entries(root);

    while let Some(path) = queue.pop() {
        let key = normalize_path(&path.display().to_string());
        if !visited.insert(key) {
            continue;
        }
        let Ok(source) = ufs::read_source_lossy(&path) else {
            continue;
        };

        for import in scan_imports(&source) {
            let specifier = import.specifier;
            if is_bare_specifier(&specifier) {
                bare.insert(specifier);
            } else if specifier.starts_with("./") || specifier.starts_with("../") {
                if let Some(parent) = path.parent() {
                    let joined = parent.join(&specifier);
                    for ext in ["", ".js", ".mjs", ".jsx", ".ts", ".tsx"] {
                        let candidate = if ext.is_empty() {
                            joined.clone()
                        } else {
                            PathBuf::from(format!("{}{ext}", joined.display()))
                        };
                        if candidate.is_file() {
                            queue.push(candidate);
                            break;
                        }
                    }
                }
            }
        }
    }

    bare
}

/// Extract `src` attributes of `<script type="module">` tags.
fn module_script_srcs(html: &str) -> Vec<String> {
    let mut srcs = Vec::new();
    let mut rest = html;
    while let Some(idx) = rest.find("<script") {
        rest = &rest[idx..];
        let end = rest.find('>').unwrap_or(rest.len());
        let tag = &rest[..end];
        if tag.contains("type=\"module\"") || tag.contains("type='module'") {
            if let Some(src) = attr_value(tag, "src") {
                srcs.push(src);
            }
        }
        rest = &rest[end..];
        if rest.is_empty() {
            break;
        }
        rest = &rest[1..];
    }
    srcs
}

fn attr_value(tag: &str, name: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let needle = format!("{name}={quote}");
        if let Some(idx) = tag.find(&needle) {
            let after = &tag[idx + needle.len()..];
            if let Some(end) = after.find(quote) {
                return Some(after[..end].to_string());
            }
        }
    }
    None
}

/// A source is ESM when it declares imports or exports at statement level.
fn source_is_esm(code: &str) -> bool {
    code.lines().any(|line| {
        let trimmed = line.trim();
        trimmed.starts_with("import ")
            || trimmed.starts_with("import{")
            || trimmed.starts_with("export ")
            || trimmed.starts_with("export{")
            || trimmed.starts_with("export default")
    })
}

/// Wrap a CommonJS source so it can be imported as an ES module.
fn wrap_commonjs(specifier: &str, source: &str) -> String {
    format!(
        "// {specifier} (commonjs, wrapped)\nconst module = {{ exports: {{}} }};\nconst exports = module.exports;\n{source}\nexport default module.exports;\n"
    )
}

fn sanitize_specifier(specifier: &str) -> String {
    specifier.replace('/', "__").replace('@', "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn fixture_root() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join("index.html"),
            r#"<html><body><script type="module" src="/src/main.js"></script></body></html>"#,
        );
        write(
            &root.join("src/main.js"),
            "import React from 'react';\nimport { helper } from './util.js';\n",
        );
        write(&root.join("src/util.js"), "import _ from 'lodash';\nexport const helper = 1;\n");
        write(
            &root.join("node_modules/react/package.json"),
            r#"{"name":"react","main":"index.js"}"#,
        );
        write(
            &root.join("node_modules/react/index.js"),
            "module.exports = { useState: () => {} };\n",
        );
        write(
            &root.join("node_modules/lodash/package.json"),
            r#"{"name":"lodash","module":"lodash.mjs"}"#,
        );
        write(&root.join("node_modules/lodash/lodash.mjs"), "export default {};\n");
        dir
    }

    fn optimizer_for(root: &Path) -> DepOptimizer {
        DepOptimizer::new(
            root.to_path_buf(),
            root.join(".baily/deps"),
            Vec::new(),
            Vec::new(),
            Box::new(FlatBundler),
        )
    }

    #[test]
    fn test_discover_bare_imports_walks_entry_graph() {
        let dir = fixture_root();
        let bare = discover_bare_imports(dir.path());
        assert_eq!(
            bare.into_iter().collect::<Vec<_>>(),
            vec!["lodash".to_string(), "react".to_string()]
        );
    }

    #[test]
    fn test_resolve_bare_specifier_fields_and_subpaths() {
        let dir = fixture_root();
        let root = dir.path();
        assert_eq!(
            resolve_bare_specifier(root, "react"),
            Some(root.join("node_modules/react/index.js"))
        );
        // `module` preferred over `main`.
        assert_eq!(
            resolve_bare_specifier(root, "lodash"),
            Some(root.join("node_modules/lodash/lodash.mjs"))
        );
        write(
            &root.join("node_modules/react/jsx-runtime.js"),
            "module.exports = {};",
        );
        assert_eq!(
            resolve_bare_specifier(root, "react/jsx-runtime"),
            Some(root.join("node_modules/react/jsx-runtime.js"))
        );
        assert_eq!(resolve_bare_specifier(root, "missing-pkg"), None);
    }

    #[test]
    fn test_initial_run_writes_manifest_and_generation() {
        let dir = fixture_root();
        let optimizer = optimizer_for(dir.path());
        optimizer.run_initial().unwrap();

        let metadata = optimizer.metadata();
        assert_eq!(metadata.optimized.len(), 2);
        assert!(!metadata.browser_hash.is_empty());
        assert!(dir.path().join(".baily/deps").join(&metadata.generation).is_dir());
        assert!(dir.path().join(".baily/deps/_metadata.json").is_file());

        // CJS react needs interop, ESM lodash does not.
        assert!(metadata.optimized["react"].needs_interop);
        assert!(!metadata.optimized["lodash"].needs_interop);
    }

    #[test]
    fn test_optimized_import_url_carries_browser_hash() {
        let dir = fixture_root();
        let optimizer = optimizer_for(dir.path());
        optimizer.run_initial().unwrap();

        let Some(DepRequest::Optimized { url, needs_interop }) =
            optimizer.optimized_import("react")
        else {
            panic!("react should be optimized");
        };
        assert!(url.starts_with("/@fs/"));
        assert!(url.contains("react.js"));
        assert!(url.ends_with(&format!("?v={}", optimizer.browser_hash())));
        assert!(needs_interop);
    }

    #[test]
    fn test_second_start_reuses_cache() {
        let dir = fixture_root();
        let optimizer = optimizer_for(dir.path());
        optimizer.run_initial().unwrap();
        let first = optimizer.browser_hash();

        let again = optimizer_for(dir.path());
        again.run_initial().unwrap();
        assert_eq!(again.browser_hash(), first);
    }

    #[test]
    fn test_discovery_changes_browser_hash() {
        let dir = fixture_root();
        let root = dir.path();
        let optimizer = optimizer_for(root);
        optimizer.run_initial().unwrap();
        let before = optimizer.browser_hash();

        write(
            &root.join("node_modules/dayjs/package.json"),
            r#"{"name":"dayjs","main":"index.js"}"#,
        );
        write(&root.join("node_modules/dayjs/index.js"), "export default () => {};\n");

        let (request, reoptimized) = optimizer.ensure_registered("dayjs").unwrap();
        assert!(reoptimized);
        assert!(matches!(request, DepRequest::Optimized { .. }));
        assert_ne!(optimizer.browser_hash(), before);

        // Already-known deps answer without another run.
        let (_, reoptimized) = optimizer.ensure_registered("react").unwrap();
        assert!(!reoptimized);
    }

    #[test]
    fn test_old_generation_survives_reoptimization() {
        let dir = fixture_root();
        let root = dir.path();
        let optimizer = optimizer_for(root);
        optimizer.run_initial().unwrap();
        let old_generation = root.join(".baily/deps").join(optimizer.metadata().generation);

        write(
            &root.join("node_modules/dayjs/package.json"),
            r#"{"name":"dayjs","main":"index.js"}"#,
        );
        write(&root.join("node_modules/dayjs/index.js"), "export default 1;\n");
        optimizer.ensure_registered("dayjs").unwrap();

        // Requests in flight against the old URLs still find their files.
        assert!(old_generation.is_dir());
    }

    #[test]
    fn test_excluded_specifier_left_alone() {
        let dir = fixture_root();
        let optimizer = DepOptimizer::new(
            dir.path().to_path_buf(),
            dir.path().join(".baily/deps"),
            Vec::new(),
            vec!["react".to_string()],
            Box::new(FlatBundler),
        );
        assert_eq!(
            optimizer.optimized_import("react"),
            Some(DepRequest::Excluded)
        );
    }

    #[test]
    fn test_missing_package_is_optimize_error() {
        let dir = tempdir().unwrap();
        let optimizer = optimizer_for(dir.path());
        let mut set = BTreeSet::new();
        set.insert("ghost-package".to_string());
        let err = optimizer.optimize(&set).unwrap_err();
        assert!(matches!(err, Error::Optimize { .. }));
    }

    #[test]
    fn test_cache_lock_blocks_second_optimizer() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path()).unwrap();
        let _held = CacheLock::acquire(dir.path()).unwrap();
        let err = CacheLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Optimize { .. }));
    }

    #[test]
    fn test_module_script_srcs() {
        let html = r#"<script type="module" src="/src/main.js"></script>
<script src="/legacy.js"></script>"#;
        assert_eq!(module_script_srcs(html), vec!["/src/main.js"]);
    }

    #[test]
    fn test_source_is_esm() {
        assert!(source_is_esm("export default {};"));
        assert!(source_is_esm("import x from 'y';"));
        assert!(!source_is_esm("module.exports = {};"));
    }
}
