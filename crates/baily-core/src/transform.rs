//! Per-request transform pipeline.
//!
//! `transform_request(url)` is the single entry point the HTTP middleware
//! calls: resolve → load → plugin transform → import analysis → cache in
//! the module graph. Concurrent requests for the same URL deduplicate on
//! a pending map so the pipeline runs once per URL per invalidation
//! generation.

use crate::client::hot_preamble;
use crate::error::{Error, Result};
use crate::graph::{ModuleGraph, ModuleId, TransformResult};
use crate::optimizer::{DepOptimizer, DepRequest};
use crate::paths::{
    clean_url, fs_url_to_path, inject_query, is_file_serving_allowed, is_virtual_id,
    normalize_path, query_of, unwrap_virtual_url, wrap_virtual_id, CLIENT_PATH,
};
use crate::plugin::{PluginContainer, ResolveOutcome};
use crate::rewrite::{self, ImportKind, Rewrite};
use crate::ws::HmrChannel;
use baily_proto::HmrPayload;
use baily_util::{fs as ufs, hash};
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// Extensions the dev server serves as transformed JS modules.
pub const JS_EXTENSIONS: &[&str] = &["js", "mjs", "cjs", "jsx", "ts", "tsx"];

/// Extensions resolved when an import omits one.
const RESOLVE_EXTENSIONS: &[&str] = &[".js", ".mjs", ".jsx", ".ts", ".tsx"];

const INDEX_FILES: &[&str] = &["index.js", "index.mjs", "index.jsx", "index.ts", "index.tsx"];

/// Asset extensions served as `export default "<url>"` when imported.
const ASSET_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".webp", ".avif", ".mp4", ".webm", ".ogg",
    ".mp3", ".wav", ".woff", ".woff2", ".eot", ".ttf", ".otf", ".wasm", ".pdf",
];

/// Whether a URL looks like a module request the transform handler owns.
#[must_use]
pub fn is_module_request(url: &str) -> bool {
    let clean = clean_url(url);
    if clean == CLIENT_PATH || clean.starts_with("/@id/") || clean.starts_with("/@fs/") {
        return true;
    }
    if has_import_marker(url) {
        return true;
    }
    let ext = clean.rsplit('.').next().unwrap_or("");
    JS_EXTENSIONS.contains(&ext) || ext == "css" || ext == "json"
}

fn has_import_marker(url: &str) -> bool {
    query_of(url).is_some_and(|q| q.split('&').any(|p| p == "import"))
}

fn is_asset_path(path: &str) -> bool {
    let lower = clean_url(path).to_lowercase();
    ASSET_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn is_css_path(path: &str) -> bool {
    clean_url(path).ends_with(".css")
}

/// The memoized `(url) → TransformResult` pipeline.
pub struct TransformPipeline {
    graph: Arc<ModuleGraph>,
    container: Arc<PluginContainer>,
    optimizer: Arc<DepOptimizer>,
    channel: Arc<HmrChannel>,
    root: PathBuf,
    fs_allow: Vec<PathBuf>,
    /// In-flight URLs; waiters hold a receiver that resolves when the
    /// producer drops its sender.
    pending: Mutex<FxHashMap<String, watch::Receiver<()>>>,
}

impl TransformPipeline {
    #[must_use]
    pub fn new(
        graph: Arc<ModuleGraph>,
        container: Arc<PluginContainer>,
        optimizer: Arc<DepOptimizer>,
        channel: Arc<HmrChannel>,
        root: PathBuf,
        fs_allow: Vec<PathBuf>,
    ) -> Self {
        Self {
            graph,
            container,
            optimizer,
            channel,
            root,
            fs_allow,
            pending: Mutex::new(FxHashMap::default()),
        }
    }

    /// Transform the module behind `raw_url`, serving from the graph cache
    /// when it is fresh. Concurrent callers for one URL share a single
    /// pipeline run.
    pub async fn transform_request(&self, raw_url: &str) -> Result<TransformResult> {
        let url = ModuleGraph::canonical_url(raw_url);

        loop {
            if let Some(module) = self.graph.get_module_by_url(&url) {
                if let Some(message) = self.graph.get_transform_error(module) {
                    return Err(Error::Transform { id: url, message });
                }
                if let Some(result) = self.graph.get_transform_result(module) {
                    return Ok(result);
                }
            }

            enum Role {
                Producer(watch::Sender<()>),
                Waiter(watch::Receiver<()>),
            }

            let role = {
                let mut pending = self.pending.lock().await;
                if let Some(rx) = pending.get(&url) {
                    Role::Waiter(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(());
                    pending.insert(url.clone(), rx);
                    Role::Producer(tx)
                }
            };

            match role {
                Role::Waiter(mut rx) => {
                    // Wakes when the producer finishes (sender dropped).
                    let _ = rx.changed().await;
                }
                Role::Producer(_tx) => {
                    let outcome = self.run_pipeline(&url).await;
                    self.pending.lock().await.remove(&url);
                    return outcome;
                }
            }
        }
    }

    async fn run_pipeline(&self, url: &str) -> Result<TransformResult> {
        match self.run_pipeline_inner(url) {
            Ok((module, result, reoptimized)) => {
                self.graph.set_transform_result(module, result.clone());
                if reoptimized {
                    // Re-optimization swapped the browser hash; every open
                    // page holds imports against the old one.
                    self.channel.send(HmrPayload::FullReload { path: None });
                }
                Ok(result)
            }
            Err(e) => {
                if let Some(module) = self.graph.get_module_by_url(url) {
                    self.graph.set_transform_error(module, e.to_string());
                }
                self.channel.send(HmrPayload::Error {
                    err: e.to_payload(),
                });
                Err(e)
            }
        }
    }

    fn run_pipeline_inner(&self, url: &str) -> Result<(ModuleId, TransformResult, bool)> {
        let clean = clean_url(url);
        let import_marker = has_import_marker(url);

        let resolved_id = self.resolve_url(url)?;
        let module = self.graph.ensure_entry_from_url(url, &resolved_id);

        // Asset imports never load file content; the module is just the URL.
        if import_marker && is_asset_path(clean) {
            let code = format!("export default {clean:?};\n");
            let result = finish(code, None, Vec::new());
            self.graph.update_module_info(module, &[], &[], None, false);
            return Ok((module, result, false));
        }

        let loaded = self.load_module(&resolved_id)?;
        let transformed = self
            .container
            .transform(&loaded, &resolved_id)
            .map_err(|e| e.into_core(&resolved_id))?;

        if is_css_path(clean) {
            let result = if import_marker {
                // CSS imported from JS: a self-accepting module that
                // installs a <style> tag.
                let code = css_to_js_module(url, &transformed.code);
                self.graph.update_module_info(module, &[], &[], None, true);
                finish(code, transformed.map, Vec::new())
            } else {
                self.graph.update_module_info(module, &[], &[], None, false);
                finish(transformed.code, transformed.map, Vec::new())
            };
            return Ok((module, result, false));
        }

        if clean.ends_with(".json") {
            let code = format!("export default {};\n", transformed.code.trim());
            let result = finish(code, None, Vec::new());
            self.graph.update_module_info(module, &[], &[], None, false);
            return Ok((module, result, false));
        }

        // JS module: import analysis.
        let importer_dir = Path::new(clean_url(&resolved_id))
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        let mut rewrite_error: Option<Error> = None;
        let mut reoptimized = false;
        let rewritten = rewrite::rewrite_module(&transformed.code, |specifier, kind| {
            self.rewrite_specifier(
                specifier,
                kind,
                &importer_dir,
                url,
                &mut rewrite_error,
                &mut reoptimized,
            )
        });
        if let Some(e) = rewrite_error {
            return Err(e);
        }

        // Wire the graph: dependency edges and HMR acceptance.
        let dep_ids: Vec<ModuleId> = rewritten
            .deps
            .iter()
            .map(|dep| self.ensure_dep_entry(dep))
            .collect();
        let accepted_ids: Vec<ModuleId> = rewritten
            .hot
            .accepted_deps
            .iter()
            .filter_map(|spec| {
                self.resolve_accept_target(spec, &importer_dir)
                    .map(|dep_url| self.ensure_dep_entry(&dep_url))
            })
            .collect();
        let accepted_exports: Option<HashSet<String>> = rewritten
            .hot
            .accepted_exports
            .as_ref()
            .map(|names| names.iter().cloned().collect());

        let pruned = self.graph.update_module_info(
            module,
            &dep_ids,
            &accepted_ids,
            accepted_exports,
            rewritten.hot.is_self_accepting,
        );
        let freshly_pruned = self.graph.mark_pruned(&pruned);
        if !freshly_pruned.is_empty() {
            let paths = freshly_pruned
                .iter()
                .map(|&id| self.graph.url_of(id))
                .collect();
            self.channel.send(HmrPayload::Prune { paths });
        }

        let node_url = self.graph.url_of(module);
        let code = format!("{}{}", hot_preamble(&node_url), rewritten.code);
        let result = finish(code, transformed.map, rewritten.deps);
        debug!(url, deps = result.deps.len(), "transformed module");
        Ok((module, result, reoptimized))
    }

    /// Resolve a request URL to a module id.
    fn resolve_url(&self, url: &str) -> Result<String> {
        let clean = clean_url(url);
        let query_suffix = query_of(url).map(|q| format!("?{q}")).unwrap_or_default();

        if let Some(id) = unwrap_virtual_url(url) {
            return Ok(id);
        }

        if let Some(path) = fs_url_to_path(url) {
            if !is_file_serving_allowed(&path, &self.fs_allow) {
                return Err(Error::FsDenied { path });
            }
            return Ok(format!(
                "{}{query_suffix}",
                normalize_path(&path.display().to_string())
            ));
        }

        match self
            .container
            .resolve_id(clean, None)
            .map_err(|e| e.into_core(clean))?
        {
            ResolveOutcome::Resolved(resolved) => Ok(resolved.id),
            ResolveOutcome::NotResolved => {
                let relative = clean.trim_start_matches('/');
                let candidate = self.root.join(relative);
                match resolve_file(&candidate) {
                    Some(path) => Ok(format!(
                        "{}{query_suffix}",
                        normalize_path(&path.display().to_string())
                    )),
                    None => Err(Error::Resolve {
                        specifier: url.to_string(),
                        importer: None,
                    }),
                }
            }
        }
    }

    fn load_module(&self, id: &str) -> Result<String> {
        if let Some(loaded) = self.container.load(id).map_err(|e| e.into_core(id))? {
            return Ok(loaded.code);
        }
        if is_virtual_id(id) {
            return Err(Error::Resolve {
                specifier: wrap_virtual_id(id),
                importer: None,
            });
        }
        let path = Path::new(clean_url(id));
        match ufs::read_source_lossy(path) {
            Ok(code) => Ok(code),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::Resolve {
                specifier: id.to_string(),
                importer: None,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Decide the rewrite for one import specifier.
    fn rewrite_specifier(
        &self,
        specifier: &str,
        kind: ImportKind,
        importer_dir: &Path,
        importer_url: &str,
        error: &mut Option<Error>,
        reoptimized: &mut bool,
    ) -> Rewrite {
        if error.is_some() {
            return Rewrite::Keep;
        }

        if specifier.starts_with('\0')
            || specifier == CLIENT_PATH
            || specifier.starts_with("/@fs/")
            || specifier.starts_with("/@id/")
        {
            return Rewrite::Keep;
        }
        if specifier.starts_with("node:")
            || specifier.starts_with("data:")
            || specifier.starts_with("http:")
            || specifier.starts_with("https:")
        {
            return Rewrite::Keep;
        }

        if specifier.starts_with("./") || specifier.starts_with("../") {
            return match self.resolve_relative(specifier, importer_dir) {
                Some(target_url) => Rewrite::Url(self.finalize_url(target_url)),
                None => {
                    *error = Some(Error::Resolve {
                        specifier: specifier.to_string(),
                        importer: Some(importer_url.to_string()),
                    });
                    Rewrite::Keep
                }
            };
        }

        if specifier.starts_with('/') {
            return Rewrite::Url(self.finalize_url(specifier.to_string()));
        }

        // Plugins (aliases, virtual modules) see the specifier before the
        // bare-import machinery does.
        match self.container.resolve_id(specifier, Some(importer_url)) {
            Ok(ResolveOutcome::Resolved(resolved)) => {
                if resolved.external {
                    return Rewrite::Keep;
                }
                if is_virtual_id(&resolved.id) {
                    return Rewrite::Url(wrap_virtual_id(&resolved.id));
                }
                let url = self.url_for_abs_path(Path::new(&resolved.id));
                return Rewrite::Url(self.finalize_url(url));
            }
            Ok(ResolveOutcome::NotResolved) => {}
            Err(e) => {
                *error = Some(e.into_core(specifier));
                return Rewrite::Keep;
            }
        }

        match self.optimizer.ensure_registered(specifier) {
            Ok((DepRequest::Optimized { url, needs_interop }, ran)) => {
                *reoptimized |= ran;
                if needs_interop && kind == ImportKind::Static {
                    Rewrite::Interop { url }
                } else {
                    Rewrite::Url(url)
                }
            }
            Ok((DepRequest::Excluded, _)) => Rewrite::Keep,
            Err(e) => {
                *error = Some(e);
                Rewrite::Keep
            }
        }
    }

    /// Resolve a relative specifier against the importer's directory into
    /// a served URL (without markers or timestamps).
    fn resolve_relative(&self, specifier: &str, importer_dir: &Path) -> Option<String> {
        let joined = lexical_join(importer_dir, specifier);
        let path = resolve_file(&joined)?;
        Some(self.url_for_abs_path(&path))
    }

    /// Accept targets (`hot.accept('./dep')`) resolve like relative
    /// imports; root-relative specifiers pass through.
    fn resolve_accept_target(&self, specifier: &str, importer_dir: &Path) -> Option<String> {
        if specifier.starts_with('/') {
            return Some(self.with_type_marker(specifier.to_string()));
        }
        self.resolve_relative(specifier, importer_dir)
            .map(|url| self.with_type_marker(url))
    }

    /// Root-relative URL when the path sits under the root, `/@fs/`
    /// otherwise.
    fn url_for_abs_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) => format!("/{}", normalize_path(&rel.display().to_string())),
            Err(_) => crate::paths::fs_path_to_url(path),
        }
    }

    fn with_type_marker(&self, url: String) -> String {
        if is_css_path(&url) || is_asset_path(&url) {
            inject_query(&url, "import")
        } else {
            url
        }
    }

    /// Attach the `?import` marker for CSS/assets and the importee's HMR
    /// timestamp so stale browser caches miss after an update.
    fn finalize_url(&self, url: String) -> String {
        let marked = self.with_type_marker(url);
        match self.graph.get_module_by_url(&marked) {
            Some(dep) => {
                let t = self.graph.last_hmr_timestamp(dep);
                if t > 0 {
                    inject_query(&marked, &format!("t={t}"))
                } else {
                    marked
                }
            }
            None => marked,
        }
    }

    /// Materialize a graph node for a rewritten dependency URL.
    fn ensure_dep_entry(&self, dep_url: &str) -> ModuleId {
        let canonical = ModuleGraph::canonical_url(dep_url);
        let resolved_id = if let Some(id) = unwrap_virtual_url(&canonical) {
            id
        } else if let Some(path) = fs_url_to_path(&canonical) {
            let query = query_of(&canonical)
                .map(|q| format!("?{q}"))
                .unwrap_or_default();
            format!("{}{query}", normalize_path(&path.display().to_string()))
        } else {
            let query = query_of(&canonical)
                .map(|q| format!("?{q}"))
                .unwrap_or_default();
            let rel = clean_url(&canonical).trim_start_matches('/');
            format!(
                "{}{query}",
                normalize_path(&self.root.join(rel).display().to_string())
            )
        };
        self.graph.ensure_entry_from_url(&canonical, &resolved_id)
    }
}

fn finish(code: String, map: Option<String>, deps: Vec<String>) -> TransformResult {
    let mut etag_hash = hash::content_hash(code.as_bytes());
    etag_hash.truncate(16);
    TransformResult {
        etag: format!("W/\"{etag_hash}\""),
        code,
        map,
        deps,
    }
}

/// Resolve a path to a file: exact, then with extensions, then as a
/// directory with an index file.
fn resolve_file(candidate: &Path) -> Option<PathBuf> {
    if candidate.is_file() {
        return Some(candidate.to_path_buf());
    }
    for ext in RESOLVE_EXTENSIONS {
        let with_ext = PathBuf::from(format!("{}{ext}", candidate.display()));
        if with_ext.is_file() {
            return Some(with_ext);
        }
    }
    for index in INDEX_FILES {
        let index_path = candidate.join(index);
        if index_path.is_file() {
            return Some(index_path);
        }
    }
    None
}

/// Join and normalize without touching the filesystem, so `../` segments
/// collapse even for not-yet-existing files.
fn lexical_join(base: &Path, relative: &str) -> PathBuf {
    let mut parts: Vec<std::ffi::OsString> = base
        .components()
        .map(|c| c.as_os_str().to_os_string())
        .collect();
    for segment in relative.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other.into()),
        }
    }
    parts.iter().collect()
}

/// Wrap CSS as a JS module that installs a `<style>` tag and accepts its
/// own updates.
fn css_to_js_module(url: &str, css: &str) -> String {
    let escaped = css
        .replace('\\', "\\\\")
        .replace('`', "\\`")
        .replace("${", "\\${");

    format!(
        "{preamble}const __baily_css = `{escaped}`;\n\
const __baily_style = document.createElement('style');\n\
__baily_style.setAttribute('data-baily-dev-id', {url:?});\n\
__baily_style.textContent = __baily_css;\n\
document.head.appendChild(__baily_style);\n\
if (import.meta.hot) {{\n\
  import.meta.hot.accept();\n\
  import.meta.hot.dispose(() => {{\n\
    __baily_style.remove();\n\
  }});\n\
}}\n\
export default __baily_css;\n",
        preamble = hot_preamble(&ModuleGraph::canonical_url(url)),
        url = clean_url(url),
    )
}
