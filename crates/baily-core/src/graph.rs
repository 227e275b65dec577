//! In-memory module graph.
//!
//! One [`ModuleNode`] per distinct URL the server has observed, held in a
//! flat arena and addressed by [`ModuleId`] indices. Importer/importee
//! sets store indices, never references, so the mutual edges of the DAG
//! never form ownership cycles. Three index maps (by url, by resolved id,
//! by file) agree on node identity; a node with no file appears only in
//! the first two.

use crate::paths::{clean_url, is_virtual_id, remove_timestamp_query};
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable arena index of a module node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(usize);

/// Module classification for update payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleType {
    Js,
    Css,
}

impl ModuleType {
    /// Classify by extension of a URL or file path (query ignored).
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        if clean_url(path).ends_with(".css") {
            Self::Css
        } else {
            Self::Js
        }
    }
}

/// Cached output of the transform pipeline for one URL.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformResult {
    pub code: String,
    pub map: Option<String>,
    /// Import URLs discovered by import analysis.
    pub deps: Vec<String>,
    /// Content hash used for the HTTP `ETag`.
    pub etag: String,
}

/// One node per distinct URL.
#[derive(Debug)]
pub struct ModuleNode {
    /// Canonical URL as the browser sees it (base stripped, no timestamp).
    pub url: String,
    /// Resolved absolute file path with query, or a virtual id.
    pub id: String,
    /// Bare file path used for watcher matching. Virtual ids have none.
    pub file: Option<String>,
    pub kind: ModuleType,
    pub importers: HashSet<ModuleId>,
    pub imported_modules: HashSet<ModuleId>,
    /// Dependencies whose updates this module handles in place.
    pub accepted_hmr_deps: HashSet<ModuleId>,
    /// Export names accepted, or `None` for all.
    pub accepted_hmr_exports: Option<HashSet<String>>,
    pub is_self_accepting: bool,
    pub transform_result: Option<TransformResult>,
    /// Cached failure for the current invalidation generation.
    pub transform_error: Option<String>,
    /// Monotonic cache-buster appended as `?t=` when importers are rewritten.
    pub last_hmr_timestamp: u64,
    /// Non-zero marks the cached transform stale.
    pub last_invalidation_timestamp: u64,
    /// Set once the node has been reported in a `prune` payload.
    pub pruned: bool,
}

impl ModuleNode {
    fn new(url: String, id: String) -> Self {
        let file = if is_virtual_id(&id) {
            None
        } else {
            Some(clean_url(&id).to_string())
        };
        let kind = ModuleType::from_path(&url);
        Self {
            url,
            id,
            file,
            kind,
            importers: HashSet::new(),
            imported_modules: HashSet::new(),
            accepted_hmr_deps: HashSet::new(),
            accepted_hmr_exports: None,
            is_self_accepting: false,
            transform_result: None,
            transform_error: None,
            last_hmr_timestamp: 0,
            last_invalidation_timestamp: 0,
            pruned: false,
        }
    }
}

#[derive(Default)]
struct GraphInner {
    nodes: Vec<ModuleNode>,
    by_url: FxHashMap<String, ModuleId>,
    by_id: FxHashMap<String, ModuleId>,
    /// A file maps to every query variant that resolved to it.
    by_file: FxHashMap<String, Vec<ModuleId>>,
}

/// The process-wide module graph for one server instance.
///
/// All mutation goes through short write-lock critical sections; the
/// transform pipeline and HMR engine hold no lock across await points.
pub struct ModuleGraph {
    inner: RwLock<GraphInner>,
    /// Source of strictly monotonic HMR timestamps.
    clock: AtomicU64,
}

impl Default for ModuleGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleGraph {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(GraphInner::default()),
            clock: AtomicU64::new(0),
        }
    }

    /// Next update timestamp: wall-clock millis, but strictly greater than
    /// any previously issued value.
    pub fn next_timestamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .map_or(now, |prev| now.max(prev + 1))
    }

    /// Canonicalize a request URL for graph lookup: drop the timestamp
    /// query the client appends after HMR.
    #[must_use]
    pub fn canonical_url(url: &str) -> String {
        remove_timestamp_query(url)
    }

    /// Triple-index lookup after URL canonicalization.
    #[must_use]
    pub fn get_module_by_url(&self, url: &str) -> Option<ModuleId> {
        let canonical = Self::canonical_url(url);
        self.inner.read().unwrap().by_url.get(&canonical).copied()
    }

    #[must_use]
    pub fn get_module_by_id(&self, id: &str) -> Option<ModuleId> {
        self.inner.read().unwrap().by_id.get(id).copied()
    }

    /// All nodes (query variants included) backed by `file`.
    #[must_use]
    pub fn get_modules_by_file(&self, file: &str) -> Vec<ModuleId> {
        self.inner
            .read()
            .unwrap()
            .by_file
            .get(file)
            .cloned()
            .unwrap_or_default()
    }

    /// Create the node for `url` on miss and wire it into all indexes.
    /// Re-observing a pruned node revives it.
    pub fn ensure_entry_from_url(&self, url: &str, resolved_id: &str) -> ModuleId {
        let canonical = Self::canonical_url(url);
        let mut inner = self.inner.write().unwrap();

        if let Some(&existing) = inner.by_url.get(&canonical) {
            inner.nodes[existing.0].pruned = false;
            return existing;
        }

        let node = ModuleNode::new(canonical.clone(), resolved_id.to_string());
        let id = ModuleId(inner.nodes.len());
        inner.by_url.insert(canonical, id);
        inner.by_id.insert(node.id.clone(), id);
        if let Some(file) = &node.file {
            inner.by_file.entry(file.clone()).or_default().push(id);
        }
        inner.nodes.push(node);
        id
    }

    /// Record the import analysis of one module: diff importer edges,
    /// store HMR acceptance. Returns modules that lost their last importer
    /// through this update (prune candidates).
    pub fn update_module_info(
        &self,
        module: ModuleId,
        imported: &[ModuleId],
        accepted: &[ModuleId],
        accepted_exports: Option<HashSet<String>>,
        is_self_accepting: bool,
    ) -> Vec<ModuleId> {
        let mut inner = self.inner.write().unwrap();
        let new_set: HashSet<ModuleId> = imported.iter().copied().collect();

        let old_set = std::mem::take(&mut inner.nodes[module.0].imported_modules);
        let mut pruned = Vec::new();
        for old in &old_set {
            if !new_set.contains(old) {
                inner.nodes[old.0].importers.remove(&module);
                if inner.nodes[old.0].importers.is_empty() {
                    pruned.push(*old);
                }
            }
        }
        for &dep in &new_set {
            inner.nodes[dep.0].importers.insert(module);
        }

        let node = &mut inner.nodes[module.0];
        node.imported_modules = new_set;
        node.accepted_hmr_deps = accepted.iter().copied().collect();
        node.accepted_hmr_exports = accepted_exports;
        node.is_self_accepting = is_self_accepting;
        pruned
    }

    /// Invalidate a module and, transitively, every importer that does not
    /// accept it. `timestamp` becomes the invalidation generation marker.
    pub fn invalidate_module(&self, module: ModuleId, timestamp: u64) {
        let mut seen = HashSet::new();
        let mut inner = self.inner.write().unwrap();
        Self::invalidate_inner(&mut inner, module, timestamp, &mut seen);
    }

    fn invalidate_inner(
        inner: &mut GraphInner,
        module: ModuleId,
        timestamp: u64,
        seen: &mut HashSet<ModuleId>,
    ) {
        if !seen.insert(module) {
            return;
        }
        {
            let node = &mut inner.nodes[module.0];
            node.last_invalidation_timestamp = timestamp;
            // Importers rewrite this module's URL with the new timestamp,
            // so their next fetch bypasses the browser cache.
            node.last_hmr_timestamp = timestamp;
            node.transform_result = None;
            node.transform_error = None;
        }
        let importers: Vec<ModuleId> = inner.nodes[module.0].importers.iter().copied().collect();
        for importer in importers {
            // Only a declared dep-accept keeps the importer's cached
            // transform valid: the client re-imports the dependency alone.
            // A self-accepting importer re-executes itself, so it must be
            // recompiled to pick up the dependency's new timestamp.
            let accepts = inner.nodes[importer.0].accepted_hmr_deps.contains(&module);
            if !accepts {
                Self::invalidate_inner(inner, importer, timestamp, seen);
            }
        }
    }

    /// Look up every node backed by `file` and invalidate each.
    /// Returns the directly affected nodes.
    pub fn on_file_change(&self, file: &str) -> Vec<ModuleId> {
        let ids = self.get_modules_by_file(file);
        if ids.is_empty() {
            return ids;
        }
        let timestamp = self.next_timestamp();
        let mut seen = HashSet::new();
        let mut inner = self.inner.write().unwrap();
        for &id in &ids {
            Self::invalidate_inner(&mut inner, id, timestamp, &mut seen);
        }
        ids
    }

    // ------------------------------------------------------------------
    // Narrow accessors so callers never hold the lock themselves.
    // ------------------------------------------------------------------

    #[must_use]
    pub fn url_of(&self, id: ModuleId) -> String {
        self.inner.read().unwrap().nodes[id.0].url.clone()
    }

    #[must_use]
    pub fn resolved_id_of(&self, id: ModuleId) -> String {
        self.inner.read().unwrap().nodes[id.0].id.clone()
    }

    #[must_use]
    pub fn file_of(&self, id: ModuleId) -> Option<String> {
        self.inner.read().unwrap().nodes[id.0].file.clone()
    }

    #[must_use]
    pub fn kind_of(&self, id: ModuleId) -> ModuleType {
        self.inner.read().unwrap().nodes[id.0].kind
    }

    #[must_use]
    pub fn importers_of(&self, id: ModuleId) -> Vec<ModuleId> {
        let inner = self.inner.read().unwrap();
        let mut v: Vec<ModuleId> = inner.nodes[id.0].importers.iter().copied().collect();
        // Deterministic traversal order for stable update batches.
        v.sort_unstable();
        v
    }

    #[must_use]
    pub fn is_self_accepting(&self, id: ModuleId) -> bool {
        let inner = self.inner.read().unwrap();
        let node = &inner.nodes[id.0];
        node.is_self_accepting || node.accepted_hmr_exports.is_some()
    }

    /// Whether the module registered any HMR handler at all. A module that
    /// accepts dependency updates also handles a direct edit of itself:
    /// re-executing it re-imports everything below.
    #[must_use]
    pub fn has_hmr_registration(&self, id: ModuleId) -> bool {
        let inner = self.inner.read().unwrap();
        let node = &inner.nodes[id.0];
        node.is_self_accepting
            || node.accepted_hmr_exports.is_some()
            || !node.accepted_hmr_deps.is_empty()
    }

    /// Whether `importer` handles updates of `dep` in place.
    #[must_use]
    pub fn accepts_dep(&self, importer: ModuleId, dep: ModuleId) -> bool {
        self.inner.read().unwrap().nodes[importer.0]
            .accepted_hmr_deps
            .contains(&dep)
    }

    #[must_use]
    pub fn get_transform_result(&self, id: ModuleId) -> Option<TransformResult> {
        let inner = self.inner.read().unwrap();
        let node = &inner.nodes[id.0];
        if node.last_invalidation_timestamp > 0 {
            None
        } else {
            node.transform_result.clone()
        }
    }

    #[must_use]
    pub fn get_transform_error(&self, id: ModuleId) -> Option<String> {
        let inner = self.inner.read().unwrap();
        let node = &inner.nodes[id.0];
        if node.last_invalidation_timestamp > 0 {
            None
        } else {
            node.transform_error.clone()
        }
    }

    /// Store a fresh transform. Clears the invalidation marker: a non-null
    /// cached result implies generation 0.
    pub fn set_transform_result(&self, id: ModuleId, result: TransformResult) {
        let mut inner = self.inner.write().unwrap();
        let node = &mut inner.nodes[id.0];
        node.transform_result = Some(result);
        node.transform_error = None;
        node.last_invalidation_timestamp = 0;
    }

    /// Cache a pipeline failure for the current generation so retries
    /// within it re-throw instead of re-running the pipeline.
    pub fn set_transform_error(&self, id: ModuleId, message: String) {
        let mut inner = self.inner.write().unwrap();
        let node = &mut inner.nodes[id.0];
        node.transform_result = None;
        node.transform_error = Some(message);
        node.last_invalidation_timestamp = 0;
    }

    #[must_use]
    pub fn last_hmr_timestamp(&self, id: ModuleId) -> u64 {
        self.inner.read().unwrap().nodes[id.0].last_hmr_timestamp
    }

    /// Bump the HMR timestamp of a boundary. The cached transform stays:
    /// the client re-fetches with the new `?t=`, which simply misses the
    /// browser cache.
    pub fn bump_hmr_timestamp(&self, id: ModuleId, timestamp: u64) {
        let mut inner = self.inner.write().unwrap();
        inner.nodes[id.0].last_hmr_timestamp = timestamp;
    }

    #[must_use]
    pub fn last_invalidation_timestamp(&self, id: ModuleId) -> u64 {
        self.inner.read().unwrap().nodes[id.0].last_invalidation_timestamp
    }

    /// Mark nodes as reported pruned; returns the subset that had not been
    /// reported yet (so each unreachable module appears in exactly one
    /// `prune` payload).
    pub fn mark_pruned(&self, ids: &[ModuleId]) -> Vec<ModuleId> {
        let mut inner = self.inner.write().unwrap();
        let mut fresh = Vec::new();
        for &id in ids {
            let node = &mut inner.nodes[id.0];
            if !node.pruned && node.importers.is_empty() {
                node.pruned = true;
                fresh.push(id);
            }
        }
        fresh
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
