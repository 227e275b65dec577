//! Rollup-style plugin pipeline.
//!
//! Plugins supply a record of optional hooks; the container composes them
//! into hook-specific ordered chains: pre plugins, then normal, then post,
//! stable within each band. The container caches nothing; caching belongs
//! to the module graph and the transform pipeline.

use crate::config::ResolvedConfig;
use crate::error::Error;
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Result type for plugin hooks.
pub type HookResult<T> = Result<T, PluginError>;

/// Error from a plugin hook.
#[derive(Debug)]
pub struct PluginError {
    /// Plugin name that caused the error.
    pub plugin: String,
    /// Hook that failed.
    pub hook: &'static str,
    /// Error message.
    pub message: String,
}

impl PluginError {
    #[must_use]
    pub fn new(plugin: &str, hook: &'static str, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.to_string(),
            hook,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.plugin, self.hook, self.message)
    }
}

impl std::error::Error for PluginError {}

impl PluginError {
    /// Attach the module id the pipeline was working on.
    #[must_use]
    pub fn into_core(self, id: &str) -> Error {
        Error::Plugin {
            plugin: self.plugin,
            hook: self.hook,
            id: id.to_string(),
            message: self.message,
        }
    }
}

/// Context shared by all hooks of one container.
#[derive(Debug, Default)]
pub struct PluginContext {
    /// Project root.
    pub root: PathBuf,
    /// Metadata for inter-plugin communication.
    meta: std::sync::RwLock<FxHashMap<String, String>>,
}

impl PluginContext {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            meta: std::sync::RwLock::new(FxHashMap::default()),
        }
    }

    pub fn set_meta(&self, key: &str, value: String) {
        self.meta.write().unwrap().insert(key.to_string(), value);
    }

    #[must_use]
    pub fn get_meta(&self, key: &str) -> Option<String> {
        self.meta.read().unwrap().get(key).cloned()
    }
}

/// Outcome of a `resolve_id` chain. Unresolved specifiers are ordinary
/// data, not errors; only genuine failures travel as [`PluginError`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    Resolved(PartialResolvedId),
    NotResolved,
}

/// A resolved module id.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResolvedId {
    /// Resolved id: an absolute file path (plus query) or a virtual id
    /// beginning with a null byte.
    pub id: String,
    /// External modules are left alone by the pipeline.
    pub external: bool,
    /// Opaque plugin metadata carried alongside the id.
    pub meta: Option<serde_json::Value>,
}

impl PartialResolvedId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            external: false,
            meta: None,
        }
    }

    #[must_use]
    pub fn external(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            external: true,
            meta: None,
        }
    }
}

/// Result of a `load` hook.
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub code: String,
    pub map: Option<String>,
}

impl LoadResult {
    #[must_use]
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            map: None,
        }
    }
}

/// Result of a `transform` hook.
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub code: String,
    pub map: Option<String>,
}

impl TransformOutput {
    #[must_use]
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            map: None,
        }
    }
}

/// Plugin ordering band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PluginEnforce {
    /// Runs before normal plugins (e.g. alias resolution).
    Pre,
    #[default]
    Normal,
    /// Runs after normal plugins.
    Post,
}

/// Context for `handle_hot_update`.
#[derive(Debug, Clone)]
pub struct HotUpdateContext {
    /// The file that changed (absolute, forward-slash).
    pub file: String,
    /// Server timestamp of the change batch.
    pub timestamp: u64,
    /// URLs of modules currently considered affected. Later plugins see
    /// the list as left by earlier ones.
    pub modules: Vec<String>,
}

/// A middleware registered by `configure_server`. Runs before the internal
/// handlers; returning `Some` short-circuits the request.
pub struct ServerMiddleware {
    pub name: String,
    #[allow(clippy::type_complexity)]
    pub handler: Arc<dyn Fn(&str) -> Option<MiddlewareResponse> + Send + Sync>,
}

/// Response produced by a plugin middleware.
#[derive(Debug, Clone)]
pub struct MiddlewareResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

/// Mutable server setup handed to `configure_server`.
#[derive(Default)]
pub struct ServerSetup {
    pub middlewares: Vec<ServerMiddleware>,
}

/// The plugin trait. All hooks default to no-ops.
pub trait Plugin: Send + Sync {
    /// Plugin name for ordering diagnostics and error messages.
    fn name(&self) -> &str;

    /// Ordering band: `Pre`, `Normal` (default) or `Post`.
    fn enforce(&self) -> PluginEnforce {
        PluginEnforce::Normal
    }

    /// Called once with the final config before the server starts.
    fn config_resolved(&self, _config: &ResolvedConfig) -> HookResult<()> {
        Ok(())
    }

    /// Register middleware or other server-side behavior.
    fn configure_server(&self, _server: &mut ServerSetup) -> HookResult<()> {
        Ok(())
    }

    /// Resolve a specifier to an id. First `Resolved` outcome wins.
    fn resolve_id(
        &self,
        _specifier: &str,
        _importer: Option<&str>,
        _ctx: &PluginContext,
    ) -> HookResult<ResolveOutcome> {
        Ok(ResolveOutcome::NotResolved)
    }

    /// Provide source for an id. First `Some` wins.
    fn load(&self, _id: &str, _ctx: &PluginContext) -> HookResult<Option<LoadResult>> {
        Ok(None)
    }

    /// Transform source. Results chain: each plugin's output becomes the
    /// next plugin's input.
    fn transform(
        &self,
        _code: &str,
        _id: &str,
        _ctx: &PluginContext,
    ) -> HookResult<Option<TransformOutput>> {
        Ok(None)
    }

    /// Rewrite the list of modules affected by a file change. `Some(vec![])`
    /// short-circuits to "no update" for this file.
    fn handle_hot_update(&self, _ctx: &HotUpdateContext) -> HookResult<Option<Vec<String>>> {
        Ok(None)
    }

    /// Transform served HTML (chained like `transform`).
    fn transform_index_html(&self, _html: &str) -> HookResult<Option<String>> {
        Ok(None)
    }
}

/// Ordered plugin chain with a shared context.
pub struct PluginContainer {
    plugins: Vec<Box<dyn Plugin>>,
    ctx: PluginContext,
}

impl PluginContainer {
    /// Build a container. Plugins are stable-sorted into their enforce
    /// bands once, here; insertion order is preserved within a band.
    #[must_use]
    pub fn new(root: PathBuf, mut plugins: Vec<Box<dyn Plugin>>) -> Self {
        plugins.sort_by_key(|p| p.enforce());
        Self {
            plugins,
            ctx: PluginContext::new(root),
        }
    }

    #[must_use]
    pub fn context(&self) -> &PluginContext {
        &self.ctx
    }

    #[must_use]
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn config_resolved(&self, config: &ResolvedConfig) -> HookResult<()> {
        for plugin in &self.plugins {
            plugin.config_resolved(config)?;
        }
        Ok(())
    }

    pub fn configure_server(&self, server: &mut ServerSetup) -> HookResult<()> {
        for plugin in &self.plugins {
            plugin.configure_server(server)?;
        }
        Ok(())
    }

    /// Consult plugins in order; the first `Resolved` outcome wins.
    pub fn resolve_id(
        &self,
        specifier: &str,
        importer: Option<&str>,
    ) -> HookResult<ResolveOutcome> {
        for plugin in &self.plugins {
            if let ResolveOutcome::Resolved(resolved) =
                plugin.resolve_id(specifier, importer, &self.ctx)?
            {
                return Ok(ResolveOutcome::Resolved(resolved));
            }
        }
        Ok(ResolveOutcome::NotResolved)
    }

    /// Consult plugins in order; the first `Some` wins.
    pub fn load(&self, id: &str) -> HookResult<Option<LoadResult>> {
        for plugin in &self.plugins {
            if let Some(result) = plugin.load(id, &self.ctx)? {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    /// Chain `transform` through every plugin. The last map produced wins;
    /// intermediate maps are superseded rather than composed.
    pub fn transform(&self, code: &str, id: &str) -> HookResult<TransformOutput> {
        let mut current = TransformOutput::code(code);
        for plugin in &self.plugins {
            if let Some(output) = plugin.transform(&current.code, id, &self.ctx)? {
                current.code = output.code;
                if output.map.is_some() {
                    current.map = output.map;
                }
            }
        }
        Ok(current)
    }

    /// Run `handle_hot_update` through every plugin. Each plugin sees the
    /// current module list; an empty replacement stops the chain and means
    /// "no update".
    pub fn handle_hot_update(&self, mut ctx: HotUpdateContext) -> HookResult<Vec<String>> {
        for plugin in &self.plugins {
            if let Some(modules) = plugin.handle_hot_update(&ctx)? {
                if modules.is_empty() {
                    return Ok(Vec::new());
                }
                ctx.modules = modules;
            }
        }
        Ok(ctx.modules)
    }

    /// Chain `transform_index_html` through every plugin.
    pub fn transform_index_html(&self, html: &str) -> HookResult<String> {
        let mut current = html.to_string();
        for plugin in &self.plugins {
            if let Some(transformed) = plugin.transform_index_html(&current)? {
                current = transformed;
            }
        }
        Ok(current)
    }
}

// ============================================================================
// Built-in plugins
// ============================================================================

/// Maps import prefixes like `@/components` to directories.
pub struct AliasPlugin {
    aliases: Vec<(String, String)>,
}

impl AliasPlugin {
    #[must_use]
    pub fn new() -> Self {
        Self { aliases: Vec::new() }
    }

    #[must_use]
    pub fn alias(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.aliases.push((from.into(), to.into()));
        self
    }
}

impl Default for AliasPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for AliasPlugin {
    fn name(&self) -> &str {
        "baily:alias"
    }

    fn enforce(&self) -> PluginEnforce {
        PluginEnforce::Pre
    }

    fn resolve_id(
        &self,
        specifier: &str,
        _importer: Option<&str>,
        _ctx: &PluginContext,
    ) -> HookResult<ResolveOutcome> {
        for (from, to) in &self.aliases {
            if specifier == from {
                return Ok(ResolveOutcome::Resolved(PartialResolvedId::new(to)));
            }
            if let Some(rest) = specifier.strip_prefix(from) {
                if rest.starts_with('/') {
                    return Ok(ResolveOutcome::Resolved(PartialResolvedId::new(format!(
                        "{to}{rest}"
                    ))));
                }
            }
        }
        Ok(ResolveOutcome::NotResolved)
    }
}

/// Replaces global identifiers with values (e.g. `process.env.NODE_ENV`).
pub struct ReplacePlugin {
    replacements: FxHashMap<String, String>,
}

impl ReplacePlugin {
    #[must_use]
    pub fn new() -> Self {
        Self {
            replacements: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn replace(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.replacements.insert(from.into(), to.into());
        self
    }

    /// Replace `process.env.KEY` with a quoted value.
    #[must_use]
    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.replacements.insert(
            format!("process.env.{key}"),
            format!("\"{}\"", value.into()),
        );
        self
    }
}

impl Default for ReplacePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for ReplacePlugin {
    fn name(&self) -> &str {
        "baily:replace"
    }

    fn transform(
        &self,
        code: &str,
        _id: &str,
        _ctx: &PluginContext,
    ) -> HookResult<Option<TransformOutput>> {
        if self.replacements.is_empty() {
            return Ok(None);
        }
        let mut result = code.to_string();
        let mut changed = false;
        for (from, to) in &self.replacements {
            if result.contains(from.as_str()) {
                result = result.replace(from, to);
                changed = true;
            }
        }
        Ok(changed.then(|| TransformOutput::code(result)))
    }
}

/// Serves modules that do not exist on disk. Resolved ids carry the
/// null-byte prefix so the graph never stats or watches them.
pub struct VirtualPlugin {
    modules: FxHashMap<String, String>,
}

impl VirtualPlugin {
    #[must_use]
    pub fn new() -> Self {
        Self {
            modules: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn module(mut self, id: impl Into<String>, code: impl Into<String>) -> Self {
        self.modules.insert(id.into(), code.into());
        self
    }
}

impl Default for VirtualPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for VirtualPlugin {
    fn name(&self) -> &str {
        "baily:virtual"
    }

    fn resolve_id(
        &self,
        specifier: &str,
        _importer: Option<&str>,
        _ctx: &PluginContext,
    ) -> HookResult<ResolveOutcome> {
        let key = specifier.strip_prefix("virtual:").unwrap_or(specifier);
        if self.modules.contains_key(key) {
            return Ok(ResolveOutcome::Resolved(PartialResolvedId::new(format!(
                "\0virtual:{key}"
            ))));
        }
        Ok(ResolveOutcome::NotResolved)
    }

    fn load(&self, id: &str, _ctx: &PluginContext) -> HookResult<Option<LoadResult>> {
        if let Some(key) = id.strip_prefix("\0virtual:") {
            if let Some(code) = self.modules.get(key) {
                return Ok(Some(LoadResult::code(code)));
            }
        }
        Ok(None)
    }
}
