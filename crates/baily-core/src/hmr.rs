//! HMR engine: turns a coalesced file-system change into the minimal set
//! of wire updates, or a full reload when no boundary exists.
//!
//! Propagation walks the module graph upward from each changed module,
//! collecting the nearest importers that accept the change. A walk that
//! exits the graph without an accept degrades the whole batch to a
//! `full-reload`.

use crate::graph::{ModuleGraph, ModuleId, ModuleType};
use crate::paths::normalize_path;
use crate::plugin::{HotUpdateContext, PluginContainer};
use crate::ws::HmrChannel;
use baily_proto::{HmrPayload, Update, UpdateKind};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Kind of watcher event, post-coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Add,
    Change,
    Unlink,
}

/// Stylesheet URLs the HTML rewriter has seen in `<link>` tags. A change
/// to one of these is a `css-update` even when no JS module imports it.
#[derive(Debug, Default)]
pub struct CssLinks {
    set: RwLock<HashSet<String>>,
}

impl CssLinks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, url: &str) {
        self.set.write().unwrap().insert(url.to_string());
    }

    #[must_use]
    pub fn contains(&self, url: &str) -> bool {
        self.set.read().unwrap().contains(url)
    }
}

/// A module that handles a change, plus the changed module it accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    pub boundary: ModuleId,
    pub accepted_via: ModuleId,
}

/// Outcome of one propagation walk.
#[derive(Debug, Clone, PartialEq)]
pub enum Propagation {
    Boundaries(Vec<Boundary>),
    FullReload,
}

/// Walk importers upward from `changed` collecting accepting boundaries.
///
/// A self-accepting module is its own boundary and stops the walk there.
/// An importer that declared the changed module in its accepted deps is a
/// boundary for it. Reaching a module with no importers (or exhausting a
/// cycle) without an accept means no boundary exists.
#[must_use]
pub fn propagate_update(graph: &ModuleGraph, changed: ModuleId) -> Propagation {
    let mut boundaries = Vec::new();
    let mut visited = HashSet::new();
    let mut queue = vec![changed];

    while let Some(module) = queue.pop() {
        if !visited.insert(module) {
            continue;
        }

        // CSS replaces safely in place, so a stylesheet is always its own
        // boundary even without an explicit registration.
        if graph.has_hmr_registration(module) || graph.kind_of(module) == ModuleType::Css {
            boundaries.push(Boundary {
                boundary: module,
                accepted_via: module,
            });
            continue;
        }

        let importers = graph.importers_of(module);
        if importers.is_empty() {
            return Propagation::FullReload;
        }

        for importer in importers {
            if graph.accepts_dep(importer, module) {
                boundaries.push(Boundary {
                    boundary: importer,
                    accepted_via: module,
                });
            } else {
                queue.push(importer);
            }
        }
    }

    if boundaries.is_empty() {
        // Only cycles were reachable: nothing accepted the change.
        Propagation::FullReload
    } else {
        Propagation::Boundaries(boundaries)
    }
}

/// The per-server HMR engine. Driven by the watcher task.
pub struct HmrEngine {
    graph: Arc<ModuleGraph>,
    container: Arc<PluginContainer>,
    channel: Arc<HmrChannel>,
    css_links: Arc<CssLinks>,
    root: PathBuf,
    full_reload_patterns: Vec<String>,
}

impl HmrEngine {
    #[must_use]
    pub fn new(
        graph: Arc<ModuleGraph>,
        container: Arc<PluginContainer>,
        channel: Arc<HmrChannel>,
        css_links: Arc<CssLinks>,
        root: PathBuf,
        full_reload_patterns: Vec<String>,
    ) -> Self {
        Self {
            graph,
            container,
            channel,
            css_links,
            root,
            full_reload_patterns,
        }
    }

    /// Root-relative URL of an absolute file path.
    fn url_of_file(&self, file: &Path) -> Option<String> {
        file.strip_prefix(&self.root)
            .ok()
            .map(|rel| format!("/{}", normalize_path(&rel.display().to_string())))
    }

    /// Handle one coalesced file event. Hook errors are caught, logged and
    /// delivered to the client overlay.
    pub fn on_file_event(&self, file: &Path, kind: FileEventKind) {
        let file_str = normalize_path(&file.display().to_string());
        debug!(file = %file_str, ?kind, "file event");

        let affected = self.graph.on_file_change(&file_str);
        let timestamp = self.graph.next_timestamp();

        // Deleted modules that lost their place in the graph get exactly
        // one prune notification; survivors propagate like a change.
        if kind == FileEventKind::Unlink {
            let fresh = self.graph.mark_pruned(&affected);
            if !fresh.is_empty() {
                let paths = fresh.iter().map(|&id| self.graph.url_of(id)).collect();
                self.channel.send(HmrPayload::Prune { paths });
            }
        }

        let modules: Vec<String> = affected.iter().map(|&id| self.graph.url_of(id)).collect();
        let ctx = HotUpdateContext {
            file: file_str.clone(),
            timestamp,
            modules,
        };

        let final_urls = match self.container.handle_hot_update(ctx) {
            Ok(urls) => urls,
            Err(e) => {
                warn!(error = %e, "handle_hot_update hook failed");
                self.channel.send(HmrPayload::Error {
                    err: crate::error::Error::Plugin {
                        plugin: e.plugin.clone(),
                        hook: e.hook,
                        id: file_str.clone(),
                        message: e.message.clone(),
                    }
                    .to_payload(),
                });
                return;
            }
        };

        if final_urls.is_empty() {
            self.handle_unmatched_file(&file_str, timestamp);
            return;
        }

        let mut updates = Vec::new();
        let mut seen = HashSet::new();
        for url in &final_urls {
            let Some(module) = self.graph.get_module_by_url(url) else {
                warn!(url = %url, "hot-update hook returned an unknown module");
                continue;
            };
            match propagate_update(&self.graph, module) {
                Propagation::FullReload => {
                    info!(file = %file_str, "no hmr boundary, full reload");
                    self.channel.send(HmrPayload::FullReload { path: None });
                    return;
                }
                Propagation::Boundaries(boundaries) => {
                    for b in boundaries {
                        let path = self.graph.url_of(b.boundary);
                        let accepted_path = self.graph.url_of(b.accepted_via);
                        if !seen.insert((path.clone(), accepted_path.clone())) {
                            continue;
                        }
                        self.graph.bump_hmr_timestamp(b.boundary, timestamp);
                        let kind = if self.graph.kind_of(b.accepted_via) == ModuleType::Css
                            && self.css_links.contains(&accepted_path)
                        {
                            UpdateKind::CssUpdate
                        } else {
                            UpdateKind::JsUpdate
                        };
                        updates.push(Update {
                            kind,
                            path,
                            accepted_path,
                            timestamp,
                            explicit_import_required: None,
                        });
                    }
                }
            }
        }

        if updates.is_empty() {
            return;
        }
        info!(count = updates.len(), file = %file_str, "hmr update");
        self.channel.send(HmrPayload::Update { updates });
    }

    /// A change with no affected modules: a `<link>` stylesheet updates in
    /// place, a reload-pattern file reloads the page, anything else is
    /// ignored.
    fn handle_unmatched_file(&self, file_str: &str, timestamp: u64) {
        let url = self.url_of_file(Path::new(file_str));

        if let Some(url) = &url {
            if self.css_links.contains(url) {
                info!(url = %url, "stylesheet update");
                self.channel.send(HmrPayload::Update {
                    updates: vec![Update {
                        kind: UpdateKind::CssUpdate,
                        path: url.clone(),
                        accepted_path: url.clone(),
                        timestamp,
                        explicit_import_required: None,
                    }],
                });
                return;
            }
        }

        if self
            .full_reload_patterns
            .iter()
            .any(|p| file_str.ends_with(p.as_str()))
        {
            info!(file = %file_str, "reload-pattern file changed, full reload");
            self.channel
                .send(HmrPayload::FullReload { path: url });
        }
    }
}
