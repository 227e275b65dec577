#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

//! baily-core: the dev-server transform + HMR engine.
//!
//! A request walks: HTTP middleware → [`transform::TransformPipeline`] →
//! [`plugin::PluginContainer`] hooks, with [`graph::ModuleGraph`] holding
//! the nodes and [`optimizer::DepOptimizer`] rewriting bare imports. A
//! file change walks: [`watch`] → [`hmr::HmrEngine`] → graph invalidation
//! → [`ws::HmrChannel`] → the embedded [`client`] runtime.

pub mod client;
pub mod config;
pub mod error;
pub mod graph;
pub mod hmr;
pub mod optimizer;
pub mod paths;
pub mod plugin;
pub mod rewrite;
pub mod server;
pub mod transform;
pub mod watch;
pub mod ws;

pub use config::{resolve_config, DevConfig, ResolvedConfig};
pub use error::{Error, Result};
pub use graph::{ModuleGraph, ModuleId, ModuleNode, ModuleType, TransformResult};
pub use hmr::{propagate_update, Boundary, CssLinks, FileEventKind, HmrEngine, Propagation};
pub use optimizer::{DepBundler, DepMetadata, DepOptimizer, DepRequest, FlatBundler};
pub use plugin::{Plugin, PluginContainer, PluginEnforce};
pub use server::{DevServer, ServerContext};
pub use transform::TransformPipeline;
pub use ws::HmrChannel;
