#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Wire protocol types for the baily HMR message channel.
//!
//! This crate defines the payloads exchanged between the dev server and
//! connected browser clients.
//!
//! ## Wire format
//! Messages are JSON text frames over a WebSocket connection negotiated
//! with the `vite-hmr` subprotocol. Every payload carries a `type` tag;
//! field names are camelCase to match what the client runtime reads.

use serde::{Deserialize, Serialize};

/// Protocol schema version. Bump when changing message format.
pub const PROTO_SCHEMA_VERSION: u32 = 1;

/// WebSocket subprotocol token the client must offer.
pub const HMR_SUBPROTOCOL: &str = "vite-hmr";

/// Error codes carried in structured error payloads.
pub mod codes {
    pub const RESOLVE_FAILED: &str = "RESOLVE_FAILED";
    pub const TRANSFORM_FAILED: &str = "TRANSFORM_FAILED";
    pub const OPTIMIZE_FAILED: &str = "OPTIMIZE_FAILED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// A server → client payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HmrPayload {
    /// Sent once immediately after a connection is accepted.
    Connected,
    /// A batch of hot updates. The client applies them in list order.
    Update { updates: Vec<Update> },
    /// Instruct the client to reload the page. `path` restricts the reload
    /// to clients currently on that page.
    FullReload {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// Listed modules are no longer reachable; the client runs their
    /// dispose callbacks and drops their registrations.
    Prune { paths: Vec<String> },
    /// A structured error for the client overlay.
    Error { err: ErrorPayload },
    /// A user-defined event, forwarded verbatim.
    Custom {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    /// Keep-alive. Clients send this periodically; the server echoes it.
    Ping,
}

/// One hot update inside an [`HmrPayload::Update`] batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    /// `js-update` or `css-update`.
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    /// URL of the boundary module that handles the update.
    pub path: String,
    /// URL of the changed module the boundary accepted.
    pub accepted_path: String,
    /// Server-issued monotonic timestamp, used as the cache-busting query.
    pub timestamp: u64,
    /// Set when the update only applies if the module was imported
    /// explicitly (e.g. a raw CSS request vs. a `<link>` tag).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explicit_import_required: Option<bool>,
}

/// Kind of a single hot update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    #[serde(rename = "js-update")]
    JsUpdate,
    #[serde(rename = "css-update")]
    CssUpdate,
}

/// Structured error body for [`HmrPayload::Error`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Stable error code from [`codes`].
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Stack trace, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// File the error originated in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Source excerpt around the failing location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
}

impl HmrPayload {
    /// Serialize to the JSON text sent over the socket.
    ///
    /// # Panics
    /// Never panics: every variant serializes.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("payload serializes")
    }

    /// Parse a client message.
    ///
    /// # Errors
    /// Returns the underlying serde error for malformed input; the caller
    /// decides whether to ignore or close.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_wire_shape() {
        assert_eq!(HmrPayload::Connected.to_json(), r#"{"type":"connected"}"#);
    }

    #[test]
    fn test_js_update_wire_shape() {
        let payload = HmrPayload::Update {
            updates: vec![Update {
                kind: UpdateKind::JsUpdate,
                path: "/src/a.js".to_string(),
                accepted_path: "/src/a.js".to_string(),
                timestamp: 42,
                explicit_import_required: None,
            }],
        };
        assert_eq!(
            payload.to_json(),
            r#"{"type":"update","updates":[{"type":"js-update","path":"/src/a.js","acceptedPath":"/src/a.js","timestamp":42}]}"#
        );
    }

    #[test]
    fn test_css_update_wire_shape() {
        let payload = HmrPayload::Update {
            updates: vec![Update {
                kind: UpdateKind::CssUpdate,
                path: "/src/styles.css".to_string(),
                accepted_path: "/src/styles.css".to_string(),
                timestamp: 7,
                explicit_import_required: None,
            }],
        };
        assert!(payload.to_json().contains(r#""type":"css-update""#));
    }

    #[test]
    fn test_full_reload_wire_shape() {
        assert_eq!(
            HmrPayload::FullReload { path: None }.to_json(),
            r#"{"type":"full-reload"}"#
        );
        assert_eq!(
            HmrPayload::FullReload {
                path: Some("/admin/".to_string())
            }
            .to_json(),
            r#"{"type":"full-reload","path":"/admin/"}"#
        );
    }

    #[test]
    fn test_prune_wire_shape() {
        let payload = HmrPayload::Prune {
            paths: vec!["/src/dead.js".to_string()],
        };
        assert_eq!(
            payload.to_json(),
            r#"{"type":"prune","paths":["/src/dead.js"]}"#
        );
    }

    #[test]
    fn test_ping_round_trip() {
        let parsed = HmrPayload::from_json(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(parsed, HmrPayload::Ping);
    }

    #[test]
    fn test_custom_round_trip() {
        let payload = HmrPayload::Custom {
            event: "my-event".to_string(),
            data: Some(serde_json::json!({"n": 1})),
        };
        let parsed = HmrPayload::from_json(&payload.to_json()).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_error_payload_skips_empty_fields() {
        let payload = HmrPayload::Error {
            err: ErrorPayload {
                code: codes::TRANSFORM_FAILED.to_string(),
                message: "unexpected token".to_string(),
                ..Default::default()
            },
        };
        let json = payload.to_json();
        assert!(json.contains(r#""code":"TRANSFORM_FAILED""#));
        assert!(!json.contains("stack"));
        assert!(!json.contains("frame"));
    }

    #[test]
    fn test_malformed_input_is_error() {
        assert!(HmrPayload::from_json("{not json").is_err());
        assert!(HmrPayload::from_json(r#"{"type":"no-such-type"}"#).is_err());
    }
}
