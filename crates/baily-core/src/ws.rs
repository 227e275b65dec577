//! Server side of the HMR message channel.
//!
//! One broadcast bus per server; every accepted WebSocket forwards the bus
//! in FIFO order, so update batches reach each client in the order the
//! server enqueued them. Connections are accepted only with the
//! `vite-hmr` subprotocol and greeted with `connected`.

use axum::extract::ws::{Message, WebSocket};
use baily_proto::HmrPayload;
use futures::{SinkExt, StreamExt};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Close a connection after this many malformed messages.
const MAX_PROTOCOL_FAILURES: u32 = 5;

/// A connection that has not pinged within this window is closed.
const KEEP_ALIVE: Duration = Duration::from_secs(60);

type CustomListener = Arc<dyn Fn(Option<serde_json::Value>) + Send + Sync>;

/// Broadcast bus between the server and every connected client.
pub struct HmrChannel {
    tx: broadcast::Sender<HmrPayload>,
    clients: AtomicUsize,
    /// An error emitted before any client connected is flushed to the
    /// first connection.
    buffered_error: Mutex<Option<HmrPayload>>,
    listeners: RwLock<FxHashMap<String, Vec<CustomListener>>>,
}

impl Default for HmrChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl HmrChannel {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            tx,
            clients: AtomicUsize::new(0),
            buffered_error: Mutex::new(None),
            listeners: RwLock::new(FxHashMap::default()),
        }
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    /// Broadcast a payload to every connected client. An error payload
    /// with no client connected is buffered for the first connection.
    pub fn send(&self, payload: HmrPayload) {
        if self.client_count() == 0 && matches!(payload, HmrPayload::Error { .. }) {
            *self.buffered_error.lock().unwrap() = Some(payload);
            return;
        }
        let _ = self.tx.send(payload);
    }

    /// Subscribe to the raw payload bus (server-side observers, tests).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HmrPayload> {
        self.tx.subscribe()
    }

    /// Register a server-side listener for client `custom` events.
    pub fn on(&self, event: impl Into<String>, listener: CustomListener) {
        self.listeners
            .write()
            .unwrap()
            .entry(event.into())
            .or_default()
            .push(listener);
    }

    fn dispatch_custom(&self, event: &str, data: Option<serde_json::Value>) {
        let listeners = self.listeners.read().unwrap();
        if let Some(list) = listeners.get(event) {
            for listener in list {
                listener(data.clone());
            }
        }
    }

    #[cfg(test)]
    fn take_buffered_error(&self) -> Option<HmrPayload> {
        self.buffered_error.lock().unwrap().take()
    }

    /// Drive one accepted connection until it closes.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let mut rx = self.tx.subscribe();
        let (mut sink, mut stream) = socket.split();

        // Greeting, then any error that predates the connection.
        if sink
            .send(Message::Text(HmrPayload::Connected.to_json()))
            .await
            .is_err()
        {
            return;
        }
        let pending = self.buffered_error.lock().unwrap().take();
        if let Some(error) = pending {
            let _ = sink.send(Message::Text(error.to_json())).await;
        }

        self.clients.fetch_add(1, Ordering::Relaxed);
        debug!(clients = self.client_count(), "hmr client connected");

        let mut failures = 0u32;
        let mut keep_alive = tokio::time::interval(KEEP_ALIVE);
        keep_alive.reset();
        let mut pinged_in_window = true;

        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    match outgoing {
                        Ok(payload) => {
                            if sink.send(Message::Text(payload.to_json())).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // A slow client lost intermediate batches; its
                            // graph state is unknown, so reload it.
                            warn!(skipped, "hmr client lagged, forcing reload");
                            let reload = HmrPayload::FullReload { path: None };
                            if sink.send(Message::Text(reload.to_json())).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match HmrPayload::from_json(&text) {
                                Ok(HmrPayload::Ping) => {
                                    pinged_in_window = true;
                                    let _ = sink
                                        .send(Message::Text(HmrPayload::Ping.to_json()))
                                        .await;
                                }
                                Ok(HmrPayload::Custom { event, data }) => {
                                    self.dispatch_custom(&event, data);
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    failures += 1;
                                    debug!(error = %e, failures, "malformed hmr message");
                                    if failures >= MAX_PROTOCOL_FAILURES {
                                        break;
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    }
                }

                _ = keep_alive.tick() => {
                    if !pinged_in_window {
                        debug!("hmr client missed keep-alive, closing");
                        break;
                    }
                    pinged_in_window = false;
                }
            }
        }

        self.clients.fetch_sub(1, Ordering::Relaxed);
        debug!(clients = self.client_count(), "hmr client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baily_proto::{Update, UpdateKind};

    fn js_update(path: &str, t: u64) -> HmrPayload {
        HmrPayload::Update {
            updates: vec![Update {
                kind: UpdateKind::JsUpdate,
                path: path.to_string(),
                accepted_path: path.to_string(),
                timestamp: t,
                explicit_import_required: None,
            }],
        }
    }

    #[test]
    fn test_error_buffered_until_first_client() {
        let channel = HmrChannel::new();
        let error = HmrPayload::Error {
            err: baily_proto::ErrorPayload {
                code: "TRANSFORM_FAILED".to_string(),
                message: "boom".to_string(),
                ..Default::default()
            },
        };
        channel.send(error.clone());
        assert_eq!(channel.take_buffered_error(), Some(error));
    }

    #[test]
    fn test_non_error_payloads_dropped_without_clients() {
        let channel = HmrChannel::new();
        channel.send(js_update("/src/a.js", 1));
        assert_eq!(channel.take_buffered_error(), None);
    }

    #[tokio::test]
    async fn test_bus_preserves_order_per_subscriber() {
        let channel = HmrChannel::new();
        let mut rx = channel.subscribe();

        channel.send(js_update("/src/a.js", 1));
        channel.send(js_update("/src/b.js", 2));
        channel.send(HmrPayload::FullReload { path: None });

        assert_eq!(rx.recv().await.unwrap(), js_update("/src/a.js", 1));
        assert_eq!(rx.recv().await.unwrap(), js_update("/src/b.js", 2));
        assert_eq!(
            rx.recv().await.unwrap(),
            HmrPayload::FullReload { path: None }
        );
    }

    #[test]
    fn test_custom_listener_dispatch() {
        let channel = HmrChannel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        channel.on(
            "my-event",
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::Relaxed);
            }),
        );

        channel.dispatch_custom("my-event", None);
        channel.dispatch_custom("other-event", None);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
