//! ---
//! ms_section: "05-networking-external-interfaces"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "WebSocket fan-out of diagnostic broadcasts."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
//! Every diagnostic message goes out as two WebSocket frames: a text frame
//! holding the JSON metadata, then the payload. Array payloads travel as a
//! binary frame of little-endian `f64` values, structured payloads as a
//! second text frame. Clients start out receiving every tag.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use ms_core::{BroadcastMessage, BroadcastSink, Payload, SinkError};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Fan-out point between the diagnostic publisher and connected clients.
#[derive(Clone)]
pub struct BroadcastHub {
    tx: broadcast::Sender<Arc<BroadcastMessage>>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<BroadcastMessage>> {
        self.tx.subscribe()
    }
}

impl BroadcastSink for BroadcastHub {
    /// Publishing with nobody connected is not an error.
    fn send(&self, message: BroadcastMessage) -> Result<(), SinkError> {
        match self.tx.send(Arc::new(message)) {
            Ok(reached) => debug!(reached, "broadcast queued"),
            Err(_) => debug!("broadcast dropped; no clients connected"),
        }
        Ok(())
    }
}

/// Builder for the WebSocket endpoint serving a [`BroadcastHub`].
#[derive(Clone)]
pub struct BroadcastServerBuilder {
    listen: SocketAddr,
    hub: BroadcastHub,
}

impl BroadcastServerBuilder {
    pub fn new(listen: SocketAddr, hub: BroadcastHub) -> Self {
        Self { listen, hub }
    }

    pub async fn spawn(self) -> anyhow::Result<BroadcastServerHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "broadcast hub listening");

        let app = Router::new()
            .route("/ws", get(upgrade_handler))
            .with_state(self.hub);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(err) = server.await {
                warn!(error = %err, "broadcast hub exited with error");
            }
        });

        Ok(BroadcastServerHandle {
            address: local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

pub struct BroadcastServerHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BroadcastServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await.map_err(|err| anyhow::anyhow!(err))
    }
}

/// Client request changing which tags it receives.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientCommand {
    Subscribe {
        #[serde(default)]
        tags: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        tags: Vec<String>,
    },
    UnsubscribeAll,
}

/// Per-client tag selection. `None` admits every tag.
#[derive(Debug, Default, PartialEq)]
struct TagFilter {
    only: Option<HashSet<String>>,
}

impl TagFilter {
    fn admits(&self, tag: &str) -> bool {
        self.only.as_ref().map_or(true, |tags| tags.contains(tag))
    }

    fn apply(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Subscribe { tags } => {
                self.only.get_or_insert_with(HashSet::new).extend(tags);
            }
            ClientCommand::Unsubscribe { tags } => {
                if let Some(only) = self.only.as_mut() {
                    for tag in &tags {
                        only.remove(tag);
                    }
                }
            }
            ClientCommand::UnsubscribeAll => self.only = None,
        }
    }
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(hub): State<BroadcastHub>,
) -> axum::response::Response {
    ws.on_upgrade(|socket| client_loop(socket, hub))
}

/// Metadata frame followed by payload frame.
fn frames(message: &BroadcastMessage) -> Option<[Message; 2]> {
    let metadata = match serde_json::to_string(&message.metadata) {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, tag = message.tag(), "failed to serialise broadcast metadata");
            return None;
        }
    };
    let payload = match &message.payload {
        Payload::Array(values) => Message::Binary(Payload::array_bytes(values)),
        Payload::Structured(value) => Message::Text(value.to_string()),
    };
    Some([Message::Text(metadata), payload])
}

async fn client_loop(mut socket: WebSocket, hub: BroadcastHub) {
    let mut subscription = hub.subscribe();
    let mut filter = TagFilter::default();

    loop {
        let keep = tokio::select! {
            received = subscription.recv() => match received {
                Ok(message) if filter.admits(message.tag()) => forward(&mut socket, &message).await,
                Ok(_) => true,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "diagnostic subscriber fell behind");
                    true
                }
                Err(broadcast::error::RecvError::Closed) => false,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(frame)) => on_client_frame(&mut socket, frame, &mut filter).await,
                _ => false,
            },
        };
        if !keep {
            break;
        }
    }
    debug!("broadcast client disconnected");
}

/// Send one message; false once the client is gone.
async fn forward(socket: &mut WebSocket, message: &BroadcastMessage) -> bool {
    let Some(frames) = frames(message) else {
        return true;
    };
    for frame in frames {
        if socket.send(frame).await.is_err() {
            return false;
        }
    }
    true
}

async fn on_client_frame(socket: &mut WebSocket, frame: Message, filter: &mut TagFilter) -> bool {
    let reply = match frame {
        Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
            Ok(command) => {
                debug!(?command, "tag selection changed");
                filter.apply(command);
                return true;
            }
            Err(err) => {
                warn!(error = %err, "rejected tag selection request");
                r#"{"error":"expected subscribe, unsubscribe or unsubscribe_all"}"#
            }
        },
        Message::Binary(_) => r#"{"error":"send tag selections as text"}"#,
        Message::Ping(payload) => return socket.send(Message::Pong(payload)).await.is_ok(),
        Message::Pong(_) => return true,
        Message::Close(_) => return false,
    };
    socket.send(Message::Text(reply.into())).await.is_ok()
}
