use crate::bus::{Event, EventBus};
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::transport::packet::Packet;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Callback for a socket event. Identity is the `Arc` allocation, so the same
/// handler registered twice is delivered once.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

pub fn handler(f: impl Fn(&Value) + Send + Sync + 'static) -> Handler {
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted
    Failed,
}

enum SessionEnd {
    Dropped { connected: bool },
    Shutdown,
}

/// The process-wide socket connection.
///
/// Events are dispatched on the reader task in arrival order. Handlers run
/// outside the registry lock, so they may add or remove handlers.
pub struct SocketClient {
    endpoint: String,
    reconnect_delay: Duration,
    reconnect_attempts: u32,
    handlers: Mutex<HashMap<String, Vec<Handler>>>,
    state: watch::Sender<ConnectionState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    bus: Arc<EventBus>,
}

impl SocketClient {
    pub fn new(config: &Config, bus: Arc<EventBus>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            endpoint: config.socket_endpoint(),
            reconnect_delay: config.reconnect_delay,
            reconnect_attempts: config.reconnect_attempts,
            handlers: Mutex::new(HashMap::new()),
            state,
            outgoing: Mutex::new(None),
            shutdown,
            task: Mutex::new(None),
            bus,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Register `handler` for `event`. Returns false if that exact handler
    /// was already registered.
    pub fn on(&self, event: &str, handler: Handler) -> bool {
        let mut handlers = self.handlers.lock();
        let list = handlers.entry(event.to_string()).or_default();
        if list.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            debug!("Handler for {} already registered", event);
            return false;
        }
        list.push(handler);
        debug!("Listening for {} ({} handlers)", event, list.len());
        true
    }

    /// Remove `handler` from `event`. Returns false if it wasn't registered.
    pub fn off(&self, event: &str, handler: &Handler) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|h| !Arc::ptr_eq(h, handler));
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event);
        }
        if removed {
            debug!("Stopped listening for {}", event);
        }
        removed
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.lock().get(event).map_or(0, Vec::len)
    }

    /// Deliver `payload` to the handlers of `event`. Returns how many ran.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let list: Vec<Handler> = self
            .handlers
            .lock()
            .get(event)
            .cloned()
            .unwrap_or_default();
        for h in &list {
            h(payload);
        }
        list.len()
    }

    /// Send an event to the server.
    pub fn emit(&self, event: &str, payload: Value) -> SyncResult<()> {
        let tx = self
            .outgoing
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Socket("not connected".into()))?;
        tx.send(Packet::event(event, payload).encode())
            .map_err(|_| SyncError::Socket("connection closed".into()))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for(&self, target: ConnectionState) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == target).await;
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Socket state {:?} -> {:?}", previous, state);
            self.bus.publish(Event::Connection(state));
        }
    }

    /// Start the connection supervisor. Calling it again while it runs is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.shutdown.send_replace(false);
        let client = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            client.run().await;
        }));
    }

    /// Close the connection and stop reconnecting.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Socket task ended abnormally: {}", e);
            }
        }
        *self.outgoing.lock() = None;
        info!("Socket closed");
    }

    async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(if failures == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });

            let connect = tokio::select! {
                res = tokio_tungstenite::connect_async(self.endpoint.as_str()) => res,
                _ = shutdown.changed() => break,
            };

            match connect {
                Ok((stream, _)) => {
                    debug!("WebSocket open to {}", self.endpoint);
                    match self.session(stream, &mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Dropped { connected } => {
                            warn!("Socket connection to {} lost", self.endpoint);
                            if connected {
                                failures = 0;
                            }
                        }
                    }
                }
                Err(e) => warn!("Socket connect to {} failed: {}", self.endpoint, e),
            }

            failures += 1;
            if failures > self.reconnect_attempts {
                error!(
                    "Giving up on {} after {} failed attempts",
                    self.endpoint, failures
                );
                self.set_state(ConnectionState::Failed);
                return;
            }

            self.set_state(ConnectionState::Reconnecting);
            tokio::select! {
                _ = sleep(self.reconnect_delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    async fn session(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let mut connected = false;
        let mut heartbeat = Duration::from_millis(45_000);
        let mut deadline = Instant::now() + heartbeat;

        let end = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::text(Packet::Disconnect.encode())).await;
                    let _ = write.close().await;
                    break SessionEnd::Shutdown;
                }
                _ = sleep_until(deadline) => {
                    warn!("No ping from server within {:?}", heartbeat);
                    break SessionEnd::Dropped { connected };
                }
                Some(text) = out_rx.recv() => {
                    if let Err(e) = write.send(Message::text(text)).await {
                        warn!("Socket write failed: {}", e);
                        break SessionEnd::Dropped { connected };
                    }
                }
                frame = read.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break SessionEnd::Dropped { connected },
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!("Socket read failed: {}", e);
                            break SessionEnd::Dropped { connected };
                        }
                    };

                    let packet = match Packet::decode(text.as_str()) {
                        Ok(packet) => packet,
                        Err(e) => {
                            warn!("Ignoring malformed packet: {}", e);
                            continue;
                        }
                    };

                    let reply = match packet {
                        Packet::Open(info) => {
                            debug!("Engine.IO session {} opened", info.sid);
                            heartbeat = Duration::from_millis(info.ping_interval + info.ping_timeout);
                            deadline = Instant::now() + heartbeat;
                            Some(Packet::Connect(None))
                        }
                        Packet::Ping => {
                            deadline = Instant::now() + heartbeat;
                            Some(Packet::Pong)
                        }
                        Packet::Connect(_) => {
                            connected = true;
                            *self.outgoing.lock() = Some(out_tx.clone());
                            self.set_state(ConnectionState::Connected);
                            info!("Socket connected to {}", self.endpoint);
                            None
                        }
                        Packet::Event { name, payload, .. } => {
                            let delivered = self.dispatch(&name, &payload);
                            debug!("Event {} delivered to {} handlers", name, delivered);
                            None
                        }
                        Packet::ConnectError(data) => {
                            warn!("Socket connect rejected: {}", data);
                            break SessionEnd::Dropped { connected };
                        }
                        Packet::Disconnect | Packet::Close => break SessionEnd::Dropped { connected },
                        Packet::Pong | Packet::Noop | Packet::Ack { .. } => None,
                    };

                    if let Some(reply) = reply {
                        if let Err(e) = write.send(Message::text(reply.encode())).await {
                            warn!("Socket write failed: {}", e);
                            break SessionEnd::Dropped { connected };
                        }
                    }
                }
            }
        };

        *self.outgoing.lock() = None;
        end
    }
}
