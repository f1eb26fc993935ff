//! Reconnecting WebSocket client
//!
//! Holds at most one live connection. [`ReconnectingSocket::get`] returns it,
//! opening a new one on demand; concurrent callers share a single connection
//! attempt. When the connection closes the slot is cleared and the next `get`
//! reconnects. There is no background reconnect.
//!
//! Lifecycle events go to listeners registered per [`EventKind`]; listeners run
//! in registration order. Errors are advisory; only [`SocketEvent::Closed`]
//! ends a connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

use crate::{Error, Result};

/// Connection lifecycle as reported to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        })
    }
}

/// Event categories listeners subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Message,
    Error,
    Close,
    ReadyStateChange,
}

/// Inbound frame payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

/// Close details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Whether a close handshake was received before the stream ended
    pub was_clean: bool,
    pub code: u16,
    pub reason: String,
}

/// Lifecycle event delivered to listeners
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Open(Connection),
    Message(Connection, Payload),
    Error(String),
    Closed(CloseInfo),
    ReadyStateChange(ReadyState),
}

impl SocketEvent {
    /// Category of this event
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Open(_) => EventKind::Open,
            Self::Message(..) => EventKind::Message,
            Self::Error(_) => EventKind::Error,
            Self::Closed(_) => EventKind::Close,
            Self::ReadyStateChange(_) => EventKind::ReadyStateChange,
        }
    }
}

enum Outbound {
    Frame(Message),
    Close,
}

/// Handle to one open connection
///
/// Sends are queued to the connection's writer task in call order.
#[derive(Clone)]
pub struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
    closing: Arc<AtomicBool>,
}

impl Connection {
    /// Queue a text frame
    ///
    /// # Errors
    ///
    /// Returns `Error::Socket` if the connection has already shut down
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.tx
            .send(Outbound::Frame(Message::Text(text.into())))
            .map_err(|_| Error::Socket("connection is closed".to_string()))
    }

    /// Queue a binary frame
    ///
    /// # Errors
    ///
    /// Returns `Error::Socket` if the connection has already shut down
    pub fn send_binary(&self, bytes: Vec<u8>) -> Result<()> {
        self.tx
            .send(Outbound::Frame(Message::Binary(bytes)))
            .map_err(|_| Error::Socket("connection is closed".to_string()))
    }

    /// Start the close handshake
    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
        let _ = self.tx.send(Outbound::Close);
    }

    /// Connection identifier, unique per socket client
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Current state of this connection
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        if self.tx.is_closed() {
            ReadyState::Closed
        } else if self.closing.load(Ordering::Acquire) {
            ReadyState::Closing
        } else {
            ReadyState::Open
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.ready_state())
            .finish()
    }
}

type ConnectResult = std::result::Result<Connection, String>;
type PendingConnect = Shared<BoxFuture<'static, ConnectResult>>;
type Listener = Arc<dyn Fn(&SocketEvent) + Send + Sync>;

enum Slot {
    Empty,
    Connecting(u64, PendingConnect),
    Open(Connection),
}

struct Inner {
    url: String,
    slot: Mutex<Slot>,
    listeners: Mutex<Vec<(u64, EventKind, Listener)>>,
    next_id: AtomicU64,
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(u64, EventKind, Listener)>> {
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn emit(&self, event: &SocketEvent) {
        let kind = event.kind();
        let matching: Vec<Listener> = self
            .listeners()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, l)| Arc::clone(l))
            .collect();
        for listener in matching {
            listener(event);
        }
    }

    fn clear_slot(&self, id: u64) {
        let mut slot = self.slot();
        let current = match &*slot {
            Slot::Connecting(sid, _) => Some(*sid),
            Slot::Open(conn) => Some(conn.id),
            Slot::Empty => None,
        };
        if current == Some(id) {
            *slot = Slot::Empty;
        }
    }
}

/// Lazily connecting, demand-reconnecting WebSocket client
#[derive(Clone)]
pub struct ReconnectingSocket {
    inner: Arc<Inner>,
}

impl ReconnectingSocket {
    /// Create a client for `url`; nothing connects until [`Self::get`]
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                slot: Mutex::new(Slot::Empty),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Target URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Return the open connection, connecting first if needed
    ///
    /// # Errors
    ///
    /// Returns `Error::Network` if the connection attempt fails; every caller
    /// waiting on that attempt gets the same error
    pub async fn get(&self) -> Result<Connection> {
        let pending = {
            let mut slot = self.inner.slot();
            match &*slot {
                Slot::Open(conn) => return Ok(conn.clone()),
                Slot::Connecting(_, pending) => pending.clone(),
                Slot::Empty => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let pending = connect(Arc::clone(&self.inner), id).boxed().shared();
                    *slot = Slot::Connecting(id, pending.clone());
                    pending
                }
            }
        };

        pending.await.map_err(Error::Network)
    }

    /// Start connecting in the background without waiting
    pub fn warm_up(&self) {
        let socket = self.clone();
        tokio::spawn(async move {
            if let Err(e) = socket.get().await {
                tracing::warn!(error = %e, "background connect failed");
            }
        });
    }

    /// Close the current connection
    ///
    /// Waits for a pending attempt to open before closing it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Socket` if there is no connection to close
    pub async fn close(&self) -> Result<()> {
        let pending = {
            let slot = self.inner.slot();
            match &*slot {
                Slot::Empty => return Err(Error::Socket("socket is already closed".to_string())),
                Slot::Connecting(_, pending) => Err(pending.clone()),
                Slot::Open(conn) => Ok(conn.clone()),
            }
        };

        let conn = match pending {
            Ok(conn) => conn,
            Err(pending) => pending.await.map_err(Error::Network)?,
        };

        tracing::debug!(id = conn.id, "closing socket");
        conn.close();
        self.inner
            .emit(&SocketEvent::ReadyStateChange(ReadyState::Closing));
        Ok(())
    }

    /// State of the current slot
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        match &*self.inner.slot() {
            Slot::Empty => ReadyState::Closed,
            Slot::Connecting(..) => ReadyState::Connecting,
            Slot::Open(conn) => conn.ready_state(),
        }
    }

    /// Register a listener for one event kind
    pub fn subscribe(
        &self,
        kind: EventKind,
        listener: impl Fn(&SocketEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners()
            .push((id, kind, Arc::new(listener)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Drop every listener
    pub fn unsubscribe_all(&self) {
        self.inner.listeners().clear();
    }

    /// Number of registered listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners().len()
    }
}

impl std::fmt::Debug for ReconnectingSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingSocket")
            .field("url", &self.inner.url)
            .field("state", &self.ready_state())
            .finish()
    }
}

/// Registration returned by [`ReconnectingSocket::subscribe`]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    /// Remove the listener
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners().retain(|(id, _, _)| *id != self.id);
        }
    }
}

async fn connect(inner: Arc<Inner>, id: u64) -> ConnectResult {
    inner.emit(&SocketEvent::ReadyStateChange(ReadyState::Connecting));
    tracing::debug!(url = %inner.url, id, "connecting");

    let ws = match tokio_tungstenite::connect_async(inner.url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            let message = format!("websocket connect failed: {e}");
            tracing::warn!(url = %inner.url, error = %e, "websocket connect failed");
            inner.clear_slot(id);
            inner.emit(&SocketEvent::Error(message.clone()));
            inner.emit(&SocketEvent::ReadyStateChange(ReadyState::Closed));
            return Err(message);
        }
    };

    let (sink, stream) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = Connection {
        id,
        tx,
        closing: Arc::new(AtomicBool::new(false)),
    };

    {
        let mut slot = inner.slot();
        if matches!(&*slot, Slot::Connecting(sid, _) if *sid == id) {
            *slot = Slot::Open(conn.clone());
        }
    }

    tokio::spawn(write_loop(Arc::downgrade(&inner), sink, rx));

    tracing::info!(url = %inner.url, id, "websocket opened");
    inner.emit(&SocketEvent::ReadyStateChange(ReadyState::Open));
    inner.emit(&SocketEvent::Open(conn.clone()));

    tokio::spawn(read_loop(Arc::clone(&inner), conn.clone(), stream));

    Ok(conn)
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn write_loop(
    inner: Weak<Inner>,
    mut sink: futures::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        let result = match out {
            Outbound::Frame(msg) => sink.send(msg).await,
            Outbound::Close => {
                let _ = sink.close().await;
                break;
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "websocket send failed");
            if let Some(inner) = inner.upgrade() {
                inner.emit(&SocketEvent::Error(format!("send failed: {e}")));
            }
        }
    }
}

async fn read_loop(inner: Arc<Inner>, conn: Connection, mut stream: futures::stream::SplitStream<WsStream>) {
    let mut close = CloseInfo {
        was_clean: false,
        code: 1006,
        reason: String::new(),
    };

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                inner.emit(&SocketEvent::Message(conn.clone(), Payload::Text(text)));
            }
            Ok(Message::Binary(bytes)) => {
                inner.emit(&SocketEvent::Message(conn.clone(), Payload::Binary(bytes)));
            }
            Ok(Message::Close(frame)) => {
                close = close_info(frame.as_ref());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(id = conn.id, error = %e, "websocket error");
                inner.emit(&SocketEvent::Error(e.to_string()));
                break;
            }
        }
    }

    inner.clear_slot(conn.id);
    // stop the writer; no-op if it already exited
    let _ = conn.tx.send(Outbound::Close);

    if close.was_clean {
        tracing::info!(id = conn.id, code = close.code, reason = %close.reason, "websocket closed cleanly");
    } else {
        tracing::warn!(id = conn.id, "websocket connection died");
    }
    inner.emit(&SocketEvent::ReadyStateChange(ReadyState::Closed));
    inner.emit(&SocketEvent::Closed(close));
}

fn close_info(frame: Option<&CloseFrame<'_>>) -> CloseInfo {
    frame.map_or(
        CloseInfo {
            was_clean: true,
            code: 1005,
            reason: String::new(),
        },
        |f| CloseInfo {
            was_clean: true,
            code: u16::from(f.code),
            reason: f.reason.to_string(),
        },
    )
}
