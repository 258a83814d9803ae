//! WebSocket server: the thin layer between sockets and rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐  GET /lobby (Upgrade)    ┌─────────────── RoomRegistry ───────────────┐
//!            ├─────────────────────────►│ "lobby" ─► Room ─► ChannelSink A ─► writer A │──► Client A
//! Client B ──┘                          │                 └► ChannelSink B ─► writer B │──► Client B
//!                                       └────────────────────────────────────────────┘
//! ```
//!
//! Each connection gets:
//! - a receive loop that feeds text frames into [`Room::handle_inbound`](crate::room::Room::handle_inbound)
//! - a writer task draining the connection's bounded outbound queue, which
//!   also sends keepalive pings
//!
//! Close and error both end the receive loop, which then leaves the room
//! exactly once. Plain HTTP requests that do not ask for an upgrade are
//! answered with `426 Upgrade Required` and closed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::config::ServerConfig;
use crate::connection::{ChannelSink, ConnectionId};
use crate::registry::RoomRegistry;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

impl AtomicServerStats {
    fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn message(&self, bytes: usize) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Largest request head inspected before the handshake.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// How long to wait for a complete request head.
const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(5);

const UPGRADE_REQUIRED_BODY: &str = "Expected Upgrade: websocket";

/// The broadcast hub server.
pub struct HubServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<AtomicServerStats>,
}

impl HubServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.hub.clone()));
        Self {
            config,
            registry,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Agora hub listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Failed to accept connection: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.registry.room_count().await,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}

/// Derive a room name from a request path.
///
/// Takes the last non-empty path segment, percent-decodes it, keeps only
/// `[A-Za-z0-9_-]`, and truncates to `max_len`. Falls back to
/// `default_room` when nothing is left.
pub fn room_name_from_path(path: &str, default_room: &str, max_len: usize) -> String {
    let segment = path.rsplit('/').find(|s| !s.is_empty()).unwrap_or("");
    let decoded = urlencoding::decode(segment).unwrap_or_else(|_| segment.into());
    let name: String = decoded
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(max_len)
        .collect();
    if name.is_empty() {
        default_room.to_string()
    } else {
        name
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    stats: Arc<AtomicServerStats>,
    config: ServerConfig,
) -> Result<(), ServerError> {
    let head = peek_request_head(&stream).await?;
    if wants_websocket(&head) == Some(false) {
        log::info!("Rejecting non-WebSocket request from {addr}");
        reject_upgrade_required(stream, head.len()).await?;
        return Ok(());
    }

    let mut path = String::new();
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            Ok(resp)
        },
    )
    .await?;

    let room_name = room_name_from_path(&path, &config.default_room, config.max_room_name_len);
    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let (sink, outbound) = ChannelSink::channel(config.hub.outbound_capacity);

    let conn = ConnectionId::new();
    let (room, session_id) = registry.join(&room_name, conn, Arc::new(sink)).await;
    stats.connection_opened();
    log::info!("WebSocket connection from {addr} joined room {room_name} as {session_id}");

    let heartbeat = match config.heartbeat_interval_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let writer = tokio::spawn(async move {
        if let Err(e) = write_loop(ws_sender, outbound, heartbeat).await {
            log::debug!("Writer for {addr} stopped: {e}");
        }
    });

    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                stats.message(text.len());
                room.handle_inbound(conn, text.as_str()).await;
            }
            Some(Ok(Message::Binary(data))) => {
                stats.message(data.len());
                let text = String::from_utf8_lossy(&data);
                room.handle_inbound(conn, &text).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                log::info!("Connection closed from {addr}");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                log::warn!("WebSocket error from {addr}: {e}");
                break;
            }
        }
    }

    registry.leave(&room_name, conn).await;
    stats.connection_closed();

    // The room held the only sender, so the writer drains and exits.
    let _ = writer.await;
    Ok(())
}

/// Look at the request head without consuming it, so the handshake still
/// reads the whole request.
async fn peek_request_head(stream: &TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let deadline = tokio::time::Instant::now() + REQUEST_HEAD_TIMEOUT;
    loop {
        let n = stream.peek(&mut buf).await?;
        let complete = head_end(&buf[..n]).is_some();
        if n == 0 || complete || n == buf.len() || tokio::time::Instant::now() >= deadline {
            buf.truncate(n);
            return Ok(buf);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn head_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Whether a request head asks for a WebSocket upgrade.
///
/// `None` while the head is incomplete; the handshake then decides.
fn wants_websocket(head: &[u8]) -> Option<bool> {
    let end = head_end(head)?;
    let head = String::from_utf8_lossy(&head[..end]);
    Some(head.lines().skip(1).any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
        })
    }))
}

/// Answer a plain HTTP request with `426 Upgrade Required`.
async fn reject_upgrade_required(mut stream: TcpStream, peeked: usize) -> std::io::Result<()> {
    // Consume what was peeked so closing does not reset the connection
    // before the client reads the response.
    let mut discard = vec![0u8; peeked];
    stream.read_exact(&mut discard).await?;

    let response = format!(
        "HTTP/1.1 426 Upgrade Required\r\n\
         Upgrade: websocket\r\n\
         Connection: close\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\r\n{}",
        UPGRADE_REQUIRED_BODY.len(),
        UPGRADE_REQUIRED_BODY
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Drain the outbound queue to the socket, pinging on every heartbeat tick.
async fn write_loop(
    mut ws_sender: WsSender,
    mut outbound: mpsc::Receiver<String>,
    heartbeat: Option<Duration>,
) -> Result<(), ServerError> {
    let mut ticker = heartbeat
        .map(|period| tokio::time::interval_at(tokio::time::Instant::now() + period, period));

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                match msg {
                    Some(text) => ws_sender.send(Message::text(text)).await?,
                    None => break,
                }
            }

            _ = async {
                if let Some(ref mut t) = ticker {
                    t.tick().await;
                } else {
                    // No keepalive, wait forever
                    std::future::pending::<()>().await;
                }
            } => {
                log::trace!("Sending keepalive ping");
                ws_sender.send(Message::Ping(Default::default())).await?;
            }
        }
    }

    let _ = ws_sender.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_name_from_path() {
        assert_eq!(room_name_from_path("/lobby", "main", 64), "lobby");
        assert_eq!(room_name_from_path("/ws/lobby", "main", 64), "lobby");
        assert_eq!(room_name_from_path("/ws/lobby/", "main", 64), "lobby");
        assert_eq!(room_name_from_path("/Room_1-a", "main", 64), "Room_1-a");
    }

    #[test]
    fn test_room_name_falls_back_to_default() {
        assert_eq!(room_name_from_path("/", "main", 64), "main");
        assert_eq!(room_name_from_path("", "main", 64), "main");
        assert_eq!(room_name_from_path("/%20!", "main", 64), "main");
        assert_eq!(room_name_from_path("/%2F%2E%2E", "main", 64), "main");
    }

    #[test]
    fn test_room_name_sanitized_and_bounded() {
        assert_eq!(room_name_from_path("/lob%20by!", "main", 64), "lobby");
        assert_eq!(room_name_from_path("/team%5Fa", "main", 64), "team_a");
        assert_eq!(room_name_from_path("/bad%ZZ", "main", 64), "badZZ");
        assert_eq!(room_name_from_path("/../etc", "main", 64), "etc");
        assert_eq!(room_name_from_path("/abcdefgh", "main", 4), "abcd");
        assert_eq!(room_name_from_path("/caf\u{e9}", "main", 64), "caf");
    }

    #[test]
    fn test_wants_websocket() {
        let upgrade = b"GET /lobby HTTP/1.1\r\nHost: x\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n\r\n";
        assert_eq!(wants_websocket(upgrade), Some(true));

        let listed = b"GET / HTTP/1.1\r\nupgrade: h2c, websocket\r\n\r\n";
        assert_eq!(wants_websocket(listed), Some(true));

        let plain = b"GET /lobby HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(wants_websocket(plain), Some(false));

        let other = b"GET /lobby HTTP/1.1\r\nUpgrade: h2c\r\n\r\n";
        assert_eq!(wants_websocket(other), Some(false));

        assert_eq!(wants_websocket(b"GET /lobby HTTP/1.1\r\nUpgr"), None);
        assert_eq!(wants_websocket(b""), None);
    }

    #[test]
    fn test_server_creation() {
        let server = HubServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.config().default_room, "main");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = HubServer::with_defaults();
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[tokio::test]
    async fn test_server_registry_uses_hub_config() {
        let config = ServerConfig {
            hub: crate::config::HubConfig {
                outbound_capacity: 8,
                evict_empty_rooms: false,
            },
            ..ServerConfig::default()
        };
        let server = HubServer::new(config);
        assert_eq!(server.registry().config().outbound_capacity, 8);
        assert!(!server.registry().config().evict_empty_rooms);
    }
}
