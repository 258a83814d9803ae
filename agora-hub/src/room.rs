//! A single broadcast room.
//!
//! ```text
//!                 ┌──────────────── Room "lobby" ────────────────┐
//!  admit/remove ─►│ members: RwLock<HashMap<ConnectionId, Member>> │
//!                 │                                              │
//!  inbound ──────►│ classify ─► snapshot (read lock, released) ──┼──► sink A
//!                 │                                              ├──► sink B
//!                 └──────────────────────────────────────────────┴──► sink C
//! ```
//!
//! Membership changes take the write lock. A fan-out only holds the read
//! lock long enough to clone the recipients, then sends with no lock held, so
//! a stalled member cannot hold up admissions or other deliveries.
//!
//! Send failures are counted and logged per member. They never abort the
//! fan-out and never remove the member; removal only happens when the
//! collaborator reports the connection as closed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::connection::{ConnectionId, MessageSink};
use crate::protocol::{self, Delivery, Inbound};

/// Token identifying a member within its room.
///
/// 128 random bits, so collisions are effectively impossible; admission still
/// re-rolls on a clash to keep ids unique within the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One admitted connection. Never leaves the room.
struct Member {
    session_id: SessionId,
    connected_at: SystemTime,
    sink: Arc<dyn MessageSink>,
}

/// Read-only view of a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub connection_id: ConnectionId,
    pub session_id: SessionId,
    pub connected_at: SystemTime,
}

/// Outcome of one inbound message or broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Members the payload was queued for
    pub delivered: usize,
    /// Members whose sink rejected the payload
    pub failed: usize,
    /// Whether the sender received a "You sent" acknowledgement
    pub acknowledged: bool,
}

/// Statistics for monitoring room health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub messages_received: u64,
    pub deliveries: u64,
    pub failed_deliveries: u64,
    pub active_members: usize,
}

/// Counters updated without taking the membership lock.
struct AtomicRoomStats {
    messages_received: AtomicU64,
    deliveries: AtomicU64,
    failed_deliveries: AtomicU64,
}

impl AtomicRoomStats {
    fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            failed_deliveries: AtomicU64::new(0),
        }
    }
}

type Recipient = (SessionId, Arc<dyn MessageSink>);

/// Membership captured under the read lock.
struct Snapshot {
    sender: Option<Recipient>,
    others: Vec<Recipient>,
}

/// An isolated broadcast domain.
pub struct Room {
    name: String,
    members: RwLock<HashMap<ConnectionId, Member>>,
    stats: AtomicRoomStats,
}

impl Room {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: RwLock::new(HashMap::new()),
            stats: AtomicRoomStats::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admit a connection and return its session id.
    ///
    /// Re-admitting a connection that is already a member keeps the existing
    /// member and returns its session id.
    pub async fn admit(&self, conn: ConnectionId, sink: Arc<dyn MessageSink>) -> SessionId {
        let mut members = self.members.write().await;
        if let Some(existing) = members.get(&conn) {
            log::debug!(
                "Connection {conn} already in room {} as {}",
                self.name,
                existing.session_id
            );
            return existing.session_id;
        }

        let mut session_id = SessionId::new();
        while members.values().any(|m| m.session_id == session_id) {
            session_id = SessionId::new();
        }

        members.insert(
            conn,
            Member {
                session_id,
                connected_at: SystemTime::now(),
                sink,
            },
        );
        log::info!(
            "Session {session_id} joined room {} ({} members)",
            self.name,
            members.len()
        );
        session_id
    }

    /// Remove a connection. Absent connections are a no-op, so close and
    /// error notifications may both call this.
    pub async fn remove(&self, conn: ConnectionId) -> Option<SessionId> {
        let mut members = self.members.write().await;
        let member = members.remove(&conn)?;
        log::info!(
            "Session {} left room {} ({} members)",
            member.session_id,
            self.name,
            members.len()
        );
        Some(member.session_id)
    }

    /// Run the protocol for one inbound text frame from `conn`.
    ///
    /// Structured `msg` requests are relayed as `{from, body}` with nothing
    /// sent back. Everything else is relayed as `[Broadcast] <text>` and
    /// acknowledged to the sender as `You sent: <text>`. Frames from a
    /// connection that is not a member are dropped.
    pub async fn handle_inbound(&self, conn: ConnectionId, raw: &str) -> DispatchReport {
        let snapshot = self.snapshot(conn).await;
        let Some((session_id, sender_sink)) = snapshot.sender else {
            log::debug!("Dropping message from non-member {conn} in room {}", self.name);
            return DispatchReport::default();
        };
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

        match Inbound::classify(raw) {
            Inbound::Broadcast { body } => {
                let text = match Delivery::new(session_id, body).encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Failed to encode delivery in room {}: {e}", self.name);
                        return DispatchReport::default();
                    }
                };
                log::debug!("Relaying msg from {session_id} in room {}", self.name);
                self.fan_out(&snapshot.others, &text)
            }
            Inbound::Plain(text) => {
                log::debug!("Relaying plain text from {session_id} in room {}", self.name);
                let mut report = self.fan_out(&snapshot.others, &protocol::broadcast_text(text));
                report.acknowledged =
                    self.deliver(session_id, sender_sink.as_ref(), protocol::ack_text(text));
                report
            }
        }
    }

    /// Deliver `payload` to every current member except `sender`.
    pub async fn broadcast(&self, sender: ConnectionId, payload: &str) -> DispatchReport {
        let snapshot = self.snapshot(sender).await;
        self.fan_out(&snapshot.others, payload)
    }

    /// Send directly to one member. Returns whether the send was accepted.
    pub async fn send_to(&self, conn: ConnectionId, text: impl Into<String>) -> bool {
        let recipient = {
            let members = self.members.read().await;
            members.get(&conn).map(|m| (m.session_id, m.sink.clone()))
        };
        match recipient {
            Some((session_id, sink)) => self.deliver(session_id, sink.as_ref(), text.into()),
            None => false,
        }
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }

    pub async fn contains(&self, conn: ConnectionId) -> bool {
        self.members.read().await.contains_key(&conn)
    }

    pub async fn session_id(&self, conn: ConnectionId) -> Option<SessionId> {
        self.members.read().await.get(&conn).map(|m| m.session_id)
    }

    /// All current members, in no particular order.
    pub async fn members(&self) -> Vec<MemberInfo> {
        self.members
            .read()
            .await
            .iter()
            .map(|(conn, m)| MemberInfo {
                connection_id: *conn,
                session_id: m.session_id,
                connected_at: m.connected_at,
            })
            .collect()
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            failed_deliveries: self.stats.failed_deliveries.load(Ordering::Relaxed),
            active_members: self.member_count().await,
        }
    }

    async fn snapshot(&self, sender: ConnectionId) -> Snapshot {
        let members = self.members.read().await;
        let mut snapshot = Snapshot {
            sender: None,
            others: Vec::with_capacity(members.len()),
        };
        for (conn, m) in members.iter() {
            let recipient = (m.session_id, m.sink.clone());
            if *conn == sender {
                snapshot.sender = Some(recipient);
            } else {
                snapshot.others.push(recipient);
            }
        }
        snapshot
    }

    fn fan_out(&self, recipients: &[Recipient], payload: &str) -> DispatchReport {
        let mut report = DispatchReport::default();
        for (session_id, sink) in recipients {
            if self.deliver(*session_id, sink.as_ref(), payload.to_owned()) {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }

    fn deliver(&self, session_id: SessionId, sink: &dyn MessageSink, text: String) -> bool {
        match sink.send(text) {
            Ok(()) => {
                self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.stats.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                log::warn!("Send to {session_id} in room {} failed: {e}", self.name);
                false
            }
        }
    }
}
