//! Room registry: maps room names to rooms.
//!
//! Each name resolves to exactly one [`Room`], created on first use. The
//! registry lock is always taken before a room's membership lock, never the
//! other way round. Eviction takes the registry write lock and only drops a
//! room that is empty at that moment, while [`RoomRegistry::join`] admits
//! under the registry lock, so a connection can never land in a room that
//! has already been evicted.
//!
//! The registry also records which room each connection joined. A
//! connection is in at most one room: joining another room moves it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::HubConfig;
use crate::connection::{ConnectionId, MessageSink};
use crate::room::{Room, SessionId};

#[derive(Default)]
struct Directory {
    rooms: HashMap<String, Arc<Room>>,
    /// Room each joined connection belongs to
    connections: HashMap<ConnectionId, String>,
}

pub struct RoomRegistry {
    directory: RwLock<Directory>,
    config: HubConfig,
}

impl RoomRegistry {
    pub fn new(config: HubConfig) -> Self {
        Self {
            directory: RwLock::new(Directory::default()),
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get or create the room for `name`.
    ///
    /// Concurrent first calls for the same name all observe the same room.
    pub async fn get_or_create(&self, name: &str) -> Arc<Room> {
        // Fast path: read lock
        {
            let directory = self.directory.read().await;
            if let Some(room) = directory.rooms.get(name) {
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut directory = self.directory.write().await;
        Self::entry(&mut directory.rooms, name)
    }

    /// Resolve `name` and admit `conn` into it as one step with respect to
    /// eviction.
    ///
    /// A connection already in a different room is removed from that room
    /// first, which may evict it.
    pub async fn join(
        &self,
        name: &str,
        conn: ConnectionId,
        sink: Arc<dyn MessageSink>,
    ) -> (Arc<Room>, SessionId) {
        let mut directory = self.directory.write().await;

        if let Some(previous) = directory.connections.get(&conn).cloned() {
            if previous != name {
                if let Some(old) = directory.rooms.get(&previous).cloned() {
                    old.remove(conn).await;
                }
                if self.config.evict_empty_rooms {
                    Self::evict_if_empty(&mut directory.rooms, &previous).await;
                }
                log::info!("Connection {conn} moving from room {previous} to {name}");
            }
        }

        let room = Self::entry(&mut directory.rooms, name);
        let session_id = room.admit(conn, sink).await;
        directory.connections.insert(conn, name.to_string());
        (room, session_id)
    }

    /// Remove `conn` from room `name`, evicting the room if it is left empty
    /// and eviction is enabled. Safe to call more than once.
    pub async fn leave(&self, name: &str, conn: ConnectionId) -> Option<SessionId> {
        let mut directory = self.directory.write().await;
        let room = directory.rooms.get(name).cloned()?;
        let session_id = room.remove(conn).await?;
        if directory.connections.get(&conn).is_some_and(|joined| joined == name) {
            directory.connections.remove(&conn);
        }
        if self.config.evict_empty_rooms {
            Self::evict_if_empty(&mut directory.rooms, name).await;
        }
        Some(session_id)
    }

    /// Evict the room for `name` if it has no members.
    ///
    /// Returns whether a room was evicted.
    pub async fn remove(&self, name: &str) -> bool {
        let mut directory = self.directory.write().await;
        Self::evict_if_empty(&mut directory.rooms, name).await
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.directory.read().await.rooms.get(name).cloned()
    }

    /// Name of the room `conn` last joined, if it has not left.
    pub async fn room_of(&self, conn: ConnectionId) -> Option<String> {
        self.directory.read().await.connections.get(&conn).cloned()
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.directory.read().await.rooms.len()
    }

    /// Names of all live rooms, sorted.
    pub async fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.directory.read().await.rooms.keys().cloned().collect();
        names.sort();
        names
    }

    /// Members across every room.
    pub async fn total_members(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.directory.read().await.rooms.values().cloned().collect();
        let mut total = 0;
        for room in rooms {
            total += room.member_count().await;
        }
        total
    }

    async fn evict_if_empty(rooms: &mut HashMap<String, Arc<Room>>, name: &str) -> bool {
        let empty = match rooms.get(name) {
            Some(room) => room.is_empty().await,
            None => return false,
        };
        if !empty {
            return false;
        }
        rooms.remove(name);
        log::info!("Room {name} removed (empty)");
        true
    }

    fn entry(rooms: &mut HashMap<String, Arc<Room>>, name: &str) -> Arc<Room> {
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }
        let room = Arc::new(Room::new(name));
        rooms.insert(name.to_string(), room.clone());
        log::info!("Room {name} created");
        room
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelSink;

    fn sink() -> Arc<dyn MessageSink> {
        let (sink, rx) = ChannelSink::channel(16);
        // Receiver dropped: sends fail, which membership tests don't care about
        drop(rx);
        Arc::new(sink)
    }

    #[tokio::test]
    async fn test_get_or_create_same_room() {
        let registry = RoomRegistry::default();
        let room1 = registry.get_or_create("lobby").await;
        let room2 = registry.get_or_create("lobby").await;

        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(room1.name(), "lobby");
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_room_names_case_sensitive() {
        let registry = RoomRegistry::default();
        let _a = registry.get_or_create("Lobby").await;
        let _b = registry.get_or_create("lobby").await;
        let _c = registry.get_or_create("r1").await;

        assert_eq!(registry.room_count().await, 3);
        assert_eq!(registry.room_names().await, vec!["Lobby", "lobby", "r1"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_access() {
        let registry = Arc::new(RoomRegistry::default());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.get_or_create("lobby").await }));
        }

        let mut rooms = Vec::new();
        for handle in handles {
            rooms.push(handle.await.unwrap());
        }
        assert!(rooms.iter().all(|room| Arc::ptr_eq(room, &rooms[0])));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_only_when_empty() {
        let registry = RoomRegistry::default();
        let conn = ConnectionId::new();
        let (room, _) = registry.join("lobby", conn, sink()).await;

        assert!(!registry.remove("lobby").await);
        assert_eq!(registry.room_count().await, 1);

        room.remove(conn).await;
        assert!(registry.remove("lobby").await);
        assert_eq!(registry.room_count().await, 0);
        assert!(!registry.remove("lobby").await);
    }

    #[tokio::test]
    async fn test_leave_evicts_empty_room() {
        let registry = RoomRegistry::default();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        registry.join("lobby", a, sink()).await;
        registry.join("lobby", b, sink()).await;
        assert_eq!(registry.total_members().await, 2);

        assert!(registry.leave("lobby", a).await.is_some());
        assert_eq!(registry.room_count().await, 1);

        assert!(registry.leave("lobby", b).await.is_some());
        assert_eq!(registry.room_count().await, 0);

        // close then error
        assert!(registry.leave("lobby", b).await.is_none());
    }

    #[tokio::test]
    async fn test_leave_keeps_room_when_eviction_disabled() {
        let registry = RoomRegistry::new(HubConfig {
            evict_empty_rooms: false,
            ..HubConfig::default()
        });
        let conn = ConnectionId::new();
        let (room, _) = registry.join("lobby", conn, sink()).await;
        registry.leave("lobby", conn).await;

        let again = registry.get("lobby").await.unwrap();
        assert!(Arc::ptr_eq(&room, &again));
        assert!(again.is_empty().await);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let registry = RoomRegistry::default();
        let (a_sink, mut a_rx) = ChannelSink::channel(8);
        let (b_sink, mut b_rx) = ChannelSink::channel(8);
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let (room_a, _) = registry.join("a", a, Arc::new(a_sink)).await;
        registry.join("b", b, Arc::new(b_sink)).await;

        room_a.handle_inbound(a, "hello").await;
        assert_eq!(a_rx.try_recv().unwrap(), "You sent: hello");
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connection_in_one_room_at_a_time() {
        let registry = RoomRegistry::default();
        let conn = ConnectionId::new();
        let other = ConnectionId::new();
        let (room_a, _) = registry.join("a", conn, sink()).await;
        registry.join("a", other, sink()).await;
        let (room_b, _) = registry.join("b", conn, sink()).await;

        assert!(!room_a.contains(conn).await);
        assert!(room_a.contains(other).await);
        assert!(room_b.contains(conn).await);
        assert_eq!(registry.total_members().await, 2);
        assert_eq!(registry.room_of(conn).await.as_deref(), Some("b"));

        // Moving the last member out evicts the old room
        registry.join("c", other, sink()).await;
        assert_eq!(registry.room_names().await, vec!["b", "c"]);

        registry.leave("b", conn).await;
        assert_eq!(registry.room_of(conn).await, None);
    }

    #[tokio::test]
    async fn test_rejoin_same_room_keeps_session() {
        let registry = RoomRegistry::default();
        let conn = ConnectionId::new();
        let (_, first) = registry.join("a", conn, sink()).await;
        let (room, second) = registry.join("a", conn, sink()).await;

        assert_eq!(first, second);
        assert_eq!(room.member_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_never_lands_in_evicted_room() {
        let registry = Arc::new(RoomRegistry::default());
        let mut handles = Vec::new();
        for _ in 0..64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let conn = ConnectionId::new();
                registry.join("churn", conn, sink()).await;
                tokio::task::yield_now().await;
                registry.leave("churn", conn).await;
            }));
        }

        let stayer = ConnectionId::new();
        let (room, _) = registry.join("churn", stayer, sink()).await;

        for handle in handles {
            handle.await.unwrap();
        }

        let live = registry.get("churn").await.unwrap();
        assert!(Arc::ptr_eq(&room, &live));
        assert!(live.contains(stayer).await);
        assert_eq!(live.member_count().await, 1);
    }
}
