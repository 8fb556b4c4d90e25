//! Client sessions
//!
//! A session is one client connection: its address, where it is in the
//! connection lifecycle, the queue its packets are written through, the RNG
//! seeds handed to the client and, after migrate-in, the character it plays.
//! The [`SessionManager`] owns every live session and enforces one session
//! per character and a connection cap per IP.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{FieldServerError, GameError, NetworkError, Result};
use crate::protocol::packets::OutPacket;

pub type SessionId = u64;

/// Default connection cap per IP
pub const DEFAULT_MAX_PER_IP: usize = 10;

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for migrate-in
    Connected,
    /// Bound to a character standing in a field
    InGame,
    Disconnecting,
    Disconnected,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Connected => "Connected",
            SessionState::InGame => "InGame",
            SessionState::Disconnecting => "Disconnecting",
            SessionState::Disconnected => "Disconnected",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One client connection
pub struct Session {
    pub id: SessionId,
    pub address: SocketAddr,
    state: Mutex<SessionState>,
    /// Set once the client has received its first Set-Field
    instantiated: AtomicBool,
    seeds: [u32; 3],
    character_id: Mutex<Option<i32>>,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    outbound_tx: Option<mpsc::Sender<Bytes>>,
}

impl Session {
    /// A session whose packets go nowhere
    pub fn new(id: SessionId, address: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            address,
            state: Mutex::new(SessionState::Connected),
            instantiated: AtomicBool::new(false),
            seeds: rand::random(),
            character_id: Mutex::new(None),
            connected_at: now,
            last_activity: Mutex::new(now),
            outbound_tx: None,
        }
    }

    /// A session writing its packets into `outbound_tx`
    pub fn with_channel(id: SessionId, address: SocketAddr, outbound_tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            outbound_tx: Some(outbound_tx),
            ..Self::new(id, address)
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn set_state(&self, next: SessionState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous != next {
            debug!(session_id = self.id, from = %previous, to = %next, "Session state changed");
        }
    }

    pub fn is_instantiated(&self) -> bool {
        self.instantiated.load(Ordering::Acquire)
    }

    pub fn set_instantiated(&self) {
        self.instantiated.store(true, Ordering::Release);
    }

    /// Client damage RNG seeds, sent with the first Set-Field
    pub fn seeds(&self) -> [u32; 3] {
        self.seeds
    }

    /// The character this session plays, once migrated in
    pub fn character_id(&self) -> Option<i32> {
        *self.character_id.lock()
    }

    /// Record inbound traffic
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Whether the client has been silent for at least `max_idle`
    pub fn is_idle(&self, max_idle: Duration) -> bool {
        self.idle_for() >= max_idle
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Queue a packet for the writer task
    pub async fn send(&self, packet: &OutPacket) -> Result<()> {
        let Some(tx) = &self.outbound_tx else {
            return Ok(());
        };
        tx.send(packet.bytes())
            .await
            .map_err(|_| FieldServerError::Network(NetworkError::ConnectionClosed))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .field("character_id", &self.character_id())
            .finish()
    }
}

/// Registry of live sessions
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Character id to the session playing it
    characters: DashMap<i32, SessionId>,
    /// Live connection count per IP
    connections: DashMap<IpAddr, usize>,
    next_id: AtomicU64,
    max_per_ip: usize,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_PER_IP)
    }

    pub fn with_limit(max_per_ip: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            characters: DashMap::new(),
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_per_ip,
        }
    }

    /// Register a new connection from `address`
    pub fn create_session(
        &self,
        address: SocketAddr,
        outbound_tx: mpsc::Sender<Bytes>,
    ) -> Result<Arc<Session>> {
        {
            let mut count = self.connections.entry(address.ip()).or_insert(0);
            if *count >= self.max_per_ip {
                warn!(ip = %address.ip(), max = self.max_per_ip, "Connection limit exceeded for IP");
                return Err(NetworkError::TooManyConnections(address.ip().to_string()).into());
            }
            *count += 1;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::with_channel(id, address, outbound_tx));
        self.sessions.insert(id, session.clone());

        info!(session_id = id, address = %address, "Session created");
        Ok(session)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    pub fn get_by_character(&self, character_id: i32) -> Option<Arc<Session>> {
        let id = *self.characters.get(&character_id)?;
        self.get(id)
    }

    pub fn is_online(&self, character_id: i32) -> bool {
        self.characters.contains_key(&character_id)
    }

    /// Bind a character to a session; fails if another session already plays it
    pub fn bind_character(&self, session_id: SessionId, character_id: i32) -> Result<()> {
        match self.characters.entry(character_id) {
            Entry::Occupied(_) => return Err(GameError::AlreadyOnline(character_id).into()),
            Entry::Vacant(slot) => {
                slot.insert(session_id);
            }
        }

        if let Some(session) = self.get(session_id) {
            *session.character_id.lock() = Some(character_id);
        }
        debug!(session_id = session_id, character_id = character_id, "Character bound");
        Ok(())
    }

    /// Forget a session, releasing its character and IP slot
    pub fn remove(&self, id: SessionId) {
        let Some((_, session)) = self.sessions.remove(&id) else {
            return;
        };

        if let Some(character_id) = session.character_id() {
            self.characters.remove_if(&character_id, |_, owner| *owner == id);
        }

        let ip = session.address.ip();
        if let Some(mut count) = self.connections.get_mut(&ip) {
            *count = count.saturating_sub(1);
        }
        self.connections.remove_if(&ip, |_, count| *count == 0);

        info!(
            session_id = id,
            character_id = ?session.character_id(),
            connected_secs = session.connected_for().as_secs(),
            "Session removed"
        );
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions bound to a character
    pub fn player_count(&self) -> usize {
        self.characters.len()
    }

    pub fn connections_from(&self, ip: IpAddr) -> usize {
        self.connections.get(&ip).map_or(0, |count| *count)
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
