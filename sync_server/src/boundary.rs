//! Engine boundaries.
//!
//! The coordinator touches the outside world through three seams: movement
//! output it consumes, a keyed cache it persists into, and an outbound
//! transport it hands encoded payloads to. Real implementations live with
//! the host application; the ones here back the demo binary and the tests.
//!
//! The wire envelope below is the *logical* diff. A production codec
//! (compact binary, etc.) replaces the JSON encoding without touching the
//! coordinator.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use sync_core::delta::SyncValue;
use sync_core::math::IVec2;

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies a connected recipient.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    pub fn new_unique() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

// ─── Movement ───

/// One positional update produced by the movement solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementUpdate {
    pub kind: String,
    pub instance_id: String,
    pub position: IVec2,
}

/// Movement/physics output consumed once per tick. Opaque beyond positions.
pub trait MovementProvider: Send {
    fn poll(&mut self, tick: u64) -> Vec<MovementUpdate>;
}

/// No-op movement.
#[derive(Default)]
pub struct NullMovement;

impl MovementProvider for NullMovement {
    fn poll(&mut self, _tick: u64) -> Vec<MovementUpdate> {
        Vec::new()
    }
}

/// Seeded random walk used by the demo binary and tests.
pub struct RandomWalk {
    step: i32,
    rng: StdRng,
    tracked: Vec<(String, String, IVec2)>,
}

impl RandomWalk {
    pub fn new(seed: u64, step: i32) -> Self {
        Self {
            step,
            rng: StdRng::seed_from_u64(seed),
            tracked: Vec::new(),
        }
    }

    /// Starts driving an object from the given position.
    pub fn drive(&mut self, kind: impl Into<String>, id: impl Into<String>, from: IVec2) {
        self.tracked.push((kind.into(), id.into(), from));
    }
}

impl MovementProvider for RandomWalk {
    fn poll(&mut self, _tick: u64) -> Vec<MovementUpdate> {
        let step = self.step;
        self.tracked
            .iter_mut()
            .map(|(kind, id, pos)| {
                pos.x += self.rng.gen_range(-step..=step);
                pos.y += self.rng.gen_range(-step..=step);
                MovementUpdate {
                    kind: kind.clone(),
                    instance_id: id.clone(),
                    position: *pos,
                }
            })
            .collect()
    }
}

// ─── Cache ───

/// Keyed cache/persistence boundary with cursor enumeration.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>>;
    async fn save(&self, key: &str, value: Bytes) -> anyhow::Result<()>;
    async fn remove(&self, key: &str) -> anyhow::Result<()>;
    /// Returns up to `limit` keys with the given prefix starting at
    /// `cursor`, plus the next cursor if more remain.
    async fn scan(
        &self,
        prefix: &str,
        cursor: u64,
        limit: usize,
    ) -> anyhow::Result<(Vec<String>, Option<u64>)>;
}

/// In-memory cache for tests and the demo binary.
#[derive(Default)]
pub struct MemoryCache {
    inner: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        let map = self
            .inner
            .read()
            .map_err(|_| anyhow::anyhow!("cache lock poisoned"))?;
        Ok(map.get(key).cloned())
    }

    async fn save(&self, key: &str, value: Bytes) -> anyhow::Result<()> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| anyhow::anyhow!("cache lock poisoned"))?;
        map.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| anyhow::anyhow!("cache lock poisoned"))?;
        map.remove(key);
        Ok(())
    }

    async fn scan(
        &self,
        prefix: &str,
        cursor: u64,
        limit: usize,
    ) -> anyhow::Result<(Vec<String>, Option<u64>)> {
        let map = self
            .inner
            .read()
            .map_err(|_| anyhow::anyhow!("cache lock poisoned"))?;
        let matching: Vec<String> = map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .skip(cursor as usize)
            .take(limit + 1)
            .cloned()
            .collect();

        if matching.len() > limit {
            let keys = matching[..limit].to_vec();
            Ok((keys, Some(cursor + limit as u64)))
        } else {
            Ok((matching, None))
        }
    }
}

// ─── Transport ───

/// Outbound transport boundary. Payloads arrive already encoded and are
/// addressed to a connection, a room, or an explicit broadcast set.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_to(&self, connection: ConnectionId, payload: Bytes) -> anyhow::Result<()>;
    async fn send_room(&self, room_id: &str, payload: Bytes) -> anyhow::Result<()>;
    async fn broadcast(
        &self,
        connections: &[ConnectionId],
        payload: Bytes,
    ) -> anyhow::Result<()>;
}

/// Transport that only logs, for running the binary without a wire.
#[derive(Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn send_to(&self, connection: ConnectionId, payload: Bytes) -> anyhow::Result<()> {
        debug!(connection = connection.0, bytes = payload.len(), "send_to");
        Ok(())
    }

    async fn send_room(&self, room_id: &str, payload: Bytes) -> anyhow::Result<()> {
        debug!(room = %room_id, bytes = payload.len(), "send_room");
        Ok(())
    }

    async fn broadcast(
        &self,
        connections: &[ConnectionId],
        payload: Bytes,
    ) -> anyhow::Result<()> {
        debug!(count = connections.len(), bytes = payload.len(), "broadcast");
        Ok(())
    }
}

/// Where a recorded payload was addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    Connection(ConnectionId),
    Room(String),
    Broadcast(Vec<ConnectionId>),
}

/// Transport that captures everything, for tests.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(SendTarget, Bytes)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains everything recorded so far.
    pub fn take(&self) -> Vec<(SendTarget, Bytes)> {
        match self.sent.lock() {
            Ok(mut sent) => std::mem::take(&mut *sent),
            Err(_) => Vec::new(),
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn record(&self, target: SendTarget, payload: Bytes) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((target, payload));
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_to(&self, connection: ConnectionId, payload: Bytes) -> anyhow::Result<()> {
        self.record(SendTarget::Connection(connection), payload);
        Ok(())
    }

    async fn send_room(&self, room_id: &str, payload: Bytes) -> anyhow::Result<()> {
        self.record(SendTarget::Room(room_id.to_string()), payload);
        Ok(())
    }

    async fn broadcast(
        &self,
        connections: &[ConnectionId],
        payload: Bytes,
    ) -> anyhow::Result<()> {
        self.record(SendTarget::Broadcast(connections.to_vec()), payload);
        Ok(())
    }
}

// ─── Wire envelope ───

/// One entity's delta within a packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDelta {
    pub kind: String,
    pub instance_id: String,
    pub mask: u64,
    pub changed: Vec<(String, SyncValue)>,
}

/// Everything one recipient receives for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPacket {
    pub tick: u64,
    pub updates: Vec<EntityDelta>,
}

/// High-level message envelope handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMsg {
    /// Per-recipient state refresh.
    Delta(SyncPacket),
    /// Room-wide notice: an object entered the world.
    Spawned {
        kind: String,
        instance_id: String,
        room_id: String,
        position: IVec2,
    },
    /// Room-wide notice: an object left the world.
    Removed { kind: String, instance_id: String },
}

/// Convenience codec helpers.
pub fn encode_msg(msg: &SyncMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize sync msg")?;
    Ok(Bytes::from(payload))
}

pub fn decode_msg(b: &[u8]) -> anyhow::Result<SyncMsg> {
    serde_json::from_slice(b).context("deserialize sync msg")
}
