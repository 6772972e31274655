//! Engine coordinator.
//!
//! Owns the master tick. Per tick it advances the cycle scheduler, applies
//! movement output, re-indexes movers in the spatial grid, derives each
//! session's interest set from room-scoped proximity queries, computes
//! per-recipient deltas, and hands encoded packets to the transport.
//!
//! Determinism notes:
//! - Keep simulation in a fixed timestep.
//! - Scheduled handlers run synchronously on the tick loop, in registration
//!   order; work slower than a tick belongs behind the boundaries.
//! - Use stable ordering when iterating collections (sessions by connection
//!   id, kinds and interest sets sorted).
//!
//! Two triggering modes share the same pipeline: the engine-driven loop
//! (`run_for_ticks`) and direct mode (`push_now`), which syncs one entity
//! the moment a request mutates it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info};

use sync_core::config::SyncConfig;
use sync_core::cycle::{CycleDescriptor, CycleHandler, CycleScheduler, RateUnit};
use sync_core::delta::{SyncDelta, SyncSchema};
use sync_core::math::IVec2;
use sync_core::partition::{calculate_partitions, Extent, Partition};
use sync_core::spatial::{ObjectMetadata, SpatialGrid};

use crate::boundary::{
    encode_msg, CacheStore, ConnectionId, EntityDelta, MemoryCache, MovementProvider,
    MovementUpdate, RecordingTransport, SyncMsg, SyncPacket, Transport,
};
use crate::replicate::ReplicaSet;
use crate::session::SessionRegistry;

/// Cache key for a persisted object snapshot.
fn object_key(kind: &str, id: &str) -> String {
    format!("obj:{kind}:{id}")
}

/// The master tick owner, composing grid, scheduler, replicas, and sessions.
pub struct EngineCoordinator {
    cfg: SyncConfig,
    grid: Arc<RwLock<SpatialGrid>>,
    scheduler: CycleScheduler,
    replicas: ReplicaSet,
    sessions: SessionRegistry,
    movement: Box<dyn MovementProvider>,
    cache: Arc<dyn CacheStore>,
    transport: Arc<dyn Transport>,
    partitions: Vec<Partition>,
    tick: u64,
    /// Set by the persistence cycle; the sweep itself (async I/O) runs on
    /// the coordinator after the scheduler pass.
    persist_due: Arc<AtomicBool>,
}

impl EngineCoordinator {
    /// Builds a coordinator. Bad dimensions or rates fail here, not at
    /// runtime.
    pub fn new(
        cfg: SyncConfig,
        movement: Box<dyn MovementProvider>,
        cache: Arc<dyn CacheStore>,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Self> {
        cfg.validate()?;

        let grid = SpatialGrid::new(cfg.cell_size)?;
        let partitions = calculate_partitions(
            Extent::new(cfg.world_width, cfg.world_height),
            Extent::new(cfg.partition_width, cfg.partition_height),
        )?;
        let mut scheduler = CycleScheduler::new(cfg.tick_hz)?;

        let persist_due = Arc::new(AtomicBool::new(false));
        if cfg.persist_every_secs > 0 {
            let flag = Arc::clone(&persist_due);
            scheduler.register(
                "engine",
                "persist",
                CycleDescriptor::Frequency {
                    rate: cfg.persist_every_secs * cfg.tick_hz,
                    unit: RateUnit::Ticks,
                },
                Box::new(move |_tick| {
                    flag.store(true, Ordering::Relaxed);
                    Ok(())
                }),
            )?;
        }

        info!(
            tick_hz = cfg.tick_hz,
            cell_size = cfg.cell_size,
            partitions = partitions.len(),
            "coordinator ready"
        );

        Ok(Self {
            cfg,
            grid: Arc::new(RwLock::new(grid)),
            scheduler,
            replicas: ReplicaSet::new(),
            sessions: SessionRegistry::new(),
            movement,
            cache,
            transport,
            partitions,
            tick: 0,
            persist_due,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.cfg
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// Deterministic tiling of the configured world, computed once at
    /// construction.
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Handle for scheduled handlers that mutate positions; the grid is one
    /// structure behind one lock, so no reader ever sees a partial update.
    pub fn grid_handle(&self) -> Arc<RwLock<SpatialGrid>> {
        Arc::clone(&self.grid)
    }

    fn grid_read(&self) -> anyhow::Result<RwLockReadGuard<'_, SpatialGrid>> {
        self.grid
            .read()
            .map_err(|_| anyhow!("spatial grid lock poisoned"))
    }

    fn grid_write(&self) -> anyhow::Result<RwLockWriteGuard<'_, SpatialGrid>> {
        self.grid
            .write()
            .map_err(|_| anyhow!("spatial grid lock poisoned"))
    }

    // ─── Registration ───

    /// Registers a replicated kind with its schema and optional position
    /// field writer.
    pub fn register_kind<E: Send + 'static>(
        &mut self,
        schema: SyncSchema<E>,
        position_setter: Option<fn(&mut E, IVec2)>,
    ) -> anyhow::Result<()> {
        self.replicas.register(schema, position_setter)
    }

    /// Registers a scheduled cycle under an owner key.
    pub fn register_cycle(
        &mut self,
        owner: impl Into<String>,
        name: impl Into<String>,
        descriptor: CycleDescriptor,
        handler: CycleHandler,
    ) -> anyhow::Result<()> {
        self.scheduler.register(owner, name, descriptor, handler)
    }

    /// Drops every cycle registered under `owner`.
    pub fn remove_cycles(&mut self, owner: &str) -> usize {
        self.scheduler.remove_owner(owner)
    }

    // ─── Object lifecycle ───

    /// Spawns an object: typed entity into its replica store, record into
    /// the grid, room-wide announcement to the transport.
    pub async fn spawn<E: Send + 'static>(
        &mut self,
        metadata: ObjectMetadata,
        entity: E,
    ) -> anyhow::Result<()> {
        let replica = self
            .replicas
            .typed_mut::<E>(&metadata.kind)
            .ok_or_else(|| {
                anyhow!(
                    "kind '{}' is not registered for this entity type",
                    metadata.kind
                )
            })?;
        replica.insert(metadata.instance_id.clone(), entity);
        self.grid_write()?.add(metadata.clone());

        debug!(kind = %metadata.kind, id = %metadata.instance_id, room = %metadata.room_id, "spawned");
        let notice = encode_msg(&SyncMsg::Spawned {
            kind: metadata.kind.clone(),
            instance_id: metadata.instance_id.clone(),
            room_id: metadata.room_id.clone(),
            position: metadata.position,
        })?;
        self.transport.send_room(&metadata.room_id, notice).await?;
        Ok(())
    }

    /// Despawns an object from every view, clears its cache entry, and
    /// announces the removal to its room. Unknown ids return `None`.
    pub async fn despawn(&mut self, id: &str) -> anyhow::Result<Option<ObjectMetadata>> {
        let Some(metadata) = self.grid_write()?.remove(id) else {
            return Ok(None);
        };
        self.replicas.remove(&metadata.kind, id);
        self.cache
            .remove(&object_key(&metadata.kind, id))
            .await
            .context("clear persisted snapshot")?;

        debug!(kind = %metadata.kind, id = %id, "despawned");
        let notice = encode_msg(&SyncMsg::Removed {
            kind: metadata.kind.clone(),
            instance_id: metadata.instance_id.clone(),
        })?;
        self.transport.send_room(&metadata.room_id, notice).await?;
        Ok(Some(metadata))
    }

    /// Moves an object, rebucketing it in the grid and writing its position
    /// field. Unknown ids are a quiet no-op.
    pub fn move_object(&mut self, id: &str, position: IVec2) -> anyhow::Result<bool> {
        let kind = {
            let mut grid = self.grid_write()?;
            if !grid.move_to(id, position) {
                return Ok(false);
            }
            grid.instance(id).map(|m| m.kind.clone())
        };
        if let Some(kind) = kind {
            self.replicas.apply_position(&kind, id, position);
        }
        Ok(true)
    }

    /// Mutates a typed entity in place (game-logic stat changes). Position
    /// changes go through [`Self::move_object`] so the grid stays current.
    pub fn with_entity_mut<E: Send + 'static, R>(
        &mut self,
        kind: &str,
        id: &str,
        f: impl FnOnce(&mut E) -> R,
    ) -> Option<R> {
        self.replicas
            .typed_mut::<E>(kind)
            .and_then(|r| r.get_mut(id))
            .map(f)
    }

    // ─── Queries ───

    pub fn query(
        &self,
        kind: &str,
        center: IVec2,
        radius: i32,
        room_id: &str,
    ) -> anyhow::Result<Vec<ObjectMetadata>> {
        Ok(self.grid_read()?.query(kind, center, radius, room_id))
    }

    pub fn get_by_type(
        &self,
        kind: &str,
    ) -> anyhow::Result<std::collections::HashMap<String, ObjectMetadata>> {
        Ok(self.grid_read()?.get_by_type(kind))
    }

    pub fn get_all_by_type(&self, kind: &str) -> anyhow::Result<Vec<ObjectMetadata>> {
        Ok(self.grid_read()?.get_all_by_type(kind))
    }

    /// Delta for one (entity, recipient) pair, updating that recipient's
    /// history. `None` for unknown kinds, ids, or connections.
    pub fn compute_delta(
        &mut self,
        kind: &str,
        id: &str,
        connection: ConnectionId,
    ) -> Option<SyncDelta> {
        let session = self.sessions.get_mut(connection)?;
        self.replicas.delta_for(kind, id, &mut session.sync)
    }

    // ─── Sessions ───

    /// Opens a session with the configured interest radius.
    pub fn session_open(
        &mut self,
        connection: ConnectionId,
        room_id: impl Into<String>,
        focus: IVec2,
    ) {
        self.sessions
            .open(connection, room_id, focus, self.cfg.interest_radius);
    }

    /// Closes a session; its per-recipient sync history goes with it.
    pub fn session_close(&mut self, connection: ConnectionId) -> bool {
        self.sessions.close(connection)
    }

    pub fn session_set_focus(&mut self, connection: ConnectionId, focus: IVec2) -> bool {
        self.sessions.set_focus(connection, focus)
    }

    pub fn session_move_room(
        &mut self,
        connection: ConnectionId,
        room_id: impl Into<String>,
    ) -> bool {
        self.sessions.move_room(connection, room_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // ─── Tick pipeline ───

    /// Executes one master tick. Returns how many packets went out.
    pub async fn tick(&mut self) -> anyhow::Result<usize> {
        let now = Utc::now();
        self.scheduler.advance(self.tick, now);

        for update in self.movement.poll(self.tick) {
            self.apply_movement(&update)?;
        }

        let sent = self.sync_sessions().await?;

        if self.persist_due.swap(false, Ordering::Relaxed) {
            self.persist_all().await?;
        }

        self.tick += 1;
        Ok(sent)
    }

    /// Runs the engine-driven loop for a number of ticks at the configured
    /// cadence.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f64(1.0 / self.cfg.tick_hz as f64);
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.tick().await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Direct mode: syncs one entity to every interested session right now,
    /// without waiting for the next master tick. Same delta pipeline, only
    /// the cadence differs.
    pub async fn push_now(&mut self, id: &str) -> anyhow::Result<usize> {
        let Some(metadata) = self.grid_read()?.instance(id).cloned() else {
            return Ok(0);
        };

        let mut sent = 0;
        for conn in self.sessions.connection_ids() {
            let Some(session) = self.sessions.get_mut(conn) else {
                continue;
            };
            if session.room_id != metadata.room_id
                || !metadata
                    .position
                    .within(session.focus, session.interest_radius)
            {
                continue;
            }
            let Some(delta) =
                self.replicas
                    .delta_for(&metadata.kind, &metadata.instance_id, &mut session.sync)
            else {
                continue;
            };
            if delta.is_empty() {
                continue;
            }

            let payload = encode_msg(&SyncMsg::Delta(SyncPacket {
                tick: self.tick,
                updates: vec![EntityDelta {
                    kind: metadata.kind.clone(),
                    instance_id: metadata.instance_id.clone(),
                    mask: delta.mask,
                    changed: delta.changed,
                }],
            }))?;
            self.transport.send_to(conn, payload).await?;
            sent += 1;
        }
        Ok(sent)
    }

    fn apply_movement(&mut self, update: &MovementUpdate) -> anyhow::Result<()> {
        if !self.move_object(&update.instance_id, update.position)? {
            debug!(id = %update.instance_id, "movement for unknown object dropped");
        }
        Ok(())
    }

    /// Computes and sends per-recipient packets for every open session.
    async fn sync_sessions(&mut self) -> anyhow::Result<usize> {
        let kinds = self.replicas.kinds();
        let mut sent = 0;

        for conn in self.sessions.connection_ids() {
            let Some(session) = self.sessions.get_mut(conn) else {
                continue;
            };

            // Interest set: room-scoped proximity around the session focus,
            // sorted for stable packet ordering.
            let mut interest: Vec<ObjectMetadata> = {
                let grid = self
                    .grid
                    .read()
                    .map_err(|_| anyhow!("spatial grid lock poisoned"))?;
                kinds
                    .iter()
                    .flat_map(|kind| {
                        grid.query(
                            kind,
                            session.focus,
                            session.interest_radius,
                            &session.room_id,
                        )
                    })
                    .collect()
            };
            interest.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

            let mut updates = Vec::new();
            for metadata in interest {
                let Some(delta) = self.replicas.delta_for(
                    &metadata.kind,
                    &metadata.instance_id,
                    &mut session.sync,
                ) else {
                    continue;
                };
                if delta.is_empty() {
                    continue;
                }
                updates.push(EntityDelta {
                    kind: metadata.kind,
                    instance_id: metadata.instance_id,
                    mask: delta.mask,
                    changed: delta.changed,
                });
            }

            if updates.is_empty() {
                continue;
            }
            let payload = encode_msg(&SyncMsg::Delta(SyncPacket {
                tick: self.tick,
                updates,
            }))?;
            self.transport.send_to(conn, payload).await?;
            sent += 1;
        }
        Ok(sent)
    }

    // ─── Persistence ───

    /// Saves a metadata snapshot of every live object to the cache.
    pub async fn persist_all(&self) -> anyhow::Result<usize> {
        let snapshots: Vec<(String, Vec<u8>)> = {
            let grid = self.grid_read()?;
            grid.instances()
                .map(|m| {
                    let bytes = serde_json::to_vec(m).context("serialize snapshot")?;
                    Ok((object_key(&m.kind, &m.instance_id), bytes))
                })
                .collect::<anyhow::Result<_>>()?
        };

        let count = snapshots.len();
        for (key, bytes) in snapshots {
            self.cache.save(&key, bytes.into()).await?;
        }
        debug!(count, "persisted object snapshots");
        Ok(count)
    }

    /// Re-enumerates persisted snapshots through the cache cursor API.
    /// The caller decides what to respawn.
    pub async fn load_saved(&self, prefix: &str) -> anyhow::Result<Vec<ObjectMetadata>> {
        let mut out = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (keys, next) = self.cache.scan(prefix, cursor, 64).await?;
            for key in keys {
                if let Some(bytes) = self.cache.get(&key).await? {
                    let metadata: ObjectMetadata =
                        serde_json::from_slice(&bytes).context("decode snapshot")?;
                    out.push(metadata);
                }
            }
            match next {
                Some(c) => cursor = c,
                None => break,
            }
        }
        Ok(out)
    }
}

/// Helper for tests: memory-backed boundaries and a recording transport.
pub fn with_memory_boundaries(
    cfg: SyncConfig,
) -> anyhow::Result<(EngineCoordinator, Arc<RecordingTransport>, Arc<MemoryCache>)> {
    let transport = Arc::new(RecordingTransport::new());
    let cache = Arc::new(MemoryCache::new());
    let coordinator = EngineCoordinator::new(
        cfg,
        Box::new(crate::boundary::NullMovement),
        Arc::clone(&cache) as Arc<dyn CacheStore>,
        Arc::clone(&transport) as Arc<dyn Transport>,
    )?;
    Ok((coordinator, transport, cache))
}
