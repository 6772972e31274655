//! Replicated entity storage.
//!
//! One typed store per registered kind, erased behind [`Replica`] so the
//! coordinator can dispatch on the kind strings the spatial index hands
//! back. Schemas are attached at registration; the delta math itself lives
//! in `sync_core::delta`.

use std::any::Any;
use std::collections::HashMap;

use anyhow::bail;

use sync_core::delta::{SyncDelta, SyncSchema, SyncState};
use sync_core::math::IVec2;

/// Type-erased view over one kind's typed store.
pub trait Replica: Send {
    fn kind(&self) -> &str;
    fn len(&self) -> usize;
    fn contains(&self, id: &str) -> bool;
    fn remove(&mut self, id: &str) -> bool;
    /// Writes the entity's position field, when the kind registered one.
    fn apply_position(&mut self, id: &str, position: IVec2);
    /// Delta for one entity relative to one recipient's history.
    fn delta_for(&self, id: &str, state: &mut SyncState) -> Option<SyncDelta>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Typed entity store plus its schema.
pub struct TypedReplica<E> {
    schema: SyncSchema<E>,
    entities: HashMap<String, E>,
    position_setter: Option<fn(&mut E, IVec2)>,
}

impl<E: Send + 'static> TypedReplica<E> {
    pub fn new(schema: SyncSchema<E>, position_setter: Option<fn(&mut E, IVec2)>) -> Self {
        Self {
            schema,
            entities: HashMap::new(),
            position_setter,
        }
    }

    pub fn schema(&self) -> &SyncSchema<E> {
        &self.schema
    }

    pub fn insert(&mut self, id: impl Into<String>, entity: E) {
        self.entities.insert(id.into(), entity);
    }

    pub fn get(&self, id: &str) -> Option<&E> {
        self.entities.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut E> {
        self.entities.get_mut(id)
    }
}

impl<E: Send + 'static> Replica for TypedReplica<E> {
    fn kind(&self) -> &str {
        self.schema.kind()
    }

    fn len(&self) -> usize {
        self.entities.len()
    }

    fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    fn remove(&mut self, id: &str) -> bool {
        self.entities.remove(id).is_some()
    }

    fn apply_position(&mut self, id: &str, position: IVec2) {
        if let Some(set) = self.position_setter {
            if let Some(entity) = self.entities.get_mut(id) {
                set(entity, position);
            }
        }
    }

    fn delta_for(&self, id: &str, state: &mut SyncState) -> Option<SyncDelta> {
        self.entities
            .get(id)
            .map(|e| self.schema.compute_delta(e, state))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// All registered kinds, dispatchable by kind string.
#[derive(Default)]
pub struct ReplicaSet {
    replicas: HashMap<String, Box<dyn Replica>>,
}

impl ReplicaSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a kind. Double registration is a configuration error.
    pub fn register<E: Send + 'static>(
        &mut self,
        schema: SyncSchema<E>,
        position_setter: Option<fn(&mut E, IVec2)>,
    ) -> anyhow::Result<()> {
        let kind = schema.kind().to_string();
        if self.replicas.contains_key(&kind) {
            bail!("kind '{kind}' is already registered");
        }
        self.replicas
            .insert(kind, Box::new(TypedReplica::new(schema, position_setter)));
        Ok(())
    }

    pub fn contains_kind(&self, kind: &str) -> bool {
        self.replicas.contains_key(kind)
    }

    /// Registered kind strings, sorted for stable iteration.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.replicas.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn get(&self, kind: &str) -> Option<&dyn Replica> {
        self.replicas.get(kind).map(|b| b.as_ref())
    }

    /// Downcasts a kind's store to its concrete entity type.
    pub fn typed<E: Send + 'static>(&self, kind: &str) -> Option<&TypedReplica<E>> {
        self.replicas
            .get(kind)
            .and_then(|b| b.as_any().downcast_ref::<TypedReplica<E>>())
    }

    pub fn typed_mut<E: Send + 'static>(&mut self, kind: &str) -> Option<&mut TypedReplica<E>> {
        self.replicas
            .get_mut(kind)
            .and_then(|b| b.as_any_mut().downcast_mut::<TypedReplica<E>>())
    }

    pub fn delta_for(
        &self,
        kind: &str,
        id: &str,
        state: &mut SyncState,
    ) -> Option<SyncDelta> {
        self.replicas.get(kind)?.delta_for(id, state)
    }

    pub fn apply_position(&mut self, kind: &str, id: &str, position: IVec2) {
        if let Some(replica) = self.replicas.get_mut(kind) {
            replica.apply_position(id, position);
        }
    }

    pub fn remove(&mut self, kind: &str, id: &str) -> bool {
        self.replicas
            .get_mut(kind)
            .map(|r| r.remove(id))
            .unwrap_or(false)
    }
}
