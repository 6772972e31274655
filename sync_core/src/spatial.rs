//! Spatial grid index.
//!
//! Positioned objects are bucketed into fixed-size square cells, scoped by
//! room, so a proximity query only touches the cells overlapping the search
//! area. Cost tracks local density, not world population.
//!
//! The index keeps three views of the same population: cell buckets, type
//! buckets, and the instance records themselves. Every mutation goes through
//! `&mut self` and updates all three together; share the index behind a
//! single lock, never as independently locked maps.

use std::collections::{HashMap, HashSet};
use std::fmt;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::math::IVec2;

/// Record tracked for every live object.
///
/// Invariant: while live, the object appears in exactly one grid cell, one
/// type bucket, and one instance record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Unique instance id.
    pub instance_id: String,
    /// Room the object belongs to, for broadcast scoping.
    pub room_id: String,
    /// World position.
    pub position: IVec2,
    /// Type key, e.g. `"npc"` or `"player"`.
    pub kind: String,
}

/// Cell coordinate, derived from a position by floor division.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellKey {
    pub col: i32,
    pub row: i32,
}

impl CellKey {
    /// Bucket for `position` under the given cell size.
    ///
    /// `div_euclid` keeps negative coordinates in their own cells instead of
    /// folding them into cell 0.
    pub fn of(position: IVec2, cell_size: i32) -> Self {
        Self {
            col: position.x.div_euclid(cell_size),
            row: position.y.div_euclid(cell_size),
        }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.col, self.row)
    }
}

/// Bucketed 2D proximity index over live objects.
pub struct SpatialGrid {
    cell_size: i32,
    grid: HashMap<CellKey, HashSet<String>>,
    type_map: HashMap<String, HashSet<String>>,
    instances: HashMap<String, ObjectMetadata>,
}

impl SpatialGrid {
    /// Creates an empty index with the given cell size.
    pub fn new(cell_size: i32) -> anyhow::Result<Self> {
        if cell_size <= 0 {
            bail!("grid cell size must be positive, got {cell_size}");
        }
        Ok(Self {
            cell_size,
            grid: HashMap::new(),
            type_map: HashMap::new(),
            instances: HashMap::new(),
        })
    }

    pub fn cell_size(&self) -> i32 {
        self.cell_size
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Inserts an object into all three views, creating missing buckets.
    ///
    /// An existing object with the same id is removed first so the one-cell /
    /// one-bucket / one-record invariant holds across re-adds.
    pub fn add(&mut self, metadata: ObjectMetadata) {
        if self.instances.contains_key(&metadata.instance_id) {
            self.remove(&metadata.instance_id);
        }

        let cell = CellKey::of(metadata.position, self.cell_size);
        self.grid
            .entry(cell)
            .or_default()
            .insert(metadata.instance_id.clone());
        self.type_map
            .entry(metadata.kind.clone())
            .or_default()
            .insert(metadata.instance_id.clone());
        self.instances
            .insert(metadata.instance_id.clone(), metadata);
    }

    /// Removes an object from all three views.
    ///
    /// Unknown ids return `None`; removal never fails.
    pub fn remove(&mut self, id: &str) -> Option<ObjectMetadata> {
        let metadata = self.instances.remove(id)?;

        let cell = CellKey::of(metadata.position, self.cell_size);
        if let Some(bucket) = self.grid.get_mut(&cell) {
            bucket.remove(id);
            if bucket.is_empty() {
                self.grid.remove(&cell);
            }
        }
        if let Some(bucket) = self.type_map.get_mut(&metadata.kind) {
            bucket.remove(id);
            if bucket.is_empty() {
                self.type_map.remove(&metadata.kind);
            }
        }

        Some(metadata)
    }

    /// Moves an object to a new position, rebucketing only when its cell
    /// changes. Returns false for unknown ids.
    pub fn move_to(&mut self, id: &str, new_position: IVec2) -> bool {
        let Some(metadata) = self.instances.get_mut(id) else {
            return false;
        };

        let old_cell = CellKey::of(metadata.position, self.cell_size);
        let new_cell = CellKey::of(new_position, self.cell_size);
        metadata.position = new_position;

        if old_cell != new_cell {
            if let Some(bucket) = self.grid.get_mut(&old_cell) {
                bucket.remove(id);
                if bucket.is_empty() {
                    self.grid.remove(&old_cell);
                }
            }
            self.grid
                .entry(new_cell)
                .or_default()
                .insert(id.to_string());
        }
        true
    }

    /// Objects of `kind` in `room_id` within Euclidean distance `radius` of
    /// `center`.
    ///
    /// Candidates come only from cells overlapping the bounding box
    /// `[center - radius, center + radius]`; the exact distance filter runs
    /// on those. Unknown kinds/rooms and negative radii yield empty results.
    pub fn query(
        &self,
        kind: &str,
        center: IVec2,
        radius: i32,
        room_id: &str,
    ) -> Vec<ObjectMetadata> {
        if radius < 0 {
            return Vec::new();
        }

        let min = CellKey::of(
            IVec2::new(
                center.x.saturating_sub(radius),
                center.y.saturating_sub(radius),
            ),
            self.cell_size,
        );
        let max = CellKey::of(
            IVec2::new(
                center.x.saturating_add(radius),
                center.y.saturating_add(radius),
            ),
            self.cell_size,
        );

        let mut hits = Vec::new();
        for row in min.row..=max.row {
            for col in min.col..=max.col {
                let Some(bucket) = self.grid.get(&CellKey { col, row }) else {
                    continue;
                };
                for id in bucket {
                    let Some(metadata) = self.instances.get(id) else {
                        continue;
                    };
                    if metadata.kind == kind
                        && metadata.room_id == room_id
                        && metadata.position.within(center, radius)
                    {
                        hits.push(metadata.clone());
                    }
                }
            }
        }
        hits
    }

    /// Full id → metadata snapshot for one type.
    pub fn get_by_type(&self, kind: &str) -> HashMap<String, ObjectMetadata> {
        let Some(ids) = self.type_map.get(kind) else {
            return HashMap::new();
        };
        ids.iter()
            .filter_map(|id| {
                self.instances
                    .get(id)
                    .map(|m| (id.clone(), m.clone()))
            })
            .collect()
    }

    /// Metadata snapshot for one type, used for room-wide broadcast scans.
    pub fn get_all_by_type(&self, kind: &str) -> Vec<ObjectMetadata> {
        let Some(ids) = self.type_map.get(kind) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.instances.get(id).cloned())
            .collect()
    }

    /// Looks up a single live record.
    pub fn instance(&self, id: &str) -> Option<&ObjectMetadata> {
        self.instances.get(id)
    }

    /// Iterates all live records.
    pub fn instances(&self) -> impl Iterator<Item = &ObjectMetadata> {
        self.instances.values()
    }

    /// Iterates occupied cells and their populations.
    pub fn cells(&self) -> impl Iterator<Item = (CellKey, &HashSet<String>)> {
        self.grid.iter().map(|(k, v)| (*k, v))
    }

    /// Ids currently bucketed under one type key.
    pub fn ids_of_type(&self, kind: &str) -> Option<&HashSet<String>> {
        self.type_map.get(kind)
    }

    /// Registered type keys, sorted for stable iteration.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.type_map.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}
