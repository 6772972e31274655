//! World partitioning.
//!
//! Tiles a world extent into partitions no larger than a configured extent,
//! clipping the final row/column to the remainder. Iteration order is
//! row-major and stable across calls with identical inputs; downstream
//! partition-to-worker assignment relies on that.

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::math::IVec2;

/// A width/height pair in world units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub width: i32,
    pub height: i32,
}

impl Extent {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }
}

/// One rectangular region of the tiled world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Top-left corner.
    pub position: IVec2,
    pub width: i32,
    pub height: i32,
}

/// Tiles `world` into partitions no larger than `cell`, row-major.
///
/// Fails fast on non-positive dimensions; a bad world extent is a
/// configuration error, not a runtime condition.
pub fn calculate_partitions(world: Extent, cell: Extent) -> anyhow::Result<Vec<Partition>> {
    if world.width <= 0 || world.height <= 0 {
        bail!(
            "world extent must be positive, got {}x{}",
            world.width,
            world.height
        );
    }
    if cell.width <= 0 || cell.height <= 0 {
        bail!(
            "partition extent must be positive, got {}x{}",
            cell.width,
            cell.height
        );
    }

    let rows = (world.height + cell.height - 1) / cell.height;
    let cols = (world.width + cell.width - 1) / cell.width;

    let mut partitions = Vec::with_capacity((rows * cols) as usize);
    for r in 0..rows {
        for c in 0..cols {
            let position = IVec2::new(c * cell.width, r * cell.height);
            partitions.push(Partition {
                position,
                width: cell.width.min(world.width - position.x),
                height: cell.height.min(world.height - position.y),
            });
        }
    }
    Ok(partitions)
}
