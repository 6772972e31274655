//! `sync_server`
//!
//! The engine coordinator: owns the master tick, composes the core leaves
//! (spatial index, delta tracker, partitioner, cycle scheduler), and talks
//! to the outside world through the boundary traits.

pub mod boundary;
pub mod coordinator;
pub mod replicate;
pub mod session;
