//! Per-recipient sync deltas.
//!
//! Each replicated type registers an ordered field schema once. Computing a
//! delta walks the schema in bit order, compares each field against the last
//! value sent to that recipient, and returns a change mask plus the changed
//! values. Accessors are plain closures compiled at registration; nothing is
//! reflected per call.
//!
//! Recipient history (`SyncState`) belongs to the connection that receives
//! the deltas. Dropping the session drops the history.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::math::IVec2;

/// Width of the change mask. A schema with more tagged fields than this is
/// rejected at registration, never truncated at runtime.
pub const MAX_SYNCED_FIELDS: usize = 64;

bitflags::bitflags! {
    /// Options for a synced field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldFlags: u32 {
        const NONE = 0;
        /// Included in every delta even when the value is unchanged.
        const ALWAYS_SYNC = 1 << 0;
    }
}

impl Default for FieldFlags {
    fn default() -> Self {
        Self::NONE
    }
}

/// Snapshot of a synced field's value.
///
/// Compared by value: vector and list payloads diff structurally, so a
/// rebuilt-but-equal vector produces no delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Point(IVec2),
    List(Vec<SyncValue>),
}

impl From<bool> for SyncValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for SyncValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for SyncValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for SyncValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SyncValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SyncValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<IVec2> for SyncValue {
    fn from(v: IVec2) -> Self {
        Self::Point(v)
    }
}

type Accessor<E> = Arc<dyn Fn(&E) -> SyncValue + Send + Sync>;

/// One tagged field: precompiled accessor, bit index, options.
struct SyncedField<E> {
    name: &'static str,
    bit: u8,
    flags: FieldFlags,
    read: Accessor<E>,
}

/// Ordered field schema for one replicated type.
pub struct SyncSchema<E> {
    kind: String,
    fields: Vec<SyncedField<E>>,
}

/// Builds a schema field by field; bit indices follow insertion order.
pub struct SchemaBuilder<E> {
    kind: String,
    fields: Vec<SyncedField<E>>,
}

impl<E: 'static> SchemaBuilder<E> {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Vec::new(),
        }
    }

    /// Starts a schema whose first fields mirror `parent`, re-read through
    /// `project`, and whose numbering continues after the parent's maximum.
    ///
    /// This is how a derived type keeps the base type's bit layout: base
    /// fields first, derived fields appended.
    pub fn extending<P: 'static>(
        kind: impl Into<String>,
        parent: &SyncSchema<P>,
        project: fn(&E) -> &P,
    ) -> Self {
        let fields = parent
            .fields
            .iter()
            .map(|f| {
                let base = Arc::clone(&f.read);
                SyncedField {
                    name: f.name,
                    bit: f.bit,
                    flags: f.flags,
                    read: Arc::new(move |e: &E| base(project(e))) as Accessor<E>,
                }
            })
            .collect();
        Self {
            kind: kind.into(),
            fields,
        }
    }

    /// Appends a tagged field at the next bit index.
    pub fn field(
        mut self,
        name: &'static str,
        flags: FieldFlags,
        read: impl Fn(&E) -> SyncValue + Send + Sync + 'static,
    ) -> Self {
        let bit = self.fields.len().min(u8::MAX as usize) as u8;
        self.fields.push(SyncedField {
            name,
            bit,
            flags,
            read: Arc::new(read),
        });
        self
    }

    /// Finishes the schema. Too many fields or a duplicate name is a
    /// configuration error.
    pub fn build(self) -> anyhow::Result<SyncSchema<E>> {
        if self.fields.len() > MAX_SYNCED_FIELDS {
            bail!(
                "type '{}' tags {} fields; the change mask supports {}",
                self.kind,
                self.fields.len(),
                MAX_SYNCED_FIELDS
            );
        }
        for (i, f) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|other| other.name == f.name) {
                bail!("type '{}' tags field '{}' twice", self.kind, f.name);
            }
        }
        Ok(SyncSchema {
            kind: self.kind,
            fields: self.fields,
        })
    }
}

/// Delta produced for one (entity, recipient) pair.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncDelta {
    /// Bit i set ⇔ the field at bit index i appears in `changed`.
    pub mask: u64,
    /// Changed fields in bit order.
    pub changed: Vec<(String, SyncValue)>,
}

impl SyncDelta {
    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }
}

/// Last values sent to one recipient, per replicated kind.
///
/// Created lazily on the first delta for a kind and sized to that schema's
/// field count. Owned by the session; different recipients never share one.
#[derive(Default)]
pub struct SyncState {
    last: HashMap<String, Vec<Option<SyncValue>>>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of kinds this recipient has history for.
    pub fn kind_count(&self) -> usize {
        self.last.len()
    }

    /// Drops the history for one kind, forcing a full resend on next delta.
    pub fn forget_kind(&mut self, kind: &str) {
        self.last.remove(kind);
    }

    fn slots(&mut self, kind: &str, len: usize) -> &mut Vec<Option<SyncValue>> {
        let slots = self.last.entry(kind.to_string()).or_default();
        if slots.len() < len {
            slots.resize(len, None);
        }
        slots
    }
}

impl<E> SyncSchema<E> {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Field names in bit order.
    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.name)
    }

    /// Computes the changed-field delta for `entity` relative to what this
    /// recipient last saw, overwriting the stored snapshot as it goes.
    ///
    /// A field is included when its value differs from the stored one or it
    /// is marked `ALWAYS_SYNC`. O(field count); no other side effects.
    pub fn compute_delta(&self, entity: &E, state: &mut SyncState) -> SyncDelta {
        let slots = state.slots(&self.kind, self.fields.len());
        let mut delta = SyncDelta::default();

        for f in &self.fields {
            let current = (f.read)(entity);
            let slot = &mut slots[f.bit as usize];
            if f.flags.contains(FieldFlags::ALWAYS_SYNC) || slot.as_ref() != Some(&current) {
                delta.mask |= 1u64 << f.bit;
                *slot = Some(current.clone());
                delta.changed.push((f.name.to_string(), current));
            }
        }
        delta
    }
}
