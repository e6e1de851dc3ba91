//! Audit trail for registry mutations.
//!
//! Every change to a node row or to the global settings produces one
//! structured [`AuditEntry`]. Entries accumulate in an [`AuditLog`] owned
//! by the registry store and are flushed inside the same transaction as
//! the mutation they describe; a rollback or a connection loss discards
//! them, so committed mutations and audit entries stay in lockstep.

use crate::types::{Cuid, NodeStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit entry action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Add,
    Update,
    Delete,
}

/// Entity the entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntity {
    Node,
    Settings,
}

/// A single field change recorded against an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: String,
    pub new: String,
}

/// One structured audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub entity: AuditEntity,
    pub entity_id: String,
    pub entity_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub changes: Vec<FieldChange>,
}

impl AuditEntry {
    fn new(action: AuditAction, entity: AuditEntity, id: String, name: String) -> Self {
        AuditEntry {
            timestamp: Utc::now(),
            action,
            entity,
            entity_id: id,
            entity_name: name,
            changes: Vec::new(),
        }
    }

    /// Entry for a freshly inserted node row.
    pub fn node_add(id: &Cuid, name: &str, status: NodeStatus) -> Self {
        Self::new(AuditAction::Add, AuditEntity::Node, id.to_string(), name.to_string())
            .with_change("status", "", &status.as_i32().to_string())
    }

    /// Entry for an update of a node row; attach changes with
    /// [`AuditEntry::with_change`].
    pub fn node_update(id: &Cuid, name: &str) -> Self {
        Self::new(AuditAction::Update, AuditEntity::Node, id.to_string(), name.to_string())
    }

    /// Entry for a deleted node row.
    pub fn node_delete(id: &Cuid, name: &str) -> Self {
        Self::new(AuditAction::Delete, AuditEntity::Node, id.to_string(), name.to_string())
    }

    /// Entry for a global settings change.
    pub fn settings_update() -> Self {
        AuditEntry::new(
            AuditAction::Update,
            AuditEntity::Settings,
            "config".to_string(),
            "settings".to_string(),
        )
    }

    pub fn with_change(mut self, field: &str, old: impl ToString, new: impl ToString) -> Self {
        self.changes.push(FieldChange {
            field: field.to_string(),
            old: old.to_string(),
            new: new.to_string(),
        });
        self
    }
}

/// Accumulator for the audit entries of one transaction.
#[derive(Debug, Default)]
pub struct AuditLog {
    enabled: bool,
    entries: Vec<AuditEntry>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh batch. Entries pushed while disabled are dropped.
    pub fn begin(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.entries.clear();
    }

    pub fn push(&mut self, entry: AuditEntry) {
        if self.enabled {
            self.entries.push(entry);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain the accumulated batch for flushing.
    pub fn take(&mut self) -> Vec<AuditEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Discard the accumulated batch.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
