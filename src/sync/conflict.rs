//! Conflict detection
//!
//! Three-way diff between the last agreed snapshot (base), the local pending
//! value and the current server value. Fields changed on only one side merge
//! silently; fields changed on both sides to different values are conflicts.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::types::{ConflictDetails, EntityType, MutationKind};

/// Result of comparing base, local and server
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Disjoint changes; `merged` is safe to resubmit against the server version
    Clean { merged: Value },
    /// At least one field diverged on both sides
    Conflict {
        details: ConflictDetails,
        /// Non-conflicting fields resolved by whichever side changed them
        merged: Value,
    },
}

impl Detection {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Detection::Conflict { .. })
    }
}

/// Stateless three-way differ
pub struct ConflictDetector;

impl ConflictDetector {
    /// Compare a local update against the server's current value
    pub fn detect(base: &Value, local: &Value, server: &Value) -> Detection {
        let base_map = as_map(base);
        let local_map = as_map(local);
        let server_map = as_map(server);

        let mut merged = Map::new();
        let mut local_view = base_map.clone();
        let mut conflicting = Vec::new();

        for field in field_union(&[&base_map, &local_map, &server_map]) {
            let b = base_map.get(&field);
            let l = local_map.get(&field);
            let s = server_map.get(&field);

            let (value, is_conflict) = if l == b {
                (s, false)
            } else if s == b {
                (l, false)
            } else if l == s {
                (l, false)
            } else {
                // Placeholder until a resolution picks a side
                (s, true)
            };

            if is_conflict {
                conflicting.push(field.clone());
            }
            if let Some(v) = value {
                merged.insert(field.clone(), v.clone());
            }
            // Local view: base overlaid with every field local touched
            if l != b {
                match l {
                    Some(v) => local_view.insert(field, v.clone()),
                    None => local_view.remove(&field),
                };
            }
        }

        if conflicting.is_empty() {
            Detection::Clean {
                merged: Value::Object(merged),
            }
        } else {
            Detection::Conflict {
                details: ConflictDetails {
                    local_entity: Value::Object(local_view),
                    server_entity: server.clone(),
                    conflicting_fields: conflicting,
                },
                merged: Value::Object(merged),
            }
        }
    }

    /// Compare a local delete against the server's current value
    ///
    /// Every field the server changed since base is a conflict; if it
    /// changed nothing the delete can simply be rebased.
    pub fn detect_delete(base: &Value, server: &Value) -> Detection {
        let changed = changed_fields(base, server);
        if changed.is_empty() {
            Detection::Clean {
                merged: Value::Null,
            }
        } else {
            Detection::Conflict {
                details: ConflictDetails {
                    local_entity: Value::Null,
                    server_entity: server.clone(),
                    conflicting_fields: changed,
                },
                merged: server.clone(),
            }
        }
    }

    /// Compare a local update against a server-side deletion
    pub fn detect_server_deleted(base: &Value, local: &Value) -> Detection {
        let changed = changed_fields(base, local);
        if changed.is_empty() {
            Detection::Clean {
                merged: Value::Null,
            }
        } else {
            Detection::Conflict {
                details: ConflictDetails {
                    local_entity: local.clone(),
                    server_entity: Value::Null,
                    conflicting_fields: changed,
                },
                merged: local.clone(),
            }
        }
    }
}

fn as_map(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Sorted union of field names, so outputs are deterministic
fn field_union(maps: &[&Map<String, Value>]) -> BTreeSet<String> {
    maps.iter().flat_map(|m| m.keys().cloned()).collect()
}

fn changed_fields(base: &Value, other: &Value) -> Vec<String> {
    let base_map = as_map(base);
    let other_map = as_map(other);
    field_union(&[&base_map, &other_map])
        .into_iter()
        .filter(|field| base_map.get(field) != other_map.get(field))
        .collect()
}

// ============================================================================
// Merge Policy
// ============================================================================

/// Which side owns a field when both changed it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAuthority {
    /// System-authoritative (status, computed totals): server value wins
    Server,
    /// User-editable (notes, descriptions): local value wins
    Local,
}

/// Field-authority table applied by merge resolutions
#[derive(Debug, Clone)]
pub struct MergePolicy {
    fields: HashMap<String, FieldAuthority>,
    default_authority: FieldAuthority,
}

impl MergePolicy {
    /// Empty table; every conflicting field falls back to `default_authority`
    pub fn new(default_authority: FieldAuthority) -> Self {
        Self {
            fields: HashMap::new(),
            default_authority,
        }
    }

    /// Build a table from field lists
    pub fn from_lists<S: AsRef<str>>(server_fields: &[S], local_fields: &[S]) -> Self {
        let mut policy = Self::new(FieldAuthority::Server);
        for field in server_fields {
            policy = policy.with_field(field.as_ref(), FieldAuthority::Server);
        }
        for field in local_fields {
            policy = policy.with_field(field.as_ref(), FieldAuthority::Local);
        }
        policy
    }

    pub fn with_field(mut self, field: &str, authority: FieldAuthority) -> Self {
        self.fields.insert(field.to_string(), authority);
        self
    }

    pub fn authority(&self, field: &str) -> FieldAuthority {
        self.fields
            .get(field)
            .copied()
            .unwrap_or(self.default_authority)
    }

    /// Settle every conflicting field by authority on top of the clean merge
    pub fn apply(
        &self,
        merged: &Value,
        local: &Value,
        server: &Value,
        conflicting_fields: &[String],
    ) -> Value {
        let mut result = as_map(merged);
        let local_map = as_map(local);
        let server_map = as_map(server);

        for field in conflicting_fields {
            let winner = match self.authority(field) {
                FieldAuthority::Server => server_map.get(field),
                FieldAuthority::Local => local_map.get(field),
            };
            match winner {
                Some(value) => result.insert(field.clone(), value.clone()),
                None => result.remove(field),
            };
        }

        Value::Object(result)
    }
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self::from_lists(
            &["status", "total", "subtotal", "tax"],
            &["notes", "description"],
        )
    }
}

// ============================================================================
// Conflict Store
// ============================================================================

/// Everything needed to resolve a parked entity later
#[derive(Debug, Clone)]
pub struct ConflictRecord {
    pub entity_type: EntityType,
    pub kind: MutationKind,
    pub details: ConflictDetails,
    /// Clean merge of the non-conflicting fields
    pub merged: Value,
    /// `None` when the server deleted the entity
    pub server_version: Option<u64>,
}

/// Unresolved conflicts keyed by entity id
#[derive(Clone, Default)]
pub struct ConflictStore {
    records: Arc<RwLock<HashMap<String, ConflictRecord>>>,
}

impl ConflictStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_id: &str) -> Option<ConflictRecord> {
        self.records.read().get(entity_id).cloned()
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.records.read().contains_key(entity_id)
    }

    pub(crate) fn insert(&self, entity_id: &str, record: ConflictRecord) {
        self.records.write().insert(entity_id.to_string(), record);
    }

    pub(crate) fn take(&self, entity_id: &str) -> Option<ConflictRecord> {
        self.records.write().remove(entity_id)
    }
}
