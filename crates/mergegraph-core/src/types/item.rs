//! Records exchanged with callers: extracted items, rule sets, merged items.

use super::{EntityType, Identifier, Identity, MergeGraphError, NodeKind};
use crate::schema::TypeSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A nested, schema-typed record keyed by field name.
pub type Record = serde_json::Map<String, Value>;

// =============================================================================
// EXTRACTED ITEM
// =============================================================================

/// One source system's assertion about one entity.
///
/// Superseded, never mutated: resubmitting the same `identifier` replaces the
/// stored plain fields, nested values and reference edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedItem {
    /// The entity stem type.
    #[serde(rename = "entityType")]
    pub entity_type: EntityType,
    /// Globally unique, immutable identifier.
    pub identifier: Identifier,
    /// The cross-source entity group.
    #[serde(rename = "stableTargetId")]
    pub group_identity: Identifier,
    /// The source system that produced the item.
    #[serde(rename = "hadPrimarySource")]
    pub primary_source: Identifier,
    /// The entity's key within that source.
    #[serde(rename = "identifierInPrimarySource")]
    pub source_local_id: String,
    /// Entity-type-specific fields.
    #[serde(flatten)]
    pub fields: Record,
}

impl ExtractedItem {
    /// Create an item without fields for a resolved identity.
    #[must_use]
    pub fn new(entity_type: EntityType, identity: &Identity) -> Self {
        Self {
            entity_type,
            identifier: identity.identifier.clone(),
            group_identity: identity.group_identity.clone(),
            primary_source: identity.primary_source.clone(),
            source_local_id: identity.source_local_id.clone(),
            fields: Record::new(),
        }
    }

    /// Set a field, replacing any previous value.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// The identity this item was submitted under.
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity {
            identifier: self.identifier.clone(),
            group_identity: self.group_identity.clone(),
            primary_source: self.primary_source.clone(),
            source_local_id: self.source_local_id.clone(),
        }
    }
}

// =============================================================================
// RULE SET
// =============================================================================

/// The three curator rule components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleKind {
    /// Values appended after the union of extracted items.
    Additive,
    /// Values removed after the additive overlay.
    Subtractive,
    /// Primary sources whose contributions are skipped per field.
    Preventive,
}

impl RuleKind {
    /// All rule components in application order.
    pub const ALL: [Self; 3] = [Self::Additive, Self::Subtractive, Self::Preventive];

    /// The node kind storing this component.
    #[must_use]
    pub const fn node_kind(self) -> NodeKind {
        match self {
            Self::Additive => NodeKind::Additive,
            Self::Subtractive => NodeKind::Subtractive,
            Self::Preventive => NodeKind::Preventive,
        }
    }

    /// The component stored under a node kind, if it is a rule kind.
    #[must_use]
    pub const fn from_node_kind(kind: NodeKind) -> Option<Self> {
        match kind {
            NodeKind::Additive => Some(Self::Additive),
            NodeKind::Subtractive => Some(Self::Subtractive),
            NodeKind::Preventive => Some(Self::Preventive),
            NodeKind::Extracted | NodeKind::Merged => None,
        }
    }
}

/// Curator overrides for one group identity.
///
/// Each component is a partial record of the entity type. Preventive
/// components list primary source identifiers per field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    /// The stem type shared by all three components.
    #[serde(rename = "entityType")]
    pub entity_type: EntityType,
    /// Values to add.
    #[serde(default)]
    pub additive: Record,
    /// Values to remove.
    #[serde(default)]
    pub subtractive: Record,
    /// Primary sources to ignore per field.
    #[serde(default)]
    pub preventive: Record,
}

impl RuleSet {
    /// Create an empty rule set for a stem type.
    #[must_use]
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            additive: Record::new(),
            subtractive: Record::new(),
            preventive: Record::new(),
        }
    }

    /// Set one field of one component.
    #[must_use]
    pub fn with_rule(mut self, kind: RuleKind, field: impl Into<String>, value: Value) -> Self {
        self.component_mut(kind).insert(field.into(), value);
        self
    }

    /// Borrow one component.
    #[must_use]
    pub fn component(&self, kind: RuleKind) -> &Record {
        match kind {
            RuleKind::Additive => &self.additive,
            RuleKind::Subtractive => &self.subtractive,
            RuleKind::Preventive => &self.preventive,
        }
    }

    /// Mutably borrow one component.
    pub fn component_mut(&mut self, kind: RuleKind) -> &mut Record {
        match kind {
            RuleKind::Additive => &mut self.additive,
            RuleKind::Subtractive => &mut self.subtractive,
            RuleKind::Preventive => &mut self.preventive,
        }
    }

    /// Check that every rule targets a mergeable field of the type.
    ///
    /// Preventive rules must list primary source identifiers as strings.
    pub fn validate(&self, schema: &TypeSchema) -> Result<(), MergeGraphError> {
        if self.entity_type != schema.stem {
            return Err(MergeGraphError::InvalidRequest(format!(
                "rule set of type {} cannot apply to {}",
                self.entity_type, schema.stem
            )));
        }
        for kind in RuleKind::ALL {
            for (field, value) in self.component(kind) {
                if schema.field(field).is_none() {
                    return Err(MergeGraphError::InvalidRequest(format!(
                        "{kind:?} rule targets unknown field {field} of {}",
                        schema.stem
                    )));
                }
                if kind == RuleKind::Preventive
                    && !crate::codec::values_of(value).iter().all(|v| v.is_string())
                {
                    return Err(MergeGraphError::InvalidRequest(format!(
                        "preventive rule on {field} must list primary source identifiers"
                    )));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// MERGED ITEM
// =============================================================================

/// Validation mode of a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// Hypothetical merge; cardinality and required-ness are not enforced.
    Preview,
    /// Canonical merge; the schema's cardinality is enforced.
    #[default]
    Strict,
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preview => f.write_str("preview"),
            Self::Strict => f.write_str("strict"),
        }
    }
}

impl FromStr for MergeMode {
    type Err = MergeGraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preview" => Ok(Self::Preview),
            "strict" => Ok(Self::Strict),
            other => Err(MergeGraphError::InvalidRequest(format!(
                "unknown merge mode: {other}"
            ))),
        }
    }
}

/// The derived, non-persisted view of one group identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedItem {
    /// The stem type.
    #[serde(rename = "entityType")]
    pub entity_type: EntityType,
    /// The group identity.
    pub identifier: Identifier,
    /// The merged fields.
    #[serde(flatten)]
    pub fields: Record,
}

impl MergedItem {
    /// Borrow a merged field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// One page of search results plus the total match count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paged<T> {
    /// Number of matches across all pages.
    pub total: usize,
    /// The requested page.
    pub items: Vec<T>,
}
