//! # Core Type Definitions
//!
//! This module contains all core types of the merge engine:
//! - Identifiers and entity typing (`Identifier`, `EntityType`, `NodeKind`, `NodeLabel`)
//! - Identity resolution results (`Identity`)
//! - Records (`ExtractedItem`, `RuleSet`, `MergedItem`) in the `item` submodule
//! - Error types (`MergeGraphError`, `StoreError`, `CodecError`)
//!
//! ## Ordering Guarantees
//!
//! Every identifier type implements `Ord` so that items, groups and nodes are
//! always processed in identifier order, independent of submission order.

mod item;

pub use item::{ExtractedItem, MergeMode, MergedItem, Paged, Record, RuleKind, RuleSet};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Opaque, globally unique identifier of an item or an entity group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    /// Wrap an existing identifier value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Mint a fresh, collision-free identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The stem type of an entity, e.g. `Person` or `Organization`.
///
/// The stem is shared by the extracted, merged and rule variants of a type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    /// Create a new entity type from its stem name.
    #[must_use]
    pub fn new(stem: impl Into<String>) -> Self {
        Self(stem.into())
    }

    /// Get the stem name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// NODE KINDS & LABELS
// =============================================================================

/// The closed set of node variants stored per stem type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// A source's assertion about one entity.
    Extracted,
    /// The anchor node of a group identity.
    Merged,
    /// Rule component adding values.
    Additive,
    /// Rule component removing values.
    Subtractive,
    /// Rule component blocking primary sources.
    Preventive,
}

impl NodeKind {
    /// All node kinds in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Extracted,
        Self::Merged,
        Self::Additive,
        Self::Subtractive,
        Self::Preventive,
    ];

    /// The label prefix combined with the stem type, e.g. `Extracted`.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Extracted => "Extracted",
            Self::Merged => "Merged",
            Self::Additive => "Additive",
            Self::Subtractive => "Subtractive",
            Self::Preventive => "Preventive",
        }
    }

    /// Whether this kind is one of the three rule components.
    #[must_use]
    pub const fn is_rule(self) -> bool {
        matches!(self, Self::Additive | Self::Subtractive | Self::Preventive)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A full node label: kind prefix plus stem type, e.g. `ExtractedPerson`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeLabel {
    /// The node variant.
    pub kind: NodeKind,
    /// The entity stem type.
    pub stem: EntityType,
}

impl NodeLabel {
    /// Create a label from its parts.
    #[must_use]
    pub fn new(kind: NodeKind, stem: EntityType) -> Self {
        Self { kind, stem }
    }
}

impl fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.stem)
    }
}

impl FromStr for NodeLabel {
    type Err = MergeGraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeKind::ALL
            .iter()
            .find_map(|kind| {
                s.strip_prefix(kind.prefix())
                    .filter(|stem| !stem.is_empty())
                    .map(|stem| Self::new(*kind, EntityType::new(stem)))
            })
            .ok_or_else(|| MergeGraphError::InvalidRequest(format!("unknown node label: {s}")))
    }
}

// =============================================================================
// IDENTITY
// =============================================================================

/// The resolution of `(primarySourceRef, sourceLocalId)` to its stable ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// The item identifier.
    pub identifier: Identifier,
    /// The group identity shared with other sources' items.
    #[serde(rename = "stableTargetId")]
    pub group_identity: Identifier,
    /// The source system that produced the item.
    #[serde(rename = "hadPrimarySource")]
    pub primary_source: Identifier,
    /// The entity's key within the source system.
    #[serde(rename = "identifierInPrimarySource")]
    pub source_local_id: String,
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Failures reported by a `GraphStore` backend.
///
/// Only `Transient` failures are retried by the connector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Connection or session level failure, e.g. an expired session.
    #[error("Transient store failure: {0}")]
    Transient(String),

    /// The store rejected the credentials.
    #[error("Store authentication failed: {0}")]
    Authentication(String),

    /// The store rejected the statement itself.
    #[error("Malformed store statement: {0}")]
    Malformed(String),

    /// An I/O error inside the store.
    #[error("Store I/O error: {0}")]
    Io(String),

    /// A stored record could not be encoded or decoded.
    #[error("Store serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the failure may succeed when the statement is retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Malformed nested or flat structures handed to the codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// A path crosses more than one list axis.
    #[error("Multiple lists per path: {path}")]
    MultipleListsPerPath {
        /// The offending path.
        path: String,
    },

    /// The flat value does not have the cardinality the shape demands.
    #[error("Shape mismatch at {key}: expected {expected}")]
    ShapeMismatch {
        /// The flat key or nested path.
        key: String,
        /// What the shape expected at that key.
        expected: &'static str,
    },

    /// The flat key has no counterpart in the shape.
    #[error("Unknown key: {0}")]
    UnknownKey(String),
}

/// Errors that can occur in the merge engine.
///
/// - No silent failures
/// - Use `Result<T, MergeGraphError>` for fallible operations
/// - Store corruption is never retried
#[derive(Debug, Error)]
pub enum MergeGraphError {
    /// An expected-exactly-one query returned zero rows.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An expected-exactly-one query returned more than one row.
    #[error("Multiple found: {count} rows for {what}")]
    MultipleFound {
        /// Description of what was looked up.
        what: String,
        /// Number of rows returned.
        count: usize,
    },

    /// Committed state does not match its expected structure.
    #[error("Inconsistent store: {0}")]
    InconsistentStore(String),

    /// A store failure that survived the retry policy.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A malformed record shape.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A strict-mode merge violated the schema's cardinality.
    #[error("Cardinality violation on {field}: {reason}")]
    Cardinality {
        /// The offending field.
        field: String,
        /// What was violated.
        reason: String,
    },

    /// The caller supplied an invalid request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Neither extracted items nor a rule set exist for the group.
    #[error("Nothing to merge for group {0}")]
    NothingToMerge(Identifier),

    /// The operation is an explicit extension point.
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
}

// =============================================================================
// TESTS
// =============================================================================
