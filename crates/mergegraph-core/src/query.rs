//! # Query Module
//!
//! Search filters and positional reconstruction of stored records.
//!
//! Rows fetched from the graph are re-nested here: plain properties through
//! `hydrate`, nested children and reference edges by grouping their slots per
//! field in position order. Any row that does not fit its schema is reported
//! as `InconsistentStore`.

use crate::codec::hydrate;
use crate::graph::{NodeQuery, NodeRecord, ReferenceFilter};
use crate::identity::identity_of;
use crate::primitives::{DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT};
use crate::schema::{EntitySchema, FieldKind, TypeSchema};
use crate::types::{
    EntityType, ExtractedItem, Identifier, MergeGraphError, NodeKind, Record, RuleKind, RuleSet,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// SEARCH FILTER
// =============================================================================

/// Caller-facing search predicate for extracted and merged items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchFilter {
    /// Full-text terms; all must match, case-insensitive.
    pub query: Option<String>,
    /// Exact item identifier.
    pub identifier: Option<Identifier>,
    /// Exact group identity.
    #[serde(rename = "stableTargetId")]
    pub group_identity: Option<Identifier>,
    /// Allowed stem types.
    pub entity_types: Vec<EntityType>,
    /// Items referencing any of these group identities.
    pub referenced_identifiers: Vec<Identifier>,
    /// Restrict `referenced_identifiers` to one reference field.
    pub reference_field: Option<String>,
}

impl SearchFilter {
    /// The full-text query, ignoring blank ones.
    fn full_text(&self) -> Option<&str> {
        self.query.as_deref().filter(|q| !q.trim().is_empty())
    }

    /// Reject unsupported combinations.
    pub fn validate(&self) -> Result<(), MergeGraphError> {
        let scoped = self.identifier.is_some() || self.group_identity.is_some();
        if scoped && self.full_text().is_some() {
            return Err(MergeGraphError::InvalidRequest(
                "full-text search cannot be combined with identifier or stableTargetId filters"
                    .to_string(),
            ));
        }
        if self.reference_field.is_some() && self.referenced_identifiers.is_empty() {
            return Err(MergeGraphError::InvalidRequest(
                "referenceField needs referencedIdentifiers".to_string(),
            ));
        }
        Ok(())
    }

    /// The store query for the given node kinds, without pagination.
    #[must_use]
    pub fn to_query(&self, kinds: impl IntoIterator<Item = NodeKind>) -> NodeQuery {
        let mut query = NodeQuery::new()
            .kinds(kinds)
            .stems(self.entity_types.iter().cloned());
        query.identifier = self.identifier.clone();
        query.group = self.group_identity.clone();
        query.full_text = self.full_text().map(str::to_string);
        if !self.referenced_identifiers.is_empty() {
            query = query.references(ReferenceFilter {
                field: self.reference_field.clone(),
                targets: self.referenced_identifiers.iter().cloned().collect(),
            });
        }
        query
    }
}

/// The page size to use for a requested limit.
#[must_use]
pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_SEARCH_LIMIT).min(MAX_SEARCH_LIMIT)
}

// =============================================================================
// RECONSTRUCTION
// =============================================================================

fn inconsistent(record: &NodeRecord, reason: impl std::fmt::Display) -> MergeGraphError {
    MergeGraphError::InconsistentStore(format!(
        "{} {}: {reason}",
        record.key.kind, record.key.identifier
    ))
}

fn collect_field(
    record: &NodeRecord,
    field: &str,
    list: bool,
    values: Vec<Value>,
) -> Result<Option<Value>, MergeGraphError> {
    if list {
        return Ok(Some(Value::Array(values)));
    }
    let mut values = values.into_iter();
    match (values.next(), values.next()) {
        (value, None) => Ok(value),
        (Some(_), Some(_)) => Err(inconsistent(record, format!("{field} holds several values"))),
        (None, Some(_)) => Ok(None),
    }
}

/// Re-nest the fields of a stored node under a type schema or rule view.
pub fn reconstruct_fields(
    record: &NodeRecord,
    schema: &TypeSchema,
    schemas: &impl EntitySchema,
) -> Result<Record, MergeGraphError> {
    let mut fields =
        hydrate(&record.properties, &schema.plain_shape()).map_err(|e| inconsistent(record, e))?;

    let mut nested: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    for (slot, child) in &record.nested {
        let spec = schema
            .field(&slot.field)
            .ok_or_else(|| inconsistent(record, format!("unknown nested field {}", slot.field)))?;
        let FieldKind::Nested(label) = &spec.kind else {
            return Err(inconsistent(record, format!("{} is not nested", slot.field)));
        };
        if *label != child.label {
            return Err(inconsistent(
                record,
                format!("{} holds {} instead of {label}", slot.field, child.label),
            ));
        }
        let shape = schemas
            .nested_shape(label)
            .ok_or_else(|| inconsistent(record, format!("unknown nested type {label}")))?;
        let value = hydrate(&child.properties, shape).map_err(|e| inconsistent(record, e))?;
        nested
            .entry(slot.field.as_str())
            .or_default()
            .push(Value::Object(value));
    }

    let mut references: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    for (slot, target) in &record.edges {
        let spec = schema
            .field(&slot.field)
            .ok_or_else(|| {
                inconsistent(record, format!("unknown reference field {}", slot.field))
            })?;
        if spec.kind != FieldKind::Reference {
            return Err(inconsistent(record, format!("{} is not a reference", slot.field)));
        }
        references
            .entry(slot.field.as_str())
            .or_default()
            .push(Value::String(target.to_string()));
    }

    for (field, values) in nested.into_iter().chain(references) {
        let list = schema.field(field).is_some_and(|spec| spec.list);
        if let Some(value) = collect_field(record, field, list, values)? {
            fields.insert(field.to_string(), value);
        }
    }
    Ok(fields)
}

/// Rebuild an extracted item from its stored node.
pub fn reconstruct_item(
    record: &NodeRecord,
    schemas: &impl EntitySchema,
) -> Result<ExtractedItem, MergeGraphError> {
    if record.key.kind != NodeKind::Extracted {
        return Err(inconsistent(record, "not an extracted item"));
    }
    let schema = schemas
        .type_schema(&record.stem)
        .ok_or_else(|| inconsistent(record, format!("unknown entity type {}", record.stem)))?;
    let identity = identity_of(record)?;
    let mut item = ExtractedItem::new(record.stem.clone(), &identity);
    item.fields = reconstruct_fields(record, schema, schemas)?;
    Ok(item)
}

/// Rebuild the rule set of a group from its component rows.
///
/// No rows means no rule set. Anything other than exactly one row per rule
/// component, all of one stem type, is corruption.
pub fn reconstruct_rule_set(
    rows: &[NodeRecord],
    schemas: &impl EntitySchema,
) -> Result<Option<RuleSet>, MergeGraphError> {
    let Some(first) = rows.first() else {
        return Ok(None);
    };
    let kinds: BTreeSet<NodeKind> = rows.iter().map(|r| r.key.kind).collect();
    if rows.len() != RuleKind::ALL.len() || kinds.len() != RuleKind::ALL.len() {
        return Err(MergeGraphError::InconsistentStore(format!(
            "group {} has {} rule components, expected {}",
            first.group,
            rows.len(),
            RuleKind::ALL.len()
        )));
    }
    if let Some(other) = rows.iter().find(|r| r.stem != first.stem) {
        return Err(inconsistent(
            other,
            format!("rule component of {} next to {}", other.stem, first.stem),
        ));
    }

    let schema = schemas
        .type_schema(&first.stem)
        .ok_or_else(|| inconsistent(first, format!("unknown entity type {}", first.stem)))?;
    let mut rule_set = RuleSet::new(first.stem.clone());
    for row in rows {
        let kind = RuleKind::from_node_kind(row.key.kind)
            .ok_or_else(|| inconsistent(row, "not a rule component"))?;
        *rule_set.component_mut(kind) = reconstruct_fields(row, &schema.rule_view(kind), schemas)?;
    }
    Ok(Some(rule_set))
}

// =============================================================================
// TESTS
// =============================================================================
