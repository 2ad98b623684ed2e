//! # Ingestor Module
//!
//! Validation and the upsert/prune protocol for records written to the graph.
//!
//! - Validate every item of a batch before the first write
//! - Partition fields into plain, reference and nested value fields
//! - Upsert the node, then its nested children, then prune stale children
//! - Merge reference edges in a second pass, then prune stale edges
//!
//! The statements of one record are not atomic together: an interruption
//! between the node write and the edge merge leaves the node without some
//! edges until it is ingested again.

use crate::codec::{Properties, Shape, dehydrate, values_of};
use crate::connector::Connector;
use crate::graph::{GraphStore, NestedNode, NodeKey, NodeQuery, NodeWrite, Slot, Upsert};
use crate::identity::identity_properties;
use crate::primitives::MAX_BATCH_SIZE;
use crate::schema::{EntitySchema, FieldKind, TypeSchema};
use crate::types::{
    EntityType, ExtractedItem, Identifier, MergeGraphError, NodeKind, NodeLabel, Record,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// A record about to be written: its node identity plus its fields.
#[derive(Debug, Clone)]
pub struct RecordDraft<'a> {
    /// The node to write.
    pub key: NodeKey,
    /// The stem type.
    pub stem: EntityType,
    /// The group identity.
    pub group: Identifier,
    /// Properties written only on creation.
    pub on_create: Properties,
    /// The record's schema-typed fields.
    pub fields: &'a Record,
}

impl<'a> RecordDraft<'a> {
    /// The draft of an extracted item.
    #[must_use]
    pub fn extracted(item: &'a ExtractedItem) -> Self {
        Self {
            key: NodeKey::new(item.identifier.clone(), NodeKind::Extracted),
            stem: item.entity_type.clone(),
            group: item.group_identity.clone(),
            on_create: identity_properties(&item.identity()),
            fields: &item.fields,
        }
    }
}

/// Fields of a record split by how they are stored.
#[derive(Debug, Default)]
struct Partitioned<'a> {
    plain: Record,
    references: Vec<(&'a str, Vec<Identifier>)>,
    nested: Vec<(&'a str, &'a str, Vec<&'a Record>)>,
}

/// One item whose reference edges could not all be merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestFailure {
    /// The extracted item.
    pub identifier: Identifier,
    /// What went wrong.
    pub error: String,
}

/// The outcome of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Items written, in submission order.
    pub upserted: Vec<Identifier>,
    /// How many of them were new.
    pub created: usize,
    /// Items whose edge merge fell short.
    pub failures: Vec<IngestFailure>,
}

/// The Ingestor handles record validation and graph writes.
pub struct Ingestor;

impl Ingestor {
    /// Validate an extracted item against its entity type.
    ///
    /// An item is valid if:
    /// - Its type is registered
    /// - Identifier, group, primary source and source-local id are non-empty
    /// - Every field is declared and shaped per its kind and cardinality
    pub fn validate<'s>(
        item: &ExtractedItem,
        schemas: &'s impl EntitySchema,
    ) -> Result<&'s TypeSchema, MergeGraphError> {
        let schema = schemas.require(&item.entity_type)?;
        let parts = [
            ("identifier", item.identifier.as_str()),
            ("stableTargetId", item.group_identity.as_str()),
            ("hadPrimarySource", item.primary_source.as_str()),
            ("identifierInPrimarySource", item.source_local_id.as_str()),
        ];
        if let Some((name, _)) = parts.iter().find(|(_, value)| value.is_empty()) {
            return Err(MergeGraphError::InvalidRequest(format!(
                "item of type {} has an empty {name}",
                item.entity_type
            )));
        }
        Self::check_fields(&item.fields, schema, schemas)?;
        Ok(schema)
    }

    /// Check that every field is declared and shaped as the schema says.
    pub fn check_fields(
        fields: &Record,
        schema: &TypeSchema,
        schemas: &impl EntitySchema,
    ) -> Result<(), MergeGraphError> {
        let invalid = |field: &str, reason: &str| {
            MergeGraphError::InvalidRequest(format!("{}.{field}: {reason}", schema.stem))
        };
        for (name, value) in fields {
            let spec = schema
                .field(name)
                .ok_or_else(|| invalid(name, "not a field of this type"))?;
            if !spec.list && value.is_array() {
                return Err(invalid(name, "expected a single value"));
            }
            if spec.list && !value.is_array() && !value.is_null() {
                return Err(invalid(name, "expected a list"));
            }
            for element in values_of(value) {
                match &spec.kind {
                    FieldKind::Plain if element.is_array() || element.is_object() => {
                        return Err(invalid(name, "expected scalar values"));
                    }
                    FieldKind::Reference if !element.as_str().is_some_and(|s| !s.is_empty()) => {
                        return Err(invalid(name, "expected identifiers"));
                    }
                    FieldKind::Nested(nested) => {
                        let Some(Shape::Object(branches)) = schemas.nested_shape(nested) else {
                            return Err(invalid(name, "unknown nested value type"));
                        };
                        let Value::Object(object) = element else {
                            return Err(invalid(name, "expected nested values"));
                        };
                        for (key, leaf) in object {
                            if !branches.contains_key(key) {
                                return Err(invalid(name, &format!("{nested} has no field {key}")));
                            }
                            if leaf.is_array() || leaf.is_object() {
                                return Err(invalid(name, "nested values hold scalars"));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn partition<'a>(fields: &'a Record, schema: &'a TypeSchema) -> Partitioned<'a> {
        let mut parts = Partitioned::default();
        for (name, value) in fields {
            let Some(spec) = schema.field(name) else {
                continue;
            };
            match &spec.kind {
                FieldKind::Plain => {
                    parts.plain.insert(name.clone(), value.clone());
                }
                FieldKind::Reference => {
                    let targets = values_of(value)
                        .into_iter()
                        .filter_map(Value::as_str)
                        .map(Identifier::from)
                        .collect();
                    parts.references.push((name.as_str(), targets));
                }
                FieldKind::Nested(label) => {
                    let objects = values_of(value)
                        .into_iter()
                        .filter_map(Value::as_object)
                        .collect();
                    parts.nested.push((name.as_str(), label.as_str(), objects));
                }
            }
        }
        parts
    }

    /// Write a record's node and nested values, pruning stale nested values.
    ///
    /// Reference fields are left to `merge_edges`.
    pub fn upsert_record<S: GraphStore>(
        connector: &mut Connector<S>,
        draft: &RecordDraft<'_>,
        schema: &TypeSchema,
    ) -> Result<Upsert, MergeGraphError> {
        let parts = Self::partition(draft.fields, schema);
        let write = NodeWrite {
            key: draft.key.clone(),
            stem: draft.stem.clone(),
            group: draft.group.clone(),
            on_create: draft.on_create.clone(),
            properties: dehydrate(&parts.plain)?,
        };
        let outcome = connector.upsert_node(&write)?;

        let mut keep = BTreeSet::new();
        for (field, label, objects) in &parts.nested {
            for (position, object) in objects.iter().enumerate() {
                let slot = Slot::new(*field, position as u32);
                let value = NestedNode {
                    label: (*label).to_string(),
                    properties: dehydrate(object)?,
                };
                connector.upsert_nested(&draft.key, &slot, &value)?;
                keep.insert(slot);
            }
        }
        let pruned = connector.prune_nested(&draft.key, &keep)?;

        tracing::debug!(
            identifier = %draft.key.identifier,
            label = %NodeLabel::new(draft.key.kind, draft.stem.clone()),
            ?outcome,
            nested = keep.len(),
            pruned,
            "upserted record"
        );
        Ok(outcome)
    }

    /// Merge a record's reference edges and prune edges it no longer has.
    ///
    /// Returns the number of merged edges. If a referenced group identity has
    /// no anchor yet, the remaining edges are still merged and the shortfall
    /// is reported as `InconsistentStore` naming the failed edges.
    pub fn merge_edges<S: GraphStore>(
        connector: &mut Connector<S>,
        draft: &RecordDraft<'_>,
        schema: &TypeSchema,
    ) -> Result<usize, MergeGraphError> {
        let parts = Self::partition(draft.fields, schema);
        let expected: usize = parts.references.iter().map(|(_, t)| t.len()).sum();

        let mut keep = BTreeSet::new();
        let mut failed = Vec::new();
        for (field, targets) in &parts.references {
            for (position, target) in targets.iter().enumerate() {
                let slot = Slot::new(*field, position as u32);
                if connector.upsert_edge(&draft.key, &slot, target)? {
                    keep.insert(slot);
                } else {
                    failed.push(format!("{field}[{position}] -> {target}"));
                }
            }
        }
        connector.prune_edges(&draft.key, &keep)?;

        if keep.len() < expected {
            tracing::warn!(
                identifier = %draft.key.identifier,
                expected,
                merged = keep.len(),
                failed = ?failed,
                "reference edges could not be merged"
            );
            return Err(MergeGraphError::InconsistentStore(format!(
                "{} merged {} of {expected} edges; missing targets: {}",
                draft.key.identifier,
                keep.len(),
                failed.join(", ")
            )));
        }
        Ok(keep.len())
    }

    /// Reference targets of a record whose group has no anchor yet.
    pub fn missing_targets<S: GraphStore>(
        connector: &mut Connector<S>,
        draft: &RecordDraft<'_>,
        schema: &TypeSchema,
    ) -> Result<Vec<String>, MergeGraphError> {
        let parts = Self::partition(draft.fields, schema);
        let mut missing = Vec::new();
        for (field, targets) in &parts.references {
            for (position, target) in targets.iter().enumerate() {
                let anchor = NodeQuery::new()
                    .kinds([NodeKind::Merged])
                    .identifier(target.clone());
                if connector.count(&anchor)? == 0 {
                    missing.push(format!("{field}[{position}] -> {target}"));
                }
            }
        }
        Ok(missing)
    }

    /// Check that every group keeps a single stem type.
    ///
    /// Items of one batch must agree with each other and with the stem of
    /// any anchor their group already has.
    pub fn check_groups<S: GraphStore>(
        connector: &mut Connector<S>,
        items: &[ExtractedItem],
    ) -> Result<(), MergeGraphError> {
        let mut stems: BTreeMap<&Identifier, &EntityType> = BTreeMap::new();
        for item in items {
            let stem = *stems.entry(&item.group_identity).or_insert(&item.entity_type);
            if *stem != item.entity_type {
                return Err(MergeGraphError::InvalidRequest(format!(
                    "group {} receives both {stem} and {} items",
                    item.group_identity, item.entity_type
                )));
            }
        }
        for (group, stem) in stems {
            let anchor = NodeQuery::new()
                .kinds([NodeKind::Merged])
                .identifier(group.clone());
            let existing = connector.fetch_optional(&anchor, &format!("anchor of {group}"))?;
            if let Some(existing) = existing.filter(|row| row.stem != *stem) {
                return Err(MergeGraphError::InvalidRequest(format!(
                    "group {group} holds {} records, not {stem}",
                    existing.stem
                )));
            }
        }
        Ok(())
    }

    /// Ingest a batch of extracted items.
    ///
    /// All node upserts run before any edge merge, so items of one batch may
    /// reference each other in any order. An edge shortfall fails only that
    /// item's entry in the report.
    pub fn ingest<S: GraphStore>(
        connector: &mut Connector<S>,
        schemas: &impl EntitySchema,
        items: &[ExtractedItem],
    ) -> Result<IngestReport, MergeGraphError> {
        if items.len() > MAX_BATCH_SIZE {
            return Err(MergeGraphError::InvalidRequest(format!(
                "batch of {} items exceeds {MAX_BATCH_SIZE}",
                items.len()
            )));
        }

        // Validate all items before touching the store.
        let mut drafts = Vec::with_capacity(items.len());
        for item in items {
            let schema = Self::validate(item, schemas)?;
            drafts.push((RecordDraft::extracted(item), schema));
        }
        Self::check_groups(connector, items)?;

        let mut report = IngestReport::default();
        for (draft, schema) in &drafts {
            if Self::upsert_record(connector, draft, schema)? == Upsert::Created {
                report.created += 1;
            }
            report.upserted.push(draft.key.identifier.clone());
        }

        for (draft, schema) in &drafts {
            match Self::merge_edges(connector, draft, schema) {
                Ok(_) => {}
                Err(error @ MergeGraphError::InconsistentStore(_)) => {
                    report.failures.push(IngestFailure {
                        identifier: draft.key.identifier.clone(),
                        error: error.to_string(),
                    });
                }
                Err(error) => return Err(error),
            }
        }

        tracing::info!(
            items = items.len(),
            created = report.created,
            failures = report.failures.len(),
            "ingested batch"
        );
        Ok(report)
    }
}

// =============================================================================
// TESTS
// =============================================================================
