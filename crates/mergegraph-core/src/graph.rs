//! # Graph Store
//!
//! The property-graph collaborator of the engine.
//!
//! This module implements the `GraphStore` trait and its in-memory backend.
//! A node is keyed by `(identifier, kind)` and owns its flat properties, its
//! position-indexed nested value children and its position-indexed reference
//! edges. Every trait method is one statement: atomic on its own, never
//! across calls.
//!
//! All data structures use `BTreeMap` for deterministic ordering.

use crate::codec::{Properties, Scalar};
use crate::types::{EntityType, Identifier, Identity, NodeKind, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// NODE STATE
// =============================================================================

/// The permanent identity of a node.
///
/// Ordered by identifier first, which is the result order of every query.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    /// Item identifier, or the group identity for anchors and rule components.
    pub identifier: Identifier,
    /// The node variant.
    pub kind: NodeKind,
}

impl NodeKey {
    /// Create a key.
    #[must_use]
    pub fn new(identifier: Identifier, kind: NodeKind) -> Self {
        Self { identifier, kind }
    }

    /// The anchor node of a group identity.
    #[must_use]
    pub fn anchor(group: Identifier) -> Self {
        Self::new(group, NodeKind::Merged)
    }
}

/// A labeled, position-indexed attachment point of a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot {
    /// The field the attachment belongs to.
    pub field: String,
    /// The list position within that field.
    pub position: u32,
}

impl Slot {
    /// Create a slot.
    #[must_use]
    pub fn new(field: impl Into<String>, position: u32) -> Self {
        Self {
            field: field.into(),
            position,
        }
    }
}

/// A nested value child node. It has no identity of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedNode {
    /// The nested value type, e.g. `Text`.
    pub label: String,
    /// The dehydrated content.
    pub properties: Properties,
}

/// Everything stored for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// The permanent identity.
    pub key: NodeKey,
    /// The entity stem type.
    pub stem: EntityType,
    /// The group identity, set at creation.
    pub group: Identifier,
    /// Properties set at creation and never rewritten.
    pub fixed: Properties,
    /// Mutable plain properties, replaced by every update.
    pub properties: Properties,
    /// Nested value children by slot.
    pub nested: BTreeMap<Slot, NestedNode>,
    /// Reference edges by slot, pointing at group identity anchors.
    pub edges: BTreeMap<Slot, Identifier>,
}

impl NodeRecord {
    /// A fresh anchor for a group identity.
    #[must_use]
    pub fn anchor(group: Identifier, stem: EntityType) -> Self {
        Self {
            key: NodeKey::anchor(group.clone()),
            stem,
            group,
            fixed: Properties::new(),
            properties: Properties::new(),
            nested: BTreeMap::new(),
            edges: BTreeMap::new(),
        }
    }

    /// Apply a write to the stored state of its node, if any.
    ///
    /// On creation every property is set. On match only the mutable
    /// properties are replaced; the key, stem, group and fixed properties stay.
    #[must_use]
    pub fn apply(existing: Option<Self>, write: NodeWrite) -> (Self, Upsert) {
        match existing {
            Some(mut record) => {
                record.properties = write.properties;
                (record, Upsert::Updated)
            }
            None => {
                let record = Self {
                    key: write.key,
                    stem: write.stem,
                    group: write.group,
                    fixed: write.on_create,
                    properties: write.properties,
                    nested: BTreeMap::new(),
                    edges: BTreeMap::new(),
                };
                (record, Upsert::Created)
            }
        }
    }

    /// Look up a property, fixed ones first.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&crate::codec::FlatValue> {
        self.fixed.get(name).or_else(|| self.properties.get(name))
    }

    /// Drop nested children outside `keep`. Returns how many were dropped.
    pub fn retain_nested(&mut self, keep: &BTreeSet<Slot>) -> usize {
        let before = self.nested.len();
        self.nested.retain(|slot, _| keep.contains(slot));
        before - self.nested.len()
    }

    /// Drop reference edges outside `keep`. Returns how many were dropped.
    pub fn retain_edges(&mut self, keep: &BTreeSet<Slot>) -> usize {
        let before = self.edges.len();
        self.edges.retain(|slot, _| keep.contains(slot));
        before - self.edges.len()
    }

    fn texts(&self) -> impl Iterator<Item = &str> {
        self.fixed
            .values()
            .chain(self.properties.values())
            .chain(self.nested.values().flat_map(|n| n.properties.values()))
            .flat_map(|value| value.scalars())
            .filter_map(Scalar::as_text)
    }
}

/// A create-or-update statement for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeWrite {
    /// The node to write.
    pub key: NodeKey,
    /// The entity stem type.
    pub stem: EntityType,
    /// The group identity; its anchor is merged by the same statement.
    pub group: Identifier,
    /// Properties written only when the node is created.
    pub on_create: Properties,
    /// Mutable plain properties.
    pub properties: Properties,
}

/// Outcome of a node upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// The node did not exist.
    Created,
    /// The node existed; its mutable properties were replaced.
    Updated,
}

// =============================================================================
// PATTERN QUERIES
// =============================================================================

/// Nodes with an edge to any of the given group identities.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReferenceFilter {
    /// Restrict to edges of this field.
    pub field: Option<String>,
    /// Target group identities.
    pub targets: BTreeSet<Identifier>,
}

/// A parameterized pattern query with ordering by key and pagination.
///
/// Empty filter lists match everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeQuery {
    /// Allowed node kinds.
    pub kinds: Vec<NodeKind>,
    /// Allowed stem types.
    pub stems: Vec<EntityType>,
    /// Exact node identifier.
    pub identifier: Option<Identifier>,
    /// Exact group identity.
    pub group: Option<Identifier>,
    /// Exact single-valued properties.
    pub fixed: Vec<(String, Scalar)>,
    /// Full-text terms; every term must occur in some text property.
    pub full_text: Option<String>,
    /// Outgoing reference edges.
    pub references: Option<ReferenceFilter>,
    /// Rows to skip.
    pub skip: usize,
    /// Maximum number of rows.
    pub limit: Option<usize>,
}

impl NodeQuery {
    /// A query matching every node.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given kinds.
    #[must_use]
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = NodeKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// Restrict to the given stem types.
    #[must_use]
    pub fn stems(mut self, stems: impl IntoIterator<Item = EntityType>) -> Self {
        self.stems = stems.into_iter().collect();
        self
    }

    /// Restrict to one identifier.
    #[must_use]
    pub fn identifier(mut self, identifier: Identifier) -> Self {
        self.identifier = Some(identifier);
        self
    }

    /// Restrict to one group identity.
    #[must_use]
    pub fn group(mut self, group: Identifier) -> Self {
        self.group = Some(group);
        self
    }

    /// Require a single-valued property.
    #[must_use]
    pub fn property(mut self, name: impl Into<String>, value: Scalar) -> Self {
        self.fixed.push((name.into(), value));
        self
    }

    /// Require full-text terms.
    #[must_use]
    pub fn full_text(mut self, query: impl Into<String>) -> Self {
        self.full_text = Some(query.into());
        self
    }

    /// Require an outgoing reference edge.
    #[must_use]
    pub fn references(mut self, filter: ReferenceFilter) -> Self {
        self.references = Some(filter);
        self
    }

    /// Paginate.
    #[must_use]
    pub fn page(mut self, skip: usize, limit: usize) -> Self {
        self.skip = skip;
        self.limit = Some(limit);
        self
    }

    /// Reject statements the store cannot execute.
    ///
    /// Full-text search cannot be combined with identity filters.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.full_text.is_some() && (self.identifier.is_some() || self.group.is_some()) {
            return Err(StoreError::Malformed(
                "full-text search cannot be combined with identity filters".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a node satisfies every filter.
    #[must_use]
    pub fn matches(&self, record: &NodeRecord) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&record.key.kind) {
            return false;
        }
        if !self.stems.is_empty() && !self.stems.contains(&record.stem) {
            return false;
        }
        if self
            .identifier
            .as_ref()
            .is_some_and(|id| *id != record.key.identifier)
        {
            return false;
        }
        if self.group.as_ref().is_some_and(|g| *g != record.group) {
            return false;
        }
        let fixed_ok = self.fixed.iter().all(|(name, expected)| {
            matches!(
                record.property(name),
                Some(crate::codec::FlatValue::Single(actual)) if actual == expected
            )
        });
        if !fixed_ok {
            return false;
        }
        if let Some(filter) = &self.references {
            let hit = record.edges.iter().any(|(slot, target)| {
                filter.field.as_ref().is_none_or(|f| *f == slot.field)
                    && filter.targets.contains(target)
            });
            if !hit {
                return false;
            }
        }
        if let Some(query) = &self.full_text {
            let texts: Vec<String> = record.texts().map(str::to_lowercase).collect();
            let all_terms = query
                .split_whitespace()
                .map(str::to_lowercase)
                .all(|term| texts.iter().any(|text| text.contains(&term)));
            if !all_terms {
                return false;
            }
        }
        true
    }

    /// Apply `skip` and `limit` to key-ordered rows.
    pub fn paginate<I>(&self, rows: I) -> Vec<NodeRecord>
    where
        I: IntoIterator<Item = NodeRecord>,
    {
        let rows = rows.into_iter().skip(self.skip);
        match self.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        }
    }
}

// =============================================================================
// GRAPHSTORE TRAIT
// =============================================================================

/// The statements the engine issues against a property graph.
///
/// Each method is atomic on its own. A sequence of methods is not.
pub trait GraphStore {
    /// Create or update a node and merge the anchor of its group.
    fn upsert_node(&mut self, write: NodeWrite) -> Result<Upsert, StoreError>;

    /// Create or replace the nested child at a slot of an existing node.
    fn upsert_nested(
        &mut self,
        node: &NodeKey,
        slot: Slot,
        value: NestedNode,
    ) -> Result<(), StoreError>;

    /// Detach and delete nested children outside `keep`.
    fn prune_nested(&mut self, node: &NodeKey, keep: &BTreeSet<Slot>)
    -> Result<usize, StoreError>;

    /// Create or retarget the reference edge at a slot.
    ///
    /// Returns `false` when the target anchor does not exist.
    fn upsert_edge(
        &mut self,
        node: &NodeKey,
        slot: Slot,
        target: &Identifier,
    ) -> Result<bool, StoreError>;

    /// Delete reference edges outside `keep`.
    fn prune_edges(&mut self, node: &NodeKey, keep: &BTreeSet<Slot>) -> Result<usize, StoreError>;

    /// Matching nodes ordered by key, paginated.
    fn fetch(&self, query: &NodeQuery) -> Result<Vec<NodeRecord>, StoreError>;

    /// Number of matching nodes, ignoring pagination.
    fn count(&self, query: &NodeQuery) -> Result<usize, StoreError>;

    /// Reserve `candidate` for a source pair unless one is reserved already.
    ///
    /// Returns the reservation in effect after the statement.
    fn reserve_identity(&mut self, key: &str, candidate: &Identity)
    -> Result<Identity, StoreError>;

    /// Re-establish the connection after a transient failure.
    fn reconnect(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub(crate) fn missing_node(node: &NodeKey) -> StoreError {
    StoreError::Malformed(format!(
        "statement targets missing node {} ({})",
        node.identifier, node.kind
    ))
}

// =============================================================================
// IN-MEMORY BACKEND
// =============================================================================

/// A volatile, deterministic graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryGraph {
    nodes: BTreeMap<NodeKey, NodeRecord>,
    identities: BTreeMap<String, Identity>,
}

impl MemoryGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored nodes of every kind.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn node_mut(&mut self, node: &NodeKey) -> Result<&mut NodeRecord, StoreError> {
        self.nodes.get_mut(node).ok_or_else(|| missing_node(node))
    }
}

impl GraphStore for MemoryGraph {
    fn upsert_node(&mut self, write: NodeWrite) -> Result<Upsert, StoreError> {
        if write.key.kind != NodeKind::Merged {
            let anchor = NodeKey::anchor(write.group.clone());
            if !self.nodes.contains_key(&anchor) {
                let record = NodeRecord::anchor(write.group.clone(), write.stem.clone());
                self.nodes.insert(anchor, record);
            }
        }
        let existing = self.nodes.remove(&write.key);
        let (record, outcome) = NodeRecord::apply(existing, write);
        self.nodes.insert(record.key.clone(), record);
        Ok(outcome)
    }

    fn upsert_nested(
        &mut self,
        node: &NodeKey,
        slot: Slot,
        value: NestedNode,
    ) -> Result<(), StoreError> {
        self.node_mut(node)?.nested.insert(slot, value);
        Ok(())
    }

    fn prune_nested(
        &mut self,
        node: &NodeKey,
        keep: &BTreeSet<Slot>,
    ) -> Result<usize, StoreError> {
        Ok(self.node_mut(node)?.retain_nested(keep))
    }

    fn upsert_edge(
        &mut self,
        node: &NodeKey,
        slot: Slot,
        target: &Identifier,
    ) -> Result<bool, StoreError> {
        if !self.nodes.contains_key(&NodeKey::anchor(target.clone())) {
            return Ok(false);
        }
        self.node_mut(node)?.edges.insert(slot, target.clone());
        Ok(true)
    }

    fn prune_edges(&mut self, node: &NodeKey, keep: &BTreeSet<Slot>) -> Result<usize, StoreError> {
        Ok(self.node_mut(node)?.retain_edges(keep))
    }

    fn fetch(&self, query: &NodeQuery) -> Result<Vec<NodeRecord>, StoreError> {
        query.validate()?;
        Ok(query.paginate(self.nodes.values().filter(|r| query.matches(r)).cloned()))
    }

    fn count(&self, query: &NodeQuery) -> Result<usize, StoreError> {
        query.validate()?;
        Ok(self.nodes.values().filter(|r| query.matches(r)).count())
    }

    fn reserve_identity(
        &mut self,
        key: &str,
        candidate: &Identity,
    ) -> Result<Identity, StoreError> {
        Ok(self
            .identities
            .entry(key.to_string())
            .or_insert_with(|| candidate.clone())
            .clone())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FlatValue;

    fn person(id: &str, group: &str, name: &str) -> NodeWrite {
        let mut on_create = Properties::new();
        on_create.insert(
            "identifierInPrimarySource".to_string(),
            FlatValue::Single(Scalar::text(id)),
        );
        let mut properties = Properties::new();
        properties.insert(
            "fullName".to_string(),
            FlatValue::Many(vec![Scalar::text(name)]),
        );
        NodeWrite {
            key: NodeKey::new(Identifier::new(id), NodeKind::Extracted),
            stem: EntityType::new("Person"),
            group: Identifier::new(group),
            on_create,
            properties,
        }
    }

    #[test]
    fn upsert_creates_node_and_anchor() {
        let mut graph = MemoryGraph::new();
        let outcome = graph
            .upsert_node(person("i1", "g1", "Ada"))
            .expect("upsert");

        assert_eq!(outcome, Upsert::Created);
        assert_eq!(graph.len(), 2);
        let anchors = graph
            .fetch(&NodeQuery::new().kinds([NodeKind::Merged]))
            .expect("fetch");
        assert_eq!(anchors[0].key.identifier, Identifier::new("g1"));
    }

    #[test]
    fn update_keeps_fixed_properties() {
        let mut graph = MemoryGraph::new();
        graph.upsert_node(person("i1", "g1", "Ada")).expect("create");

        let mut rewrite = person("i1", "g2", "Ada Lovelace");
        rewrite.on_create.clear();
        let outcome = graph.upsert_node(rewrite).expect("update");
        assert_eq!(outcome, Upsert::Updated);

        let node = graph
            .fetch(&NodeQuery::new().identifier(Identifier::new("i1")))
            .expect("fetch")
            .remove(0);
        assert_eq!(node.group, Identifier::new("g1"));
        assert!(node.fixed.contains_key("identifierInPrimarySource"));
        assert_eq!(
            node.properties.get("fullName"),
            Some(&FlatValue::Many(vec![Scalar::text("Ada Lovelace")]))
        );
    }

    #[test]
    fn prune_drops_slots_outside_keep() {
        let mut graph = MemoryGraph::new();
        graph.upsert_node(person("i1", "g1", "Ada")).expect("create");
        let key = NodeKey::new(Identifier::new("i1"), NodeKind::Extracted);
        for position in 0..3 {
            let value = NestedNode {
                label: "Text".to_string(),
                properties: Properties::new(),
            };
            graph
                .upsert_nested(&key, Slot::new("title", position), value)
                .expect("nested");
        }

        let keep: BTreeSet<_> = [Slot::new("title", 0)].into_iter().collect();
        assert_eq!(graph.prune_nested(&key, &keep).expect("prune"), 2);
        assert_eq!(graph.prune_nested(&key, &keep).expect("prune"), 0);
    }

    #[test]
    fn edge_to_missing_anchor_is_not_merged() {
        let mut graph = MemoryGraph::new();
        graph.upsert_node(person("i1", "g1", "Ada")).expect("create");
        let key = NodeKey::new(Identifier::new("i1"), NodeKind::Extracted);

        let merged = graph
            .upsert_edge(&key, Slot::new("memberOf", 0), &Identifier::new("nowhere"))
            .expect("edge");
        assert!(!merged);

        let merged = graph
            .upsert_edge(&key, Slot::new("memberOf", 0), &Identifier::new("g1"))
            .expect("edge");
        assert!(merged);
    }

    #[test]
    fn statements_on_missing_nodes_are_malformed() {
        let mut graph = MemoryGraph::new();
        let key = NodeKey::new(Identifier::new("ghost"), NodeKind::Extracted);
        assert!(matches!(
            graph.prune_edges(&key, &BTreeSet::new()),
            Err(StoreError::Malformed(_))
        ));
    }

    #[test]
    fn full_text_requires_every_term() {
        let mut graph = MemoryGraph::new();
        graph
            .upsert_node(person("i1", "g1", "Ada Lovelace"))
            .expect("create");
        graph
            .upsert_node(person("i2", "g2", "Ada Byron"))
            .expect("create");

        let query = NodeQuery::new()
            .kinds([NodeKind::Extracted])
            .full_text("ada LOVELACE");
        assert_eq!(graph.count(&query).expect("count"), 1);
    }

    #[test]
    fn full_text_with_identity_filter_is_rejected() {
        let graph = MemoryGraph::new();
        let query = NodeQuery::new()
            .full_text("ada")
            .group(Identifier::new("g1"));
        assert!(matches!(graph.fetch(&query), Err(StoreError::Malformed(_))));
    }

    #[test]
    fn results_are_key_ordered_and_paginated() {
        let mut graph = MemoryGraph::new();
        for id in ["i3", "i1", "i2"] {
            graph.upsert_node(person(id, "g", "X")).expect("create");
        }
        let query = NodeQuery::new().kinds([NodeKind::Extracted]).page(1, 1);
        let page = graph.fetch(&query).expect("fetch");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].key.identifier, Identifier::new("i2"));
        assert_eq!(graph.count(&query).expect("count"), 3);
    }
}
