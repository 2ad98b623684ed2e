//! # Session Module
//!
//! The context object through which callers use the engine.
//!
//! A `Session` owns the store connector, the identity resolver and the
//! entity schema registry, and exposes the request/response operations:
//! identity assignment and lookup, ingestion, extracted and merged search,
//! merged item retrieval and preview, rule set management and match
//! proposals. All operations are synchronous.
//!
//! ## Storage Backends
//!
//! Session supports two storage backends:
//! - `InMemory`: Uses `MemoryGraph` (fast, volatile)
//! - `Persistent`: Uses `RedbGraph` for disk-backed ACID storage

use crate::connector::{Connector, RetryPolicy};
use crate::graph::{
    GraphStore, MemoryGraph, NestedNode, NodeKey, NodeQuery, NodeRecord, NodeWrite, Slot, Upsert,
};
use crate::identity::{IdentityFilter, IdentityMetrics, IdentityResolver, MemoryCache};
use crate::ingestor::{IngestReport, Ingestor, RecordDraft};
use crate::matching::MatchProposal;
use crate::merge::build_entity;
use crate::query::{SearchFilter, clamp_limit, reconstruct_item, reconstruct_rule_set};
use crate::schema::{EntitySchema, SchemaRegistry};
use crate::storage::RedbGraph;
use crate::types::{
    EntityType, ExtractedItem, Identifier, Identity, MergeGraphError, MergeMode, MergedItem,
    NodeKind, Paged, RuleKind, RuleSet, StoreError,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Node kinds holding rule components.
fn rule_kinds() -> impl Iterator<Item = NodeKind> {
    NodeKind::ALL.into_iter().filter(|kind| kind.is_rule())
}

// =============================================================================
// STORAGE BACKEND
// =============================================================================

/// Storage backend for a Session.
#[derive(Debug)]
pub enum StorageBackend {
    /// In-memory graph (fast, volatile).
    InMemory(MemoryGraph),
    /// Disk-backed graph using redb (ACID, persistent).
    Persistent(RedbGraph),
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::InMemory(MemoryGraph::new())
    }
}

impl StorageBackend {
    /// Short backend name for status output.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InMemory(_) => "memory",
            Self::Persistent(_) => "redb",
        }
    }
}

impl GraphStore for StorageBackend {
    fn upsert_node(&mut self, write: NodeWrite) -> Result<Upsert, StoreError> {
        match self {
            Self::InMemory(g) => g.upsert_node(write),
            Self::Persistent(g) => g.upsert_node(write),
        }
    }

    fn upsert_nested(
        &mut self,
        node: &NodeKey,
        slot: Slot,
        value: NestedNode,
    ) -> Result<(), StoreError> {
        match self {
            Self::InMemory(g) => g.upsert_nested(node, slot, value),
            Self::Persistent(g) => g.upsert_nested(node, slot, value),
        }
    }

    fn prune_nested(
        &mut self,
        node: &NodeKey,
        keep: &BTreeSet<Slot>,
    ) -> Result<usize, StoreError> {
        match self {
            Self::InMemory(g) => g.prune_nested(node, keep),
            Self::Persistent(g) => g.prune_nested(node, keep),
        }
    }

    fn upsert_edge(
        &mut self,
        node: &NodeKey,
        slot: Slot,
        target: &Identifier,
    ) -> Result<bool, StoreError> {
        match self {
            Self::InMemory(g) => g.upsert_edge(node, slot, target),
            Self::Persistent(g) => g.upsert_edge(node, slot, target),
        }
    }

    fn prune_edges(&mut self, node: &NodeKey, keep: &BTreeSet<Slot>) -> Result<usize, StoreError> {
        match self {
            Self::InMemory(g) => g.prune_edges(node, keep),
            Self::Persistent(g) => g.prune_edges(node, keep),
        }
    }

    fn fetch(&self, query: &NodeQuery) -> Result<Vec<NodeRecord>, StoreError> {
        match self {
            Self::InMemory(g) => g.fetch(query),
            Self::Persistent(g) => g.fetch(query),
        }
    }

    fn count(&self, query: &NodeQuery) -> Result<usize, StoreError> {
        match self {
            Self::InMemory(g) => g.count(query),
            Self::Persistent(g) => g.count(query),
        }
    }

    fn reserve_identity(
        &mut self,
        key: &str,
        candidate: &Identity,
    ) -> Result<Identity, StoreError> {
        match self {
            Self::InMemory(g) => g.reserve_identity(key, candidate),
            Self::Persistent(g) => g.reserve_identity(key, candidate),
        }
    }

    fn reconnect(&mut self) -> Result<(), StoreError> {
        match self {
            Self::InMemory(g) => g.reconnect(),
            Self::Persistent(g) => g.reconnect(),
        }
    }
}

// =============================================================================
// STATUS
// =============================================================================

/// Node counts and resolver counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Stored nodes per kind.
    pub nodes: BTreeMap<String, usize>,
    /// Identity resolver counters.
    pub identities: IdentityMetrics,
}

// =============================================================================
// SESSION
// =============================================================================

/// The engine's context object.
#[derive(Debug)]
pub struct Session<S = StorageBackend> {
    connector: Connector<S>,
    resolver: IdentityResolver<MemoryCache>,
    schemas: SchemaRegistry,
}

impl Session<StorageBackend> {
    /// A volatile session with the built-in schema registry.
    pub fn in_memory() -> Result<Self, MergeGraphError> {
        Ok(Self::new(
            StorageBackend::default(),
            SchemaRegistry::builtin()?,
        ))
    }

    /// A session over a redb database with the built-in schema registry.
    ///
    /// Opens or creates the database at the given path.
    pub fn with_redb(path: impl AsRef<Path>) -> Result<Self, MergeGraphError> {
        let redb = RedbGraph::open(path)?;
        Ok(Self::new(
            StorageBackend::Persistent(redb),
            SchemaRegistry::builtin()?,
        ))
    }

    /// Check if using persistent storage.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        matches!(self.connector.store(), StorageBackend::Persistent(_))
    }
}

impl<S: GraphStore> Session<S> {
    /// Create a session over any store.
    #[must_use]
    pub fn new(store: S, schemas: SchemaRegistry) -> Self {
        Self {
            connector: Connector::new(store, RetryPolicy::default()),
            resolver: IdentityResolver::default(),
            schemas,
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry_policy(self, policy: RetryPolicy) -> Self {
        Self {
            connector: Connector::new(self.connector.into_inner(), policy),
            ..self
        }
    }

    /// Replace the identity cache with an empty one of the given capacity.
    #[must_use]
    pub fn with_cache_capacity(self, capacity: usize) -> Self {
        Self {
            resolver: IdentityResolver::new(MemoryCache::new(capacity)),
            ..self
        }
    }

    /// The entity schema registry.
    #[must_use]
    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// The store connector.
    #[must_use]
    pub fn connector(&self) -> &Connector<S> {
        &self.connector
    }

    // -------------------------------------------------------------------------
    // Identities
    // -------------------------------------------------------------------------

    /// Resolve `(primarySourceRef, sourceLocalId)` to a stable identity.
    pub fn assign_identity(
        &mut self,
        primary_source: &Identifier,
        source_local_id: &str,
    ) -> Result<Identity, MergeGraphError> {
        self.resolver
            .assign(&mut self.connector, primary_source, source_local_id)
    }

    /// Stored identities matching a filter.
    pub fn fetch_identity(
        &mut self,
        filter: &IdentityFilter,
    ) -> Result<Vec<Identity>, MergeGraphError> {
        self.resolver.fetch(&mut self.connector, filter)
    }

    // -------------------------------------------------------------------------
    // Extracted items
    // -------------------------------------------------------------------------

    /// Ingest a batch of extracted items.
    pub fn ingest(&mut self, items: &[ExtractedItem]) -> Result<IngestReport, MergeGraphError> {
        Ingestor::ingest(&mut self.connector, &self.schemas, items)
    }

    /// Search extracted items, ordered by identifier.
    pub fn search_extracted_items(
        &mut self,
        filter: &SearchFilter,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Paged<ExtractedItem>, MergeGraphError> {
        filter.validate()?;
        let query = filter.to_query([NodeKind::Extracted]);
        let total = self.connector.count(&query)?;
        let rows = self
            .connector
            .fetch(&query.page(skip, clamp_limit(limit)))?;
        let items = rows
            .iter()
            .map(|row| reconstruct_item(row, &self.schemas))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Paged { total, items })
    }

    // -------------------------------------------------------------------------
    // Merged items
    // -------------------------------------------------------------------------

    fn group_items(&mut self, group: &Identifier) -> Result<Vec<ExtractedItem>, MergeGraphError> {
        let query = NodeQuery::new()
            .kinds([NodeKind::Extracted])
            .group(group.clone());
        self.connector
            .fetch(&query)?
            .iter()
            .map(|row| reconstruct_item(row, &self.schemas))
            .collect()
    }

    /// The stored rule set of a group, if any.
    pub fn get_rule_set(&mut self, group: &Identifier) -> Result<Option<RuleSet>, MergeGraphError> {
        let query = NodeQuery::new().kinds(rule_kinds()).group(group.clone());
        let rows = self.connector.fetch(&query)?;
        reconstruct_rule_set(&rows, &self.schemas)
    }

    /// Merge a group's stored items with a rule set.
    fn merge_group(
        &self,
        group: &Identifier,
        items: &[ExtractedItem],
        rule_set: Option<&RuleSet>,
        mode: MergeMode,
    ) -> Result<MergedItem, MergeGraphError> {
        let stem = items
            .first()
            .map(|item| &item.entity_type)
            .or(rule_set.map(|rules| &rules.entity_type))
            .ok_or_else(|| MergeGraphError::NotFound(format!("merged item {group}")))?;
        let schema = self.schemas.type_schema(stem).ok_or_else(|| {
            MergeGraphError::InconsistentStore(format!("group {group} has unknown type {stem}"))
        })?;
        build_entity(group, items, rule_set, schema, mode)
    }

    /// The merged view of one group identity.
    pub fn get_merged_item(
        &mut self,
        group: &Identifier,
        mode: MergeMode,
    ) -> Result<MergedItem, MergeGraphError> {
        let items = self.group_items(group)?;
        let rule_set = self.get_rule_set(group)?;
        self.merge_group(group, &items, rule_set.as_ref(), mode)
    }

    /// Merge a group's stored items with a candidate rule set that is not
    /// stored, in preview mode.
    pub fn preview_merged_item(
        &mut self,
        group: &Identifier,
        candidate: &RuleSet,
    ) -> Result<MergedItem, MergeGraphError> {
        self.check_rule_set(candidate)?;
        let items = self.group_items(group)?;
        self.merge_group(group, &items, Some(candidate), MergeMode::Preview)
    }

    /// Search merged items, paginated over distinct group identities.
    pub fn search_merged_items(
        &mut self,
        filter: &SearchFilter,
        skip: usize,
        limit: Option<usize>,
        mode: MergeMode,
    ) -> Result<Paged<MergedItem>, MergeGraphError> {
        filter.validate()?;
        let mut query = filter.to_query([NodeKind::Extracted].into_iter().chain(rule_kinds()));
        // A merged item's identifier is its group identity.
        if let Some(identifier) = query.identifier.take() {
            if query.group.as_ref().is_some_and(|group| *group != identifier) {
                return Ok(Paged {
                    total: 0,
                    items: Vec::new(),
                });
            }
            query.group = Some(identifier);
        }

        let groups: BTreeSet<Identifier> = self
            .connector
            .fetch(&query)?
            .into_iter()
            .map(|row| row.group)
            .collect();
        let total = groups.len();
        let items = groups
            .iter()
            .skip(skip)
            .take(clamp_limit(limit))
            .map(|group| self.get_merged_item(group, mode))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Paged { total, items })
    }

    // -------------------------------------------------------------------------
    // Rule sets
    // -------------------------------------------------------------------------

    fn check_rule_set(&self, rule_set: &RuleSet) -> Result<(), MergeGraphError> {
        let schema = self.schemas.require(&rule_set.entity_type)?;
        rule_set.validate(schema)?;
        for kind in RuleKind::ALL {
            Ingestor::check_fields(
                rule_set.component(kind),
                &schema.rule_view(kind),
                &self.schemas,
            )?;
        }
        Ok(())
    }

    /// Store the three rule components of a group, replacing earlier ones.
    ///
    /// The group's extracted items and earlier rule components must share the
    /// rule set's stem type. Every reference in the rule set must point at an
    /// existing group.
    pub fn create_or_update_rule_set(
        &mut self,
        group: &Identifier,
        rule_set: &RuleSet,
    ) -> Result<RuleSet, MergeGraphError> {
        self.check_rule_set(rule_set)?;
        let existing = NodeQuery::new()
            .kinds([NodeKind::Extracted].into_iter().chain(rule_kinds()))
            .group(group.clone());
        if let Some(other) = self
            .connector
            .fetch(&existing)?
            .into_iter()
            .find(|row| row.stem != rule_set.entity_type)
        {
            return Err(MergeGraphError::InvalidRequest(format!(
                "group {group} holds {} records, not {}",
                other.stem, rule_set.entity_type
            )));
        }

        let schema = self.schemas.require(&rule_set.entity_type)?;
        let components: Vec<_> = RuleKind::ALL
            .iter()
            .map(|kind| {
                let draft = RecordDraft {
                    key: NodeKey::new(group.clone(), kind.node_kind()),
                    stem: rule_set.entity_type.clone(),
                    group: group.clone(),
                    on_create: Default::default(),
                    fields: rule_set.component(*kind),
                };
                (draft, schema.rule_view(*kind))
            })
            .collect();

        let mut missing = Vec::new();
        for (draft, view) in &components {
            missing.extend(Ingestor::missing_targets(&mut self.connector, draft, view)?);
        }
        if !missing.is_empty() {
            tracing::warn!(
                group = %group,
                missing = ?missing,
                "rule set references unknown groups"
            );
            return Err(MergeGraphError::InconsistentStore(format!(
                "rule set of {group} references missing targets: {}",
                missing.join(", ")
            )));
        }

        for (draft, view) in &components {
            Ingestor::upsert_record(&mut self.connector, draft, view)?;
        }
        for (draft, view) in &components {
            Ingestor::merge_edges(&mut self.connector, draft, view)?;
        }
        tracing::info!(group = %group, entity_type = %rule_set.entity_type, "stored rule set");

        self.get_rule_set(group)?.ok_or_else(|| {
            MergeGraphError::InconsistentStore(format!("rule set of {group} vanished"))
        })
    }

    // -------------------------------------------------------------------------
    // Matching
    // -------------------------------------------------------------------------

    /// Propose moving an extracted item into another group.
    pub fn propose_match(
        &mut self,
        extracted: &Identifier,
        target_group: &Identifier,
    ) -> Result<MatchProposal, MergeGraphError> {
        let item = self.connector.fetch_one(
            &NodeQuery::new()
                .kinds([NodeKind::Extracted])
                .identifier(extracted.clone()),
            &format!("extracted item {extracted}"),
        )?;
        let target = self.connector.fetch_one(
            &NodeQuery::new()
                .kinds([NodeKind::Merged])
                .identifier(target_group.clone()),
            &format!("merged item {target_group}"),
        )?;
        let schema = self.schemas.require(&item.stem)?;
        MatchProposal::propose(&item, &target, schema)
    }

    /// Carry out a proposed match.
    pub fn apply_match(
        &mut self,
        proposal: &MatchProposal,
    ) -> Result<MatchProposal, MergeGraphError> {
        proposal.apply()
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    /// Node counts per kind and resolver counters.
    pub fn status(&mut self) -> Result<SessionStatus, MergeGraphError> {
        let mut nodes = BTreeMap::new();
        for kind in NodeKind::ALL {
            let count = self.connector.count(&NodeQuery::new().kinds([kind]))?;
            nodes.insert(kind.to_string(), count);
        }
        Ok(SessionStatus {
            nodes,
            identities: self.resolver.metrics(),
        })
    }

    /// Stem types known to the schema registry.
    pub fn entity_types(&self) -> impl Iterator<Item = &EntityType> {
        self.schemas.entity_types()
    }
}

// =============================================================================
// TESTS
// =============================================================================
