//! # Identity Resolver
//!
//! Maps `(primarySourceRef, sourceLocalId)` to the stable `(identifier,
//! groupIdentity)` pair of an extracted item.
//!
//! Resolution is memoized in an `IdentityCache`. On a miss the store is
//! queried for an extracted item carrying exactly that pair; if none exists a
//! fresh pair is minted and reserved in the store. A reservation made earlier,
//! by this or another session, wins over the fresh pair.

use crate::codec::{FlatValue, Properties, Scalar};
use crate::connector::Connector;
use crate::graph::{GraphStore, NodeQuery, NodeRecord};
use crate::primitives::{
    CACHE_KEY_SEPARATOR, DEFAULT_CACHE_CAPACITY, PRIMARY_SOURCE_FIELD, SOURCE_LOCAL_ID_FIELD,
};
use crate::types::{Identifier, Identity, MergeGraphError, NodeKind};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

// =============================================================================
// CACHE
// =============================================================================

/// Memoization of resolved identities.
pub trait IdentityCache {
    /// A cached identity.
    fn get(&self, key: &str) -> Option<Identity>;

    /// Remember an identity.
    fn put(&mut self, key: String, identity: Identity);
}

/// A bounded in-process cache evicting the oldest entry first.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    capacity: usize,
    entries: HashMap<String, Identity>,
    order: VecDeque<String>,
}

impl MemoryCache {
    /// Create a cache holding at most `capacity` identities.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Number of cached identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl IdentityCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Identity> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: String, identity: Identity) {
        if self.entries.insert(key.clone(), identity).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

// =============================================================================
// FILTERS & METRICS
// =============================================================================

/// Which identities `fetch` returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityFilter {
    /// Every identity of a group, typically one per contributing source.
    Group(Identifier),
    /// The identity of one source-local key, if any.
    Source {
        /// The primary source.
        primary_source: Identifier,
        /// The key within that source.
        source_local_id: String,
    },
}

impl IdentityFilter {
    /// Build a filter from optional request parameters.
    ///
    /// Exactly one of the group identity or the full source pair must be set.
    pub fn from_parts(
        group: Option<Identifier>,
        primary_source: Option<Identifier>,
        source_local_id: Option<String>,
    ) -> Result<Self, MergeGraphError> {
        match (group, primary_source, source_local_id) {
            (Some(group), None, None) => Ok(Self::Group(group)),
            (None, Some(primary_source), Some(source_local_id)) => Ok(Self::Source {
                primary_source,
                source_local_id,
            }),
            _ => Err(MergeGraphError::InvalidRequest(
                "filter by either stableTargetId or hadPrimarySource with identifierInPrimarySource"
                    .to_string(),
            )),
        }
    }
}

/// Counters kept by the resolver. They are not stored in the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMetrics {
    /// Identities minted because no stored item carried the pair.
    pub minted: u64,
    /// Resolutions answered by the cache.
    pub cache_hits: u64,
}

// =============================================================================
// RESOLVER
// =============================================================================

/// The cache key of a source pair.
#[must_use]
pub fn cache_key(primary_source: &Identifier, source_local_id: &str) -> String {
    format!("{primary_source}{CACHE_KEY_SEPARATOR}{source_local_id}")
}

/// The immutable properties recording an identity on its node.
#[must_use]
pub fn identity_properties(identity: &Identity) -> Properties {
    let mut properties = Properties::new();
    properties.insert(
        PRIMARY_SOURCE_FIELD.to_string(),
        FlatValue::Single(Scalar::text(identity.primary_source.as_str())),
    );
    properties.insert(
        SOURCE_LOCAL_ID_FIELD.to_string(),
        FlatValue::Single(Scalar::text(identity.source_local_id.as_str())),
    );
    properties
}

/// Read the identity of a stored extracted item.
pub fn identity_of(record: &NodeRecord) -> Result<Identity, MergeGraphError> {
    let text = |name: &str| match record.fixed.get(name) {
        Some(FlatValue::Single(Scalar::Text(value))) => Ok(value.clone()),
        _ => Err(MergeGraphError::InconsistentStore(format!(
            "extracted item {} lacks {name}",
            record.key.identifier
        ))),
    };
    Ok(Identity {
        identifier: record.key.identifier.clone(),
        group_identity: record.group.clone(),
        primary_source: Identifier::new(text(PRIMARY_SOURCE_FIELD)?),
        source_local_id: text(SOURCE_LOCAL_ID_FIELD)?,
    })
}

fn source_query(primary_source: &Identifier, source_local_id: &str) -> NodeQuery {
    NodeQuery::new()
        .kinds([NodeKind::Extracted])
        .property(PRIMARY_SOURCE_FIELD, Scalar::text(primary_source.as_str()))
        .property(SOURCE_LOCAL_ID_FIELD, Scalar::text(source_local_id))
}

/// Assigns and looks up stable identities.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver<C = MemoryCache> {
    cache: C,
    metrics: IdentityMetrics,
}

impl<C: IdentityCache> IdentityResolver<C> {
    /// Create a resolver over a cache.
    #[must_use]
    pub fn new(cache: C) -> Self {
        Self {
            cache,
            metrics: IdentityMetrics::default(),
        }
    }

    /// Counters since construction.
    #[must_use]
    pub fn metrics(&self) -> IdentityMetrics {
        self.metrics
    }

    /// Resolve a source pair, minting a fresh identity if none exists.
    pub fn assign<S: GraphStore>(
        &mut self,
        connector: &mut Connector<S>,
        primary_source: &Identifier,
        source_local_id: &str,
    ) -> Result<Identity, MergeGraphError> {
        if source_local_id.is_empty() || primary_source.as_str().is_empty() {
            return Err(MergeGraphError::InvalidRequest(
                "identity assignment needs a primary source and a source-local id".to_string(),
            ));
        }
        if source_local_id.contains(CACHE_KEY_SEPARATOR)
            || primary_source.as_str().contains(CACHE_KEY_SEPARATOR)
        {
            return Err(MergeGraphError::InvalidRequest(format!(
                "identity parts may not contain {CACHE_KEY_SEPARATOR:?}"
            )));
        }

        let key = cache_key(primary_source, source_local_id);
        if let Some(identity) = self.cache.get(&key) {
            self.metrics.cache_hits += 1;
            return Ok(identity);
        }

        let query = source_query(primary_source, source_local_id);
        let identity = match connector.fetch_optional(&query, &key)? {
            Some(record) => identity_of(&record)?,
            None => {
                let candidate = Identity {
                    identifier: Identifier::generate(),
                    group_identity: Identifier::generate(),
                    primary_source: primary_source.clone(),
                    source_local_id: source_local_id.to_string(),
                };
                let identity = connector.reserve_identity(&key, &candidate)?;
                if identity == candidate {
                    self.metrics.minted += 1;
                    tracing::info!(
                        identifier = %identity.identifier,
                        group = %identity.group_identity,
                        primary_source = %primary_source,
                        "minted identity"
                    );
                }
                identity
            }
        };

        self.cache.put(key, identity.clone());
        Ok(identity)
    }

    /// Stored identities matching a filter, ordered by identifier.
    pub fn fetch<S: GraphStore>(
        &self,
        connector: &mut Connector<S>,
        filter: &IdentityFilter,
    ) -> Result<Vec<Identity>, MergeGraphError> {
        let query = match filter {
            IdentityFilter::Group(group) => NodeQuery::new()
                .kinds([NodeKind::Extracted])
                .group(group.clone()),
            IdentityFilter::Source {
                primary_source,
                source_local_id,
            } => source_query(primary_source, source_local_id),
        };
        connector.fetch(&query)?.iter().map(identity_of).collect()
    }
}

// =============================================================================
// TESTS
// =============================================================================
