//! # mergegraph-core
//!
//! The entity-graph ingestion and merge engine.
//!
//! Independent source extractors submit "extracted items" describing
//! overlapping real-world entities. This crate:
//! - Resolves stable identities per `(primary source, source-local id)`
//! - Flattens nested records onto graph nodes and back (`codec`)
//! - Keeps nodes, nested values and reference edges synchronized with the
//!   latest write (`ingestor`)
//! - Folds every item of a group plus its curator rule set into one merged
//!   item (`merge`)
//! - Wraps every store statement with bounded retries (`connector`)
//!
//! ## Architectural Constraints
//!
//! - Synchronous, blocking calls only; no async, no network dependencies
//! - The store, the identity cache and the schema registry are explicit
//!   context objects owned by a `Session`
//! - Single statements are atomic, multi-statement writes are not

// =============================================================================
// MODULES
// =============================================================================

pub mod codec;
pub mod connector;
pub mod graph;
pub mod identity;
pub mod ingestor;
pub mod matching;
pub mod merge;
pub mod primitives;
pub mod query;
pub mod schema;
pub mod session;
pub mod storage;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    CodecError, EntityType, ExtractedItem, Identifier, Identity, MergeGraphError, MergeMode,
    MergedItem, NodeKind, NodeLabel, Paged, Record, RuleKind, RuleSet, StoreError,
};

// =============================================================================
// RE-EXPORTS: Engine
// =============================================================================

pub use codec::{FlatValue, Properties, Scalar, Shape, dehydrate, hydrate};
pub use connector::{Connector, RetryPolicy};
pub use graph::{GraphStore, MemoryGraph, NodeQuery, NodeRecord};
pub use identity::{IdentityCache, IdentityFilter, IdentityMetrics, IdentityResolver, MemoryCache};
pub use ingestor::{IngestFailure, IngestReport, Ingestor};
pub use matching::{MatchProposal, MatchState};
pub use merge::build_entity;
pub use query::SearchFilter;
pub use schema::{EntitySchema, FieldKind, FieldSpec, SchemaRegistry, TypeSchema};
pub use session::{Session, SessionStatus, StorageBackend};
pub use storage::RedbGraph;
