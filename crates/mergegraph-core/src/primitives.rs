//! # Engine Primitives
//!
//! Hardcoded constants shared by the codec, the identity resolver and the
//! store layer. They are compiled into the binary and immutable at runtime.

/// Separator joining the string segments of a dehydrated path.
///
/// Field names in the schema registry are camelCase identifiers, so the
/// separator never occurs inside a segment.
pub const KEY_SEPARATOR: &str = ".";

/// Reserved flat value standing in for `null`.
///
/// The store cannot represent null; an empty text value is read back as null.
pub const NULL_SENTINEL: &str = "";

/// Separator joining `(primarySourceRef, sourceLocalId)` into a cache key.
///
/// Identifiers are ULIDs and source-local ids containing it are rejected.
pub const CACHE_KEY_SEPARATOR: char = '\u{1f}';

// =============================================================================
// IDENTITY FIELD NAMES
// =============================================================================

/// Field carrying the globally unique, immutable item identifier.
pub const IDENTIFIER_FIELD: &str = "identifier";

/// Field carrying the group identity an item belongs to.
pub const GROUP_IDENTITY_FIELD: &str = "stableTargetId";

/// Field carrying the primary source that produced an item.
pub const PRIMARY_SOURCE_FIELD: &str = "hadPrimarySource";

/// Field carrying the item's key within its primary source.
pub const SOURCE_LOCAL_ID_FIELD: &str = "identifierInPrimarySource";

/// Field carrying the entity stem type.
pub const ENTITY_TYPE_FIELD: &str = "entityType";

/// Fields managed by the engine that never appear in a type schema.
pub const RESERVED_FIELDS: [&str; 5] = [
    IDENTIFIER_FIELD,
    GROUP_IDENTITY_FIELD,
    PRIMARY_SOURCE_FIELD,
    SOURCE_LOCAL_ID_FIELD,
    ENTITY_TYPE_FIELD,
];

// =============================================================================
// INPUT LIMITS
// =============================================================================

/// Maximum number of items accepted by a single `ingest` call.
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Maximum page size of a search.
pub const MAX_SEARCH_LIMIT: usize = 100;

/// Page size used when the caller does not pass one.
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

/// Default number of identities memoized by the in-memory cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;
