//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use super::FilterArgs;
use crate::config::{Backend, Config};
use mergegraph_core::primitives::{
    GROUP_IDENTITY_FIELD, IDENTIFIER_FIELD, MAX_BATCH_SIZE, PRIMARY_SOURCE_FIELD,
    SOURCE_LOCAL_ID_FIELD,
};
use mergegraph_core::{
    ExtractedItem, Identifier, IdentityFilter, MergeGraphError, MergeMode, RuleSet, Session,
};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum file size for ingestion (100 MB).
const MAX_INGEST_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Maximum file size for a rule set document (1 MB).
const MAX_RULE_SET_FILE_SIZE: u64 = 1024 * 1024;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), MergeGraphError> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        MergeGraphError::InvalidRequest(format!("Cannot read file metadata: {}", e))
    })?;

    if metadata.len() > max_size {
        return Err(MergeGraphError::InvalidRequest(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Canonicalize an input path and make sure it names a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, MergeGraphError> {
    let canonical = path.canonicalize().map_err(|e| {
        MergeGraphError::InvalidRequest(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(MergeGraphError::InvalidRequest(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Read a bounded JSON document.
fn read_json(path: &Path, max_size: u64) -> Result<Value, MergeGraphError> {
    let validated_path = validate_file_path(path)?;
    validate_file_size(&validated_path, max_size)?;
    let contents = std::fs::read(&validated_path)
        .map_err(|e| MergeGraphError::InvalidRequest(format!("Read file: {}", e)))?;
    serde_json::from_slice(&contents)
        .map_err(|e| MergeGraphError::InvalidRequest(format!("Invalid JSON: {}", e)))
}

/// Print a value as pretty JSON.
fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_default()
    );
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Initialize new database.
pub fn cmd_init(config: &Config, force: bool) -> Result<(), MergeGraphError> {
    let path = &config.storage.path;
    if config.storage.backend == Backend::Memory {
        return Err(MergeGraphError::InvalidRequest(
            "The memory backend has no database to initialize.".to_string(),
        ));
    }
    if path.exists() {
        if !force {
            return Err(MergeGraphError::InvalidRequest(
                "Database already exists. Use --force to overwrite.".to_string(),
            ));
        }
        std::fs::remove_file(path).map_err(|e| {
            MergeGraphError::InvalidRequest(format!("Remove {}: {}", path.display(), e))
        })?;
    }

    let _session = config.open_session()?;
    println!("Initialized new redb database at {:?}", path);
    Ok(())
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show node counts per kind.
pub fn cmd_status(config: &Config, json_mode: bool) -> Result<(), MergeGraphError> {
    let mut session = config.open_session()?;
    let status = session.status()?;
    let backend = session.connector().store().name();

    if json_mode {
        let output = serde_json::json!({
            "database": config.storage.path.to_string_lossy(),
            "backend": backend,
            "nodes": status.nodes,
            "identities": status.identities,
            "entity_types": session.entity_types().map(|t| t.as_str()).collect::<Vec<_>>(),
        });
        print_json(&output);
        return Ok(());
    }

    println!("mergegraph Status");
    println!("=================");
    println!("Database: {:?}", config.storage.path);
    println!("Backend:  {}", backend);
    println!();
    for (kind, count) in &status.nodes {
        println!("{:<12} {}", format!("{}:", kind), count);
    }
    println!();
    println!("Minted:      {}", status.identities.minted);
    println!("Cache hits:  {}", status.identities.cache_hits);
    Ok(())
}

// =============================================================================
// IDENTITY COMMANDS
// =============================================================================

/// Resolve a source pair to its stable identity.
pub fn cmd_assign(
    config: &Config,
    json_mode: bool,
    source: &str,
    local_id: &str,
) -> Result<(), MergeGraphError> {
    let mut session = config.open_session()?;
    let identity = session.assign_identity(&Identifier::new(source), local_id)?;

    if json_mode {
        print_json(&identity);
    } else {
        println!("Identifier:     {}", identity.identifier);
        println!("Group identity: {}", identity.group_identity);
    }
    Ok(())
}

/// Fetch stored identities.
pub fn cmd_identities(
    config: &Config,
    json_mode: bool,
    group: Option<String>,
    source: Option<String>,
    local_id: Option<String>,
) -> Result<(), MergeGraphError> {
    let filter = IdentityFilter::from_parts(
        group.map(Identifier::new),
        source.map(Identifier::new),
        local_id,
    )?;
    let mut session = config.open_session()?;
    let identities = session.fetch_identity(&filter)?;

    if json_mode {
        print_json(&identities);
        return Ok(());
    }
    for identity in &identities {
        println!(
            "{}  group={}  source={}  local={}",
            identity.identifier,
            identity.group_identity,
            identity.primary_source,
            identity.source_local_id
        );
    }
    println!("{} identities", identities.len());
    Ok(())
}

// =============================================================================
// INGEST COMMAND
// =============================================================================

/// Turn raw JSON objects into extracted items, resolving identities for
/// objects that carry only their source pair.
pub fn resolve_items(
    session: &mut Session,
    values: Vec<Value>,
) -> Result<Vec<ExtractedItem>, MergeGraphError> {
    if values.len() > MAX_BATCH_SIZE {
        return Err(MergeGraphError::InvalidRequest(format!(
            "Item count {} exceeds maximum allowed {}",
            values.len(),
            MAX_BATCH_SIZE
        )));
    }

    let mut items = Vec::with_capacity(values.len());
    for (index, value) in values.into_iter().enumerate() {
        let Value::Object(mut object) = value else {
            return Err(MergeGraphError::InvalidRequest(format!(
                "item {} is not a JSON object",
                index
            )));
        };
        if !object.contains_key(IDENTIFIER_FIELD) {
            let source = object.get(PRIMARY_SOURCE_FIELD).and_then(Value::as_str);
            let local_id = object.get(SOURCE_LOCAL_ID_FIELD).and_then(Value::as_str);
            let (Some(source), Some(local_id)) = (source, local_id) else {
                return Err(MergeGraphError::InvalidRequest(format!(
                    "item {} needs {} or both {} and {}",
                    index, IDENTIFIER_FIELD, PRIMARY_SOURCE_FIELD, SOURCE_LOCAL_ID_FIELD
                )));
            };
            let identity = session.assign_identity(&Identifier::new(source), local_id)?;
            object.insert(
                IDENTIFIER_FIELD.to_string(),
                Value::String(identity.identifier.to_string()),
            );
            object.insert(
                GROUP_IDENTITY_FIELD.to_string(),
                Value::String(identity.group_identity.to_string()),
            );
        }
        let item: ExtractedItem = serde_json::from_value(Value::Object(object))
            .map_err(|e| MergeGraphError::InvalidRequest(format!("item {}: {}", index, e)))?;
        items.push(item);
    }
    Ok(items)
}

/// Ingest extracted items from a JSON array file.
pub fn cmd_ingest(config: &Config, json_mode: bool, file: &Path) -> Result<(), MergeGraphError> {
    tracing::info!("Ingesting from {:?}", file);

    let values = match read_json(file, MAX_INGEST_FILE_SIZE)? {
        Value::Array(values) => values,
        _ => {
            return Err(MergeGraphError::InvalidRequest(
                "Expected a JSON array of extracted items".to_string(),
            ));
        }
    };

    let mut session = config.open_session()?;
    let items = resolve_items(&mut session, values)?;
    let report = session.ingest(&items)?;

    if json_mode {
        print_json(&serde_json::json!({
            "upserted": report.upserted,
            "created": report.created,
            "failures": report
                .failures
                .iter()
                .map(|f| serde_json::json!({"identifier": f.identifier, "error": f.error}))
                .collect::<Vec<_>>(),
        }));
    } else {
        println!(
            "Ingested {} items ({} new, {} failed)",
            report.upserted.len(),
            report.created,
            report.failures.len()
        );
        for failure in &report.failures {
            println!("  {}: {}", failure.identifier, failure.error);
        }
    }
    Ok(())
}

// =============================================================================
// SEARCH COMMANDS
// =============================================================================

/// Search extracted items.
pub fn cmd_search(config: &Config, filter: &FilterArgs) -> Result<(), MergeGraphError> {
    let mut session = config.open_session()?;
    let page =
        session.search_extracted_items(&filter.to_filter(), filter.skip, filter.limit)?;
    print_json(&page);
    Ok(())
}

/// Show the merged item of one group.
pub fn cmd_merged(config: &Config, group: &str, mode: MergeMode) -> Result<(), MergeGraphError> {
    let mut session = config.open_session()?;
    let merged = session.get_merged_item(&Identifier::new(group), mode)?;
    print_json(&merged);
    Ok(())
}

/// Search merged items.
pub fn cmd_search_merged(
    config: &Config,
    filter: &FilterArgs,
    mode: MergeMode,
) -> Result<(), MergeGraphError> {
    let mut session = config.open_session()?;
    let page =
        session.search_merged_items(&filter.to_filter(), filter.skip, filter.limit, mode)?;
    print_json(&page);
    Ok(())
}

// =============================================================================
// RULE SET COMMANDS
// =============================================================================

fn read_rule_set(file: &Path) -> Result<RuleSet, MergeGraphError> {
    serde_json::from_value(read_json(file, MAX_RULE_SET_FILE_SIZE)?)
        .map_err(|e| MergeGraphError::InvalidRequest(format!("Invalid rule set: {}", e)))
}

/// Store a group's rule set.
pub fn cmd_rule_set(
    config: &Config,
    json_mode: bool,
    group: &str,
    file: &Path,
) -> Result<(), MergeGraphError> {
    let rule_set = read_rule_set(file)?;
    let mut session = config.open_session()?;
    let stored = session.create_or_update_rule_set(&Identifier::new(group), &rule_set)?;

    if json_mode {
        print_json(&stored);
    } else {
        println!("Stored {} rule set for {}", stored.entity_type, group);
    }
    Ok(())
}

/// Merge a group with a candidate rule set without storing it.
pub fn cmd_preview(config: &Config, group: &str, file: &Path) -> Result<(), MergeGraphError> {
    let rule_set = read_rule_set(file)?;
    let mut session = config.open_session()?;
    let merged = session.preview_merged_item(&Identifier::new(group), &rule_set)?;
    print_json(&merged);
    Ok(())
}
