//! Integration tests for the CLI commands against a temporary redb database.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use clap::Parser;
use mergegraph::cli::{
    Cli, Commands, FilterArgs, cmd_assign, cmd_identities, cmd_ingest, cmd_init, cmd_preview,
    cmd_rule_set, cmd_status,
};
use mergegraph::config::{Backend, Config};
use mergegraph_core::{
    EntityType, Identifier, IdentityFilter, MergeGraphError, MergeMode, SearchFilter,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn config(dir: &TempDir) -> Config {
    Config::default().with_overrides(Some(dir.path().join("graph.redb")), None, false)
}

fn write_json(dir: &TempDir, name: &str, value: &serde_json::Value) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, serde_json::to_vec(value).unwrap()).unwrap();
    path
}

fn ingest_fixture(config: &Config, file: &Path) {
    cmd_init(config, false).unwrap();
    cmd_ingest(config, true, file).unwrap();
}

fn people() -> serde_json::Value {
    json!([
        {
            "entityType": "Organization",
            "identifier": "org-1",
            "stableTargetId": "acme",
            "hadPrimarySource": "ror",
            "identifierInPrimarySource": "01abc",
            "officialName": [{"value": "Acme", "language": "en"}]
        },
        {
            "entityType": "Person",
            "hadPrimarySource": "ldap",
            "identifierInPrimarySource": "ada",
            "fullName": ["Ada Lovelace"],
            "memberOf": ["acme"]
        },
        {
            "entityType": "Person",
            "hadPrimarySource": "ldap",
            "identifierInPrimarySource": "grace",
            "fullName": ["Grace Hopper"]
        }
    ])
}

// =============================================================================
// INIT
// =============================================================================

#[test]
fn test_init_refuses_existing_database() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    cmd_init(&config, false).unwrap();
    assert!(config.storage.path.exists());
    assert!(matches!(
        cmd_init(&config, false),
        Err(MergeGraphError::InvalidRequest(_))
    ));
    cmd_init(&config, true).unwrap();
}

#[test]
fn test_init_rejects_memory_backend() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir).with_overrides(None, Some(Backend::Memory), false);
    assert!(cmd_init(&config, false).is_err());
}

// =============================================================================
// INGEST
// =============================================================================

#[test]
fn test_ingest_assigns_missing_identities() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let file = write_json(&dir, "items.json", &people());
    ingest_fixture(&config, &file);

    let mut session = config.open_session().unwrap();
    let people = session
        .search_extracted_items(
            &SearchFilter {
                entity_types: vec![EntityType::new("Person")],
                ..Default::default()
            },
            0,
            None,
        )
        .unwrap();
    assert_eq!(people.total, 2);

    let ada = session
        .fetch_identity(&IdentityFilter::Source {
            primary_source: Identifier::new("ldap"),
            source_local_id: "ada".to_string(),
        })
        .unwrap();
    assert_eq!(ada.len(), 1);
}

#[test]
fn test_reingest_keeps_identities() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let file = write_json(&dir, "items.json", &people());
    ingest_fixture(&config, &file);
    cmd_ingest(&config, false, &file).unwrap();

    let mut session = config.open_session().unwrap();
    let status = session.status().unwrap();
    assert_eq!(status.nodes.get("Extracted"), Some(&3));
}

#[test]
fn test_ingest_rejects_non_array() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let file = write_json(&dir, "item.json", &json!({"entityType": "Person"}));
    assert!(matches!(
        cmd_ingest(&config, false, &file),
        Err(MergeGraphError::InvalidRequest(_))
    ));
}

#[test]
fn test_ingest_requires_source_pair() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let file = write_json(
        &dir,
        "items.json",
        &json!([{"entityType": "Person", "hadPrimarySource": "ldap"}]),
    );
    assert!(matches!(
        cmd_ingest(&config, false, &file),
        Err(MergeGraphError::InvalidRequest(_))
    ));
}

#[test]
fn test_assign_is_stable_across_invocations() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    cmd_init(&config, false).unwrap();
    cmd_assign(&config, true, "ldap", "ada").unwrap();

    let source = Identifier::new("ldap");
    let first = {
        let mut session = config.open_session().unwrap();
        session.assign_identity(&source, "ada").unwrap()
    };
    let mut session = config.open_session().unwrap();
    let second = session.assign_identity(&source, "ada").unwrap();
    assert_eq!(first, second);
    assert_eq!(session.status().unwrap().identities.minted, 0);
}

#[test]
fn test_ingest_missing_file() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    assert!(cmd_ingest(&config, false, &dir.path().join("missing.json")).is_err());
}

// =============================================================================
// RULE SETS
// =============================================================================

#[test]
fn test_rule_set_changes_merged_item() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let items = json!([{
        "entityType": "Person",
        "identifier": "p1",
        "stableTargetId": "ada",
        "hadPrimarySource": "ldap",
        "identifierInPrimarySource": "ada",
        "givenName": ["Ada", "Augusta"]
    }]);
    ingest_fixture(&config, &write_json(&dir, "items.json", &items));

    let rules = write_json(
        &dir,
        "rules.json",
        &json!({
            "entityType": "Person",
            "additive": {"familyName": ["Lovelace"]},
            "subtractive": {"givenName": ["Augusta"]}
        }),
    );
    cmd_preview(&config, "ada", &rules).unwrap();
    {
        let mut session = config.open_session().unwrap();
        assert!(session.get_rule_set(&Identifier::new("ada")).unwrap().is_none());
    }

    cmd_rule_set(&config, true, "ada", &rules).unwrap();
    let mut session = config.open_session().unwrap();
    let merged = session
        .get_merged_item(&Identifier::new("ada"), MergeMode::Strict)
        .unwrap();
    assert_eq!(merged.field("givenName"), Some(&json!(["Ada"])));
    assert_eq!(merged.field("familyName"), Some(&json!(["Lovelace"])));
}

#[test]
fn test_rule_set_rejects_unknown_field() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    cmd_init(&config, false).unwrap();
    let rules = write_json(
        &dir,
        "rules.json",
        &json!({"entityType": "Person", "additive": {"shoeSize": ["42"]}}),
    );
    assert!(cmd_rule_set(&config, false, "ada", &rules).is_err());
}

// =============================================================================
// IDENTITIES & STATUS
// =============================================================================

#[test]
fn test_identities_filter_validation() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    assert!(matches!(
        cmd_identities(&config, false, None, Some("ldap".to_string()), None),
        Err(MergeGraphError::InvalidRequest(_))
    ));
}

#[test]
fn test_status_on_fresh_database() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    cmd_status(&config, true).unwrap();
    cmd_status(&config, false).unwrap();
}

// =============================================================================
// ARGUMENT PARSING
// =============================================================================

#[test]
fn test_parse_merged_command() {
    let cli = Cli::try_parse_from([
        "mergegraph",
        "--json-mode",
        "-B",
        "memory",
        "merged",
        "g1",
        "--mode",
        "preview",
    ])
    .unwrap();

    assert!(cli.json_mode);
    assert_eq!(cli.backend, Some(Backend::Memory));
    match cli.command {
        Some(Commands::Merged { group, mode }) => {
            assert_eq!(group, "g1");
            assert_eq!(mode, MergeMode::Preview);
        }
        other => panic!("unexpected command: {:?}", other),
    }
}

#[test]
fn test_parse_rejects_unknown_mode() {
    assert!(Cli::try_parse_from(["mergegraph", "merged", "g1", "--mode", "lenient"]).is_err());
}

#[test]
fn test_filter_args_to_filter() {
    let args = FilterArgs {
        query: Some("ada".to_string()),
        entity_types: vec!["Person".to_string()],
        references: vec!["acme".to_string()],
        reference_field: Some("memberOf".to_string()),
        ..Default::default()
    };
    let filter = args.to_filter();
    assert_eq!(filter.entity_types.len(), 1);
    assert_eq!(filter.referenced_identifiers, vec![Identifier::new("acme")]);
    assert!(filter.validate().is_ok());
}
