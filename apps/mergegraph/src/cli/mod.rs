//! # mergegraph CLI Module
//!
//! This module implements the CLI interface for mergegraph.
//!
//! ## Available Commands
//!
//! - `init` - Initialize a new database
//! - `status` - Show node counts per kind
//! - `assign` - Resolve a source pair to its identity
//! - `identities` - Fetch stored identities
//! - `ingest` - Ingest extracted items from a JSON file
//! - `search` - Search extracted items
//! - `merged` - Show the merged item of a group
//! - `search-merged` - Search merged items
//! - `rule-set` - Store a group's rule set from a JSON file
//! - `preview` - Merge a group with a candidate rule set without storing it

mod commands;

use crate::config::{Backend, Config};
use clap::{Args, Parser, Subcommand};
use mergegraph_core::{EntityType, Identifier, MergeGraphError, MergeMode, SearchFilter};
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// mergegraph - entity-graph ingestion and merge engine
///
/// Ingests extracted items from independent sources and serves their
/// rule-layered merged view.
#[derive(Parser, Debug)]
#[command(name = "mergegraph")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log store statement parameters on failure
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the graph database (overrides the config file)
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Storage backend: "redb" or "memory" (overrides the config file)
    #[arg(short = 'B', long, global = true)]
    pub backend: Option<Backend>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Search predicate flags shared by `search` and `search-merged`.
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Full-text terms, all of which must match
    #[arg(short, long)]
    pub query: Option<String>,

    /// Exact identifier
    #[arg(long)]
    pub identifier: Option<String>,

    /// Exact group identity
    #[arg(short, long)]
    pub group: Option<String>,

    /// Allowed entity types (repeatable)
    #[arg(short = 't', long = "entity-type")]
    pub entity_types: Vec<String>,

    /// Referenced group identities (repeatable)
    #[arg(short, long = "references")]
    pub references: Vec<String>,

    /// Restrict references to one field
    #[arg(long)]
    pub reference_field: Option<String>,

    /// Matches to skip
    #[arg(long, default_value = "0")]
    pub skip: usize,

    /// Page size (capped at 100)
    #[arg(short, long)]
    pub limit: Option<usize>,
}

impl FilterArgs {
    /// The engine's search filter.
    pub fn to_filter(&self) -> SearchFilter {
        SearchFilter {
            query: self.query.clone(),
            identifier: self.identifier.as_deref().map(Identifier::from),
            group_identity: self.group.as_deref().map(Identifier::from),
            entity_types: self.entity_types.iter().map(EntityType::new).collect(),
            referenced_identifiers: self.references.iter().map(Identifier::new).collect(),
            reference_field: self.reference_field.clone(),
        }
    }
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new empty database
    Init {
        /// Force initialization even if database exists
        #[arg(short, long)]
        force: bool,
    },

    /// Show node counts per kind
    Status,

    /// Resolve (primary source, source-local id) to a stable identity
    Assign {
        /// Group identity of the primary source
        #[arg(short = 's', long)]
        source: String,

        /// The entity's key within that source
        #[arg(short = 'l', long)]
        local_id: String,
    },

    /// Fetch stored identities by group or by source pair
    Identities {
        /// Group identity
        #[arg(short, long)]
        group: Option<String>,

        /// Group identity of the primary source
        #[arg(short = 's', long)]
        source: Option<String>,

        /// The entity's key within that source
        #[arg(short = 'l', long)]
        local_id: Option<String>,
    },

    /// Ingest extracted items from a JSON array file
    Ingest {
        /// Path to the input file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Search extracted items
    Search {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Show the merged item of a group
    Merged {
        /// Group identity
        group: String,

        /// Merge mode (preview, strict)
        #[arg(short, long, default_value = "strict")]
        mode: MergeMode,
    },

    /// Search merged items
    SearchMerged {
        #[command(flatten)]
        filter: FilterArgs,

        /// Merge mode (preview, strict)
        #[arg(short, long, default_value = "strict")]
        mode: MergeMode,
    },

    /// Store a group's rule set from a JSON file
    RuleSet {
        /// Group identity
        group: String,

        /// Path to the rule set file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Merge a group with a candidate rule set without storing it
    Preview {
        /// Group identity
        group: String,

        /// Path to the candidate rule set file
        #[arg(short, long)]
        file: PathBuf,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli) -> Result<(), MergeGraphError> {
    let config = Config::load(cli.config.as_deref())?.with_overrides(
        cli.database,
        cli.backend,
        cli.verbose,
    );
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Init { force }) => cmd_init(&config, force),
        Some(Commands::Status) | None => cmd_status(&config, json_mode),
        Some(Commands::Assign { source, local_id }) => {
            cmd_assign(&config, json_mode, &source, &local_id)
        }
        Some(Commands::Identities {
            group,
            source,
            local_id,
        }) => cmd_identities(&config, json_mode, group, source, local_id),
        Some(Commands::Ingest { file }) => cmd_ingest(&config, json_mode, &file),
        Some(Commands::Search { filter }) => cmd_search(&config, &filter),
        Some(Commands::Merged { group, mode }) => cmd_merged(&config, &group, mode),
        Some(Commands::SearchMerged { filter, mode }) => cmd_search_merged(&config, &filter, mode),
        Some(Commands::RuleSet { group, file }) => cmd_rule_set(&config, json_mode, &group, &file),
        Some(Commands::Preview { group, file }) => cmd_preview(&config, &group, &file),
    }
}
