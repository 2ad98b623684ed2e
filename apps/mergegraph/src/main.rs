//! # mergegraph
//!
//! The operator binary for the mergegraph ingestion and merge engine.
//!
//! ## Usage
//!
//! ```bash
//! mergegraph init
//! mergegraph ingest -f items.json
//! mergegraph rule-set person-group -f rules.json
//! mergegraph merged person-group --mode strict
//! mergegraph search -q "ada lovelace" -t Person
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: tracing filter (default `mergegraph=info`)
//! - `MERGEGRAPH_LOG_FORMAT`: `text` (default) or `json`

use clap::Parser;
use mergegraph::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    // MERGEGRAPH_LOG_FORMAT=json enables machine-parseable output.
    let log_format =
        std::env::var("MERGEGRAPH_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mergegraph=info,mergegraph_core=info".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if let Err(e) = cli::execute(cli) {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}
