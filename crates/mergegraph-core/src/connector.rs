//! # Store Connector
//!
//! Consistency and retry layer around a `GraphStore`.
//!
//! Every store statement issued by the engine goes through a `Connector`:
//! - Transient failures are retried with capped exponential backoff,
//!   re-establishing the connection before each retry
//! - Any other failure aborts immediately
//! - On final failure the operation is logged with its parameters
//!   (`<redacted>` unless the policy is verbose) and propagated
//!
//! Row-count expectations (`fetch_one`, `fetch_optional`) are checked here and
//! surface as `NotFound` / `MultipleFound`.

use crate::graph::{GraphStore, NestedNode, NodeKey, NodeQuery, NodeRecord, NodeWrite, Slot, Upsert};
use crate::types::{Identifier, Identity, MergeGraphError, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::time::Duration;

/// Placeholder logged instead of statement parameters.
const REDACTED: &str = "<redacted>";

/// Largest doubling applied to the initial backoff.
const MAX_BACKOFF_SHIFT: u32 = 16;

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Bounded retry configuration, the `[retry]` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per statement, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Upper bound of any delay.
    pub max_backoff_ms: u64,
    /// Log statement parameters on final failure.
    pub verbose: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
            verbose: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests and batch tools.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            verbose: false,
        }
    }

    /// The delay before retry number `retry` (starting at 1).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

// =============================================================================
// CONNECTOR
// =============================================================================

/// A store wrapped with the retry policy.
#[derive(Debug)]
pub struct Connector<S> {
    store: S,
    policy: RetryPolicy,
}

impl<S: GraphStore> Connector<S> {
    /// Wrap a store.
    #[must_use]
    pub fn new(store: S, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Borrow the underlying store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The active retry policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Unwrap the store.
    #[must_use]
    pub fn into_inner(self) -> S {
        self.store
    }

    /// Run one statement under the retry policy.
    pub fn run<T, P>(
        &mut self,
        operation: &'static str,
        params: &P,
        mut statement: impl FnMut(&mut S) -> Result<T, StoreError>,
    ) -> Result<T, MergeGraphError>
    where
        P: Debug + ?Sized,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match statement(&mut self.store) {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "transient store failure, retrying"
                    );
                    std::thread::sleep(delay);
                    if let Err(reconnect) = self.store.reconnect() {
                        tracing::warn!(operation, error = %reconnect, "reconnect failed");
                    }
                    attempt += 1;
                }
                Err(error) => {
                    let params = if self.policy.verbose {
                        format!("{params:?}")
                    } else {
                        REDACTED.to_string()
                    };
                    tracing::error!(operation, attempt, %params, %error, "store operation failed");
                    return Err(error.into());
                }
            }
        }
    }

    /// Create or update a node and its group anchor.
    pub fn upsert_node(&mut self, write: &NodeWrite) -> Result<Upsert, MergeGraphError> {
        self.run("upsert_node", write, |store| store.upsert_node(write.clone()))
    }

    /// Create or replace a nested child.
    pub fn upsert_nested(
        &mut self,
        node: &NodeKey,
        slot: &Slot,
        value: &NestedNode,
    ) -> Result<(), MergeGraphError> {
        self.run("upsert_nested", &(node, slot, value), |store| {
            store.upsert_nested(node, slot.clone(), value.clone())
        })
    }

    /// Delete nested children outside `keep`.
    pub fn prune_nested(
        &mut self,
        node: &NodeKey,
        keep: &BTreeSet<Slot>,
    ) -> Result<usize, MergeGraphError> {
        self.run("prune_nested", &(node, keep), |store| {
            store.prune_nested(node, keep)
        })
    }

    /// Create or retarget a reference edge.
    pub fn upsert_edge(
        &mut self,
        node: &NodeKey,
        slot: &Slot,
        target: &Identifier,
    ) -> Result<bool, MergeGraphError> {
        self.run("upsert_edge", &(node, slot, target), |store| {
            store.upsert_edge(node, slot.clone(), target)
        })
    }

    /// Delete reference edges outside `keep`.
    pub fn prune_edges(
        &mut self,
        node: &NodeKey,
        keep: &BTreeSet<Slot>,
    ) -> Result<usize, MergeGraphError> {
        self.run("prune_edges", &(node, keep), |store| {
            store.prune_edges(node, keep)
        })
    }

    /// Matching rows in key order.
    pub fn fetch(&mut self, query: &NodeQuery) -> Result<Vec<NodeRecord>, MergeGraphError> {
        self.run("fetch", query, |store| store.fetch(query))
    }

    /// Number of matching rows.
    pub fn count(&mut self, query: &NodeQuery) -> Result<usize, MergeGraphError> {
        self.run("count", query, |store| store.count(query))
    }

    /// Reserve an identity for a source pair, keeping an earlier reservation.
    pub fn reserve_identity(
        &mut self,
        key: &str,
        candidate: &Identity,
    ) -> Result<Identity, MergeGraphError> {
        self.run("reserve_identity", &(key, candidate), |store| {
            store.reserve_identity(key, candidate)
        })
    }

    /// Exactly one matching row.
    pub fn fetch_one(
        &mut self,
        query: &NodeQuery,
        what: &str,
    ) -> Result<NodeRecord, MergeGraphError> {
        self.fetch_optional(query, what)?
            .ok_or_else(|| MergeGraphError::NotFound(what.to_string()))
    }

    /// Zero or one matching row.
    pub fn fetch_optional(
        &mut self,
        query: &NodeQuery,
        what: &str,
    ) -> Result<Option<NodeRecord>, MergeGraphError> {
        let mut rows = self.fetch(query)?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            count => Err(MergeGraphError::MultipleFound {
                what: what.to_string(),
                count,
            }),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
