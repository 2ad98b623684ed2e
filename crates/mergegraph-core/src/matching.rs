//! # Match Proposals
//!
//! Re-assigning an extracted item to another group identity is modelled as a
//! two-state machine, `Proposed -> Applied`. Proposals are validated against
//! the schema; applying one is not supported yet and fails with
//! `NotImplemented`.

use crate::graph::NodeRecord;
use crate::schema::TypeSchema;
use crate::types::{EntityType, Identifier, MergeGraphError, NodeKind};
use serde::{Deserialize, Serialize};

/// Lifecycle of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchState {
    /// Validated, not yet carried out.
    Proposed,
    /// The item now belongs to the target group.
    Applied,
}

/// A request to move an extracted item into another group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchProposal {
    /// The extracted item to move.
    pub extracted: Identifier,
    /// The group it belongs to now.
    pub source_group: Identifier,
    /// The group it should join.
    pub target_group: Identifier,
    /// The shared stem type.
    pub entity_type: EntityType,
    /// Where the proposal stands.
    pub state: MatchState,
}

impl MatchProposal {
    /// Validate a match of a stored item against a stored group anchor.
    ///
    /// The stem types must agree, the type must not be restricted and the
    /// item must not already belong to the target group.
    pub fn propose(
        item: &NodeRecord,
        target: &NodeRecord,
        schema: &TypeSchema,
    ) -> Result<Self, MergeGraphError> {
        if item.key.kind != NodeKind::Extracted || target.key.kind != NodeKind::Merged {
            return Err(MergeGraphError::InvalidRequest(
                "a match joins an extracted item to a merged group".to_string(),
            ));
        }
        if item.stem != target.stem {
            return Err(MergeGraphError::InvalidRequest(format!(
                "cannot match {} into a group of {}",
                item.stem, target.stem
            )));
        }
        if schema.restricted {
            return Err(MergeGraphError::InvalidRequest(format!(
                "{} items cannot be matched",
                schema.stem
            )));
        }
        if item.group == target.key.identifier {
            return Err(MergeGraphError::InvalidRequest(format!(
                "{} already belongs to {}",
                item.key.identifier, item.group
            )));
        }
        Ok(Self {
            extracted: item.key.identifier.clone(),
            source_group: item.group.clone(),
            target_group: target.key.identifier.clone(),
            entity_type: item.stem.clone(),
            state: MatchState::Proposed,
        })
    }

    /// The `Proposed -> Applied` transition.
    pub fn apply(&self) -> Result<Self, MergeGraphError> {
        match self.state {
            MatchState::Proposed => Err(MergeGraphError::NotImplemented("applying a match")),
            MatchState::Applied => Err(MergeGraphError::InvalidRequest(format!(
                "match of {} was already applied",
                self.extracted
            ))),
        }
    }
}
