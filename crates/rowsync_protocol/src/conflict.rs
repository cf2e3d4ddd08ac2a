//! Conflict detection and resolution.
//!
//! Conflicts are settled by last-write-wins on `updated_at`. Ties keep the
//! existing row, so re-applying a row that is already present is a no-op.

use crate::row::Row;
use crate::timestamp::Epoch;
use serde::{Deserialize, Serialize};

/// Where a row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// The embedded row store.
    Local,
    /// The remote relational store.
    Remote,
}

impl Origin {
    /// Returns the fallback epoch for rows of this origin.
    pub fn epoch(self) -> Epoch {
        match self {
            Origin::Local => Epoch::Local,
            Origin::Remote => Epoch::Remote,
        }
    }

    /// Returns the other side.
    pub fn opposite(self) -> Origin {
        match self {
            Origin::Local => Origin::Remote,
            Origin::Remote => Origin::Local,
        }
    }
}

/// What to do with an incoming row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    /// No row with this id exists on the target side.
    Insert,
    /// The incoming row is strictly newer.
    Update,
    /// The existing row is at least as new; keep it.
    Skip,
}

impl ConflictAction {
    /// Returns true if the incoming row should be written.
    pub fn applies(&self) -> bool {
        !matches!(self, ConflictAction::Skip)
    }
}

/// Resolves an incoming row against the existing row with the same id.
///
/// `candidate_origin` selects the epoch for the candidate's timestamp; the
/// existing row lives on the other side and uses the other epoch.
pub fn resolve(candidate: &Row, candidate_origin: Origin, existing: Option<&Row>) -> ConflictAction {
    let Some(existing) = existing else {
        return ConflictAction::Insert;
    };
    let incoming = candidate.updated_at_or(candidate_origin.epoch());
    let current = existing.updated_at_or(candidate_origin.opposite().epoch());
    if current >= incoming {
        ConflictAction::Skip
    } else {
        ConflictAction::Update
    }
}

/// A resolved conflict between two versions of a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Table name.
    pub table: String,
    /// Row id.
    pub id: String,
    /// Side the incoming row came from.
    pub origin: Origin,
    /// `updated_at` of the incoming row.
    pub incoming_updated_at: Option<String>,
    /// `updated_at` of the existing row.
    pub existing_updated_at: Option<String>,
    /// Outcome.
    pub action: ConflictAction,
}

impl Conflict {
    /// Resolves `candidate` against `existing` and records the outcome.
    ///
    /// Returns `None` when there is nothing to conflict with.
    pub fn detect(
        table: &str,
        candidate: &Row,
        origin: Origin,
        existing: Option<&Row>,
    ) -> Option<Self> {
        let existing = existing?;
        Some(Self {
            table: table.to_string(),
            id: candidate.id.clone(),
            origin,
            incoming_updated_at: candidate.updated_at.clone(),
            existing_updated_at: existing.updated_at.clone(),
            action: resolve(candidate, origin, Some(existing)),
        })
    }

    /// Returns true if the incoming row lost.
    pub fn is_skip(&self) -> bool {
        self.action == ConflictAction::Skip
    }
}
