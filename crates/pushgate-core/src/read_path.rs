//! Read path: only validated artifacts are served, and a pending claim is
//! reported as such instead of as missing.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PushError, Result};
use crate::identity::PackageIdentity;
use crate::ledger::{IdentityLedger, ValidationState};
use crate::store::{ArtifactRef, ArtifactStore};

#[derive(Debug)]
pub enum ArtifactLookup {
    Found { content: Bytes, artifact: ArtifactRef },
    NotYetAvailable,
    NotFound,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub id: String,
    pub version: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub claimed_at: DateTime<Utc>,
}

pub struct ReadPath {
    ledger: Arc<IdentityLedger>,
    store: Arc<ArtifactStore>,
}

impl ReadPath {
    pub fn new(ledger: Arc<IdentityLedger>, store: Arc<ArtifactStore>) -> Self {
        Self { ledger, store }
    }

    pub async fn get_artifact(&self, identity: &PackageIdentity) -> Result<ArtifactLookup> {
        let Some(entry) = self.ledger.entry(identity) else {
            return Ok(ArtifactLookup::NotFound);
        };
        match (entry.state, entry.artifact) {
            (ValidationState::Pending, _) => Ok(ArtifactLookup::NotYetAvailable),
            (ValidationState::Rejected { .. }, _) => Ok(ArtifactLookup::NotFound),
            (ValidationState::Available, Some(artifact)) => {
                let content = self.store.read(&artifact).await?;
                Ok(ArtifactLookup::Found { content, artifact })
            }
            // Available always carries an artifact; anything else is ledger damage.
            (ValidationState::Available, None) => Err(PushError::Internal(format!(
                "{} is available but has no stored artifact",
                identity
            ))),
        }
    }

    pub fn status(&self, identity: &PackageIdentity) -> Option<StatusReport> {
        let entry = self.ledger.entry(identity)?;
        let reason = match &entry.state {
            ValidationState::Rejected { reason } => Some(reason.clone()),
            _ => None,
        };
        Some(StatusReport {
            id: entry.claim.identity.id().to_string(),
            version: entry.claim.identity.version().to_string(),
            state: entry.state.name().to_string(),
            reason,
            sha256: entry.artifact.as_ref().map(|a| a.sha256.clone()),
            size: entry.artifact.as_ref().map(|a| a.size),
            claimed_at: entry.claim.claimed_at,
        })
    }

    /// Available versions of `id`, oldest first.
    pub fn available_versions(&self, id: &str) -> Vec<String> {
        self.ledger
            .versions(id)
            .into_iter()
            .filter(|e| e.state == ValidationState::Available)
            .map(|e| e.claim.identity.version().to_string())
            .collect()
    }
}
