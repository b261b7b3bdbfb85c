//! Admission: accept an upload, claim its identity, store it, queue it for validation.
//!
//! Every request body is read to the end, including the ones that lose the
//! race or are rejected, so the connection is left in a clean state for
//! whatever the client sends next.

use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::error::{PushError, Result};
use crate::identity::PackageIdentity;
use crate::ledger::{ClaimOutcome, ClaimRecord, IdentityLedger, ValidationState};
use crate::package;
use crate::store::{ArtifactRef, ArtifactStore, StagedUpload};
use crate::validator::Validator;

/// A winning publish.
#[derive(Clone, Debug)]
pub struct Created {
    pub claim: ClaimRecord,
    pub artifact: ArtifactRef,
}

pub struct AdmissionController {
    ledger: Arc<IdentityLedger>,
    store: Arc<ArtifactStore>,
    validator: Arc<Validator>,
    max_package_bytes: u64,
    drain_limit_bytes: u64,
}

impl AdmissionController {
    pub fn new(
        ledger: Arc<IdentityLedger>,
        store: Arc<ArtifactStore>,
        validator: Arc<Validator>,
        max_package_bytes: u64,
        drain_limit_bytes: u64,
    ) -> Self {
        Self {
            ledger,
            store,
            validator,
            max_package_bytes,
            drain_limit_bytes,
        }
    }

    /// Publish one upload. `asserted` is the identity named out-of-band (for
    /// example in the URL); when present it must match the archive manifest.
    pub async fn publish<S, E>(&self, asserted: Option<PackageIdentity>, mut body: S) -> Result<Created>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Display,
    {
        if let Some(identity) = asserted.as_ref().filter(|i| self.ledger.is_claimed(i)) {
            let drained = self.discard_body(&mut body).await;
            tracing::info!(
                package = identity.id(),
                version = identity.version(),
                drained,
                outcome = "conflict",
                "identity already claimed"
            );
            return Err(conflict(identity));
        }

        let staged = match self.store.stage(&mut body, self.max_package_bytes).await {
            Ok(staged) => staged,
            Err(e @ PushError::PayloadTooLarge { .. }) => {
                self.discard_body(&mut body).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let identity = match self.identify(&staged, asserted.as_ref()).await {
            Ok(identity) => identity,
            Err(e) => {
                tracing::info!(error = %e, outcome = "invalid", "rejected upload");
                self.store.discard(staged).await;
                return Err(e);
            }
        };

        // From the claim on, the work runs detached from the request: a client
        // that disconnects cannot leave a won claim without an outcome.
        let settle = Settle {
            ledger: Arc::clone(&self.ledger),
            store: Arc::clone(&self.store),
            validator: Arc::clone(&self.validator),
        };
        tokio::spawn(settle.run(identity, staged))
            .await
            .map_err(|e| PushError::Internal(format!("admission task failed: {}", e)))?
    }

    /// Identity from the staged archive, checked against the asserted one.
    async fn identify(&self, staged: &StagedUpload, asserted: Option<&PackageIdentity>) -> Result<PackageIdentity> {
        if staged.size == 0 {
            return Err(PushError::InvalidPayload("empty package body".to_string()));
        }
        let path = staged.path.clone();
        let manifest = tokio::task::spawn_blocking(move || package::read_manifest(&path))
            .await
            .map_err(|e| PushError::Internal(format!("manifest task failed: {}", e)))??;
        let identity = manifest.identity()?;

        if let Some(asserted) = asserted {
            if *asserted != identity {
                return Err(PushError::InvalidPayload(format!(
                    "request names {} but the package manifest declares {}",
                    asserted, identity
                )));
            }
        }
        Ok(identity)
    }

    /// Read and discard the rest of a body. Stops at the drain limit or on a
    /// transport error.
    pub async fn discard_body<S, E>(&self, body: &mut S) -> u64
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Display,
    {
        let mut drained = 0u64;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => {
                    drained += chunk.len() as u64;
                    if drained > self.drain_limit_bytes {
                        tracing::warn!(drained, limit = self.drain_limit_bytes, "drain limit reached");
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "body ended with error while draining");
                    break;
                }
            }
        }
        drained
    }
}

/// Claim, commit and queue one staged upload.
struct Settle {
    ledger: Arc<IdentityLedger>,
    store: Arc<ArtifactStore>,
    validator: Arc<Validator>,
}

impl Settle {
    async fn run(self, identity: PackageIdentity, staged: StagedUpload) -> Result<Created> {
        let token = format!("{:032x}", rand::random::<u128>());
        let claim = match self.ledger.try_claim(&identity, &token).await {
            Ok(ClaimOutcome::Won(claim)) => claim,
            Ok(ClaimOutcome::Lost) => {
                self.store.discard(staged).await;
                tracing::info!(
                    package = identity.id(),
                    version = identity.version(),
                    outcome = "conflict",
                    "lost identity race"
                );
                return Err(conflict(&identity));
            }
            Err(e) => {
                self.store.discard(staged).await;
                tracing::error!(package = identity.id(), version = identity.version(), error = %e, "claim failed");
                return Err(e);
            }
        };

        let artifact = match self.store.commit(&identity, staged).await {
            Ok(artifact) => artifact,
            Err(e) => return Err(self.burn(&identity, e).await),
        };
        if let Err(e) = self.ledger.attach_artifact(&artifact).await {
            let failure = PushError::StoreWriteFailure {
                identity: identity.key(),
                reason: format!("artifact stored but not recorded: {}", e),
            };
            return Err(self.burn(&identity, failure).await);
        }
        self.validator.enqueue(&identity).await;

        tracing::info!(
            package = identity.id(),
            version = identity.version(),
            size = artifact.size,
            sha256 = %artifact.sha256,
            outcome = "created",
            "package admitted"
        );
        Ok(Created { claim, artifact })
    }

    /// A claimed identity whose artifact could not be stored stays claimed
    /// forever; mark it rejected so readers stop waiting on it.
    async fn burn(&self, identity: &PackageIdentity, error: PushError) -> PushError {
        tracing::error!(
            package = identity.id(),
            version = identity.version(),
            error = %error,
            outcome = "store_failure",
            "identity burned"
        );
        let reason = format!("store write failed: {}", error);
        if let Err(e) = self
            .ledger
            .transition(identity, ValidationState::Rejected { reason })
            .await
        {
            tracing::error!(package = identity.id(), version = identity.version(), error = %e, "could not record store failure");
        }
        error
    }
}

fn conflict(identity: &PackageIdentity) -> PushError {
    PushError::IdentityConflict {
        id: identity.id().to_string(),
        version: identity.version().to_string(),
    }
}
