//! Background validation: admitted artifacts wait in a durable queue until a
//! worker checks them and promotes the claim to Available or Rejected.

pub mod checks;
mod queue;

use std::sync::Arc;

use tokio::task::JoinHandle;

pub use checks::{default_checks, CheckContext, CheckResult, ValidationCheck};
pub use queue::{Ticket, WorkQueue};

use crate::config::Policy;
use crate::error::{PushError, Result};
use crate::identity::PackageIdentity;
use crate::ledger::{IdentityLedger, ValidationState};
use crate::store::ArtifactStore;

/// What startup recovery found.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Tickets re-dispatched from disk
    pub resumed: usize,
    /// Pending claims with a stored artifact but no ticket
    pub requeued: usize,
    /// Pending claims whose artifact never made it to the store
    pub burned: usize,
}

pub struct Validator {
    queue: WorkQueue,
    ledger: Arc<IdentityLedger>,
    store: Arc<ArtifactStore>,
    policy: Policy,
    checks: Arc<Vec<Box<dyn ValidationCheck>>>,
}

impl Validator {
    pub fn new(queue: WorkQueue, ledger: Arc<IdentityLedger>, store: Arc<ArtifactStore>, policy: Policy) -> Self {
        Self {
            queue,
            ledger,
            store,
            policy,
            checks: Arc::new(default_checks()),
        }
    }

    /// Queue a newly admitted artifact. If the ticket cannot be persisted it
    /// is still dispatched in memory; recovery covers a crash before it runs.
    pub async fn enqueue(&self, identity: &PackageIdentity) {
        let ticket = Ticket::new(identity.clone());
        if let Err(e) = self.queue.enqueue(ticket.clone()).await {
            tracing::warn!(package = identity.id(), version = identity.version(), error = %e, "validation ticket not persisted");
            self.queue.dispatch(ticket);
        }
    }

    /// Bring queue and ledger back in line after a restart.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            resumed: self.queue.recover().await?,
            ..RecoveryReport::default()
        };

        for entry in self.ledger.list() {
            if entry.state.is_terminal() {
                continue;
            }
            let identity = entry.claim.identity;
            if self.queue.has_ticket(&identity) {
                continue;
            }
            if entry.artifact.is_some() && self.store.exists(&identity).await {
                self.enqueue(&identity).await;
                report.requeued += 1;
            } else {
                // Claimed but never stored: the identity stays burned.
                let reason = "artifact missing after restart".to_string();
                self.ledger
                    .transition(&identity, ValidationState::Rejected { reason })
                    .await?;
                report.burned += 1;
            }
        }

        tracing::info!(
            resumed = report.resumed,
            requeued = report.requeued,
            burned = report.burned,
            "validator recovery complete"
        );
        Ok(report)
    }

    /// Spawn `count` workers sharing the queue.
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker_id| {
                let validator = Arc::clone(self);
                tokio::spawn(async move { validator.worker_loop(worker_id).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        tracing::debug!(worker_id, "validator worker started");
        while let Some(ticket) = self.queue.next().await {
            let identity = ticket.identity.clone();
            let outcome = self.validate_one(&identity).await;
            let durable = match &outcome {
                Ok(state) => {
                    tracing::info!(
                        worker_id,
                        package = identity.id(),
                        version = identity.version(),
                        outcome = state.name(),
                        "validation finished"
                    );
                    true
                }
                Err(e) => {
                    // Ticket stays on disk; the next start picks it up.
                    tracing::error!(worker_id, package = identity.id(), version = identity.version(), error = %e, "validation could not complete");
                    false
                }
            };
            if let Err(e) = self.queue.finish(&ticket, durable).await {
                tracing::warn!(worker_id, error = %e, "failed to clear validation ticket");
            }
        }
    }

    /// Validate one identity and record the terminal state.
    pub async fn validate_one(&self, identity: &PackageIdentity) -> Result<ValidationState> {
        let entry = self
            .ledger
            .entry(identity)
            .ok_or_else(|| PushError::NotFound(format!("claim {}", identity)))?;
        if entry.state.is_terminal() {
            return Ok(entry.state);
        }

        let state = match entry.artifact {
            None => ValidationState::Rejected {
                reason: "no artifact was stored for this claim".to_string(),
            },
            Some(artifact) => {
                let path = self.store.root().join(&artifact.storage_key);
                let policy = self.policy.clone();
                let suite = Arc::clone(&self.checks);
                let verdict = tokio::task::spawn_blocking(move || {
                    checks::run_checks(&path, &artifact, &policy, &suite)
                })
                .await
                .map_err(|e| PushError::Internal(format!("validation task failed: {}", e)))??;
                match verdict {
                    Ok(()) => ValidationState::Available,
                    Err(reason) => ValidationState::Rejected { reason },
                }
            }
        };

        self.ledger.transition(identity, state.clone()).await?;
        Ok(state)
    }

    pub fn outstanding(&self) -> usize {
        self.queue.outstanding()
    }

    /// Resolve when nothing is queued or being validated.
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await
    }
}
