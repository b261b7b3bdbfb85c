//! Core library for pushgate: identity ledger, artifact store, admission,
//! validation and read path behind a first-writer-wins publish API.
//! Used by the CLI binary; the HTTP surface lives in `server`.

pub mod admission;
#[cfg(feature = "http-reqwest")]
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod package;
pub mod read_path;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod validator;

use std::sync::Arc;

use tokio::task::JoinHandle;

pub use admission::{AdmissionController, Created};
pub use config::{load_config, Config, Policy};
pub use error::{PushError, Result};
pub use identity::PackageIdentity;
pub use ledger::{ClaimOutcome, ClaimRecord, IdentityLedger, LedgerEntry, ValidationState};
pub use read_path::{ArtifactLookup, ReadPath, StatusReport};
pub use store::{ArtifactRef, ArtifactStore};
pub use validator::{RecoveryReport, Validator, WorkQueue};

/// Every component of a running gallery, opened over one data dir.
///
/// Layout: `<data_dir>/ledger`, `<data_dir>/blobs`, `<data_dir>/queue`.
/// Several processes may open the same data dir; opening never disturbs
/// uploads another process is still staging.
pub struct Gallery {
    config: Config,
    ledger: Arc<IdentityLedger>,
    store: Arc<ArtifactStore>,
    validator: Arc<Validator>,
    admission: AdmissionController,
    read_path: ReadPath,
}

impl Gallery {
    /// Open all components and run startup recovery. Validation workers are
    /// not started; call [`Gallery::start_workers`].
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let data_dir = config.data_dir.clone();

        let ledger = Arc::new(IdentityLedger::open(data_dir.join("ledger")).await?);
        let store = Arc::new(ArtifactStore::open(data_dir.join("blobs")).await?);
        store.sweep_staging(crate::store::STAGING_MAX_AGE).await?;

        let queue = WorkQueue::open(data_dir.join("queue")).await?;
        let validator = Arc::new(Validator::new(
            queue,
            Arc::clone(&ledger),
            Arc::clone(&store),
            config.policy.clone(),
        ));
        validator.recover().await?;

        let admission = AdmissionController::new(
            Arc::clone(&ledger),
            Arc::clone(&store),
            Arc::clone(&validator),
            config.max_package_bytes,
            config.drain_limit_bytes,
        );
        let read_path = ReadPath::new(Arc::clone(&ledger), Arc::clone(&store));

        tracing::info!(
            data_dir = %data_dir.display(),
            claims = ledger.len(),
            "gallery opened"
        );
        Ok(Self {
            config,
            ledger,
            store,
            validator,
            admission,
            read_path,
        })
    }

    pub fn start_workers(&self) -> Vec<JoinHandle<()>> {
        self.validator.spawn_workers(self.config.workers)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<IdentityLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn read_path(&self) -> &ReadPath {
        &self.read_path
    }
}
