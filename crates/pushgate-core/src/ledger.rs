//! Identity ledger: append-only claims on package identities plus the
//! validation state of each claim.
//!
//! Arbitration is a compare-and-insert on a `DashMap` entry, so concurrent
//! claims on the same identity always produce exactly one winner without
//! serializing claims on different identities. The winner then publishes its
//! claim file with a no-clobber hard link from a fully written temp file.
//! The claim path is the on-disk unique key: a second process sharing the
//! data dir cannot claim the identity again, and a crash never leaves a
//! half-written claim behind.
//!
//! Layout under the ledger dir:
//! - `claims/<sha256(key)>.json`: the `ClaimRecord`, written once
//! - `states/<sha256(key)>.json`: current `ValidationState` and artifact ref
//!
//! A claim file that cannot be parsed still burns its identity. Its entry is
//! rebuilt as rejected the first time that identity is claimed again.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{PushError, Result};
use crate::identity::{compare_versions, PackageIdentity};
use crate::store::{sha256_hex, ArtifactRef};

/// Validation lifecycle of a claim. Pending moves exactly once to a terminal state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ValidationState {
    Pending,
    Available,
    Rejected { reason: String },
}

impl ValidationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ValidationState::Pending)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ValidationState::Pending => "pending",
            ValidationState::Available => "available",
            ValidationState::Rejected { .. } => "rejected",
        }
    }
}

/// Permanent record that one request won an identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub identity: PackageIdentity,
    pub claimed_at: DateTime<Utc>,
    pub request_token: String,
}

/// A claim with its current state and, once committed, its artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub claim: ClaimRecord,
    pub state: ValidationState,
    pub artifact: Option<ArtifactRef>,
}

#[derive(Serialize, Deserialize)]
struct StateRecord {
    #[serde(flatten)]
    state: ValidationState,
    artifact: Option<ArtifactRef>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Won(ClaimRecord),
    Lost,
}

pub const UNREADABLE_CLAIM: &str = "claim record unreadable";

pub struct IdentityLedger {
    dir: PathBuf,
    entries: DashMap<String, LedgerEntry>,
}

impl IdentityLedger {
    /// Open the ledger at `dir`, rebuilding the index from disk.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let ledger = Self {
            dir: dir.into(),
            entries: DashMap::new(),
        };
        fs::create_dir_all(ledger.claims_dir()).await?;
        fs::create_dir_all(ledger.states_dir()).await?;

        let mut loaded = 0usize;
        let mut unreadable = 0usize;
        let mut dir_entries = fs::read_dir(ledger.claims_dir()).await?;
        while let Some(file) = dir_entries.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match ledger.load_entry(&path).await {
                Ok(entry) => {
                    ledger.entries.insert(entry.claim.identity.key(), entry);
                    loaded += 1;
                }
                Err(PushError::Json(e)) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable claim record");
                    unreadable += 1;
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(dir = %ledger.dir.display(), claims = loaded, unreadable, "opened identity ledger");
        Ok(ledger)
    }

    fn claims_dir(&self) -> PathBuf {
        self.dir.join("claims")
    }

    fn states_dir(&self) -> PathBuf {
        self.dir.join("states")
    }

    fn file_name(key: &str) -> String {
        format!("{}.json", sha256_hex(key.as_bytes()))
    }

    fn claim_path(&self, key: &str) -> PathBuf {
        self.claims_dir().join(Self::file_name(key))
    }

    fn state_path(&self, key: &str) -> PathBuf {
        self.states_dir().join(Self::file_name(key))
    }

    async fn load_entry(&self, claim_path: &Path) -> Result<LedgerEntry> {
        let claim: ClaimRecord = serde_json::from_slice(&fs::read(claim_path).await?)?;
        let state_path = self.state_path(&claim.identity.key());
        let (state, artifact) = match fs::read(&state_path).await {
            Ok(bytes) => {
                let record: StateRecord = serde_json::from_slice(&bytes)?;
                (record.state, record.artifact)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => (ValidationState::Pending, None),
            Err(e) => return Err(e.into()),
        };
        Ok(LedgerEntry {
            claim,
            state,
            artifact,
        })
    }

    /// Claim `identity` for the request identified by `request_token`.
    ///
    /// Exactly one of any number of concurrent callers gets `Won`. `Lost`
    /// returns immediately and never waits on the winner.
    pub async fn try_claim(&self, identity: &PackageIdentity, request_token: &str) -> Result<ClaimOutcome> {
        let key = identity.key();
        let record = ClaimRecord {
            identity: identity.clone(),
            claimed_at: Utc::now(),
            request_token: request_token.to_string(),
        };

        match self.entries.entry(key.clone()) {
            Entry::Occupied(_) => return Ok(ClaimOutcome::Lost),
            Entry::Vacant(slot) => {
                slot.insert(LedgerEntry {
                    claim: record.clone(),
                    state: ValidationState::Pending,
                    artifact: None,
                });
            }
        }

        // Shard lock is released; disk latency stays outside the atomic section.
        match self.persist_claim(&record).await {
            Ok(()) => Ok(ClaimOutcome::Won(record)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::info!(key = %key, "identity already claimed on disk");
                match self.load_entry(&self.claim_path(&key)).await {
                    Ok(on_disk) => {
                        self.entries.insert(key, on_disk);
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "claim on disk is unreadable, identity stays burned");
                        let state = ValidationState::Rejected {
                            reason: UNREADABLE_CLAIM.to_string(),
                        };
                        if let Err(e) = self.persist_state(&key, &state, None).await {
                            tracing::warn!(key = %key, error = %e, "could not record unreadable claim");
                        }
                        if let Some(mut entry) = self.entries.get_mut(&key) {
                            entry.state = state;
                        }
                    }
                }
                Ok(ClaimOutcome::Lost)
            }
            Err(e) => {
                // The in-memory claim stays: claims are never released.
                let reason = format!("claim could not be persisted: {}", e);
                if let Some(mut entry) = self.entries.get_mut(&key) {
                    entry.state = ValidationState::Rejected {
                        reason: reason.clone(),
                    };
                }
                Err(PushError::StoreWriteFailure {
                    identity: key,
                    reason,
                })
            }
        }
    }

    /// Write the record to a temp file, then link it into place. The link
    /// fails with `AlreadyExists` if the identity is claimed on disk.
    async fn persist_claim(&self, record: &ClaimRecord) -> std::io::Result<()> {
        let path = self.claim_path(&record.identity.key());
        let tmp = path.with_extension(format!("{:08x}.tmp", rand::random::<u32>()));
        let bytes = serde_json::to_vec_pretty(record)?;
        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await
        }
        .await;
        let linked = match written {
            Ok(()) => fs::hard_link(&tmp, &path).await,
            Err(e) => Err(e),
        };
        let _ = fs::remove_file(&tmp).await;
        linked
    }

    async fn persist_state(&self, key: &str, state: &ValidationState, artifact: Option<&ArtifactRef>) -> Result<()> {
        let record = StateRecord {
            state: state.clone(),
            artifact: artifact.cloned(),
        };
        let path = self.state_path(key);
        let tmp = path.with_extension(format!("{:08x}.tmp", rand::random::<u32>()));
        {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&serde_json::to_vec_pretty(&record)?).await?;
            file.sync_all().await?;
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Record the committed artifact of a pending claim.
    pub async fn attach_artifact(&self, artifact: &ArtifactRef) -> Result<()> {
        let key = artifact.identity.key();
        let current = self
            .entry(&artifact.identity)
            .ok_or_else(|| PushError::NotFound(format!("claim {}", key)))?;
        if current.state.is_terminal() {
            return Err(PushError::AlreadyTerminal(key));
        }
        self.persist_state(&key, &ValidationState::Pending, Some(artifact)).await?;
        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.artifact = Some(artifact.clone());
        }
        Ok(())
    }

    /// Move a pending claim to a terminal state. The new state is durable
    /// before it becomes visible.
    pub async fn transition(&self, identity: &PackageIdentity, state: ValidationState) -> Result<()> {
        let key = identity.key();
        if !state.is_terminal() {
            return Err(PushError::Internal(format!("{} cannot move back to pending", key)));
        }
        let current = self
            .entry(identity)
            .ok_or_else(|| PushError::NotFound(format!("claim {}", key)))?;
        if current.state.is_terminal() {
            return Err(PushError::AlreadyTerminal(key));
        }

        self.persist_state(&key, &state, current.artifact.as_ref()).await?;

        let mut entry = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| PushError::NotFound(format!("claim {}", key)))?;
        if entry.state.is_terminal() {
            return Err(PushError::AlreadyTerminal(key));
        }
        tracing::info!(key = %key, state = state.name(), "validation state changed");
        entry.state = state;
        Ok(())
    }

    pub fn is_claimed(&self, identity: &PackageIdentity) -> bool {
        self.entries.contains_key(&identity.key())
    }

    pub fn entry(&self, identity: &PackageIdentity) -> Option<LedgerEntry> {
        self.entries.get(&identity.key()).map(|e| e.value().clone())
    }

    pub fn state(&self, identity: &PackageIdentity) -> Option<ValidationState> {
        self.entries.get(&identity.key()).map(|e| e.state.clone())
    }

    /// All entries, ordered by id then version.
    pub fn list(&self) -> Vec<LedgerEntry> {
        let mut all: Vec<LedgerEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        sort_entries(&mut all);
        all
    }

    /// Entries for one package id (case-insensitive), ordered by version.
    pub fn versions(&self, id: &str) -> Vec<LedgerEntry> {
        let id_lower = id.trim().to_ascii_lowercase();
        let mut matching: Vec<LedgerEntry> = self
            .entries
            .iter()
            .filter(|e| e.claim.identity.id_lower() == id_lower)
            .map(|e| e.value().clone())
            .collect();
        sort_entries(&mut matching);
        matching
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn sort_entries(entries: &mut [LedgerEntry]) {
    entries.sort_by(|a, b| {
        let (a, b) = (&a.claim.identity, &b.claim.identity);
        a.id_lower()
            .cmp(&b.id_lower())
            .then_with(|| compare_versions(a.version(), b.version()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn foo() -> PackageIdentity {
        PackageIdentity::parse("Foo", "1.0.0").unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exactly_one_winner_for_any_n() {
        for n in [2usize, 3, 8, 16, 64] {
            let tmp = tempfile::tempdir().unwrap();
            let ledger = Arc::new(IdentityLedger::open(tmp.path()).await.unwrap());

            let mut handles = Vec::new();
            for i in 0..n {
                let ledger = Arc::clone(&ledger);
                handles.push(tokio::spawn(async move {
                    ledger.try_claim(&foo(), &format!("req-{}", i)).await.unwrap()
                }));
            }
            let mut won = 0;
            for handle in handles {
                if matches!(handle.await.unwrap(), ClaimOutcome::Won(_)) {
                    won += 1;
                }
            }
            assert_eq!(won, 1, "n = {}", n);
            assert_eq!(ledger.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_different_identities_do_not_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = IdentityLedger::open(tmp.path()).await.unwrap();
        let a = PackageIdentity::parse("Foo", "1.0.0").unwrap();
        let b = PackageIdentity::parse("Foo", "1.0.1").unwrap();
        assert!(matches!(ledger.try_claim(&a, "r1").await.unwrap(), ClaimOutcome::Won(_)));
        assert!(matches!(ledger.try_claim(&b, "r2").await.unwrap(), ClaimOutcome::Won(_)));
        // Case-insensitive id, normalized version.
        let a_again = PackageIdentity::parse("FOO", "1.0").unwrap();
        assert_eq!(ledger.try_claim(&a_again, "r3").await.unwrap(), ClaimOutcome::Lost);
    }

    #[tokio::test]
    async fn test_claims_survive_reopen_and_stay_burned() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let ledger = IdentityLedger::open(tmp.path()).await.unwrap();
            ledger.try_claim(&foo(), "first").await.unwrap();
            ledger
                .transition(&foo(), ValidationState::Rejected { reason: "bad".into() })
                .await
                .unwrap();
        }

        let reopened = IdentityLedger::open(tmp.path()).await.unwrap();
        let entry = reopened.entry(&foo()).unwrap();
        assert_eq!(entry.claim.request_token, "first");
        assert_eq!(entry.state, ValidationState::Rejected { reason: "bad".into() });
        assert_eq!(reopened.try_claim(&foo(), "second").await.unwrap(), ClaimOutcome::Lost);
    }

    #[tokio::test]
    async fn test_second_process_cannot_claim() {
        let tmp = tempfile::tempdir().unwrap();
        let a = IdentityLedger::open(tmp.path()).await.unwrap();
        let b = IdentityLedger::open(tmp.path()).await.unwrap();

        assert!(matches!(a.try_claim(&foo(), "a").await.unwrap(), ClaimOutcome::Won(_)));
        assert_eq!(b.try_claim(&foo(), "b").await.unwrap(), ClaimOutcome::Lost);
        assert_eq!(b.entry(&foo()).unwrap().claim.request_token, "a");
    }

    #[tokio::test]
    async fn test_reopen_tolerates_truncated_claim() {
        let tmp = tempfile::tempdir().unwrap();
        let bar = PackageIdentity::parse("Bar", "2.0.0").unwrap();
        {
            let ledger = IdentityLedger::open(tmp.path()).await.unwrap();
            ledger.try_claim(&foo(), "first").await.unwrap();
            // A claim file cut short, as a crash mid-write would leave it.
            std::fs::write(ledger.claim_path(&bar.key()), b"").unwrap();
            std::fs::write(tmp.path().join("claims").join("deadbeef.json"), b"{\"ident").unwrap();
        }

        let reopened = IdentityLedger::open(tmp.path()).await.unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.entry(&foo()).unwrap().claim.request_token, "first");

        assert_eq!(reopened.try_claim(&bar, "late").await.unwrap(), ClaimOutcome::Lost);
        assert_eq!(
            reopened.state(&bar),
            Some(ValidationState::Rejected {
                reason: UNREADABLE_CLAIM.to_string()
            })
        );
        assert!(reopened.entry(&bar).unwrap().artifact.is_none());
    }

    #[tokio::test]
    async fn test_claim_leaves_no_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = IdentityLedger::open(tmp.path()).await.unwrap();
        ledger.try_claim(&foo(), "r").await.unwrap();
        let names: Vec<String> = std::fs::read_dir(tmp.path().join("claims"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".json"), "{:?}", names);
        assert!(!names[0].contains(".tmp"));
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = IdentityLedger::open(tmp.path()).await.unwrap();
        ledger.try_claim(&foo(), "r").await.unwrap();
        assert_eq!(ledger.state(&foo()), Some(ValidationState::Pending));

        ledger.transition(&foo(), ValidationState::Available).await.unwrap();
        let err = ledger
            .transition(&foo(), ValidationState::Rejected { reason: "late".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::AlreadyTerminal(_)));
        assert_eq!(ledger.state(&foo()), Some(ValidationState::Available));
        assert!(ledger.transition(&foo(), ValidationState::Pending).await.is_err());
    }

    #[tokio::test]
    async fn test_versions_are_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = IdentityLedger::open(tmp.path()).await.unwrap();
        for v in ["1.10.0", "1.2.0", "1.2.0-beta"] {
            let id = PackageIdentity::parse("pkg", v).unwrap();
            ledger.try_claim(&id, "r").await.unwrap();
        }
        let versions: Vec<String> = ledger
            .versions("PKG")
            .iter()
            .map(|e| e.claim.identity.version().to_string())
            .collect();
        assert_eq!(versions, vec!["1.2.0-beta", "1.2.0", "1.10.0"]);
    }
}
