//! Filesystem artifact store.
//!
//! Uploads stream into `staging/` while being hashed, then are published
//! under their identity with a no-clobber link. Published blobs are never
//! rewritten.
//! Directory structure: `<root>/packages/<id>/<version>/<id>.<version>.tgz`

use std::fmt::Display;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::integrity::UploadDigest;
use crate::error::{PushError, Result};
use crate::identity::PackageIdentity;

pub const PACKAGE_EXTENSION: &str = "tgz";

/// Staging files untouched for this long belong to no live upload.
pub const STAGING_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// An upload written to staging but not yet published.
#[derive(Debug)]
pub struct StagedUpload {
    pub path: PathBuf,
    pub sha256: String,
    pub integrity: String,
    pub size: u64,
}

/// A published artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub identity: PackageIdentity,
    pub sha256: String,
    pub integrity: String,
    pub size: u64,
    /// Path relative to the store root
    pub storage_key: String,
}

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { root: root.into() };
        fs::create_dir_all(store.staging_dir()).await?;
        fs::create_dir_all(store.packages_dir()).await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    /// Storage key (relative path) for an identity.
    pub fn storage_key(identity: &PackageIdentity) -> String {
        format!(
            "packages/{}/{}/{}.{}",
            identity.id_lower(),
            identity.version(),
            identity.file_stem(),
            PACKAGE_EXTENSION
        )
    }

    pub fn path_for(&self, identity: &PackageIdentity) -> PathBuf {
        self.root.join(Self::storage_key(identity))
    }

    /// Stream `body` into a new staging file, hashing as it goes.
    ///
    /// Takes the stream by reference: when the limit is exceeded the caller
    /// still owns the rest of the body and can drain it.
    pub async fn stage<S, E>(&self, body: &mut S, max_bytes: u64) -> Result<StagedUpload>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Display,
    {
        let path = self
            .staging_dir()
            .join(format!("{:016x}.part", rand::random::<u64>()));
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        let mut digest = UploadDigest::new();
        let outcome: Result<()> = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| PushError::UploadAborted(e.to_string()))?;
                if digest.size() + chunk.len() as u64 > max_bytes {
                    return Err(PushError::PayloadTooLarge { limit: max_bytes });
                }
                digest.update(&chunk);
                file.write_all(&chunk).await?;
            }
            file.sync_all().await?;
            Ok(())
        }
        .await;

        drop(file);
        if let Err(e) = outcome {
            let _ = fs::remove_file(&path).await;
            return Err(e);
        }

        let (sha256, integrity, size) = digest.finish();
        tracing::debug!(path = %path.display(), size, sha256 = %sha256, "staged upload");
        Ok(StagedUpload {
            path,
            sha256,
            integrity,
            size,
        })
    }

    /// Publish a staged upload under `identity`. Fails if anything already
    /// exists at the destination.
    pub async fn commit(&self, identity: &PackageIdentity, staged: StagedUpload) -> Result<ArtifactRef> {
        let storage_key = Self::storage_key(identity);
        let dest = self.root.join(&storage_key);
        let failure = |reason: String| PushError::StoreWriteFailure {
            identity: identity.key(),
            reason,
        };

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| failure(format!("create {}: {}", parent.display(), e)))?;
        }

        match fs::hard_link(&staged.path, &dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                self.discard(staged).await;
                return Err(failure("artifact already present in store".to_string()));
            }
            Err(e) => {
                tracing::debug!(error = %e, "hard link unavailable, copying staged upload");
                if let Err(e) = copy_no_clobber(&staged.path, &dest).await {
                    self.discard(staged).await;
                    return Err(failure(e.to_string()));
                }
            }
        }

        let artifact = ArtifactRef {
            identity: identity.clone(),
            sha256: staged.sha256.clone(),
            integrity: staged.integrity.clone(),
            size: staged.size,
            storage_key,
        };
        self.discard(staged).await;
        Ok(artifact)
    }

    /// Remove a staged upload. Best effort.
    pub async fn discard(&self, staged: StagedUpload) {
        if let Err(e) = fs::remove_file(&staged.path).await {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %staged.path.display(), error = %e, "failed to remove staged upload");
            }
        }
    }

    pub async fn read(&self, artifact: &ArtifactRef) -> Result<Bytes> {
        let path = self.root.join(&artifact.storage_key);
        match fs::read(&path).await {
            Ok(content) => Ok(Bytes::from(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(PushError::NotFound(format!("artifact {}", artifact.identity)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, identity: &PackageIdentity) -> bool {
        fs::try_exists(self.path_for(identity)).await.unwrap_or(false)
    }

    /// Delete staging files not modified within `max_age`. Uploads still
    /// streaming in this or another process keep their files fresh.
    pub async fn sweep_staging(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        let mut entries = fs::read_dir(self.staging_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= max_age && fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "swept orphaned staging files");
        }
        Ok(removed)
    }
}

async fn copy_no_clobber(src: &Path, dest: &Path) -> std::io::Result<()> {
    let mut input = fs::File::open(src).await?;
    let mut output = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)
        .await?;
    tokio::io::copy(&mut input, &mut output).await?;
    output.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::integrity::sha256_hex;
    use futures_util::stream;

    fn body(chunks: Vec<&'static [u8]>) -> impl Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))))
    }

    #[tokio::test]
    async fn test_stage_commit_and_read() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path()).await.unwrap();
        let identity = PackageIdentity::parse("Foo", "1.0.0").unwrap();

        let staged = store
            .stage(&mut body(vec![b"hello ", b"world"]), 1024)
            .await
            .unwrap();
        assert_eq!(staged.size, 11);
        let staged_path = staged.path.clone();

        let artifact = store.commit(&identity, staged).await.unwrap();
        assert_eq!(artifact.sha256, sha256_hex(b"hello world"));
        assert_eq!(artifact.storage_key, "packages/foo/1.0.0/foo.1.0.0.tgz");
        assert!(!staged_path.exists());
        assert!(store.exists(&identity).await);

        let content = store.read(&artifact).await.unwrap();
        assert_eq!(&content[..], b"hello world");
    }

    #[tokio::test]
    async fn test_commit_never_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path()).await.unwrap();
        let identity = PackageIdentity::parse("foo", "1.0.0").unwrap();

        let first = store.stage(&mut body(vec![b"first"]), 1024).await.unwrap();
        store.commit(&identity, first).await.unwrap();

        let second = store.stage(&mut body(vec![b"second"]), 1024).await.unwrap();
        let err = store.commit(&identity, second).await.unwrap_err();
        assert!(matches!(err, PushError::StoreWriteFailure { .. }));

        let on_disk = std::fs::read(store.path_for(&identity)).unwrap();
        assert_eq!(on_disk, b"first");
    }

    #[tokio::test]
    async fn test_stage_enforces_limit_and_leaves_rest_of_body() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path()).await.unwrap();

        let mut stream = body(vec![b"0123456789", b"abcdef", b"tail"]);
        let err = store.stage(&mut stream, 12).await.unwrap_err();
        assert!(matches!(err, PushError::PayloadTooLarge { limit: 12 }));

        let rest = stream.next().await.unwrap().unwrap();
        assert_eq!(&rest[..], b"tail");
        assert_eq!(store.sweep_staging(Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_staging_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path()).await.unwrap();

        let live = store.stage(&mut body(vec![b"in flight"]), 1024).await.unwrap();
        let stale = store.stage(&mut body(vec![b"abandoned"]), 1024).await.unwrap();
        let old = SystemTime::now() - STAGING_MAX_AGE - Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(&stale.path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        assert_eq!(store.sweep_staging(STAGING_MAX_AGE).await.unwrap(), 1);
        assert!(live.path.exists());
        assert!(!stale.path.exists());

        let identity = PackageIdentity::parse("Foo", "1.0.0").unwrap();
        store.commit(&identity, live).await.unwrap();
        assert!(store.exists(&identity).await);
    }
}
