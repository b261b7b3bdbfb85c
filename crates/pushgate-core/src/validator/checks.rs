//! Validation checks run against a committed artifact.
//!
//! A check returns `Err(reason)` to reject the artifact. Rejections are
//! terminal; I/O problems reading the blob are reported separately as
//! `PushError` so they never turn into a rejection.

use std::path::Path;

use crate::config::Policy;
use crate::error::Result;
use crate::package::{scan_archive, ArchiveScan, MANIFEST_PATH};
use crate::store::{sha256_hex, verify_integrity, ArtifactRef};

pub type CheckResult = std::result::Result<(), String>;

pub struct CheckContext<'a> {
    pub artifact: &'a ArtifactRef,
    pub content: &'a [u8],
    pub scan: &'a ArchiveScan,
    pub policy: &'a Policy,
}

pub trait ValidationCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, ctx: &CheckContext<'_>) -> CheckResult;
}

/// Stored bytes still match the digests recorded at admission.
pub struct DigestCheck;

impl ValidationCheck for DigestCheck {
    fn name(&self) -> &'static str {
        "digest"
    }

    fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        if ctx.content.len() as u64 != ctx.artifact.size {
            return Err(format!(
                "stored size {} does not match uploaded size {}",
                ctx.content.len(),
                ctx.artifact.size
            ));
        }
        if sha256_hex(ctx.content) != ctx.artifact.sha256 {
            return Err("sha256 mismatch".to_string());
        }
        if !verify_integrity(ctx.content, &ctx.artifact.integrity) {
            return Err("integrity mismatch".to_string());
        }
        Ok(())
    }
}

pub struct SingleManifestCheck;

impl ValidationCheck for SingleManifestCheck {
    fn name(&self) -> &'static str {
        "single-manifest"
    }

    fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        match ctx.scan.manifests.len() {
            1 => Ok(()),
            0 => Err(format!("archive has no {}", MANIFEST_PATH)),
            n => Err(format!("archive has {} copies of {}", n, MANIFEST_PATH)),
        }
    }
}

/// Manifest identity equals the claimed identity.
pub struct IdentityMatchCheck;

impl ValidationCheck for IdentityMatchCheck {
    fn name(&self) -> &'static str {
        "identity-match"
    }

    fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        let manifest = ctx
            .scan
            .manifests
            .first()
            .ok_or_else(|| "missing manifest".to_string())?;
        let embedded = manifest.identity().map_err(|e| e.to_string())?;
        if embedded != ctx.artifact.identity {
            return Err(format!(
                "manifest declares {} but the claim is for {}",
                embedded, ctx.artifact.identity
            ));
        }
        Ok(())
    }
}

pub struct SafePathsCheck;

impl ValidationCheck for SafePathsCheck {
    fn name(&self) -> &'static str {
        "safe-paths"
    }

    fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        match ctx.scan.unsafe_paths.first() {
            None => Ok(()),
            Some(path) => Err(format!("archive entry escapes package root: {}", path)),
        }
    }
}

pub struct EntryLimitCheck;

impl ValidationCheck for EntryLimitCheck {
    fn name(&self) -> &'static str {
        "entry-limit"
    }

    fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        if ctx.scan.entry_count > ctx.policy.max_entries {
            return Err(format!(
                "archive has {} entries, limit is {}",
                ctx.scan.entry_count, ctx.policy.max_entries
            ));
        }
        Ok(())
    }
}

/// Optional manifest fields required by policy.
pub struct ManifestFieldsCheck;

impl ValidationCheck for ManifestFieldsCheck {
    fn name(&self) -> &'static str {
        "manifest-fields"
    }

    fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        let Some(manifest) = ctx.scan.manifests.first() else {
            return Ok(());
        };
        let blank = |v: &Option<String>| v.as_deref().map(str::trim).unwrap_or("").is_empty();
        if ctx.policy.require_description && blank(&manifest.description) {
            return Err("manifest has no description".to_string());
        }
        if ctx.policy.require_license && blank(&manifest.license) {
            return Err("manifest has no license".to_string());
        }
        Ok(())
    }
}

pub fn default_checks() -> Vec<Box<dyn ValidationCheck>> {
    vec![
        Box::new(DigestCheck),
        Box::new(SafePathsCheck),
        Box::new(SingleManifestCheck),
        Box::new(IdentityMatchCheck),
        Box::new(EntryLimitCheck),
        Box::new(ManifestFieldsCheck),
    ]
}

/// Run every check against the blob at `path`. Blocking; call from
/// `spawn_blocking`.
pub fn run_checks(
    path: &Path,
    artifact: &ArtifactRef,
    policy: &Policy,
    checks: &[Box<dyn ValidationCheck>],
) -> Result<CheckResult> {
    let content = std::fs::read(path)?;
    let scan = match scan_archive(&content[..]) {
        Ok(scan) => scan,
        Err(e) => return Ok(Err(e.to_string())),
    };
    let ctx = CheckContext {
        artifact,
        content: &content,
        scan: &scan,
        policy,
    };
    for check in checks {
        if let Err(reason) = check.check(&ctx) {
            tracing::debug!(check = check.name(), reason = %reason, "check failed");
            return Ok(Err(format!("{}: {}", check.name(), reason)));
        }
    }
    Ok(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PackageIdentity;
    use crate::package::pack_manifest;
    use crate::store::UploadDigest;
    use serde_json::json;

    fn artifact_for(id: &str, version: &str, content: &[u8]) -> ArtifactRef {
        let mut digest = UploadDigest::new();
        digest.update(content);
        let (sha256, integrity, size) = digest.finish();
        ArtifactRef {
            identity: PackageIdentity::parse(id, version).unwrap(),
            sha256,
            integrity,
            size,
            storage_key: "unused".to_string(),
        }
    }

    fn run(content: &[u8], artifact: &ArtifactRef, policy: &Policy) -> CheckResult {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), content).unwrap();
        run_checks(tmp.path(), artifact, policy, &default_checks()).unwrap()
    }

    #[test]
    fn test_valid_package_passes() {
        let content = pack_manifest(&json!({ "name": "Foo", "version": "1.0.0" }), &[]).unwrap();
        let artifact = artifact_for("foo", "1.0", &content);
        assert_eq!(run(&content, &artifact, &Policy::default()), Ok(()));
    }

    #[test]
    fn test_tampered_blob_is_rejected() {
        let content = pack_manifest(&json!({ "name": "Foo", "version": "1.0.0" }), &[]).unwrap();
        let mut artifact = artifact_for("foo", "1.0.0", &content);
        artifact.sha256 = sha256_hex(b"something else");
        let reason = run(&content, &artifact, &Policy::default()).unwrap_err();
        assert!(reason.starts_with("digest"));
    }

    #[test]
    fn test_identity_mismatch_is_rejected() {
        let content = pack_manifest(&json!({ "name": "Foo", "version": "2.0.0" }), &[]).unwrap();
        let artifact = artifact_for("foo", "1.0.0", &content);
        let reason = run(&content, &artifact, &Policy::default()).unwrap_err();
        assert!(reason.starts_with("identity-match"));
    }

    #[test]
    fn test_policy_fields_and_limits() {
        let content = pack_manifest(
            &json!({ "name": "Foo", "version": "1.0.0", "description": "  " }),
            &[("a.js", b"a"), ("b.js", b"b")],
        )
        .unwrap();
        let artifact = artifact_for("Foo", "1.0.0", &content);

        let strict = Policy {
            require_description: true,
            ..Policy::default()
        };
        assert!(run(&content, &artifact, &strict).unwrap_err().contains("description"));

        let tiny = Policy {
            max_entries: 2,
            ..Policy::default()
        };
        assert!(run(&content, &artifact, &tiny).unwrap_err().starts_with("entry-limit"));
    }

    #[test]
    fn test_corrupt_archive_is_a_rejection_not_an_error() {
        let content = b"not an archive".to_vec();
        let artifact = artifact_for("foo", "1.0.0", &content);
        assert!(run(&content, &artifact, &Policy::default()).is_err());
    }
}
