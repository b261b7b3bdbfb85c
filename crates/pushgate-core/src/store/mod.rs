//! Artifact store: durable, immutable package blobs addressed by identity.

mod artifact_store;
pub mod integrity;

pub use artifact_store::{ArtifactRef, ArtifactStore, StagedUpload, PACKAGE_EXTENSION, STAGING_MAX_AGE};
pub use integrity::{sha256_hex, verify_integrity, UploadDigest};
