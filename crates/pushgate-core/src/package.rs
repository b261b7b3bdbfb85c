//! Package archive format: a gzip tarball with its manifest at `package/package.json`.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tar::{Archive, Builder, Header};

use crate::error::{PushError, Result};
use crate::identity::PackageIdentity;

pub const MANIFEST_PATH: &str = "package/package.json";
const MAX_MANIFEST_BYTES: u64 = 1024 * 1024;

/// Package manifest embedded in the archive.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
}

impl Manifest {
    pub fn identity(&self) -> Result<PackageIdentity> {
        PackageIdentity::parse(&self.name, &self.version)
    }
}

/// Everything the validator needs to know about an archive, from one pass.
#[derive(Debug, Default)]
pub struct ArchiveScan {
    pub entry_count: usize,
    pub manifests: Vec<Manifest>,
    /// Entries with absolute paths or `..` components
    pub unsafe_paths: Vec<String>,
}

/// Strip a leading `./` from a tar entry path.
fn normalize_entry_path(raw: &str) -> &str {
    raw.trim_start_matches("./")
}

fn is_unsafe_path(raw: &str) -> bool {
    raw.starts_with('/') || raw.starts_with('\\') || raw.split(['/', '\\']).any(|c| c == "..")
}

fn parse_manifest<R: Read>(entry: R) -> Result<Manifest> {
    let mut buf = Vec::new();
    entry.take(MAX_MANIFEST_BYTES + 1).read_to_end(&mut buf)?;
    if buf.len() as u64 > MAX_MANIFEST_BYTES {
        return Err(PushError::InvalidPayload("package.json is too large".to_string()));
    }
    serde_json::from_slice(&buf)
        .map_err(|e| PushError::InvalidPayload(format!("package.json is not valid: {}", e)))
}

fn archive_error(e: std::io::Error) -> PushError {
    PushError::InvalidPayload(format!("not a gzip tar archive: {}", e))
}

/// Read the manifest from an archive, stopping at the first one found.
pub fn read_manifest_from<R: Read>(reader: R) -> Result<Manifest> {
    let mut archive = Archive::new(GzDecoder::new(reader));
    for entry in archive.entries().map_err(archive_error)? {
        let entry = entry.map_err(archive_error)?;
        let raw = String::from_utf8_lossy(&entry.path_bytes()).to_string();
        if normalize_entry_path(&raw) == MANIFEST_PATH && entry.header().entry_type().is_file() {
            return parse_manifest(entry);
        }
    }
    Err(PushError::InvalidPayload(format!("archive has no {}", MANIFEST_PATH)))
}

pub fn read_manifest(path: &Path) -> Result<Manifest> {
    read_manifest_from(File::open(path)?)
}

/// Walk every entry of the archive.
pub fn scan_archive<R: Read>(reader: R) -> Result<ArchiveScan> {
    let mut scan = ArchiveScan::default();
    let mut archive = Archive::new(GzDecoder::new(reader));
    for entry in archive.entries().map_err(archive_error)? {
        let entry = entry.map_err(archive_error)?;
        scan.entry_count += 1;
        let raw = String::from_utf8_lossy(&entry.path_bytes()).to_string();
        if is_unsafe_path(&raw) {
            scan.unsafe_paths.push(raw);
            continue;
        }
        if normalize_entry_path(&raw) == MANIFEST_PATH && entry.header().entry_type().is_file() {
            scan.manifests.push(parse_manifest(entry)?);
        }
    }
    Ok(scan)
}

fn append_file<W: std::io::Write>(builder: &mut Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

/// Build an archive in memory from a manifest and extra `(relative path, bytes)` files.
pub fn pack_manifest(manifest: &serde_json::Value, files: &[(&str, &[u8])]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    let manifest_bytes = serde_json::to_vec_pretty(manifest)?;
    append_file(&mut builder, MANIFEST_PATH, &manifest_bytes)?;
    for (path, data) in files {
        append_file(&mut builder, &format!("package/{}", path.trim_start_matches('/')), data)?;
    }
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Build an archive from a package directory that has `package.json` at its root.
pub fn pack_dir(dir: &Path) -> Result<Vec<u8>> {
    let manifest_path = dir.join("package.json");
    if !manifest_path.is_file() {
        return Err(PushError::InvalidPayload(format!(
            "{} has no package.json",
            dir.display()
        )));
    }
    let manifest: serde_json::Value = serde_json::from_slice(&fs::read(&manifest_path)?)?;

    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    let borrowed: Vec<(&str, &[u8])> = files
        .iter()
        .filter(|(rel, _)| rel != "package.json")
        .map(|(rel, data)| (rel.as_str(), data.as_slice()))
        .collect();
    pack_manifest(&manifest, &borrowed)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, Vec<u8>)>) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.flatten().collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| PushError::Internal(e.to_string()))?
                .to_string_lossy()
                .replace('\\', "/");
            out.push((rel, fs::read(&path)?));
        }
    }
    Ok(())
}
