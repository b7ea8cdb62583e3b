//! Release metadata access.
//!
//! The signed-metadata (TUF) client lives outside this crate. It maintains a
//! local store of release documents that were cryptographically validated
//! against signed role metadata before being written. This module reads that
//! store and hands the controller the target filename and artifact metadata
//! for the channel the agent follows. The core trusts this store and nothing
//! else; the mirror is untrusted by construction.

use crate::config::UpdateChannel;
use crate::error::{LauncherError, Result};
use crate::update::{version_from_target, Binary};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Hash algorithms release metadata may carry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Length and digests for one release artifact.
///
/// `length` is authoritative: downloads are truncated to exactly this many
/// bytes before hashing. Digests are lowercase hex, keyed by algorithm; the
/// algorithm set is the map's key set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetMeta {
    pub length: u64,
    pub hashes: BTreeMap<HashAlgorithm, String>,
}

/// One verified release document, as written by the external TUF client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseDocument {
    /// Target filename, e.g. `launcher-1.4.3.tar.gz`.
    pub target: String,
    /// Artifact length and digests.
    #[serde(flatten)]
    pub meta: TargetMeta,
}

/// Source of verified release targets.
///
/// Consecutive calls may return the same target indefinitely; a target older
/// than the running version is a channel-directed rollback and is the
/// controller's to act on.
pub trait MetadataSource: Send + Sync {
    /// Returns the target filename and metadata for the currently selected
    /// release of `binary` on `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError::Metadata`] when no validated release
    /// document is available or the document is malformed.
    fn target_for(&self, binary: Binary, channel: UpdateChannel) -> Result<(String, TargetMeta)>;
}

/// Reads release documents from the local store maintained by the external
/// signed-metadata client, at `<root>/<binary>/<channel>/release.json`.
pub struct LocalMetadataStore {
    root: PathBuf,
}

impl LocalMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn release_path(&self, binary: Binary, channel: UpdateChannel) -> PathBuf {
        self.root
            .join(binary.as_str())
            .join(channel.to_string())
            .join("release.json")
    }
}

impl MetadataSource for LocalMetadataStore {
    fn target_for(&self, binary: Binary, channel: UpdateChannel) -> Result<(String, TargetMeta)> {
        let path = self.release_path(binary, channel);
        let bytes = std::fs::read(&path).map_err(|e| {
            LauncherError::Metadata(format!(
                "cannot read release document {}: {e}",
                path.display()
            ))
        })?;

        let document: ReleaseDocument = serde_json::from_slice(&bytes).map_err(|e| {
            LauncherError::Metadata(format!(
                "malformed release document {}: {e}",
                path.display()
            ))
        })?;

        validate_target_filename(binary, &document.target)?;

        if document.meta.hashes.is_empty() {
            return Err(LauncherError::Metadata(format!(
                "release document {} lists no hash algorithms",
                path.display()
            )));
        }

        Ok((document.target, document.meta))
    }
}

/// A well-formed target filename is `{binary}-{semver}.tar.gz`.
fn validate_target_filename(binary: Binary, target: &str) -> Result<()> {
    let prefix = format!("{binary}-");
    if !target.starts_with(&prefix) || !target.ends_with(".tar.gz") {
        return Err(LauncherError::Metadata(format!(
            "target {target} is not of the form {binary}-<version>.tar.gz"
        )));
    }
    let version = version_from_target(binary, target);
    semver::Version::parse(&version).map_err(|e| {
        LauncherError::Metadata(format!("target {target} carries invalid version: {e}"))
    })?;
    Ok(())
}
