//! Download verification.
//!
//! The download stream is bounded to the length declared by the release
//! metadata and hashed as it is read. The bytes live in memory until every
//! digest matches; only then is the staged file written. A failed
//! verification therefore never leaves a partial artifact on disk that a
//! later operation could mistake for a valid staged file.

use crate::error::{LauncherError, Result};
use crate::update::metadata::{HashAlgorithm, TargetMeta};
use sha2::{Digest, Sha256, Sha512};
use std::io::Read;
use std::path::Path;

/// Read chunk size for the download stream.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// One in-flight digest computation.
enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(bytes),
            Self::Sha512(h) => h.update(bytes),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Stream `source` through every hasher the metadata lists, verify length
/// and digests, and write the verified bytes to `staged_path`.
///
/// The stream is truncated at `meta.length` bytes; anything the mirror
/// serves beyond that is discarded unread. A response shorter than the
/// declared length fails with a length mismatch.
///
/// # Errors
///
/// Returns [`LauncherError::Network`] for stream read failures,
/// [`LauncherError::LengthMismatch`] / [`LauncherError::DigestMismatch`]
/// for verification failures, and [`LauncherError::Io`] if the verified
/// buffer cannot be written out.
pub fn stage_and_verify(
    source: impl Read,
    target: &str,
    meta: &TargetMeta,
    staged_path: &Path,
) -> Result<()> {
    if meta.hashes.is_empty() {
        return Err(LauncherError::Metadata(format!(
            "no hash algorithms supplied for {target}"
        )));
    }

    let mut hashers: Vec<(HashAlgorithm, Hasher)> = meta
        .hashes
        .keys()
        .map(|&algorithm| (algorithm, Hasher::new(algorithm)))
        .collect();

    let mut bounded = source.take(meta.length);
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        let read = bounded.read(&mut chunk).map_err(|e| {
            LauncherError::Network(format!("reading download stream for {target}: {e}"))
        })?;
        if read == 0 {
            break;
        }
        for (_, hasher) in &mut hashers {
            hasher.update(&chunk[..read]);
        }
        buffer.extend_from_slice(&chunk[..read]);
    }

    if buffer.len() as u64 != meta.length {
        return Err(LauncherError::LengthMismatch {
            target: target.to_owned(),
            expected: meta.length,
            actual: buffer.len() as u64,
        });
    }

    for (algorithm, hasher) in hashers {
        let actual = hasher.finalize_hex();
        // The key set was used to build the hashers, so the lookup cannot miss.
        let expected = meta
            .hashes
            .get(&algorithm)
            .map(|digest| digest.to_ascii_lowercase())
            .unwrap_or_default();
        if actual != expected {
            return Err(LauncherError::DigestMismatch {
                target: target.to_owned(),
                algorithm: algorithm.as_str().to_owned(),
                expected,
                actual,
            });
        }
    }

    std::fs::write(staged_path, &buffer)?;
    Ok(())
}
