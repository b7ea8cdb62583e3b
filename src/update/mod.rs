//! Auto-update subsystem.
//!
//! Keeps a versioned on-disk library of launcher and osqueryd binaries in
//! sync with the release channel selected by the agent's configuration:
//!
//! 1. [`metadata`] reads the verified release document for the channel
//! 2. [`mirror`] streams the target archive from the content mirror
//! 3. [`verify`] bounds, hashes, and checks the stream before anything
//!    touches disk
//! 4. [`library`] untars, probes, and atomically installs the new version,
//!    and prunes versions that are no longer needed
//! 5. [`controller`] drives the cycle on a timer and hands off to
//!    [`finalize`] when a new launcher version lands
//!
//! Mutations of a binary's library directory are serialized per binary by
//! [`lock::LibraryLock`].

pub mod controller;
pub mod finalize;
pub mod library;
pub mod lock;
pub mod metadata;
pub mod mirror;
pub mod probe;
pub mod verify;

pub use controller::{RunExit, UpdateController};
pub use finalize::{QueryEngineHook, SUPERVISOR_RESTART_EXIT_CODE};
pub use library::UpdateLibrary;
pub use lock::LibraryLock;
pub use metadata::{HashAlgorithm, LocalMetadataStore, MetadataSource, TargetMeta};
pub use mirror::{HttpMirror, MirrorFetcher};

/// A binary managed by the update library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binary {
    /// The agent itself.
    Launcher,
    /// The osquery daemon the agent pairs with.
    Osqueryd,
}

impl Binary {
    /// Both managed binaries, in check order.
    pub const ALL: [Binary; 2] = [Binary::Launcher, Binary::Osqueryd];

    /// Name used in target filenames, mirror paths, and library directories.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Launcher => "launcher",
            Self::Osqueryd => "osqueryd",
        }
    }

    /// Filename of the executable inside a version directory.
    pub fn executable_name(self) -> &'static str {
        if cfg!(target_os = "windows") {
            match self {
                Self::Launcher => "launcher.exe",
                Self::Osqueryd => "osqueryd.exe",
            }
        } else {
            self.as_str()
        }
    }
}

impl std::fmt::Display for Binary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extract the semantic version from a target filename.
///
/// Targets are in the form `launcher-0.13.6.tar.gz`; the version is what
/// remains after trimming the `{binary}-` prefix and the `.tar.gz` suffix.
/// Absent affixes are left in place, so a malformed target yields a string
/// that fails semver parsing downstream.
pub fn version_from_target(binary: Binary, target_filename: &str) -> String {
    let prefix = format!("{binary}-");
    let trimmed = target_filename
        .strip_prefix(&prefix)
        .unwrap_or(target_filename);
    trimmed.strip_suffix(".tar.gz").unwrap_or(trimmed).to_owned()
}
