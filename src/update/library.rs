//! The on-disk update library.
//!
//! Installed versions live at `<base>/<binary>/<version>/<executable>`.
//! Downloads and untarred candidates pass through a process-private staging
//! directory created under the library base, so the final rename into place
//! stays on one filesystem and is atomic. A version directory only ever
//! appears in the library after its executable passed the liveness probe.
//!
//! Retention: the three most recent valid versions plus whichever version is
//! currently running. Everything else, including directories that do not
//! parse as semver or whose executable fails the probe, is pruned by
//! [`UpdateLibrary::tidy`].

use crate::error::{LauncherError, Result};
use crate::update::lock::LibraryLock;
use crate::update::metadata::TargetMeta;
use crate::update::mirror::MirrorFetcher;
use crate::update::probe::{self, DEFAULT_PROBE_TIMEOUT};
use crate::update::{verify, version_from_target, Binary};
use flate2::read::GzDecoder;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, warn};

/// Valid versions to keep per binary when tidying, counting the running one.
const VERSIONS_TO_KEEP: usize = 3;

/// Owns the versioned library of installed binaries.
pub struct UpdateLibrary {
    base_dir: PathBuf,
    staging: TempDir,
    lock: LibraryLock,
    mirror: Box<dyn MirrorFetcher>,
    probe_timeout: Duration,
}

impl UpdateLibrary {
    /// Create the library rooted at `base_dir`, creating the per-binary
    /// directories and the staging area.
    ///
    /// # Errors
    ///
    /// Returns an error if the library directories or the staging directory
    /// cannot be created.
    pub fn new(base_dir: impl Into<PathBuf>, mirror: Box<dyn MirrorFetcher>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;

        // Same volume as the library, so the install rename is atomic.
        let staging = tempfile::Builder::new()
            .prefix("staged-updates-")
            .tempdir_in(&base_dir)?;

        for binary in Binary::ALL {
            fs::create_dir_all(base_dir.join(binary.as_str()))?;
        }

        Ok(Self {
            base_dir,
            staging,
            lock: LibraryLock::new(),
            mirror,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        })
    }

    /// Create the library rooted at the host's configured update directory.
    ///
    /// # Errors
    ///
    /// Same conditions as [`UpdateLibrary::new`].
    pub fn from_settings(
        settings: &dyn crate::config::Settings,
        mirror: Box<dyn MirrorFetcher>,
    ) -> Result<Self> {
        Self::new(settings.update_directory(), mirror)
    }

    /// Override the liveness probe timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Library directory for the given binary.
    pub fn updates_directory(&self, binary: Binary) -> PathBuf {
        self.base_dir.join(binary.as_str())
    }

    /// Path to the executable for an installed version.
    pub fn executable_path(&self, binary: Binary, version: &str) -> PathBuf {
        self.updates_directory(binary)
            .join(version)
            .join(binary.executable_name())
    }

    /// Whether the version named by `target_filename` is already installed
    /// and usable.
    ///
    /// Optimistic: probes without taking the binary's lock, so callers may
    /// use it to skip work but not to assert absence.
    pub fn available(&self, binary: Binary, target_filename: &str) -> bool {
        let version = version_from_target(binary, target_filename);
        let executable = self.executable_path(binary, &version);
        probe::check_executable(&executable, "--version", self.probe_timeout).is_ok()
    }

    /// Download, verify, and install the given target, unless it is the
    /// running version or already installed.
    ///
    /// Never partial: on any failure the staged artifacts are removed and
    /// the library is left exactly as it was.
    ///
    /// # Errors
    ///
    /// Surfaces download, verification, untar, probe, and filesystem
    /// failures; see the crate error taxonomy.
    pub fn add(
        &self,
        binary: Binary,
        current_version: &str,
        target_filename: &str,
        target_metadata: &TargetMeta,
    ) -> Result<()> {
        let _guard = self.lock.lock(binary);

        if current_version == version_from_target(binary, target_filename) {
            return Ok(());
        }

        if self.available(binary, target_filename) {
            return Ok(());
        }

        let outcome = self.stage_and_install(binary, target_filename, target_metadata);

        // Downloaded archives are removed whether or not the install
        // succeeded, before the lock is released.
        self.tidy_staged();

        outcome
    }

    fn stage_and_install(
        &self,
        binary: Binary,
        target_filename: &str,
        target_metadata: &TargetMeta,
    ) -> Result<()> {
        let staged_archive = self.staging.path().join(target_filename);
        let stream = self.mirror.fetch(binary, target_filename)?;
        verify::stage_and_verify(stream, target_filename, target_metadata, &staged_archive)?;
        self.install_staged(binary, target_filename, &staged_archive)
    }

    /// Untar the verified archive, probe the candidate executable, and
    /// rename the version directory into the library.
    fn install_staged(
        &self,
        binary: Binary,
        target_filename: &str,
        staged_archive: &Path,
    ) -> Result<()> {
        let version = version_from_target(binary, target_filename);
        let staged_version_dir = self.staging.path().join(&version);
        fs::create_dir_all(&staged_version_dir)?;

        let result = (|| -> Result<()> {
            untar_archive(staged_archive, &staged_version_dir)?;

            let executable = staged_version_dir.join(binary.executable_name());
            set_executable(&executable)?;
            probe::check_executable(&executable, "--version", self.probe_timeout)?;

            // The probe happened before this rename; any version directory a
            // reader observes in the library was validated at install time.
            let destination = self.updates_directory(binary).join(&version);
            fs::rename(&staged_version_dir, &destination)?;
            Ok(())
        })();

        // On success the rename moved the directory away and this is a no-op.
        if let Err(e) = fs::remove_dir_all(&staged_version_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(
                    directory = %staged_version_dir.display(),
                    error = %e,
                    "could not remove staged version directory"
                );
            }
        }

        result
    }

    /// Remove staged leftovers and prune the library down to the retention
    /// policy. Failures are logged and never propagate; tidying is
    /// opportunistic and converges on repeated calls.
    pub fn tidy(&self, binary: Binary, current_running_version: &str) {
        let _guard = self.lock.lock(binary);
        self.tidy_staged();
        self.tidy_versions(binary, current_running_version);
    }

    /// Remove everything under the staging root. The staging directory is
    /// shared by both binaries; callers hold the lock for the binary whose
    /// install just finished.
    fn tidy_staged(&self) {
        let entries = match fs::read_dir(self.staging.path()) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "could not read staging directory to tidy it");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(e) = removed {
                debug!(path = %path.display(), error = %e, "could not remove staged update");
            }
        }
    }

    fn tidy_versions(&self, binary: Binary, current_running_version: &str) {
        if current_running_version.is_empty() {
            debug!(%binary, "cannot tidy update library without knowing the running version");
            return;
        }

        let (valid, invalid) = match self.sorted_versions(binary) {
            Ok(versions) => versions,
            Err(e) => {
                debug!(%binary, error = %e, "could not enumerate library versions to tidy");
                return;
            }
        };

        for version in &invalid {
            warn!(%binary, version = %version, "update library contains invalid version");
            self.remove_version(binary, version);
        }

        if valid.len() <= VERSIONS_TO_KEEP {
            return;
        }

        // Walk newest to oldest: the running version is always kept, the
        // next two most recent non-running versions fill the remaining
        // retention slots, and everything older goes.
        let mut kept_non_running = 0usize;
        for version in valid.iter().rev() {
            if version == current_running_version {
                continue;
            }
            if kept_non_running >= VERSIONS_TO_KEEP - 1 {
                self.remove_version(binary, version);
                continue;
            }
            kept_non_running += 1;
        }
    }

    fn remove_version(&self, binary: Binary, version: &str) {
        let directory = self.updates_directory(binary).join(version);
        match fs::remove_dir_all(&directory) {
            Ok(()) => debug!(directory = %directory.display(), "removed update"),
            Err(e) => {
                debug!(directory = %directory.display(), error = %e, "could not remove update");
            }
        }
    }

    /// Enumerate the library for `binary`: valid versions (directory name
    /// parses as semver and the executable passes the probe) sorted
    /// ascending, and everything else as invalid.
    ///
    /// # Errors
    ///
    /// Returns an error only when the library directory cannot be read.
    pub fn sorted_versions(&self, binary: Binary) -> Result<(Vec<String>, Vec<String>)> {
        let updates_dir = self.updates_directory(binary);

        let mut valid: Vec<(semver::Version, String)> = Vec::new();
        let mut invalid: Vec<String> = Vec::new();

        for entry in fs::read_dir(&updates_dir)? {
            let entry = entry?;
            let raw = entry.file_name().to_string_lossy().into_owned();

            let parsed = match semver::Version::parse(&raw) {
                Ok(version) => version,
                Err(_) => {
                    invalid.push(raw);
                    continue;
                }
            };

            let executable = self.executable_path(binary, &raw);
            if probe::check_executable(&executable, "--version", self.probe_timeout).is_err() {
                invalid.push(raw);
                continue;
            }

            valid.push((parsed, raw));
        }

        valid.sort_by(|a, b| a.0.cmp(&b.0));

        Ok((valid.into_iter().map(|(_, raw)| raw).collect(), invalid))
    }

    /// Highest valid installed version. Inspects only the filesystem.
    pub fn newest_version(&self, binary: Binary) -> Option<semver::Version> {
        let (valid, _) = self.sorted_versions(binary).ok()?;
        valid.last().and_then(|raw| semver::Version::parse(raw).ok())
    }

    /// Executable path of the highest valid installed version.
    pub fn newest_executable(&self, binary: Binary) -> Option<PathBuf> {
        let (valid, _) = self.sorted_versions(binary).ok()?;
        valid
            .last()
            .map(|version| self.executable_path(binary, version))
    }

    /// Remove the staging directory. Waits for in-flight operations on both
    /// binaries before deleting.
    ///
    /// # Errors
    ///
    /// Returns an error if the staging directory cannot be removed.
    pub fn close(self) -> Result<()> {
        {
            let _guards: Vec<_> = Binary::ALL.iter().map(|&b| self.lock.lock(b)).collect();
        }
        self.staging.close().map_err(LauncherError::Io)
    }

    #[cfg(test)]
    pub(crate) fn staging_path(&self) -> &Path {
        self.staging.path()
    }
}

/// Extract a gzipped tarball into `destination`.
fn untar_archive(archive_path: &Path, destination: &Path) -> Result<()> {
    let file = fs::File::open(archive_path)?;
    let decoder = GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.unpack(destination).map_err(|e| {
        LauncherError::Untar(format!(
            "cannot untar {} to {}: {e}",
            archive_path.display(),
            destination.display()
        ))
    })
}

/// Mark the candidate executable runnable.
fn set_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::update::mirror::MirrorFetcher;
    use std::io::Read;
    use tempfile::tempdir;

    struct EmptyMirror;

    impl MirrorFetcher for EmptyMirror {
        fn fetch(&self, _binary: Binary, target: &str) -> Result<Box<dyn Read + Send>> {
            Err(LauncherError::Network(format!("no such target {target}")))
        }
    }

    fn new_library(base: &Path) -> UpdateLibrary {
        UpdateLibrary::new(base, Box::new(EmptyMirror)).unwrap()
    }

    #[test]
    fn new_creates_layout() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("updates");
        let library = new_library(&base);

        assert!(base.join("launcher").is_dir());
        assert!(base.join("osqueryd").is_dir());
        assert!(library.staging_path().starts_with(&base));
    }

    #[test]
    fn from_settings_roots_at_configured_directory() {
        let dir = tempdir().unwrap();
        let config = crate::config::AutoupdateConfig {
            update_directory: dir.path().join("updates"),
            ..Default::default()
        };

        let _library = UpdateLibrary::from_settings(&config, Box::new(EmptyMirror)).unwrap();
        assert!(dir.path().join("updates").join("launcher").is_dir());
        assert!(dir.path().join("updates").join("osqueryd").is_dir());
    }

    #[test]
    fn close_removes_staging() {
        let dir = tempdir().unwrap();
        let library = new_library(dir.path());
        let staging = library.staging_path().to_path_buf();
        assert!(staging.is_dir());

        library.close().unwrap();
        assert!(!staging.exists());
    }

    #[test]
    fn add_is_noop_for_running_version() {
        let dir = tempdir().unwrap();
        let library = new_library(dir.path());
        let meta = TargetMeta {
            length: 0,
            hashes: std::collections::BTreeMap::new(),
        };

        // The mirror would error if contacted; the running-version short
        // circuit must win first.
        library
            .add(Binary::Launcher, "1.2.3", "launcher-1.2.3.tar.gz", &meta)
            .unwrap();
    }

    #[test]
    fn sorted_versions_splits_unparseable_names() {
        let dir = tempdir().unwrap();
        let library = new_library(dir.path());
        let launcher_dir = library.updates_directory(Binary::Launcher);
        fs::create_dir_all(launcher_dir.join("not-a-version")).unwrap();

        let (valid, invalid) = library.sorted_versions(Binary::Launcher).unwrap();
        assert!(valid.is_empty());
        assert_eq!(invalid, vec!["not-a-version".to_owned()]);
    }

    #[test]
    fn newest_version_empty_library() {
        let dir = tempdir().unwrap();
        let library = new_library(dir.path());
        assert!(library.newest_version(Binary::Launcher).is_none());
        assert!(library.newest_executable(Binary::Launcher).is_none());
    }

    #[test]
    fn tidy_requires_running_version() {
        let dir = tempdir().unwrap();
        let library = new_library(dir.path());
        let launcher_dir = library.updates_directory(Binary::Launcher);
        fs::create_dir_all(launcher_dir.join("not-a-version")).unwrap();

        // Unknown running version: tidy must refuse to prune anything.
        library.tidy(Binary::Launcher, "");
        assert!(launcher_dir.join("not-a-version").is_dir());
    }

    #[test]
    fn tidy_purges_staging() {
        let dir = tempdir().unwrap();
        let library = new_library(dir.path());
        let leftover = library.staging_path().join("launcher-0.9.0.tar.gz");
        fs::write(&leftover, b"stale archive").unwrap();

        library.tidy(Binary::Launcher, "1.0.0");
        assert!(!leftover.exists());
    }
}
