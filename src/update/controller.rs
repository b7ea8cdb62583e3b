//! The periodic update driver.
//!
//! One controller task per process. Each tick asks the metadata source for
//! the channel's current target per binary, lets the library install it if
//! it is new, and hands off to finalization when a new launcher version
//! lands. Update failures never escape the loop; they are logged and the
//! next tick retries. The sole fatal path out of [`UpdateController::run`]
//! is a failed exec-replace.

use crate::config::Settings;
use crate::error::{LauncherError, Result};
use crate::update::finalize::{self, QueryEngineHook};
use crate::update::library::UpdateLibrary;
use crate::update::metadata::MetadataSource;
use crate::update::{version_from_target, Binary};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Ticks between library tidy passes. With the default hourly interval this
/// prunes roughly once a day; the pass also runs on the first tick so a
/// restart converges immediately.
const TICKS_PER_TIDY: u64 = 24;

/// Why [`UpdateController::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The cancellation token fired.
    Cancelled,
    /// A new launcher version was installed on a platform without
    /// exec-replace. The host must exit with this code so the service
    /// wrapper restarts into the new version.
    RestartRequired {
        /// Code to pass to `std::process::exit`.
        exit_code: i32,
    },
}

/// Drives metadata refresh, library population, pruning, and finalization
/// on a timer.
pub struct UpdateController {
    settings: Arc<dyn Settings>,
    metadata: Arc<dyn MetadataSource>,
    library: Arc<UpdateLibrary>,
    query_engine: Arc<dyn QueryEngineHook>,
    running_versions: HashMap<Binary, String>,
    ticks: u64,
}

impl UpdateController {
    /// Create a controller.
    ///
    /// `running_versions` holds the version currently executing for each
    /// binary: the agent's own build version for the launcher, and the
    /// version the runner reports for osqueryd. Missing entries disable the
    /// running-version no-op check and pruning for that binary.
    pub fn new(
        settings: Arc<dyn Settings>,
        metadata: Arc<dyn MetadataSource>,
        library: Arc<UpdateLibrary>,
        query_engine: Arc<dyn QueryEngineHook>,
        running_versions: HashMap<Binary, String>,
    ) -> Self {
        Self {
            settings,
            metadata,
            library,
            query_engine,
            running_versions,
            ticks: 0,
        }
    }

    /// Run the update cycle until cancelled.
    ///
    /// Waits the configured initial delay, then checks on the configured
    /// interval. A tick that overruns the interval does not queue; the next
    /// tick fires one interval after completion. On Unix a successful
    /// launcher finalization exec-replaces the process, so this call does
    /// not return on that path.
    ///
    /// # Errors
    ///
    /// Returns an error only when finalization's exec-replace fails.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<RunExit> {
        info!(
            channel = %self.settings.update_channel(),
            mirror = self.settings.mirror_url(),
            tuf = self.settings.tuf_server_url(),
            interval_secs = self.settings.autoupdate_interval().as_secs(),
            "autoupdater starting"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Ok(RunExit::Cancelled),
            _ = tokio::time::sleep(self.settings.autoupdate_initial_delay()) => {}
        }

        loop {
            if self.ticks % TICKS_PER_TIDY == 0 {
                self.tidy_all().await;
            }
            self.ticks += 1;

            for binary in Binary::ALL {
                match self.check_binary(binary).await {
                    Ok(None) => {}
                    Ok(Some(installed_version)) => {
                        if let Some(exit) = self.finalize_binary(binary, &installed_version)? {
                            return Ok(exit);
                        }
                    }
                    Err(e) => log_update_error(binary, &e),
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("autoupdater stopped");
                    return Ok(RunExit::Cancelled);
                }
                _ = tokio::time::sleep(self.settings.autoupdate_interval()) => {}
            }
        }
    }

    /// Highest valid installed version for the binary. Filesystem only.
    pub fn current_library_version(&self, binary: Binary) -> Option<semver::Version> {
        self.library.newest_version(binary)
    }

    /// Fetch the channel target for one binary and install it if new.
    /// Returns the installed version when it differs from the running one.
    async fn check_binary(&self, binary: Binary) -> Result<Option<String>> {
        let metadata = Arc::clone(&self.metadata);
        let library = Arc::clone(&self.library);
        let channel = self.settings.update_channel();
        let allow_rollback = self.settings.allow_rollback();
        let running = self.running_version(binary);

        tokio::task::spawn_blocking(move || {
            let (target, meta) = metadata.target_for(binary, channel)?;
            let target_version = version_from_target(binary, &target);

            if target_version == running {
                return Ok(None);
            }

            if !allow_rollback && is_rollback(&running, &target_version) {
                info!(
                    %binary,
                    running = %running,
                    target = %target_version,
                    "channel advertises older version, rollback disabled"
                );
                return Ok(None);
            }

            library.add(binary, &running, &target, &meta)?;
            info!(%binary, version = %target_version, "update available in library");
            Ok(Some(target_version))
        })
        .await
        .map_err(|e| LauncherError::Other(format!("update check task failed: {e}")))?
    }

    /// Hand a freshly installed version off to the platform finalizer.
    fn finalize_binary(
        &mut self,
        binary: Binary,
        installed_version: &str,
    ) -> Result<Option<RunExit>> {
        match binary {
            Binary::Launcher => {
                // Unix: only returns on error. Windows: restart contract.
                let exit =
                    finalize::finalize_launcher(&self.library, self.query_engine.as_ref())?;
                Ok(Some(exit))
            }
            Binary::Osqueryd => {
                match self.query_engine.request_shutdown() {
                    Ok(()) => {
                        // The runner re-spawns osqueryd from the newest
                        // installed version; track that as running so the
                        // next tick does not request another restart.
                        self.running_versions
                            .insert(binary, installed_version.to_owned());
                        info!(
                            version = installed_version,
                            "requested osqueryd restart into new version"
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "could not request osqueryd shutdown after update");
                    }
                }
                Ok(None)
            }
        }
    }

    async fn tidy_all(&self) {
        for binary in Binary::ALL {
            let library = Arc::clone(&self.library);
            let running = self.running_version(binary);
            let tidied =
                tokio::task::spawn_blocking(move || library.tidy(binary, &running)).await;
            if let Err(e) = tidied {
                debug!(%binary, error = %e, "tidy task failed");
            }
        }
    }

    fn running_version(&self, binary: Binary) -> String {
        self.running_versions.get(&binary).cloned().unwrap_or_default()
    }
}

/// True when both versions parse and the target is strictly older than the
/// running version. Unparseable running versions never block an install.
fn is_rollback(running: &str, target: &str) -> bool {
    match (semver::Version::parse(running), semver::Version::parse(target)) {
        (Ok(running), Ok(target)) => target < running,
        _ => false,
    }
}

/// Per-kind log levels for failed update attempts. None of these abort the
/// controller; the next tick retries.
fn log_update_error(binary: Binary, error: &LauncherError) {
    match error {
        LauncherError::LengthMismatch { .. } | LauncherError::DigestMismatch { .. } => {
            warn!(%binary, %error, "update verification failed");
        }
        LauncherError::Io(_) => {
            error!(%binary, %error, "filesystem failure during update");
        }
        LauncherError::Metadata(_) => {
            info!(%binary, %error, "release metadata unavailable, skipping");
        }
        _ => {
            info!(%binary, %error, "update attempt failed");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn rollback_detection() {
        assert!(is_rollback("1.2.0", "1.1.9"));
        assert!(is_rollback("2.0.0", "2.0.0-rc.1"));
        assert!(!is_rollback("1.2.0", "1.2.1"));
        assert!(!is_rollback("1.2.0", "1.2.0"));
    }

    #[test]
    fn unparseable_versions_never_roll_back() {
        assert!(!is_rollback("", "1.0.0"));
        assert!(!is_rollback("unknown", "1.0.0"));
        assert!(!is_rollback("1.0.0", "not-a-version"));
    }

    #[test]
    fn run_exit_restart_carries_code() {
        let exit = RunExit::RestartRequired { exit_code: 75 };
        assert_ne!(exit, RunExit::Cancelled);
        match exit {
            RunExit::RestartRequired { exit_code } => assert_eq!(exit_code, 75),
            RunExit::Cancelled => unreachable!(),
        }
    }
}
