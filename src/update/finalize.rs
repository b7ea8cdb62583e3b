//! Launcher finalization: adopting a newly installed version in place.
//!
//! Two platform behaviors, side by side:
//!
//! - **Unix**: the process image is replaced via `exec`. The newest valid
//!   installed launcher takes over with the original argument vector and
//!   environment; on success nothing after the call runs.
//! - **Windows**: there is no exec-replace. Finalization resolves to
//!   [`RunExit::RestartRequired`] carrying
//!   [`SUPERVISOR_RESTART_EXIT_CODE`]; the host exits with that code and
//!   the service wrapper restarts it, at which point normal launch-path
//!   resolution picks up the newest installed version.

use crate::error::{LauncherError, Result};
use crate::update::controller::RunExit;
use crate::update::library::UpdateLibrary;
use crate::update::Binary;
use tracing::info;

/// Exit code that tells the service wrapper to restart the agent so a newly
/// installed version can take over. Chosen to stay clear of codes the OS
/// and common supervisors already assign meaning to.
pub const SUPERVISOR_RESTART_EXIT_CODE: i32 = 75;

/// Narrow hook for asking the query engine to exit cleanly.
///
/// The runner that owns the osqueryd subprocess re-spawns it after
/// shutdown, resolving the newest installed version as it does at startup.
pub trait QueryEngineHook: Send + Sync {
    /// Request a clean shutdown of the query engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown request could not be delivered.
    fn request_shutdown(&self) -> Result<()>;
}

/// Replace the running launcher with the newest valid installed version.
///
/// The query engine is asked to shut down first; a failure there is logged
/// and does not block the handoff. On Unix this only returns on error.
///
/// # Errors
///
/// Returns [`LauncherError::Finalize`] when no valid launcher version is
/// installed or the exec itself fails. This is the one fatal path of the
/// update cycle.
pub(crate) fn finalize_launcher(
    library: &UpdateLibrary,
    query_engine: &dyn QueryEngineHook,
) -> Result<RunExit> {
    if let Err(e) = query_engine.request_shutdown() {
        info!(error = %e, "osquery shutdown before launcher handoff failed");
    }

    let executable = library.newest_executable(Binary::Launcher).ok_or_else(|| {
        LauncherError::Finalize("no valid launcher version installed in library".to_owned())
    })?;

    exec_replace(&executable)
}

#[cfg(unix)]
fn exec_replace(executable: &std::path::Path) -> Result<RunExit> {
    use std::os::unix::process::CommandExt;

    info!(path = %executable.display(), "exec updated launcher");

    // Forward everything after argv0; the environment is inherited. On
    // success this call does not return.
    let err = std::process::Command::new(executable)
        .args(std::env::args_os().skip(1))
        .exec();

    Err(LauncherError::Finalize(format!(
        "exec updated launcher {}: {err}",
        executable.display()
    )))
}

#[cfg(not(unix))]
fn exec_replace(executable: &std::path::Path) -> Result<RunExit> {
    info!(
        path = %executable.display(),
        exit_code = SUPERVISOR_RESTART_EXIT_CODE,
        "restart required to adopt updated launcher"
    );
    Ok(RunExit::RestartRequired {
        exit_code: SUPERVISOR_RESTART_EXIT_CODE,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::update::mirror::MirrorFetcher;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct EmptyMirror;

    impl MirrorFetcher for EmptyMirror {
        fn fetch(&self, _binary: Binary, target: &str) -> Result<Box<dyn Read + Send>> {
            Err(LauncherError::Network(format!("no such target {target}")))
        }
    }

    struct RecordingHook {
        calls: Arc<AtomicUsize>,
    }

    impl QueryEngineHook for RecordingHook {
        fn request_shutdown(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn empty_library_is_finalize_error_after_shutdown_request() {
        let dir = tempdir().unwrap();
        let library = UpdateLibrary::new(dir.path(), Box::new(EmptyMirror)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let hook = RecordingHook {
            calls: Arc::clone(&calls),
        };

        let err = finalize_launcher(&library, &hook).unwrap_err();

        assert!(matches!(err, LauncherError::Finalize(_)));
        // The shutdown request goes out before version resolution.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_hook_does_not_block_resolution() {
        struct FailingHook;
        impl QueryEngineHook for FailingHook {
            fn request_shutdown(&self) -> Result<()> {
                Err(LauncherError::Other("engine not running".to_owned()))
            }
        }

        let dir = tempdir().unwrap();
        let library = UpdateLibrary::new(dir.path(), Box::new(EmptyMirror)).unwrap();

        // Still fails on the empty library, not on the hook.
        let err = finalize_launcher(&library, &FailingHook).unwrap_err();
        assert!(err.to_string().contains("no valid launcher version"));
    }
}
