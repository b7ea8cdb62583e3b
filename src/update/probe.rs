//! Executable liveness probing.
//!
//! An installed or staged binary counts as usable only if invoking it with
//! `--version` exits zero within a short deadline. The probe runs before a
//! candidate is renamed into the library, so any version directory a reader
//! observes was validated at install time.

use crate::error::{LauncherError, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Default time allowed for a probe invocation.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll cadence while waiting for the probed process to exit.
const PROBE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Check that the executable at `path` runs and exits successfully when
/// invoked with `arg` (normally `--version`).
///
/// The child's stdio is discarded. A child still running at the deadline is
/// killed and reported as invalid.
///
/// # Errors
///
/// Returns [`LauncherError::ExecutableInvalid`] when the file is missing,
/// not executable, fails to spawn, exits non-zero, or times out.
pub fn check_executable(path: &Path, arg: &str, timeout: Duration) -> Result<()> {
    check_executable_permissions(path)?;

    let mut child = Command::new(path)
        .arg(arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| {
            LauncherError::ExecutableInvalid(format!("cannot spawn {}: {e}", path.display()))
        })?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => return Ok(()),
            Ok(Some(status)) => {
                return Err(LauncherError::ExecutableInvalid(format!(
                    "{} exited with {status}",
                    path.display()
                )));
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(LauncherError::ExecutableInvalid(format!(
                        "{} did not exit within {timeout:?}",
                        path.display()
                    )));
                }
                std::thread::sleep(PROBE_POLL_INTERVAL);
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(LauncherError::ExecutableInvalid(format!(
                    "waiting on {}: {e}",
                    path.display()
                )));
            }
        }
    }
}

/// Pre-flight check that `path` plausibly denotes an executable regular
/// file, before anything is spawned.
#[cfg(unix)]
fn check_executable_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(|e| {
        LauncherError::ExecutableInvalid(format!("cannot stat {}: {e}", path.display()))
    })?;
    if !metadata.is_file() {
        return Err(LauncherError::ExecutableInvalid(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(LauncherError::ExecutableInvalid(format!(
            "{} has no executable bit set",
            path.display()
        )));
    }
    Ok(())
}

/// Windows has no executable bits; check the extension instead.
#[cfg(not(unix))]
fn check_executable_permissions(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        LauncherError::ExecutableInvalid(format!("cannot stat {}: {e}", path.display()))
    })?;
    if !metadata.is_file() {
        return Err(LauncherError::ExecutableInvalid(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    if path.extension().and_then(|e| e.to_str()) != Some("exe") {
        return Err(LauncherError::ExecutableInvalid(format!(
            "{} is not an .exe",
            path.display()
        )));
    }
    Ok(())
}
