//! Endpoint agent core that keeps the launcher and its osquery daemon
//! continuously up to date.
//!
//! The agent runs unattended on heterogeneous fleets; this crate is its
//! auto-update subsystem. A periodic controller discovers new releases from
//! a verified metadata store, streams candidate archives from a content
//! mirror through an integrity verifier, installs them into a versioned
//! on-disk library, and finally replaces the running process (launcher) or
//! restarts the managed daemon (osqueryd).
//!
//! # Architecture
//!
//! - [`update::metadata`]: verified release documents per binary and channel
//! - [`update::mirror`]: untrusted artifact downloads
//! - [`update::verify`]: bounded, hashed, buffer-then-write staging
//! - [`update::library`]: versioned install store with atomic promotion and
//!   pruning
//! - [`update::controller`]: the timer loop; [`update::finalize`]: the
//!   platform handoff
//!
//! Hosts wire the pieces together through the narrow capability traits
//! ([`Settings`], [`update::MetadataSource`], [`update::MirrorFetcher`],
//! [`update::QueryEngineHook`]) and block on
//! [`update::UpdateController::run`] until shutdown.

pub mod config;
pub mod error;
pub mod update;

pub use config::{AutoupdateConfig, Config, Settings, UpdateChannel};
pub use error::{LauncherError, Result};
pub use update::{Binary, RunExit, UpdateController, UpdateLibrary};
