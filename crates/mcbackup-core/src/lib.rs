pub mod archive;
pub mod config;
pub mod errors;
pub mod local;
pub mod orchestrator;
pub mod remote;
pub mod retention;
pub mod service;

pub use archive::{Archive, ArchiveBuilder, ArchiveHandle, TarGzArchiver};
pub use config::{Config, Timings};
pub use errors::{BackupError, ConfigError};
pub use orchestrator::{Collaborators, Orchestrator, RunReport, RunState, Stage};

pub fn pkg_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
