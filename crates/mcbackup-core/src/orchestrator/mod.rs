pub mod countdown;
pub mod state;


use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, SystemTime};
use chrono::Local;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{info, warn};

use crate::archive::{Archive, ArchiveBuilder};
use crate::config::Config;
use crate::errors::{BackupError, ChannelError, Location, RemoteError};
use crate::local::{LocalStore, archive_path};
use crate::remote::{RemoteConnector, RemoteSession, RetryPolicy, RetryingSession};
use crate::retention::{ArchiveNaming, RetentionEntry, RetentionPolicy};
use crate::service::{ConsoleChannel, ConsoleConnector, ServiceController, ServiceProbe, ServiceStatus};

pub use state::{RunReport, RunState, Stage, StageFailure};

/// Everything the run talks to outside its own process.
pub struct Collaborators {
    pub probe: Box<dyn ServiceProbe>,
    pub console: Box<dyn ConsoleConnector>,
    pub controller: Box<dyn ServiceController>,
    pub remote: Box<dyn RemoteConnector>,
    pub archiver: Box<dyn ArchiveBuilder>,
    pub local: Box<dyn LocalStore>,
}

/// What the run believes about the service process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    Running,
    Stopped,
    Unknown,
}

struct Run {
    report: RunReport,
    service: ServiceState,
    start_attempted: bool,
}

impl Run {
    fn enter(&mut self, stage: Stage) {
        self.report.enter(stage);
    }

    fn fail(&mut self, stage: Stage, error: BackupError) {
        self.report.fail(stage, error);
    }
}

/// One backup cycle: announce, stop, archive, upload, prune, restart.
/// Construct one per run; nothing is shared between runs.
pub struct Orchestrator {
    config: Config,
    naming: ArchiveNaming,
    retention: RetentionPolicy,
    retry: RetryPolicy,
    deps: Collaborators,
}

impl Orchestrator {
    pub fn new(config: Config, deps: Collaborators) -> Self {
        let naming = ArchiveNaming::new(config.archive_prefix.clone());
        let retention = RetentionPolicy::new(config.retention_window(), naming.clone());
        Self {
            config,
            naming,
            retention,
            retry: RetryPolicy::default(),
            deps,
        }
    }

    /// Runs the whole cycle. Never returns early past the disconnect step once a
    /// session is open; failures are recorded in the report instead of propagated.
    pub async fn run(&self) -> RunReport {
        let started_at = Local::now();
        let mut run = Run {
            report: RunReport::new(self.naming.file_name(started_at), started_at),
            service: ServiceState::Unknown,
            start_attempted: false,
        };
        info!("backup run starting: archive={}", run.report.archive_name);

        run.enter(Stage::Connecting);
        let Some(mut session) = self.connect(&mut run).await else {
            return self.finish(run);
        };

        let outcome = AssertUnwindSafe(self.cycle(&mut run, session.as_mut()))
            .catch_unwind()
            .await;
        if let Err(panic) = outcome {
            let stage = run.report.stage();
            run.fail(stage, BackupError::Internal(panic_message(panic.as_ref())));
            if run.service != ServiceState::Running && !run.start_attempted {
                self.restart(&mut run).await;
            }
        }

        let host = self.deps.remote.describe();
        match session.disconnect().await {
            Ok(()) => info!("disconnected from {host}"),
            Err(err) => warn!("disconnect from {host} failed: {err}"),
        }

        self.finish(run)
    }

    fn finish(&self, mut run: Run) -> RunReport {
        let state = run.report.state();
        if state.is_done() {
            run.report.transitions.push(Stage::Done);
            info!("backup run finished: {state}");
        } else {
            warn!("backup run finished: {state}");
        }
        run.report
    }

    async fn connect(&self, run: &mut Run) -> Option<Box<dyn RemoteSession>> {
        let host = self.deps.remote.describe();
        info!("connecting to {host}");
        let raw = match self.deps.remote.connect().await {
            Ok(session) => session,
            Err(source) => {
                run.fail(Stage::Connecting, BackupError::Connection { host, source });
                return None;
            }
        };
        info!("connected to {host}");

        let mut session: Box<dyn RemoteSession> = Box::new(RetryingSession::new(raw, self.retry));
        if let Err(source) = session.change_dir(&self.config.remote_path).await {
            run.fail(Stage::Connecting, BackupError::Connection { host: host.clone(), source });
            if let Err(err) = session.disconnect().await {
                warn!("disconnect from {host} failed: {err}");
            }
            return None;
        }
        Some(session)
    }

    async fn cycle(&self, run: &mut Run, session: &mut dyn RemoteSession) {
        run.enter(Stage::Probing);
        let Some(status) = self.probe_online().await else {
            info!("service is offline; starting it without taking a backup");
            run.service = ServiceState::Stopped;
            self.restart(run).await;
            self.prune(run, session).await;
            return;
        };
        info!(
            "service online: version={} players={}/{}",
            status.version, status.current_player_count, status.max_player_count
        );
        run.service = ServiceState::Running;

        self.shutdown(run, &status).await;

        if run.service == ServiceState::Stopped {
            if let Some(archive) = self.archive(run).await {
                self.upload(run, session, &archive).await;
            }
        } else {
            warn!("service shutdown not confirmed; skipping archive");
        }

        self.prune(run, session).await;
        self.restart(run).await;
    }

    async fn probe_online(&self) -> Option<ServiceStatus> {
        match self.deps.probe.status().await {
            Ok(status) if status.online => Some(status),
            Ok(_) => None,
            Err(err) => {
                warn!("status probe failed, treating service as offline: {err}");
                None
            }
        }
    }

    async fn shutdown(&self, run: &mut Run, status: &ServiceStatus) {
        run.enter(Stage::Announcing);
        let mut channel = match self.deps.console.open().await {
            Ok(channel) => channel,
            Err(err) => {
                run.fail(Stage::Announcing, err.into());
                return;
            }
        };

        self.announce(run, channel.as_mut(), status).await;

        run.enter(Stage::Stopping);
        let stop = channel.send_command("stop").await;
        if matches!(stop, Ok(_) | Err(ChannelError::Closed)) {
            run.service = ServiceState::Unknown;
        }
        channel.close().await;
        match stop {
            Ok(reply) => info!("stop acknowledged: {}", reply.trim()),
            Err(ChannelError::Closed) => info!("console closed after stop; server is going down"),
            Err(err) => {
                run.fail(Stage::Stopping, err.into());
                return;
            }
        }

        self.await_shutdown(run).await;
    }

    async fn announce(&self, run: &mut Run, channel: &mut dyn ConsoleChannel, status: &ServiceStatus) {
        let (notices, stop_at) = countdown::schedule(status, &self.config.timings);
        let start = Instant::now();
        for notice in notices {
            sleep_until(start + notice.at).await;
            if let Err(err) = channel.send_command(&format!("say {}", notice.message)).await {
                run.report.broadcast_failures += 1;
                warn!("broadcast \"{}\" failed: {err}", notice.message);
            }
        }
        sleep_until(start + stop_at).await;
    }

    async fn await_shutdown(&self, run: &mut Run) {
        let timings = &self.config.timings;
        if self.wait_offline(timings.shutdown_timeout()).await {
            info!("service offline; waiting {:?} for it to finish writing", timings.settle());
            sleep(timings.settle()).await;
            run.service = ServiceState::Stopped;
            return;
        }

        run.fail(
            Stage::Stopping,
            BackupError::ShutdownTimeout {
                waited: timings.shutdown_timeout(),
            },
        );
        run.service = ServiceState::Unknown;
        warn!("asking the process supervisor to stop the service");
        match self.deps.controller.stop().await {
            Ok(()) => {
                if self.wait_offline(timings.shutdown_timeout()).await {
                    info!("service stopped after termination signal");
                }
            }
            Err(err) => run.fail(Stage::Stopping, err.into()),
        }
    }

    async fn wait_offline(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.probe_online().await.is_none() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(self.config.timings.poll_interval().min(deadline - now)).await;
        }
    }

    async fn archive(&self, run: &mut Run) -> Option<Archive> {
        run.enter(Stage::Archiving);
        let source_dir = self.config.server_dir.clone();
        let dest = archive_path(&self.config.local_path, &run.report.archive_name);
        info!("archiving {} to {}", source_dir.display(), dest.display());

        match self.deps.archiver.build(&source_dir, &dest).await {
            Ok(handle) => {
                let archive = Archive {
                    name: run.report.archive_name.clone(),
                    created_at: run.report.started_at,
                    source_dir,
                    local_path: handle.path,
                    remote_path: None,
                    size: handle.size,
                };
                run.report.archive = Some(archive.clone());
                Some(archive)
            }
            Err(source) => {
                run.fail(Stage::Archiving, BackupError::Archive { source_dir, source });
                None
            }
        }
    }

    async fn upload(&self, run: &mut Run, session: &mut dyn RemoteSession, archive: &Archive) {
        run.enter(Stage::Uploading);
        let host = self.deps.remote.describe();
        info!("uploading {} to {host}:{}", archive.name, self.config.remote_path);

        let result = match session.upload(&archive.local_path, &archive.name).await {
            Ok(()) => verify_upload(session, archive).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                let remote = format!("{}/{}", self.config.remote_path.trim_end_matches('/'), archive.name);
                info!("upload complete: {remote}");
                if let Some(stored) = run.report.archive.as_mut() {
                    stored.remote_path = Some(remote);
                }
            }
            Err(source) => {
                run.fail(
                    Stage::Uploading,
                    BackupError::Upload {
                        name: archive.name.clone(),
                        source,
                    },
                );
                info!("local archive kept at {}", archive.local_path.display());
            }
        }
    }

    async fn prune(&self, run: &mut Run, session: &mut dyn RemoteSession) {
        run.enter(Stage::Pruning);
        let cutoff = self.retention.cutoff(SystemTime::from(run.report.started_at));
        info!(
            "pruning archives older than {} days",
            self.retention.window().as_secs() / 86_400
        );
        self.prune_local(run, cutoff).await;
        self.prune_remote(run, session, cutoff).await;
    }

    async fn prune_local(&self, run: &mut Run, cutoff: SystemTime) {
        let dir = &self.config.local_path;
        let entries = match self.deps.local.list(dir).await {
            Ok(entries) => entries,
            Err(err) => {
                run.fail(
                    Stage::Pruning,
                    BackupError::Listing {
                        location: Location::Local,
                        reason: format!("{}: {err}", dir.display()),
                    },
                );
                return;
            }
        };

        for name in self.retention.expired(&entries, cutoff) {
            let path = archive_path(dir, &name);
            match self.deps.local.remove(&path).await {
                Ok(()) => {
                    info!("deleted local archive {}", path.display());
                    run.report.deleted_local.push(name);
                }
                Err(err) => run.fail(
                    Stage::Pruning,
                    BackupError::Deletion {
                        location: Location::Local,
                        name,
                        reason: err.to_string(),
                    },
                ),
            }
        }
    }

    async fn prune_remote(&self, run: &mut Run, session: &mut dyn RemoteSession, cutoff: SystemTime) {
        let entries: Vec<RetentionEntry> = match session.list().await {
            Ok(entries) => entries.into_iter().map(RetentionEntry::from).collect(),
            Err(err) => {
                run.fail(
                    Stage::Pruning,
                    BackupError::Listing {
                        location: Location::Remote,
                        reason: format!("{}: {err}", self.config.remote_path),
                    },
                );
                return;
            }
        };

        for name in self.retention.expired(&entries, cutoff) {
            match session.remove(&name).await {
                Ok(()) => {
                    info!("deleted remote archive {}/{name}", self.config.remote_path.trim_end_matches('/'));
                    run.report.deleted_remote.push(name);
                }
                Err(err) => run.fail(
                    Stage::Pruning,
                    BackupError::Deletion {
                        location: Location::Remote,
                        name,
                        reason: err.to_string(),
                    },
                ),
            }
        }
    }

    async fn restart(&self, run: &mut Run) {
        run.enter(Stage::Restarting);
        let should_start = match run.service {
            ServiceState::Stopped => true,
            ServiceState::Running => {
                info!("service is still running; not starting another instance");
                false
            }
            ServiceState::Unknown => match self.probe_online().await {
                Some(_) => {
                    info!("service answers its status probe; not starting another instance");
                    false
                }
                None => true,
            },
        };
        if !should_start {
            return;
        }

        run.start_attempted = true;
        match self.deps.controller.start().await {
            Ok(()) => {
                info!("service start issued");
                run.service = ServiceState::Running;
            }
            Err(err) => run.fail(Stage::Restarting, err.into()),
        }
    }
}

async fn verify_upload(session: &mut dyn RemoteSession, archive: &Archive) -> Result<(), RemoteError> {
    let entry = session.stat(&archive.name).await?;
    if entry.size != archive.size {
        return Err(RemoteError::transport(
            "verify",
            format!("remote size {} differs from local size {}", entry.size, archive.size),
        ));
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "stage panicked".to_string()
    }
}
