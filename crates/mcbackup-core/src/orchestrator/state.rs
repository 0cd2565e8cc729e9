use chrono::{DateTime, Local};
use std::fmt;
use tracing::{error, info};

use crate::archive::Archive;
use crate::errors::BackupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Idle,
    Connecting,
    Probing,
    Announcing,
    Stopping,
    Archiving,
    Uploading,
    Pruning,
    Restarting,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Connecting => "connecting",
            Stage::Probing => "probing",
            Stage::Announcing => "announcing",
            Stage::Stopping => "stopping",
            Stage::Archiving => "archiving",
            Stage::Uploading => "uploading",
            Stage::Pruning => "pruning",
            Stage::Restarting => "restarting",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Terminal outcome of a run. `Failed` names the first stage that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Done,
    Failed { stage: Stage, cause: String },
}

impl RunState {
    pub fn is_done(&self) -> bool {
        matches!(self, RunState::Done)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Done => f.write_str("done"),
            RunState::Failed { stage, cause } => write!(f, "failed during {stage}: {cause}"),
        }
    }
}

#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: BackupError,
}

#[derive(Debug)]
pub struct RunReport {
    pub archive_name: String,
    pub started_at: DateTime<Local>,
    pub transitions: Vec<Stage>,
    pub failures: Vec<StageFailure>,
    pub archive: Option<Archive>,
    pub broadcast_failures: usize,
    pub deleted_local: Vec<String>,
    pub deleted_remote: Vec<String>,
}

impl RunReport {
    pub(crate) fn new(archive_name: String, started_at: DateTime<Local>) -> Self {
        Self {
            archive_name,
            started_at,
            transitions: vec![Stage::Idle],
            failures: Vec::new(),
            archive: None,
            broadcast_failures: 0,
            deleted_local: Vec::new(),
            deleted_remote: Vec::new(),
        }
    }

    /// The stage the run is in, or ended in.
    pub fn stage(&self) -> Stage {
        self.transitions.last().copied().unwrap_or(Stage::Idle)
    }

    pub fn state(&self) -> RunState {
        match self.failures.first() {
            None => RunState::Done,
            Some(failure) => RunState::Failed {
                stage: failure.stage,
                cause: failure.error.to_string(),
            },
        }
    }

    pub fn failed_in(&self, stage: Stage) -> bool {
        self.failures.iter().any(|f| f.stage == stage)
    }

    pub(crate) fn enter(&mut self, stage: Stage) {
        info!("entering {stage}");
        self.transitions.push(stage);
    }

    pub(crate) fn fail(&mut self, stage: Stage, error: BackupError) {
        error!("{stage} failed: {error}");
        self.failures.push(StageFailure { stage, error });
    }
}
