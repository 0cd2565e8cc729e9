use async_trait::async_trait;
use mcbackup_core::errors::ControlError;
use mcbackup_core::service::ServiceController;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

pub const PID_FILE: &str = "mcbackup.pid";

/// Starts the server detached in its own process group and stops it by signal.
pub struct ProcessController {
    server_dir: PathBuf,
    command: Vec<String>,
    pid_file: PathBuf,
}

impl ProcessController {
    pub fn new(server_dir: PathBuf, command: Vec<String>) -> Self {
        let pid_file = server_dir.join(PID_FILE);
        Self {
            server_dir,
            command,
            pid_file,
        }
    }

    async fn recorded_pid(&self) -> Result<i32, ControlError> {
        let content = match fs::read_to_string(&self.pid_file).await {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ControlError::NoPid(self.pid_file.clone()));
            }
            Err(source) => {
                return Err(ControlError::Io {
                    context: "reading pid file",
                    source,
                });
            }
        };
        content
            .trim()
            .parse::<i32>()
            .ok()
            .filter(|pid| *pid > 0)
            .ok_or_else(|| ControlError::NoPid(self.pid_file.clone()))
    }
}

#[async_trait]
impl ServiceController for ProcessController {
    async fn start(&self) -> Result<(), ControlError> {
        let mut argv = self.command.iter();
        let program = argv.next().ok_or(ControlError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(argv)
            .current_dir(&self.server_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);

        let child = cmd.spawn().map_err(|source| ControlError::Spawn {
            program: program.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(ControlError::Io {
                context: "reading child pid",
                source: io::Error::other("child exited before its pid could be read"),
            });
        };

        fs::write(&self.pid_file, pid.to_string())
            .await
            .map_err(|source| ControlError::Io {
                context: "writing pid file",
                source,
            })?;
        info!(
            "started `{}` in {} (pid {pid})",
            self.command.join(" "),
            self.server_dir.display()
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), ControlError> {
        let pid = self.recorded_pid().await?;
        match terminate(pid) {
            Ok(()) => info!("sent SIGTERM to process group {pid}"),
            Err(err) if err.raw_os_error() == Some(libc::ESRCH) => {
                warn!("process {pid} already gone");
            }
            Err(source) => {
                return Err(ControlError::Io {
                    context: "signalling server process",
                    source,
                });
            }
        }

        if let Err(err) = fs::remove_file(&self.pid_file).await {
            warn!("failed to remove {}: {err}", self.pid_file.display());
        }
        Ok(())
    }
}

/// Signals the whole group so wrapper scripts and the JVM they launch both see it.
fn terminate(pid: i32) -> io::Result<()> {
    if unsafe { libc::kill(-pid, libc::SIGTERM) } == 0 {
        return Ok(());
    }
    let group_err = io::Error::last_os_error();
    if group_err.raw_os_error() != Some(libc::ESRCH) {
        return Err(group_err);
    }
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        return Ok(());
    }
    Err(io::Error::last_os_error())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("mcbackup-controller-{prefix}-{nanos}"))
    }

    fn alive(pid: i32) -> bool {
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let controller = ProcessController::new(unique_temp_dir("empty"), Vec::new());
        let err = controller.start().await.expect_err("empty command");
        assert!(matches!(err, ControlError::EmptyCommand));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = unique_temp_dir("missing");
        std::fs::create_dir_all(&dir).expect("create dir");
        let controller = ProcessController::new(dir.clone(), vec!["./does-not-exist".into()]);

        let err = controller.start().await.expect_err("no such program");
        assert!(matches!(err, ControlError::Spawn { .. }));
        assert!(!dir.join(PID_FILE).exists());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn stop_without_pid_file_reports_no_pid() {
        let controller = ProcessController::new(unique_temp_dir("nopid"), vec!["true".into()]);
        let err = controller.stop().await.expect_err("nothing started");
        assert!(matches!(err, ControlError::NoPid(_)));
    }

    #[tokio::test]
    async fn start_records_pid_and_stop_terminates() {
        let dir = unique_temp_dir("lifecycle");
        std::fs::create_dir_all(&dir).expect("create dir");
        let controller = ProcessController::new(
            dir.clone(),
            vec!["/bin/sh".into(), "-c".into(), "sleep 30".into()],
        );

        controller.start().await.expect("start");
        let pid: i32 = std::fs::read_to_string(dir.join(PID_FILE))
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid");
        assert!(alive(pid));

        controller.stop().await.expect("stop");
        assert!(!dir.join(PID_FILE).exists());

        let mut gone = false;
        for _ in 0..50 {
            // The child is never waited on here; a zombie still answers kill(0).
            let mut status = 0;
            unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if !alive(pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "process {pid} survived SIGTERM");

        let _ = std::fs::remove_dir_all(dir);
    }
}
