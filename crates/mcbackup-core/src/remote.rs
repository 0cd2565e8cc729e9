use async_trait::async_trait;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::warn;

use crate::errors::RemoteError;
use crate::retention::RetentionEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub modified: SystemTime,
    pub size: u64,
}

impl From<RemoteEntry> for RetentionEntry {
    fn from(entry: RemoteEntry) -> Self {
        RetentionEntry::new(entry.name, entry.modified)
    }
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, RemoteError>;

    /// `host:port`, for log lines and error context.
    fn describe(&self) -> String;
}

/// An authenticated session against the storage host. Names are relative to the
/// current directory set by `change_dir`.
#[async_trait]
pub trait RemoteSession: Send {
    async fn change_dir(&mut self, path: &str) -> Result<(), RemoteError>;

    async fn upload(&mut self, local: &Path, name: &str) -> Result<(), RemoteError>;

    /// Regular files in the current directory.
    async fn list(&mut self) -> Result<Vec<RemoteEntry>, RemoteError>;

    async fn stat(&mut self, name: &str) -> Result<RemoteEntry, RemoteError>;

    async fn remove(&mut self, name: &str) -> Result<(), RemoteError>;

    /// Consumes the session; it cannot be released twice.
    async fn disconnect(self: Box<Self>) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(3),
        }
    }
}

/// Retries transport failures of the data operations of the wrapped session.
pub struct RetryingSession {
    inner: Box<dyn RemoteSession>,
    policy: RetryPolicy,
}

impl RetryingSession {
    pub fn new(inner: Box<dyn RemoteSession>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    fn next_backoff(policy: RetryPolicy, backoff: Duration) -> Duration {
        (backoff * 2).min(policy.max_backoff)
    }

    async fn pause(
        policy: RetryPolicy,
        operation: &str,
        attempt: usize,
        err: &RemoteError,
        backoff: Duration,
    ) {
        warn!(
            "remote {operation} failed (attempt {}/{}): {err}; retrying",
            attempt + 1,
            policy.max_retries + 1
        );
        if !backoff.is_zero() {
            sleep(with_jitter(backoff)).await;
        }
    }
}

// One loop per operation: the inner session is borrowed mutably across each attempt,
// so nothing else of `self` may be held across an await.
macro_rules! with_retries {
    ($self:ident, $operation:expr, $call:expr) => {{
        let policy = $self.policy;
        let mut backoff = policy.initial_backoff;
        let mut attempt = 0;
        loop {
            match $call.await {
                Ok(value) => break Ok(value),
                Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                    RetryingSession::pause(policy, $operation, attempt, &err, backoff).await;
                    backoff = RetryingSession::next_backoff(policy, backoff);
                    attempt += 1;
                }
                Err(err) => break Err(err),
            }
        }
    }};
}

#[async_trait]
impl RemoteSession for RetryingSession {
    async fn change_dir(&mut self, path: &str) -> Result<(), RemoteError> {
        self.inner.change_dir(path).await
    }

    async fn upload(&mut self, local: &Path, name: &str) -> Result<(), RemoteError> {
        with_retries!(self, "upload", self.inner.upload(local, name))
    }

    async fn list(&mut self) -> Result<Vec<RemoteEntry>, RemoteError> {
        with_retries!(self, "list", self.inner.list())
    }

    async fn stat(&mut self, name: &str) -> Result<RemoteEntry, RemoteError> {
        with_retries!(self, "stat", self.inner.stat(name))
    }

    async fn remove(&mut self, name: &str) -> Result<(), RemoteError> {
        with_retries!(self, "remove", self.inner.remove(name))
    }

    async fn disconnect(self: Box<Self>) -> Result<(), RemoteError> {
        self.inner.disconnect().await
    }
}

fn with_jitter(base: Duration) -> Duration {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    base + Duration::from_millis(nanos % 180)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Script {
        upload: VecDeque<Result<(), RemoteError>>,
        calls: usize,
        disconnects: usize,
    }

    struct ScriptedSession(Arc<Mutex<Script>>);

    #[async_trait]
    impl RemoteSession for ScriptedSession {
        async fn change_dir(&mut self, _path: &str) -> Result<(), RemoteError> {
            Err(RemoteError::transport("chdir", "flaky"))
        }

        async fn upload(&mut self, _local: &Path, _name: &str) -> Result<(), RemoteError> {
            let mut script = self.0.lock().unwrap();
            script.calls += 1;
            script.upload.pop_front().unwrap_or(Ok(()))
        }

        async fn list(&mut self) -> Result<Vec<RemoteEntry>, RemoteError> {
            Ok(Vec::new())
        }

        async fn stat(&mut self, name: &str) -> Result<RemoteEntry, RemoteError> {
            Err(RemoteError::NotFound(name.to_string()))
        }

        async fn remove(&mut self, _name: &str) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn disconnect(self: Box<Self>) -> Result<(), RemoteError> {
            self.0.lock().unwrap().disconnects += 1;
            Ok(())
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn session(script: Script) -> (Arc<Mutex<Script>>, RetryingSession) {
        let shared = Arc::new(Mutex::new(script));
        let session = RetryingSession::new(Box::new(ScriptedSession(shared.clone())), fast());
        (shared, session)
    }

    #[tokio::test]
    async fn transient_upload_failures_are_retried() {
        let (shared, mut session) = session(Script {
            upload: VecDeque::from([
                Err(RemoteError::transport("upload", "reset")),
                Err(RemoteError::transport("upload", "reset")),
                Ok(()),
            ]),
            ..Default::default()
        });

        session
            .upload(Path::new("/tmp/a.tar.gz"), "a.tar.gz")
            .await
            .expect("third attempt succeeds");
        assert_eq!(shared.lock().unwrap().calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn backed_off_retries_run_on_a_spawned_task() {
        let shared = Arc::new(Mutex::new(Script {
            upload: VecDeque::from([Err(RemoteError::transport("upload", "reset")), Ok(())]),
            ..Default::default()
        }));
        let mut session = RetryingSession::new(
            Box::new(ScriptedSession(shared.clone())),
            RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_secs(1),
            },
        );

        let task = tokio::spawn(async move {
            session.upload(Path::new("/tmp/a.tar.gz"), "a.tar.gz").await
        });
        task.await.expect("join").expect("second attempt succeeds");
        assert_eq!(shared.lock().unwrap().calls, 2);
    }

    #[tokio::test]
    async fn retries_stop_at_the_limit() {
        let (shared, mut session) = session(Script {
            upload: (0..10).map(|_| Err(RemoteError::transport("upload", "down"))).collect(),
            ..Default::default()
        });

        let err = session
            .upload(Path::new("/tmp/a.tar.gz"), "a.tar.gz")
            .await
            .expect_err("all attempts fail");
        assert!(err.is_retryable());
        assert_eq!(shared.lock().unwrap().calls, 4);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let (shared, mut session) = session(Script {
            upload: VecDeque::from([Err(RemoteError::PermissionDenied("a.tar.gz".into()))]),
            ..Default::default()
        });

        let err = session
            .upload(Path::new("/tmp/a.tar.gz"), "a.tar.gz")
            .await
            .expect_err("permission denied");
        assert!(matches!(err, RemoteError::PermissionDenied(_)));
        assert_eq!(shared.lock().unwrap().calls, 1);
    }

    #[tokio::test]
    async fn change_dir_and_disconnect_pass_straight_through() {
        let (shared, mut session) = session(Script::default());
        assert!(session.change_dir("/backups").await.is_err());
        Box::new(session).disconnect().await.expect("disconnect");
        assert_eq!(shared.lock().unwrap().disconnects, 1);
    }
}
