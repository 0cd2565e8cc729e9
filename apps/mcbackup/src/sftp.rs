use async_trait::async_trait;
use mcbackup_core::errors::RemoteError;
use mcbackup_core::remote::{RemoteConnector, RemoteEntry, RemoteSession};
use ssh2::{CheckResult, ErrorCode, FileStat, KnownHostFileKind, RenameFlags, Session, Sftp};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};
use tokio::task::spawn_blocking;
use tracing::{debug, warn};

const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;
const COPY_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct SftpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub private_key: PathBuf,
    pub passphrase: Option<String>,
    pub known_hosts: Option<PathBuf>,
    pub timeout: Duration,
}

pub struct SftpConnector {
    settings: SftpSettings,
}

impl SftpConnector {
    pub fn new(settings: SftpSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl RemoteConnector for SftpConnector {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let settings = self.settings.clone();
        let inner = spawn_blocking(move || open(&settings))
            .await
            .map_err(|err| RemoteError::transport("connect", err))??;
        Ok(Box::new(SftpSession {
            inner: Arc::new(Mutex::new(inner)),
        }))
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.settings.host, self.settings.port)
    }
}

struct Inner {
    session: Session,
    sftp: Sftp,
    cwd: PathBuf,
}

fn open(settings: &SftpSettings) -> Result<Inner, RemoteError> {
    let address = format!("{}:{}", settings.host, settings.port);
    let connect_err = |reason: String| RemoteError::Connect {
        address: address.clone(),
        reason,
    };

    let socket = (settings.host.as_str(), settings.port)
        .to_socket_addrs()
        .map_err(|err| connect_err(err.to_string()))?
        .next()
        .ok_or_else(|| connect_err("host did not resolve".to_string()))?;
    let tcp = TcpStream::connect_timeout(&socket, settings.timeout)
        .map_err(|err| connect_err(err.to_string()))?;

    let mut session = Session::new().map_err(|err| connect_err(err.to_string()))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(settings.timeout.as_millis().min(u128::from(u32::MAX)) as u32);
    session
        .handshake()
        .map_err(|err| connect_err(format!("ssh handshake: {err}")))?;

    match &settings.known_hosts {
        Some(path) => verify_host_key(&session, &settings.host, settings.port, path)?,
        None => warn!("no known_hosts_path configured; host key of {address} not verified"),
    }

    session
        .userauth_pubkey_file(
            &settings.username,
            None,
            &settings.private_key,
            settings.passphrase.as_deref(),
        )
        .map_err(|err| RemoteError::Auth(format!("{}: {err}", settings.username)))?;
    if !session.authenticated() {
        return Err(RemoteError::Auth(settings.username.clone()));
    }

    let sftp = session
        .sftp()
        .map_err(|err| RemoteError::transport("open sftp channel", err))?;
    debug!("sftp session open to {address}");
    Ok(Inner {
        session,
        sftp,
        cwd: PathBuf::from("."),
    })
}

fn verify_host_key(session: &Session, host: &str, port: u16, path: &Path) -> Result<(), RemoteError> {
    let mut known = session
        .known_hosts()
        .map_err(|err| RemoteError::HostKey(err.to_string()))?;
    known
        .read_file(path, KnownHostFileKind::OpenSSH)
        .map_err(|err| RemoteError::HostKey(format!("{}: {err}", path.display())))?;
    let (key, _) = session
        .host_key()
        .ok_or_else(|| RemoteError::HostKey("server sent no host key".to_string()))?;
    match known.check_port(host, port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => Err(RemoteError::HostKey(format!(
            "{host} not present in {}",
            path.display()
        ))),
        CheckResult::Mismatch => Err(RemoteError::HostKey(format!("{host} key does not match"))),
        CheckResult::Failure => Err(RemoteError::HostKey(format!("{host} key check failed"))),
    }
}

pub struct SftpSession {
    inner: Arc<Mutex<Inner>>,
}

impl SftpSession {
    async fn blocking<T, F>(&self, operation: &'static str, op: F) -> Result<T, RemoteError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Inner) -> Result<T, RemoteError> + Send + 'static,
    {
        let inner = self.inner.clone();
        spawn_blocking(move || {
            let mut guard = inner
                .lock()
                .map_err(|_| RemoteError::transport(operation, "sftp session lock poisoned"))?;
            op(&mut guard)
        })
        .await
        .map_err(|err| RemoteError::transport(operation, err))?
    }
}

#[async_trait]
impl RemoteSession for SftpSession {
    async fn change_dir(&mut self, path: &str) -> Result<(), RemoteError> {
        let target = PathBuf::from(path);
        self.blocking("chdir", move |inner| {
            let stat = inner
                .sftp
                .stat(&target)
                .map_err(|err| sftp_error("chdir", &target, err))?;
            if !stat.is_dir() {
                return Err(RemoteError::NotFound(format!(
                    "{} is not a directory",
                    target.display()
                )));
            }
            inner.cwd = target;
            Ok(())
        })
        .await
    }

    async fn upload(&mut self, local: &Path, name: &str) -> Result<(), RemoteError> {
        let local = local.to_path_buf();
        let name = name.to_string();
        self.blocking("upload", move |inner| {
            let target = inner.cwd.join(&name);
            let partial = inner.cwd.join(format!("{name}.partial"));
            let result = upload_to(inner, &local, &partial, &target);
            if result.is_err() {
                let _ = inner.sftp.unlink(&partial);
            }
            result
        })
        .await
    }

    async fn list(&mut self) -> Result<Vec<RemoteEntry>, RemoteError> {
        self.blocking("list", |inner| {
            let entries = inner
                .sftp
                .readdir(&inner.cwd)
                .map_err(|err| sftp_error("list", &inner.cwd, err))?;
            Ok(entries
                .into_iter()
                .filter(|(_, stat)| stat.is_file())
                .filter_map(|(path, stat)| {
                    let name = path.file_name()?.to_string_lossy().to_string();
                    let entry = listed_entry(name, &stat);
                    if entry.is_none() {
                        debug!("{} has no modification time; not listed", path.display());
                    }
                    entry
                })
                .collect())
        })
        .await
    }

    async fn stat(&mut self, name: &str) -> Result<RemoteEntry, RemoteError> {
        let name = name.to_string();
        self.blocking("stat", move |inner| {
            let path = inner.cwd.join(&name);
            let stat = inner
                .sftp
                .stat(&path)
                .map_err(|err| sftp_error("stat", &path, err))?;
            Ok(remote_entry(name, &stat))
        })
        .await
    }

    async fn remove(&mut self, name: &str) -> Result<(), RemoteError> {
        let name = name.to_string();
        self.blocking("remove", move |inner| {
            let path = inner.cwd.join(&name);
            inner
                .sftp
                .unlink(&path)
                .map_err(|err| sftp_error("remove", &path, err))
        })
        .await
    }

    async fn disconnect(self: Box<Self>) -> Result<(), RemoteError> {
        self.blocking("disconnect", |inner| {
            inner
                .session
                .disconnect(None, "backup run finished", None)
                .map_err(|err| RemoteError::transport("disconnect", err))
        })
        .await
    }
}

fn upload_to(inner: &Inner, local: &Path, partial: &Path, target: &Path) -> Result<(), RemoteError> {
    let mut source = File::open(local).map_err(|source| RemoteError::LocalIo {
        context: "opening archive for upload",
        source,
    })?;
    let mut remote = inner
        .sftp
        .create(partial)
        .map_err(|err| sftp_error("upload", partial, err))?;

    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let read = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(RemoteError::LocalIo {
                    context: "reading archive for upload",
                    source,
                });
            }
        };
        remote
            .write_all(&buf[..read])
            .map_err(|err| RemoteError::transport("upload", err))?;
    }
    remote
        .flush()
        .map_err(|err| RemoteError::transport("upload", err))?;
    drop(remote);

    inner
        .sftp
        .rename(
            partial,
            target,
            Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE),
        )
        .map_err(|err| sftp_error("upload", target, err))
}

fn remote_entry(name: String, stat: &FileStat) -> RemoteEntry {
    RemoteEntry {
        name,
        modified: UNIX_EPOCH + Duration::from_secs(stat.mtime.unwrap_or(0)),
        size: stat.size.unwrap_or(0),
    }
}

/// Listed files feed retention, so a file the server reports no mtime for is left out.
fn listed_entry(name: String, stat: &FileStat) -> Option<RemoteEntry> {
    stat.mtime?;
    Some(remote_entry(name, stat))
}

fn sftp_error(operation: &'static str, path: &Path, err: ssh2::Error) -> RemoteError {
    match err.code() {
        ErrorCode::SFTP(FX_NO_SUCH_FILE) => RemoteError::NotFound(path.display().to_string()),
        ErrorCode::SFTP(FX_PERMISSION_DENIED) => {
            RemoteError::PermissionDenied(path.display().to_string())
        }
        _ => RemoteError::transport(operation, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(port: u16) -> SftpSettings {
        SftpSettings {
            host: "127.0.0.1".into(),
            port,
            username: "pi".into(),
            private_key: PathBuf::from("/nonexistent/id_rsa"),
            passphrase: None,
            known_hosts: None,
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn missing_files_and_denials_are_not_retryable() {
        let path = Path::new("/srv/backups/a.tar.gz");

        let missing = sftp_error("stat", path, ssh2::Error::new(ErrorCode::SFTP(FX_NO_SUCH_FILE), "no such file"));
        assert!(matches!(missing, RemoteError::NotFound(_)));
        assert!(!missing.is_retryable());

        let denied = sftp_error(
            "remove",
            path,
            ssh2::Error::new(ErrorCode::SFTP(FX_PERMISSION_DENIED), "permission denied"),
        );
        assert!(matches!(denied, RemoteError::PermissionDenied(_)));
    }

    #[test]
    fn session_failures_are_retryable() {
        let err = sftp_error(
            "upload",
            Path::new("a.tar.gz"),
            ssh2::Error::new(ErrorCode::Session(-7), "socket send failed"),
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn entries_carry_mtime_and_size() {
        let stat = FileStat {
            size: Some(1024),
            uid: None,
            gid: None,
            perm: None,
            atime: None,
            mtime: Some(1_700_000_000),
        };
        let entry = listed_entry("a.tar.gz".into(), &stat).expect("dated entry");
        assert_eq!(entry.size, 1024);
        assert_eq!(entry.modified, UNIX_EPOCH + Duration::from_secs(1_700_000_000));
    }

    #[test]
    fn entries_without_mtime_are_not_listed() {
        let stat = FileStat {
            size: Some(1024),
            uid: None,
            gid: None,
            perm: None,
            atime: None,
            mtime: None,
        };
        let name = "minecraft_backup_20991231_00-00-00.tar.gz";
        assert_eq!(listed_entry(name.into(), &stat), None);
        assert_eq!(remote_entry(name.into(), &stat).size, 1024);
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let connector = SftpConnector::new(settings(port));
        assert_eq!(connector.describe(), format!("127.0.0.1:{port}"));
        let err = connector.connect().await.err().expect("nothing listening");
        assert!(matches!(err, RemoteError::Connect { .. }));
    }
}
