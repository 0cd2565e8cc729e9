use minecraft_client_rs::Client;
use std::error::Error as StdError;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::fs;
use tokio::task::spawn_blocking;
use tracing::debug;

pub const DEFAULT_RCON_PORT: u16 = 25575;

#[derive(Debug, Error)]
pub enum RconError {
    #[error("failed to connect to RCON at {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("RCON authentication failed: {0}")]
    Auth(String),
    #[error("RCON connection closed")]
    Closed,
    #[error("RCON command `{command}` failed: {reason}")]
    Command { command: String, reason: String },
    #[error("RCON settings in {path}: {reason}")]
    Settings { path: String, reason: String },
    #[error("RCON worker failed: {0}")]
    Task(String),
}

/// The RCON listener as declared in `server.properties`. The file does not say
/// which interface the server is reachable on, only the port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconProperties {
    pub port: u16,
    pub password: String,
}

/// An authenticated RCON connection that stays open across commands.
pub struct RconSession {
    address: String,
    client: Arc<Mutex<Option<Client>>>,
}

impl RconSession {
    pub async fn connect(address: String, password: String) -> Result<Self, RconError> {
        let target = address.clone();
        let client = spawn_blocking(move || {
            let mut client = Client::new(target.clone()).map_err(|err| RconError::Connect {
                address: target.clone(),
                reason: err.to_string(),
            })?;
            client
                .authenticate(password)
                .map_err(|err| match classify(err.as_ref()) {
                    Some(io) => RconError::Connect {
                        address: target.clone(),
                        reason: io.to_string(),
                    },
                    None => RconError::Auth(err.to_string()),
                })?;
            Ok(client)
        })
        .await
        .map_err(|err| RconError::Task(err.to_string()))??;

        debug!("rcon session open at {address}");
        Ok(Self {
            address,
            client: Arc::new(Mutex::new(Some(client))),
        })
    }

    pub async fn execute(&self, command: &str) -> Result<String, RconError> {
        let client = self.client.clone();
        let command = command.to_string();

        spawn_blocking(move || {
            let mut guard = client
                .lock()
                .map_err(|_| RconError::Task("rcon client lock poisoned".to_string()))?;
            let Some(inner) = guard.as_mut() else {
                return Err(RconError::Closed);
            };
            match inner.send_command(command.clone()) {
                Ok(reply) => Ok(reply.body),
                Err(err) => {
                    if classify(err.as_ref()).is_some_and(is_disconnect) {
                        *guard = None;
                        return Err(RconError::Closed);
                    }
                    Err(RconError::Command {
                        command,
                        reason: err.to_string(),
                    })
                }
            }
        })
        .await
        .map_err(|err| RconError::Task(err.to_string()))?
    }

    /// Closes the connection. Errors are ignored; the peer may already be gone.
    pub async fn close(self) {
        let client = self.client;
        let address = self.address;
        let _ = spawn_blocking(move || {
            if let Ok(mut guard) = client.lock() {
                if let Some(mut inner) = guard.take() {
                    let _ = inner.close();
                }
            }
        })
        .await;
        debug!("rcon session at {address} closed");
    }
}

fn classify<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a io::Error> {
    err.downcast_ref::<io::Error>()
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Reads the RCON port and password from `server.properties` in `server_dir`. Returns `None`
/// when the file is absent or RCON is disabled there.
pub async fn load_rcon_properties(server_dir: &Path) -> Result<Option<RconProperties>, RconError> {
    let properties_path = server_dir.join("server.properties");
    let content = match fs::read_to_string(&properties_path).await {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };
    parse_properties(&content).map_err(|reason| RconError::Settings {
        path: properties_path.display().to_string(),
        reason,
    })
}

fn parse_properties(content: &str) -> Result<Option<RconProperties>, String> {
    let mut enabled = false;
    let mut port: Option<u16> = None;
    let mut password: Option<String> = None;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        match key.trim() {
            "enable-rcon" => enabled = value.trim().eq_ignore_ascii_case("true"),
            "rcon.port" => port = value.trim().parse::<u16>().ok(),
            "rcon.password" => {
                let val = value.trim();
                if !val.is_empty() {
                    password = Some(val.to_string());
                }
            }
            _ => {}
        }
    }

    if !enabled {
        return Ok(None);
    }

    let password = password.ok_or_else(|| "rcon is enabled but rcon.password is empty".to_string())?;
    Ok(Some(RconProperties {
        port: port.unwrap_or(DEFAULT_RCON_PORT),
        password,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("mcbackup-rcon-{prefix}-{nanos}"))
    }

    #[test]
    fn enabled_rcon_yields_port_and_password() {
        let settings = parse_properties(
            "#Minecraft server properties\nenable-rcon=true\nrcon.port=25580\nrcon.password=hunter2\nmotd=hi\n",
        )
        .expect("parse")
        .expect("enabled");
        assert_eq!(settings.port, 25580);
        assert_eq!(settings.password, "hunter2");
    }

    #[test]
    fn missing_port_falls_back_to_default() {
        let settings = parse_properties("enable-rcon=TRUE\nrcon.password=pw\n")
            .expect("parse")
            .expect("enabled");
        assert_eq!(settings.port, DEFAULT_RCON_PORT);
    }

    #[test]
    fn disabled_rcon_is_none() {
        assert_eq!(
            parse_properties("enable-rcon=false\nrcon.password=pw\n").expect("parse"),
            None
        );
    }

    #[test]
    fn enabled_without_password_is_an_error() {
        assert!(parse_properties("enable-rcon=true\nrcon.password=\n").is_err());
    }

    #[tokio::test]
    async fn missing_properties_file_is_none() {
        let dir = unique_temp_dir("missing");
        assert!(load_rcon_properties(&dir).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn reads_properties_from_server_dir() {
        let dir = unique_temp_dir("props");
        std::fs::create_dir_all(&dir).expect("create dir");
        std::fs::write(
            dir.join("server.properties"),
            "enable-rcon=true\nrcon.password=secret\n",
        )
        .expect("write properties");

        let settings = load_rcon_properties(&dir).await.expect("load").expect("enabled");
        assert_eq!(settings.password, "secret");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn io_errors_are_found_behind_boxed_errors() {
        let boxed: Box<dyn StdError + Send + Sync> =
            Box::new(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(classify(boxed.as_ref()).is_some_and(is_disconnect));

        let other: Box<dyn StdError + Send + Sync> = "bad packet".into();
        assert!(classify(other.as_ref()).is_none());
    }

    #[test]
    fn disconnect_kinds_are_recognised() {
        assert!(is_disconnect(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_disconnect(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!is_disconnect(&io::Error::from(io::ErrorKind::InvalidData)));
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let err = RconSession::connect(address, "pw".into())
            .await
            .err()
            .expect("nothing is listening");
        assert!(matches!(err, RconError::Connect { .. }));
    }
}
