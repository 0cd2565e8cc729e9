use async_trait::async_trait;
use mcbackup_core::errors::ChannelError;
use mcbackup_core::service::{ConsoleChannel, ConsoleConnector};
use mcbackup_rcon::{RconError, RconSession, load_rcon_properties};
use std::path::PathBuf;
use tracing::{debug, info};

/// Opens RCON sessions to the configured host, using the configured credentials
/// or the port and password in `server.properties` when no password is configured.
pub struct RconConsole {
    host: String,
    port: u16,
    password: String,
    server_dir: PathBuf,
}

impl RconConsole {
    pub fn new(host: String, port: u16, password: String, server_dir: PathBuf) -> Self {
        Self {
            host,
            port,
            password,
            server_dir,
        }
    }

    fn address(&self, port: u16) -> String {
        format!("{}:{port}", self.host)
    }

    /// Resolves `(address, password)` for the next session.
    async fn settings(&self) -> Result<(String, String), ChannelError> {
        if !self.password.is_empty() {
            return Ok((self.address(self.port), self.password.clone()));
        }

        let address = self.server_dir.join("server.properties").display().to_string();
        match load_rcon_properties(&self.server_dir).await {
            Ok(Some(properties)) => {
                info!("using RCON port and password from {address}");
                Ok((self.address(properties.port), properties.password))
            }
            Ok(None) => Err(ChannelError::Connect {
                address,
                reason: "no rcon_password configured and RCON is not enabled in server.properties"
                    .to_string(),
            }),
            Err(err) => Err(ChannelError::Connect {
                address,
                reason: err.to_string(),
            }),
        }
    }
}

#[async_trait]
impl ConsoleConnector for RconConsole {
    async fn open(&self) -> Result<Box<dyn ConsoleChannel>, ChannelError> {
        let (address, password) = self.settings().await?;
        debug!("opening RCON session to {address}");
        let session = RconSession::connect(address, password)
            .await
            .map_err(channel_error)?;
        Ok(Box::new(RconChannel { session }))
    }
}

struct RconChannel {
    session: RconSession,
}

#[async_trait]
impl ConsoleChannel for RconChannel {
    async fn send_command(&mut self, command: &str) -> Result<String, ChannelError> {
        self.session.execute(command).await.map_err(channel_error)
    }

    async fn close(self: Box<Self>) {
        self.session.close().await;
    }
}

fn channel_error(err: RconError) -> ChannelError {
    match err {
        RconError::Connect { address, reason } => ChannelError::Connect { address, reason },
        RconError::Auth(_) => ChannelError::Auth,
        RconError::Closed => ChannelError::Closed,
        RconError::Command { command, reason } => ChannelError::Command { command, reason },
        RconError::Settings { path, reason } => ChannelError::Connect {
            address: path,
            reason,
        },
        RconError::Task(reason) => ChannelError::Command {
            command: "<rcon worker>".to_string(),
            reason,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("mcbackup-console-{prefix}-{nanos}"))
    }

    #[tokio::test]
    async fn configured_password_wins() {
        let console = RconConsole::new("10.0.0.5".into(), 25575, "pw".into(), unique_temp_dir("cfg"));
        let (address, password) = console.settings().await.expect("settings");
        assert_eq!(address, "10.0.0.5:25575");
        assert_eq!(password, "pw");
    }

    #[tokio::test]
    async fn falls_back_to_server_properties_on_the_configured_host() {
        let dir = unique_temp_dir("props");
        std::fs::create_dir_all(&dir).expect("create dir");
        std::fs::write(
            dir.join("server.properties"),
            "enable-rcon=true\nrcon.port=25590\nrcon.password=fromfile\n",
        )
        .expect("write properties");

        let console = RconConsole::new("10.0.0.5".into(), 25575, String::new(), dir.clone());
        let (address, password) = console.settings().await.expect("settings");
        assert_eq!(address, "10.0.0.5:25590");
        assert_eq!(password, "fromfile");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn no_credentials_anywhere_fails_to_open() {
        let console = RconConsole::new("127.0.0.1".into(), 25575, String::new(), unique_temp_dir("none"));
        let err = console.open().await.err().expect("no credentials");
        assert!(matches!(err, ChannelError::Connect { .. }));
    }

    #[test]
    fn rcon_errors_map_onto_channel_errors() {
        assert!(matches!(channel_error(RconError::Closed), ChannelError::Closed));
        assert!(matches!(
            channel_error(RconError::Auth("bad".into())),
            ChannelError::Auth
        ));
    }
}
