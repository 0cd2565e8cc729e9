use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{ChannelError, ControlError, ProbeError};

/// Point-in-time status read. Never cached past the check that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub online: bool,
    pub version: String,
    pub current_player_count: u32,
    pub max_player_count: u32,
}

#[async_trait]
pub trait ServiceProbe: Send + Sync {
    /// One bounded status query.
    async fn status(&self) -> Result<ServiceStatus, ProbeError>;
}

/// Opens the in-band command link (RCON) to the running service.
#[async_trait]
pub trait ConsoleConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn ConsoleChannel>, ChannelError>;
}

#[async_trait]
pub trait ConsoleChannel: Send {
    /// Returns the server's reply text. `ChannelError::Closed` means the server hung up.
    async fn send_command(&mut self, command: &str) -> Result<String, ChannelError>;

    /// Release the channel. Must tolerate a remote end that already went away.
    async fn close(self: Box<Self>);
}

/// Starts and stops the service process.
#[async_trait]
pub trait ServiceController: Send + Sync {
    async fn start(&self) -> Result<(), ControlError>;

    async fn stop(&self) -> Result<(), ControlError>;
}
