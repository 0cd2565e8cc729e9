use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ConfigError;

/// Settings for one backup run. Loaded once at process start and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub private_key_path: PathBuf,
    #[serde(default)]
    pub private_key_passphrase: Option<String>,
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,
    pub remote_path: String,
    /// Directory holding local archives.
    pub local_path: PathBuf,
    /// The server's data directory, archived as a whole.
    #[serde(default = "default_server_dir")]
    pub server_dir: PathBuf,
    #[serde(default = "default_start_command")]
    pub start_command: Vec<String>,
    pub minecraft_server_ip: String,
    pub minecraft_server_port: u16,
    #[serde(default = "default_rcon_port")]
    pub rcon_port: u16,
    /// Empty means "read it from server.properties".
    pub rcon_password: String,
    pub retention_days: u32,
    #[serde(default = "default_archive_prefix")]
    pub archive_prefix: String,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    #[serde(default)]
    pub timings: Timings,
}

/// Waits and bounds used by the run. All values in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub warning_lead_secs: u64,
    pub final_warning_secs: u64,
    pub countdown_from: u32,
    pub shutdown_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub settle_secs: u64,
    pub probe_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            warning_lead_secs: 300,
            final_warning_secs: 60,
            countdown_from: 5,
            shutdown_timeout_secs: 120,
            poll_interval_secs: 5,
            settle_secs: 10,
            probe_timeout_secs: 5,
            connect_timeout_secs: 15,
        }
    }
}

impl Timings {
    pub fn warning_lead(&self) -> Duration {
        Duration::from_secs(self.warning_lead_secs)
    }

    pub fn final_warning(&self) -> Duration {
        Duration::from_secs(self.final_warning_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/home/pi"));
        Self {
            host: "192.168.0.24".to_string(),
            port: 22,
            username: "pi".to_string(),
            private_key_path: home.join(".ssh").join("id_rsa"),
            private_key_passphrase: None,
            known_hosts_path: None,
            remote_path: "/srv/backups/minecraft".to_string(),
            local_path: home.join("minecraft_backups"),
            server_dir: default_server_dir(),
            start_command: default_start_command(),
            minecraft_server_ip: "127.0.0.1".to_string(),
            minecraft_server_port: 25565,
            rcon_port: default_rcon_port(),
            rcon_password: String::new(),
            retention_days: 7,
            archive_prefix: default_archive_prefix(),
            log_file: default_log_file(),
            timings: Timings::default(),
        }
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retention_days == 0 {
            return Err(ConfigError::Invalid("retention_days must be at least 1".into()));
        }
        if self.start_command.is_empty() || self.start_command[0].trim().is_empty() {
            return Err(ConfigError::Invalid("start_command must name a program".into()));
        }
        for (key, value) in [
            ("host", &self.host),
            ("username", &self.username),
            ("remote_path", &self.remote_path),
            ("archive_prefix", &self.archive_prefix),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{key} must not be empty")));
            }
        }
        let t = &self.timings;
        if !(t.warning_lead_secs > t.final_warning_secs
            && t.final_warning_secs > u64::from(t.countdown_from))
        {
            return Err(ConfigError::Invalid(
                "timings must satisfy warning_lead_secs > final_warning_secs > countdown_from".into(),
            ));
        }
        if t.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }

    pub fn remote_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.minecraft_server_ip, self.minecraft_server_port)
    }
}

fn default_server_dir() -> PathBuf {
    PathBuf::from("/home/pi/minecraft")
}

fn default_start_command() -> Vec<String> {
    vec!["/bin/sh".to_string(), "start.sh".to_string()]
}

fn default_rcon_port() -> u16 {
    25575
}

fn default_archive_prefix() -> String {
    "minecraft_backup".to_string()
}

fn default_log_file() -> PathBuf {
    PathBuf::from("mcbackup.log")
}
