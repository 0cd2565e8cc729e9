use anyhow::Result;
use clap::Parser;
use mcbackup_core::local::FsLocalStore;
use mcbackup_core::retention::ArchiveNaming;
use mcbackup_core::{Collaborators, Config, Orchestrator, RunReport, TarGzArchiver};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};

mod console;
mod controller;
mod logging;
mod probe;
mod sftp;

#[derive(Parser)]
#[command(name = "mcbackup")]
#[command(about = "Stops a Minecraft server, archives it, ships the archive over SFTP and restarts it", long_about = None)]
struct Cli {
    /// TOML configuration file; built-in defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path).await?,
        None => {
            let config = Config::default();
            config.validate()?;
            config
        }
    };
    logging::init(&config.log_file)?;
    info!("mcbackup {} starting", mcbackup_core::pkg_version());
    match &cli.config {
        Some(path) => info!("loaded configuration from {}", path.display()),
        None => info!("no --config given; using built-in defaults"),
    }

    let deps = collaborators(&config);
    let report = Orchestrator::new(config, deps).run().await;
    summarize(&report);

    Ok(if report.state().is_done() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn collaborators(config: &Config) -> Collaborators {
    let timings = &config.timings;
    Collaborators {
        probe: Box::new(probe::StatusProbe::new(
            config.minecraft_server_ip.clone(),
            config.minecraft_server_port,
            timings.probe_timeout(),
        )),
        console: Box::new(console::RconConsole::new(
            config.minecraft_server_ip.clone(),
            config.rcon_port,
            config.rcon_password.clone(),
            config.server_dir.clone(),
        )),
        controller: Box::new(controller::ProcessController::new(
            config.server_dir.clone(),
            config.start_command.clone(),
        )),
        remote: Box::new(sftp::SftpConnector::new(sftp::SftpSettings {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            private_key: config.private_key_path.clone(),
            passphrase: config.private_key_passphrase.clone(),
            known_hosts: config.known_hosts_path.clone(),
            timeout: timings.connect_timeout(),
        })),
        archiver: Box::new(TarGzArchiver::new(ArchiveNaming::new(config.archive_prefix.clone()))),
        local: Box::new(FsLocalStore),
    }
}

fn summarize(report: &RunReport) {
    let state = report.state();
    let stages: Vec<String> = report.transitions.iter().map(ToString::to_string).collect();
    info!("stages: {}", stages.join(" -> "));
    if let Some(archive) = &report.archive {
        info!(
            "archive {} ({} bytes) local={} remote={}",
            archive.name,
            archive.size,
            archive.local_path.display(),
            archive.remote_path.as_deref().unwrap_or("-")
        );
    }
    if report.broadcast_failures > 0 {
        warn!("{} broadcast(s) could not be delivered", report.broadcast_failures);
    }
    info!(
        "pruned {} local and {} remote archive(s)",
        report.deleted_local.len(),
        report.deleted_remote.len()
    );
    for failure in &report.failures {
        warn!("{} failed: {}", failure.stage, failure.error);
    }
    if state.is_done() {
        info!("backup run done");
    } else {
        warn!("backup run {state}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn config_flag_is_optional() {
        let cli = Cli::try_parse_from(["mcbackup"]).expect("no args");
        assert!(cli.config.is_none());

        let cli = Cli::try_parse_from(["mcbackup", "--config", "/etc/mcbackup.toml"]).expect("long flag");
        assert_eq!(cli.config, Some(PathBuf::from("/etc/mcbackup.toml")));

        let cli = Cli::try_parse_from(["mcbackup", "-c", "b.toml"]).expect("short flag");
        assert_eq!(cli.config, Some(PathBuf::from("b.toml")));
    }

    #[test]
    fn default_config_wires_every_collaborator() {
        let config = Config::default();
        let deps = collaborators(&config);
        assert_eq!(deps.remote.describe(), format!("{}:{}", config.host, config.port));
    }
}
