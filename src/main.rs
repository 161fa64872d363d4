//! usb-mirror - mirrors a local folder onto a labelled removable drive
//! whenever that drive is plugged in.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use usb_mirror_lib::collaborators::{Collaborators, ConfigPrompt, LogNotifier};
use usb_mirror_lib::config::MirrorConfig;
use usb_mirror_lib::eject::SystemEjector;
use usb_mirror_lib::session::SessionOutcome;
use usb_mirror_lib::volume::{SystemVolumeProbe, VolumeProbe};

#[derive(Debug, Parser)]
#[command(name = "usb-mirror", version, about = "Mirror a folder onto a removable drive")]
struct Cli {
    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print notifications as JSON lines on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a configuration file
    Init {
        /// Mount point or drive letter of the removable drive
        #[arg(long)]
        drive: PathBuf,
        /// Volume label the drive must carry
        #[arg(long)]
        label: String,
        /// Target folder, relative to the drive or absolute
        #[arg(long)]
        remote: PathBuf,
        /// Folder to mirror onto the drive
        #[arg(long)]
        local: PathBuf,
        /// Eject the drive after every completed sync
        #[arg(long)]
        auto_eject: bool,
    },
    /// Watch for the drive and sync when it arrives (default)
    Watch,
    /// Sync once if the drive is present, then exit
    SyncNow,
    /// Show what the probe reads for a path
    Label { path: PathBuf },
}

fn collaborators(config: &MirrorConfig, json: bool) -> Collaborators {
    let notifier = if json { LogNotifier::json() } else { LogNotifier::new() };
    Collaborators {
        notifier: Arc::new(notifier),
        prompt: Arc::new(ConfigPrompt {
            auto_sync: config.auto_sync,
            auto_eject: config.auto_eject,
        }),
        ejector: Arc::new(SystemEjector::new()),
    }
}

fn load_config(path: &Path) -> Result<MirrorConfig> {
    MirrorConfig::load(path).with_context(|| {
        format!(
            "Failed to load configuration from {} (run `usb-mirror init` first)",
            path.display()
        )
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.unwrap_or_else(MirrorConfig::default_path);

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Init {
            drive,
            label,
            remote,
            local,
            auto_eject,
        } => {
            let mut config = MirrorConfig::new(drive, label, remote, local);
            config.auto_eject = auto_eject;
            config.validate().context("Refusing to write configuration")?;
            config
                .save(&config_path)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            info!(path = %config_path.display(), "configuration saved");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Watch => {
            let config = load_config(&config_path)?;
            info!(
                drive = %config.drive_root().display(),
                label = %config.expected_label,
                local = %config.local_root().display(),
                "usb-mirror starting"
            );
            let collaborators = collaborators(&config, cli.json);
            usb_mirror_lib::watch(config, collaborators, Arc::new(SystemVolumeProbe::new()))
                .await
                .context("Watch loop failed")?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::SyncNow => {
            let config = load_config(&config_path)?;
            let collaborators = collaborators(&config, cli.json);
            let outcome =
                usb_mirror_lib::sync_now(config, collaborators, Arc::new(SystemVolumeProbe::new()))
                    .await
                    .context("Sync not started")?;
            match outcome {
                SessionOutcome::Completed(_) => Ok(ExitCode::SUCCESS),
                SessionOutcome::Failed { error, .. } => {
                    error!("sync failed: {}", error);
                    Ok(ExitCode::FAILURE)
                }
                SessionOutcome::Abandoned { .. } => Ok(ExitCode::FAILURE),
            }
        }
        Commands::Label { path } => {
            let probe = SystemVolumeProbe::new();
            let mounted = probe
                .is_mounted(&path)
                .with_context(|| format!("Cannot query {}", path.display()))?;
            println!("path:    {}", path.display());
            println!("mounted: {}", mounted);
            if mounted {
                let label = probe
                    .volume_label(&path)
                    .with_context(|| format!("Cannot read label of {}", path.display()))?;
                println!("label:   {}", label.as_deref().unwrap_or("<none>"));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
