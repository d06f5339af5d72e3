//! luks-tray CLI - Command line front end for LUKS container management.
//!
//! Every command works on the same state the tray uses: the live topology
//! plus the remembered vitals.

mod commands;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use luks_tray_core::Config;

/// luks-tray CLI tool.
#[derive(Parser)]
#[command(name = "luks-tray")]
#[command(about = "Mount and unmount LUKS partitions and container files", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/luks-tray/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short = 'D', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation pass and list containers.
    Scan {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Keep polling in the background and print the inventory when it changes.
    Watch,

    /// Unlock and mount a container. The password is read from stdin; empty
    /// input reuses the remembered one.
    Mount {
        /// Container UUID.
        id: String,
        /// Mount point (default: the remembered one).
        #[arg(long = "at")]
        mount_point: Option<String>,
        /// Auto-unmount delay in minutes.
        #[arg(long, allow_hyphen_values = true)]
        delay: Option<String>,
        /// Auto-unmount repeat in minutes.
        #[arg(long, allow_hyphen_values = true)]
        repeat: Option<String>,
    },

    /// Create a new container file, format it and mount it. The password is
    /// read from stdin.
    AddFile {
        /// Path of the container file to create.
        file: String,
        /// Size in MiB.
        #[arg(long, default_value = "32", allow_hyphen_values = true)]
        size: String,
        /// Mount point.
        #[arg(long = "at")]
        mount_point: String,
        #[arg(long, default_value = "60", allow_hyphen_values = true)]
        delay: String,
        #[arg(long, default_value = "5", allow_hyphen_values = true)]
        repeat: String,
    },

    /// Unmount and close a container.
    Unmount {
        /// Container UUID.
        id: String,
    },

    /// List remembered containers.
    Vitals,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.log_level, cli.debug);
    tracing::debug!(?config, "configuration loaded");

    let result = match cli.command {
        Commands::Scan { json } => commands::scan(config, json),
        Commands::Watch => commands::watch(config),
        Commands::Mount {
            id,
            mount_point,
            delay,
            repeat,
        } => commands::mount(config, &id, mount_point, delay, repeat),
        Commands::AddFile {
            file,
            size,
            mount_point,
            delay,
            repeat,
        } => commands::add_file(
            config,
            commands::AddFileArgs {
                file,
                size,
                mount_point,
                delay,
                repeat,
            },
        ),
        Commands::Unmount { id } => commands::unmount(config, &id),
        Commands::Vitals => commands::vitals(config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> luks_tray_core::Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => Config::load(&luks_tray_core::config::default_path()?),
    }
}
