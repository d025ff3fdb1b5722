use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use crate::config::{default_data_dir, Settings};

#[derive(Debug, Parser)]
#[command(
    name = "sidekick",
    version,
    about = "Supervise the local sidecar services the host application depends on"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start all services and supervise them until Ctrl-C.
    Run {
        #[command(flatten)]
        mode: ModeArgs,
    },
    /// Resolve and print the service port mapping as JSON.
    Ports {
        #[command(flatten)]
        mode: ModeArgs,
    },
}

#[derive(Debug, Args)]
pub struct ModeArgs {
    /// Run from the packaged resource tree instead of a development checkout.
    #[arg(long)]
    pub deployed: bool,

    /// Launch services with reduced capabilities.
    #[arg(long)]
    pub lite: bool,

    /// Development checkout root (defaults to the current directory).
    #[arg(long)]
    pub app_root: Option<PathBuf>,

    /// Packaged resources root (required with --deployed).
    #[arg(long)]
    pub resources_dir: Option<PathBuf>,

    /// Override the user-data directory.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

impl ModeArgs {
    pub fn into_settings(self) -> anyhow::Result<Settings> {
        let mut settings = if self.deployed {
            let Some(resources_dir) = self.resources_dir else {
                bail!("--deployed requires --resources-dir");
            };
            Settings::deployed(resources_dir)
        } else {
            let app_root = match self.app_root {
                Some(root) => root,
                None => std::env::current_dir().context("resolving current directory")?,
            };
            Settings::development(app_root)
        };
        settings.lite = self.lite;
        settings.data_dir = self.data_dir.unwrap_or_else(default_data_dir);
        Ok(settings)
    }
}
