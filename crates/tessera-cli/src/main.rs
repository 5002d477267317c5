//! Tessera CLI: install, inspect and host out-of-process plugins.
//!
//! Registry commands work on the descriptor file directly. `run` is the
//! long-lived host that owns plugin processes until Ctrl-C.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tessera_plugins::PluginStatus;

mod commands;
mod config_bridge;
mod theme;

use commands::{open_manager, plugin, resource, run};
use theme::Theme;

/// Tessera - out-of-process plugin host
#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to an extra configuration file
    #[arg(short, long, global = true, env = "TESSERA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a plugin package (.zip)
    Install {
        /// Path to the package
        archive: PathBuf,
    },

    /// List installed plugins
    List {
        /// Only plugins with this name
        #[arg(long)]
        name: Option<String>,
        /// Only plugins in this state (stopped, loading, running, error)
        #[arg(long)]
        status: Option<PluginStatus>,
    },

    /// Show one plugin
    Info {
        /// Plugin ID
        id: String,
    },

    /// Stop and remove a plugin
    Remove {
        /// Plugin ID
        id: String,
    },

    /// Enable a plugin
    Enable {
        /// Plugin ID
        id: String,
    },

    /// Disable a plugin (does not stop it)
    Disable {
        /// Plugin ID
        id: String,
    },

    /// Turn autostart on or off
    Autostart {
        /// Plugin ID
        id: String,
        /// Turn autostart off instead of on
        #[arg(long)]
        off: bool,
    },

    /// Run the plugin host in the foreground
    Run {
        /// Also start these plugin IDs
        #[arg(long = "start", value_name = "ID")]
        start: Vec<String>,
    },

    /// Fetch a static resource from a plugin version
    Resource {
        /// Plugin name
        name: String,
        /// Plugin version (semver)
        version: String,
        /// Resource path inside the plugin
        path: String,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let resolved = match tessera_config::load(cli.config.as_deref(), None) {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("{}", Theme::error(&format!("Invalid configuration: {e}")));
            return Err(e).context("failed to load configuration");
        },
    };

    let log_config = config_bridge::to_log_config(&resolved, cli.verbose);
    if let Err(e) = tessera_telemetry::setup_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let manager = open_manager(&resolved);
    match cli.command {
        Commands::Install { archive } => plugin::install(&manager, &archive).await?,
        Commands::List { name, status } => plugin::list(&manager, name, status).await?,
        Commands::Info { id } => plugin::info(&manager, &id).await?,
        Commands::Remove { id } => plugin::remove(&manager, &id).await?,
        Commands::Enable { id } => plugin::set_enabled(&manager, &id, true).await?,
        Commands::Disable { id } => plugin::set_enabled(&manager, &id, false).await?,
        Commands::Autostart { id, off } => plugin::set_auto_start(&manager, &id, !off).await?,
        Commands::Run { start } => run::run_host(&manager, &start).await?,
        Commands::Resource {
            name,
            version,
            path,
            output,
        } => resource::fetch(&manager, &name, &version, &path, output.as_deref()).await?,
        Commands::Config => print_config(&resolved)?,
    }

    Ok(())
}

fn print_config(resolved: &tessera_config::ResolvedConfig) -> Result<()> {
    println!("{}", Theme::header("Configuration"));
    if resolved.loaded_files.is_empty() {
        println!("{}", Theme::dimmed("  (built-in defaults only)"));
    }
    for file in &resolved.loaded_files {
        println!("  {}", Theme::dimmed(file));
    }
    println!("  plugin root: {}", resolved.plugin_root().display());
    println!("  registry:    {}", resolved.registry_path().display());
    println!("{}", Theme::separator());
    print!("{}", toml::to_string_pretty(&resolved.config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_resource_command() {
        let cli = Cli::try_parse_from([
            "tessera", "resource", "hello", "1.0.0", "index.html", "-o", "/tmp/x",
        ])
        .unwrap();
        match cli.command {
            Commands::Resource {
                name,
                version,
                output,
                ..
            } => {
                assert_eq!(name, "hello");
                assert_eq!(version, "1.0.0");
                assert_eq!(output, Some(PathBuf::from("/tmp/x")));
            },
            _ => panic!("expected resource command"),
        }
    }

    #[test]
    fn test_parse_status_filter() {
        let cli = Cli::try_parse_from(["tessera", "list", "--status", "running"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::List {
                status: Some(PluginStatus::Running),
                ..
            }
        ));
    }
}
