//! Foreground plugin host.

use std::time::Duration;

use colored::Colorize;
use tessera_plugins::{PluginManager, PluginStatus};
use tracing::{info, warn};

use super::parse_id;
use crate::theme::Theme;

/// How long `--start` waits for each plugin to leave `loading`.
const START_WAIT: Duration = Duration::from_secs(60);

/// Boot the host, start the requested plugins and serve until Ctrl-C.
pub(crate) async fn run_host(manager: &PluginManager, start: &[String]) -> anyhow::Result<()> {
    let ids = start
        .iter()
        .map(|raw| parse_id(raw))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let scheduled = manager.boot().await?;
    println!(
        "{}",
        format!(
            "tessera host running at {} ({scheduled} autostart)",
            manager.paths().root().display()
        )
        .cyan()
        .bold()
    );

    let supervisor = manager.supervisor();
    for id in ids {
        if let Err(e) = supervisor.start(id).await {
            eprintln!("{}", Theme::error(&format!("{id}: {e}")));
            continue;
        }
        match supervisor.wait_until_settled(id, START_WAIT).await {
            Ok(descriptor) if descriptor.status == PluginStatus::Running => {
                println!("{}", Theme::success(&format!("{} running", descriptor.name)));
            },
            Ok(descriptor) => {
                let reason = descriptor.last_error.unwrap_or_default();
                eprintln!(
                    "{}",
                    Theme::error(&format!("{} {}: {reason}", descriptor.name, descriptor.status))
                );
            },
            Err(e) => eprintln!("{}", Theme::warning(&format!("{id}: {e}"))),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received, shutting down"),
        Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
    }
    manager.shutdown().await;
    println!("{}", Theme::dimmed("host stopped"));
    Ok(())
}
