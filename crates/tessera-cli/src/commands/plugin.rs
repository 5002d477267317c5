//! Registry commands: install, list, info, remove and flag toggles.

use std::path::Path;

use anyhow::Context;
use tessera_plugins::{DescriptorFilter, PluginDescriptor, PluginManager, PluginStatus};

use super::parse_id;
use crate::theme::Theme;

pub(crate) async fn install(manager: &PluginManager, archive: &Path) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(archive)
        .await
        .with_context(|| format!("failed to read {}", archive.display()))?;
    let descriptor = manager.install(&bytes).await?;
    println!(
        "{}",
        Theme::success(&format!(
            "Installed {} {} ({})",
            descriptor.name, descriptor.version, descriptor.id
        ))
    );
    Ok(())
}

pub(crate) async fn list(
    manager: &PluginManager,
    name: Option<String>,
    status: Option<PluginStatus>,
) -> anyhow::Result<()> {
    let filter = DescriptorFilter {
        name,
        status,
        ..DescriptorFilter::default()
    };
    let descriptors = manager.list(&filter).await?;
    if descriptors.is_empty() {
        println!("{}", Theme::info("No plugins installed"));
        return Ok(());
    }

    println!("{}", Theme::header("Installed Plugins"));
    println!(
        "  {:<36} {:<20} {:<10} {:<9} {:<8} AUTO",
        "ID", "NAME", "VERSION", "STATUS", "ENABLED"
    );
    println!("{}", Theme::separator());
    for d in &descriptors {
        println!(
            "  {:<36} {:<20} {:<10} {:<9} {:<8} {}",
            d.id,
            d.name,
            d.version,
            Theme::status(d.status),
            yes_no(d.enabled),
            yes_no(d.auto_start)
        );
    }
    println!(
        "\n{}",
        Theme::dimmed(&format!("{} plugin(s)", descriptors.len()))
    );
    Ok(())
}

pub(crate) async fn info(manager: &PluginManager, id: &str) -> anyhow::Result<()> {
    let descriptor = manager.get(parse_id(id)?).await?;
    print_descriptor(&descriptor);
    Ok(())
}

pub(crate) async fn remove(manager: &PluginManager, id: &str) -> anyhow::Result<()> {
    let descriptor = manager.uninstall(parse_id(id)?).await?;
    println!(
        "{}",
        Theme::success(&format!(
            "Removed {} {}",
            descriptor.name, descriptor.version
        ))
    );
    Ok(())
}

pub(crate) async fn set_enabled(
    manager: &PluginManager,
    id: &str,
    enabled: bool,
) -> anyhow::Result<()> {
    let descriptor = manager.set_enabled(parse_id(id)?, enabled).await?;
    let verb = if enabled { "Enabled" } else { "Disabled" };
    println!("{}", Theme::success(&format!("{verb} {}", descriptor.name)));
    Ok(())
}

pub(crate) async fn set_auto_start(
    manager: &PluginManager,
    id: &str,
    auto_start: bool,
) -> anyhow::Result<()> {
    let descriptor = manager.set_auto_start(parse_id(id)?, auto_start).await?;
    println!(
        "{}",
        Theme::success(&format!(
            "Autostart {} for {}",
            if auto_start { "on" } else { "off" },
            descriptor.name
        ))
    );
    Ok(())
}

fn print_descriptor(d: &PluginDescriptor) {
    println!("{}", Theme::header(&format!("{} {}", d.name, d.version)));
    println!("{}", Theme::separator());
    println!("  id:            {}", d.id);
    println!("  key:           {}", d.key);
    if !d.description.is_empty() {
        println!("  description:   {}", d.description);
    }
    println!("  status:        {}", Theme::status(d.status));
    if let Some(error) = &d.last_error {
        println!("  last error:    {}", Theme::error(error));
    }
    println!("  enabled:       {}", yes_no(d.enabled));
    println!("  autostart:     {}", yes_no(d.auto_start));
    println!("  capability:    {}", d.capability);
    println!("  binary:        {}", d.binary_path.display());
    if let Some(archive) = &d.archive_path {
        println!("  archive:       {}", archive.display());
    }
    if !d.dependencies.is_empty() {
        let deps: Vec<&str> = d.dependencies.iter().map(|k| k.as_str()).collect();
        println!("  depends on:    {}", deps.join(", "));
    }
    if let Some(at) = d.last_started_at {
        println!("  last started:  {}", at.to_rfc3339());
    }
    if let Some(at) = d.last_stopped_at {
        println!("  last stopped:  {}", at.to_rfc3339());
    }
    println!("  installed:     {}", d.created_at.to_rfc3339());
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
