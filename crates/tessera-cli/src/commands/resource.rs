//! Fetch a static resource from a plugin version through the loader.

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use tessera_plugins::PluginManager;

use crate::theme::Theme;

/// Resolve `name`/`version`, fetch `path` and write it to `output` or
/// stdout. The plugin process is released before returning.
pub(crate) async fn fetch(
    manager: &PluginManager,
    name: &str,
    version: &str,
    path: &str,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let result = fetch_bytes(manager, name, version, path).await;
    manager.shutdown().await;
    let (bytes, content_type) = result?;

    match output {
        Some(file) => {
            tokio::fs::write(file, &bytes)
                .await
                .with_context(|| format!("failed to write {}", file.display()))?;
            eprintln!(
                "{}",
                Theme::success(&format!(
                    "Wrote {} bytes ({content_type}) to {}",
                    bytes.len(),
                    file.display()
                ))
            );
        },
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        },
    }
    Ok(())
}

async fn fetch_bytes(
    manager: &PluginManager,
    name: &str,
    version: &str,
    path: &str,
) -> anyhow::Result<(Vec<u8>, String)> {
    let capability = manager.loader().resolve(name, version).await?;
    let resource = capability.get_static_resource(path).await?;
    Ok((resource.bytes, resource.content_type))
}
