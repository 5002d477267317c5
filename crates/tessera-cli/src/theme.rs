//! CLI theme and styling.

use colored::Colorize;
use tessera_plugins::PluginStatus;

/// CLI theme configuration.
pub(crate) struct Theme;

impl Theme {
    /// Format a header.
    pub(crate) fn header(text: &str) -> String {
        format!("{}", text.bold().cyan())
    }

    /// Format a success message.
    pub(crate) fn success(text: &str) -> String {
        format!("{} {}", "✓".green(), text)
    }

    /// Format an error message.
    pub(crate) fn error(text: &str) -> String {
        format!("{} {}", "✗".red(), text.red())
    }

    /// Format a warning message.
    pub(crate) fn warning(text: &str) -> String {
        format!("{} {}", "!".yellow(), text.yellow())
    }

    /// Format an info message.
    pub(crate) fn info(text: &str) -> String {
        format!("{} {}", "i".blue(), text)
    }

    /// Format a dimmed message.
    pub(crate) fn dimmed(text: &str) -> String {
        format!("{}", text.dimmed())
    }

    /// Format a separator line.
    pub(crate) fn separator() -> String {
        "━".repeat(72).dimmed().to_string()
    }

    /// Color a descriptor status.
    pub(crate) fn status(status: PluginStatus) -> String {
        let text = status.as_str();
        match status {
            PluginStatus::Running => text.green().to_string(),
            PluginStatus::Error => text.red().to_string(),
            PluginStatus::Loading => text.yellow().to_string(),
            PluginStatus::Stopped => text.dimmed().to_string(),
        }
    }
}
