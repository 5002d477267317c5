//! On-disk layout under the host root directory.
//!
//! ```text
//! <root>/plugins/<key>/...                    supervisor installs
//! <root>/plugins/.archives/<key>-<ver>.zip    archive copies
//! <root>/versions/<key>/<ver>/...             loader extractions
//! ```

use std::path::{Path, PathBuf};

use crate::descriptor::PluginKey;

/// Resolves plugin directories from one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginPaths {
    root: PathBuf,
}

impl PluginPaths {
    /// Layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parent of every install directory.
    #[must_use]
    pub fn plugins_dir(&self) -> PathBuf {
        self.root.join("plugins")
    }

    /// Install directory of one plugin.
    #[must_use]
    pub fn plugin_dir(&self, key: &PluginKey) -> PathBuf {
        self.plugins_dir().join(key.as_str())
    }

    /// Where installed archives are copied.
    #[must_use]
    pub fn archives_dir(&self) -> PathBuf {
        self.plugins_dir().join(".archives")
    }

    /// Archive copy for one `(key, version)`.
    #[must_use]
    pub fn archive_path(&self, key: &PluginKey, version: &str) -> PathBuf {
        self.archives_dir()
            .join(format!("{key}-{}.zip", path_safe(version)))
    }

    /// Parent of every versioned extraction.
    #[must_use]
    pub fn versions_dir(&self) -> PathBuf {
        self.root.join("versions")
    }

    /// Versioned extractions of one plugin.
    #[must_use]
    pub fn key_versions_dir(&self, key: &PluginKey) -> PathBuf {
        self.versions_dir().join(key.as_str())
    }

    /// Versioned extraction directory of one `(key, version)`.
    #[must_use]
    pub fn version_dir(&self, key: &PluginKey, version: &str) -> PathBuf {
        self.key_versions_dir(key).join(path_safe(version))
    }
}

/// Replace characters that cannot appear in a single path component.
#[must_use]
pub fn path_safe(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = PluginPaths::new("/srv/tessera");
        let key = PluginKey::from_static("demo");
        assert_eq!(paths.plugin_dir(&key), PathBuf::from("/srv/tessera/plugins/demo"));
        assert_eq!(
            paths.archive_path(&key, "1.0.0"),
            PathBuf::from("/srv/tessera/plugins/.archives/demo-1.0.0.zip")
        );
        assert_eq!(
            paths.version_dir(&key, "1.0.0+build.1"),
            PathBuf::from("/srv/tessera/versions/demo/1.0.0+build.1")
        );
    }

    #[test]
    fn test_path_safe() {
        assert_eq!(path_safe("1.0/../x"), "1.0_.._x");
        assert_eq!(path_safe(".."), "_");
        assert_eq!(path_safe(""), "_");
    }
}
