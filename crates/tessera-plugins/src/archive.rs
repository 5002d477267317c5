//! Safe zip handling for plugin packages.
//!
//! Guards applied to every entry, both when inspecting and when extracting:
//! - Rejects absolute paths, `..`, root and prefix components
//! - Rejects symlinks and other non-regular entries
//! - Limits entry count to [`MAX_ENTRY_COUNT`]
//! - Limits total uncompressed size to [`MAX_EXTRACTED_SIZE`]
//! - Verifies every target stays inside the destination after
//!   canonicalization

use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use zip::ZipArchive;

use crate::error::{PluginError, PluginResult};
use crate::manifest::MANIFEST_FILE_NAME;

/// Maximum number of entries allowed in a package.
pub const MAX_ENTRY_COUNT: usize = 10_000;

/// Maximum total extracted size (500 MB), zip bomb protection.
pub const MAX_EXTRACTED_SIZE: u64 = 500_000_000;

const S_IFMT: u32 = 0o170_000;
const S_IFREG: u32 = 0o100_000;
const S_IFDIR: u32 = 0o040_000;

/// What [`inspect`] found in a package.
#[derive(Debug, Clone)]
pub struct PackageLayout {
    /// Raw manifest bytes.
    pub manifest: Vec<u8>,
    /// Entries that look like the executable, relative to the package root.
    pub binary_candidates: Vec<PathBuf>,
    /// Number of entries, directories included.
    pub entry_count: usize,
    /// Declared uncompressed size of all files.
    pub total_size: u64,
}

impl PackageLayout {
    /// The single binary entry.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::MalformedPackage`] if there is no candidate or
    /// more than one.
    pub fn binary_entry(&self) -> PluginResult<&Path> {
        match self.binary_candidates.as_slice() {
            [only] => Ok(only),
            [] => Err(PluginError::MalformedPackage(
                "no executable found in package".into(),
            )),
            many => Err(PluginError::MalformedPackage(format!(
                "expected exactly one executable, found {}: {}",
                many.len(),
                many.iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

/// Scan a package without touching the filesystem.
///
/// # Errors
///
/// Returns [`PluginError::MalformedPackage`] if the archive has no root
/// manifest or more than one, and the extraction guard errors for unsafe
/// entries.
pub fn inspect(bytes: &[u8]) -> PluginResult<PackageLayout> {
    let mut archive = open(bytes)?;
    check_entry_count(archive.len())?;

    let mut manifest: Option<Vec<u8>> = None;
    let mut binary_candidates = Vec::new();
    let mut total_size: u64 = 0;

    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        let raw_name = file.name().to_string();
        let relative = validate_entry_path(&raw_name)?;
        check_entry_type(&raw_name, file.unix_mode(), file.is_dir())?;

        if file.is_dir() {
            continue;
        }

        total_size = total_size.saturating_add(file.size());
        if total_size > MAX_EXTRACTED_SIZE {
            return Err(PluginError::PackageTooLarge {
                size: total_size,
                limit: MAX_EXTRACTED_SIZE,
            });
        }

        if relative == Path::new(MANIFEST_FILE_NAME) {
            if manifest.is_some() {
                return Err(PluginError::MalformedPackage(format!(
                    "duplicate {MANIFEST_FILE_NAME} in package"
                )));
            }
            let mut content = Vec::new();
            (&mut file)
                .take(MAX_EXTRACTED_SIZE)
                .read_to_end(&mut content)
                .map_err(|e| PluginError::Extraction {
                    message: format!("failed to read {MANIFEST_FILE_NAME}: {e}"),
                })?;
            manifest = Some(content);
        } else if is_binary_candidate(&relative) {
            binary_candidates.push(relative);
        }
    }

    let manifest = manifest.ok_or_else(|| {
        PluginError::MalformedPackage(format!("{MANIFEST_FILE_NAME} not found at package root"))
    })?;

    Ok(PackageLayout {
        manifest,
        binary_candidates,
        entry_count: archive.len(),
        total_size,
    })
}

/// Extract every entry of a package into `dest`, which must exist.
///
/// Returns the number of files written.
///
/// # Errors
///
/// Returns `PluginError::Extraction` on archive or filesystem failures,
/// `PluginError::PathTraversal` and `PluginError::UnsafeEntry` on
/// malicious entries and `PluginError::PackageTooLarge` when the
/// uncompressed data exceeds the limit.
pub fn extract(bytes: &[u8], dest: &Path) -> PluginResult<usize> {
    let mut archive = open(bytes)?;
    check_entry_count(archive.len())?;

    let dest = dest.canonicalize().map_err(|e| PluginError::Extraction {
        message: format!("failed to canonicalize destination {}: {e}", dest.display()),
    })?;

    let mut written: u64 = 0;
    let mut files = 0usize;

    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        let raw_name = file.name().to_string();
        let relative = validate_entry_path(&raw_name)?;
        check_entry_type(&raw_name, file.unix_mode(), file.is_dir())?;

        let target = dest.join(&relative);
        ensure_within(&dest, &target, &raw_name)?;

        if file.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| PluginError::Extraction {
                message: format!("failed to create directory {}: {e}", target.display()),
            })?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PluginError::Extraction {
                message: format!("failed to create directory {}: {e}", parent.display()),
            })?;
        }

        let remaining = MAX_EXTRACTED_SIZE.saturating_sub(written);
        let mut out = std::fs::File::create(&target).map_err(|e| PluginError::Extraction {
            message: format!("failed to create {}: {e}", target.display()),
        })?;
        // Read one byte past the budget so an understated header is caught.
        let copied = std::io::copy(&mut (&mut file).take(remaining.saturating_add(1)), &mut out)
            .map_err(|e| PluginError::Extraction {
                message: format!("failed to unpack {raw_name}: {e}"),
            })?;
        written = written.saturating_add(copied);
        if written > MAX_EXTRACTED_SIZE {
            return Err(PluginError::PackageTooLarge {
                size: written,
                limit: MAX_EXTRACTED_SIZE,
            });
        }
        files = files.saturating_add(1);
    }

    if files == 0 {
        return Err(PluginError::Extraction {
            message: "archive contains no files".into(),
        });
    }

    Ok(files)
}

/// Set `rwxr-xr-x` on Unix. No-op elsewhere.
///
/// # Errors
///
/// Returns an I/O error if the permissions cannot be changed.
pub fn mark_executable(path: &Path) -> PluginResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Whether a regular file entry looks like the package executable: no
/// extension, an `exe` extension, or anywhere under a `bin/` directory.
/// Dotfiles and the manifest never qualify.
#[must_use]
pub fn is_binary_candidate(relative: &Path) -> bool {
    let Some(file_name) = relative.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if file_name.starts_with('.') || file_name == MANIFEST_FILE_NAME {
        return false;
    }
    let under_bin = relative
        .parent()
        .is_some_and(|p| p.components().any(|c| c.as_os_str() == "bin"));
    let extension = relative.extension().and_then(|e| e.to_str());
    under_bin || extension.is_none() || extension.is_some_and(|e| e.eq_ignore_ascii_case("exe"))
}

fn open(bytes: &[u8]) -> PluginResult<ZipArchive<Cursor<&[u8]>>> {
    ZipArchive::new(Cursor::new(bytes)).map_err(|e| {
        PluginError::MalformedPackage(format!("not a readable zip archive: {e}"))
    })
}

fn check_entry_count(count: usize) -> PluginResult<()> {
    if count > MAX_ENTRY_COUNT {
        return Err(PluginError::Extraction {
            message: format!("archive exceeds maximum entry count ({MAX_ENTRY_COUNT})"),
        });
    }
    Ok(())
}

/// Reject anything that is neither a regular file nor a directory.
/// Entries written without Unix mode bits count as regular.
fn check_entry_type(name: &str, unix_mode: Option<u32>, is_dir: bool) -> PluginResult<()> {
    let Some(mode) = unix_mode else {
        return Ok(());
    };
    let kind = mode & S_IFMT;
    if kind == 0 || kind == S_IFREG || (kind == S_IFDIR && is_dir) {
        return Ok(());
    }
    let reason = if kind == 0o120_000 {
        "symbolic links are not allowed".to_string()
    } else {
        format!("entry type {kind:o} is not allowed")
    };
    Err(PluginError::UnsafeEntry {
        path: name.to_string(),
        reason,
    })
}

/// Validate an entry name and return it relative to the package root,
/// with `.` components removed.
fn validate_entry_path(name: &str) -> PluginResult<PathBuf> {
    let traversal = || PluginError::PathTraversal {
        path: name.to_string(),
    };
    if name.contains('\\') || name.contains('\0') {
        return Err(traversal());
    }
    let path = Path::new(name);
    if path.is_absolute() {
        return Err(traversal());
    }

    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {},
            Component::ParentDir | Component::Prefix(_) | Component::RootDir => {
                return Err(traversal());
            },
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(PluginError::MalformedPackage(format!(
            "archive entry with empty path: {name:?}"
        )));
    }
    Ok(relative)
}

/// Catch escapes through pre-existing symlinks that component checks
/// cannot see.
fn ensure_within(dest: &Path, target: &Path, name: &str) -> PluginResult<()> {
    let mut probe = target.parent();
    while let Some(dir) = probe {
        if let Ok(canonical) = dir.canonicalize() {
            if !canonical.starts_with(dest) {
                return Err(PluginError::PathTraversal {
                    path: name.to_string(),
                });
            }
            return Ok(());
        }
        probe = dir.parent();
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    use super::fixtures::{manifest, zip_bytes};
    use super::*;

    #[test]
    fn test_inspect_finds_manifest_and_binary() {
        let m = manifest("demo", "");
        let bytes = zip_bytes(&[
            ("plugin-config.yaml", &m),
            ("demo", b"#!/bin/sh\n"),
            ("static/", b""),
            ("static/index.html", b"<html/>"),
        ]);
        let layout = inspect(&bytes).unwrap();
        assert_eq!(layout.manifest, m);
        assert_eq!(layout.binary_entry().unwrap(), Path::new("demo"));
        assert_eq!(layout.entry_count, 4);
    }

    #[test]
    fn test_binary_detection_rules() {
        assert!(is_binary_candidate(Path::new("demo")));
        assert!(is_binary_candidate(Path::new("demo.exe")));
        assert!(is_binary_candidate(Path::new("bin/demo.sh")));
        assert!(is_binary_candidate(Path::new("pkg/bin/tool.bin")));
        assert!(!is_binary_candidate(Path::new("README.md")));
        assert!(!is_binary_candidate(Path::new(".gitkeep")));
        assert!(!is_binary_candidate(Path::new("plugin-config.yaml")));
        assert!(!is_binary_candidate(Path::new("binaries/readme.txt")));
    }

    #[test]
    fn test_missing_manifest() {
        let bytes = zip_bytes(&[("demo", b"bin")]);
        let err = inspect(&bytes).unwrap_err();
        assert!(matches!(err, PluginError::MalformedPackage(m) if m.contains("plugin-config.yaml")));
    }

    #[test]
    fn test_nested_manifest_is_not_root_manifest() {
        let m = manifest("demo", "");
        let bytes = zip_bytes(&[("sub/plugin-config.yaml", &m), ("demo", b"bin")]);
        assert!(matches!(
            inspect(&bytes),
            Err(PluginError::MalformedPackage(_))
        ));
    }

    #[test]
    fn test_multiple_binaries_rejected() {
        let m = manifest("demo", "");
        let bytes = zip_bytes(&[("plugin-config.yaml", &m), ("a", b"1"), ("b.exe", b"2")]);
        let layout = inspect(&bytes).unwrap();
        let err = layout.binary_entry().unwrap_err();
        assert!(err.to_string().contains("exactly one executable"));
    }

    #[test]
    fn test_no_binary_rejected() {
        let m = manifest("demo", "");
        let bytes = zip_bytes(&[("plugin-config.yaml", &m), ("notes.txt", b"")]);
        let layout = inspect(&bytes).unwrap();
        assert!(layout.binary_entry().is_err());
    }

    #[test]
    fn test_not_a_zip() {
        assert!(matches!(
            inspect(b"definitely not a zip"),
            Err(PluginError::MalformedPackage(_))
        ));
    }

    #[test]
    fn test_path_traversal_rejected() {
        let bytes = zip_bytes(&[("../evil", b"x")]);
        assert!(matches!(
            inspect(&bytes),
            Err(PluginError::PathTraversal { .. })
        ));
    }

    #[test]
    fn test_absolute_path_rejected() {
        assert!(matches!(
            validate_entry_path("/etc/passwd"),
            Err(PluginError::PathTraversal { .. })
        ));
        assert!(matches!(
            validate_entry_path("a\\..\\b"),
            Err(PluginError::PathTraversal { .. })
        ));
        assert_eq!(
            validate_entry_path("./a/./b").unwrap(),
            PathBuf::from("a/b")
        );
    }

    #[test]
    fn test_symlink_rejected() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.add_symlink("link", "/etc/passwd", options).unwrap();
        let bytes = writer.finish().unwrap().into_inner();
        assert!(matches!(
            inspect(&bytes),
            Err(PluginError::UnsafeEntry { .. })
        ));
    }

    #[test]
    fn test_extract_writes_tree() {
        let m = manifest("demo", "");
        let bytes = zip_bytes(&[
            ("plugin-config.yaml", &m),
            ("demo", b"#!/bin/sh\n"),
            ("static/", b""),
            ("static/css/site.css", b"body{}"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let files = extract(&bytes, dir.path()).unwrap();
        assert_eq!(files, 3);
        assert_eq!(
            std::fs::read(dir.path().join("static/css/site.css")).unwrap(),
            b"body{}"
        );
    }

    #[test]
    fn test_extract_empty_archive() {
        let bytes = zip_bytes(&[("only-dir/", b"")]);
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            extract(&bytes, dir.path()),
            Err(PluginError::Extraction { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_extract_refuses_existing_symlink_escape() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();

        let bytes = zip_bytes(&[("escape/payload", b"x")]);
        assert!(matches!(
            extract(&bytes, dir.path()),
            Err(PluginError::PathTraversal { .. })
        ));
        assert!(!outside.path().join("payload").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_mark_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"#!/bin/sh\n").unwrap();
        mark_executable(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
