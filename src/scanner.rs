use crate::error::Result;
use crate::ipa::{extract_metadata, AppMetadata};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};

pub const IPA_EXTENSION: &str = "ipa";

/// One discovered application package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub bundle_id: String,
    pub version: String,
    pub build_number: Option<String>,
    pub display_name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl ArchiveInfo {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub fn is_ipa(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().eq_ignore_ascii_case(IPA_EXTENSION))
        .unwrap_or(false)
}

/// Metadata used when an archive's Info.plist cannot be read.
pub fn fallback_metadata(path: &Path) -> AppMetadata {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "app".to_string());

    AppMetadata {
        bundle_id: format!("com.unknown.{}", stem),
        version: "1.0.0".to_string(),
        display_name: stem,
        build_number: Some("1".to_string()),
    }
}

/// Stats a single archive and reads its metadata, substituting fallback
/// metadata if extraction fails. Only stat failures are returned as errors.
pub fn inspect_archive<P: AsRef<Path>>(path: P) -> Result<ArchiveInfo> {
    let path = path.as_ref();
    let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let stat = fs::metadata(&path)?;

    let metadata = match extract_metadata(&path) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "could not read app metadata, using fallback"
            );
            fallback_metadata(&path)
        }
    };

    Ok(ArchiveInfo {
        bundle_id: metadata.bundle_id,
        version: metadata.version,
        build_number: metadata.build_number,
        display_name: metadata.display_name,
        size: stat.len(),
        modified: DateTime::<Utc>::from(stat.modified()?),
        path,
    })
}

/// Every `.ipa` directly inside `dir`, newest first. Archives modified at
/// the same instant keep file-name order.
pub fn scan_dir<P: AsRef<Path>>(dir: P) -> Result<Vec<ArchiveInfo>> {
    let dir = dir.as_ref();

    let mut candidates = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !is_ipa(&path) {
            continue;
        }
        // Follows symlinks. Dangling links are skipped with a warning.
        if path.is_file() {
            candidates.push(path);
        } else if fs::symlink_metadata(&path).is_ok_and(|m| m.file_type().is_symlink()) {
            tracing::warn!(path = %path.display(), "skipping symlink that does not point to a file");
        }
    }
    candidates.sort();

    let mut archives = Vec::with_capacity(candidates.len());
    for path in candidates {
        match inspect_archive(&path) {
            Ok(info) => {
                tracing::debug!(
                    path = %info.path.display(),
                    bundle_id = %info.bundle_id,
                    version = %info.version,
                    "found archive"
                );
                archives.push(info);
            }
            Err(e) => {
                // Vanished or unreadable between listing and stat.
                tracing::warn!(path = %path.display(), error = %e, "skipping archive");
            }
        }
    }

    archives.sort_by_key(|a| Reverse(a.modified));
    Ok(archives)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_uses_file_stem() {
        let m = fallback_metadata(Path::new("/tmp/MyApp.ipa"));
        assert_eq!(m.bundle_id, "com.unknown.MyApp");
        assert_eq!(m.version, "1.0.0");
        assert_eq!(m.display_name, "MyApp");
        assert_eq!(m.build_number.as_deref(), Some("1"));
    }

    #[test]
    fn ipa_extension_is_case_insensitive() {
        assert!(is_ipa(Path::new("a.ipa")));
        assert!(is_ipa(Path::new("a.IPA")));
        assert!(!is_ipa(Path::new("a.zip")));
        assert!(!is_ipa(Path::new("ipa")));
    }
}
