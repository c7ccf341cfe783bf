//! Source bundling
//!
//! Packages the submitted directory into a deterministic tar archive:
//! sorted paths, zeroed timestamps and ownership, normalized modes. The
//! SHA-256 of the archive addresses the upload on the broker, so the same
//! tree always produces the same key.

mod exclude;

pub use exclude::{ExcludeError, ExcludeRules, IGNORE_FILE};

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tar::{Builder, Header};
use walkdir::WalkDir;

/// Errors for bundling operations
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Symlink escapes directory root: {path}")]
    SymlinkEscapesRoot { path: PathBuf },

    #[error("Exclude rules error: {0}")]
    ExcludeError(#[from] ExcludeError),

    #[error("Walk error: {0}")]
    WalkError(#[from] walkdir::Error),

    #[error("Path is not within directory root: {0}")]
    PathNotInRoot(PathBuf),

    #[error("Bundle size {actual_bytes} exceeds limit {limit_bytes}")]
    SizeExceeded { actual_bytes: u64, limit_bytes: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Directory,
    Symlink,
}

struct EntryInfo {
    kind: EntryKind,
    symlink_target: Option<PathBuf>,
}

/// Source bundler for creating deterministic tar archives
pub struct Bundler {
    root: PathBuf,
    exclude: ExcludeRules,
    max_bytes: Option<u64>,
}

impl Bundler {
    /// Create a bundler for the given root, honoring its `.raiignore` if present
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BundleError> {
        let root = root.into();
        let mut exclude = ExcludeRules::new()?;

        let ignore_file = root.join(IGNORE_FILE);
        if ignore_file.is_file() {
            exclude = exclude.with_ignore_file(&ignore_file)?;
        }

        Ok(Self {
            root,
            exclude,
            max_bytes: None,
        })
    }

    /// Set maximum bundle size in bytes; 0 means no limit
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = if max_bytes > 0 { Some(max_bytes) } else { None };
        self
    }

    fn collect_entries(&self) -> Result<BTreeMap<PathBuf, EntryInfo>, BundleError> {
        let mut entries = BTreeMap::new();
        let canonical_root = self.root.canonicalize()?;

        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter()
            .filter_entry(|e| {
                // Prune excluded directories instead of walking into them
                e.path()
                    .strip_prefix(&self.root)
                    .map(|rel| rel.as_os_str().is_empty() || !self.exclude.is_excluded(rel))
                    .unwrap_or(true)
            });

        for entry in walker {
            let entry = entry?;
            let path = entry.path();

            let rel_path = path
                .strip_prefix(&self.root)
                .map_err(|_| BundleError::PathNotInRoot(path.to_path_buf()))?;

            if rel_path.as_os_str().is_empty() {
                continue;
            }

            let file_type = entry.file_type();
            let info = if file_type.is_symlink() {
                let target = fs::read_link(path)?;
                let resolved = if target.is_absolute() {
                    target.clone()
                } else {
                    path.parent().unwrap_or(path).join(&target)
                };

                let canonical = resolved.canonicalize().unwrap_or(resolved);
                if !canonical.starts_with(&canonical_root) {
                    return Err(BundleError::SymlinkEscapesRoot {
                        path: path.to_path_buf(),
                    });
                }

                EntryInfo {
                    kind: EntryKind::Symlink,
                    symlink_target: Some(target),
                }
            } else if file_type.is_dir() {
                EntryInfo {
                    kind: EntryKind::Directory,
                    symlink_target: None,
                }
            } else {
                EntryInfo {
                    kind: EntryKind::File,
                    symlink_target: None,
                }
            };

            entries.insert(rel_path.to_path_buf(), info);
        }

        Ok(entries)
    }

    /// Create the canonical tar archive
    pub fn create_bundle(&self) -> Result<SourceBundle, BundleError> {
        let entries = self.collect_entries()?;

        let mut tar_buffer = Vec::new();
        let mut file_count = 0usize;

        {
            let mut builder = Builder::new(&mut tar_buffer);

            for (rel_path, info) in &entries {
                let full_path = self.root.join(rel_path);
                let mut header = Header::new_gnu();
                header.set_mtime(0);
                header.set_uid(0);
                header.set_gid(0);

                match (info.kind, info.symlink_target.as_ref()) {
                    (EntryKind::File, _) => {
                        let contents = fs::read(&full_path)?;
                        header.set_path(rel_path)?;
                        header.set_size(contents.len() as u64);
                        header.set_mode(if is_executable(&full_path) { 0o755 } else { 0o644 });
                        header.set_cksum();
                        builder.append(&header, contents.as_slice())?;
                        file_count += 1;
                    }
                    (EntryKind::Directory, _) => {
                        header.set_path(format!("{}/", rel_path.display()))?;
                        header.set_size(0);
                        header.set_mode(0o755);
                        header.set_entry_type(tar::EntryType::Directory);
                        header.set_cksum();
                        builder.append(&header, io::empty())?;
                    }
                    (EntryKind::Symlink, Some(target)) => {
                        header.set_path(rel_path)?;
                        header.set_size(0);
                        header.set_mode(0o777);
                        header.set_entry_type(tar::EntryType::Symlink);
                        header.set_link_name(target)?;
                        header.set_cksum();
                        builder.append(&header, io::empty())?;
                    }
                    (EntryKind::Symlink, None) => {
                        return Err(BundleError::PathNotInRoot(full_path));
                    }
                }
            }

            builder.finish()?;
        }

        let actual_size = tar_buffer.len() as u64;
        if let Some(limit) = self.max_bytes {
            if actual_size > limit {
                return Err(BundleError::SizeExceeded {
                    actual_bytes: actual_size,
                    limit_bytes: limit,
                });
            }
        }

        let sha256 = {
            let mut hasher = Sha256::new();
            hasher.update(&tar_buffer);
            hex::encode(hasher.finalize())
        };

        tracing::debug!(
            root = %self.root.display(),
            files = file_count,
            bytes = actual_size,
            sha256 = %sha256,
            "bundled source directory"
        );

        Ok(SourceBundle {
            tar_bytes: tar_buffer,
            sha256,
            file_count,
        })
    }
}

/// A packaged source directory
#[derive(Debug, Clone)]
pub struct SourceBundle {
    /// The canonical tar bytes (uncompressed)
    pub tar_bytes: Vec<u8>,
    /// SHA-256 hex of the tar bytes
    pub sha256: String,
    /// Number of regular files in the archive
    pub file_count: usize,
}

impl SourceBundle {
    pub fn size(&self) -> u64 {
        self.tar_bytes.len() as u64
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("rai_build.yml"), "rai:\n  version: 0.2\n").unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.cu"), "int main() {}\n").unwrap();
        dir
    }

    fn entry_names(bundle: &SourceBundle) -> Vec<String> {
        let mut archive = tar::Archive::new(bundle.tar_bytes.as_slice());
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let entry = e.unwrap();
                let name = entry.path().unwrap().to_string_lossy().to_string();
                name.trim_end_matches('/').to_string()
            })
            .collect()
    }

    #[test]
    fn test_bundle_is_deterministic() {
        let dir = project();
        let first = Bundler::new(dir.path()).unwrap().create_bundle().unwrap();
        let second = Bundler::new(dir.path()).unwrap().create_bundle().unwrap();

        assert_eq!(first.sha256, second.sha256);
        assert_eq!(first.tar_bytes, second.tar_bytes);
        assert_eq!(first.file_count, 2);
        assert_eq!(first.sha256.len(), 64);
    }

    #[test]
    fn test_content_change_changes_digest() {
        let dir = project();
        let before = Bundler::new(dir.path()).unwrap().create_bundle().unwrap();
        fs::write(dir.path().join("src/main.cu"), "int main() { return 1; }\n").unwrap();
        let after = Bundler::new(dir.path()).unwrap().create_bundle().unwrap();

        assert_ne!(before.sha256, after.sha256);
    }

    #[test]
    fn test_entries_sorted_and_vcs_excluded() {
        let dir = project();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();

        let bundle = Bundler::new(dir.path()).unwrap().create_bundle().unwrap();
        let names = entry_names(&bundle);

        assert_eq!(names, vec!["rai_build.yml", "src", "src/main.cu"]);
    }

    #[test]
    fn test_raiignore_respected() {
        let dir = project();
        fs::write(dir.path().join(IGNORE_FILE), "*.o\n").unwrap();
        fs::write(dir.path().join("src/main.o"), [0u8; 16]).unwrap();

        let bundle = Bundler::new(dir.path()).unwrap().create_bundle().unwrap();
        let names = entry_names(&bundle);

        assert!(names.contains(&IGNORE_FILE.to_string()));
        assert!(!names.iter().any(|n| n.ends_with(".o")));
    }

    #[test]
    fn test_size_limit() {
        let dir = project();
        let err = Bundler::new(dir.path())
            .unwrap()
            .with_max_bytes(16)
            .create_bundle()
            .unwrap_err();
        assert!(matches!(err, BundleError::SizeExceeded { limit_bytes: 16, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escaping_root_rejected() {
        let dir = project();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();

        let err = Bundler::new(dir.path()).unwrap().create_bundle().unwrap_err();
        assert!(matches!(err, BundleError::SymlinkEscapesRoot { .. }));
    }
}
