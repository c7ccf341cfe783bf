//! Exclusion rules for source bundling
//!
//! Handles default exclusions and `.raiignore` files.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::Path;

/// Name of the per-project ignore file
pub const IGNORE_FILE: &str = ".raiignore";

/// Default patterns to exclude from bundles
const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    ".git/**",
    ".hg",
    ".hg/**",
    ".svn",
    ".svn/**",
    ".DS_Store",
    "**/.DS_Store",
    "**/__pycache__",
    "**/__pycache__/**",
];

/// Errors for exclusion rules
#[derive(Debug, thiserror::Error)]
pub enum ExcludeError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Glob pattern error: {0}")]
    GlobError(#[from] globset::Error),
}

/// Exclusion rules for filtering files
#[derive(Debug)]
pub struct ExcludeRules {
    patterns: Vec<String>,
    glob_set: GlobSet,
}

impl ExcludeRules {
    /// Create new exclusion rules with defaults
    pub fn new() -> Result<Self, ExcludeError> {
        Self::build(Vec::new())
    }

    fn build(patterns: Vec<String>) -> Result<Self, ExcludeError> {
        let mut builder = GlobSetBuilder::new();

        for pattern in DEFAULT_EXCLUDES {
            builder.add(Glob::new(pattern)?);
        }
        for pattern in &patterns {
            builder.add(Glob::new(pattern)?);
        }

        Ok(Self {
            patterns,
            glob_set: builder.build()?,
        })
    }

    /// Add patterns from an ignore file
    pub fn with_ignore_file(self, path: &Path) -> Result<Self, ExcludeError> {
        let contents = fs::read_to_string(path)?;
        let patterns: Vec<&str> = contents
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        self.with_patterns(&patterns)
    }

    /// Add additional patterns
    pub fn with_patterns(self, patterns: &[&str]) -> Result<Self, ExcludeError> {
        let mut all = self.patterns;
        for pattern in patterns {
            let pattern = pattern.trim_end_matches('/');
            if pattern.is_empty() {
                continue;
            }
            // A bare directory name also excludes everything beneath it
            all.push(pattern.to_string());
            all.push(format!("{}/**", pattern));
        }
        Self::build(all)
    }

    /// Check if a path should be excluded
    pub fn is_excluded(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        self.glob_set.is_match(path_str.as_ref())
    }
}
