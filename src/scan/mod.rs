//! FileSet scanner over a virtual tree.
//!
//! Include and exclude patterns are Ant-style globs: `**` crosses path
//! segments, `*` stays within one, and comma or whitespace separated
//! patterns form an OR-set. A file is selected iff it matches at least one
//! include pattern and no exclude pattern.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::tree::VirtualTree;

/// Scanner errors. Pattern errors are configuration errors and are
/// surfaced at configuration time where possible.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("invalid glob pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: globset::Error,
    },

    #[error("empty include pattern set")]
    EmptyIncludes,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A file selected by a scan, addressed by its path fragments from the
/// tree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub fragments: Vec<String>,
}

impl ScannedFile {
    /// The base file name (last fragment).
    pub fn file_name(&self) -> &str {
        self.fragments.last().map(String::as_str).unwrap_or("")
    }

    /// Slash-joined relative path.
    pub fn relative_path(&self) -> String {
        self.fragments.join("/")
    }
}

/// Compiled include/exclude pattern pair.
#[derive(Debug)]
pub struct FileSet {
    includes: GlobSet,
    excludes: GlobSet,
}

impl FileSet {
    /// Compile a file set from raw pattern strings. An empty or
    /// whitespace-only include string is rejected; callers substitute the
    /// `**` default before getting here.
    pub fn new(includes: &str, excludes: Option<&str>) -> Result<Self, ScanError> {
        let include_patterns = split_patterns(includes);
        if include_patterns.is_empty() {
            return Err(ScanError::EmptyIncludes);
        }
        Ok(Self {
            includes: compile(&include_patterns)?,
            excludes: compile(&excludes.map(split_patterns).unwrap_or_default())?,
        })
    }

    /// Whether a relative path is selected by this file set.
    pub fn selects(&self, relative_path: &str) -> bool {
        self.includes.is_match(relative_path) && !self.excludes.is_match(relative_path)
    }

    /// Scan a tree, yielding every matching leaf file in the tree's own
    /// deterministic order.
    pub fn scan(&self, tree: &dyn VirtualTree) -> Result<Vec<ScannedFile>, ScanError> {
        let mut matched = Vec::new();
        for fragments in tree.files()? {
            let path = fragments.join("/");
            if self.selects(&path) {
                matched.push(ScannedFile { fragments });
            }
        }
        Ok(matched)
    }
}

/// Split a raw pattern string into its OR-set.
fn split_patterns(raw: &str) -> Vec<String> {
    raw.split([',', ' ', '\t', '\n'])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(normalize)
        .collect()
}

/// Ant semantics: a pattern ending in `/` selects the whole directory.
fn normalize(pattern: &str) -> String {
    if let Some(dir) = pattern.strip_suffix('/') {
        format!("{dir}/**")
    } else {
        pattern.to_string()
    }
}

fn compile(patterns: &[String]) -> Result<GlobSet, ScanError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|source| ScanError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|source| ScanError::InvalidPattern {
            pattern: patterns.join(","),
            source,
        })
}
