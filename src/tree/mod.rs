//! Read-only virtual file trees.
//!
//! A build's published artifacts are exposed as a [`VirtualTree`]: a finite,
//! re-scannable set of leaf files addressed by path fragments relative to
//! the tree root. The engine never writes through this interface.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

/// A read-only tree of leaf files.
///
/// `files` must be deterministic for an unchanged tree; it is re-invoked
/// freely (re-scan is cheap relative to the copies that follow).
pub trait VirtualTree: Send + Sync {
    /// Every leaf file under the root as ordered path fragments, root
    /// first. Directories are not listed.
    fn files(&self) -> io::Result<Vec<Vec<String>>>;

    /// Open one file for reading.
    fn open(&self, fragments: &[String]) -> io::Result<Box<dyn Read + Send + '_>>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.files()?.is_empty())
    }
}

/// On-disk tree rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsTree {
    root: PathBuf,
}

impl FsTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, fragments: &[String]) -> PathBuf {
        let mut path = self.root.clone();
        for fragment in fragments {
            path.push(fragment);
        }
        path
    }
}

impl VirtualTree for FsTree {
    fn files(&self) -> io::Result<Vec<Vec<String>>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(io::Error::other)?;
            let fragments: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            files.push(fragments);
        }
        Ok(files)
    }

    fn open(&self, fragments: &[String]) -> io::Result<Box<dyn Read + Send + '_>> {
        let file = std::fs::File::open(self.resolve(fragments))?;
        Ok(Box::new(file))
    }
}

/// In-memory tree keyed by path fragments, mainly for tests and for hosts
/// that stage artifacts off-disk.
#[derive(Debug, Clone, Default)]
pub struct MemTree {
    entries: BTreeMap<Vec<String>, Vec<u8>>,
}

impl MemTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file at a slash-separated relative path.
    pub fn with_file(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        let fragments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self.entries.insert(fragments, contents.into());
        self
    }

    pub fn into_tree(self) -> Arc<dyn VirtualTree> {
        Arc::new(self)
    }
}

impl VirtualTree for MemTree {
    fn files(&self) -> io::Result<Vec<Vec<String>>> {
        Ok(self.entries.keys().cloned().collect())
    }

    fn open(&self, fragments: &[String]) -> io::Result<Box<dyn Read + Send + '_>> {
        match self.entries.get(fragments) {
            Some(bytes) => Ok(Box::new(io::Cursor::new(bytes.clone()))),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such file: {}", fragments.join("/")),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_mem_tree_lists_and_reads() {
        let tree = MemTree::new()
            .with_file("a.txt", "v1")
            .with_file("dir/b.txt", "v2");

        let files = tree.files().unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.contains(&vec!["a.txt".to_string()]));
        assert!(files.contains(&vec!["dir".to_string(), "b.txt".to_string()]));

        let mut contents = String::new();
        tree.open(&["a.txt".to_string()])
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "v1");
    }

    #[test]
    fn test_mem_tree_open_missing() {
        let tree = MemTree::new();
        let Err(err) = tree.open(&["missing".to_string()]) else {
            panic!("expected opening a missing file to fail");
        };
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_fs_tree_walk_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("z.txt"), "z").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("sub/inner.txt"), "i").unwrap();

        let tree = FsTree::new(dir.path());
        let first = tree.files().unwrap();
        let second = tree.files().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        assert!(first.contains(&vec!["sub".to_string(), "inner.txt".to_string()]));
    }

    #[test]
    fn test_fs_tree_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tree = FsTree::new(dir.path().join("nope"));
        assert!(tree.files().unwrap().is_empty());
        assert!(tree.is_empty().unwrap());
    }
}
