use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The engine's entire filesystem surface: readability checks, reads, and
/// directory listings. Gate evaluation and phase-output checks go through
/// this trait so tests can run against an in-memory map.
pub trait Store {
    fn is_readable(&self, path: &Path) -> bool;
    fn read(&self, path: &Path) -> std::io::Result<String>;
    fn list_dir(&self, path: &Path) -> std::io::Result<Vec<PathBuf>>;
}

// ---------------------------------------------------------------------------
// FsStore
// ---------------------------------------------------------------------------

/// Real filesystem, optionally rooted at a workspace directory.
#[derive(Debug, Clone, Default)]
pub struct FsStore {
    root: Option<PathBuf>,
}

impl FsStore {
    pub fn new() -> Self {
        Self { root: None }
    }

    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match (&self.root, path.is_absolute()) {
            (Some(root), false) => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl Store for FsStore {
    fn is_readable(&self, path: &Path) -> bool {
        let resolved = self.resolve(path);
        resolved.is_file() && std::fs::File::open(&resolved).is_ok()
            || resolved.is_dir() && std::fs::read_dir(&resolved).is_ok()
    }

    fn read(&self, path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(self.resolve(path))
    }

    fn list_dir(&self, path: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(self.resolve(path))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// MemStore
// ---------------------------------------------------------------------------

/// In-memory store for tests: path → content.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    files: BTreeMap<PathBuf, String>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    pub fn put(&mut self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.files.insert(path.into(), content.into());
    }
}

impl Store for MemStore {
    fn is_readable(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    fn read(&self, path: &Path) -> std::io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, path.display().to_string())
        })
    }

    fn list_dir(&self, path: &Path) -> std::io::Result<Vec<PathBuf>> {
        let entries: Vec<PathBuf> = self
            .files
            .keys()
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .collect();
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fs_store_reads_relative_to_root() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.md"), "# A").unwrap();

        let store = FsStore::rooted(dir.path());
        assert!(store.is_readable(Path::new("a.md")));
        assert_eq!(store.read(Path::new("a.md")).unwrap(), "# A");
        assert!(!store.is_readable(Path::new("missing.md")));
    }

    #[test]
    fn fs_store_lists_sorted() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.md"), "").unwrap();
        std::fs::write(dir.path().join("a.md"), "").unwrap();

        let store = FsStore::new();
        let entries = store.list_dir(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].ends_with("a.md"));
    }

    #[test]
    fn mem_store_basics() {
        let store = MemStore::new().with_file("docs/a.md", "# A");
        assert!(store.is_readable(Path::new("docs/a.md")));
        assert!(!store.is_readable(Path::new("docs/b.md")));
        assert_eq!(store.read(Path::new("docs/a.md")).unwrap(), "# A");
        assert_eq!(store.list_dir(Path::new("docs")).unwrap().len(), 1);
    }
}
