use std::path::{Path, PathBuf};

/// Current registry file format. Incremented on incompatible changes.
pub const REGISTRY_FORMAT_VERSION: u32 = 1;

/// Directory layout of the envlock data root.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn registry_file(&self) -> PathBuf {
        self.root.join("projects.json")
    }

    pub fn initialize(&self) -> Result<(), std::io::Error> {
        std::fs::create_dir_all(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_correct() {
        let layout = StoreLayout::new("/tmp/envlock-test");
        assert_eq!(layout.root(), Path::new("/tmp/envlock-test"));
        assert_eq!(
            layout.registry_file(),
            PathBuf::from("/tmp/envlock-test/projects.json")
        );
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path().join("data"));
        layout.initialize().unwrap();
        layout.initialize().unwrap();
        assert!(layout.root().is_dir());
    }
}
