//! Filesystem-backed resource fetcher.

use std::{
    io,
    path::{Component, Path, PathBuf},
};

use tether_core::ResourceFetcher;

/// Resolves remote asset references as paths under a root directory.
///
/// References are relative paths; absolute paths and `..` components are
/// refused so an asset can never name a file outside the root.
#[derive(Debug, Clone)]
pub struct DirectoryFetcher {
    root: PathBuf,
}

impl DirectoryFetcher {
    /// Fetch relative to `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, reference: &str) -> io::Result<PathBuf> {
        let relative = Path::new(reference);
        if relative.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("reference escapes asset directory: {reference}"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl ResourceFetcher for DirectoryFetcher {
    fn fetch(&self, reference: &str) -> io::Result<Vec<u8>> {
        let path = self.resolve(reference)?;
        tracing::debug!(path = %path.display(), "fetching asset");
        std::fs::read(path)
    }
}
