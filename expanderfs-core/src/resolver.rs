//! Maps virtual-relative paths onto the two configured roots.

use std::path::{Component, Path, PathBuf};
use crate::error::{ProviderError, Result};
use crate::types::ResolvedRoots;

/// A relative path resolved against both roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub source: PathBuf,
    pub virtual_path: PathBuf,
}

/// Resolves virtual-relative paths. Holds no state beyond the two roots.
#[derive(Debug, Clone)]
pub struct PathResolver {
    roots: ResolvedRoots,
}

impl PathResolver {
    pub fn new(roots: ResolvedRoots) -> Self {
        Self { roots }
    }

    pub fn source_root(&self) -> &Path {
        &self.roots.source_root
    }

    pub fn virtualization_root(&self) -> &Path {
        &self.roots.virtualization_root
    }

    /// Joins `relative` onto both roots. No existence check is made here.
    pub fn resolve(&self, relative: &Path) -> ResolvedPath {
        ResolvedPath {
            source: self.resolve_source(relative),
            virtual_path: self.resolve_virtual(relative),
        }
    }

    /// Resolves a relative path to the source tree
    pub fn resolve_source(&self, relative: &Path) -> PathBuf {
        join_relative(&self.roots.source_root, relative)
    }

    /// Resolves a relative path to the virtualization root
    pub fn resolve_virtual(&self, relative: &Path) -> PathBuf {
        join_relative(&self.roots.virtualization_root, relative)
    }

    /// Rejects paths from the host that would escape the roots.
    pub fn check_relative(relative: &Path) -> Result<()> {
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                other => {
                    return Err(ProviderError::invalid_parameter(format!(
                        "path {} contains {:?}",
                        relative.display(),
                        other
                    )));
                }
            }
        }
        Ok(())
    }
}

// An empty relative path names the root itself.
fn join_relative(root: &Path, relative: &Path) -> PathBuf {
    if relative.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}
