// src/catalog.rs - Printable file catalog rooted at the virtual sdcard directory
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Extensions accepted by recursive listings.
pub const VALID_GCODE_EXTS: [&str; 3] = ["gcode", "g", "gco"];

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Unable to get file list: {0}")]
    Unavailable(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Path relative to the catalog root, `/` separated.
    pub path: String,
    pub size: u64,
}

/// A catalog lookup result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    /// Name as listed by the catalog (original casing).
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct JobCatalog {
    root: PathBuf,
}

impl JobCatalog {
    /// Create a catalog over `root`. A leading `~/` is expanded against `$HOME`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: normalize(&expand_home(root.as_ref())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List printable files, sorted case-insensitively by relative path.
    ///
    /// Flat listings return regular files directly under the root, skipping
    /// dot files. Recursive listings follow symlinks and keep only known
    /// G-code extensions. Any I/O failure aborts the whole listing.
    pub async fn list(&self, recursive: bool) -> Result<Vec<CatalogEntry>, CatalogError> {
        let result = if recursive {
            self.list_recursive().await
        } else {
            self.list_flat().await
        };
        match result {
            Ok(mut files) => {
                files.sort_by_key(|f| f.path.to_lowercase());
                Ok(files)
            }
            Err(e) => {
                tracing::error!("Unable to list '{}': {}", self.root.display(), e);
                Err(CatalogError::Unavailable(e))
            }
        }
    }

    /// Resolve a requested name to a file in the catalog: exact match first,
    /// then case-insensitive.
    pub async fn resolve(&self, requested: &str, recursive: bool) -> Result<ResolvedFile, CatalogError> {
        let requested = requested.strip_prefix('/').unwrap_or(requested);
        let files = self.list(recursive).await?;
        let name = if files.iter().any(|f| f.path == requested) {
            requested.to_string()
        } else {
            let by_lower: HashMap<String, &str> = files
                .iter()
                .map(|f| (f.path.to_lowercase(), f.path.as_str()))
                .collect();
            match by_lower.get(&requested.to_lowercase()) {
                Some(name) => name.to_string(),
                None => return Err(CatalogError::FileNotFound(requested.to_string())),
            }
        };
        Ok(ResolvedFile {
            path: self.root.join(&name),
            name,
        })
    }

    async fn list_flat(&self) -> std::io::Result<Vec<CatalogEntry>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name_str) = file_name.to_str() else {
                tracing::warn!("Skipping non UTF-8 file name {:?}", file_name);
                continue;
            };
            if name_str.starts_with('.') {
                continue;
            }
            // follows symlinks, like a plain isfile check
            let Some(metadata) = target_metadata(&entry.path()).await? else {
                continue;
            };
            if metadata.is_file() {
                files.push(CatalogEntry {
                    path: name_str.to_string(),
                    size: metadata.len(),
                });
            }
        }
        Ok(files)
    }

    async fn list_recursive(&self) -> std::io::Result<Vec<CatalogEntry>> {
        let mut files = Vec::new();
        let mut visited = HashSet::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            if !visited.insert(fs::canonicalize(&dir).await?) {
                continue;
            }
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let Some(metadata) = target_metadata(&path).await? else {
                    continue;
                };
                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }
                let file_name = entry.file_name();
                let Some(name_str) = file_name.to_str() else {
                    continue;
                };
                if !has_gcode_extension(name_str) {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let parts: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                files.push(CatalogEntry {
                    path: parts.join("/"),
                    size: metadata.len(),
                });
            }
        }
        Ok(files)
    }
}

/// Extension test on the text after the last dot; a name without a dot is
/// compared whole.
pub fn has_gcode_extension(name: &str) -> bool {
    let ext = name.rsplit('.').next().unwrap_or(name);
    VALID_GCODE_EXTS.contains(&ext)
}

/// Metadata of what `path` points to. `None` for a dangling symlink.
async fn target_metadata(path: &Path) -> std::io::Result<Option<std::fs::Metadata>> {
    match fs::metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("Skipping broken link {}", path.display());
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_filter() {
        assert!(has_gcode_extension("part.gcode"));
        assert!(has_gcode_extension("part.g"));
        assert!(has_gcode_extension("part.gco"));
        assert!(!has_gcode_extension("part.GCODE"));
        assert!(!has_gcode_extension("notes.txt"));
    }

    #[test]
    fn root_is_normalized() {
        let catalog = JobCatalog::new("/srv/./gcodes/../prints/");
        assert_eq!(catalog.root(), Path::new("/srv/prints"));
    }
}
