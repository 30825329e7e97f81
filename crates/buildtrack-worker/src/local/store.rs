//! Directory-backed build data and analysis store.

use async_trait::async_trait;
use buildtrack_core::{AnalysisStore, BuildDataFs, BuildDataSource, Error, Repo, Result, StoreClient};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Marker written by [`StoreClient::finish`] inside a sealed version.
pub const COMPLETE_MARKER: &str = ".complete";

/// Build data laid out as `<root>/<commit>/...`.
pub struct DirBuildData {
    root: PathBuf,
}

impl DirBuildData {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl BuildDataSource for DirBuildData {
    async fn open(&self, commit_id: &str) -> Result<Arc<dyn BuildDataFs>> {
        let dir = self.root.join(checked_relative(commit_id)?);
        if !tokio::fs::metadata(&dir).await?.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not a directory", dir.display()),
            )));
        }
        Ok(Arc::new(DirFs::new(dir)))
    }
}

/// Read-only view of one directory tree.
pub struct DirFs {
    root: PathBuf,
}

impl DirFs {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl BuildDataFs for DirFs {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    async fn list(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || walk_files(&root))
            .await
            .map_err(|e| Error::Internal(format!("build data walk panicked: {e}")))?
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.root.join(checked_relative(path)?)).await?)
    }
}

/// Relative `/`-separated paths of every regular file under `root`, following symlinks.
fn walk_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            let rel: Vec<_> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            files.push(rel.join("/"));
        }
    }
    files.sort();
    Ok(files)
}

/// Analysis store writing `<root>/<repo-slug>/<commit>/<path>`.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn version_dir(&self, repo: &str, commit_id: &str) -> PathBuf {
        self.root.join(Repo::new(repo).slug()).join(commit_id)
    }
}

#[async_trait]
impl AnalysisStore for DirStore {
    async fn connect(&self) -> Result<Arc<dyn StoreClient>> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(Arc::new(DirStoreClient {
            root: self.root.clone(),
        }))
    }
}

pub struct DirStoreClient {
    root: PathBuf,
}

impl DirStoreClient {
    fn version_dir(&self, repo: &str, commit_id: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join(Repo::new(repo).slug())
            .join(checked_relative(commit_id)?))
    }
}

#[async_trait]
impl StoreClient for DirStoreClient {
    async fn put(&self, repo: &str, commit_id: &str, path: &str, data: &[u8]) -> Result<()> {
        let dest = self
            .version_dir(repo, commit_id)?
            .join(checked_relative(path)?);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest, data).await?;
        tracing::debug!(path = %dest.display(), bytes = data.len(), "stored");
        Ok(())
    }

    async fn finish(&self, repo: &str, commit_id: &str) -> Result<()> {
        let dir = self.version_dir(repo, commit_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(COMPLETE_MARKER), chrono::Utc::now().to_rfc3339()).await?;
        Ok(())
    }
}

/// Reject absolute paths and any `..` so nothing escapes the root.
fn checked_relative(path: &str) -> Result<&Path> {
    let p = Path::new(path);
    let ok = !path.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(p)
    } else {
        Err(Error::Import(format!("refusing path outside store: {path}")))
    }
}
