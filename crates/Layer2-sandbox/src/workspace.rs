//! Execution environment builder
//!
//! Materializes a session's file snapshot into a fresh, uniquely named temporary
//! directory, diffs the directory against the snapshot after execution, and
//! removes it again. A [`SandboxWorkspace`] owns its directory: teardown runs
//! exactly once, either explicitly or when the workspace is dropped.

use crate::request::{FileSet, SessionId};
use ignore::WalkBuilder;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use terminus_foundation::{Error, Result};
use tracing::{debug, error};

/// Creates one-shot execution workspaces under a root directory
#[derive(Debug, Clone)]
pub struct WorkspaceBuilder {
    root: PathBuf,
}

impl WorkspaceBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh workspace holding `files`
    ///
    /// On any write failure the partially built directory is removed before the
    /// error is returned.
    pub async fn build(&self, session_id: SessionId, files: &FileSet) -> Result<SandboxWorkspace> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            Error::Workspace(format!(
                "Failed to create workspace root {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("terminus_session_{}_", session_id))
            .tempdir_in(&self.root)
            .map_err(|e| Error::Workspace(format!("Failed to create workspace: {}", e)))?;

        let workspace = SandboxWorkspace::new(dir);
        workspace.open_permissions()?;

        for (path, content) in files {
            // dropping `workspace` on error tears the directory down
            workspace.write_file(path, content).await?;
        }

        debug!(
            "Materialized {} file(s) into {}",
            files.len(),
            workspace.path().display()
        );
        Ok(workspace)
    }
}

/// A temporary directory holding the file tree of one execution
#[derive(Debug)]
pub struct SandboxWorkspace {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl SandboxWorkspace {
    fn new(dir: TempDir) -> Self {
        Self {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a snapshot path inside the workspace
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        Ok(self.path.join(normalize_relative(relative)?))
    }

    /// Write one file, creating parent directories as needed
    pub async fn write_file(&self, relative: &str, content: &str) -> Result<()> {
        let target = self.resolve(relative)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Workspace(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| Error::Workspace(format!("Failed to write {}: {}", relative, e)))
    }

    /// Files whose content is new or changed relative to `baseline`
    pub async fn diff(&self, baseline: &FileSet) -> FileSet {
        let path = self.path.clone();
        let baseline = baseline.clone();
        match tokio::task::spawn_blocking(move || diff_directory(&path, &baseline)).await {
            Ok(deltas) => deltas,
            Err(e) => {
                error!("Workspace diff task failed: {}", e);
                FileSet::new()
            }
        }
    }

    /// Remove the directory tree. Deletion errors are logged and swallowed
    pub fn teardown(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(dir) = self.dir.take() {
            match dir.close() {
                Ok(()) => debug!("Removed workspace {}", self.path.display()),
                Err(e) => error!("Failed to remove workspace {}: {}", self.path.display(), e),
            }
        }
    }

    /// Container runs use a non-root user; the directory must be traversable
    #[cfg(unix)]
    fn open_permissions(&self) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| Error::Workspace(format!("Failed to set permissions: {}", e)))
    }

    #[cfg(not(unix))]
    fn open_permissions(&self) -> Result<()> {
        Ok(())
    }
}

impl Drop for SandboxWorkspace {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Strip the leading slash and reject paths that escape the workspace
pub fn normalize_relative(path: &str) -> Result<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    let mut normalized = PathBuf::new();

    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::Workspace(format!(
                    "Path escapes the workspace: {}",
                    path
                )));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(Error::Workspace(format!("Invalid file path: '{}'", path)));
    }
    Ok(normalized)
}

/// Walk `root` and collect files that are new or differ from `baseline`
///
/// Keys are `/`-separated paths relative to `root`. Files that are not valid
/// UTF-8 are skipped.
pub fn diff_directory(root: &Path, baseline: &FileSet) -> FileSet {
    let baseline: FileSet = baseline
        .iter()
        .map(|(path, content)| (path.trim_start_matches('/').to_string(), content.clone()))
        .collect();

    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .hidden(false)
        .follow_links(false)
        .build();

    let mut deltas = FileSet::new();
    for entry in walker.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let content = match std::fs::read_to_string(entry.path()) {
            Ok(content) => content,
            Err(e) => {
                debug!("Skipping {} in diff: {}", key, e);
                continue;
            }
        };

        if baseline.get(&key) != Some(&content) {
            deltas.insert(key, content);
        }
    }

    deltas
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, &str)]) -> FileSet {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize_relative("/a.py").unwrap(), PathBuf::from("a.py"));
        assert_eq!(
            normalize_relative("src/./lib/mod.py").unwrap(),
            PathBuf::from("src/lib/mod.py")
        );
        assert!(normalize_relative("../etc/passwd").is_err());
        assert!(normalize_relative("src/../../x").is_err());
        assert!(normalize_relative("/").is_err());
    }

    #[tokio::test]
    async fn test_build_writes_nested_files() {
        let root = tempfile::tempdir().unwrap();
        let builder = WorkspaceBuilder::new(root.path());
        let workspace = builder
            .build(7, &files(&[("/a.py", "x=1"), ("pkg/util.py", "y=2")]))
            .await
            .unwrap();

        let name = workspace.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("terminus_session_7_"));
        assert_eq!(
            std::fs::read_to_string(workspace.path().join("a.py")).unwrap(),
            "x=1"
        );
        assert_eq!(
            std::fs::read_to_string(workspace.path().join("pkg/util.py")).unwrap(),
            "y=2"
        );
    }

    #[tokio::test]
    async fn test_workspaces_are_unique() {
        let root = tempfile::tempdir().unwrap();
        let builder = WorkspaceBuilder::new(root.path());
        let first = builder.build(1, &FileSet::new()).await.unwrap();
        let second = builder.build(1, &FileSet::new()).await.unwrap();
        assert_ne!(first.path(), second.path());
    }

    #[tokio::test]
    async fn test_failed_build_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let builder = WorkspaceBuilder::new(root.path());
        let result = builder
            .build(2, &files(&[("ok.py", "1"), ("../escape.py", "2")]))
            .await;

        assert!(matches!(result, Err(Error::Workspace(_))));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_and_drop_remove_directory() {
        let root = tempfile::tempdir().unwrap();
        let builder = WorkspaceBuilder::new(root.path());

        let workspace = builder.build(3, &files(&[("a.py", "x")])).await.unwrap();
        let path = workspace.path().to_path_buf();
        workspace.teardown();
        assert!(!path.exists());

        let path = {
            let workspace = builder.build(3, &FileSet::new()).await.unwrap();
            workspace.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_diff_reports_new_and_changed_files() {
        let root = tempfile::tempdir().unwrap();
        let baseline = files(&[("a.py", "x=1"), ("c.py", "same")]);
        let workspace = WorkspaceBuilder::new(root.path())
            .build(4, &baseline)
            .await
            .unwrap();

        workspace.write_file("a.py", "x=2").await.unwrap();
        workspace.write_file("sub/b.py", "print('b')").await.unwrap();
        std::fs::write(workspace.path().join("blob.bin"), [0xff, 0xfe, 0x00]).unwrap();

        let deltas = workspace.diff(&baseline).await;
        assert_eq!(
            deltas,
            files(&[("a.py", "x=2"), ("sub/b.py", "print('b')")])
        );
    }

    #[test]
    fn test_diff_matches_slash_prefixed_baseline() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "x=1").unwrap();
        let deltas = diff_directory(dir.path(), &files(&[("/a.py", "x=1")]));
        assert!(deltas.is_empty());
    }
}
