use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use super::error::ExecError;

const WORKSPACE_PREFIX: &str = "polyrun-";

/// Allocates ephemeral workspaces under a shared root directory.
///
/// Names are uuid-based, so concurrent executions never contend for a
/// directory. The manager holds no per-workspace state; ownership of the
/// returned [`Workspace`] is what guarantees release.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh, uniquely named workspace directory.
    pub fn acquire(&self) -> Result<Workspace, ExecError> {
        std::fs::create_dir_all(&self.root).map_err(|e| {
            ExecError::Workspace(format!(
                "failed to create workspace root {}: {e}",
                self.root.display()
            ))
        })?;

        let path = self
            .root
            .join(format!("{WORKSPACE_PREFIX}{}", Uuid::new_v4().simple()));
        // create_dir (not create_dir_all) so a name collision is an error
        std::fs::create_dir(&path).map_err(|e| {
            ExecError::Workspace(format!(
                "failed to create workspace dir {}: {e}",
                path.display()
            ))
        })?;

        tracing::debug!(workspace = %path.display(), "workspace acquired");
        Ok(Workspace {
            root: path,
            released: false,
        })
    }

    /// Release a workspace. Equivalent to [`Workspace::release`].
    pub fn release(&self, workspace: Workspace) {
        workspace.release();
    }
}

/// An exclusively owned workspace directory.
///
/// Released exactly once: either explicitly via [`Workspace::release`] or,
/// on any other exit path (error, panic, dropped future), by `Drop`.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn name(&self) -> &str {
        self.root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Resolve a workspace-relative path, rejecting anything that would
    /// escape the workspace root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, ExecError> {
        let rel = Path::new(relative);
        let rel = rel.strip_prefix("/").unwrap_or(rel);

        let mut normalized = PathBuf::new();
        for component in rel.components() {
            match component {
                Component::Normal(seg) => normalized.push(seg),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(ExecError::Workspace(format!(
                            "path escapes workspace: {relative}"
                        )));
                    }
                }
                _ => {}
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(ExecError::Workspace(format!("empty path: {relative:?}")));
        }
        Ok(self.root.join(normalized))
    }

    /// Write a scaffold file, creating parent directories as needed.
    pub async fn write_file(&self, relative: &str, contents: &str) -> Result<PathBuf, ExecError> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }

    /// Recursively delete the workspace. Never fails; a directory that is
    /// already gone counts as released.
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => tracing::debug!(workspace = %self.root.display(), "workspace released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                workspace = %self.root.display(),
                error = %e,
                "failed to remove workspace"
            ),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.remove();
    }
}
