//! Workspace/worktree cwd resolution (C6 `Start`).
//!
//! Trimmed from the teacher's `worktree::manager` (task-branch creation,
//! merge discipline, and write-path enforcement have no counterpart here —
//! workspace/worktree CRUD is out of scope, per spec §1). What's left is
//! the single thing `SessionService::start` actually needs: turning a
//! `workspace_id`/`worktree_id` binding into a real directory, grounded on
//! the teacher's `git2::Repository::open` idiom in
//! `create_worktree_blocking`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::store::Stores;

#[derive(Deserialize)]
struct WorkspaceRecord {
    #[allow(dead_code)]
    id: String,
    path: String,
}

#[derive(Deserialize)]
struct WorktreeRecord {
    #[allow(dead_code)]
    id: String,
    #[allow(dead_code)]
    workspace_id: String,
    path: String,
}

/// Resolves the directory a new session should run in.
///
/// An explicit `cwd` always wins. Otherwise `worktree_id` is preferred over
/// `workspace_id` (a worktree binding is more specific). Falls back to an
/// error if neither resolves to a record in the `kv` workspaces/worktrees
/// namespaces.
pub async fn resolve_cwd(
    stores: &Stores,
    explicit_cwd: Option<&str>,
    workspace_id: Option<&str>,
    worktree_id: Option<&str>,
) -> Result<String> {
    if let Some(cwd) = explicit_cwd {
        return Ok(cwd.to_string());
    }

    if let Some(id) = worktree_id {
        let raw = stores
            .kv()
            .get("worktrees", id)
            .await?
            .context("worktree not found")?;
        let record: WorktreeRecord = serde_json::from_value(raw)?;
        return Ok(record.path);
    }

    if let Some(id) = workspace_id {
        let raw = stores
            .kv()
            .get("workspaces", id)
            .await?
            .context("workspace not found")?;
        let record: WorkspaceRecord = serde_json::from_value(raw)?;
        return Ok(record.path);
    }

    bail!("start request supplied neither cwd, worktreeId, nor workspaceId")
}

/// Resolves the git repository root a `cwd` belongs to, walking up through
/// any worktree link to the main checkout. Used by Codex's `codexHome`
/// resolution when a session runs inside a linked worktree rather than the
/// primary clone.
pub fn effective_repo_path(cwd: &Path) -> Result<PathBuf> {
    let repo = git2::Repository::open(cwd).context("not a git repository")?;
    let root = if repo.is_worktree() {
        repo.commondir().parent().unwrap_or_else(|| repo.commondir()).to_path_buf()
    } else {
        repo.workdir().map(Path::to_path_buf).unwrap_or_else(|| cwd.to_path_buf())
    };
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn explicit_cwd_wins_over_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::new(dir.path()).await.unwrap();
        let resolved = resolve_cwd(&stores, Some("/tmp/explicit"), Some("ws1"), None)
            .await
            .unwrap();
        assert_eq!(resolved, "/tmp/explicit");
    }

    #[tokio::test]
    async fn missing_binding_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::new(dir.path()).await.unwrap();
        let err = resolve_cwd(&stores, None, None, None).await;
        assert!(err.is_err());
    }
}
