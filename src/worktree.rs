//! Worktree manager (§4.3): one worktree per live issue under
//! `{worktrees_dir}/{project}/{id}-{slug}`.
//!
//! A thin, issue-indexed narrowing of [`crate::git::Repository`]'s
//! general-purpose worktree API down to the three operations the stage
//! machine and sync loop actually invoke.

use std::path::PathBuf;

use crate::git::Repository;

/// Owns the project's `Repository` and the configured worktrees directory.
pub struct WorktreeManager {
    repo: Repository,
    worktrees_dir: PathBuf,
    project: String,
}

impl WorktreeManager {
    pub fn new(repo: Repository, worktrees_dir: PathBuf, project: String) -> Self {
        Self { repo, worktrees_dir, project }
    }

    fn path_for(&self, issue_id: &str, slug: &str) -> PathBuf {
        self.worktrees_dir.join(&self.project).join(format!("{issue_id}-{slug}"))
    }

    /// `create(issue) -> path`. Reuses an existing worktree/branch pairing
    /// when present, else `git worktree add -b {branch} {path} {base}`.
    pub fn create(&self, issue_id: &str, slug: &str, branch: &str, base: &str) -> anyhow::Result<PathBuf> {
        let path = self.path_for(issue_id, slug);
        self.repo.add_worktree(&path, branch, base)
    }

    /// Destructive reset to `origin/{base}`, only on explicit request.
    pub fn reset(&self, issue_id: &str, slug: &str, base: &str) -> anyhow::Result<()> {
        let path = self.path_for(issue_id, slug);
        self.repo.reset_worktree(&path, base)
    }

    pub fn remove(&self, issue_id: &str, slug: &str, branch: &str) -> anyhow::Result<()> {
        let path = self.path_for(issue_id, slug);
        self.repo.remove_worktree(&path, branch)
    }

    pub fn path_for_issue(&self, issue_id: &str, slug: &str) -> PathBuf {
        self.path_for(issue_id, slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell_exec::Cmd;

    fn init_repo(dir: &std::path::Path) -> Repository {
        Cmd::new("git").args(["init", "-q", "-b", "main"]).current_dir(dir).run().unwrap();
        Cmd::new("git").args(["config", "user.email", "t@example.com"]).current_dir(dir).run().unwrap();
        Cmd::new("git").args(["config", "user.name", "Test"]).current_dir(dir).run().unwrap();
        std::fs::write(dir.join("README.md"), "hi").unwrap();
        Cmd::new("git").args(["add", "."]).current_dir(dir).run().unwrap();
        Cmd::new("git").args(["commit", "-q", "-m", "init"]).current_dir(dir).run().unwrap();
        Repository::at(dir).unwrap()
    }

    #[test]
    fn create_adds_worktree_under_project_slug_path() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());
        let worktrees_root = tempfile::tempdir().unwrap();
        let manager = WorktreeManager::new(repo, worktrees_root.path().to_path_buf(), "demo".into());

        let path = manager.create("042", "fix-login", "issue-042", "main").unwrap();
        assert!(path.ends_with("demo/042-fix-login"));
        assert!(path.join(".git").exists());
    }

    #[test]
    fn create_is_idempotent_on_existing_worktree() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());
        let worktrees_root = tempfile::tempdir().unwrap();
        let manager = WorktreeManager::new(repo, worktrees_root.path().to_path_buf(), "demo".into());

        let first = manager.create("042", "fix-login", "issue-042", "main").unwrap();
        let second = manager.create("042", "fix-login", "issue-042", "main").unwrap();
        assert_eq!(first, second);
    }
}
