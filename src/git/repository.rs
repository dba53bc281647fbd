//! Repository discovery and worktree primitives.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use dunce::canonicalize;
use normalize_path::NormalizePath;

use super::GitError;
use crate::shell_exec::Cmd;

/// A git repository, discovered once and reused for every worktree operation
/// AgentTree performs against it.
#[derive(Debug, Clone)]
pub struct Repository {
    /// Root of the primary worktree (where `.git` lives for non-bare repos).
    root: PathBuf,
}

/// One entry from `git worktree list --porcelain`, filtered to non-bare trees.
#[derive(Debug, Clone, PartialEq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
    pub bare: bool,
}

impl Repository {
    /// Discover the repository rooted at `path` (any directory inside it).
    pub fn at(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let output = Cmd::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(&path)
            .run()
            .with_context(|| format!("Failed to discover git repository at {}", path.display()))?;
        if !output.status.success() {
            bail!(
                "{} is not inside a git repository",
                path.display()
            );
        }
        let root = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        let root = canonicalize(&root).unwrap_or(root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run(&self, args: &[&str]) -> anyhow::Result<String> {
        let output = Cmd::new("git")
            .args(args.iter().copied())
            .current_dir(&self.root)
            .run()
            .with_context(|| format!("Failed to execute: git {}", args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{}", stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Current default branch (`main`/`master`), if one can be determined.
    pub fn default_branch(&self) -> Option<String> {
        let output = Cmd::new("git")
            .args(["symbolic-ref", "refs/remotes/origin/HEAD"])
            .current_dir(&self.root)
            .run()
            .ok()?;
        if output.status.success() {
            let s = String::from_utf8_lossy(&output.stdout);
            return s.trim().rsplit('/').next().map(String::from);
        }
        // No remote configured (common in test fixtures): fall back to the
        // currently checked-out branch of the primary worktree.
        let output = Cmd::new("git")
            .args(["branch", "--show-current"])
            .current_dir(&self.root)
            .run()
            .ok()?;
        if output.status.success() {
            let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !name.is_empty() {
                return Some(name);
            }
        }
        None
    }

    /// List worktrees, filtering out the bare repository entry.
    pub fn list_worktrees(&self) -> anyhow::Result<Vec<WorktreeInfo>> {
        let stdout = self.run(&["worktree", "list", "--porcelain"])?;
        Ok(parse_porcelain(&stdout)
            .into_iter()
            .filter(|wt| !wt.bare)
            .collect())
    }

    pub fn worktree_for_branch(&self, branch: &str) -> anyhow::Result<Option<PathBuf>> {
        Ok(self
            .list_worktrees()?
            .into_iter()
            .find(|wt| wt.branch.as_deref() == Some(branch))
            .map(|wt| wt.path))
    }

    pub fn worktree_at_path(&self, path: &Path) -> anyhow::Result<Option<WorktreeInfo>> {
        let normalized = path.normalize();
        Ok(self
            .list_worktrees()?
            .into_iter()
            .find(|wt| wt.path.normalize() == normalized))
    }

    /// Add a worktree at `path` on branch `branch`, branching from `base`.
    ///
    /// Reuses an existing worktree/branch pairing if one is already present
    /// at `path` (idempotent start, §8 "Idempotent start").
    pub fn add_worktree(&self, path: &Path, branch: &str, base: &str) -> anyhow::Result<PathBuf> {
        if let Some(existing) = self.worktree_at_path(path)? {
            if existing.branch.as_deref() == Some(branch) {
                return Ok(existing.path);
            }
            return Err(GitError::WorktreePathExists {
                path: path.to_path_buf(),
            }
            .into());
        }
        if path.exists() {
            return Err(GitError::WorktreePathExists {
                path: path.to_path_buf(),
            }
            .into());
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| GitError::message("Worktree path contains invalid UTF-8"))?;

        // Reuse the branch if it already exists (e.g. a step-back resumes work).
        let branch_exists = self
            .run(&["rev-parse", "--verify", "--quiet", branch])
            .is_ok();

        let result = if branch_exists {
            self.run(&["worktree", "add", path_str, branch])
        } else {
            self.run(&["worktree", "add", "-b", branch, path_str, base])
        };

        result.map_err(|e| GitError::WorktreeCreationFailed {
            branch: branch.to_string(),
            base_branch: Some(base.to_string()),
            error: e.to_string(),
        })?;

        Ok(canonicalize(path).unwrap_or_else(|_| path.to_path_buf()))
    }

    /// Hard reset the worktree at `path` to `origin/{base}` and clean untracked files.
    ///
    /// Purely destructive; only ever invoked on explicit request (§4.3).
    pub fn reset_worktree(&self, path: &Path, base: &str) -> anyhow::Result<()> {
        let run_in = |args: &[&str]| -> anyhow::Result<String> {
            let output = Cmd::new("git")
                .args(args.iter().copied())
                .current_dir(path)
                .run()
                .with_context(|| format!("Failed to execute: git {}", args.join(" ")))?;
            if !output.status.success() {
                bail!("{}", String::from_utf8_lossy(&output.stderr).trim());
            }
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        };

        run_in(&["fetch", "origin", base])?;
        run_in(&["checkout", base])?;
        run_in(&["reset", "--hard", &format!("origin/{base}")])?;
        run_in(&["clean", "-fd"])?;
        let task_md = path.join("TASK.md");
        if task_md.exists() {
            std::fs::remove_file(&task_md).ok();
        }
        Ok(())
    }

    /// `git worktree remove --force` followed by a best-effort directory delete.
    pub fn remove_worktree(&self, path: &Path, branch: &str) -> anyhow::Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| GitError::message("Worktree path contains invalid UTF-8"))?;
        self.run(&["worktree", "remove", "--force", path_str])
            .map_err(|e| GitError::WorktreeRemovalFailed {
                branch: branch.to_string(),
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;
        if path.exists() {
            std::fs::remove_dir_all(path).ok();
        }
        Ok(())
    }
}

/// Parse `git worktree list --porcelain` output.
fn parse_porcelain(stdout: &str) -> Vec<WorktreeInfo> {
    let mut result = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut head = String::new();
    let mut branch: Option<String> = None;
    let mut bare = false;

    let flush = |result: &mut Vec<WorktreeInfo>,
                 path: &mut Option<PathBuf>,
                 head: &mut String,
                 branch: &mut Option<String>,
                 bare: &mut bool| {
        if let Some(p) = path.take() {
            result.push(WorktreeInfo {
                path: p,
                head: std::mem::take(head),
                branch: branch.take(),
                bare: *bare,
            });
        }
        *bare = false;
    };

    for line in stdout.lines() {
        if line.is_empty() {
            flush(&mut result, &mut path, &mut head, &mut branch, &mut bare);
            continue;
        }
        if let Some(p) = line.strip_prefix("worktree ") {
            flush(&mut result, &mut path, &mut head, &mut branch, &mut bare);
            path = Some(PathBuf::from(p));
        } else if let Some(h) = line.strip_prefix("HEAD ") {
            head = h.to_string();
        } else if let Some(b) = line.strip_prefix("branch ") {
            branch = b.strip_prefix("refs/heads/").map(String::from);
        } else if line == "bare" {
            bare = true;
        }
    }
    flush(&mut result, &mut path, &mut head, &mut branch, &mut bare);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_porcelain_basic() {
        let stdout = "worktree /repo/main\nHEAD abc123\nbranch refs/heads/main\n\nworktree /repo/issue-001\nHEAD def456\nbranch refs/heads/issue-001\n\n";
        let worktrees = parse_porcelain(stdout);
        assert_eq!(worktrees.len(), 2);
        assert_eq!(worktrees[0].branch, Some("main".to_string()));
        assert_eq!(worktrees[1].path, PathBuf::from("/repo/issue-001"));
    }

    #[test]
    fn test_parse_porcelain_filters_bare() {
        let stdout = "worktree /repo\nbare\n\nworktree /repo/main\nHEAD abc\nbranch refs/heads/main\n\n";
        let all = parse_porcelain(stdout);
        assert_eq!(all.len(), 2);
        let non_bare: Vec<_> = all.into_iter().filter(|wt| !wt.bare).collect();
        assert_eq!(non_bare.len(), 1);
        assert_eq!(non_bare[0].branch.as_deref(), Some("main"));
    }

    #[test]
    fn test_parse_porcelain_detached() {
        let stdout = "worktree /repo/detached\nHEAD abc123\ndetached\n\n";
        let worktrees = parse_porcelain(stdout);
        assert_eq!(worktrees.len(), 1);
        assert_eq!(worktrees[0].branch, None);
    }
}
