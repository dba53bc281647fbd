//! Sidecar repo manager (§4.2): the `_agenttree/` git repository holding
//! issue records, templates, skills and `state.yaml`, kept in sync with its
//! remote under a dedicated lock file.
//!
//! `sync()` is written as a small state machine of named steps rather than
//! one long function, the way the teacher's `expand_commands` is kept
//! separate from `prepare_project_commands`/`prepare_user_commands`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{AgentTreeError, ExternalToolCategory};
use crate::forge::ForgeClient;
use crate::shell_exec::Cmd;

const SYNC_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

const SKELETON_DIRS: &[&str] = &["issues", "templates", "skills"];
const GITIGNORE: &str = "*.lock\n";
const README: &str = "# AgentTree sidecar\n\nIssue records, templates, skills, and controller state for this project.\nManaged entirely by `agt`; do not edit by hand while agents are running.\n";

/// Owns the sidecar repo's local clone path.
pub struct SidecarRepo {
    root: PathBuf,
}

/// Held for the lifetime of one sync iteration so no other `agt` process
/// can interleave a fetch/rebase or commit/push in the middle of it.
pub struct SidecarLockGuard(std::fs::File);

impl SidecarRepo {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Acquire the sidecar's exclusive lock, held until the guard drops.
    /// Callers that need several locked operations in a row (the sync
    /// loop's fetch, reconcile, and commit+push as one atomic unit) should
    /// hold this guard across all of them rather than calling [`Self::sync`]
    /// and [`Self::commit`], which each acquire and release their own.
    pub fn lock(&self) -> Result<SidecarLockGuard, AgentTreeError> {
        self.lock_internal()
    }

    fn lock_internal(&self) -> Result<SidecarLockGuard, AgentTreeError> {
        let lock_path = self.root.join(".sync.lock");
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| AgentTreeError::ExternalTool {
                category: ExternalToolCategory::Other,
                tool: "fs".into(),
                message: format!("failed to open {}: {e}", lock_path.display()),
            })?;

        let deadline = Instant::now() + SYNC_LOCK_TIMEOUT;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(SidecarLockGuard(file)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(AgentTreeError::ResourceLocked {
                            resource: "_agenttree/.sync.lock".into(),
                            timeout_s: SYNC_LOCK_TIMEOUT.as_secs(),
                        });
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(AgentTreeError::ExternalTool {
                        category: ExternalToolCategory::Other,
                        tool: "fs".into(),
                        message: format!("failed to lock sidecar: {e}"),
                    });
                }
            }
        }
    }

    fn git(&self, args: &[&str]) -> Result<std::process::Output, AgentTreeError> {
        Cmd::new("git").args(args.iter().copied()).current_dir(&self.root).run().map_err(|e| {
            AgentTreeError::ExternalTool {
                category: ExternalToolCategory::Other,
                tool: "git".into(),
                message: format!("failed to run git {}: {e}", args.join(" ")),
            }
        })
    }

    fn require_success(&self, output: std::process::Output, context: &str) -> Result<String, AgentTreeError> {
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            let category = if stderr.to_ascii_lowercase().contains("conflict") {
                ExternalToolCategory::Conflict
            } else {
                ExternalToolCategory::Other
            };
            return Err(AgentTreeError::ExternalTool {
                category,
                tool: "git".into(),
                message: format!("{context}: {}", stderr.trim()),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Idempotently create the sidecar local clone and its remote (§4.2):
    /// detects an existing `.git`, otherwise creates `{project}-agents` via
    /// the forge client, clones it, and writes the skeleton.
    pub fn ensure_repo(&self, project: &str, forge: &ForgeClient, project_gitignore: &Path) -> Result<(), AgentTreeError> {
        let _lock = self.lock()?;

        if self.root.join(".git").exists() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.root).map_err(|e| AgentTreeError::ExternalTool {
            category: ExternalToolCategory::Other,
            tool: "fs".into(),
            message: format!("failed to create sidecar directory: {e}"),
        })?;

        let remote_name = format!("{project}-agents");
        let clone_url = forge.create_private_repo(&remote_name)?;

        let output = Cmd::new("git")
            .args(["clone", &clone_url, "."])
            .current_dir(&self.root)
            .run()
            .map_err(|e| AgentTreeError::ExternalTool {
                category: ExternalToolCategory::Other,
                tool: "git".into(),
                message: format!("failed to clone sidecar remote: {e}"),
            })?;
        self.require_success(output, "git clone")?;

        self.write_skeleton()?;
        self.append_project_gitignore(project_gitignore)?;
        self.commit("Initialize AgentTree sidecar")?;

        Ok(())
    }

    fn write_skeleton(&self) -> Result<(), AgentTreeError> {
        for dir in SKELETON_DIRS {
            std::fs::create_dir_all(self.root.join(dir)).map_err(|e| AgentTreeError::ExternalTool {
                category: ExternalToolCategory::Other,
                tool: "fs".into(),
                message: format!("failed to create {dir}: {e}"),
            })?;
        }
        let state_path = self.root.join("state.yaml");
        if !state_path.exists() {
            std::fs::write(&state_path, "agents: []\nports_in_use: []\nsync_counter: 0\n").ok();
        }
        let hook_state_path = self.root.join(".sync_hook_state.yaml");
        if !hook_state_path.exists() {
            std::fs::write(&hook_state_path, "{}\n").ok();
        }
        std::fs::write(self.root.join(".gitignore"), GITIGNORE).ok();
        let readme_path = self.root.join("README.md");
        if !readme_path.exists() {
            std::fs::write(&readme_path, README).ok();
        }
        Ok(())
    }

    /// Adds `_agenttree/` to the main repository's ignore file, once.
    fn append_project_gitignore(&self, project_gitignore: &Path) -> Result<(), AgentTreeError> {
        let existing = std::fs::read_to_string(project_gitignore).unwrap_or_default();
        if existing.lines().any(|l| l.trim() == "_agenttree/") {
            return Ok(());
        }
        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str("_agenttree/\n");
        std::fs::write(project_gitignore, updated).map_err(|e| AgentTreeError::ExternalTool {
            category: ExternalToolCategory::Other,
            tool: "fs".into(),
            message: format!("failed to update {}: {e}", project_gitignore.display()),
        })
    }

    /// Stage all, commit if non-empty, push. Never commits a clean tree.
    /// Acquires its own lock; use [`Self::commit_locked`] instead when the
    /// caller already holds a [`SidecarLockGuard`].
    pub fn commit(&self, message: &str) -> Result<(), AgentTreeError> {
        let _lock = self.lock()?;
        self.commit_locked(message)
    }

    /// Same as [`Self::commit`], but assumes the lock is already held by
    /// the caller (see [`Self::lock`]).
    pub fn commit_locked(&self, message: &str) -> Result<(), AgentTreeError> {
        self.require_success(self.git(&["add", "-A"])?, "git add")?;

        let status = self.require_success(self.git(&["status", "--porcelain"])?, "git status")?;
        if status.trim().is_empty() {
            return Ok(());
        }

        self.require_success(self.git(&["commit", "-q", "-m", message])?, "git commit")?;
        self.push()?;
        Ok(())
    }

    fn push(&self) -> Result<(), AgentTreeError> {
        match self.git(&["push"]) {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if stderr.contains("non-fast-forward") || stderr.contains("fetch first") {
                    // Retry once with a lease-force push (§4.2).
                    self.require_success(self.git(&["pull", "--rebase"])?, "git pull --rebase")?;
                    self.require_success(self.git(&["push", "--force-with-lease"])?, "git push --force-with-lease")?;
                    Ok(())
                } else {
                    self.require_success(output, "git push").map(|_| ())
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch + rebase local onto remote; push if `pull_only` is false and
    /// changes exist. Conflicts in sidecar files abort and surface (§4.2,
    /// §5: rare by design, issue directories are agent-exclusive). Acquires
    /// its own lock; use [`Self::sync_locked`] instead when the caller
    /// already holds a [`SidecarLockGuard`].
    pub fn sync(&self, pull_only: bool) -> Result<(), AgentTreeError> {
        let _lock = self.lock()?;
        self.sync_locked(pull_only)
    }

    /// Same as [`Self::sync`], but assumes the lock is already held by the
    /// caller (see [`Self::lock`]).
    pub fn sync_locked(&self, pull_only: bool) -> Result<(), AgentTreeError> {
        self.require_success(self.git(&["fetch", "origin"])?, "git fetch")?;
        let rebase = self.git(&["rebase", "origin/HEAD"])?;
        if !rebase.status.success() {
            self.require_success(self.git(&["rebase", "--abort"])?, "git rebase --abort").ok();
            let stderr = String::from_utf8_lossy(&rebase.stderr).into_owned();
            return Err(AgentTreeError::ExternalTool {
                category: ExternalToolCategory::Conflict,
                tool: "git".into(),
                message: format!("sidecar rebase conflict: {}", stderr.trim()),
            });
        }

        if !pull_only {
            self.push()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_bare_remote(dir: &Path) {
        Cmd::new("git").args(["init", "-q", "--bare", "-b", "main"]).current_dir(dir).run().unwrap();
    }

    fn clone_local(remote: &Path, dest: &Path) -> SidecarRepo {
        Cmd::new("git")
            .args(["clone", "-q", remote.to_str().unwrap(), dest.to_str().unwrap()])
            .run()
            .unwrap();
        Cmd::new("git").args(["config", "user.email", "t@example.com"]).current_dir(dest).run().unwrap();
        Cmd::new("git").args(["config", "user.name", "Test"]).current_dir(dest).run().unwrap();
        SidecarRepo::at(dest.to_path_buf())
    }

    #[test]
    fn write_skeleton_creates_expected_layout() {
        let remote_dir = tempfile::tempdir().unwrap();
        init_bare_remote(remote_dir.path());
        let clone_dir = tempfile::tempdir().unwrap();
        let clone_path = clone_dir.path().join("sidecar");
        let sidecar = clone_local(remote_dir.path(), &clone_path);

        sidecar.write_skeleton().unwrap();

        assert!(clone_path.join("issues").is_dir());
        assert!(clone_path.join("templates").is_dir());
        assert!(clone_path.join("skills").is_dir());
        assert!(clone_path.join("state.yaml").is_file());
        assert!(clone_path.join("README.md").is_file());
    }

    #[test]
    fn commit_is_noop_on_clean_tree() {
        let remote_dir = tempfile::tempdir().unwrap();
        init_bare_remote(remote_dir.path());
        let clone_dir = tempfile::tempdir().unwrap();
        let clone_path = clone_dir.path().join("sidecar");
        let sidecar = clone_local(remote_dir.path(), &clone_path);
        sidecar.write_skeleton().unwrap();
        sidecar.commit_locked("initial commit").unwrap();

        // Nothing changed since; a second commit call must be a no-op, not an error.
        sidecar.commit_locked("no-op commit").unwrap();
    }

    #[test]
    fn append_project_gitignore_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let gitignore = tmp.path().join(".gitignore");
        std::fs::write(&gitignore, "target/\n").unwrap();

        let remote_dir = tempfile::tempdir().unwrap();
        init_bare_remote(remote_dir.path());
        let clone_dir = tempfile::tempdir().unwrap();
        let clone_path = clone_dir.path().join("sidecar");
        let sidecar = clone_local(remote_dir.path(), &clone_path);

        sidecar.append_project_gitignore(&gitignore).unwrap();
        sidecar.append_project_gitignore(&gitignore).unwrap();

        let contents = std::fs::read_to_string(&gitignore).unwrap();
        assert_eq!(contents.matches("_agenttree/").count(), 1);
    }
}
