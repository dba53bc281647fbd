//! Git error types and formatting.

use std::path::PathBuf;

use color_print::cformat;

use crate::styling::{error_message, hint_message};

#[derive(Debug)]
pub enum GitError {
    /// Generic error, already formatted for display.
    CommandFailed(String),
    /// Raw message that still needs emoji/color formatting.
    Other { message: String },
    /// Repository is in detached HEAD state.
    DetachedHead { action: Option<String> },
    /// Not inside any worktree of the repository.
    NotInWorktree { action: Option<String> },
    /// No worktree found for branch.
    NoWorktreeFound { branch: String },
    /// Worktree path already exists on the filesystem.
    WorktreePathExists { path: PathBuf },
    /// Creating a worktree failed.
    WorktreeCreationFailed {
        branch: String,
        base_branch: Option<String>,
        error: String,
    },
    /// Removing a worktree failed.
    WorktreeRemovalFailed {
        branch: String,
        path: PathBuf,
        error: String,
    },
}

impl GitError {
    pub fn message(msg: impl Into<String>) -> Self {
        GitError::Other {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for GitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitError::CommandFailed(msg) => write!(f, "{msg}"),
            GitError::Other { message } => write!(f, "{}", error_message(message)),
            GitError::DetachedHead { action } => {
                let suffix = action
                    .as_ref()
                    .map(|a| format!(" (needed to {a})"))
                    .unwrap_or_default();
                write!(
                    f,
                    "{}\n\n{}",
                    error_message(format!("Not on a branch (detached HEAD){suffix}")),
                    hint_message("Check out a branch and retry")
                )
            }
            GitError::NotInWorktree { action } => {
                let suffix = action
                    .as_ref()
                    .map(|a| format!(" (needed to {a})"))
                    .unwrap_or_default();
                write!(f, "{}", error_message(format!("Not inside a worktree{suffix}")))
            }
            GitError::NoWorktreeFound { branch } => {
                write!(
                    f,
                    "{}",
                    error_message(cformat!("No worktree found for branch <bold>{branch}</>"))
                )
            }
            GitError::WorktreePathExists { path } => {
                write!(
                    f,
                    "{}\n\n{}",
                    error_message(cformat!("Directory already exists: <bold>{}</>", path.display())),
                    hint_message("Remove the directory or reuse the existing worktree")
                )
            }
            GitError::WorktreeCreationFailed {
                branch,
                base_branch,
                error,
            } => {
                let base_suffix = base_branch
                    .as_ref()
                    .map(|base| cformat!(" from base <bold>{base}</>"))
                    .unwrap_or_default();
                write!(
                    f,
                    "{}: {error}",
                    error_message(cformat!(
                        "Failed to create worktree for <bold>{branch}</>{base_suffix}"
                    ))
                )
            }
            GitError::WorktreeRemovalFailed {
                branch,
                path,
                error,
            } => {
                write!(
                    f,
                    "{}: {error}",
                    error_message(cformat!(
                        "Failed to remove worktree for <bold>{branch}</> at <bold>{}</>",
                        path.display()
                    ))
                )
            }
        }
    }
}

impl std::error::Error for GitError {}
