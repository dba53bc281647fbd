//! Git operations needed by the worktree manager (§4.3).
//!
//! AgentTree only ever needs a narrow slice of git: discover the repo,
//! list/add/remove worktrees, and reset a worktree to a base branch. Branch
//! completion, sparse-checkout detection, remote-URL parsing and the rest of
//! a full git porcelain wrapper are out of scope.

mod error;
mod repository;

pub use error::GitError;
pub use repository::{Repository, WorktreeInfo};
