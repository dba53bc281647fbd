//! The top-level error taxonomy (§7) and its mapping to process exit codes (§6).

use crate::styling::{error_message, hint_message};

/// A single pre-completion hook failure, with placeholders already resolved.
#[derive(Debug, Clone)]
pub struct HookFailure {
    pub hook_name: String,
    pub message: String,
}

/// Structured categories a forge/container/git error is mapped into, so the
/// sync loop can decide whether retrying next tick makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ExternalToolCategory {
    Auth,
    NotFound,
    RateLimited,
    Conflict,
    Other,
}

/// The error taxonomy named in §7, one variant per row.
#[derive(Debug)]
pub enum AgentTreeError {
    /// Pre-completion hooks blocked a stage transition; state is unchanged.
    Validation { failures: Vec<HookFailure> },
    /// Sidecar or resource-registry lock could not be acquired in time.
    ResourceLocked { resource: String, timeout_s: u64 },
    /// Port pool exhausted after a bounded scan.
    ResourceExhausted { resource: String },
    /// forge CLI, container runtime, or git returned a non-zero/structured failure.
    ExternalTool {
        category: ExternalToolCategory,
        tool: String,
        message: String,
    },
    /// A sidecar YAML record failed to parse.
    CorruptRecord { path: std::path::PathBuf, message: String },
    /// A post-start hook failed; the transition it followed already committed.
    NonFatalPostStart { hook_name: String, message: String },
}

impl AgentTreeError {
    /// Exit code contract from spec.md §6: 0 success, 2 validation-blocked,
    /// 3 resource conflict, 4 external-tool error. `Corrupt-record` and
    /// `Non-fatal-post-start` are logged, never propagated to the CLI exit
    /// path directly, so they default to the generic external-tool code.
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentTreeError::Validation { .. } => 2,
            AgentTreeError::ResourceLocked { .. } | AgentTreeError::ResourceExhausted { .. } => 3,
            AgentTreeError::ExternalTool { .. } => 4,
            AgentTreeError::CorruptRecord { .. } | AgentTreeError::NonFatalPostStart { .. } => 4,
        }
    }
}

impl std::fmt::Display for AgentTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentTreeError::Validation { failures } => {
                writeln!(f, "{}", error_message("Stage transition blocked"))?;
                for failure in failures {
                    write!(f, "\n  - {}: {}", failure.hook_name, failure.message)?;
                }
                Ok(())
            }
            AgentTreeError::ResourceLocked { resource, timeout_s } => {
                write!(
                    f,
                    "{}\n\n{}",
                    error_message(format!("Timed out waiting {timeout_s}s for lock on {resource}")),
                    hint_message("Another agt process is likely mid-sync; retry shortly")
                )
            }
            AgentTreeError::ResourceExhausted { resource } => {
                write!(f, "{}", error_message(format!("No free {resource} available")))
            }
            AgentTreeError::ExternalTool { category, tool, message } => {
                write!(f, "{}", error_message(format!("{tool} failed ({category}): {message}")))
            }
            AgentTreeError::CorruptRecord { path, message } => {
                write!(
                    f,
                    "{}",
                    error_message(format!("Failed to parse {}: {message}", path.display()))
                )
            }
            AgentTreeError::NonFatalPostStart { hook_name, message } => {
                write!(
                    f,
                    "{}",
                    hint_message(format!("post-start hook {hook_name} failed: {message}"))
                )
            }
        }
    }
}

impl std::error::Error for AgentTreeError {}
