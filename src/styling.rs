//! Terminal styling: emoji + color conventions shared by every user-facing
//! message, plus the `Style` constants needed for computed (non-`cformat!`)
//! output such as the log-gutter used to quote hook/command output.
//!
//! # Styling with color-print
//!
//! Use `cformat!` with HTML-like tags for user-facing messages:
//!
//! ```
//! use color_print::cformat;
//!
//! let msg = cformat!("<green>Success message</>");
//! let branch = "feature";
//! let msg = cformat!("<green>Removed branch <bold>{branch}</> successfully</>");
//!
//! // Semantic mapping:
//! // - Errors: <red>...</>
//! // - Warnings: <yellow>...</>
//! // - Hints: <dim>...</>
//! // - Progress: <cyan>...</>
//! // - Success: <green>...</>
//! ```
//!
//! ## stdout vs stderr
//!
//! - **stdout**: all agt output (messages, errors, warnings, data)
//! - **stderr**: all child process output (git, containers, forge CLI)
//! - Interactive prompts use stderr so they appear even when stdout is redirected

pub use anstream::{eprint, eprintln, print, println, stderr, stdout};

use anstyle::{AnsiColor, Color, Style};
use color_print::cformat;

// ============================================================================
// Programmatic Style Constants (for computed styles outside cformat!)
// ============================================================================

/// Gutter style for quoted content (hook output, command output, config).
pub const GUTTER: Style = Style::new().bg_color(Some(Color::Ansi(AnsiColor::BrightWhite)));

// ============================================================================
// Message Emojis
// ============================================================================

pub const PROGRESS_EMOJI: &str = "🔄";
pub const SUCCESS_EMOJI: &str = "✅";
pub const ERROR_EMOJI: &str = "❌";
pub const WARNING_EMOJI: &str = "🟡";
pub const HINT_EMOJI: &str = "💡";
pub const INFO_EMOJI: &str = "⚪";
pub const PROMPT_EMOJI: &str = "❓";

// ============================================================================
// Message Formatting Functions
// ============================================================================
//
// Canonical formatting for each message type. Used both for direct CLI output
// and inside `Display` impls (GitError, AgentTreeError) so every error looks
// the same regardless of where it surfaces.

/// Format an error message with emoji and red styling.
///
/// Content can include inner styling like `<bold>`:
/// ```
/// use color_print::cformat;
/// use agenttree::styling::error_message;
///
/// let name = "issue-042";
/// println!("{}", error_message(cformat!("Worktree <bold>{name}</> not found")));
/// ```
pub fn error_message(content: impl AsRef<str>) -> String {
    cformat!("{ERROR_EMOJI} <red>{}</>", content.as_ref())
}

/// Format a hint message with emoji and dim styling.
pub fn hint_message(content: impl AsRef<str>) -> String {
    cformat!("{HINT_EMOJI} <dim>{}</>", content.as_ref())
}

/// Format a warning message with emoji and yellow styling.
pub fn warning_message(content: impl AsRef<str>) -> String {
    cformat!("{WARNING_EMOJI} <yellow>{}</>", content.as_ref())
}

/// Format a success message with emoji and green styling.
pub fn success_message(content: impl AsRef<str>) -> String {
    cformat!("{SUCCESS_EMOJI} <green>{}</>", content.as_ref())
}

/// Format a progress message with emoji and cyan styling.
pub fn progress_message(content: impl AsRef<str>) -> String {
    cformat!("{PROGRESS_EMOJI} <cyan>{}</>", content.as_ref())
}

/// Format an info message with emoji (no color, neutral status).
pub fn info_message(content: impl AsRef<str>) -> String {
    cformat!("{INFO_EMOJI} {}", content.as_ref())
}

/// Format a section heading (cyan uppercase text, no emoji), with an
/// optional dim suffix such as a path.
///
/// ```
/// use agenttree::styling::format_heading;
///
/// let h = format_heading("ISSUES", None);
/// let h = format_heading("SIDECAR", Some("~/agenttree/_agenttree"));
/// ```
pub fn format_heading(title: &str, suffix: Option<&str>) -> String {
    match suffix {
        Some(s) => cformat!("<cyan>{}</>  {}", title, s),
        None => cformat!("<cyan>{}</>", title),
    }
}

/// Prefix every line of `content` with the [`GUTTER`] style, for quoting
/// hook stdout/stderr and command output underneath a status line.
pub fn format_with_gutter(content: &str) -> String {
    content
        .lines()
        .map(|line| format!("{GUTTER} {GUTTER:#} {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
