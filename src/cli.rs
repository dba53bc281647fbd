//! Argument parsing (§6 "Command surface"): `agt`'s subcommands, one per
//! entry in the stable external CLI the core exposes.
//!
//! Grounded on `cli.rs`'s `help_styles`/`build_command`/`version_str`
//! shape; AgentTree's surface is flatter than worktrunk's (no nested
//! `config`/`step` groups), so there is a single `Commands` enum rather
//! than a tree of subcommand structs.

use clap::builder::styling::{AnsiColor, Color, Styles};
use clap::{Parser, Subcommand};

use agenttree::issue::Priority;

fn help_styles() -> Styles {
    Styles::styled()
        .header(anstyle::Style::new().bold().fg_color(Some(Color::Ansi(AnsiColor::Green))))
        .usage(anstyle::Style::new().bold().fg_color(Some(Color::Ansi(AnsiColor::Green))))
        .literal(anstyle::Style::new().bold().fg_color(Some(Color::Ansi(AnsiColor::Cyan))))
        .placeholder(anstyle::Style::new().fg_color(Some(Color::Ansi(AnsiColor::Cyan))))
        .error(anstyle::Style::new().bold().fg_color(Some(Color::Ansi(AnsiColor::Red))))
        .valid(anstyle::Style::new().bold().fg_color(Some(Color::Ansi(AnsiColor::Green))))
        .invalid(anstyle::Style::new().bold().fg_color(Some(Color::Ansi(AnsiColor::Yellow))))
}

#[derive(Parser)]
#[command(name = "agt")]
#[command(about = "Orchestrates multiple AI coding agents working in parallel on one source repository")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(disable_help_subcommand = true)]
#[command(styles = help_styles())]
#[command(arg_required_else_help = true)]
#[command(after_long_help = "\
Getting started

  agt issue create \"Add dark mode\"    File a new issue in the sidecar
  agt start 042                       Allocate resources and launch an agent
  agt sync                            Run one controller reconciliation tick
  agt status                          Snapshot of registry, stages, ports

Docs: https://agenttree.dev")]
pub struct Cli {
    /// Working directory for this command
    #[arg(short = 'C', global = true, value_name = "path", help_heading = "Global Options")]
    pub directory: Option<std::path::PathBuf>,

    /// Project config file path (overrides AGENTTREE_CONFIG and the default lookup)
    #[arg(long, global = true, value_name = "path", help_heading = "Global Options")]
    pub config: Option<std::path::PathBuf>,

    /// Show commands and debug info
    #[arg(long, short = 'v', global = true, help_heading = "Global Options")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum IssueCommand {
    /// File a new issue in the sidecar, starting at the workflow's first stage
    Create {
        title: String,
        #[arg(long, value_enum, default_value = "medium")]
        priority: Priority,
        #[arg(long = "label")]
        labels: Vec<String>,
        #[arg(long = "blocked-by")]
        blocked_by: Vec<String>,
    },
    /// List issues, most recently created last
    List,
    /// Show one issue's full record, including history
    Show { id: String },
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, list, or show issues
    Issue {
        #[command(subcommand)]
        action: IssueCommand,
    },
    /// Allocate resources (port, worktree, container) and launch an agent session
    Start {
        id: String,
        /// Role to assign (default: the first entry under `[roles]`)
        #[arg(long)]
        role: Option<String>,
    },
    /// Run pre-completion hooks, transition to the next stage, run post-start hooks
    Advance { id: String },
    /// Same as advance, but permitted on human_review stages
    Approve { id: String },
    /// Execute a named entry from `commands:` inside the issue's container
    Run { id: String, command: String },
    /// Forward text to an issue's role session
    Send { id: String, text: String },
    /// Attach a terminal to an issue's session
    Attach {
        id: String,
        /// Role session to attach to (default: the issue's assigned role)
        role: Option<String>,
    },
    /// Stop and remove an issue's containers and sessions without transitioning its stage
    Kill { id: String },
    /// Run one tick of the controller reconciliation loop on demand
    Sync,
    /// Snapshot of the issue registry, stages, and port allocations
    Status,
    /// Generate shell completion scripts
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}
