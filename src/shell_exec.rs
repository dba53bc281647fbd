//! Cross-platform shell execution.
//!
//! Every external process AgentTree launches — git, the code-forge CLI, the
//! container runtime, tmux — goes through [`Cmd`] so invocations get
//! consistent debug logging and timing regardless of call site.

use std::io;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::sync::OnceLock;
use std::time::Instant;

/// Environment variable read by child-process spawners to suppress
/// re-entrant directive handling; cleared before exec so subprocesses never
/// inherit it.
pub const DIRECTIVE_FILE_ENV_VAR: &str = "AGENTTREE_DIRECTIVE_FILE";

/// A builder around [`std::process::Command`] with logging baked in.
///
/// ```no_run
/// use agenttree::shell_exec::Cmd;
/// let output = Cmd::new("git").args(["status"]).context("issue-042").run()?;
/// # Ok::<(), std::io::Error>(())
/// ```
pub struct Cmd {
    inner: Command,
    context: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<std::ffi::OsStr>) -> Self {
        let mut inner = Command::new(program);
        inner.env_remove(DIRECTIVE_FILE_ENV_VAR);
        Self {
            inner,
            context: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.inner.args(args);
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<std::path::Path>) -> Self {
        self.inner.current_dir(dir);
        self
    }

    pub fn env(mut self, key: impl AsRef<std::ffi::OsStr>, value: impl AsRef<std::ffi::OsStr>) -> Self {
        self.inner.env(key, value);
        self
    }

    /// Attach a short human-readable label (e.g. an issue id) shown in debug logs.
    pub fn context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    pub fn stdin_null(mut self) -> Self {
        self.inner.stdin(Stdio::null());
        self
    }

    /// Run the command, capturing stdout/stderr, and log timing at debug level.
    pub fn run(mut self) -> io::Result<Output> {
        let program = self.inner.get_program().to_string_lossy().into_owned();
        let args: Vec<_> = self
            .inner
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let cmd_str = if args.is_empty() {
            program
        } else {
            format!("{program} {}", args.join(" "))
        };

        match &self.context {
            Some(ctx) => log::debug!("$ {cmd_str} [{ctx}]"),
            None => log::debug!("$ {cmd_str}"),
        }

        let t0 = Instant::now();
        let result = self.inner.output();
        let dur_ms = t0.elapsed().as_secs_f64() * 1000.0;

        match &result {
            Ok(output) => log::debug!(
                "[agt-trace] cmd=\"{cmd_str}\" dur={dur_ms:.1}ms ok={}",
                output.status.success()
            ),
            Err(e) => log::debug!("[agt-trace] cmd=\"{cmd_str}\" dur={dur_ms:.1}ms err=\"{e}\""),
        }

        result
    }
}

/// Shell configuration for dispatching user-declared commands (§4.10).
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub is_posix: bool,
    pub name: String,
}

static SHELL_CONFIG: OnceLock<ShellConfig> = OnceLock::new();

impl ShellConfig {
    pub fn get() -> &'static ShellConfig {
        SHELL_CONFIG.get_or_init(detect_shell)
    }

    pub fn command(&self, shell_command: &str) -> Command {
        let mut cmd = Command::new(&self.executable);
        for arg in &self.args {
            cmd.arg(arg);
        }
        cmd.arg(shell_command);
        cmd
    }
}

#[cfg(unix)]
fn detect_shell() -> ShellConfig {
    ShellConfig {
        executable: PathBuf::from("sh"),
        args: vec!["-c".to_string()],
        is_posix: true,
        name: "sh".to_string(),
    }
}

#[cfg(windows)]
fn detect_shell() -> ShellConfig {
    ShellConfig {
        executable: PathBuf::from("powershell.exe"),
        args: vec!["-NoProfile".to_string(), "-Command".to_string()],
        is_posix: false,
        name: "PowerShell".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_config_is_available() {
        let config = ShellConfig::get();
        assert!(!config.name.is_empty());
        assert!(!config.args.is_empty());
    }

    #[test]
    fn test_cmd_run_echo() {
        let output = Cmd::new("echo").args(["hello"]).run().unwrap();
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));
    }

    #[test]
    fn test_cmd_context_does_not_panic() {
        let output = Cmd::new("echo").args(["hi"]).context("issue-001").run();
        assert!(output.is_ok());
    }
}
