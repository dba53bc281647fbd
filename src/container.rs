//! Container & session manager (§4.4): wraps a container runtime
//! (`docker`/`podman`/`nerdctl`) and a terminal multiplexer (`tmux`), both
//! external CLIs with no direct teacher wrapper.
//!
//! Detection follows `ci_status/mod.rs`'s `tool_available()` pattern;
//! dispatch follows `shell_exec.rs`/`commands/process.rs`'s captured,
//! non-interactive subprocess style.

use std::path::Path;

use crate::error::{AgentTreeError, ExternalToolCategory};
use crate::shell_exec::Cmd;

/// Supported container runtimes, tried in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ContainerRuntime {
    Docker,
    Podman,
    Nerdctl,
}

impl ContainerRuntime {
    fn binary(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
            ContainerRuntime::Nerdctl => "nerdctl",
        }
    }

    const ALL: [ContainerRuntime; 3] =
        [ContainerRuntime::Docker, ContainerRuntime::Podman, ContainerRuntime::Nerdctl];
}

fn tool_available(binary: &str) -> bool {
    Cmd::new(binary).args(["--version"]).run().map(|o| o.status.success()).unwrap_or(false)
}

/// A started container's handle, returned by `start`.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub name: String,
}

/// Mount spec: host path -> container path.
#[derive(Debug, Clone)]
pub struct Mount {
    pub host_path: std::path::PathBuf,
    pub container_path: String,
}

impl Mount {
    pub fn workspace(host_path: impl Into<std::path::PathBuf>) -> Self {
        Self { host_path: host_path.into(), container_path: "/workspace".into() }
    }
}

fn no_runtime_error() -> AgentTreeError {
    AgentTreeError::ExternalTool {
        category: ExternalToolCategory::NotFound,
        tool: "container-runtime".into(),
        message:
            "no container runtime found; install one of: docker, podman, nerdctl".into(),
    }
}

/// Detects and wraps whichever runtime is installed.
pub struct ContainerManager {
    runtime: ContainerRuntime,
}

impl ContainerManager {
    /// Probe `ContainerRuntime::ALL` in order, returning the first available.
    pub fn detect() -> Result<Self, AgentTreeError> {
        ContainerRuntime::ALL
            .into_iter()
            .find(|r| tool_available(r.binary()))
            .map(|runtime| Self { runtime })
            .ok_or_else(no_runtime_error)
    }

    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime
    }

    fn cmd(&self, args: &[&str]) -> Cmd {
        Cmd::new(self.runtime.binary()).args(args.iter().copied())
    }

    fn run_checked(&self, args: &[&str], context: &str) -> Result<std::process::Output, AgentTreeError> {
        let output = self.cmd(args).run().map_err(|e| AgentTreeError::ExternalTool {
            category: ExternalToolCategory::Other,
            tool: self.runtime.binary().into(),
            message: format!("failed to spawn {context}: {e}"),
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(AgentTreeError::ExternalTool {
                category: ExternalToolCategory::Other,
                tool: self.runtime.binary().into(),
                message: format!("{context} failed: {}", stderr.trim()),
            });
        }
        Ok(output)
    }

    /// `start(name, image, mounts, env, network) -> handle` (§4.4). Runs
    /// detached and long-lived (`sleep infinity` keeps it alive without an
    /// entrypoint assumption); the AI tool and dev server live in tmux
    /// sessions `exec`'d into it, not as the container's own command.
    pub fn start(
        &self,
        name: &str,
        image: &str,
        mounts: &[Mount],
        env: &[(&str, &str)],
        network: Option<&str>,
    ) -> Result<ContainerHandle, AgentTreeError> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "--rm".into(),
        ];
        for mount in mounts {
            args.push("-v".into());
            args.push(format!("{}:{}", mount.host_path.display(), mount.container_path));
        }
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        if let Some(network) = network {
            args.push("--network".into());
            args.push(network.into());
        }
        args.push(image.into());
        args.push("sleep".into());
        args.push("infinity".into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&arg_refs, "container start")?;
        Ok(ContainerHandle { name: name.to_string() })
    }

    /// `exec(name, argv) -> output`.
    pub fn exec(&self, name: &str, argv: &[&str]) -> Result<std::process::Output, AgentTreeError> {
        let mut args: Vec<&str> = vec!["exec", name];
        args.extend(argv.iter().copied());
        self.run_checked(&args, "container exec")
    }

    /// `stop(name)`. Idempotent: stopping an already-stopped or absent
    /// container is not an error.
    pub fn stop(&self, name: &str) -> Result<(), AgentTreeError> {
        let output = self.cmd(&["stop", name]).run().map_err(|e| AgentTreeError::ExternalTool {
            category: ExternalToolCategory::Other,
            tool: self.runtime.binary().into(),
            message: format!("failed to spawn container stop: {e}"),
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_ascii_lowercase().contains("no such container") {
                return Ok(());
            }
            return Err(AgentTreeError::ExternalTool {
                category: ExternalToolCategory::Other,
                tool: self.runtime.binary().into(),
                message: format!("container stop failed: {}", stderr.trim()),
            });
        }
        Ok(())
    }

    /// `remove(name)`. Idempotent, same as `stop`.
    pub fn remove(&self, name: &str) -> Result<(), AgentTreeError> {
        let output = self.cmd(&["rm", "-f", name]).run().map_err(|e| AgentTreeError::ExternalTool {
            category: ExternalToolCategory::Other,
            tool: self.runtime.binary().into(),
            message: format!("failed to spawn container remove: {e}"),
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_ascii_lowercase().contains("no such container") {
                return Ok(());
            }
            return Err(AgentTreeError::ExternalTool {
                category: ExternalToolCategory::Other,
                tool: self.runtime.binary().into(),
                message: format!("container remove failed: {}", stderr.trim()),
            });
        }
        Ok(())
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.cmd(&["inspect", "-f", "{{.State.Running}}", name])
            .run()
            .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "true")
            .unwrap_or(false)
    }
}

/// Standard environment injected into every started container (§6).
pub fn base_env<'a>(issue_id: &'a str, role: &'a str, port: Option<&'a str>) -> Vec<(&'a str, &'a str)> {
    let mut env = vec![
        ("AGENTTREE_CONTAINER", "1"),
        ("AGENTTREE_ISSUE_ID", issue_id),
        ("AGENTTREE_ROLE", role),
    ];
    if let Some(port) = port {
        env.push(("PORT", port));
    }
    env
}

/// Terminal-multiplexer session manager, a thin `tmux` wrapper (§4.4).
pub struct SessionManager;

impl SessionManager {
    pub fn detect() -> Result<Self, AgentTreeError> {
        if tool_available("tmux") {
            Ok(Self)
        } else {
            Err(AgentTreeError::ExternalTool {
                category: ExternalToolCategory::NotFound,
                tool: "tmux".into(),
                message: "tmux not found; install tmux to attach to agent sessions".into(),
            })
        }
    }

    fn run_checked(&self, args: &[&str], context: &str) -> Result<std::process::Output, AgentTreeError> {
        let output = Cmd::new("tmux").args(args.iter().copied()).run().map_err(|e| {
            AgentTreeError::ExternalTool {
                category: ExternalToolCategory::Other,
                tool: "tmux".into(),
                message: format!("failed to spawn {context}: {e}"),
            }
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(AgentTreeError::ExternalTool {
                category: ExternalToolCategory::Other,
                tool: "tmux".into(),
                message: format!("{context} failed: {}", stderr.trim()),
            });
        }
        Ok(output)
    }

    /// `create(session_name, cwd, env, argv)`: a detached session running
    /// `argv` with `cwd`/`env` applied before exec, in the working directory
    /// given (usually a path inside the container's exec namespace, invoked
    /// via `container exec tmux ...`, or a host worktree path for `serve`).
    pub fn create(
        &self,
        session_name: &str,
        cwd: &Path,
        env: &[(&str, &str)],
        argv: &[&str],
    ) -> Result<(), AgentTreeError> {
        if self.exists(session_name) {
            return Ok(());
        }
        let mut command = String::new();
        for (key, value) in env {
            command.push_str(&format!("export {key}={}; ", shell_escape::escape(value.to_string().into())));
        }
        command.push_str(&argv.iter().map(|a| shell_escape::escape((*a).into()).into_owned()).collect::<Vec<_>>().join(" "));

        self.run_checked(
            &[
                "new-session",
                "-d",
                "-s",
                session_name,
                "-c",
                &cwd.to_string_lossy(),
                &command,
            ],
            "tmux new-session",
        )?;
        Ok(())
    }

    pub fn exists(&self, session_name: &str) -> bool {
        Cmd::new("tmux")
            .args(["has-session", "-t", session_name])
            .run()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// `send_keys(session_name, text)`: inject input, followed by Enter.
    pub fn send_keys(&self, session_name: &str, text: &str) -> Result<(), AgentTreeError> {
        self.run_checked(&["send-keys", "-t", session_name, text, "Enter"], "tmux send-keys")?;
        Ok(())
    }

    /// `capture(session_name) -> string`: snapshot of the visible pane.
    pub fn capture(&self, session_name: &str) -> Result<String, AgentTreeError> {
        let output = self.run_checked(&["capture-pane", "-t", session_name, "-p"], "tmux capture-pane")?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// `kill(session_name)`. Idempotent: killing a session that no longer
    /// exists is not an error.
    pub fn kill(&self, session_name: &str) -> Result<(), AgentTreeError> {
        if !self.exists(session_name) {
            return Ok(());
        }
        self.run_checked(&["kill-session", "-t", session_name], "tmux kill-session")?;
        Ok(())
    }
}

/// Per-issue tmux session naming (§4.4): `{project}-{role}-{id}` for role
/// sessions, `{project}-serve-{id}` for the dev-server session.
pub fn role_session_name(project: &str, role: &str, issue_id: &str) -> String {
    format!("{project}-{role}-{issue_id}")
}

pub fn serve_session_name(project: &str, issue_id: &str) -> String {
    format!("{project}-serve-{issue_id}")
}

pub fn container_name(project: &str, issue_id: &str) -> String {
    format!("{project}-issue-{issue_id}")
}

/// `docker exec -it -e K=V... <container> sh -c '<command>'`, the argv a
/// role/serve tmux session runs on the host so `tmux attach` drops a human
/// straight into the container (§4.4: "one session per role inside the
/// container"). Shared by `agt start` and the sync loop's own dispatch of
/// newly-unblocked issues, so both launch agents identically.
pub fn exec_argv(runtime_bin: &str, container_name: &str, env: &[(&str, &str)], command: &str) -> Vec<String> {
    let mut argv = vec![runtime_bin.to_string(), "exec".to_string(), "-it".to_string()];
    for (key, value) in env {
        argv.push("-e".into());
        argv.push(format!("{key}={value}"));
    }
    argv.push(container_name.to_string());
    argv.push("sh".to_string());
    argv.push("-c".to_string());
    argv.push(command.to_string());
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_conventions_match_spec_examples() {
        assert_eq!(role_session_name("demo", "developer", "003"), "demo-developer-003");
        assert_eq!(serve_session_name("demo", "003"), "demo-serve-003");
        assert_eq!(container_name("demo", "003"), "demo-issue-003");
    }

    #[test]
    fn exec_argv_wraps_command_with_env_and_exec_flags() {
        let argv = exec_argv("docker", "demo-issue-003", &[("PORT", "9041")], "claude");
        assert_eq!(argv, vec!["docker", "exec", "-it", "-e", "PORT=9041", "demo-issue-003", "sh", "-c", "claude"]);
    }

    #[test]
    fn base_env_includes_required_keys() {
        let env = base_env("042", "developer", Some("9041"));
        assert!(env.contains(&("AGENTTREE_CONTAINER", "1")));
        assert!(env.contains(&("AGENTTREE_ISSUE_ID", "042")));
        assert!(env.contains(&("AGENTTREE_ROLE", "developer")));
        assert!(env.contains(&("PORT", "9041")));
    }

    #[test]
    fn base_env_omits_port_when_absent() {
        let env = base_env("042", "developer", None);
        assert!(!env.iter().any(|(k, _)| *k == "PORT"));
    }

    #[test]
    fn mount_workspace_targets_known_path() {
        let mount = Mount::workspace("/host/repo");
        assert_eq!(mount.container_path, "/workspace");
    }

    #[test]
    fn detect_errors_when_no_known_binary_exists() {
        // None of the synthetic binary names below exist on a real PATH;
        // this just exercises the not-found error shape without requiring
        // a runtime to be absent in the test environment (best-effort: if a
        // real runtime happens to be installed, detect() would succeed, so
        // we only assert the error variant when it *does* fail).
        if let Err(e) = ContainerManager::detect() {
            match e {
                AgentTreeError::ExternalTool { category, .. } => {
                    assert_eq!(category, ExternalToolCategory::NotFound);
                }
                other => panic!("expected ExternalTool, got {other:?}"),
            }
        }
    }

    #[test]
    fn session_exists_false_for_unlikely_name() {
        if let Ok(sessions) = SessionManager::detect() {
            assert!(!sessions.exists("agenttree-definitely-not-a-real-session-xyz"));
        }
    }
}
