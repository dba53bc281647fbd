//! Resource allocator (§4.1): the live-agent registry and port pool, both
//! persisted in the sidecar's `state.yaml` under an exclusive file lock.
//!
//! Every operation is lock-bracketed read-parse-mutate-serialize-write of
//! the whole file; there is no partial-state write path (mirrors the
//! teacher's `with_locked_mutation` shape in `config/user.rs`, adapted from
//! a single config record to a registry + pool).

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::config::PortRangeConfig;
use crate::error::AgentTreeError;

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One live agent: a running tool bound to an issue/role pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEntry {
    pub issue_id: String,
    pub role: String,
    pub container: String,
    pub session: String,
    pub branch: String,
    pub worktree: PathBuf,
    pub port: u16,
}

/// The registry + port pool snapshot, `state.yaml`'s schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    #[serde(default)]
    pub ports_in_use: Vec<u16>,
    #[serde(default)]
    pub sync_counter: u64,
}

/// Manages `state.yaml` under `sidecar_root`, holding the port range from
/// project config.
pub struct Allocator {
    state_path: PathBuf,
    port_range: PortRangeConfig,
}

/// RAII guard over the acquired lock file; dropped at the end of each
/// operation, releasing it.
struct LockGuard(std::fs::File);

impl Allocator {
    pub fn new(sidecar_root: &Path, port_range: PortRangeConfig) -> Self {
        Self {
            state_path: sidecar_root.join("state.yaml"),
            port_range,
        }
    }

    fn acquire_lock(&self) -> Result<LockGuard, AgentTreeError> {
        let lock_path = self.state_path.with_extension("yaml.lock");
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AgentTreeError::ExternalTool {
                category: crate::error::ExternalToolCategory::Other,
                tool: "fs".into(),
                message: format!("failed to create {}: {e}", parent.display()),
            })?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| AgentTreeError::ExternalTool {
                category: crate::error::ExternalToolCategory::Other,
                tool: "fs".into(),
                message: format!("failed to open {}: {e}", lock_path.display()),
            })?;

        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(LockGuard(file)),
                Err(e) if is_lock_contended(&e) => {
                    if Instant::now() >= deadline {
                        return Err(AgentTreeError::ResourceLocked {
                            resource: "state.yaml".into(),
                            timeout_s: LOCK_TIMEOUT.as_secs(),
                        });
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(AgentTreeError::ExternalTool {
                        category: crate::error::ExternalToolCategory::Other,
                        tool: "fs".into(),
                        message: format!("failed to lock state.yaml: {e}"),
                    });
                }
            }
        }
    }

    fn load(&self) -> Result<State, AgentTreeError> {
        match std::fs::read_to_string(&self.state_path) {
            Ok(contents) => serde_yaml::from_str(&contents).map_err(|e| AgentTreeError::CorruptRecord {
                path: self.state_path.clone(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(State::default()),
            Err(e) => Err(AgentTreeError::ExternalTool {
                category: crate::error::ExternalToolCategory::Other,
                tool: "fs".into(),
                message: format!("failed to read state.yaml: {e}"),
            }),
        }
    }

    fn save(&self, state: &State) -> Result<(), AgentTreeError> {
        let serialized = serde_yaml::to_string(state).map_err(|e| AgentTreeError::ExternalTool {
            category: crate::error::ExternalToolCategory::Other,
            tool: "serde_yaml".into(),
            message: e.to_string(),
        })?;
        std::fs::write(&self.state_path, serialized).map_err(|e| AgentTreeError::ExternalTool {
            category: crate::error::ExternalToolCategory::Other,
            tool: "fs".into(),
            message: format!("failed to write state.yaml: {e}"),
        })
    }

    /// Deterministic-then-next-free port assignment for issue `n` (§3, §5).
    fn tentative_port(&self, n: u64) -> u16 {
        let range_size = u64::from(self.port_range.len());
        let offset = n % range_size;
        if offset == 0 {
            self.port_range.max
        } else {
            self.port_range.min + offset as u16
        }
    }

    fn next_free(&self, state: &State, start: u16) -> Option<u16> {
        let span = self.port_range.min..=self.port_range.max;
        let (before, after) = span.clone().partition::<Vec<u16>, _>(|p| *p < start);
        after
            .into_iter()
            .chain(before)
            .find(|p| !state.ports_in_use.contains(p))
    }

    /// Allocate a port for issue numeric id `n`, preferring the deterministic
    /// slot and falling back to the next free port in range (§3 "Port
    /// determinism").
    pub fn allocate_port(&self, issue_numeric_id: u64) -> Result<u16, AgentTreeError> {
        let _lock = self.acquire_lock()?;
        let mut state = self.load()?;
        let start = self.tentative_port(issue_numeric_id);
        let port = self
            .next_free(&state, start)
            .ok_or_else(|| AgentTreeError::ResourceExhausted { resource: "port".into() })?;
        state.ports_in_use.push(port);
        self.save(&state)?;
        Ok(port)
    }

    pub fn free_port(&self, port: u16) -> Result<(), AgentTreeError> {
        let _lock = self.acquire_lock()?;
        let mut state = self.load()?;
        state.ports_in_use.retain(|p| *p != port);
        self.save(&state)
    }

    /// Atomically allocate a port and append a registry entry. Fails if
    /// `(issue_id, role)` already has a live entry.
    #[allow(clippy::too_many_arguments)]
    pub fn register_agent(
        &self,
        issue_id: &str,
        issue_numeric_id: u64,
        role: &str,
        container: &str,
        session: &str,
        branch: &str,
        worktree: &Path,
    ) -> Result<u16, AgentTreeError> {
        let _lock = self.acquire_lock()?;
        let mut state = self.load()?;

        if state.agents.iter().any(|a| a.issue_id == issue_id && a.role == role) {
            return Err(AgentTreeError::ExternalTool {
                category: crate::error::ExternalToolCategory::Conflict,
                tool: "allocator".into(),
                message: format!("{issue_id}/{role} already has a live agent"),
            });
        }

        let start = self.tentative_port(issue_numeric_id);
        let port = self
            .next_free(&state, start)
            .ok_or_else(|| AgentTreeError::ResourceExhausted { resource: "port".into() })?;

        state.ports_in_use.push(port);
        state.agents.push(AgentEntry {
            issue_id: issue_id.to_string(),
            role: role.to_string(),
            container: container.to_string(),
            session: session.to_string(),
            branch: branch.to_string(),
            worktree: worktree.to_path_buf(),
            port,
        });
        self.save(&state)?;
        Ok(port)
    }

    /// Idempotent: a missing entry is not an error.
    pub fn unregister_agent(&self, issue_id: &str, role: &str) -> Result<(), AgentTreeError> {
        let _lock = self.acquire_lock()?;
        let mut state = self.load()?;
        if let Some(pos) = state.agents.iter().position(|a| a.issue_id == issue_id && a.role == role) {
            let entry = state.agents.remove(pos);
            state.ports_in_use.retain(|p| *p != entry.port);
        }
        self.save(&state)
    }

    pub fn list_agents(&self) -> Result<Vec<AgentEntry>, AgentTreeError> {
        let _lock = self.acquire_lock()?;
        Ok(self.load()?.agents)
    }

    pub fn get_agent(&self, issue_id: &str, role: &str) -> Result<Option<AgentEntry>, AgentTreeError> {
        let _lock = self.acquire_lock()?;
        let state = self.load()?;
        Ok(state.agents.into_iter().find(|a| a.issue_id == issue_id && a.role == role))
    }
}

fn is_lock_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(tmp: &Path) -> Allocator {
        Allocator::new(tmp, PortRangeConfig { min: 9000, max: 9100 })
    }

    #[test]
    fn deterministic_port_wraps_around_range() {
        let tmp = tempfile::tempdir().unwrap();
        let a = allocator(tmp.path());
        assert_eq!(a.tentative_port(1), 9001);
        assert_eq!(a.tentative_port(100), 9100);
        assert_eq!(a.tentative_port(101), 9001);
    }

    #[test]
    fn allocate_and_free_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let a = allocator(tmp.path());
        let port = a.allocate_port(1).unwrap();
        assert_eq!(port, 9001);
        a.free_port(port).unwrap();
        let state = a.load().unwrap();
        assert!(!state.ports_in_use.contains(&port));
    }

    #[test]
    fn allocate_falls_back_to_next_free_on_collision() {
        let tmp = tempfile::tempdir().unwrap();
        let a = allocator(tmp.path());
        let first = a.allocate_port(1).unwrap();
        let second = a.allocate_port(1).unwrap();
        assert_eq!(first, 9001);
        assert_eq!(second, 9002);
    }

    #[test]
    fn register_agent_rejects_duplicate_issue_role() {
        let tmp = tempfile::tempdir().unwrap();
        let a = allocator(tmp.path());
        a.register_agent("042", 42, "coder", "c1", "s1", "issue-042", Path::new("/tmp/wt"))
            .unwrap();
        let err = a.register_agent("042", 42, "coder", "c2", "s2", "issue-042", Path::new("/tmp/wt"));
        assert!(err.is_err());
    }

    #[test]
    fn unregister_agent_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let a = allocator(tmp.path());
        a.unregister_agent("nope", "coder").unwrap();
        a.unregister_agent("nope", "coder").unwrap();
    }

    #[test]
    fn register_then_unregister_frees_port() {
        let tmp = tempfile::tempdir().unwrap();
        let a = allocator(tmp.path());
        a.register_agent("042", 42, "coder", "c1", "s1", "issue-042", Path::new("/tmp/wt"))
            .unwrap();
        a.unregister_agent("042", "coder").unwrap();
        let state = a.load().unwrap();
        assert!(state.ports_in_use.is_empty());
        assert!(state.agents.is_empty());
    }
}
