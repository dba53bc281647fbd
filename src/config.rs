//! Project configuration: paths, port range, tool/role bindings, the stage
//! graph, and the controller's post-sync hook list (§6).
//!
//! Loaded from one TOML file at the project root (default
//! `.config/agenttree.toml`, overridable via `AGENTTREE_CONFIG` or
//! `--config`). Unknown top-level keys, and unknown keys inside a stage's
//! hook declarations, are preserved rather than rejected (§6): "Unknown keys
//! under stages or hooks are preserved and passed through to hook
//! arguments."

use std::collections::BTreeMap;
use std::path::Path;

use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::hooks::HookDecl;

/// Name of the environment variable that overrides the project-root config lookup.
pub const CONFIG_ENV_VAR: &str = "AGENTTREE_CONFIG";

/// A startup command plus initial prompt for one AI coding tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ToolConfig {
    /// Shell command that launches the tool inside the issue's session.
    pub command: String,
    /// Initial prompt text sent to the tool on session start, if any.
    #[serde(default)]
    pub initial_prompt: Option<String>,
}

/// A named agent persona: which tool it runs, and on what model/skill.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RoleConfig {
    pub tool: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub skill: Option<String>,
}

/// One node in the stage graph (§3 "Stage definition").
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub substages: Vec<String>,
    /// Controller-only: agents may not advance past this stage themselves.
    #[serde(default)]
    pub host: bool,
    /// Blocks automatic advance; requires an explicit `approve`.
    #[serde(default)]
    pub human_review: bool,
    /// No further transitions are permitted once entered.
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub pre_completion: Vec<HookDecl>,
    #[serde(default)]
    pub post_start: Vec<HookDecl>,
    /// Skill file (under `skills/` in the sidecar) surfaced to the agent on entry.
    #[serde(default)]
    pub skill: Option<String>,
    /// Keys under this stage not recognized above, preserved for hook arguments.
    #[serde(flatten)]
    pub extra: IndexMap<String, toml::Value>,
}

/// `controller_hooks.post_sync` — hooks the sync loop runs on every tick,
/// subject to rate-limiting (§4.6, §4.9 step 8).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ControllerHooksConfig {
    #[serde(default)]
    pub post_sync: Vec<HookDecl>,
}

/// Top-level project configuration (§6).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AgentTreeConfig {
    pub project: String,
    pub worktrees_dir: String,
    pub port_range: PortRangeConfig,
    pub default_tool: String,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolConfig>,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleConfig>,
    /// Free-form name -> shell string; `serve`/`test`/`lint` recognized by convention.
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub controller_hooks: ControllerHooksConfig,
    /// Unrecognized top-level keys, preserved rather than rejected.
    #[serde(flatten)]
    pub extra: IndexMap<String, toml::Value>,
}

/// The project's port allocation range, declared as a `[port_range]` table
/// with `min`/`max` keys (or inline, `port_range = { min = 9000, max =
/// 9100 }`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct PortRangeConfig {
    pub min: u16,
    pub max: u16,
}

impl PortRangeConfig {
    pub fn len(&self) -> u32 {
        u32::from(self.max) - u32::from(self.min) + 1
    }
}

impl AgentTreeConfig {
    /// Load and parse the project config file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {e}", path.display()))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: AgentTreeConfig = toml::from_str(contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse project config: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.port_range.min > self.port_range.max {
            anyhow::bail!(
                "port_range min ({}) must not exceed max ({})",
                self.port_range.min,
                self.port_range.max
            );
        }
        if self.stages.is_empty() {
            anyhow::bail!("config must declare at least one stage");
        }
        let terminal_count = self.stages.iter().filter(|s| s.terminal).count();
        if terminal_count == 0 {
            anyhow::bail!("config must declare at least one terminal stage");
        }
        Ok(())
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Resolve the default project-root config path, honoring
    /// `AGENTTREE_CONFIG` before falling back to `.config/agenttree.toml`.
    pub fn default_path(project_root: &Path) -> std::path::PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return std::path::PathBuf::from(path);
        }
        project_root.join(".config").join("agenttree.toml")
    }
}

/// Valid top-level keys, derived from the schema, used to detect unknown
/// keys for warning purposes (mirrors the teacher's
/// `find_unknown_keys`/`valid_project_config_keys` pattern).
pub fn valid_top_level_keys() -> Vec<String> {
    let schema = schemars::schema_for!(AgentTreeConfig);
    schema
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|props| props.keys().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
project = "demo"
worktrees_dir = "../worktrees"
default_tool = "claude"

[port_range]
min = 9000
max = 9100

[[stages]]
name = "define"

[[stages]]
name = "accepted"
terminal = true
"#;

    #[test]
    fn parses_minimal_config() {
        let config = AgentTreeConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.project, "demo");
        assert_eq!(config.port_range.min, 9000);
        assert_eq!(config.stages.len(), 2);
        assert!(config.stage("accepted").unwrap().terminal);
    }

    #[test]
    fn rejects_inverted_port_range() {
        let bad = MINIMAL.replace("min = 9000", "min = 9999");
        assert!(AgentTreeConfig::parse(&bad).is_err());
    }

    #[test]
    fn rejects_config_with_no_terminal_stage() {
        let bad = r#"
project = "demo"
worktrees_dir = "../worktrees"
default_tool = "claude"

[port_range]
min = 9000
max = 9100

[[stages]]
name = "define"
"#;
        assert!(AgentTreeConfig::parse(bad).is_err());
    }

    #[test]
    fn preserves_unknown_top_level_keys() {
        let with_extra = format!("{MINIMAL}\n[experimental]\nfoo = \"bar\"\n");
        let config = AgentTreeConfig::parse(&with_extra).unwrap();
        assert!(config.extra.contains_key("experimental"));
    }

    #[test]
    fn port_range_len_is_inclusive() {
        let range = PortRangeConfig { min: 9000, max: 9100 };
        assert_eq!(range.len(), 101);
    }

    #[test]
    fn default_path_honors_env_var() {
        unsafe {
            std::env::set_var(CONFIG_ENV_VAR, "/tmp/custom-agenttree.toml");
        }
        let path = AgentTreeConfig::default_path(Path::new("/repo"));
        assert_eq!(path, Path::new("/tmp/custom-agenttree.toml"));
        unsafe {
            std::env::remove_var(CONFIG_ENV_VAR);
        }
    }
}
