//! Issue store (§4.5): filesystem-backed CRUD over issue records, one
//! directory per issue under the sidecar's `issues/`.
//!
//! Grounded on `config/project.rs`'s `ProjectConfig::load` read-parse-validate
//! shape, adapted from a single project file to a directory of per-issue
//! records; corrupt YAML is skipped with a warning rather than failing the
//! whole listing, the way the teacher's unknown-key detection warns instead
//! of rejecting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AgentTreeError;
use crate::hooks::HookState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub stage: String,
    #[serde(default)]
    pub substage: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Set on step-backs (§8 "CI failure causes step-back"); absent on
    /// ordinary advances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One issue record (`issue.yaml`, §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub slug: String,
    pub title: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub stage: String,
    #[serde(default)]
    pub substage: Option<String>,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub pr_number: Option<u64>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub priority: Priority,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub hook_state: HashMap<String, HookState>,
    pub history: Vec<HistoryEntry>,
}

const PROBLEM_TEMPLATE: &str = "# Problem\n\n<!-- describe the problem this issue solves -->\n";

/// CRUD over `{sidecar_root}/issues/{id}-{slug}/issue.yaml`.
pub struct IssueStore {
    issues_dir: PathBuf,
}

fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut last_was_dash = true;
    for ch in title.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

impl IssueStore {
    pub fn new(sidecar_root: &Path) -> Self {
        Self { issues_dir: sidecar_root.join("issues") }
    }

    fn dir_for(&self, id: &str, slug: &str) -> PathBuf {
        self.issues_dir.join(format!("{id}-{slug}"))
    }

    fn find_dir(&self, id: &str) -> Option<PathBuf> {
        let prefix = format!("{id}-");
        std::fs::read_dir(&self.issues_dir).ok()?.filter_map(|e| e.ok()).find_map(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            (name.starts_with(&prefix) || name == id).then(|| entry.path())
        })
    }

    fn next_id(&self) -> anyhow::Result<u64> {
        let mut max = 0u64;
        if self.issues_dir.is_dir() {
            for entry in std::fs::read_dir(&self.issues_dir)?.filter_map(|e| e.ok()) {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some((id_part, _)) = name.split_once('-')
                    && let Ok(n) = id_part.parse::<u64>()
                {
                    max = max.max(n);
                }
            }
        }
        Ok(max + 1)
    }

    /// Allocates the next unused id, writes `issue.yaml` + a seeded
    /// `problem.md`, and seeds history with `initial_stage`.
    pub fn create(
        &self,
        title: &str,
        priority: Priority,
        labels: Vec<String>,
        blocked_by: Vec<String>,
        initial_stage: &str,
    ) -> anyhow::Result<Issue> {
        let numeric_id = self.next_id()?;
        let id = format!("{numeric_id:03}");
        let slug = slugify(title);
        let now = Utc::now();

        let issue = Issue {
            id: id.clone(),
            slug: slug.clone(),
            title: title.to_string(),
            created: now,
            updated: now,
            stage: initial_stage.to_string(),
            substage: None,
            assigned_agent: None,
            branch: None,
            pr_number: None,
            labels,
            priority,
            blocked_by,
            hook_state: HashMap::new(),
            history: vec![HistoryEntry {
                stage: initial_stage.to_string(),
                substage: None,
                timestamp: now,
                reason: None,
            }],
        };

        let dir = self.dir_for(&id, &slug);
        std::fs::create_dir_all(&dir)?;
        self.write(&issue)?;
        let problem_md = dir.join("problem.md");
        if !problem_md.exists() {
            std::fs::write(&problem_md, PROBLEM_TEMPLATE)?;
        }

        Ok(issue)
    }

    fn write(&self, issue: &Issue) -> anyhow::Result<()> {
        let dir = self.dir_for(&issue.id, &issue.slug);
        std::fs::create_dir_all(&dir)?;
        let serialized = serde_yaml::to_string(issue)?;
        std::fs::write(dir.join("issue.yaml"), serialized)?;
        Ok(())
    }

    fn read_at(&self, dir: &Path) -> Result<Issue, AgentTreeError> {
        let path = dir.join("issue.yaml");
        let contents = std::fs::read_to_string(&path).map_err(|e| AgentTreeError::CorruptRecord {
            path: path.clone(),
            message: e.to_string(),
        })?;
        serde_yaml::from_str(&contents)
            .map_err(|e| AgentTreeError::CorruptRecord { path, message: e.to_string() })
    }

    /// Returns all readable issues; corrupt YAML is skipped with a logged
    /// warning rather than failing the whole listing.
    pub fn list(&self) -> Vec<Issue> {
        let Ok(entries) = std::fs::read_dir(&self.issues_dir) else {
            return Vec::new();
        };
        let mut issues = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match self.read_at(&path) {
                Ok(issue) => issues.push(issue),
                Err(e) => log::warn!("skipping corrupt issue record at {}: {e}", path.display()),
            }
        }
        issues.sort_by(|a, b| a.id.cmp(&b.id));
        issues
    }

    pub fn get(&self, id: &str) -> Result<Option<Issue>, AgentTreeError> {
        match self.find_dir(id) {
            Some(dir) => self.read_at(&dir).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_by_slug(&self, slug: &str) -> Option<Issue> {
        self.list().into_iter().find(|i| i.slug == slug)
    }

    /// Matches against id, slug, or a case-insensitive title substring.
    pub fn find(&self, query: &str) -> Vec<Issue> {
        let query_lower = query.to_lowercase();
        self.list()
            .into_iter()
            .filter(|i| i.id == query || i.slug == query || i.title.to_lowercase().contains(&query_lower))
            .collect()
    }

    /// Updates `stage`, `substage`, `updated`, and appends to `history`.
    /// Permission to transition is the stage machine's concern (§4.7); this
    /// method performs the write once the caller has validated it.
    pub fn update_stage(&self, id: &str, new_stage: &str, new_substage: Option<&str>) -> Result<Issue, AgentTreeError> {
        let dir = self.find_dir(id).ok_or_else(|| AgentTreeError::ExternalTool {
            category: crate::error::ExternalToolCategory::NotFound,
            tool: "issue_store".into(),
            message: format!("no issue directory found for {id}"),
        })?;
        let mut issue = self.read_at(&dir)?;
        let now = Utc::now();
        issue.stage = new_stage.to_string();
        issue.substage = new_substage.map(str::to_string);
        issue.updated = now;
        issue.history.push(HistoryEntry {
            stage: new_stage.to_string(),
            substage: new_substage.map(str::to_string),
            timestamp: now,
            reason: None,
        });
        self.write(&issue).map_err(|e| AgentTreeError::ExternalTool {
            category: crate::error::ExternalToolCategory::Other,
            tool: "issue_store".into(),
            message: e.to_string(),
        })?;
        Ok(issue)
    }

    /// Like [`Self::update_stage`], but records `reason` on the new history
    /// entry (§8 "CI failure causes step-back"). Resource state (container,
    /// branch, worktree) is left untouched; the caller handles messaging.
    pub fn step_back(
        &self,
        id: &str,
        to_stage: &str,
        to_substage: Option<&str>,
        reason: &str,
    ) -> Result<Issue, AgentTreeError> {
        let dir = self.find_dir(id).ok_or_else(|| AgentTreeError::ExternalTool {
            category: crate::error::ExternalToolCategory::NotFound,
            tool: "issue_store".into(),
            message: format!("no issue directory found for {id}"),
        })?;
        let mut issue = self.read_at(&dir)?;
        let now = Utc::now();
        issue.stage = to_stage.to_string();
        issue.substage = to_substage.map(str::to_string);
        issue.updated = now;
        issue.history.push(HistoryEntry {
            stage: to_stage.to_string(),
            substage: to_substage.map(str::to_string),
            timestamp: now,
            reason: Some(reason.to_string()),
        });
        self.write(&issue).map_err(|e| AgentTreeError::ExternalTool {
            category: crate::error::ExternalToolCategory::Other,
            tool: "issue_store".into(),
            message: e.to_string(),
        })?;
        Ok(issue)
    }

    pub fn assign(&self, id: &str, role: &str, branch: &str) -> Result<Issue, AgentTreeError> {
        let dir = self.find_dir(id).ok_or_else(|| AgentTreeError::ExternalTool {
            category: crate::error::ExternalToolCategory::NotFound,
            tool: "issue_store".into(),
            message: format!("no issue directory found for {id}"),
        })?;
        let mut issue = self.read_at(&dir)?;
        issue.assigned_agent = Some(role.to_string());
        issue.branch = Some(branch.to_string());
        issue.updated = Utc::now();
        self.write(&issue).map_err(|e| AgentTreeError::ExternalTool {
            category: crate::error::ExternalToolCategory::Other,
            tool: "issue_store".into(),
            message: e.to_string(),
        })?;
        Ok(issue)
    }

    pub fn unassign(&self, id: &str) -> Result<Issue, AgentTreeError> {
        let dir = self.find_dir(id).ok_or_else(|| AgentTreeError::ExternalTool {
            category: crate::error::ExternalToolCategory::NotFound,
            tool: "issue_store".into(),
            message: format!("no issue directory found for {id}"),
        })?;
        let mut issue = self.read_at(&dir)?;
        issue.assigned_agent = None;
        issue.updated = Utc::now();
        self.write(&issue).map_err(|e| AgentTreeError::ExternalTool {
            category: crate::error::ExternalToolCategory::Other,
            tool: "issue_store".into(),
            message: e.to_string(),
        })?;
        Ok(issue)
    }

    pub fn set_pr(&self, id: &str, pr_number: u64) -> Result<Issue, AgentTreeError> {
        let dir = self.find_dir(id).ok_or_else(|| AgentTreeError::ExternalTool {
            category: crate::error::ExternalToolCategory::NotFound,
            tool: "issue_store".into(),
            message: format!("no issue directory found for {id}"),
        })?;
        let mut issue = self.read_at(&dir)?;
        issue.pr_number = Some(pr_number);
        issue.updated = Utc::now();
        self.write(&issue).map_err(|e| AgentTreeError::ExternalTool {
            category: crate::error::ExternalToolCategory::Other,
            tool: "issue_store".into(),
            message: e.to_string(),
        })?;
        Ok(issue)
    }

    /// Drops `hook_state` entries whose name no longer matches any
    /// currently-declared hook (renamed or removed from project config since
    /// the entry was written). Returns whether anything was dropped, so the
    /// caller can skip the write when there's nothing to prune.
    pub fn prune_hook_state(&self, id: &str, valid_names: &std::collections::HashSet<String>) -> Result<bool, AgentTreeError> {
        let dir = self.find_dir(id).ok_or_else(|| AgentTreeError::ExternalTool {
            category: crate::error::ExternalToolCategory::NotFound,
            tool: "issue_store".into(),
            message: format!("no issue directory found for {id}"),
        })?;
        let mut issue = self.read_at(&dir)?;
        let before = issue.hook_state.len();
        issue.hook_state.retain(|name, _| valid_names.contains(name));
        if issue.hook_state.len() == before {
            return Ok(false);
        }
        self.write(&issue).map_err(|e| AgentTreeError::ExternalTool {
            category: crate::error::ExternalToolCategory::Other,
            tool: "issue_store".into(),
            message: e.to_string(),
        })?;
        Ok(true)
    }
}
