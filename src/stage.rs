//! Stage machine (§4.7): the `advance`/`approve`/`step_back` primitives over
//! the ordered stage/substage graph declared in project config.
//!
//! Grounded on the "load config, compute result, mutate, report" shape the
//! teacher uses for its own switch/merge command handlers, and on
//! `StepCommand`'s stage-like subcommands for the run-hooks-then-transition-
//! then-run-more-hooks sequencing.

use crate::config::{AgentTreeConfig, StageConfig};
use crate::error::{AgentTreeError, HookFailure};
use crate::hooks::{Environment, HookContext, HookFailureStrategy, HookRuntime, evaluate_all};
use crate::issue::{Issue, IssueStore};

/// A resolved position in the stage graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    pub substage: Option<String>,
}

impl Stage {
    pub fn of(issue: &Issue) -> Self {
        Self { name: issue.stage.clone(), substage: issue.substage.clone() }
    }
}

/// Collaborators the stage machine needs beyond hook evaluation: cleanup on
/// terminal entry and agent-session messaging for step-backs.
pub trait StageRuntime: HookRuntime {
    fn cleanup_terminal_issue(&mut self, issue: &Issue) -> anyhow::Result<()>;
    fn send_message(&mut self, issue: &Issue, message: &str) -> anyhow::Result<()>;
}

pub struct StageMachine<'a> {
    config: &'a AgentTreeConfig,
    issues: &'a IssueStore,
    worktree_root: Box<dyn Fn(&Issue) -> std::path::PathBuf + 'a>,
}

enum Intent {
    Advance,
    Approve,
}

impl<'a> StageMachine<'a> {
    /// `worktree_root` resolves where an issue's agent artifacts
    /// (`problem.md`, `spec.md`, `TASK.md`, ...) live, so file-based hooks
    /// check the issue's actual worktree rather than the process cwd.
    /// Production callers pass `WorktreeManager::path_for_issue`; tests can
    /// pass a constant path.
    pub fn new(
        config: &'a AgentTreeConfig,
        issues: &'a IssueStore,
        worktree_root: impl Fn(&Issue) -> std::path::PathBuf + 'a,
    ) -> Self {
        Self { config, issues, worktree_root: Box::new(worktree_root) }
    }

    fn stage_config(&self, name: &str) -> Result<&StageConfig, AgentTreeError> {
        self.config.stage(name).ok_or_else(|| AgentTreeError::ExternalTool {
            category: crate::error::ExternalToolCategory::Other,
            tool: "stage_machine".into(),
            message: format!("issue references unknown stage {name}"),
        })
    }

    /// Next substage within the current stage, or the first substage of the
    /// next stage (§4.7 transition rules 1-2).
    fn compute_target(&self, current: &Stage) -> Result<Stage, AgentTreeError> {
        let current_config = self.stage_config(&current.name)?;

        if let Some(substage) = &current.substage
            && let Some(pos) = current_config.substages.iter().position(|s| s == substage)
            && pos + 1 < current_config.substages.len()
        {
            return Ok(Stage {
                name: current.name.clone(),
                substage: Some(current_config.substages[pos + 1].clone()),
            });
        }

        let current_index = self.config.stage_index(&current.name).ok_or_else(|| AgentTreeError::ExternalTool {
            category: crate::error::ExternalToolCategory::Other,
            tool: "stage_machine".into(),
            message: format!("issue references unknown stage {}", current.name),
        })?;
        let next_config = self.config.stages.get(current_index + 1).ok_or_else(|| AgentTreeError::Validation {
            failures: vec![HookFailure {
                hook_name: "stage_machine".into(),
                message: format!("{} has no further stages to advance into", current.name),
            }],
        })?;

        Ok(Stage { name: next_config.name.clone(), substage: next_config.substages.first().cloned() })
    }

    fn hook_context(&self, issue: &Issue, failure_reason: Option<String>) -> HookContext {
        HookContext {
            issue_id: issue.id.clone(),
            branch: issue.branch.clone(),
            base_branch: self.config.extra.get("base_branch").and_then(|v| v.as_str()).unwrap_or("main").to_string(),
            pr_number: issue.pr_number,
            pr_url: None,
            failure_reason,
            environment: Environment::detect(),
            worktree_root: (self.worktree_root)(issue),
            sync_counter: 0,
        }
    }

    fn transition(&self, issue_id: &str, intent: Intent, runtime: &mut dyn StageRuntime) -> Result<Issue, AgentTreeError> {
        let issue = self
            .issues
            .get(issue_id)?
            .ok_or_else(|| AgentTreeError::ExternalTool {
                category: crate::error::ExternalToolCategory::NotFound,
                tool: "stage_machine".into(),
                message: format!("no such issue {issue_id}"),
            })?;

        let current = Stage::of(&issue);
        let current_config = self.stage_config(&current.name)?;

        if current_config.terminal {
            return Err(AgentTreeError::Validation {
                failures: vec![HookFailure {
                    hook_name: "stage_machine".into(),
                    message: format!("{} is terminal; no further transitions are permitted", current.name),
                }],
            });
        }
        if current_config.human_review && matches!(intent, Intent::Advance) {
            return Err(AgentTreeError::Validation {
                failures: vec![HookFailure {
                    hook_name: "stage_machine".into(),
                    message: format!("{} requires an explicit approve", current.name),
                }],
            });
        }

        let target = self.compute_target(&current)?;

        let ctx = self.hook_context(&issue, None);
        let report = evaluate_all(
            &current_config.pre_completion,
            &ctx,
            &Default::default(),
            runtime as &mut dyn HookRuntime,
            HookFailureStrategy::FailFast,
        );
        if !report.failures.is_empty() {
            return Err(AgentTreeError::Validation {
                failures: report
                    .failures
                    .into_iter()
                    .map(|(hook_name, message)| HookFailure { hook_name, message })
                    .collect(),
            });
        }

        let mut issue = self.issues.update_stage(issue_id, &target.name, target.substage.as_deref())?;

        let target_config = self.stage_config(&target.name)?;
        let ctx = self.hook_context(&issue, None);
        let post_report = evaluate_all(
            &target_config.post_start,
            &ctx,
            &Default::default(),
            runtime as &mut dyn HookRuntime,
            HookFailureStrategy::Warn,
        );
        for (hook_name, message) in &post_report.failures {
            log::warn!("post-start hook {hook_name} failed for {issue_id}: {message}");
        }

        if target_config.terminal {
            runtime.cleanup_terminal_issue(&issue).map_err(|e| AgentTreeError::NonFatalPostStart {
                hook_name: "cleanup_terminal_issue".into(),
                message: e.to_string(),
            })?;
            issue = self.issues.unassign(issue_id)?;
        }

        Ok(issue)
    }

    /// Refuses if the current stage is terminal or `human_review`.
    pub fn advance(&self, issue_id: &str, runtime: &mut dyn StageRuntime) -> Result<Issue, AgentTreeError> {
        self.transition(issue_id, Intent::Advance, runtime)
    }

    /// Same as `advance`, but permitted on `human_review` stages.
    pub fn approve(&self, issue_id: &str, runtime: &mut dyn StageRuntime) -> Result<Issue, AgentTreeError> {
        self.transition(issue_id, Intent::Approve, runtime)
    }

    /// Used by the sync loop when CI fails or a conflict cannot be
    /// auto-rebased. Resource state (container, branch, worktree) is
    /// preserved; no hooks run.
    pub fn step_back(
        &self,
        issue_id: &str,
        to_stage: &str,
        to_substage: Option<&str>,
        message: &str,
        runtime: &mut dyn StageRuntime,
    ) -> Result<Issue, AgentTreeError> {
        let issue = self.issues.step_back(issue_id, to_stage, to_substage, message)?;
        runtime.send_message(&issue, message).map_err(|e| AgentTreeError::NonFatalPostStart {
            hook_name: "send_message".into(),
            message: e.to_string(),
        })?;
        Ok(issue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{BuiltinAction, PrStatus};
    use crate::issue::Priority;

    const CONFIG: &str = r#"
project = "demo"
worktrees_dir = "../worktrees"
default_tool = "claude"

[port_range]
min = 9000
max = 9100

[[stages]]
name = "backlog"

[[stages]]
name = "define"

[[stages]]
name = "implement"
substages = ["coding", "feedback"]

[[stages]]
name = "plan_review"
human_review = true

[[stages]]
name = "accepted"
terminal = true
"#;

    struct FakeRuntime {
        cleaned_up: Vec<String>,
        messages: Vec<(String, String)>,
    }

    impl HookRuntime for FakeRuntime {
        fn pr_status(&mut self, _pr_number: u64) -> anyhow::Result<PrStatus> {
            unimplemented!()
        }
        fn has_commits_since_base(&mut self, _branch: &str, _base: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
        fn run_builtin(&mut self, _action: BuiltinAction, _ctx: &HookContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    impl StageRuntime for FakeRuntime {
        fn cleanup_terminal_issue(&mut self, issue: &Issue) -> anyhow::Result<()> {
            self.cleaned_up.push(issue.id.clone());
            Ok(())
        }
        fn send_message(&mut self, issue: &Issue, message: &str) -> anyhow::Result<()> {
            self.messages.push((issue.id.clone(), message.to_string()));
            Ok(())
        }
    }

    #[test]
    fn advance_moves_to_first_substage_of_next_stage() {
        let config = AgentTreeConfig::parse(CONFIG).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let issues = IssueStore::new(tmp.path());
        let issue = issues.create("Add dark mode", Priority::Medium, vec![], vec![], "backlog").unwrap();
        let machine = StageMachine::new(&config, &issues, |_issue| tmp.path().to_path_buf());
        let mut runtime = FakeRuntime { cleaned_up: vec![], messages: vec![] };

        let advanced = machine.advance(&issue.id, &mut runtime).unwrap();
        assert_eq!(advanced.stage, "define");

        let advanced = machine.advance(&issue.id, &mut runtime).unwrap();
        assert_eq!(advanced.stage, "implement");
        assert_eq!(advanced.substage.as_deref(), Some("coding"));
    }

    #[test]
    fn advance_within_stage_moves_to_next_substage() {
        let config = AgentTreeConfig::parse(CONFIG).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let issues = IssueStore::new(tmp.path());
        let issue = issues.update_stage(
            &issues.create("X", Priority::Low, vec![], vec![], "backlog").unwrap().id,
            "implement",
            Some("coding"),
        ).unwrap();
        let machine = StageMachine::new(&config, &issues, |_issue| tmp.path().to_path_buf());
        let mut runtime = FakeRuntime { cleaned_up: vec![], messages: vec![] };

        let advanced = machine.advance(&issue.id, &mut runtime).unwrap();
        assert_eq!(advanced.stage, "implement");
        assert_eq!(advanced.substage.as_deref(), Some("feedback"));
    }

    #[test]
    fn advance_refuses_on_human_review_stage() {
        let config = AgentTreeConfig::parse(CONFIG).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let issues = IssueStore::new(tmp.path());
        let issue = issues.update_stage(
            &issues.create("X", Priority::Low, vec![], vec![], "backlog").unwrap().id,
            "plan_review",
            None,
        ).unwrap();
        let machine = StageMachine::new(&config, &issues, |_issue| tmp.path().to_path_buf());
        let mut runtime = FakeRuntime { cleaned_up: vec![], messages: vec![] };

        assert!(machine.advance(&issue.id, &mut runtime).is_err());
        assert!(machine.approve(&issue.id, &mut runtime).is_ok());
    }

    #[test]
    fn advance_refuses_on_terminal_stage() {
        let config = AgentTreeConfig::parse(CONFIG).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let issues = IssueStore::new(tmp.path());
        let issue = issues.update_stage(
            &issues.create("X", Priority::Low, vec![], vec![], "backlog").unwrap().id,
            "accepted",
            None,
        ).unwrap();
        let machine = StageMachine::new(&config, &issues, |_issue| tmp.path().to_path_buf());
        let mut runtime = FakeRuntime { cleaned_up: vec![], messages: vec![] };

        assert!(machine.advance(&issue.id, &mut runtime).is_err());
    }

    #[test]
    fn entering_terminal_stage_runs_cleanup_and_clears_assignment() {
        let config = AgentTreeConfig::parse(CONFIG).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let issues = IssueStore::new(tmp.path());
        let issue = issues.create("X", Priority::Low, vec![], vec![], "backlog").unwrap();
        issues.assign(&issue.id, "coder", "issue-001").unwrap();
        let issue = issues.update_stage(&issue.id, "plan_review", None).unwrap();
        let machine = StageMachine::new(&config, &issues, |_issue| tmp.path().to_path_buf());
        let mut runtime = FakeRuntime { cleaned_up: vec![], messages: vec![] };

        let approved = machine.approve(&issue.id, &mut runtime).unwrap();
        assert_eq!(approved.stage, "accepted");
        assert!(runtime.cleaned_up.contains(&issue.id));
        assert!(approved.assigned_agent.is_none());
    }

    #[test]
    fn step_back_preserves_resource_state_and_sends_message() {
        let config = AgentTreeConfig::parse(CONFIG).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let issues = IssueStore::new(tmp.path());
        let issue = issues.create("X", Priority::Low, vec![], vec![], "backlog").unwrap();
        issues.assign(&issue.id, "coder", "issue-001").unwrap();
        let issue = issues.update_stage(&issue.id, "implement", Some("coding")).unwrap();
        let machine = StageMachine::new(&config, &issues, |_issue| tmp.path().to_path_buf());
        let mut runtime = FakeRuntime { cleaned_up: vec![], messages: vec![] };

        let stepped = machine
            .step_back(&issue.id, "implement", Some("feedback"), "CI checks failed on PR #17", &mut runtime)
            .unwrap();
        assert_eq!(stepped.substage.as_deref(), Some("feedback"));
        assert_eq!(stepped.assigned_agent.as_deref(), Some("coder"));
        assert_eq!(runtime.messages.len(), 1);
        assert!(runtime.messages[0].1.contains("PR #17"));
    }
}
