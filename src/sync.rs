//! Controller sync loop (§4.9): the reconciliation engine, one reconciler
//! with numbered steps and injected collaborators (§9 redesign flag),
//! directly analogous to `CommandContext` bundling `repo`/`config`/`branch`/
//! `worktree_path` for a single pass in the teacher's command executor.

use std::cell::Cell;
use std::path::Path;

use crate::allocator::Allocator;
use crate::config::AgentTreeConfig;
use crate::container::{self, ContainerManager, Mount, SessionManager};
use crate::error::{AgentTreeError, ExternalToolCategory};
use crate::forge::ForgeClient;
use crate::hooks::kinds::{BuiltinAction, PrStatus};
use crate::hooks::{Environment, HookContext, HookFailureStrategy, HookRuntime, evaluate_all};
use crate::issue::{Issue, IssueStore};
use crate::shell_exec::Cmd;
use crate::stage::{StageMachine, StageRuntime};
use crate::worktree::WorktreeManager;

/// Everything one sync iteration needs, held by reference so the loop is
/// testable by substituting fake forge/container/session collaborators.
pub struct SyncLoop<'a> {
    project: String,
    config: &'a AgentTreeConfig,
    sidecar: &'a crate::sidecar::SidecarRepo,
    forge: &'a ForgeClient,
    issues: &'a IssueStore,
    allocator: &'a Allocator,
    containers: &'a ContainerManager,
    sessions: &'a SessionManager,
    worktrees: &'a WorktreeManager,
    repo_root: std::path::PathBuf,
    /// Set for the duration of `run_once`; hooks invoked from inside it must
    /// not themselves invoke `sync()` (§4.9 "Recursion safety").
    running: Cell<bool>,
}

/// Summary of one completed iteration, for CLI `status`/logging.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub pushed_branches: usize,
    pub prs_created: usize,
    pub merges_detected: usize,
    pub stages_advanced: usize,
    pub issues_unblocked: usize,
    pub post_sync_failures: Vec<(String, String)>,
}

impl<'a> SyncLoop<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project: impl Into<String>,
        config: &'a AgentTreeConfig,
        sidecar: &'a crate::sidecar::SidecarRepo,
        forge: &'a ForgeClient,
        issues: &'a IssueStore,
        allocator: &'a Allocator,
        containers: &'a ContainerManager,
        sessions: &'a SessionManager,
        worktrees: &'a WorktreeManager,
        repo_root: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            project: project.into(),
            config,
            sidecar,
            forge,
            issues,
            allocator,
            containers,
            sessions,
            worktrees,
            repo_root: repo_root.into(),
            running: Cell::new(false),
        }
    }

    fn git(&self, worktree: &Path, args: &[&str]) -> Result<std::process::Output, AgentTreeError> {
        Cmd::new("git").args(args.iter().copied()).current_dir(worktree).run().map_err(|e| {
            AgentTreeError::ExternalTool {
                category: ExternalToolCategory::Other,
                tool: "git".into(),
                message: format!("failed to run git {}: {e}", args.join(" ")),
            }
        })
    }

    fn base_branch(&self) -> String {
        self.config.extra.get("base_branch").and_then(|v| v.as_str()).unwrap_or("main").to_string()
    }

    /// One full iteration of §4.9's ten steps. Returns `None` (skipping the
    /// tick) if the sidecar lock is already held or a sync is already
    /// running on this process (reentrancy guard).
    pub fn run_once(&self) -> Result<Option<SyncReport>, AgentTreeError> {
        if self.running.get() {
            return Ok(None);
        }
        self.running.set(true);
        let result = self.run_once_inner();
        self.running.set(false);
        result
    }

    fn run_once_inner(&self) -> Result<Option<SyncReport>, AgentTreeError> {
        // Step 1: acquire the sidecar lock for the whole iteration, so no
        // other `agt` process can interleave a PR-gate check or commit+push
        // with this one (§8 "Lock exclusion").
        let _lock = match self.sidecar.lock() {
            Ok(lock) => lock,
            Err(AgentTreeError::ResourceLocked { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        // Step 2: pull.
        self.sidecar.sync_locked(true)?;

        let mut report = SyncReport::default();

        // Step 3: push pending agent branches.
        report.pushed_branches = self.push_pending_branches()?;

        // Step 4: ensure PR at implementation-review gate.
        report.prs_created = self.ensure_prs_at_gate()?;

        // Step 5: detect external merges.
        report.merges_detected = self.detect_external_merges()?;

        // Step 6: advance host-controlled stages whose pre-completion hooks now pass.
        report.stages_advanced = self.advance_host_controlled_stages()?;

        // Step 7: start newly-unblocked issues.
        report.issues_unblocked = self.start_unblocked_issues()?;

        // Step 8: run configured post_sync hooks, then prune hook_state
        // entries orphaned by config changes (§9 "stale hook-state GC").
        report.post_sync_failures = self.run_post_sync_hooks()?;
        self.prune_stale_hook_state()?;

        // Step 9: commit and push sidecar changes, still under the same lock.
        self.sidecar.commit_locked("sync: reconcile issue and state records")?;

        // Step 10: release lock (dropped here, at the end of the scope).
        Ok(Some(report))
    }

    /// Step 3.
    fn push_pending_branches(&self) -> Result<usize, AgentTreeError> {
        let agents = self.allocator.list_agents()?;
        let mut pushed = 0;
        for agent in agents {
            let has_commits = self.has_commits_since_base_impl(&agent.worktree, &agent.branch, &self.base_branch())?;
            if !has_commits {
                continue;
            }
            let output = self.git(&agent.worktree, &["push", "-u", "origin", &agent.branch])?;
            if output.status.success() {
                pushed += 1;
            } else {
                log::warn!(
                    "failed to push branch {} for issue {}: {}",
                    agent.branch,
                    agent.issue_id,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }
        Ok(pushed)
    }

    fn has_commits_since_base_impl(&self, worktree: &Path, branch: &str, base: &str) -> Result<bool, AgentTreeError> {
        let range = format!("origin/{base}..{branch}");
        let output = self.git(worktree, &["rev-list", "--count", &range])?;
        if !output.status.success() {
            return Ok(false);
        }
        let count: u64 = String::from_utf8_lossy(&output.stdout).trim().parse().unwrap_or(0);
        Ok(count > 0)
    }

    /// Step 4: idempotent — a PR already recorded or already existing for
    /// the branch is reused, never duplicated.
    fn ensure_prs_at_gate(&self) -> Result<usize, AgentTreeError> {
        let mut created = 0;
        for issue in self.issues.list() {
            if issue.stage != "implementation_review" || issue.pr_number.is_some() {
                continue;
            }
            let Some(branch) = issue.branch.clone() else { continue };
            let Some(agent) = self.allocator.get_agent(&issue.id, issue.assigned_agent.as_deref().unwrap_or(""))? else {
                continue;
            };

            self.git(&agent.worktree, &["add", "-A"])?;
            let status = self.git(&agent.worktree, &["status", "--porcelain"])?;
            if !String::from_utf8_lossy(&status.stdout).trim().is_empty() {
                self.git(&agent.worktree, &["commit", "-q", "-m", "sync: auto-commit pending changes"])?;
            }
            self.git(&agent.worktree, &["push", "-u", "origin", &branch])?;

            let base = self.base_branch();
            let pr = match self.forge.create_pr(&branch, &base, &issue.title, "Opened automatically by the sync loop.") {
                Ok(pr) => pr,
                Err(AgentTreeError::ExternalTool { category: ExternalToolCategory::Conflict, .. }) => {
                    match self.forge.get_pr_for_branch(&branch) {
                        Ok(Some(existing)) => existing,
                        _ => continue,
                    }
                }
                Err(e) => {
                    log::warn!("failed to create PR for issue {}: {e}", issue.id);
                    continue;
                }
            };
            self.issues.set_pr(&issue.id, pr.number)?;
            created += 1;
        }
        Ok(created)
    }

    /// Step 5: merging on the forge counts as approval — the only path that
    /// skips the `approve` button.
    fn detect_external_merges(&self) -> Result<usize, AgentTreeError> {
        let machine = StageMachine::new(self.config, self.issues, |issue| self.worktrees.path_for_issue(&issue.id, &issue.slug));
        let mut advanced = 0;
        for issue in self.issues.list() {
            if issue.stage != "implementation_review" {
                continue;
            }
            let Some(pr_number) = issue.pr_number else { continue };
            let status = self.forge.pr_status(pr_number)?;
            if status.merged {
                let mut runtime = self.runtime();
                machine.approve(&issue.id, &mut runtime)?;
                advanced += 1;
            }
        }
        Ok(advanced)
    }

    /// Step 6: host-controlled stages (`host = true`, e.g. the
    /// `implementation_review` gate) waiting on CI or another host-side check.
    fn advance_host_controlled_stages(&self) -> Result<usize, AgentTreeError> {
        let machine = StageMachine::new(self.config, self.issues, |issue| self.worktrees.path_for_issue(&issue.id, &issue.slug));
        let mut advanced = 0;
        for issue in self.issues.list() {
            let Some(stage_config) = self.config.stage(&issue.stage) else { continue };
            if !stage_config.host {
                continue;
            }

            let ctx = HookContext {
                issue_id: issue.id.clone(),
                branch: issue.branch.clone(),
                base_branch: self.base_branch(),
                pr_number: issue.pr_number,
                pr_url: None,
                failure_reason: None,
                environment: Environment::Host,
                worktree_root: self.worktrees.path_for_issue(&issue.id, &issue.slug),
                sync_counter: 0,
            };
            let mut runtime = self.runtime();
            let report = evaluate_all(
                &stage_config.pre_completion,
                &ctx,
                &Default::default(),
                &mut runtime as &mut dyn HookRuntime,
                HookFailureStrategy::FailFast,
            );

            if report.failures.is_empty() {
                machine.advance(&issue.id, &mut runtime)?;
                advanced += 1;
            } else {
                let reason = report
                    .failures
                    .iter()
                    .map(|(name, message)| format!("{name}: {message}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                let feedback_substage = stage_config.extra.get("feedback_substage").and_then(|v| v.as_str());
                machine.step_back(&issue.id, &issue.stage, feedback_substage, &reason, &mut runtime)?;
            }
        }
        Ok(advanced)
    }

    /// Step 7: any issue whose `blocked_by` list is fully terminal at
    /// `accepted` becomes eligible for the `start_blocked_issues` built-in,
    /// which dispatches it exactly as `agt start` would: worktree, container,
    /// session, all idempotent on a retried sync tick.
    fn start_unblocked_issues(&self) -> Result<usize, AgentTreeError> {
        let all = self.issues.list();
        let mut unblocked = 0;
        for issue in &all {
            if issue.blocked_by.is_empty() || issue.stage != "backlog" {
                continue;
            }
            let all_accepted = issue.blocked_by.iter().all(|dep_id| {
                all.iter().any(|other| other.id == *dep_id && other.stage == "accepted")
            });
            if all_accepted {
                self.dispatch_issue(issue)?;
                log::info!("issue {} is now unblocked and dispatched", issue.id);
                unblocked += 1;
            }
        }
        Ok(unblocked)
    }

    /// Starts an issue's agent under the project's default role (the first
    /// entry under `[roles]`, same fallback `cmd_start` uses when no role is
    /// given explicitly). Reuses a live `(issue, role)` agent instead of
    /// re-registering it.
    fn dispatch_issue(&self, issue: &Issue) -> Result<(), AgentTreeError> {
        let role = self.config.roles.keys().next().cloned().ok_or_else(|| AgentTreeError::ExternalTool {
            category: ExternalToolCategory::Other,
            tool: "dispatch".into(),
            message: "no roles configured under [roles]".into(),
        })?;
        let role_config = self.config.roles.get(&role).ok_or_else(|| AgentTreeError::ExternalTool {
            category: ExternalToolCategory::Other,
            tool: "dispatch".into(),
            message: format!("unknown role {role}"),
        })?;
        let tool_config = self.config.tools.get(&role_config.tool).ok_or_else(|| AgentTreeError::ExternalTool {
            category: ExternalToolCategory::Other,
            tool: "dispatch".into(),
            message: format!("role {role} references unknown tool {}", role_config.tool),
        })?;

        let numeric_id: u64 = issue.id.parse().unwrap_or(0);
        let branch = issue.branch.clone().unwrap_or_else(|| format!("issue-{}", issue.id));
        let base = self.base_branch();
        let worktree_path =
            self.worktrees.create(&issue.id, &issue.slug, &branch, &base).map_err(|e| AgentTreeError::ExternalTool {
                category: ExternalToolCategory::Other,
                tool: "git".into(),
                message: e.to_string(),
            })?;

        let container_name = container::container_name(&self.project, &issue.id);
        let session_name = container::role_session_name(&self.project, &role, &issue.id);

        let already_live = self.allocator.get_agent(&issue.id, &role)?;
        let port = match already_live {
            Some(agent) => agent.port,
            None => {
                let port = self.allocator.register_agent(
                    &issue.id, numeric_id, &role, &container_name, &session_name, &branch, &worktree_path,
                )?;
                self.issues.assign(&issue.id, &role, &branch)?;

                let port_str = port.to_string();
                let env = container::base_env(&issue.id, &role, Some(port_str.as_str()));
                let image = self.config.extra.get("image").and_then(|v| v.as_str()).unwrap_or("agenttree/agent:latest");
                self.containers.start(&container_name, image, &[Mount::workspace(worktree_path.clone())], &env, None)?;
                port
            }
        };

        let port_str = port.to_string();
        let env = container::base_env(&issue.id, &role, Some(port_str.as_str()));
        let runtime_bin = self.containers.runtime().to_string();
        let argv = container::exec_argv(&runtime_bin, &container_name, &env, &tool_config.command);
        let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        self.sessions.create(&session_name, &worktree_path, &[], &argv_refs)?;
        if let Some(prompt) = &tool_config.initial_prompt {
            self.sessions.send_keys(&session_name, prompt)?;
        }

        if let Some(serve_command) = self.config.commands.get("serve") {
            let serve_session = container::serve_session_name(&self.project, &issue.id);
            let serve_argv = container::exec_argv(&runtime_bin, &container_name, &env, serve_command);
            let serve_argv_refs: Vec<&str> = serve_argv.iter().map(String::as_str).collect();
            self.sessions.create(&serve_session, &worktree_path, &[], &serve_argv_refs)?;
        }

        Ok(())
    }

    /// Step 8. `controller_hooks.post_sync` hooks are controller-level, not
    /// tied to any single issue, so there is no issue worktree to resolve
    /// `worktree_root` against; it stays the project checkout.
    fn run_post_sync_hooks(&self) -> Result<Vec<(String, String)>, AgentTreeError> {
        let ctx = HookContext {
            issue_id: String::new(),
            branch: None,
            base_branch: self.base_branch(),
            pr_number: None,
            pr_url: None,
            failure_reason: None,
            environment: Environment::Host,
            worktree_root: self.repo_root.clone(),
            sync_counter: 0,
        };
        let mut runtime = self.runtime();
        let report = evaluate_all(
            &self.config.controller_hooks.post_sync,
            &ctx,
            &Default::default(),
            &mut runtime as &mut dyn HookRuntime,
            HookFailureStrategy::Warn,
        );
        Ok(report.failures)
    }

    /// Part of step 8: every declared hook name across all stages and
    /// `controller_hooks.post_sync`, union'd into the set of names an
    /// issue's `hook_state` is allowed to carry. Anything else was left
    /// behind by a renamed or deleted hook declaration and gets dropped.
    fn valid_hook_names(&self) -> std::collections::HashSet<String> {
        let mut names = std::collections::HashSet::new();
        for stage in &self.config.stages {
            for decl in stage.pre_completion.iter().chain(&stage.post_start) {
                names.insert(decl.display_name());
            }
        }
        for decl in &self.config.controller_hooks.post_sync {
            names.insert(decl.display_name());
        }
        names
    }

    fn prune_stale_hook_state(&self) -> Result<(), AgentTreeError> {
        let valid_names = self.valid_hook_names();
        for issue in self.issues.list() {
            if issue.hook_state.is_empty() {
                continue;
            }
            self.issues.prune_hook_state(&issue.id, &valid_names)?;
        }
        Ok(())
    }

    /// A `HookRuntime`/`StageRuntime` adapter over this loop's
    /// collaborators, for the CLI to drive `advance`/`approve`/`run` outside
    /// a full sync tick with the exact same cleanup/messaging behavior.
    pub fn runtime(&self) -> SyncLoopRuntime<'_, 'a> {
        SyncLoopRuntime { sync: self }
    }
}

/// Adapter implementing [`HookRuntime`]/[`StageRuntime`] over a `&SyncLoop`,
/// since the trait methods need `&mut self` but `SyncLoop`'s own methods
/// only need `&self` (all mutable state lives behind the allocator/sidecar
/// locks, not in the loop itself).
pub struct SyncLoopRuntime<'s, 'a> {
    sync: &'s SyncLoop<'a>,
}

impl HookRuntime for SyncLoopRuntime<'_, '_> {
    fn pr_status(&mut self, pr_number: u64) -> anyhow::Result<PrStatus> {
        Ok(self.sync.forge.pr_status(pr_number)?)
    }

    fn has_commits_since_base(&mut self, branch: &str, base: &str) -> anyhow::Result<bool> {
        // Looked up via the live agent registry: the sync loop only ever
        // asks this about a branch with a known worktree.
        let agents = self.sync.allocator.list_agents()?;
        let Some(agent) = agents.iter().find(|a| a.branch == branch) else {
            return Ok(false);
        };
        Ok(self.sync.has_commits_since_base_impl(&agent.worktree, branch, base)?)
    }

    fn run_builtin(&mut self, action: BuiltinAction, ctx: &HookContext) -> anyhow::Result<()> {
        match action {
            BuiltinAction::PushPendingBranches => {
                self.sync.push_pending_branches()?;
            }
            BuiltinAction::CheckMergedPrs => {
                self.sync.detect_external_merges()?;
            }
            BuiltinAction::CheckControllerStages => {
                self.sync.advance_host_controlled_stages()?;
            }
            BuiltinAction::StartBlockedIssues => {
                self.sync.start_unblocked_issues()?;
            }
            BuiltinAction::CreatePr => {
                self.sync.ensure_prs_at_gate()?;
            }
            BuiltinAction::MergePr { strategy } => {
                if let Some(pr_number) = ctx.pr_number {
                    self.sync.forge.merge_pr(pr_number, strategy.as_deref())?;
                }
            }
            BuiltinAction::Rebase => {
                if let Some(agent) = self.sync.allocator.list_agents()?.into_iter().find(|a| a.issue_id == ctx.issue_id) {
                    self.sync.git(&agent.worktree, &["rebase", &format!("origin/{}", ctx.base_branch)])?;
                }
            }
            BuiltinAction::CleanupAgent => {
                let agents: Vec<_> =
                    self.sync.allocator.list_agents()?.into_iter().filter(|a| a.issue_id == ctx.issue_id).collect();
                for agent in &agents {
                    self.cleanup_agent(agent)?;
                }
            }
        }
        Ok(())
    }
}

impl SyncLoopRuntime<'_, '_> {
    fn cleanup_agent(&self, agent: &crate::allocator::AgentEntry) -> anyhow::Result<()> {
        self.sync.sessions.kill(&container::role_session_name(&self.sync.project, &agent.role, &agent.issue_id))?;
        self.sync.containers.stop(&agent.container)?;
        self.sync.containers.remove(&agent.container)?;
        self.sync.allocator.unregister_agent(&agent.issue_id, &agent.role)?;
        Ok(())
    }
}

impl StageRuntime for SyncLoopRuntime<'_, '_> {
    /// §4.7 terminal entry: container down, sessions killed, worktree
    /// removed, port freed, registry entry deleted.
    fn cleanup_terminal_issue(&mut self, issue: &Issue) -> anyhow::Result<()> {
        let agents: Vec<_> =
            self.sync.allocator.list_agents()?.into_iter().filter(|a| a.issue_id == issue.id).collect();
        for agent in &agents {
            let serve_session = container::serve_session_name(&self.sync.project, &issue.id);
            self.sync.sessions.kill(&serve_session)?;
            self.cleanup_agent(agent)?;
        }
        if let Some(branch) = &issue.branch {
            self.sync.worktrees.remove(&issue.id, &issue.slug, branch)?;
        }
        Ok(())
    }

    /// Resource state is preserved by design (§4.7); only the agent's
    /// role session is poked.
    fn send_message(&mut self, issue: &Issue, message: &str) -> anyhow::Result<()> {
        if let Some(role) = &issue.assigned_agent {
            let session_name = container::role_session_name(&self.sync.project, role, &issue.id);
            self.sync.sessions.send_keys(&session_name, message)?;
        }
        Ok(())
    }
}
