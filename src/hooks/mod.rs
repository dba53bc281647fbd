//! Hook engine (§4.6): evaluates pre-completion and post-start hooks
//! declared per stage, resolves placeholders from issue context, and
//! enforces host-only vs container execution and rate limiting.
//!
//! Hook *kinds* are a closed, tagged enum (`HookKind`, in [`kinds`]) rather
//! than the dynamic string-keyed dispatch of the source system (§9): a
//! fixed registry mapping symbolic names to concrete handler types, with
//! shell/webhook kinds as their own variants.

pub mod kinds;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use kinds::{BuiltinAction, HookKind, PrStatus};

use crate::template::PlaceholderContext;

/// Whether the hook is being evaluated on the controller host or inside an
/// issue's container (§9 redesign flag: an explicit value threaded through
/// the engine, not re-read from an environment variable at each call site).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Host,
    Container,
}

impl Environment {
    /// The one place the env var is read, at process start.
    pub fn detect() -> Self {
        match std::env::var("AGENTTREE_CONTAINER").as_deref() {
            Ok("1") => Environment::Container,
            _ => Environment::Host,
        }
    }
}

/// How a failing hook should affect the caller (§4.6 aggregation rules).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookFailureStrategy {
    /// Pre-completion: any non-optional failure blocks the transition.
    FailFast,
    /// Post-start: non-optional failures are logged but never roll back.
    Warn,
}

/// One hook declaration under a stage or under `controller_hooks.post_sync`.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema, PartialEq)]
pub struct HookDecl {
    /// Display name; defaults to the kind's tag if absent.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: HookKind,
    #[serde(default)]
    pub host_only: bool,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub timeout_s: Option<u64>,
    #[serde(default)]
    pub min_interval_s: Option<u64>,
    #[serde(default)]
    pub run_every_n_syncs: Option<u32>,
}

impl HookDecl {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.kind.tag().to_string())
    }
}

/// Outcome of evaluating a single hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Pass,
    Fail(String),
    /// `host_only` hook running in a container, or rate-limited this tick.
    Skipped,
}

/// Per-hook-state bookkeeping, persisted in `.sync_hook_state.yaml` for
/// sync-loop hooks or under an issue's `hook_state` for issue-scoped hooks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookState {
    pub last_run_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub last_success: bool,
}

/// Everything a hook needs to resolve placeholders and locate files, for
/// one evaluation.
pub struct HookContext {
    pub issue_id: String,
    pub branch: Option<String>,
    pub base_branch: String,
    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
    pub failure_reason: Option<String>,
    pub environment: Environment,
    pub worktree_root: PathBuf,
    /// Sync tick counter, for `run_every_n_syncs`; 0 for non-sync-loop callers.
    pub sync_counter: u64,
}

impl HookContext {
    pub fn placeholders(&self) -> PlaceholderContext {
        PlaceholderContext::new()
            .with("issue_id", &self.issue_id)
            .with_opt("branch", self.branch.clone())
            .with_opt("pr_number", self.pr_number.map(|n| n.to_string()))
            .with_opt("pr_url", self.pr_url.clone())
            .with_opt("failure_reason", self.failure_reason.clone())
    }
}

/// Side-effecting collaborators a hook's built-in actions and PR/git
/// validators need, injected by the caller (the stage machine or the sync
/// loop) rather than constructed inside the engine.
pub trait HookRuntime {
    fn pr_status(&mut self, pr_number: u64) -> anyhow::Result<PrStatus>;
    fn has_commits_since_base(&mut self, branch: &str, base: &str) -> anyhow::Result<bool>;
    fn run_builtin(&mut self, action: BuiltinAction, ctx: &HookContext) -> anyhow::Result<()>;
}

fn rate_limit_gate(decl: &HookDecl, state: Option<&HookState>, sync_counter: u64) -> bool {
    if let Some(min_interval_s) = decl.min_interval_s
        && let Some(state) = state
        && let Some(last_run_at) = state.last_run_at
    {
        let elapsed = chrono::Utc::now().signed_duration_since(last_run_at);
        if elapsed.num_seconds() < min_interval_s as i64 {
            return false;
        }
    }
    if let Some(n) = decl.run_every_n_syncs
        && n > 0
        && sync_counter % u64::from(n) != 0
    {
        return false;
    }
    true
}

/// Evaluate one hook declaration, honoring `host_only` skip and rate limits.
/// Does not itself persist [`HookState`]; the caller updates state from the
/// returned outcome.
pub fn evaluate_one(
    decl: &HookDecl,
    ctx: &HookContext,
    state: Option<&HookState>,
    runtime: &mut dyn HookRuntime,
) -> HookOutcome {
    if decl.host_only && ctx.environment == Environment::Container {
        return HookOutcome::Skipped;
    }
    if !rate_limit_gate(decl, state, ctx.sync_counter) {
        return HookOutcome::Skipped;
    }

    match decl.kind.evaluate(ctx, runtime) {
        Ok(outcome) => outcome,
        Err(e) => HookOutcome::Fail(e.to_string()),
    }
}

/// Aggregate a declaration list's outcomes (§4.6 "Aggregation").
///
/// Hooks run in declaration order. For `FailFast` (pre-completion), the
/// first non-optional failure stops evaluation and the aggregated error is
/// returned. For `Warn` (post-start), every hook runs; failures are
/// collected but never returned as blocking.
pub struct HookRunReport {
    pub failures: Vec<(String, String)>,
    pub ran: usize,
    pub skipped: usize,
}

pub fn evaluate_all(
    decls: &[HookDecl],
    ctx: &HookContext,
    states: &std::collections::HashMap<String, HookState>,
    runtime: &mut dyn HookRuntime,
    strategy: HookFailureStrategy,
) -> HookRunReport {
    let mut report = HookRunReport {
        failures: Vec::new(),
        ran: 0,
        skipped: 0,
    };

    for decl in decls {
        let name = decl.display_name();
        let state = states.get(&name);
        match evaluate_one(decl, ctx, state, runtime) {
            HookOutcome::Pass => report.ran += 1,
            HookOutcome::Skipped => report.skipped += 1,
            HookOutcome::Fail(message) => {
                report.ran += 1;
                if !decl.optional {
                    report.failures.push((name, message));
                    if strategy == HookFailureStrategy::FailFast {
                        return report;
                    }
                }
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::kinds::FileExistsArgs;

    struct NoopRuntime;
    impl HookRuntime for NoopRuntime {
        fn pr_status(&mut self, _pr_number: u64) -> anyhow::Result<PrStatus> {
            unimplemented!()
        }
        fn has_commits_since_base(&mut self, _branch: &str, _base: &str) -> anyhow::Result<bool> {
            unimplemented!()
        }
        fn run_builtin(&mut self, _action: BuiltinAction, _ctx: &HookContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn ctx(root: PathBuf) -> HookContext {
        HookContext {
            issue_id: "042".into(),
            branch: Some("issue-042".into()),
            base_branch: "main".into(),
            pr_number: None,
            pr_url: None,
            failure_reason: None,
            environment: Environment::Host,
            worktree_root: root,
            sync_counter: 0,
        }
    }

    #[test]
    fn host_only_hook_skipped_in_container() {
        let decl = HookDecl {
            name: None,
            kind: HookKind::FileExists(FileExistsArgs { path: "problem.md".into() }),
            host_only: true,
            optional: false,
            timeout_s: None,
            min_interval_s: None,
            run_every_n_syncs: None,
        };
        let mut runtime = NoopRuntime;
        let tmp = tempfile::tempdir().unwrap();
        let mut c = ctx(tmp.path().to_path_buf());
        c.environment = Environment::Container;
        assert_eq!(evaluate_one(&decl, &c, None, &mut runtime), HookOutcome::Skipped);
    }

    #[test]
    fn rate_limited_hook_skipped_within_interval() {
        let decl = HookDecl {
            name: Some("check_ci_status".into()),
            kind: HookKind::FileExists(FileExistsArgs { path: "problem.md".into() }),
            host_only: false,
            optional: false,
            timeout_s: None,
            min_interval_s: Some(60),
            run_every_n_syncs: None,
        };
        let state = HookState {
            last_run_at: Some(chrono::Utc::now()),
            run_count: 1,
            last_success: true,
        };
        let mut runtime = NoopRuntime;
        let tmp = tempfile::tempdir().unwrap();
        let c = ctx(tmp.path().to_path_buf());
        assert_eq!(
            evaluate_one(&decl, &c, Some(&state), &mut runtime),
            HookOutcome::Skipped
        );
    }

    #[test]
    fn run_every_n_syncs_gates_on_counter() {
        let decl = HookDecl {
            name: Some("n".into()),
            kind: HookKind::FileExists(FileExistsArgs { path: "problem.md".into() }),
            host_only: false,
            optional: false,
            timeout_s: None,
            min_interval_s: None,
            run_every_n_syncs: Some(3),
        };
        let mut runtime = NoopRuntime;
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("problem.md"), "hi").unwrap();
        let mut c = ctx(tmp.path().to_path_buf());
        c.sync_counter = 1;
        assert_eq!(evaluate_one(&decl, &c, None, &mut runtime), HookOutcome::Skipped);
        c.sync_counter = 3;
        assert_eq!(evaluate_one(&decl, &c, None, &mut runtime), HookOutcome::Pass);
    }

    #[test]
    fn fail_fast_stops_on_first_non_optional_failure() {
        let decls = vec![
            HookDecl {
                name: Some("missing".into()),
                kind: HookKind::FileExists(FileExistsArgs { path: "nope.md".into() }),
                host_only: false,
                optional: false,
                timeout_s: None,
                min_interval_s: None,
                run_every_n_syncs: None,
            },
            HookDecl {
                name: Some("never_reached".into()),
                kind: HookKind::FileExists(FileExistsArgs { path: "also-nope.md".into() }),
                host_only: false,
                optional: false,
                timeout_s: None,
                min_interval_s: None,
                run_every_n_syncs: None,
            },
        ];
        let mut runtime = NoopRuntime;
        let tmp = tempfile::tempdir().unwrap();
        let c = ctx(tmp.path().to_path_buf());
        let report = evaluate_all(
            &decls,
            &c,
            &std::collections::HashMap::new(),
            &mut runtime,
            HookFailureStrategy::FailFast,
        );
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "missing");
    }
}
