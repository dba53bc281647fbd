//! Shared fixtures for integration tests: a fake [`StageRuntime`] and the
//! small TOML configs each scenario needs, following the same
//! config-string-literal-plus-`FakeRuntime` shape `stage.rs`'s own unit
//! tests use, just outside the crate.

#![allow(dead_code)]

use agenttree::hooks::{BuiltinAction, HookContext, HookRuntime, PrStatus};
use agenttree::issue::Issue;
use agenttree::stage::StageRuntime;

/// A `StageRuntime` double that records cleanup/messaging calls instead of
/// touching a container runtime or forge, and lets a test script canned PR
/// status and commit-ahead-of-base answers.
pub struct FakeRuntime {
    pub cleaned_up: Vec<String>,
    pub messages: Vec<(String, String)>,
    pub pr_status: Option<PrStatus>,
    pub has_commits: bool,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self { cleaned_up: vec![], messages: vec![], pr_status: None, has_commits: true }
    }
}

impl HookRuntime for FakeRuntime {
    fn pr_status(&mut self, _pr_number: u64) -> anyhow::Result<PrStatus> {
        self.pr_status.clone().ok_or_else(|| anyhow::anyhow!("no pr_status configured for this test"))
    }
    fn has_commits_since_base(&mut self, _branch: &str, _base: &str) -> anyhow::Result<bool> {
        Ok(self.has_commits)
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
