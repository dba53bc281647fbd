//! Scenario 6: a `post_sync` hook with `min_interval_s` runs at most once
//! per interval, and again once enough time has passed. `hooks::mod`'s own
//! unit tests cover the "still within the window" half of this
//! (`rate_limited_hook_skipped_within_interval`); this exercises the second
//! tick crossing the interval, which needs a controllable elapsed time
//! rather than a real sleep.

mod common;

use agenttree::hooks::kinds::FileExistsArgs;
use agenttree::hooks::{Environment, HookContext, HookDecl, HookKind, HookOutcome, HookState, evaluate_one};

use common::FakeRuntime;

fn decl() -> HookDecl {
    HookDecl {
        name: Some("check_ci_status".into()),
        kind: HookKind::FileExists(FileExistsArgs { path: "problem.md".into() }),
        host_only: false,
        optional: false,
        timeout_s: None,
        min_interval_s: Some(60),
        run_every_n_syncs: None,
    }
}

fn ctx(root: std::path::PathBuf) -> HookContext {
    HookContext {
        issue_id: "004".into(),
        branch: Some("issue-004".into()),
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
fn second_tick_past_the_interval_runs_again() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("problem.md"), "hi").unwrap();
    let c = ctx(tmp.path().to_path_buf());
    let mut runtime = FakeRuntime::default();

    // 10s after the last run: still inside the 60s window, skipped.
    let ten_seconds_ago = HookState {
        last_run_at: Some(chrono::Utc::now() - chrono::Duration::seconds(10)),
        run_count: 1,
        last_success: true,
    };
    assert_eq!(evaluate_one(&decl(), &c, Some(&ten_seconds_ago), &mut runtime), HookOutcome::Skipped);

    // 70s after the last run: past the window, runs again.
    let seventy_seconds_ago = HookState {
        last_run_at: Some(chrono::Utc::now() - chrono::Duration::seconds(70)),
        run_count: 1,
        last_success: true,
    };
    assert_eq!(evaluate_one(&decl(), &c, Some(&seventy_seconds_ago), &mut runtime), HookOutcome::Pass);
}
