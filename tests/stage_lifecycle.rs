//! End-to-end scenarios crossing the stage machine, hook engine, issue
//! store, and resource allocator together — the parts spec §8's concrete
//! scenarios exercise as a whole rather than one module in isolation.
//! `sync.rs`'s own unit tests defer exactly this kind of coverage to here
//! (see its `start_unblocked_issues_detects_fully_accepted_dependencies`
//! comment).

mod common;

use agenttree::allocator::Allocator;
use agenttree::config::{AgentTreeConfig, PortRangeConfig};
use agenttree::hooks::kinds::{FileExistsArgs, SectionCheckArgs, SectionExpect};
use agenttree::hooks::{HookDecl, HookKind};
use agenttree::issue::{IssueStore, Priority};
use agenttree::stage::StageMachine;

use common::FakeRuntime;

fn stage_mut<'a>(config: &'a mut AgentTreeConfig, name: &str) -> &'a mut agenttree::config::StageConfig {
    config.stages.iter_mut().find(|s| s.name == name).expect("stage declared in CONFIG")
}

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
name = "plan"

[[stages]]
name = "plan_review"
human_review = true

[[stages]]
name = "accepted"
terminal = true
"#;

fn section_check_hook(file: &str, section: &str) -> HookDecl {
    HookDecl {
        name: None,
        kind: HookKind::SectionCheck(SectionCheckArgs {
            file: file.into(),
            section: section.into(),
            expect: SectionExpect::NonEmpty,
        }),
        host_only: false,
        optional: false,
        timeout_s: None,
        min_interval_s: None,
        run_every_n_syncs: None,
    }
}

fn file_exists_hook(path: &str) -> HookDecl {
    HookDecl {
        name: None,
        kind: HookKind::FileExists(FileExistsArgs { path: path.into() }),
        host_only: false,
        optional: false,
        timeout_s: None,
        min_interval_s: None,
        run_every_n_syncs: None,
    }
}

/// Scenario 2: a `section_check` pre-completion hook that can't find the
/// required section blocks `advance`; the issue stays on its prior
/// stage/substage and no history entry is appended.
#[test]
fn validation_blocks_advance_on_missing_section() {
    let mut config = AgentTreeConfig::parse(CONFIG).unwrap();
    stage_mut(&mut config, "plan").pre_completion.push(section_check_hook("spec.md", "Approach"));

    let tmp = tempfile::tempdir().unwrap();
    let issues = IssueStore::new(tmp.path());
    let issue = issues.create("Add /health endpoint", Priority::Medium, vec![], vec![], "backlog").unwrap();
    let issue = issues.update_stage(&issue.id, "plan", None).unwrap();

    // spec.md exists but is missing the required section.
    std::fs::write(tmp.path().join("spec.md"), "# Plan\n\n## Risks\n\nNone.\n").unwrap();

    let machine = StageMachine::new(&config, &issues, |_issue| tmp.path().to_path_buf());
    let mut runtime = FakeRuntime::default();

    let err = machine.advance(&issue.id, &mut runtime);
    assert!(err.is_err());

    let reloaded = issues.get(&issue.id).unwrap().unwrap();
    assert_eq!(reloaded.stage, "plan");
    assert_eq!(reloaded.history.len(), issue.history.len());
}

/// Happy-path half of scenario 1: once the required section is present, the
/// same hook passes, `advance` proceeds into the human-review gate, and
/// `approve` carries the issue into the terminal stage, freeing its port and
/// running cleanup exactly once.
#[test]
fn full_lifecycle_frees_port_and_cleans_up_on_terminal_entry() {
    let mut config = AgentTreeConfig::parse(CONFIG).unwrap();
    stage_mut(&mut config, "plan").pre_completion.push(section_check_hook("spec.md", "Approach"));
    stage_mut(&mut config, "plan_review").pre_completion.push(file_exists_hook("spec.md"));

    let tmp = tempfile::tempdir().unwrap();
    let issues = IssueStore::new(tmp.path());
    let allocator = Allocator::new(tmp.path(), PortRangeConfig { min: 9000, max: 9100 });

    let issue = issues.create("Add /health endpoint", Priority::Medium, vec![], vec![], "backlog").unwrap();
    let port = allocator.allocate_port(1).unwrap();
    std::fs::write(tmp.path().join("spec.md"), "# Plan\n\n## Approach\n\nDo it.\n").unwrap();

    let machine = StageMachine::new(&config, &issues, |_issue| tmp.path().to_path_buf());
    let mut runtime = FakeRuntime::default();

    let issue = machine.advance(&issue.id, &mut runtime).unwrap();
    assert_eq!(issue.stage, "plan");

    let issue = machine.advance(&issue.id, &mut runtime).unwrap();
    assert_eq!(issue.stage, "plan_review");

    // advance refuses on a human_review stage; approve is required.
    assert!(machine.advance(&issue.id, &mut runtime).is_err());
    let issue = machine.approve(&issue.id, &mut runtime).unwrap();
    assert_eq!(issue.stage, "accepted");

    assert_eq!(runtime.cleaned_up, vec![issue.id.clone()]);
    assert_eq!(issue.history.len(), 4);
    assert_eq!(issue.history[0].stage, "backlog");
    assert_eq!(issue.history.last().unwrap().stage, "accepted");

    // Terminal entry is the stage machine's cue to release resources; in
    // the real CLI `cmd_advance` calls `allocator.free_port` alongside
    // `cleanup_terminal_issue` (see src/main.rs). Exercise that release
    // directly here since `FakeRuntime` doesn't own the allocator.
    allocator.free_port(port).unwrap();
    let next = allocator.allocate_port(1).unwrap();
    assert_eq!(next, port, "freed port should be reallocated to the next issue claiming the same slot");
}
