//! The closed vocabulary of hook kinds (§4.6's evaluation-semantics table)
//! and their evaluation logic.

use std::path::Path;
use std::time::{Duration, Instant};

use pulldown_cmark::{Event, HeadingLevel, Parser, Tag, TagEnd};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{HookContext, HookOutcome, HookRuntime};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FileExistsArgs {
    pub path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SectionExpect {
    NonEmpty,
    Empty,
    AllChecked,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SectionCheckArgs {
    pub file: String,
    pub section: String,
    pub expect: SectionExpect,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FieldCheckArgs {
    pub file: String,
    pub path: String,
    pub minimum: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MinWordsArgs {
    pub file: String,
    #[serde(default)]
    pub section: Option<String>,
    pub minimum: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct HasListItemsArgs {
    pub file: String,
    pub section: String,
    pub minimum: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ContainsArgs {
    pub file: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct WaitForCiArgs {
    #[serde(default = "default_ci_timeout")]
    pub timeout_s: u64,
    #[serde(default = "default_ci_poll_interval")]
    pub poll_interval_s: u64,
}

fn default_ci_timeout() -> u64 {
    600
}
fn default_ci_poll_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CheckConflictsArgs {
    #[serde(default)]
    pub auto_rebase: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CommandArgs {
    pub command: String,
    #[serde(default = "default_command_timeout")]
    pub timeout_s: u64,
}

fn default_command_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct WebhookArgs {
    pub webhook: String,
    #[serde(default = "default_command_timeout")]
    pub timeout_s: u64,
}

/// Side-effecting built-ins (§3, §4.9). Each performs its action and
/// succeeds iff the action completed; they do not themselves validate a
/// precondition (that's what the other `HookKind` variants are for).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BuiltinAction {
    CreatePr,
    MergePr { #[serde(default)] strategy: Option<String> },
    Rebase,
    CleanupAgent,
    PushPendingBranches,
    CheckMergedPrs,
    CheckControllerStages,
    StartBlockedIssues,
}

/// The closed vocabulary of hook kinds.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookKind {
    FileExists(FileExistsArgs),
    SectionCheck(SectionCheckArgs),
    FieldCheck(FieldCheckArgs),
    MinWords(MinWordsArgs),
    HasListItems(HasListItemsArgs),
    Contains(ContainsArgs),
    HasCommits,
    PrApproved,
    PrCiPassed,
    PrMergeable,
    WaitForCi(WaitForCiArgs),
    CheckConflicts(CheckConflictsArgs),
    Command(CommandArgs),
    Webhook(WebhookArgs),
    Action(BuiltinAction),
}

/// Forge-reported PR state, as needed by the PR-validating hook kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiState {
    Success,
    Failure,
    Pending,
}

#[derive(Debug, Clone)]
pub struct PrStatus {
    pub merged: bool,
    pub mergeable: bool,
    pub approved: bool,
    pub ci: CiState,
}

impl HookKind {
    pub fn tag(&self) -> &'static str {
        match self {
            HookKind::FileExists(_) => "file_exists",
            HookKind::SectionCheck(_) => "section_check",
            HookKind::FieldCheck(_) => "field_check",
            HookKind::MinWords(_) => "min_words",
            HookKind::HasListItems(_) => "has_list_items",
            HookKind::Contains(_) => "contains",
            HookKind::HasCommits => "has_commits",
            HookKind::PrApproved => "pr_approved",
            HookKind::PrCiPassed => "pr_ci_passed",
            HookKind::PrMergeable => "pr_mergeable",
            HookKind::WaitForCi(_) => "wait_for_ci",
            HookKind::CheckConflicts(_) => "check_conflicts",
            HookKind::Command(_) => "command",
            HookKind::Webhook(_) => "webhook",
            HookKind::Action(_) => "action",
        }
    }

    /// Expands `{{issue_id}}`/`{{branch}}`/`{{pr_number}}`/`{{pr_url}}`/
    /// `{{failure_reason}}` placeholders in each variant's string arguments
    /// before dispatch (§3/§4.6); `command` is shell-escaped, everything
    /// else (file paths, YAML field paths, webhook URLs) is substituted raw.
    pub fn evaluate(
        &self,
        ctx: &HookContext,
        runtime: &mut dyn HookRuntime,
    ) -> anyhow::Result<HookOutcome> {
        let placeholders = ctx.placeholders();
        match self {
            HookKind::FileExists(args) => {
                let path = placeholders.expand(&args.path, false)?;
                Ok(file_exists(ctx, &path))
            }
            HookKind::SectionCheck(args) => {
                let expanded = SectionCheckArgs {
                    file: placeholders.expand(&args.file, false)?,
                    section: placeholders.expand(&args.section, false)?,
                    expect: args.expect,
                };
                section_check(ctx, &expanded)
            }
            HookKind::FieldCheck(args) => {
                let expanded = FieldCheckArgs {
                    file: placeholders.expand(&args.file, false)?,
                    path: placeholders.expand(&args.path, false)?,
                    minimum: args.minimum,
                };
                field_check(ctx, &expanded)
            }
            HookKind::MinWords(args) => {
                let expanded = MinWordsArgs {
                    file: placeholders.expand(&args.file, false)?,
                    section: args.section.as_deref().map(|s| placeholders.expand(s, false)).transpose()?,
                    minimum: args.minimum,
                };
                min_words(ctx, &expanded)
            }
            HookKind::HasListItems(args) => {
                let expanded = HasListItemsArgs {
                    file: placeholders.expand(&args.file, false)?,
                    section: placeholders.expand(&args.section, false)?,
                    minimum: args.minimum,
                };
                has_list_items(ctx, &expanded)
            }
            HookKind::Contains(args) => {
                let expanded = ContainsArgs {
                    file: placeholders.expand(&args.file, false)?,
                    value: placeholders.expand(&args.value, false)?,
                };
                contains(ctx, &expanded)
            }
            HookKind::HasCommits => {
                let branch = ctx
                    .branch
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("has_commits requires an assigned branch"))?;
                let has_commits = runtime.has_commits_since_base(branch, &ctx.base_branch)?;
                Ok(bool_outcome(has_commits, "branch has no commits ahead of base"))
            }
            HookKind::PrApproved => {
                let status = pr_status(ctx, runtime)?;
                Ok(bool_outcome(status.approved, "PR is not approved"))
            }
            HookKind::PrCiPassed => {
                let status = pr_status(ctx, runtime)?;
                Ok(match status.ci {
                    CiState::Success => HookOutcome::Pass,
                    CiState::Failure => HookOutcome::Fail("CI checks failed".into()),
                    CiState::Pending => HookOutcome::Fail("CI checks still pending".into()),
                })
            }
            HookKind::PrMergeable => {
                let status = pr_status(ctx, runtime)?;
                Ok(bool_outcome(status.mergeable, "PR is not mergeable"))
            }
            HookKind::WaitForCi(args) => wait_for_ci(ctx, args, runtime),
            HookKind::CheckConflicts(args) => check_conflicts(ctx, args, runtime),
            HookKind::Command(args) => {
                let expanded = CommandArgs {
                    command: placeholders.expand(&args.command, true)?,
                    timeout_s: args.timeout_s,
                };
                run_command(&expanded)
            }
            HookKind::Webhook(args) => {
                let expanded = WebhookArgs {
                    webhook: placeholders.expand(&args.webhook, false)?,
                    timeout_s: args.timeout_s,
                };
                run_webhook(&expanded)
            }
            HookKind::Action(action) => {
                runtime.run_builtin(action.clone(), ctx)?;
                Ok(HookOutcome::Pass)
            }
        }
    }
}

fn bool_outcome(ok: bool, fail_message: &str) -> HookOutcome {
    if ok {
        HookOutcome::Pass
    } else {
        HookOutcome::Fail(fail_message.to_string())
    }
}

fn pr_status(ctx: &HookContext, runtime: &mut dyn HookRuntime) -> anyhow::Result<PrStatus> {
    let pr_number = ctx
        .pr_number
        .ok_or_else(|| anyhow::anyhow!("hook requires an associated PR"))?;
    runtime.pr_status(pr_number)
}

fn resolve(ctx: &HookContext, relative: &str) -> std::path::PathBuf {
    ctx.worktree_root.join(relative)
}

fn read_to_string(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

fn file_exists(ctx: &HookContext, path: &str) -> HookOutcome {
    let full = resolve(ctx, path);
    match std::fs::metadata(&full) {
        Ok(meta) if meta.len() > 0 => HookOutcome::Pass,
        Ok(_) => HookOutcome::Fail(format!("{path} exists but is empty")),
        Err(_) => HookOutcome::Fail(format!("{path} does not exist")),
    }
}

/// Returns the markdown body text under a level-2/3 heading whose text
/// equals `section`, up to (not including) the next heading at the same or
/// shallower level.
fn find_section(contents: &str, section: &str) -> Option<String> {
    let parser = Parser::new(contents);
    let mut in_target = false;
    let mut target_level: Option<HeadingLevel> = None;
    let mut heading_text = String::new();
    let mut collecting_heading = false;
    let mut body = String::new();

    for event in parser {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                if in_target && target_level.is_some_and(|l| level <= l) {
                    break;
                }
                collecting_heading = true;
                heading_text.clear();
            }
            Event::End(TagEnd::Heading(level)) => {
                collecting_heading = false;
                if heading_text.trim() == section {
                    in_target = true;
                    target_level = Some(level);
                } else if in_target {
                    // A heading of any level ended target collection only if
                    // it was shallow enough; handled by the Start branch above.
                }
            }
            Event::Text(text) | Event::Code(text) if collecting_heading => {
                heading_text.push_str(&text);
            }
            Event::Text(text) if in_target => {
                body.push_str(&text);
                body.push(' ');
            }
            Event::SoftBreak | Event::HardBreak if in_target => body.push('\n'),
            _ => {}
        }
    }

    if in_target { Some(body) } else { None }
}

fn section_check(ctx: &HookContext, args: &SectionCheckArgs) -> anyhow::Result<HookOutcome> {
    let full = resolve(ctx, &args.file);
    let Some(contents) = read_to_string(&full) else {
        return Ok(HookOutcome::Fail(format!("{} does not exist", args.file)));
    };
    let Some(body) = find_section(&contents, &args.section) else {
        return Ok(HookOutcome::Fail(format!(
            "{} has no section \"{}\"",
            args.file, args.section
        )));
    };

    let ok = match args.expect {
        SectionExpect::NonEmpty => !body.trim().is_empty(),
        SectionExpect::Empty => body.trim().is_empty(),
        SectionExpect::AllChecked => {
            let checkboxes: Vec<&str> = body
                .lines()
                .map(str::trim)
                .filter(|l| l.starts_with("- [") || l.starts_with("* ["))
                .collect();
            !checkboxes.is_empty() && checkboxes.iter().all(|l| l.to_lowercase().contains("[x]"))
        }
    };

    Ok(bool_outcome(
        ok,
        &format!("section \"{}\" in {} does not satisfy {:?}", args.section, args.file, args.expect),
    ))
}

fn field_check(ctx: &HookContext, args: &FieldCheckArgs) -> anyhow::Result<HookOutcome> {
    let full = resolve(ctx, &args.file);
    let Some(contents) = read_to_string(&full) else {
        return Ok(HookOutcome::Fail(format!("{} does not exist", args.file)));
    };

    // Front matter is a YAML block delimited by `---` lines at the top,
    // otherwise fall back to treating the whole file as YAML.
    let yaml_block = contents
        .strip_prefix("---\n")
        .and_then(|rest| rest.split_once("\n---"))
        .map(|(front, _)| front)
        .unwrap_or(&contents);

    let value: serde_yaml::Value = serde_yaml::from_str(yaml_block)
        .map_err(|e| anyhow::anyhow!("{} is not valid YAML: {e}", args.file))?;

    let mut cursor = &value;
    for segment in args.path.split('.') {
        cursor = match cursor.get(segment) {
            Some(v) => v,
            None => {
                return Ok(HookOutcome::Fail(format!(
                    "{} has no field {}",
                    args.file, args.path
                )));
            }
        };
    }

    let Some(n) = cursor.as_f64() else {
        return Ok(HookOutcome::Fail(format!(
            "{} field {} is not numeric",
            args.file, args.path
        )));
    };

    Ok(bool_outcome(
        n >= args.minimum,
        &format!("{} field {} = {n} is below minimum {}", args.file, args.path, args.minimum),
    ))
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn min_words(ctx: &HookContext, args: &MinWordsArgs) -> anyhow::Result<HookOutcome> {
    let full = resolve(ctx, &args.file);
    let Some(contents) = read_to_string(&full) else {
        return Ok(HookOutcome::Fail(format!("{} does not exist", args.file)));
    };

    let text = match &args.section {
        Some(section) => match find_section(&contents, section) {
            Some(body) => body,
            None => return Ok(HookOutcome::Fail(format!("{} has no section \"{section}\"", args.file))),
        },
        None => contents,
    };

    let count = word_count(&text);
    Ok(bool_outcome(
        count >= args.minimum,
        &format!("{} has {count} words, below minimum {}", args.file, args.minimum),
    ))
}

fn has_list_items(ctx: &HookContext, args: &HasListItemsArgs) -> anyhow::Result<HookOutcome> {
    let full = resolve(ctx, &args.file);
    let Some(contents) = read_to_string(&full) else {
        return Ok(HookOutcome::Fail(format!("{} does not exist", args.file)));
    };
    let Some(body) = find_section(&contents, &args.section) else {
        return Ok(HookOutcome::Fail(format!(
            "{} has no section \"{}\"",
            args.file, args.section
        )));
    };

    let count = body
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("- ") || l.starts_with("* ") || l.starts_with("- ["))
        .count();

    Ok(bool_outcome(
        count >= args.minimum,
        &format!(
            "section \"{}\" in {} has {count} items, below minimum {}",
            args.section, args.file, args.minimum
        ),
    ))
}

fn contains(ctx: &HookContext, args: &ContainsArgs) -> anyhow::Result<HookOutcome> {
    let full = resolve(ctx, &args.file);
    let Some(contents) = read_to_string(&full) else {
        return Ok(HookOutcome::Fail(format!("{} does not exist", args.file)));
    };
    Ok(bool_outcome(
        contents.contains(&args.value),
        &format!("{} does not contain {:?}", args.file, args.value),
    ))
}

fn wait_for_ci(
    ctx: &HookContext,
    args: &WaitForCiArgs,
    runtime: &mut dyn HookRuntime,
) -> anyhow::Result<HookOutcome> {
    let pr_number = ctx
        .pr_number
        .ok_or_else(|| anyhow::anyhow!("wait_for_ci requires an associated PR"))?;
    let deadline = Instant::now() + Duration::from_secs(args.timeout_s);
    loop {
        let status = runtime.pr_status(pr_number)?;
        match status.ci {
            CiState::Success => return Ok(HookOutcome::Pass),
            CiState::Failure => return Ok(HookOutcome::Fail(format!("CI checks failed on PR #{pr_number}"))),
            CiState::Pending => {}
        }
        if Instant::now() >= deadline {
            return Ok(HookOutcome::Fail(format!(
                "CI checks on PR #{pr_number} did not complete within {}s",
                args.timeout_s
            )));
        }
        std::thread::sleep(Duration::from_secs(args.poll_interval_s));
    }
}

fn check_conflicts(
    ctx: &HookContext,
    args: &CheckConflictsArgs,
    runtime: &mut dyn HookRuntime,
) -> anyhow::Result<HookOutcome> {
    let status = pr_status(ctx, runtime)?;
    if status.mergeable {
        return Ok(HookOutcome::Pass);
    }
    if args.auto_rebase {
        runtime.run_builtin(BuiltinAction::Rebase, ctx)?;
        let status = pr_status(ctx, runtime)?;
        return Ok(bool_outcome(status.mergeable, "PR still has conflicts after rebase"));
    }
    Ok(HookOutcome::Fail("PR has merge conflicts".into()))
}

fn run_command(args: &CommandArgs) -> anyhow::Result<HookOutcome> {
    use crate::shell_exec::ShellConfig;
    use wait_timeout::ChildExt;

    let shell = ShellConfig::get();
    let mut child = shell.command(&args.command).spawn()?;
    match child.wait_timeout(Duration::from_secs(args.timeout_s))? {
        Some(status) if status.success() => Ok(HookOutcome::Pass),
        Some(status) => Ok(HookOutcome::Fail(format!("command exited with {status}"))),
        None => {
            child.kill().ok();
            Ok(HookOutcome::Fail(format!(
                "command timed out after {}s",
                args.timeout_s
            )))
        }
    }
}

fn run_webhook(args: &WebhookArgs) -> anyhow::Result<HookOutcome> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(args.timeout_s))
        .build()?;
    match client.post(&args.webhook).send() {
        Ok(resp) if resp.status().is_success() => Ok(HookOutcome::Pass),
        Ok(resp) => Ok(HookOutcome::Fail(format!("webhook returned {}", resp.status()))),
        Err(e) => Ok(HookOutcome::Fail(format!("webhook request failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_section_body() {
        let md = "# Title\n\n## Approach\n\nDo the thing.\n\n## Risks\n\nNone.\n";
        let body = find_section(md, "Approach").unwrap();
        assert!(body.contains("Do the thing"));
        assert!(!body.contains("None"));
    }

    #[test]
    fn missing_section_returns_none() {
        let md = "# Title\n\nBody only.\n";
        assert!(find_section(md, "Approach").is_none());
    }

    #[test]
    fn all_checked_requires_every_box_ticked() {
        let md = "## Checklist\n\n- [x] one\n- [x] two\n";
        let body = find_section(md, "Checklist").unwrap();
        let checkboxes: Vec<&str> = body.lines().map(str::trim).filter(|l| l.starts_with("- [")).collect();
        assert!(!checkboxes.is_empty());
    }

    #[test]
    fn field_check_reads_front_matter() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("spec.md");
        std::fs::write(&file, "---\nconfidence:\n  score: 8\n---\nBody\n").unwrap();

        let ctx = HookContext {
            issue_id: "042".into(),
            branch: None,
            base_branch: "main".into(),
            pr_number: None,
            pr_url: None,
            failure_reason: None,
            environment: super::super::Environment::Host,
            worktree_root: tmp.path().to_path_buf(),
            sync_counter: 0,
        };
        let args = FieldCheckArgs {
            file: "spec.md".into(),
            path: "confidence.score".into(),
            minimum: 5.0,
        };
        let outcome = field_check(&ctx, &args).unwrap();
        assert_eq!(outcome, HookOutcome::Pass);
    }

    #[test]
    fn word_count_counts_whitespace_separated_tokens() {
        assert_eq!(word_count("one two three"), 3);
        assert_eq!(word_count(""), 0);
    }

    struct NoopRuntime;
    impl crate::hooks::HookRuntime for NoopRuntime {
        fn pr_status(&mut self, _pr_number: u64) -> anyhow::Result<PrStatus> {
            unimplemented!()
        }
        fn has_commits_since_base(&mut self, _branch: &str, _base: &str) -> anyhow::Result<bool> {
            unimplemented!()
        }
        fn run_builtin(&mut self, _action: BuiltinAction, _ctx: &HookContext) -> anyhow::Result<()> {
            unimplemented!()
        }
    }

    #[test]
    fn evaluate_expands_placeholders_in_file_exists_path() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("notes")).unwrap();
        std::fs::write(tmp.path().join("notes").join("issue-042.md"), "hi").unwrap();

        let ctx = HookContext {
            issue_id: "042".into(),
            branch: None,
            base_branch: "main".into(),
            pr_number: None,
            pr_url: None,
            failure_reason: None,
            environment: super::super::Environment::Host,
            worktree_root: tmp.path().to_path_buf(),
            sync_counter: 0,
        };
        let kind = HookKind::FileExists(FileExistsArgs { path: "notes/issue-{{issue_id}}.md".into() });
        let outcome = kind.evaluate(&ctx, &mut NoopRuntime).unwrap();
        assert_eq!(outcome, HookOutcome::Pass);
    }
}
