use std::path::PathBuf;
use std::process;

use anstyle::Style;
use clap::{CommandFactory, Parser};
use clap_complete::generate;

use agenttree::allocator::Allocator;
use agenttree::config::AgentTreeConfig;
use agenttree::container::{self, ContainerManager, Mount, SessionManager};
use agenttree::error::{AgentTreeError, ExternalToolCategory};
use agenttree::forge::{ForgeClient, ForgePlatform};
use agenttree::git::Repository;
use agenttree::issue::IssueStore;
use agenttree::shell_exec::{Cmd, ShellConfig};
use agenttree::sidecar::SidecarRepo;
use agenttree::stage::StageMachine;
use agenttree::styling::{
    eprintln, format_heading, format_with_gutter, hint_message, info_message, println,
    success_message,
};
use agenttree::sync::SyncLoop;
use agenttree::worktree::WorktreeManager;

mod cli;

use cli::{Cli, Commands, IssueCommand};

/// Every collaborator a command handler needs, assembled once per invocation.
struct App {
    project: String,
    config: AgentTreeConfig,
    repo_root: PathBuf,
    sidecar: SidecarRepo,
    forge: ForgeClient,
    issues: IssueStore,
    allocator: Allocator,
    containers: ContainerManager,
    sessions: SessionManager,
    worktrees: WorktreeManager,
}

impl App {
    fn bootstrap(cli: &Cli) -> anyhow::Result<Self> {
        let start_dir = cli.directory.clone().unwrap_or_else(|| PathBuf::from("."));
        let repo = Repository::at(start_dir)?;
        let repo_root = repo.root().to_path_buf();

        let config_path = cli.config.clone().unwrap_or_else(|| AgentTreeConfig::default_path(&repo_root));
        let config = AgentTreeConfig::load(&config_path)?;

        let platform = remote_platform(&repo_root).unwrap_or_else(|| {
            log::warn!("could not determine forge platform from origin remote; defaulting to GitHub");
            ForgePlatform::GitHub
        });
        let forge = ForgeClient::new(platform, repo_root.clone());

        let sidecar_root = repo_root.join("_agenttree");
        let sidecar = SidecarRepo::at(sidecar_root.clone());
        sidecar.ensure_repo(&config.project, &forge, &repo_root.join(".gitignore"))?;

        let issues = IssueStore::new(&sidecar_root);
        let allocator = Allocator::new(&sidecar_root, config.port_range);
        let containers = ContainerManager::detect()?;
        let sessions = SessionManager::detect()?;
        let worktrees_dir = repo_root.join(&config.worktrees_dir);
        let worktrees = WorktreeManager::new(repo, worktrees_dir, config.project.clone());

        Ok(Self {
            project: config.project.clone(),
            config,
            repo_root,
            sidecar,
            forge,
            issues,
            allocator,
            containers,
            sessions,
            worktrees,
        })
    }

    fn sync_loop(&self) -> SyncLoop<'_> {
        SyncLoop::new(
            self.project.clone(),
            &self.config,
            &self.sidecar,
            &self.forge,
            &self.issues,
            &self.allocator,
            &self.containers,
            &self.sessions,
            &self.worktrees,
            self.repo_root.clone(),
        )
    }

    fn base_branch(&self) -> String {
        self.config.extra.get("base_branch").and_then(|v| v.as_str()).unwrap_or("main").to_string()
    }
}

/// `git remote get-url origin`, parsed into a forge platform (§4.8). Not
/// part of `git::Repository`'s narrow worktree API, so dispatched directly.
fn remote_platform(repo_root: &std::path::Path) -> Option<ForgePlatform> {
    let output = Cmd::new("git").args(["remote", "get-url", "origin"]).current_dir(repo_root).run().ok()?;
    if !output.status.success() {
        return None;
    }
    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    ForgePlatform::from_remote_url(&url)
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "off" }))
        .format(|buf, record| {
            use std::io::Write;

            let msg = record.args().to_string();
            let thread_id = format!("{:?}", std::thread::current().id());
            let thread_num = thread_id
                .strip_prefix("ThreadId(")
                .and_then(|s| s.strip_suffix(")"))
                .and_then(|s| s.parse::<usize>().ok())
                .map(|n| if n <= 26 { char::from(b'a' + (n - 1) as u8) } else if n <= 52 { char::from(b'A' + (n - 27) as u8) } else { '?' })
                .unwrap_or('?');

            let dim = Style::new().dimmed();

            if let Some(rest) = msg.strip_prefix("$ ") {
                let bold = Style::new().bold();
                if let Some(bracket_pos) = rest.find(" [") {
                    let command = &rest[..bracket_pos];
                    let ctx = &rest[bracket_pos..];
                    writeln!(buf, "{dim}[{thread_num}]{dim:#} $ {bold}{command}{bold:#}{ctx}")
                } else {
                    writeln!(buf, "{dim}[{thread_num}]{dim:#} $ {bold}{rest}{bold:#}")
                }
            } else if msg.starts_with("[agt-trace]") {
                writeln!(buf, "{dim}[{thread_num}]{dim:#} {dim}{msg}{dim:#}")
            } else {
                writeln!(buf, "{dim}[{thread_num}]{dim:#} {msg}")
            }
        })
        .init();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        generate(shell, &mut cmd, name, &mut std::io::stdout());
        return;
    }

    let result = App::bootstrap(&cli).and_then(|app| dispatch(&app, cli.command));

    if let Err(e) = result {
        let _ = eprintln!("{}", e);
        let code = e.downcast_ref::<AgentTreeError>().map(AgentTreeError::exit_code).unwrap_or(1);
        process::exit(code);
    }
}

fn dispatch(app: &App, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Issue { action } => cmd_issue(app, action),
        Commands::Start { id, role } => cmd_start(app, &id, role),
        Commands::Advance { id } => cmd_advance(app, &id, false),
        Commands::Approve { id } => cmd_advance(app, &id, true),
        Commands::Run { id, command } => cmd_run(app, &id, &command),
        Commands::Send { id, text } => cmd_send(app, &id, &text),
        Commands::Attach { id, role } => cmd_attach(app, &id, role),
        Commands::Kill { id } => cmd_kill(app, &id),
        Commands::Sync => cmd_sync(app),
        Commands::Status => cmd_status(app),
        Commands::Completions { .. } => unreachable!("handled before bootstrap"),
    }
}

fn cmd_issue(app: &App, action: IssueCommand) -> anyhow::Result<()> {
    match action {
        IssueCommand::Create { title, priority, labels, blocked_by } => {
            let initial_stage = &app.config.stages.first().ok_or_else(|| anyhow::anyhow!("config declares no stages"))?.name;
            let issue = app.issues.create(&title, priority, labels, blocked_by, initial_stage)?;
            println!("{}", success_message(format!("Created issue {} ({})", issue.id, issue.slug)));
        }
        IssueCommand::List => {
            let issues = app.issues.list();
            if issues.is_empty() {
                println!("{}", info_message("No issues yet"));
                return Ok(());
            }
            println!("{}", format_heading("ISSUES", None));
            for issue in issues {
                let stage = match &issue.substage {
                    Some(s) => format!("{}/{s}", issue.stage),
                    None => issue.stage.clone(),
                };
                println!("  {:<5} {:<22} {}", issue.id, stage, issue.title);
            }
        }
        IssueCommand::Show { id } => {
            let issue = app.issues.get(&id)?.ok_or_else(|| anyhow::anyhow!("no such issue {id}"))?;
            println!("{}", format_heading(&format!("{} — {}", issue.id, issue.title), None));
            let stage = match &issue.substage {
                Some(s) => format!("{}/{s}", issue.stage),
                None => issue.stage.clone(),
            };
            println!("  stage:      {stage}");
            println!("  priority:   {:?}", issue.priority);
            println!("  assigned:   {}", issue.assigned_agent.as_deref().unwrap_or("-"));
            println!("  branch:     {}", issue.branch.as_deref().unwrap_or("-"));
            println!("  pr:         {}", issue.pr_number.map(|n| format!("#{n}")).unwrap_or_else(|| "-".into()));
            println!("  blocked_by: {}", if issue.blocked_by.is_empty() { "-".into() } else { issue.blocked_by.join(", ") });
            println!();
            println!("{}", format_heading("HISTORY", None));
            for entry in &issue.history {
                let stage = match &entry.substage {
                    Some(s) => format!("{}/{s}", entry.stage),
                    None => entry.stage.clone(),
                };
                match &entry.reason {
                    Some(reason) => println!("  {} -> {stage} ({reason})", entry.timestamp.format("%Y-%m-%d %H:%M")),
                    None => println!("  {} -> {stage}", entry.timestamp.format("%Y-%m-%d %H:%M")),
                }
            }
        }
    }
    Ok(())
}

/// Idempotent (§8 "Idempotent start"): reuses the registry entry, container,
/// and worktree when `(issue_id, role)` already has a live agent.
fn cmd_start(app: &App, id: &str, role: Option<String>) -> anyhow::Result<()> {
    let issue = app.issues.get(id)?.ok_or_else(|| anyhow::anyhow!("no such issue {id}"))?;
    let role = role
        .or_else(|| app.config.roles.keys().next().cloned())
        .ok_or_else(|| anyhow::anyhow!("no roles configured under [roles]"))?;
    let role_config = app.config.roles.get(&role).ok_or_else(|| anyhow::anyhow!("unknown role {role}"))?;
    let tool_config = app
        .config
        .tools
        .get(&role_config.tool)
        .ok_or_else(|| anyhow::anyhow!("role {role} references unknown tool {}", role_config.tool))?;

    let numeric_id: u64 = issue.id.parse().unwrap_or(0);
    let branch = issue.branch.clone().unwrap_or_else(|| format!("issue-{}", issue.id));
    let base = app.base_branch();
    let worktree_path = app.worktrees.create(&issue.id, &issue.slug, &branch, &base)?;

    let container_name = container::container_name(&app.project, &issue.id);
    let session_name = container::role_session_name(&app.project, &role, &issue.id);

    let already_live = app.allocator.get_agent(&issue.id, &role)?;
    let port = match already_live {
        Some(agent) => agent.port,
        None => {
            let port =
                app.allocator.register_agent(&issue.id, numeric_id, &role, &container_name, &session_name, &branch, &worktree_path)?;
            app.issues.assign(&issue.id, &role, &branch)?;

            let port_str = port.to_string();
            let env = container::base_env(&issue.id, &role, Some(port_str.as_str()));
            let image = app.config.extra.get("image").and_then(|v| v.as_str()).unwrap_or("agenttree/agent:latest");
            app.containers.start(&container_name, image, &[Mount::workspace(worktree_path.clone())], &env, None)?;
            port
        }
    };

    let port_str = port.to_string();
    let env = container::base_env(&issue.id, &role, Some(port_str.as_str()));
    let runtime_bin = app.containers.runtime().to_string();
    let argv = container::exec_argv(&runtime_bin, &container_name, &env, &tool_config.command);
    let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
    app.sessions.create(&session_name, &worktree_path, &[], &argv_refs)?;
    if let Some(prompt) = &tool_config.initial_prompt {
        app.sessions.send_keys(&session_name, prompt)?;
    }

    if let Some(serve_command) = app.config.commands.get("serve") {
        let serve_session = container::serve_session_name(&app.project, &issue.id);
        let serve_argv = container::exec_argv(&runtime_bin, &container_name, &env, serve_command);
        let serve_argv_refs: Vec<&str> = serve_argv.iter().map(String::as_str).collect();
        app.sessions.create(&serve_session, &worktree_path, &[], &serve_argv_refs)?;
    }

    println!("{}", success_message(format!("Started {role} agent for issue {id} on port {port}")));
    println!("{}", hint_message(format!("agt attach {id}")));
    Ok(())
}

fn cmd_advance(app: &App, id: &str, approve: bool) -> anyhow::Result<()> {
    let machine = StageMachine::new(&app.config, &app.issues, |issue| app.worktrees.path_for_issue(&issue.id, &issue.slug));
    let sync_loop = app.sync_loop();
    let mut runtime = sync_loop.runtime();
    let issue = if approve { machine.approve(id, &mut runtime)? } else { machine.advance(id, &mut runtime)? };
    let stage = match &issue.substage {
        Some(s) => format!("{}/{s}", issue.stage),
        None => issue.stage.clone(),
    };
    println!("{}", success_message(format!("Issue {id} is now at {stage}")));
    Ok(())
}

fn cmd_run(app: &App, id: &str, command_name: &str) -> anyhow::Result<()> {
    let shell_command = app.config.commands.get(command_name).ok_or_else(|| AgentTreeError::ExternalTool {
        category: ExternalToolCategory::NotFound,
        tool: "commands".into(),
        message: format!("no such command {command_name}; declare it under [commands]"),
    })?;
    let shell = ShellConfig::get();
    let mut argv = vec![shell.executable.to_string_lossy().into_owned()];
    argv.extend(shell.args.iter().cloned());
    argv.push(shell_command.clone());
    let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();

    let container_name = container::container_name(&app.project, id);
    let output = app.containers.exec(&container_name, &argv_refs)?;
    print!("{}", format_with_gutter(&String::from_utf8_lossy(&output.stdout)));
    if !output.status.success() {
        return Err(AgentTreeError::ExternalTool {
            category: ExternalToolCategory::Other,
            tool: command_name.into(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
        .into());
    }
    Ok(())
}

fn cmd_send(app: &App, id: &str, text: &str) -> anyhow::Result<()> {
    let issue = app.issues.get(id)?.ok_or_else(|| anyhow::anyhow!("no such issue {id}"))?;
    let role = issue.assigned_agent.ok_or_else(|| anyhow::anyhow!("issue {id} has no live agent"))?;
    let session_name = container::role_session_name(&app.project, &role, id);
    app.sessions.send_keys(&session_name, text)?;
    Ok(())
}

fn cmd_attach(app: &App, id: &str, role: Option<String>) -> anyhow::Result<()> {
    let role = match role {
        Some(role) => role,
        None => {
            let issue = app.issues.get(id)?.ok_or_else(|| anyhow::anyhow!("no such issue {id}"))?;
            issue.assigned_agent.ok_or_else(|| anyhow::anyhow!("issue {id} has no live agent"))?
        }
    };
    let session_name = container::role_session_name(&app.project, &role, id);
    // The one place AgentTree hands a child process the real terminal: every
    // other external call goes through `Cmd`, which always captures output.
    let status = std::process::Command::new("tmux").args(["attach-session", "-t", &session_name]).status()?;
    if !status.success() {
        anyhow::bail!("tmux attach-session exited with {status}");
    }
    Ok(())
}

fn cmd_kill(app: &App, id: &str) -> anyhow::Result<()> {
    let agents: Vec<_> = app.allocator.list_agents()?.into_iter().filter(|a| a.issue_id == id).collect();
    for agent in &agents {
        let session_name = container::role_session_name(&app.project, &agent.role, id);
        app.sessions.kill(&session_name)?;
        app.containers.stop(&agent.container)?;
        app.containers.remove(&agent.container)?;
        app.allocator.unregister_agent(id, &agent.role)?;
    }
    let serve_session = container::serve_session_name(&app.project, id);
    app.sessions.kill(&serve_session)?;
    println!("{}", success_message(format!("Killed {} agent(s) for issue {id}", agents.len())));
    Ok(())
}

fn cmd_sync(app: &App) -> anyhow::Result<()> {
    match app.sync_loop().run_once()? {
        None => println!("{}", info_message("Sync already in progress; skipped this tick")),
        Some(report) => {
            println!("{}", format_heading("SYNC", None));
            println!("  pushed branches:   {}", report.pushed_branches);
            println!("  PRs created:       {}", report.prs_created);
            println!("  merges detected:   {}", report.merges_detected);
            println!("  stages advanced:   {}", report.stages_advanced);
            println!("  issues unblocked:  {}", report.issues_unblocked);
            for (hook, message) in &report.post_sync_failures {
                println!("{}", hint_message(format!("post_sync hook {hook} failed: {message}")));
            }
        }
    }
    Ok(())
}

fn cmd_status(app: &App) -> anyhow::Result<()> {
    println!("{}", format_heading("PROJECT", Some(&app.project)));
    println!("  sidecar:      {}", app.sidecar.root().display());
    println!("  port range:   {}-{}", app.config.port_range.min, app.config.port_range.max);
    println!();

    println!("{}", format_heading("ISSUES BY STAGE", None));
    let issues = app.issues.list();
    for stage in &app.config.stages {
        let count = issues.iter().filter(|i| i.stage == stage.name).count();
        if count > 0 {
            println!("  {:<20} {count}", stage.name);
        }
    }
    println!();

    println!("{}", format_heading("LIVE AGENTS", None));
    let agents = app.allocator.list_agents()?;
    if agents.is_empty() {
        println!("  (none)");
    }
    for agent in agents {
        println!("  {:<5} {:<12} port {:<6} {}", agent.issue_id, agent.role, agent.port, agent.container);
    }
    Ok(())
}
