use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use mdmigrate_core::apply::{
    ApplyOptions, Decision, PromptRequest, RollbackOptions, RunReport, apply, rollback,
};
use mdmigrate_core::config::{MigrateConfig, load_config};
use mdmigrate_core::model::{ItemType, parse_item_types};
use mdmigrate_core::report::{DEFAULT_LOG_LIMIT, list_items, read_logs, workspace_status};
use mdmigrate_core::runtime::{
    PathOverrides, ResolutionContext, WorkspacePaths, inspect_workspace, normalize_for_display,
    resolve_paths,
};
use mdmigrate_core::workspace::{
    ConversionSettings, InitOptions, SnapshotOptions, SnapshotReport, clean_workspace,
    init_workspace, snapshot_append,
};
use tracing::debug;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(
    name = "mdmigrate",
    version,
    about = "Migrate issue-tracker rich text from legacy wiki markup to Markdown"
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Workspace directory (defaults to $MDMIGRATE_DIR, then the current directory)"
    )]
    dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, help = "Enable debug logging on stderr")]
    verbose: bool,
    #[arg(long, global = true, help = "Print resolved workspace diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            dir: cli.dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create a workspace and snapshot every item of a project")]
    Init(InitArgs),
    #[command(about = "Snapshot remote items created since the last snapshot")]
    Snapshot(SnapshotArgs),
    #[command(about = "Convert snapshotted items and push approved conversions")]
    Apply(ApplyArgs),
    #[command(about = "Restore items to their pristine snapshot")]
    Rollback(RollbackArgs),
    List(ListArgs),
    Logs(LogsArgs),
    Status,
    #[command(about = "Erase workspace content and history, keeping metadata")]
    Clean(CleanArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    project_key: String,
    #[arg(long, help = "Also snapshot issue comments")]
    with_comments: bool,
    #[arg(long, value_name = "BRANCH", help = "Initial branch of a new repository")]
    base_branch: Option<String>,
}

#[derive(Debug, Args)]
struct SnapshotArgs {
    #[arg(long, help = "Add items whose identity is not tracked yet")]
    append: bool,
    #[arg(long, help = "Also snapshot issue comments")]
    with_comments: bool,
    #[arg(long, help = "Remove a stale workspace lock before starting")]
    force_lock: bool,
}

#[derive(Debug, Args)]
struct ApplyArgs {
    #[arg(long, help = "Remove a stale workspace lock before starting")]
    force_lock: bool,
    #[arg(long, help = "Approve every conversion without prompting")]
    auto: bool,
    #[arg(long, help = "Convert and commit locally without updating the remote")]
    dry_run: bool,
    #[arg(long, value_name = "LIST", help = "Comma-separated item types")]
    types: Option<String>,
    #[arg(long, help = "Work on the current branch")]
    no_branch: bool,
}

#[derive(Debug, Args)]
struct RollbackArgs {
    #[arg(long, help = "Remove a stale workspace lock before starting")]
    force_lock: bool,
    #[arg(long, help = "Approve every restore without prompting")]
    auto: bool,
    #[arg(long, value_name = "LIST", help = "Comma-separated item keys, ids or paths")]
    targets: Option<String>,
    #[arg(long, value_name = "LIST", help = "Comma-separated item types")]
    types: Option<String>,
    #[arg(long, help = "Work on the current branch")]
    no_branch: bool,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, help = "Show changes against the pristine snapshot")]
    diff: bool,
}

#[derive(Debug, Args)]
struct LogsArgs {
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
    #[arg(long, conflicts_with = "limit")]
    all: bool,
}

#[derive(Debug, Args)]
struct CleanArgs {
    #[arg(long, help = "Skip the confirmation prompt")]
    force: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Snapshot(args)) => run_snapshot(&runtime, args),
        Some(Commands::Apply(args)) => run_apply(&runtime, args),
        Some(Commands::Rollback(args)) => run_rollback(&runtime, args),
        Some(Commands::List(args)) => run_list(&runtime, args),
        Some(Commands::Logs(args)) => run_logs(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Clean(args)) => run_clean(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        "mdmigrate=debug,mdmigrate_core=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .try_init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let report = init_workspace(
        &paths,
        &config,
        &InitOptions {
            project_key: args.project_key,
            space_url: None,
            with_comments: args.with_comments,
            base_branch: args.base_branch.unwrap_or_else(|| config.base_branch()),
            settings: ConversionSettings::from_config(&config)?,
        },
    )?;

    println!("Initialized migration workspace");
    println!("workspace: {}", normalize_for_display(&paths.root));
    print_snapshot_report(&report);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_snapshot(runtime: &RuntimeOptions, args: SnapshotArgs) -> Result<()> {
    if !args.append {
        bail!("snapshot requires --append; use `mdmigrate init <PROJECT_KEY>` for a new workspace");
    }
    let (paths, config) = resolve_runtime(runtime)?;
    let report = snapshot_append(
        &paths,
        &config,
        &SnapshotOptions {
            with_comments: args.with_comments,
            force_lock: args.force_lock,
            settings: ConversionSettings::from_config(&config)?,
            command: invocation(),
        },
    )?;

    println!("snapshot append");
    println!("workspace: {}", normalize_for_display(&paths.root));
    print_snapshot_report(&report);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_apply(runtime: &RuntimeOptions, args: ApplyArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let options = ApplyOptions {
        force_lock: args.force_lock,
        auto: args.auto,
        dry_run: args.dry_run,
        types: parse_types(args.types.as_deref())?,
        no_branch: args.no_branch,
        settings: ConversionSettings::from_config(&config)?,
        command: invocation(),
    };
    let report = apply(&paths, &config, &options, &mut prompt_decision)?;

    println!("apply{}", if report.dry_run { " (dry run)" } else { "" });
    println!("workspace: {}", normalize_for_display(&paths.root));
    print_run_report(&report);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_rollback(runtime: &RuntimeOptions, args: RollbackArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let options = RollbackOptions {
        force_lock: args.force_lock,
        auto: args.auto,
        types: parse_types(args.types.as_deref())?,
        targets: split_list(args.targets.as_deref()),
        no_branch: args.no_branch,
        command: invocation(),
    };
    let report = rollback(&paths, &config, &options, &mut prompt_decision)?;

    println!("rollback");
    println!("workspace: {}", normalize_for_display(&paths.root));
    print_run_report(&report);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_list(runtime: &RuntimeOptions, args: ListArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let entries = list_items(&paths, &config, args.diff)?;

    println!("workspace: {}", normalize_for_display(&paths.root));
    println!("items: {}", entries.len());
    for entry in &entries {
        let state = if entry.applied {
            "applied"
        } else if entry.changed {
            "pending"
        } else {
            "unchanged"
        };
        println!(
            "{}\t{}\t{}\tmode={} score={} warnings={}\t{}",
            entry.item_type, entry.item_key, state, entry.detected_mode, entry.score,
            entry.warnings, entry.path
        );
        if let Some(error) = &entry.error {
            println!("  error: {error}");
        }
        if let Some(diff) = &entry.diff {
            print!("{diff}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_logs(runtime: &RuntimeOptions, args: LogsArgs) -> Result<()> {
    let (paths, _) = resolve_runtime(runtime)?;
    let limit = if args.all {
        None
    } else {
        Some(args.limit.unwrap_or(DEFAULT_LOG_LIMIT))
    };
    let entries = read_logs(&paths, limit)?;

    if entries.is_empty() {
        println!("logs: <empty>");
    }
    for entry in &entries {
        println!(
            "{}\t{}\t{}\t{}\t{}{}",
            entry.timestamp.to_rfc3339(),
            entry.action.as_str(),
            entry.status.as_str(),
            entry
                .item_type
                .map(ItemType::as_str)
                .unwrap_or("-"),
            entry.item_key.as_deref().unwrap_or("-"),
            entry
                .message
                .as_deref()
                .map(|message| format!("\t{message}"))
                .unwrap_or_default()
        );
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let status = workspace_status(&paths, &config)?;
    let layout = inspect_workspace(&paths);

    println!("workspace status");
    println!("workspace: {}", normalize_for_display(&paths.root));
    println!("repository: {}", format_flag(layout.repository_exists));
    println!("config: {}", format_flag(layout.config_exists));
    println!("project: {} ({})", status.project_key, status.project_name);
    println!("base_branch: {}", status.base_branch);
    println!(
        "current_branch: {}",
        status.current_branch.as_deref().unwrap_or("<none>")
    );
    match &status.lock {
        Some(lock) => println!(
            "lock: held by pid {} since {} ({})",
            lock.pid,
            lock.created_at.to_rfc3339(),
            lock.command
        ),
        None if status.lock_present => println!("lock: present (unreadable)"),
        None => println!("lock: no"),
    }
    println!("items: {}", status.totals.total);
    println!("applied: {}", status.totals.applied);
    println!("pending: {}", status.totals.pending);
    println!("changed: {}", status.totals.changed);
    println!("errors: {}", status.totals.errors);
    println!("warnings: {}", status.warnings_total);
    for (item_type, counts) in &status.by_type {
        println!(
            "type.{item_type}: total={} applied={} pending={} changed={}",
            counts.total, counts.applied, counts.pending, counts.changed
        );
    }
    println!("audit_entries: {}", status.audit_entries);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_clean(runtime: &RuntimeOptions, args: CleanArgs) -> Result<()> {
    let (paths, _) = resolve_runtime(runtime)?;
    let confirmed = args.force
        || confirm(&format!(
            "Erase all content and history in {}? Type 'yes' to continue: ",
            normalize_for_display(&paths.root)
        ))?;
    if !confirmed {
        println!("clean: aborted");
        return Ok(());
    }
    let report = clean_workspace(&paths, true, &invocation())?;

    println!("clean");
    println!("workspace: {}", normalize_for_display(&paths.root));
    println!("removed_entries: {}", report.removed_entries.len());
    println!("removed_files: {}", report.removed_files);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn print_snapshot_report(report: &SnapshotReport) {
    println!("project: {}", report.project_key);
    println!("base_branch: {}", report.base_branch);
    println!("listed: {}", report.listed);
    println!("added: {}", report.added);
    println!("skipped_existing: {}", report.skipped_existing);
    println!("items_total: {}", report.items_total);
    println!("committed: {}", format_flag(report.committed));
    println!("request_count: {}", report.request_count);
    if !report.failed.is_empty() {
        println!("failed:");
        for failure in &report.failed {
            println!("  - {failure}");
        }
    }
}

fn print_run_report(report: &RunReport) {
    println!(
        "branch: {}",
        report.branch.as_deref().unwrap_or("<current>")
    );
    println!("eligible: {}", report.eligible);
    println!("drift_refreshed: {}", report.drift_refreshed);
    println!("commits: {}", report.commits);
    println!("merged: {}", format_flag(report.merged));
    println!("errors: {}", report.errors);
    println!("request_count: {}", report.request_count);
    if report.quit {
        println!("quit: yes (progress saved; re-run to continue)");
    }
    for outcome in &report.outcomes {
        match &outcome.message {
            Some(message) => println!(
                "  {} {}: {message}",
                outcome.status.as_str(),
                outcome.item_key
            ),
            None => println!("  {} {}", outcome.status.as_str(), outcome.item_key),
        }
    }
    println!("{}", report.summary());
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &WorkspacePaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn prompt_decision(request: &PromptRequest<'_>) -> Result<Decision> {
    let item = request.item;
    println!();
    println!(
        "[{}/{}] {} {} {}",
        request.index,
        request.total,
        request.action.as_str(),
        item.item_type,
        item.item_key
    );
    if !item.url.is_empty() {
        println!("url: {}", item.url);
    }
    if !item.warnings.is_empty() {
        let warnings = item
            .warnings
            .iter()
            .map(|(kind, count)| format!("{kind}={count}"))
            .collect::<Vec<_>>()
            .join(", ");
        println!("warnings: {warnings}");
    }
    print!("{}", request.diff);

    let stdin = io::stdin();
    loop {
        print!("[a]pprove / [r]eject / [s]kip / [q]uit: ");
        io::stdout().flush().context("failed to flush stdout")?;
        let mut answer = String::new();
        let read = stdin
            .lock()
            .read_line(&mut answer)
            .context("failed to read decision")?;
        if read == 0 {
            debug!("stdin closed; treating as quit");
            return Ok(Decision::Quit);
        }
        match answer.trim().to_ascii_lowercase().as_str() {
            "a" | "approve" | "y" | "yes" => return Ok(Decision::Approve),
            "r" | "reject" => return Ok(Decision::Reject),
            "s" | "skip" => return Ok(Decision::Skip),
            "q" | "quit" => return Ok(Decision::Quit),
            _ => println!("please answer a, r, s or q"),
        }
    }
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question}");
    io::stdout().flush().context("failed to flush stdout")?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}

fn resolve_runtime(runtime: &RuntimeOptions) -> Result<(WorkspacePaths, MigrateConfig)> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        workspace_dir: runtime.dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let workspace_env = initial.root.join(".env");
    if workspace_env.exists() {
        let _ = dotenvy::from_path_override(&workspace_env);
    }

    let paths = resolve_paths(&context, &overrides)?;
    let config = load_config(&paths.config_path)?;
    debug!(root = %normalize_for_display(&paths.root), "resolved workspace");
    Ok((paths, config))
}

fn parse_types(raw: Option<&str>) -> Result<Vec<ItemType>> {
    match raw {
        Some(raw) => parse_item_types(raw),
        None => Ok(Vec::new()),
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn invocation() -> String {
    std::env::args().collect::<Vec<_>>().join(" ")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::{Cli, Commands, split_list};

    #[test]
    fn command_surface_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn logs_rejects_limit_with_all() {
        assert!(Cli::try_parse_from(["mdmigrate", "logs", "--limit", "5", "--all"]).is_err());
        let cli = Cli::try_parse_from(["mdmigrate", "logs", "--all"]).expect("parse");
        assert!(matches!(cli.command, Some(Commands::Logs(args)) if args.all));
    }

    #[test]
    fn split_list_drops_blank_entries() {
        assert_eq!(split_list(Some(" PRJ-1, ,Home ")), vec!["PRJ-1", "Home"]);
        assert!(split_list(None).is_empty());
    }
}
