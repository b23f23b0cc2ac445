use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, error};

use taskforge::config::Config;
use taskforge::orchestration::{CompareStatus, CompareTask, GroupSpec, GroupStatus, TaskGroup};
use taskforge::{Error, Forge, Result};

/// Taskforge - run coding-agent instructions in isolated git worktrees
#[derive(Parser, Debug)]
#[command(name = "taskforge")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    TASKFORGE_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.taskforge/taskforge.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Validate a group file and print its execution stages
    Plan {
        /// Group spec (.toml or .json)
        file: PathBuf,
    },

    /// Run a task group in the current repository
    Run {
        /// Group spec (.toml or .json)
        file: PathBuf,

        /// Print the final group as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one instruction against every configured executor
    Compare {
        instruction: String,

        /// Revision the workspaces start from
        #[arg(long = "ref", default_value = "HEAD")]
        rev: String,

        /// Print the final compare task as JSON
        #[arg(long)]
        json: bool,
    },

    /// Reclaim stale and orphaned workspaces
    Sweep {
        /// Idle time before a workspace is reclaimed (default: from config)
        #[arg(long)]
        retention_secs: Option<u64>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = taskforge::log::init_with_debug(cli.debug);

    match run(cli.command) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, category = ?e.category(), "command failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command succeeded.
fn run(command: Command) -> Result<bool> {
    debug!(?command, "running command");
    match command {
        Command::Plan { file } => run_plan(&file),
        Command::Run { file, json } => with_forge(|forge| async move { run_group(&forge, &file, json).await }),
        Command::Compare { instruction, rev, json } => {
            with_forge(|forge| async move { run_compare(&forge, &instruction, &rev, json).await })
        }
        Command::Sweep { retention_secs } => with_forge(|forge| async move {
            let retention = retention_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| forge.config().cleanup.retention());
            let report = forge.sweep_stale_workspaces(retention).await;
            println!(
                "Reclaimed {} workspace(s), removed {} orphan(s), {} failure(s)",
                report.reclaimed.len(),
                report.orphans_removed.len(),
                report.failed.len()
            );
            for (id, err) in &report.failed {
                println!("  {}: {}", id.short(), err);
            }
            Ok(report.is_clean())
        }),
    }
}

fn with_forge<F, Fut>(f: F) -> Result<bool>
where
    F: FnOnce(Forge) -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let config = Config::load()?;
    let repo_path = std::env::current_dir()?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let forge = Forge::from_config(config, &repo_path)?;
        f(forge).await
    })
}

fn load_spec(file: &Path) -> Result<GroupSpec> {
    let raw = std::fs::read_to_string(file)?;
    match file.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(serde_json::from_str(&raw)?),
        Some("toml") => Ok(toml::from_str(&raw)?),
        _ => Err(Error::Validation(format!(
            "{}: expected a .toml or .json group file",
            file.display()
        ))),
    }
}

fn run_plan(file: &Path) -> Result<bool> {
    let spec = load_spec(file)?;
    let stages = taskforge::orchestration::group::plan_group(&spec.tasks, spec.mode, spec.max_parallel)?;
    println!("Group '{}' ({} mode, {} tasks)", spec.name, spec.mode, spec.tasks.len());
    for stage in &stages {
        let ids: Vec<&str> = stage.tasks.iter().map(|t| t.as_str()).collect();
        println!("  stage {}: {}", stage.index, ids.join(", "));
    }
    Ok(true)
}

async fn run_group(forge: &Forge, file: &Path, json: bool) -> Result<bool> {
    let spec = load_spec(file)?;
    let id = forge.start_group(spec).await?;

    let group = tokio::select! {
        group = forge.wait_for_group(id) => group?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling group {}...", id.short());
            forge.cancel_group(id).await?;
            forge.wait_for_group(id).await?
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&group)?);
    } else {
        print_group(&group);
    }
    Ok(matches!(group.status, GroupStatus::Completed))
}

fn print_group(group: &TaskGroup) {
    println!("Group {} '{}': {}", group.id.short(), group.name, group.status);
    println!(
        "  completed {} / failed {} / skipped {} / total {}",
        group.progress.completed, group.progress.failed, group.progress.skipped, group.progress.total
    );
    for run in &group.runs {
        let attempts = run.retry.as_ref().map(|r| r.attempt).unwrap_or(0);
        println!("  {:<20} {} (attempts: {})", run.task_id.as_str(), run.state, attempts);
    }
    if let Some(err) = &group.error {
        println!("  error: {}", err);
    }
}

async fn run_compare(forge: &Forge, instruction: &str, rev: &str, json: bool) -> Result<bool> {
    let id = forge.start_compare(instruction, rev).await?;

    let compare = tokio::select! {
        compare = forge.wait_for_compare(id) => compare?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling compare {}...", id.short());
            forge.cancel_compare(id).await?;
            forge.wait_for_compare(id).await?
        }
    };
    let files = forge.get_compare_files(id).await?;

    if json {
        let output = serde_json::json!({ "compare": compare, "files": files });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_compare(&compare);
        println!("  changed files: {}{}", files.total_count, if files.truncated { " (truncated)" } else { "" });
        for entry in &files.files {
            let statuses: Vec<String> = entry
                .statuses
                .iter()
                .map(|(kind, status)| format!("{}={:?}", kind, status))
                .collect();
            println!("    {:<40} {}", entry.path, statuses.join(" "));
        }
    }
    Ok(matches!(compare.status, CompareStatus::Completed | CompareStatus::PartialSuccess))
}

fn print_compare(compare: &CompareTask) {
    println!(
        "Compare {} at {}: {}",
        compare.id.short(),
        &compare.base_revision[..compare.base_revision.len().min(12)],
        compare.status
    );
    for sub in compare.sub_tasks.values() {
        let detail = sub.error.as_deref().unwrap_or("");
        println!("  {:<8} {:?} {}", sub.executor.as_str(), sub.status, detail);
    }
}
