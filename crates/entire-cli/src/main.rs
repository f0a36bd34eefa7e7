//! entire CLI: hook entry points and read-side commands.

use std::io;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use entire_core::hook::{exit_code, HookEvent, HookInput};
use entire_core::query;
use entire_core::strategy::{unsupported, CleanFilter, StrategyContext};
use entire_core::{Dispatcher, EntireResult};

#[derive(Parser)]
#[command(name = "entire", about = "Audit trail for AI coding-agent sessions", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle a lifecycle hook. Reads a JSON payload from stdin for agent
    /// events; git events take no payload.
    Hook {
        /// Event name: user-prompt-submit, file-change, pre-task,
        /// post-task, stop, session-end, post-commit, pre-push.
        event: String,
    },

    /// Show the active strategy and session overview.
    Status,

    /// List rewind points, newest first.
    RewindPoints {
        /// Maximum number of points to show.
        #[arg(long, short, default_value = "20")]
        limit: usize,
    },

    /// List tracked sessions.
    Sessions,

    /// Print one session entry of a checkpoint.
    Show {
        /// Checkpoint ID (12 hex characters).
        checkpoint_id: String,

        /// Session entry index (0 is the primary).
        #[arg(long, default_value = "0")]
        session: usize,
    },

    /// Delete the shadow branch and session state for the current HEAD.
    Reset {
        /// Skip confirmation (reset is not interactive here; the flag is
        /// accepted for hook-script compatibility).
        #[arg(long, short)]
        force: bool,
    },

    /// Remove session state files.
    Clean {
        /// Only remove sessions that have ended.
        #[arg(long)]
        ended_only: bool,

        /// Only remove sessions whose base commit starts with this prefix.
        #[arg(long)]
        base_commit: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let cwd = std::env::current_dir().unwrap_or_else(|e| {
        eprintln!("error: cannot determine current directory: {e}");
        process::exit(1);
    });

    match cli.command {
        Commands::Hook { event } => run_hook(&cwd, &event),
        Commands::Status => exit_on_error(cmd_status(&cwd)),
        Commands::RewindPoints { limit } => exit_on_error(cmd_rewind_points(&cwd, limit)),
        Commands::Sessions => exit_on_error(cmd_sessions(&cwd)),
        Commands::Show { checkpoint_id, session } => {
            exit_on_error(cmd_show(&cwd, &checkpoint_id, session))
        }
        Commands::Reset { force } => exit_on_error(cmd_reset(&cwd, force)),
        Commands::Clean { ended_only, base_commit } => {
            exit_on_error(cmd_clean(&cwd, ended_only, base_commit))
        }
    }
}

fn exit_on_error(result: EntireResult<()>) {
    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

/// Hooks never abort the user's operation: engine failures are reported
/// as warnings and mapped to the host's expected exit codes.
fn run_hook(cwd: &PathBuf, event_name: &str) {
    let result = (|| {
        let event = HookEvent::parse(event_name)?;
        let input = HookInput::from_reader(io::stdin().lock())?;
        let dispatcher = Dispatcher::discover(cwd)?;
        dispatcher.dispatch(event, &input)
    })();

    if let Err(e) = &result {
        eprintln!("entire: warning: {e}");
    }
    process::exit(exit_code(&result));
}

fn cmd_status(cwd: &PathBuf) -> EntireResult<()> {
    let dispatcher = Dispatcher::discover(cwd)?;
    let sessions = query::list_sessions(dispatcher.paths())?;
    println!("strategy: {}", dispatcher.strategy().name());
    println!("worktree: {}", dispatcher.paths().worktree_id);
    println!("sessions: {}", sessions.len());
    for state in sessions {
        println!(
            "  {} {:?} base={} turns={}",
            state.session_id,
            state.phase,
            &state.base_commit[..state.base_commit.len().min(7)],
            state.turn_checkpoint_ids.len()
        );
    }
    Ok(())
}

fn cmd_rewind_points(cwd: &PathBuf, limit: usize) -> EntireResult<()> {
    let dispatcher = Dispatcher::discover(cwd)?;
    let points = query::rewind_points(dispatcher.repo(), dispatcher.paths(), limit)?;
    if points.is_empty() {
        println!("no rewind points");
        return Ok(());
    }
    for point in points {
        println!(
            "{}  {}  {}",
            point.checkpoint_id,
            point.timestamp.to_rfc3339(),
            point.commit.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn cmd_sessions(cwd: &PathBuf) -> EntireResult<()> {
    let dispatcher = Dispatcher::discover(cwd)?;
    for state in query::list_sessions(dispatcher.paths())? {
        println!("{}", serde_json::to_string_pretty(&state)?);
    }
    Ok(())
}

fn cmd_show(cwd: &PathBuf, checkpoint_id: &str, session: usize) -> EntireResult<()> {
    let dispatcher = Dispatcher::discover(cwd)?;
    let id = entire_core::CheckpointId::parse(checkpoint_id)?;
    let content =
        query::read_session_content(dispatcher.repo(), dispatcher.paths(), &id, session)?;

    println!("session: {}", content.metadata.session_id);
    if !content.metadata.agents.is_empty() {
        println!("agent: {}", content.metadata.agents);
    }
    println!("files: {}", content.metadata.files_touched.join(", "));
    println!("hash: {}", content.content_hash);
    println!("--- prompt ---");
    println!("{}", content.prompts);
    println!("--- context ---");
    println!("{}", content.context);
    Ok(())
}

fn cmd_reset(cwd: &PathBuf, _force: bool) -> EntireResult<()> {
    let dispatcher = Dispatcher::discover(cwd)?;
    let strategy = dispatcher.strategy();
    let Some(resetter) = strategy.resetter() else {
        return Err(unsupported(strategy, "reset"));
    };

    let ctx = StrategyContext {
        repo: dispatcher.repo(),
        paths: dispatcher.paths(),
    };
    let outcome = resetter.reset(&ctx)?;
    for session in &outcome.cleared_sessions {
        eprintln!("Cleared session state for {session}");
    }
    match outcome.deleted_shadow {
        Some(name) => eprintln!("Deleted shadow branch {name}"),
        None if outcome.cleared_sessions.is_empty() => eprintln!("Nothing to reset"),
        None => {}
    }
    Ok(())
}

fn cmd_clean(cwd: &PathBuf, ended_only: bool, base_commit: Option<String>) -> EntireResult<()> {
    let dispatcher = Dispatcher::discover(cwd)?;
    let strategy = dispatcher.strategy();
    let Some(cleaner) = strategy.cleaner() else {
        return Err(unsupported(strategy, "clean"));
    };

    let ctx = StrategyContext {
        repo: dispatcher.repo(),
        paths: dispatcher.paths(),
    };
    let outcome = cleaner.clean(
        &ctx,
        &CleanFilter {
            ended_only,
            base_commit_prefix: base_commit,
        },
    )?;
    if outcome.removed_sessions.is_empty() {
        eprintln!("Nothing to clean");
    }
    for session in outcome.removed_sessions {
        eprintln!("Removed session state for {session}");
    }
    Ok(())
}
