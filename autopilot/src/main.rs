//! Steerable run-cycle orchestrator.
//!
//! Keeps its state under `.autopilot/` in the workspace root: the plan
//! document (`PLAN.md`), the run record (`state/run.json`) and one record per
//! cycle (`cycles/`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use autopilot::control::Controller;
use autopilot::core::status::describe;
use autopilot::cycle::CycleReport;
use autopilot::exit_codes;
use autopilot::io::init::{AutopilotPaths, InitOptions, init_workspace};
use autopilot::io::notifier::ChannelNotifier;
use autopilot::logging;
use autopilot::orchestrator::Orchestrator;
use autopilot::scheduler::ScheduleOutcome;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Parser)]
#[command(
    name = "autopilot",
    version,
    about = "Steerable run-cycle orchestrator for an autonomous agent"
)]
struct Cli {
    /// Workspace root containing `.autopilot/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Log progress to stderr (`autopilot=info`) unless `RUST_LOG` is set.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.autopilot/` with default config and an empty plan.
    Init {
        /// Overwrite config and `.gitignore` if `.autopilot/` exists.
        #[arg(short, long)]
        force: bool,
    },
    /// Describe the run. Exits 4 while an approval is pending.
    Status,
    /// Run one cycle now.
    Cycle,
    /// Start the loop; each stdin line is an operator message. Ctrl-C stops.
    Run,
    /// Send one operator message to the persisted run.
    Send {
        /// Message text.
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
        /// Attachment references passed along with the message.
        #[arg(long = "attach")]
        attachments: Vec<String>,
    },
    /// Approve the pending action.
    Approve,
    /// Reject the pending action.
    Reject,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let root = cli.root;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Status => cmd_status(&root).await,
        Command::Cycle => cmd_cycle(&root).await,
        Command::Run => cmd_run(&root).await,
        Command::Send { text, attachments } => cmd_send(&root, &text.join(" "), attachments).await,
        Command::Approve => cmd_resolve(&root, true).await,
        Command::Reject => cmd_resolve(&root, false).await,
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_workspace(root, &InitOptions { force })?;
    println!("initialized {}", paths.autopilot_dir.display());
    Ok(exit_codes::OK)
}

/// Open the workspace with notifications routed to a channel.
fn open(root: &Path) -> Result<(Controller, UnboundedReceiver<String>)> {
    let paths = AutopilotPaths::new(root);
    if !paths.autopilot_dir.is_dir() {
        bail!(
            "no .autopilot workspace in {} (run `autopilot init` first)",
            root.display()
        );
    }
    let (notifier, rx) = ChannelNotifier::new();
    let orchestrator = Orchestrator::open_workspace(root, Arc::new(notifier))?;
    Ok((Controller::new(Arc::new(orchestrator)), rx))
}

fn drain_notifications(rx: &mut UnboundedReceiver<String>) {
    while let Ok(message) = rx.try_recv() {
        println!("[notify] {message}");
    }
}

fn print_outcome(outcome: &ScheduleOutcome) {
    match outcome {
        ScheduleOutcome::Ran(reports) => reports.iter().for_each(print_report),
        ScheduleOutcome::Coalesced { pending } => {
            println!("cycle already running; follow-up recorded ({pending})");
        }
    }
}

fn print_report(report: &CycleReport) {
    println!(
        "cycle {} ({}): {} -> {}: {}",
        report.cycle, report.trigger, report.mode_before, report.mode_after, report.action
    );
    for err in &report.errors {
        eprintln!("  error: {err}");
    }
}

async fn cmd_status(root: &Path) -> Result<i32> {
    let (controller, _rx) = open(root)?;
    let run = controller.orchestrator().snapshot().await;
    println!("{}", describe(&run));
    if run.pending_approval().is_some() {
        return Ok(exit_codes::BLOCKED);
    }
    Ok(exit_codes::OK)
}

async fn cmd_cycle(root: &Path) -> Result<i32> {
    let (controller, mut rx) = open(root)?;
    let outcome = controller.run_cycle_now().await;
    print_outcome(&outcome);
    drain_notifications(&mut rx);
    Ok(exit_codes::OK)
}

async fn cmd_send(root: &Path, text: &str, attachments: Vec<String>) -> Result<i32> {
    let (controller, mut rx) = open(root)?;
    let ingested = controller.ingest_message(text, attachments).await?;
    println!("{}", ingested.reply);
    if let Some(cycle) = ingested.cycle {
        print_outcome(&cycle.await?);
    }
    drain_notifications(&mut rx);
    Ok(exit_codes::OK)
}

async fn cmd_resolve(root: &Path, approved: bool) -> Result<i32> {
    let (controller, mut rx) = open(root)?;
    println!("{}", controller.resolve_approval(approved).await?);
    drain_notifications(&mut rx);
    Ok(exit_codes::OK)
}

async fn cmd_run(root: &Path) -> Result<i32> {
    let (controller, mut rx) = open(root)?;
    let printer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            println!("[notify] {message}");
        }
    });

    let startup = controller.start_loop().await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    let ingested = controller.ingest_message(&line, Vec::new()).await?;
                    println!("{}", ingested.reply);
                }
                None => stdin_open = false,
            },
        }
    }

    controller.stop_loop().await?;
    startup.abort();
    printer.abort();
    Ok(exit_codes::OK)
}
