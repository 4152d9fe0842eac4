//! agentwire
//!
//! Headless driver: queues prompts on one session of a long-lived agent CLI
//! and streams the replies to stdout.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use agentwire_core::config::load_config;
use agentwire_core::ndjson::{Message, ResultMessage};
use agentwire_core::tracing_init::init_tracing;
use agentwire_core::AgentOptions;
use agentwire_runtime::{QueueManager, SubprocessTransportFactory};

#[derive(Parser, Debug)]
#[command(name = "agentwire")]
#[command(version, about = "Queue prompts to an agent CLI over stream-json", long_about = None)]
struct Cli {
    /// Prompts to send in order (reads one per stdin line when omitted)
    prompts: Vec<String>,

    /// Path to the agent CLI (discovered on PATH when unset)
    #[arg(long, env = "AGENTWIRE_CLI_PATH")]
    cli_path: Option<PathBuf>,

    /// Working directory for the agent
    #[arg(short = 'd', long)]
    cwd: Option<PathBuf>,

    /// Model to use
    #[arg(short, long)]
    model: Option<String>,

    /// Session ID (random when unset)
    #[arg(short, long)]
    session: Option<String>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "AGENTWIRE_LOG", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
#[allow(clippy::print_stderr)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = format!(
        "agentwire={0},agentwire_core={0},agentwire_runtime={0}",
        cli.log_level
    );
    init_tracing(&filter, cli.log_json)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting agentwire");

    let cwd = match cli.cwd {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let mut config = load_config(Some(&cwd))?;
    if let Some(path) = cli.cli_path {
        config.transport.cli_path = Some(path);
    }

    let prompts = if cli.prompts.is_empty() {
        read_stdin_prompts().await?
    } else {
        cli.prompts
    };
    if prompts.is_empty() {
        anyhow::bail!("no prompts given");
    }

    let options = AgentOptions {
        cwd: Some(cwd),
        model: cli.model,
        ..AgentOptions::default()
    };
    let factory = Arc::new(SubprocessTransportFactory::new(
        options,
        config.transport.clone(),
    ));
    let manager = QueueManager::new(factory, config.queue.clone());
    let session_id = cli
        .session
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut handles = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        handles.push(manager.enqueue(&session_id, prompt).await?);
    }
    info!(%session_id, count = handles.len(), "Prompts queued");

    let mut failures = 0usize;
    let mut interrupted = false;
    for handle in &handles {
        if interrupted {
            handle.cancel();
            continue;
        }
        let Some(mut rx) = handle.take_messages() else {
            continue;
        };
        tokio::select! {
            () = print_stream(&mut rx) => {}
            _ = tokio::signal::ctrl_c() => {
                eprintln!("[Interrupted]");
                handle.cancel();
                interrupted = true;
            }
        }
        if let Err(e) = handle.wait().await {
            eprintln!("[Error: {e}]");
            failures += 1;
        }
    }

    if let Err(e) = manager.close().await {
        warn!(error = %e, "Shutdown incomplete");
    }

    run_outcome(failures, interrupted)
}

fn run_outcome(failures: usize, interrupted: bool) -> anyhow::Result<()> {
    if interrupted {
        anyhow::bail!("interrupted by Ctrl-C");
    }
    if failures > 0 {
        anyhow::bail!("{failures} prompt(s) failed");
    }
    Ok(())
}

async fn read_stdin_prompts() -> anyhow::Result<Vec<String>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut prompts = Vec::new();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if !line.is_empty() {
            prompts.push(line.to_string());
        }
    }
    Ok(prompts)
}

#[allow(clippy::print_stdout)]
async fn print_stream(rx: &mut mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Message::Assistant(assistant) => {
                let text = assistant.text();
                if !text.is_empty() {
                    println!("{text}");
                }
            }
            Message::System(system) => {
                info!(subtype = %system.subtype, session_id = ?system.session_id, "System message");
            }
            Message::Result(result) => print_result(&result),
            Message::User(_) | Message::ControlResponse(_) => {}
        }
    }
}

#[allow(clippy::cast_precision_loss, clippy::print_stderr)]
fn print_result(result: &ResultMessage) {
    let cost = result
        .total_cost_usd
        .map_or_else(String::new, |c| format!(", ${c:.4}"));
    eprintln!(
        "[{}: {} turn(s), {:.1}s{}]",
        result.subtype,
        result.num_turns,
        result.duration_ms as f64 / 1000.0,
        cost
    );
}
