//! cellpilot command line
//!
//! ```text
//! cellpilot run [--task <TASK>] [--plan <PLAN>] [--config <FILE>] [--no-save] [--metrics]
//! cellpilot exec <CODE>
//! cellpilot apps
//! cellpilot sessions
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

use cellpilot::agent::{Agent, Session, SessionStore};
use cellpilot::config::AppConfig;
use cellpilot::integrations::{render_listing, IntegrationStore};
use cellpilot::kernel::render_events;
use cellpilot::runtime::ExecutionRuntime;
use cellpilot::{metrics, tracing as telemetry};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "cellpilot")]
#[command(about = "Plan a task with a language model, then execute it in a live Python kernel")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan and execute a task
    Run {
        /// Task description (prompted for when omitted)
        #[arg(long)]
        task: Option<String>,
        /// Use this plan as-is and skip planning
        #[arg(long)]
        plan: Option<String>,
        /// Do not save the run as a session
        #[arg(long)]
        no_save: bool,
        /// Print Prometheus metrics when the run ends
        #[arg(long)]
        metrics: bool,
    },
    /// Execute one code snippet in a fresh runtime and print its outputs
    Exec {
        code: String,
    },
    /// List persisted apps
    Apps,
    /// List saved sessions
    Sessions,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = telemetry::init_tracing(&config.telemetry) {
        eprintln!("warning: tracing disabled: {}", e);
    }

    let result = match cli.command {
        Command::Run {
            task,
            plan,
            no_save,
            metrics,
        } => run(&config, task, plan, !no_save, metrics).await,
        Command::Exec { code } => exec(&config, &code).await,
        Command::Apps => apps(&config),
        Command::Sessions => sessions(),
    };

    let code = match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "cellpilot failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    };
    telemetry::shutdown_tracing();
    code
}

async fn run(
    config: &AppConfig,
    task: Option<String>,
    plan: Option<String>,
    save: bool,
    print_metrics: bool,
) -> Result<(), BoxError> {
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    let task = match (task, &plan) {
        (Some(task), _) => task,
        (None, Some(plan)) => plan.clone(),
        (None, None) => {
            prompt("Task: ").await?;
            input.next_line().await?.unwrap_or_default()
        }
    };
    if task.trim().is_empty() {
        return Err("no task given".into());
    }

    let mut agent = Agent::start(config).await?;
    let mut session = Session::new(&task, agent.model_name());

    let approved = match plan {
        Some(plan) => {
            agent.set_plan(plan);
            true
        }
        None => review_plan(&mut agent, &task, &mut input).await?,
    };
    if !approved {
        info!("Plan rejected, exiting");
        agent.shutdown().await;
        return Ok(());
    }
    session.set_plan(agent.plan());

    let outcome = tokio::select! {
        result = agent.execute() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let iterations = match &outcome {
        Some(Ok(result)) => result.iterations,
        _ => 0,
    };
    session.record_transcript(agent.transcript(), iterations);

    let outcome = match outcome {
        Some(Ok(result)) => {
            session.mark_complete();
            println!(
                "Done after {} turns ({} tool calls).",
                result.iterations, result.tool_calls_made
            );
            Ok(())
        }
        Some(Err(e)) => Err(e.into()),
        None => {
            warn!("Interrupted, shutting down the kernel");
            Err("interrupted".into())
        }
    };

    agent.shutdown().await;

    if save {
        match SessionStore::default_store().and_then(|store| store.save(&session).map(|_| store)) {
            Ok(store) => info!(session_id = %session.id, dir = %store.base_dir().display(), "Session saved"),
            Err(e) => warn!(error = %e, "Failed to save session"),
        }
    }

    if print_metrics {
        print!("{}", metrics::render());
    }

    outcome
}

/// Show the plan until the user types `go` (approve) or `exit` (abort);
/// anything else is sent back as feedback
async fn review_plan<R>(
    agent: &mut Agent,
    task: &str,
    input: &mut tokio::io::Lines<R>,
) -> Result<bool, BoxError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut plan = agent.generate_plan(task).await?.to_string();
    loop {
        println!("\nPlan:\n{}\n", plan);
        prompt("Type 'go' to execute, 'exit' to abort, or give feedback: ").await?;
        let Some(line) = input.next_line().await? else {
            return Ok(false);
        };
        match line.trim() {
            "go" => return Ok(true),
            "exit" => return Ok(false),
            "" => continue,
            feedback => plan = agent.revise_plan(feedback).await?.to_string(),
        }
    }
}

async fn prompt(text: &str) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(text.as_bytes()).await?;
    stdout.flush().await
}

async fn exec(config: &AppConfig, code: &str) -> Result<(), BoxError> {
    let mut runtime = ExecutionRuntime::start(config.runtime.clone()).await?;
    let result = runtime.execute(code).await;
    runtime.shutdown().await;
    println!("{}", render_events(&result?));
    Ok(())
}

fn apps(config: &AppConfig) -> Result<(), BoxError> {
    let store = IntegrationStore::new(&config.apps.dir);
    println!("{}", render_listing(&store.list()?));
    Ok(())
}

fn sessions() -> Result<(), BoxError> {
    let store = SessionStore::default_store()?;
    let sessions = store.list()?;
    if sessions.is_empty() {
        println!("No saved sessions.");
    }
    for s in sessions {
        println!(
            "{}  {}  {:>3} turns  {}  {}",
            s.id,
            s.created_at.format("%Y-%m-%d %H:%M"),
            s.iterations,
            if s.complete { "done      " } else { "incomplete" },
            s.task
        );
    }
    Ok(())
}
