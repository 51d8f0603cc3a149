use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_loop::RunStatus;
use helmsman_cli::app::run_task;
use helmsman_cli::config::HelmsmanConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Yaml,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive one task against a browser by replaying a scripted plan
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// What the run is trying to accomplish
    #[arg(long)]
    task: String,

    /// Page to open before the first step
    #[arg(long)]
    url: Option<String>,

    /// Plan file for the scripted engine (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    plan: Option<PathBuf>,

    /// Launch headless regardless of configuration
    #[arg(long)]
    headless: bool,

    /// Outcome rendering
    #[arg(short, long, value_enum, default_value = "human")]
    output: OutputFormat,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match execute(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    let config = HelmsmanConfig::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Run(args) => cmd_run(args, config).await,
    }
}

async fn cmd_run(args: RunArgs, mut config: HelmsmanConfig) -> Result<ExitCode> {
    let Some(plan) = args.plan else {
        bail!("--plan is required: the built-in decision engine replays a scripted plan");
    };
    if args.headless {
        config.session.headless = true;
    }

    info!(
        target: "cli",
        version = env!("CARGO_PKG_VERSION"),
        task = %args.task,
        "helmsman starting"
    );
    let outcome = run_task(&config, &args.task, args.url.as_deref(), &plan).await?;

    match args.output {
        OutputFormat::Human => {
            println!("run {}: {}", outcome.run_id, outcome.message);
            println!(
                "status: {}, steps: {}, elapsed: {} ms",
                outcome.status, outcome.steps_taken, outcome.total_time_ms
            );
        }
        OutputFormat::Json => {
            let rendered =
                serde_json::to_string_pretty(&outcome).context("failed to render outcome")?;
            println!("{rendered}");
        }
        OutputFormat::Yaml => {
            let rendered = serde_yaml::to_string(&outcome).context("failed to render outcome")?;
            print!("{rendered}");
        }
    }

    Ok(match outcome.status {
        RunStatus::Done { success: true } => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

fn init_logging(verbose: u8, json: bool) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
