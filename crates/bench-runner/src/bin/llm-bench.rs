//! llm-bench - latency and throughput benchmarks for self-hosted inference backends

use anyhow::{Context, Result};
use bench_core::{BenchConfig, LoggingConfig};
use bench_runner::{report, Orchestrator, RunOptions};
use bench_runtime::{create_executor, query_gpus};
use clap::{Args, Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "llm-bench")]
#[command(about = "Benchmark TTFT, TPOT and throughput of Ollama, vLLM and LM Studio deployments")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (JSON or YAML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Log format (text, json)
    #[arg(long, value_name = "FORMAT", global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the configured tests (default)
    Run(RunArgs),

    /// List configured tests
    List,

    /// Deploy a test's backend and leave it running
    Deploy {
        /// Test name or 1-based index; defaults to the first test
        test: Option<String>,
    },

    /// Stop every backend the configured tests use
    Stop,

    /// Show GPU inventory on the target host
    Gpus,

    /// Validate the configuration and exit
    Validate,

    /// Print the summary table of a saved results file
    Report {
        /// Path to test_results.json
        #[arg(short, long, value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Run a single test by name
    #[arg(long)]
    test: Option<String>,

    /// Run tests by name or 1-based index (comma-separated)
    #[arg(long, value_delimiter = ',')]
    tests: Vec<String>,

    /// Rounds per test, overrides every test's repeat
    #[arg(long)]
    repeat: Option<u32>,

    /// Maximum tokens to generate per request
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Prompts to send instead of the configured ones
    #[arg(long, num_args = 1..)]
    prompts: Option<Vec<String>>,

    /// Save every streaming event of every trial under the run directory
    #[arg(long)]
    save_chunks: bool,

    /// Leave the backend running after the run
    #[arg(long)]
    no_cleanup: bool,

    /// Deploy the first selected test's backend and exit
    #[arg(long)]
    deploy_only: bool,
}

impl RunArgs {
    fn options(&self) -> RunOptions {
        let mut tests: Vec<String> = self.test.iter().cloned().collect();
        tests.extend(self.tests.iter().map(|t| t.trim().to_string()).filter(|t| !t.is_empty()));

        RunOptions {
            tests,
            repeat: self.repeat,
            max_tokens: self.max_tokens,
            prompts: self.prompts.clone(),
            save_chunks: self.save_chunks,
            cleanup: !self.no_cleanup,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = BenchConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let mut logging = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        logging.format = format.clone();
    }
    init_logging(&logging);

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(config, args).await,
        Commands::List => {
            if config.tests.is_empty() {
                println!("{}", "No tests configured".dimmed());
            } else {
                println!("{}", report::tests_table(&config));
            }
            Ok(())
        }
        Commands::Deploy { test } => {
            let mut orchestrator = Orchestrator::new(config);
            let endpoint = orchestrator.deploy_only(&test.into_iter().collect::<Vec<_>>()).await?;
            print_endpoint(&endpoint);
            Ok(())
        }
        Commands::Stop => {
            let mut orchestrator = Orchestrator::new(config);
            orchestrator.stop_all().await?;
            println!("{} {}", "✓".green().bold(), "All backends stopped".green());
            Ok(())
        }
        Commands::Gpus => {
            let executor = create_executor(&config.executor);
            let gpus = query_gpus(executor.as_ref(), config.lifecycle.command_timeout()).await?;
            if gpus.is_empty() {
                println!("{}", "No GPUs found".dimmed());
            } else {
                println!("{}", report::gpu_table(&gpus));
            }
            Ok(())
        }
        Commands::Validate => {
            println!(
                "{} Configuration is valid ({} tests, {} prompts)",
                "✓".green().bold(),
                config.tests.len(),
                config.prompts.len()
            );
            Ok(())
        }
        Commands::Report { file } => {
            let results = Orchestrator::load_results(&file)
                .await
                .with_context(|| format!("Failed to read results from {}", file.display()))?;
            report::print_results(&results);
            Ok(())
        }
    }
}

async fn run(config: BenchConfig, args: RunArgs) -> Result<()> {
    let options = args.options();
    let mut orchestrator = Orchestrator::new(config);

    if args.deploy_only {
        let endpoint = orchestrator.deploy_only(&options.tests).await?;
        print_endpoint(&endpoint);
        return Ok(());
    }

    info!("Starting benchmark run");
    let results = orchestrator.run(&options).await?.to_vec();

    report::print_results(&results);
    println!("Results saved to {}", orchestrator.results_file().display());
    Ok(())
}

fn print_endpoint(endpoint: &bench_runtime::ApiEndpoint) {
    println!("{} {} is ready", "✓".green().bold(), endpoint.variant.to_string().bold());
    println!("{}: {}", "Model".bold().cyan(), endpoint.model);
    println!("{}: {}", "Completions".bold().cyan(), endpoint.completion_url);
    println!("{}: {}", "Readiness".bold().cyan(), endpoint.readiness_url);
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match logging.format.as_str() {
        "json" => subscriber.json().init(),
        _ => subscriber.init(),
    }
}
