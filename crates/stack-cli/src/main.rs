use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::Parser;
use stack_core::{default_config_home, BootstrapOptions, SubstrateClientFactory, Terminated};
use stack_harness::{BootstrapManager, RunnerArgs};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "deploy-stack",
    about = "Bootstrap a test environment, run a verification payload, collect logs, tear down"
)]
struct Cli {
    /// Named environment in the configuration home.
    env: String,
    /// Path to the substrate binary under test.
    juju_bin: PathBuf,
    /// Unique run name; the disposable environment is derived from it.
    temp_env_name: String,
    /// Log output directory (a timestamped temp directory when omitted).
    #[arg(long)]
    logs: Option<PathBuf>,
    #[arg(long)]
    debug: bool,
    /// Address of a pre-existing host to bootstrap onto.
    #[arg(long)]
    bootstrap_host: Option<String>,
    /// Additional machine to attach, repeatable.
    #[arg(long = "machine")]
    machines: Vec<String>,
    #[arg(long)]
    series: Option<String>,
    #[arg(long)]
    agent_url: Option<String>,
    #[arg(long)]
    agent_stream: Option<String>,
    #[arg(long)]
    region: Option<String>,
    /// Leave the environment running after the payload.
    #[arg(long)]
    keep_env: bool,
    #[arg(long)]
    upload_tools: bool,
    /// Force the multi-model lifecycle even for clients that do not report it.
    #[arg(long)]
    multi_model: bool,
    /// Absolute run deadline, UTC, as YYYY-mm-ddTHH:MM:SS.
    #[arg(long, value_parser = parse_deadline)]
    deadline: Option<DateTime<Utc>>,
}

fn parse_deadline(raw: &str) -> Result<DateTime<Utc>, String> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|err| format!("invalid deadline '{raw}': {err}"))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        if err.is::<Terminated>() {
            // The failure is already in the log bundle.
            std::process::exit(1);
        }
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let args = RunnerArgs {
        env: cli.env,
        juju_bin: cli.juju_bin,
        temp_env_name: cli.temp_env_name,
        logs: cli.logs,
        debug: cli.debug,
        bootstrap_host: cli.bootstrap_host,
        machines: cli.machines,
        series: cli.series,
        agent_url: cli.agent_url,
        agent_stream: cli.agent_stream,
        region: cli.region,
        keep_env: cli.keep_env,
        upload_tools: cli.upload_tools,
        multi_model: cli.multi_model,
        deadline: cli.deadline,
    };
    let factory = SubstrateClientFactory::new(default_config_home());
    let mut manager = BootstrapManager::from_args(&args, &factory)?;
    if let Some(log_dir) = &manager.log_dir {
        info!("Logs under {}", log_dir.display());
    }
    manager.booted_context(args.upload_tools, &BootstrapOptions::default(), |mgr| {
        let client = mgr.client();
        let status = client.borrow_mut().get_status()?;
        info!("{} machines up", status.machines.len());
        let text = client.borrow_mut().juju("show-status", &["--format", "yaml"])?;
        println!("{text}");
        Ok(())
    })
}
