//! stevedore control plane
//!
//! Drives the release and reconciliation engine against the configured
//! scheduler backend. `simulate` runs a full app lifecycle in memory, which
//! together with `STEVEDORE_SCHEDULER=chaos` exercises the retry behaviour.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use stevedore_control_plane::{
    describe_failures, store::MemoryStore, telemetry, Config, Container, Controller, NewBuild,
    Outcome, ScaleRequest,
};
use tabled::{Table, Tabled};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "control-plane", version, about = "stevedore release engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an app, push a build and scale it until the request succeeds
    Simulate(SimulateArgs),
}

#[derive(Args)]
struct SimulateArgs {
    /// Desired counts, e.g. `web=4 worker=2`
    #[arg(required = true, value_name = "TYPE=COUNT", value_parser = parse_pair)]
    processes: Vec<(String, String)>,

    /// App ID (generated when omitted)
    #[arg(long)]
    app: Option<String>,

    #[arg(long, default_value = "operator")]
    owner: String,

    #[arg(long, default_value = "stevedore/example:latest")]
    image: String,

    /// Procfile entries; defaults to `start <type>` for every requested type
    #[arg(long = "procfile", value_name = "TYPE=CMD", value_parser = parse_pair)]
    procfile: Vec<(String, String)>,

    /// Maximum scale passes
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    rounds: u32,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() && !value.is_empty() => {
            Ok((key.to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    process_type: String,
    #[tabled(rename = "Index")]
    index: u32,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Release")]
    release: String,
}

impl From<&Container> for ContainerRow {
    fn from(c: &Container) -> Self {
        Self {
            name: c.short_name(),
            process_type: c.process_type().to_string(),
            index: c.index(),
            state: c.state().to_string(),
            release: c.release().to_string(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    telemetry::init(&config)?;

    let scheduler = config.scheduler()?;
    info!(scheduler = scheduler.name(), "Starting stevedore control plane");
    let controller = Controller::new(
        Arc::new(MemoryStore::new()),
        scheduler,
        config.controller_settings(),
    );

    match cli.command {
        Command::Simulate(args) => simulate(&controller, args).await,
    }
}

async fn simulate(controller: &Controller, args: SimulateArgs) -> Result<()> {
    let counts: Map<String, Value> = args
        .processes
        .iter()
        .map(|(process_type, count)| (process_type.clone(), Value::String(count.clone())))
        .collect();
    let request = ScaleRequest::from_json(&Value::Object(counts)).context("invalid scale request")?;

    let procfile: Vec<(String, String)> = if args.procfile.is_empty() {
        request
            .iter()
            .map(|(process_type, _)| (process_type.to_string(), format!("start {process_type}")))
            .collect()
    } else {
        args.procfile
    };

    let app = controller.create_app(&args.owner, args.app.as_deref()).await?;
    let deployment = controller
        .create_build(&app.id, NewBuild::new(&args.owner, &args.image).with_procfile(procfile))
        .await?;
    info!(app = %app.id, version = %deployment.release.version, "Build released");

    let mut outcome = Outcome::default();
    for round in 1..=args.rounds {
        outcome = controller.scale(&app.id, &request).await?;
        if outcome.is_success() {
            info!(round, calls = outcome.calls, "Scale request satisfied");
            break;
        }
        warn!(round, failures = outcome.fatal.len(), "Scale pass failed, retrying");
    }

    let containers = controller.list_containers(&app.id, None, None).await?;
    let rows: Vec<ContainerRow> = containers.iter().map(ContainerRow::from).collect();
    println!("{}", Table::new(rows));

    for (process_type, status) in controller.status(&app.id).await? {
        println!("{process_type}: {status:?}");
    }

    if !outcome.is_success() {
        for line in describe_failures(&outcome.fatal) {
            eprintln!("{line}");
        }
        bail!("app {} did not converge after {} rounds", app.id, args.rounds);
    }
    Ok(())
}
