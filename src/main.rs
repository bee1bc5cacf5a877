use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use mso_model::core::{
    BusinessRules, Direction, Inputs, build_graph, run_projection, simulate, traverse,
    validate_graph,
};

#[derive(Parser, Debug)]
#[command(
    name = "mso-model",
    about = "Monthly financial projection and risk model for a physician-owned MSO"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the JSON API
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run the 19-month projection and print records plus KPIs
    Project {
        /// JSON file of inputs; absent fields take their defaults
        #[arg(long)]
        inputs: Option<PathBuf>,
    },
    /// Run the Monte Carlo risk simulation
    MonteCarlo {
        #[arg(long)]
        inputs: Option<PathBuf>,
        /// Overrides monteCarloIterations from the inputs
        #[arg(long)]
        iterations: Option<usize>,
        /// Overrides randomSeed from the inputs
        #[arg(long)]
        seed: Option<u64>,
        /// Omit the per-iteration outcomes
        #[arg(long)]
        summary_only: bool,
    },
    /// Print the dependency graph, or the impact set of one node
    Graph {
        #[arg(long)]
        inputs: Option<PathBuf>,
        #[arg(long)]
        node: Option<String>,
        #[arg(long, default_value = "downstream")]
        direction: Direction,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Impact<'a> {
    node: &'a str,
    direction: Direction,
    affected: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let rules = BusinessRules::standard();

    match cli.command {
        Command::Serve { port } => mso_model::api::run_http_server(port)
            .await
            .with_context(|| format!("HTTP server on port {port} failed"))?,
        Command::Project { inputs } => {
            let inputs = load_inputs(inputs.as_deref())?;
            print_json(&run_projection(&inputs, &rules))?;
        }
        Command::MonteCarlo {
            inputs,
            iterations,
            seed,
            summary_only,
        } => {
            let inputs = load_inputs(inputs.as_deref())?;
            let iterations = iterations.unwrap_or(inputs.monte_carlo_iterations as usize);
            let seed = seed.unwrap_or(inputs.random_seed);
            let mut report = tokio::task::spawn_blocking(move || {
                simulate(&inputs, &rules, iterations, seed)
            })
            .await
            .context("simulation task panicked")??;
            if summary_only {
                report.outcomes.clear();
            }
            print_json(&report)?;
        }
        Command::Graph {
            inputs,
            node,
            direction,
        } => {
            let inputs = load_inputs(inputs.as_deref())?;
            let graph = build_graph(&inputs, &rules);
            let issues = validate_graph(&graph);
            if !issues.is_empty() {
                log::warn!("dependency graph has {} integrity issue(s)", issues.len());
            }
            match node {
                Some(node) => {
                    let affected = traverse(&graph, &node, direction)?;
                    print_json(&Impact {
                        node: &node,
                        direction,
                        affected: affected.into_iter().collect(),
                    })?;
                }
                None => print_json(&graph)?,
            }
        }
    }

    Ok(())
}

fn load_inputs(path: Option<&Path>) -> Result<Inputs> {
    let inputs = match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            serde_json::from_str::<Inputs>(&text)
                .with_context(|| format!("invalid inputs JSON in {}", path.display()))?
        }
        None => Inputs::default(),
    };
    inputs.validate()?;
    Ok(inputs)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
