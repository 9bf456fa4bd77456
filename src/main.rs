use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use weft_agent::plan::{parse_plan, WorkflowPlan};
use weft_core::config::EngineConfig;
use weft_core::types::StepStatus;

#[derive(Parser)]
#[command(name = "weft", version, about = "Multi-agent workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a plan, then report variable-flow issues
    Check {
        /// Plan file (markup or JSON)
        plan: PathBuf,
        /// Print the validated plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the plan's execution stages
    Stages {
        /// Plan file (markup or JSON)
        plan: PathBuf,
    },
    /// Print the task markup one agent starts from
    Render {
        /// Plan file (markup or JSON)
        plan: PathBuf,
        /// Agent id
        #[arg(long, default_value_t = 0)]
        agent: usize,
        /// Main task shown to the agent
        #[arg(long, default_value = "")]
        task: String,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Check { plan, json } => {
            let plan = read_plan(&plan, &config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                println!("Plan `{}`: {} agent(s)", plan.name, plan.agents.len());
                for agent in &plan.agents {
                    let deps: Vec<String> = agent.depends_on.iter().map(|d| d.to_string()).collect();
                    println!(
                        "  [{}] {} ({} step(s), depends on: {})",
                        agent.id,
                        agent.capability,
                        agent.steps.len(),
                        if deps.is_empty() { "-".to_string() } else { deps.join(", ") }
                    );
                }
            }
            let lints = plan.variable_lints();
            for lint in &lints {
                warn!("{}", lint);
            }
            if lints.is_empty() {
                info!("Plan is valid");
            } else {
                info!(lints = lints.len(), "Plan is valid with warnings");
            }
        }
        Commands::Stages { plan } => {
            let plan = read_plan(&plan, &config)?;
            for (n, stage) in plan.stages().iter().enumerate() {
                let members: Vec<String> = stage
                    .iter()
                    .filter_map(|id| plan.get(*id))
                    .map(|a| format!("{} ({})", a.id, a.capability))
                    .collect();
                println!("stage {}: {}", n, members.join(", "));
            }
        }
        Commands::Render { plan, agent, task } => {
            let plan = read_plan(&plan, &config)?;
            let node = plan
                .get(agent)
                .with_context(|| format!("plan has no agent with id {}", agent))?;
            println!("{}", node.to_markup(&task, |_| StepStatus::Todo));
        }
        Commands::Config => {
            println!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        debug!(path = %path.display(), "Loading config");
        Ok(EngineConfig::load(path)?)
    } else {
        debug!(path = %path.display(), "No config file, using defaults");
        Ok(EngineConfig::default())
    }
}

fn read_plan(path: &Path, config: &EngineConfig) -> anyhow::Result<WorkflowPlan> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read plan file {}", path.display()))?;
    let plan = parse_plan(&text, &config.planner.capabilities)
        .with_context(|| format!("invalid plan {}", path.display()))?;
    Ok(plan)
}
