use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crabswarm::a2a::matcher::MatchConstraints;
use crabswarm::a2a::types::Message;
use crabswarm::a2a::{agent_card, server, AgentRegistry, HttpAgentClient, OrchestrationRequest, Orchestrator};
use crabswarm::Config;
use std::path::PathBuf;
use std::sync::Arc;

/// Crabswarm - orchestrate requests across remote A2A agents.
#[derive(Parser, Debug)]
#[command(name = "crabswarm")]
#[command(version, about = "Agent-to-Agent orchestration gateway.", long_about = None)]
struct Cli {
    /// Config file (default: ~/.crabswarm/config.toml)
    #[arg(short, long, global = true, env = "CRABSWARM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the gateway with health monitoring and session purging
    Serve {
        /// Port to listen on (overrides gateway.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides gateway.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Print this gateway's agent card
    Card,

    /// Print the effective configuration as TOML
    Config,

    /// Rank the configured seed agents for a query
    Discover {
        query: String,

        /// Require one of these tags (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        #[arg(long, default_value = "5")]
        max_results: usize,
    },

    /// Run one orchestration against the configured seed agents
    Ask {
        query: String,

        /// Session to continue
        #[arg(long)]
        session: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    let _log_guard = crabswarm::logging::init(&config.logging)?;

    match cli.command {
        Commands::Serve { port, bind } => {
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(bind) = bind {
                config.gateway.bind = bind;
            }
            config.gateway.enabled = true;
            server::start_server(&config).await
        }
        Commands::Card => {
            let card = agent_card::build_agent_card(&config.gateway.bind, config.gateway.port);
            println!("{}", serde_json::to_string_pretty(&card)?);
            Ok(())
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Discover {
            query,
            tags,
            max_results,
        } => {
            let orchestrator = local_orchestrator(&config).await?;
            let constraints = MatchConstraints {
                tags,
                max_results: Some(max_results),
                ..MatchConstraints::default()
            };
            let candidates = orchestrator.discover(&query, &constraints)?;
            for c in candidates {
                println!(
                    "{:<24} {:>6.3}  {:<9} {}",
                    c.agent, c.score, c.health, c.matched_skill
                );
            }
            Ok(())
        }
        Commands::Ask { query, session } => {
            let orchestrator = local_orchestrator(&config).await?;
            let mut request = OrchestrationRequest::new(Message::user(query));
            request.session_id = session;
            let reply = orchestrator.handle(request).await?;
            println!("{}", reply.message.text());
            eprintln!(
                "plan {} ({}) session {}",
                reply.plan_id, reply.status, reply.session_id
            );
            Ok(())
        }
    }
}

/// Orchestrator over the seed agents listed in the config.
async fn local_orchestrator(config: &Config) -> Result<Orchestrator> {
    if config.agents.is_empty() {
        anyhow::bail!("no seed agents configured; set `agents` in the config file or CRABSWARM__AGENTS");
    }
    let client = Arc::new(HttpAgentClient::new()?);
    let orchestrator = Orchestrator::new(config.clone(), Arc::new(AgentRegistry::new()), client);
    let registered = orchestrator.register_seeds(&config.agents).await;
    if registered.is_empty() {
        anyhow::bail!("none of the {} seed agents could be reached", config.agents.len());
    }
    Ok(orchestrator)
}
