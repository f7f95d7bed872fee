mod context;
mod graph_cmds;
mod recorder;
mod session;

use std::path::Path;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use convograph_config::{AppConfig, DEFAULT_CONFIG_PATH, TelemetryConfig};
use convograph_memory::Sender;

use crate::context::AppContext;
use crate::recorder::Recorded;

#[derive(Debug, Parser)]
#[command(
    name = "convograph",
    version,
    about = "Chat assistant that records every turn into a conversation graph"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Interactive chat; every turn is ingested.
    Chat,
    /// Ingest a single message.
    Ingest {
        #[arg(long, value_enum, default_value = "human")]
        sender: CliSender,
        #[arg(long)]
        text: String,
        /// Comma-separated topics; skips label extraction.
        #[arg(long)]
        topics: Option<String>,
    },
    /// Inspect the conversation graph.
    Graph {
        #[command(subcommand)]
        command: GraphCommands,
    },
    Doctor {
        /// Also send one embedding request to the configured provider.
        #[arg(long)]
        probe: bool,
    },
}

#[derive(Debug, Subcommand)]
enum GraphCommands {
    Stats {
        #[arg(long)]
        json: bool,
    },
    Show {
        #[arg(value_name = "MESSAGE_ID")]
        id: String,
    },
    Topics,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliSender {
    Human,
    Ai,
}

impl From<CliSender> for Sender {
    fn from(sender: CliSender) -> Self {
        match sender {
            CliSender::Human => Sender::Human,
            CliSender::Ai => Sender::Ai,
        }
    }
}

/// Install the global subscriber.  `RUST_LOG` wins over `telemetry.log_level`.
/// The returned guard must live until exit so file logs are flushed.
fn init_tracing(telemetry: &TelemetryConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&telemetry.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    if telemetry.log_dir.trim().is_empty() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .try_init()?;
        return Ok(None);
    }

    std::fs::create_dir_all(&telemetry.log_dir)?;
    let appender = tracing_appender::rolling::daily(&telemetry.log_dir, "convograph.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config_path = Path::new(&cli.config);

    let mut config = AppConfig::load_from(config_path)?;
    let _log_guard = init_tracing(&config.telemetry)?;

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => {
            context::ensure_user_id(&mut config, config_path)?;
            let ctx = AppContext::build(config)?;
            session::run_chat_session(&ctx).await?;
        }
        Commands::Ingest {
            sender,
            text,
            topics,
        } => {
            if text.trim().is_empty() {
                bail!("--text must not be empty");
            }
            context::ensure_user_id(&mut config, config_path)?;
            let ctx = AppContext::build(config)?;
            let recorded = ctx
                .recorder
                .record_with_topics(sender.into(), &text, topics.as_deref())
                .await?;
            match recorded {
                Recorded::Graph(report) => {
                    println!("ingested {}", report.message_id);
                    println!("- topics: {}", describe_topics(report.topics.topics()));
                    println!(
                        "- edges: {} of {} candidates",
                        report.edges_created, report.candidates_scanned
                    );
                    if report.topic_failures + report.edge_failures > 0 {
                        println!(
                            "- skipped: {} topic links, {} edges (see log)",
                            report.topic_failures, report.edge_failures
                        );
                    }
                }
                Recorded::Logged { message_id, topics } => {
                    println!("logged {message_id}");
                    println!("- topics: {}", describe_topics(topics.topics()));
                }
            }
        }
        Commands::Graph { command } => match command {
            GraphCommands::Stats { json } => graph_cmds::run_graph_stats(&config, json)?,
            GraphCommands::Show { id } => graph_cmds::run_graph_show(&config, &id)?,
            GraphCommands::Topics => graph_cmds::run_graph_topics(&config)?,
        },
        Commands::Doctor { probe } => graph_cmds::run_doctor(&config, probe).await?,
    }

    Ok(())
}

fn describe_topics(topics: &[String]) -> String {
    if topics.is_empty() {
        "(none)".to_string()
    } else {
        topics.join(", ")
    }
}
