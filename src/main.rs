use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use condense::config::CondenseConfig;
use condense::logging::{self, LogOptions};
use condense::store::load_dotenv;

mod cmd;

#[derive(Parser)]
#[command(name = "condense")]
#[command(version, about = "Compact long conversations into reports and structured overviews")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true, env = "CONDENSE_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compact a transcript into a single report
    Compact {
        /// Transcript JSON file
        transcript: PathBuf,

        /// Workspace id (defaults to the file's, then "default")
        #[arg(short, long)]
        workspace: Option<String>,

        /// Conversation id (defaults to the file's, then the file stem)
        #[arg(short, long)]
        conversation: Option<String>,

        /// Report title
        #[arg(long)]
        title: Option<String>,

        /// Target tokens per chunk. Overrides condense.toml.
        #[arg(long)]
        chunk_tokens: Option<usize>,

        /// Chunks summarized concurrently (1 = sequential)
        #[arg(long)]
        map_concurrency: Option<usize>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,

        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate a structured, sectioned overview of a transcript
    Overview {
        /// Transcript JSON file
        transcript: PathBuf,

        #[arg(short, long)]
        workspace: Option<String>,

        #[arg(short, long)]
        conversation: Option<String>,

        /// Skip diagram generation
        #[arg(long)]
        no_diagrams: bool,

        /// Section tasks run concurrently
        #[arg(long)]
        concurrency: Option<usize>,

        /// Print the overview as JSON instead of markdown
        #[arg(long)]
        json: bool,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Inspect and manage compaction sessions
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Inspect stored compaction results
    #[command(name = "result")]
    Results {
        #[command(subcommand)]
        command: ResultCommands,
    },
    /// List configured providers and whether credentials are present
    Providers,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum SessionCommands {
    /// List all sessions, newest first
    List,
    /// Show one session with its log
    Show { id: String },
    /// Show the active session for a conversation, if any
    Active {
        workspace: String,
        conversation: String,
    },
    /// Cancel a pending or processing session
    Cancel { id: String },
    /// Delete a session, cancelling it first if it is still running
    Delete { id: String },
}

#[derive(Subcommand, Clone)]
pub enum ResultCommands {
    /// Print the stored result for a conversation
    Show {
        workspace: String,
        conversation: String,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default condense.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    load_dotenv(&project_dir);

    let (chunk_tokens, map_concurrency) = match &cli.command {
        Commands::Compact {
            chunk_tokens,
            map_concurrency,
            ..
        } => (*chunk_tokens, *map_concurrency),
        _ => (None, None),
    };
    let config = CondenseConfig::with_cli_args(
        project_dir.clone(),
        cli.verbose,
        cli.json_logs,
        chunk_tokens,
        map_concurrency,
    )?;

    logging::init(&LogOptions {
        verbose: cli.verbose,
        json: config.toml.logging.json,
        directory: config.log_dir(),
    })?;

    match &cli.command {
        Commands::Compact {
            transcript,
            workspace,
            conversation,
            title,
            json,
            output,
            ..
        } => {
            let args = cmd::compact::CompactArgs {
                transcript: transcript.clone(),
                workspace: workspace.clone(),
                conversation: conversation.clone(),
                title: title.clone(),
                json: *json,
                output: output.clone(),
            };
            cmd::cmd_compact(config, args).await?;
        }
        Commands::Overview {
            transcript,
            workspace,
            conversation,
            no_diagrams,
            concurrency,
            json,
            output,
        } => {
            let args = cmd::overview::OverviewArgs {
                transcript: transcript.clone(),
                workspace: workspace.clone(),
                conversation: conversation.clone(),
                no_diagrams: *no_diagrams,
                concurrency: *concurrency,
                json: *json,
                output: output.clone(),
            };
            cmd::cmd_overview(config, args).await?;
        }
        Commands::Session { command } => cmd::cmd_session(config, command.clone()).await?,
        Commands::Results { command } => cmd::cmd_result(config, command.clone()).await?,
        Commands::Providers => cmd::cmd_providers(&config)?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
