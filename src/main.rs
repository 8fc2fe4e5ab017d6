use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use storyforge::Phase;

mod cmd;

#[derive(Parser)]
#[command(name = "storyforge")]
#[command(version, about = "Phase-driven story generation orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to storyforge.toml. Defaults to ./storyforge.toml, then the user config dir.
    #[arg(long, global = true, env = "STORYFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run phases for a session file, in the order given
    Run {
        /// Session JSON file; updated in place
        session: PathBuf,

        /// Phases to run (compression, analysis, outline, breakdown, chapter1, continuation)
        #[arg(required = true)]
        phases: Vec<Phase>,

        /// Author notes passed to the prompts; `[outline:shape]` selects one outline subtask
        #[arg(long)]
        notes: Option<String>,

        /// Continue the stored (truncated) step content instead of starting over
        #[arg(long)]
        resume: bool,

        /// Override the default model
        #[arg(long)]
        model: Option<String>,

        /// Override scheduler.max_concurrent_runs
        #[arg(long)]
        max_concurrent_runs: Option<usize>,

        /// Print scheduler events as JSON lines on stderr
        #[arg(long)]
        events: bool,
    },
    /// Run the rule-only consistency check on a chapter
    Check {
        /// Session JSON file
        session: PathBuf,

        /// Chapter number (defaults to the latest chapter)
        #[arg(long)]
        chapter: Option<usize>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Store the report and foreshadow ledger in the session file
        #[arg(long)]
        save: bool,
    },
    /// View and validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate the configuration file
    Validate,
    /// Create a default storyforge.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // a missing .env is fine
    let _ = dotenvy::dotenv();
    storyforge::logging::init(cli.verbose, cli.log_json);

    match &cli.command {
        Commands::Run {
            session,
            phases,
            notes,
            resume,
            model,
            max_concurrent_runs,
            events,
        } => {
            let args = cmd::run::RunArgs {
                session: session.clone(),
                phases: phases.clone(),
                notes: notes.clone(),
                resume: *resume,
                model: model.clone(),
                max_concurrent_runs: *max_concurrent_runs,
                events: *events,
            };
            cmd::cmd_run(&cli, args).await?;
        }
        Commands::Check {
            session,
            chapter,
            json,
            save,
        } => cmd::cmd_check(session, *chapter, *json, *save).await?,
        Commands::Config { command } => cmd::cmd_config(&cli, command.clone())?,
    }

    Ok(())
}
