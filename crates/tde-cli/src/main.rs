use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "tde", version, about = "Transparent column encryption proxy for PostgreSQL")]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the Postgres proxy server.
    Serve {
        /// Path to tde.yaml
        #[arg(short, long, default_value = "tde.yaml", env = "TDE_CONFIG")]
        config: PathBuf,
    },

    /// Validate configuration, catalog and key material.
    Check {
        #[arg(short, long, default_value = "tde.yaml", env = "TDE_CONFIG")]
        config: PathBuf,
    },

    /// Print the SQL a statement is rewritten to, without contacting the database.
    Rewrite {
        #[arg(short, long, default_value = "tde.yaml", env = "TDE_CONFIG")]
        config: PathBuf,

        /// Print a JSON report instead of plain text
        #[arg(long, default_value_t = false)]
        json: bool,

        /// The statement to rewrite
        sql: String,
    },

    /// Master key management
    Keys {
        #[command(subcommand)]
        cmd: KeysCommand,
    },
}

#[derive(Subcommand, Debug)]
enum KeysCommand {
    /// Generate a new master key.
    Generate {
        /// Write the key to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.cmd {
        Command::Serve { config } => commands::serve::serve(&config).await?,
        Command::Check { config } => commands::check::run(&config)?,
        Command::Rewrite { config, json, sql } => commands::rewrite::run(&config, &sql, json)?,
        Command::Keys { cmd } => match cmd {
            KeysCommand::Generate { output } => commands::keys::generate(output)?,
        },
    }

    Ok(())
}
