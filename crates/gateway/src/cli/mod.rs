pub mod config;
pub mod doctor;
pub mod run;

use clap::{Parser, Subcommand};

/// tether: reliability and routing core for a terminal-hosted assistant.
#[derive(Debug, Parser)]
#[command(name = "tether", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Serve,
    /// Run diagnostic checks against the current configuration.
    Doctor,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Send a single message through the shared session and print the reply.
    Ask {
        /// The message to send.
        message: String,
        /// Channel the message is attributed to.
        #[arg(long, default_value = "cli")]
        channel: String,
        /// Skip the memory-context lookup.
        #[arg(long)]
        no_context: bool,
        /// Output the full turn result as JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },
    /// Scheduled jobs.
    #[command(subcommand)]
    Jobs(JobsCommand),
    /// Capture outbox.
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

#[derive(Debug, Subcommand)]
pub enum JobsCommand {
    /// List configured jobs and their next run.
    List,
    /// Run one job now and wait for it to finish.
    Run {
        /// Job name (case-insensitive).
        name: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// Outbox counts and the last delivery error.
    Stats,
    /// Deliver pending captures once, then print the cycle report.
    Flush,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path specified by `TETHER_CONFIG` (or
/// `config.toml` by default).  Returns the parsed [`Config`] and the
/// path that was used.
///
/// [`Config`]: tt_domain::config::Config
pub fn load_config() -> anyhow::Result<(tt_domain::config::Config, String)> {
    let config_path = std::env::var("TETHER_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        tt_domain::config::Config::default()
    };

    Ok((config, config_path))
}
