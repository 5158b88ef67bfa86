#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::needless_pass_by_value,
    clippy::uninlined_format_args
)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::Password;
use dmrelay::Config;
use dmrelay::control::SessionEnd;
use dmrelay::relay::{CorrespondentId, load_state};
use dmrelay::store::DurableStore;
use dmrelay::util::tail;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "dmrelay")]
#[command(version = "0.1.0")]
#[command(about = "Relay and keep direct-message conversations from a terminal.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect and open the interactive menu (default)
    Run,
    /// List stored conversations without connecting
    Conversations,
    /// Print a stored conversation without connecting
    Show {
        /// Correspondent user id
        id: CorrespondentId,
        /// Trailing lines to print (default: configured display_lines)
        #[arg(long)]
        lines: Option<usize>,
    },
    /// Store the bot token (prompts when omitted)
    SetToken {
        token: Option<String>,
    },
}

fn main() -> Result<()> {
    // Install default crypto provider for Rustls TLS.
    // This prevents the error: "could not automatically determine the process-level CryptoProvider"
    // when both aws-lc-rs and ring features are available (or neither is explicitly selected).
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Warning: Failed to install default crypto provider: {e:?}");
    }

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run);
    let mut config = Config::load_or_init()?;

    init_logging(&command, &config)?;

    match command {
        Commands::Run => {
            if config.token().is_none() {
                println!("  {}", style("No bot token configured.").yellow());
                store_token(&mut config, None)?;
            }
            match dmrelay::daemon::run(config)? {
                SessionEnd::Quit => {}
                SessionEnd::TokenChanged => {
                    println!("  Restart dmrelay to connect with the new token.");
                }
            }
            Ok(())
        }
        Commands::Conversations => {
            let state = load_state(&DurableStore::new(&config.data_dir));
            let counts = state.conversation_counts();
            if counts.is_empty() {
                println!("No stored conversations in {}", config.data_dir.display());
            }
            for (who, n) in counts {
                println!("{who}\t{n}");
            }
            Ok(())
        }
        Commands::Show { id, lines } => {
            let state = load_state(&DurableStore::new(&config.data_dir));
            let log = state.get_log(id);
            if log.is_empty() {
                bail!("No stored conversation with {id}");
            }
            for line in tail(&log, lines.unwrap_or(config.relay.display_lines)) {
                println!("{line}");
            }
            Ok(())
        }
        Commands::SetToken { token } => store_token(&mut config, token),
    }
}

fn store_token(config: &mut Config, token: Option<String>) -> Result<()> {
    let token = match token {
        Some(token) => token,
        None => Password::new().with_prompt("  Bot token").interact()?,
    };
    let token = token.trim();
    if token.is_empty() {
        bail!("Token must not be empty");
    }
    config.token = Some(token.to_string());
    config.save()?;
    println!(
        "  {} Token saved to {}",
        style("✓").green().bold(),
        config.config_path.display()
    );
    Ok(())
}

/// Respects RUST_LOG, defaults to INFO. The interactive menu owns the
/// terminal, so `run` logs to a file in the data directory instead.
fn init_logging(command: &Commands, config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if matches!(command, Commands::Run) {
        let path = config.data_dir.join("dmrelay.log");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .context("setting default subscriber failed")?;
    } else {
        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .context("setting default subscriber failed")?;
    }
    Ok(())
}
