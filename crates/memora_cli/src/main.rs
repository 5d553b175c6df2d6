//! Memora CLI
//!
//! Command-line tools for a local Memora data directory.
//!
//! # Commands
//!
//! - `review` - Grade a card and queue the result for sync
//! - `preview` - Show when each grade would schedule a card
//! - `cards` - List local card states
//! - `queue` - Show queued and parked sync operations
//! - `settings` - Print normalized scheduler settings

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Memora spaced-repetition tools.
#[derive(Parser)]
#[command(name = "memora")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
    #[arg(global = true, short, long, default_value = ".memora")]
    data_dir: PathBuf,

    /// User the local records belong to
    #[arg(global = true, short, long, default_value = "local")]
    user: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade a card and queue the result for sync
    Review {
        /// Card identifier
        #[arg(short, long)]
        card: String,

        /// Grade: 0 again, 1 hard, 2 good, 3 easy
        #[arg(short, long)]
        grade: i64,

        /// Seconds spent on the card
        #[arg(long, default_value = "0")]
        seconds: i64,

        /// Study session the review belongs to
        #[arg(long)]
        session: Option<String>,

        /// Scheduler settings JSON file
        #[arg(long)]
        settings: Option<PathBuf>,
    },

    /// Show when each grade would schedule a card
    Preview {
        /// Card identifier
        #[arg(short, long)]
        card: String,

        /// Scheduler settings JSON file
        #[arg(long)]
        settings: Option<PathBuf>,
    },

    /// List local card states
    Cards {
        /// Only show cards due now
        #[arg(long)]
        due: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show queued and parked sync operations
    Queue {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print normalized scheduler settings
    Settings {
        /// Partial settings JSON file; defaults are used when omitted
        file: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Review {
            card,
            grade,
            seconds,
            session,
            settings,
        } => {
            commands::review::run(
                &cli.data_dir,
                &cli.user,
                &card,
                grade,
                seconds,
                session,
                settings.as_deref(),
            )?;
        }
        Commands::Preview { card, settings } => {
            commands::preview::run(&cli.data_dir, &cli.user, &card, settings.as_deref())?;
        }
        Commands::Cards { due, format } => {
            commands::cards::run(&cli.data_dir, &cli.user, due, &format)?;
        }
        Commands::Queue { format } => {
            commands::queue::run(&cli.data_dir, &cli.user, &format)?;
        }
        Commands::Settings { file } => {
            commands::settings::run(file.as_deref())?;
        }
    }

    Ok(())
}
