//! Dead-letter queue tool.
//!
//! Inspect or replay envelopes that ended up on the DLQ topic of the
//! configured backend.
//!
//! # Usage
//!
//! ```bash
//! # Show up to 20 entries without consuming them
//! dlq list --limit 20
//!
//! # Put up to 5 entries back on the raw topic with attempt 0
//! dlq replay --limit 5
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use vitalflow::dlq::DeadLetterQueue;
use vitalflow::queue;
use vitalflow::VitalflowConfig;

/// Dead-letter queue tool.
#[derive(Parser, Debug)]
#[command(name = "dlq")]
#[command(about = "Inspect and replay dead-lettered notifications")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to VITALFLOW_CONFIG or config/vitalflow.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print DLQ entries as JSON lines, leaving them on the queue
    List {
        #[arg(long, short, default_value_t = 10)]
        limit: usize,
    },
    /// Republish DLQ entries to the raw topic
    Replay {
        #[arg(long, short, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => VitalflowConfig::load_from(path)?,
        None => VitalflowConfig::load()?,
    };
    vitalflow::init_logging(&config.logging.level);

    let topics = config.topics();
    let queue = queue::connect(&config.queue, &topics).await?;
    let dlq = DeadLetterQueue::new(queue.clone(), topics);

    match args.command {
        Command::List { limit } => {
            let entries = dlq.list(limit).await?;
            for entry in &entries {
                println!("{}", entry.summary());
            }
            eprintln!(
                "{} entr{} shown, {} waiting",
                entries.len(),
                if entries.len() == 1 { "y" } else { "ies" },
                dlq.count()
                    .await
                    .map_or_else(|| "unknown".to_string(), |n| n.to_string())
            );
        }
        Command::Replay { limit } => {
            let replayed = dlq.replay(limit).await?;
            for entry in &replayed {
                println!("{}", entry.envelope.id());
            }
            eprintln!("{} replayed", replayed.len());
        }
    }

    queue.close().await;
    Ok(())
}
