use clap::Parser;
use ladder_book::feed::{read_instructions, walkthrough};
use ladder_book::{spawn, BookConfig, BookProcessor, Result};
use std::fs::File;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Replay a CSV instruction feed into a book and print the result
#[derive(Debug, Parser)]
#[command(name = "replay", version)]
struct Args {
    /// CSV feed (`kind,side,index,price,quantity`); the built-in walkthrough when omitted
    feed: Option<PathBuf>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the journal and snapshot (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Node identity (overrides the config file)
    #[arg(long)]
    node_id: Option<String>,

    /// Rows of the merged book to print
    #[arg(long, default_value_t = 5)]
    depth: u32,

    /// Most recent log entries to print
    #[arg(long, default_value_t = 10)]
    entries: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ladder_book=info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BookConfig::from_file(path)?,
        None => BookConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = Some(dir);
    }
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }

    let instructions = match &args.feed {
        Some(path) => read_instructions(File::open(path)?)?,
        None => walkthrough(),
    };

    let processor = BookProcessor::open(&config)?;
    let (book, writer) = spawn(processor, &config)?;

    let total = instructions.len();
    let mut rejected = 0usize;
    for instruction in instructions {
        if let Err(err) = book.submit(instruction).await {
            if !err.is_rejection() {
                return Err(err);
            }
            warn!(?instruction, error = %err, "instruction rejected");
            rejected += 1;
        }
    }
    info!(total, rejected, "feed replayed");

    match book.order_book(args.depth).await {
        Ok(snapshot) => println!("{snapshot}"),
        Err(err) if err.is_rejection() => println!("book unavailable: {err}"),
        Err(err) => return Err(err),
    }

    println!("\nLast {} entries:", args.entries);
    for entry in book.entries(args.entries).await? {
        let instruction = entry.instruction;
        println!(
            "{:>20}  {:<6?} {:<3} {:>4} {:>12} {:>10}",
            entry.sequence,
            instruction.kind,
            instruction.side,
            instruction.index,
            instruction.price,
            instruction.quantity
        );
    }

    book.shutdown().await?;
    if writer.join().is_err() {
        warn!("writer thread panicked");
    }
    Ok(())
}
