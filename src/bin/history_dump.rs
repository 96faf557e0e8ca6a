//! # History Dump CLI
//!
//! Command-line tool for inspecting a historical ops directory.
//!
//! Usage:
//!   history-dump [--dir DIR] [--uid UID] [--package PKG] [--op OP] [dump]
//!   history-dump [--dir DIR] stats

use clap::{Parser, Subcommand};
use op_history::storage::Layout;
use op_history::{
    HistoricalMode, HistoricalRegistry, OpFilter, PersistenceParams, RegistryConfig, SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "history-dump")]
#[command(about = "Inspect historical op accounting data", long_about = None)]
struct Cli {
    /// Path to the history directory
    #[arg(short, long, default_value = "./var/data/history")]
    dir: PathBuf,

    /// Base interval in ms (defaults to the directory's layout)
    #[arg(long)]
    base_interval_ms: Option<i64>,

    /// Interval multiplier (defaults to the directory's layout)
    #[arg(long)]
    multiplier: Option<i64>,

    /// Only show this uid
    #[arg(long)]
    uid: Option<u32>,

    /// Only show this package
    #[arg(long)]
    package: Option<String>,

    /// Only show these ops (repeatable)
    #[arg(long)]
    op: Vec<u32>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every stored interval
    Dump,

    /// Show store statistics
    Stats,
}

fn main() -> Result<(), String> {
    env_logger::init();
    let cli = Cli::parse();

    let layout = Layout::read(&cli.dir).map_err(|e| format!("Failed to read layout: {}", e))?;
    let defaults = PersistenceParams::default();
    let params = PersistenceParams::new(
        HistoricalMode::EnabledPassive,
        cli.base_interval_ms
            .or(layout.map(|l| l.base_interval_ms))
            .unwrap_or(defaults.base_interval_ms),
        cli.multiplier
            .or(layout.map(|l| l.multiplier))
            .unwrap_or(defaults.multiplier),
    );
    params.validate()?;

    let registry = HistoricalRegistry::open(
        RegistryConfig::new(&cli.dir, params),
        Arc::new(SystemClock),
    )
    .map_err(|e| format!("Failed to open history at {}: {}", cli.dir.display(), e))?;

    let mut filter = OpFilter::all();
    filter.uid = cli.uid;
    filter.package = cli.package;
    if !cli.op.is_empty() {
        filter.ops = Some(cli.op);
    }

    match cli.command.unwrap_or(Commands::Dump) {
        Commands::Dump => {
            print!("{}", registry.dump(&filter));
        }

        Commands::Stats => {
            let stats = registry.stats();
            println!("History Statistics\n");
            println!("Directory:       {}", cli.dir.display());
            println!("Base interval:   {} ms", stats.base_interval_ms);
            println!("Multiplier:      {}", stats.multiplier);
            println!("Depth files:     {}", stats.store.depth_files);
            match stats.store.deepest {
                Some(depth) => println!("Deepest depth:   {}", depth),
                None => println!("Deepest depth:   -"),
            }
            println!("Snapshots:       {}", stats.store.snapshots);
            println!("Bytes on disk:   {}", stats.store.bytes);
        }
    }

    Ok(())
}
