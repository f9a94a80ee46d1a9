use anyhow::Context;
use clap::{Parser, Subcommand};
use cryptobot_core::ConfigLoader;
use std::path::{Path, PathBuf};

mod app;
mod replay;

#[derive(Parser)]
#[command(name = "cryptobot")]
#[command(about = "Event-driven crypto futures trading pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay historical bars through the paper-trading pipeline
    Run {
        /// Config file path
        #[arg(short, long, env = "CRYPTOBOT_CONFIG")]
        config: Option<PathBuf>,
        /// Bar CSV to replay (timestamp,symbol,open,high,low,close,volume)
        #[arg(short, long)]
        replay: PathBuf,
    },
    /// Print the effective configuration after file and env layering
    ShowConfig {
        /// Config file path
        #[arg(short, long, env = "CRYPTOBOT_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Run { config, replay } => {
            run(config.as_deref(), &replay).await?;
        }
        Commands::ShowConfig { config } => {
            let config = ConfigLoader::load(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn run(config_path: Option<&Path>, replay_path: &Path) -> anyhow::Result<()> {
    tracing::info!(
        config = ?config_path,
        replay = %replay_path.display(),
        "Starting paper replay"
    );

    let config = ConfigLoader::load(config_path)?;
    let replay = replay::CsvReplay::from_path(replay_path)?;
    let summary = app::run_replay(config, replay)
        .await
        .context("Replay failed")?;

    tracing::info!(
        ticks = summary.ticks,
        events = summary.events_processed,
        exits = summary.exits,
        "Replay finished"
    );

    let snapshot = &summary.snapshot;
    println!("Ticks replayed:   {}", summary.ticks);
    println!("Events processed: {}", summary.events_processed);
    println!("Orders:           {}", snapshot.orders.len());
    println!("Closed positions: {}", summary.exits);
    println!("Open positions:   {}", snapshot.positions.len());
    println!("Cash:             {}", snapshot.cash);
    println!("Equity:           {}", snapshot.equity);
    println!("Daily PnL:        {}", snapshot.daily_pnl);
    println!("Drawdown:         {}", snapshot.drawdown());
    println!("Trading enabled:  {}", snapshot.trading_enabled);
    println!();
    println!("{}", serde_json::to_string_pretty(snapshot)?);

    Ok(())
}
