use anyhow::Result;
use clap::{Parser, Subcommand};
use rada_core::SweepMode;
use rada_sync::{SettingsStore, SyncConfig, SyncServices};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "rada-cli")]
#[command(about = "Council session mirror command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sweep in the foreground.
    Sweep {
        #[command(subcommand)]
        mode: Option<SweepCommand>,
    },
    /// List the sessions currently published on the portal.
    Sessions,
    /// Serve the dashboard.
    Serve,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum SweepCommand {
    /// Newest session only.
    Latest,
    /// Sessions already present in the download folder.
    Existing,
    /// Every listed session, oldest first.
    All,
    /// One session by number.
    Session { number: u32 },
}

impl From<SweepCommand> for SweepMode {
    fn from(cmd: SweepCommand) -> Self {
        match cmd {
            SweepCommand::Latest => SweepMode::Latest,
            SweepCommand::Existing => SweepMode::UpdateExisting,
            SweepCommand::All => SweepMode::Backfill,
            SweepCommand::Session { number } => SweepMode::Session(number),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rada_sync=info,rada_storage=info,rada_web=info,rada_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sweep { mode: None }) {
        Commands::Sweep { mode } => {
            let mode: SweepMode = mode.unwrap_or(SweepCommand::Latest).into();
            let report = rada_sync::run_sweep_once_from_env(mode).await?;
            println!(
                "sweep complete: mode={} sessions={}/{} failed={:?} created={} upgraded={} skipped={} attachment_errors={}{}",
                mode,
                report.sessions_synced,
                report.sessions_total,
                report.sessions_failed,
                report.attachments.created,
                report.attachments.upgraded,
                report.attachments.skipped,
                report.attachments.failed,
                if report.cancelled { " (cancelled)" } else { "" }
            );
        }
        Commands::Sessions => {
            let config = SyncConfig::from_env();
            let settings = SettingsStore::load_or_default(&config.settings_path, &config.download_dir);
            let sweep = SyncServices::from_config(&config)?.sweep(settings.download_dir());
            for session in sweep.all_sessions().await? {
                println!("{:>4}  {}", session.number, session.url);
            }
        }
        Commands::Serve => {
            rada_web::serve_from_env().await?;
        }
    }

    Ok(())
}
