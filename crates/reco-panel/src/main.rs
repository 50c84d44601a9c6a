mod app;
mod connection;
mod theme;
mod toast;

use clap::{Parser, Subcommand};
use reco_proto::platform::DAEMON_TCP_PORT;
use reco_proto::protocol::Command;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::app::App;
use crate::connection::DaemonConnection;

/// Terminal panel for the listen-and-recommend daemon
#[derive(Parser, Debug)]
#[command(name = "reco-panel")]
#[command(version)]
struct Args {
    /// Daemon address (default: 127.0.0.1:<daemon port>)
    #[arg(short, long)]
    address: Option<String>,

    #[command(subcommand)]
    command: Option<PanelCommand>,
}

#[derive(Subcommand, Debug)]
enum PanelCommand {
    /// Show or hide the panel in every connected terminal, then exit
    Toggle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let data_dir = reco_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("panel.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    // The terminal belongs to the UI, so logs only go to the file
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,reco_panel=debug")),
        )
        .init();

    let address = args
        .address
        .unwrap_or_else(|| format!("127.0.0.1:{}", DAEMON_TCP_PORT));

    let mut connection = DaemonConnection::connect(&address)
        .await
        .map_err(|e| anyhow::anyhow!("Cannot reach reco-daemon at {}: {}", address, e))?;
    info!("Connected to daemon at {}", address);

    match args.command {
        Some(PanelCommand::Toggle) => {
            connection.send_command(Command::TogglePanel).await?;
            info!("Toggle sent");
        }
        None => App::new().run(connection).await?,
    }

    Ok(())
}
