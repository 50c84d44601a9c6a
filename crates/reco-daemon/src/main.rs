mod cdp;
mod observe;
mod page;
mod recommend;
mod session;
mod socket;
mod surface;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use reco_proto::config::Config;
use reco_proto::store::JsonFileStore;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cdp::CdpDriver;
use crate::page::HostPageAdapter;
use crate::recommend::HttpRecommender;
use crate::session::{Collaborators, SessionController, SessionEvent};
use crate::surface::{BroadcastMessage, BroadcastSurface};

/// Listen-and-recommend daemon driving a streaming page in a browser tab
#[derive(Parser, Debug)]
#[command(name = "reco-daemon")]
#[command(version)]
struct Args {
    /// Serve placeholder recommendations without contacting the service
    #[arg(long)]
    mock: bool,

    /// Config file (default: <config dir>/reco/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Panels only get WARN and ERROR
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No panels connected is fine
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Broadcast channel first so logging can feed it
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = reco_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,reco_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config_path = args.config.unwrap_or_else(Config::config_path);
    let mut config = Config::load_from(&config_path)?;
    info!("Config loaded from: {:?}", config_path);
    if args.mock {
        config.recommender.use_mock = true;
    }

    let store = Arc::new(JsonFileStore::open(config.daemon.state_file.clone()));
    info!("Session state: {:?}", store.path());

    let recommender = Arc::new(HttpRecommender::new(&config.recommender)?);
    if config.recommender.use_mock {
        info!("Recommendations: placeholder mode");
    } else if recommender.health().await {
        info!("Recommendation service at {} is healthy", config.recommender.base_url);
    } else {
        warn!(
            "Recommendation service at {} is not answering; placeholders will be used",
            config.recommender.base_url
        );
    }

    let driver = CdpDriver::attach(&config.browser).await?;
    let page = Arc::new(HostPageAdapter::new(driver, config.page.clone()));
    let surface = Arc::new(BroadcastSurface::new(broadcast_tx.clone()));

    // Event channel: every external input funnels into the controller
    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(256);

    let controller = SessionController::load(
        &config,
        Collaborators {
            page,
            surface: surface.clone(),
            recommender,
            store,
        },
    )
    .await;

    let listener = tokio::net::TcpListener::bind(config.socket.address()).await?;
    let _socket_handle = socket::start_server(
        listener,
        surface,
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received");
                let _ = shutdown_tx.send(SessionEvent::Shutdown).await;
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    info!("Daemon initialised, running session loop");
    controller.run(event_rx).await?;

    Ok(())
}
