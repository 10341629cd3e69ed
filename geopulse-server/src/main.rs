//! geopulse server binary: wires configuration, storage, the world
//! registry and dispatcher, the webhook writer, the WebSocket session
//! endpoint and the admin HTTP endpoint.

mod auth;
mod http;
mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use tokio::net::TcpListener;

use geopulse_config::Config;
use geopulse_core::dispatch::Dispatcher;
use geopulse_core::events::BeaconNotifier;
use geopulse_core::persist::{JsonFilePersister, NullPersister, Persister};
use geopulse_core::registry::World;
use geopulse_transport::WebhookWriter;

#[derive(Parser, Debug)]
#[command(name = "geopulse-server", version, about = "Real-time geospatial pub/sub server")]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// host:port for the WebSocket session endpoint
    #[arg(long)]
    ws_addr: Option<String>,
    /// host:port for the administrative HTTP endpoint
    #[arg(long)]
    admin_addr: Option<String>,
    /// Durable storage file; omit for a memory-only server
    #[arg(long)]
    db: Option<PathBuf>,
    /// Secret for capability token signatures
    #[arg(long)]
    secret: Option<String>,
    /// Enable development routes
    #[arg(long)]
    dev: bool,
}

/// Everything the session and HTTP handlers share.
pub struct AppState {
    pub world: Arc<World>,
    pub dispatcher: Dispatcher,
    pub secret: String,
    pub admin_bearer: Option<String>,
    pub dev_routes: bool,
    pub send_interval: Duration,
}

/// Installs env_logger with a pass-everything filter and gates verbosity
/// through `log::set_max_level`, so the `/v1/log` endpoint can adjust it at
/// runtime.
fn init_logging() {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
            .build();
    let initial = match std::env::var("LOGLEVEL").as_deref() {
        Ok("debug") => log::LevelFilter::Debug,
        Ok("info") => log::LevelFilter::Info,
        Ok("warn") => log::LevelFilter::Warn,
        Ok("error") => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(initial);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env();
    if let Some(addr) = args.ws_addr {
        config.server.ws_addr = addr;
    }
    if let Some(addr) = args.admin_addr {
        config.server.admin_addr = addr;
    }
    if let Some(db) = args.db {
        config.storage.path = Some(db);
    }
    if let Some(secret) = args.secret {
        config.auth.secret = secret;
    }
    if args.dev {
        config.auth.dev_routes = true;
    }
    config.validate()?;

    info!("geopulse-server {}", env!("CARGO_PKG_VERSION"));

    let persister: Box<dyn Persister> = match &config.storage.path {
        Some(path) => Box::new(JsonFilePersister::open(path)?),
        None => {
            info!("no storage path configured; state will not survive restarts");
            Box::new(NullPersister)
        }
    };
    let world = Arc::new(World::new(persister, config.engine.min_depth)?);
    let counts = world.counts();
    info!("serving {} POIs and {} air beacons", counts.pois, counts.beacons);

    let send_interval = Duration::from_millis(config.engine.message_send_interval_ms);
    let webhooks = config.webhook.as_ref().map(|webhook| -> Arc<dyn BeaconNotifier> {
        info!("air beacon notifications go to {}", webhook.url);
        WebhookWriter::start(
            webhook.url.clone(),
            webhook.headers.clone(),
            webhook.bearer_token.clone(),
            send_interval,
        )
    });
    let dispatcher = Dispatcher::new(world.clone(), webhooks);

    let state = Arc::new(AppState {
        world,
        dispatcher,
        secret: config.auth.secret.clone(),
        admin_bearer: config.auth.admin_bearer.clone(),
        dev_routes: config.auth.dev_routes,
        send_interval,
    });

    let admin = TcpListener::bind(&config.server.admin_addr).await?;
    info!("admin HTTP listening on {}", config.server.admin_addr);
    let admin_router = http::router(state.clone());
    tokio::spawn(async move {
        if let Err(err) = axum::serve(admin, admin_router).await {
            error!("admin server failed: {err}");
        }
    });

    let sessions = TcpListener::bind(&config.server.ws_addr).await?;
    info!("session endpoint listening on {}", config.server.ws_addr);
    session::accept_loop(sessions, state).await;
    Ok(())
}
