use clap::Parser;
use mockd::config::ConfigDocument;
use mockd::engine::Engine;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "mockd", about = "Multi-protocol mock server")]
struct Args {
    /// Primary mock listener port.
    #[arg(short, long)]
    port: Option<u16>,
    /// Admin API port.
    #[arg(long)]
    admin_port: Option<u16>,
    /// HTTPS listener port (0 disables).
    #[arg(long)]
    https_port: Option<u16>,
    /// Configuration document (YAML or JSON).
    #[arg(short, long)]
    config: Option<String>,
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let config_path = args
        .config
        .clone()
        .or_else(|| std::env::var("MOCKD_CONFIG").ok());

    let mut doc = match &config_path {
        Some(path) => match ConfigDocument::load(path) {
            Ok(doc) => {
                info!("loaded config from {path}");
                doc
            }
            Err(e) => {
                error!("failed to load config {path}: {e}");
                std::process::exit(1);
            }
        },
        None => {
            let mut doc = ConfigDocument::default();
            doc.apply_env();
            doc
        }
    };

    // Command-line flags override the document and environment.
    if let Some(port) = args.port {
        doc.server.port = port;
    }
    if let Some(port) = args.admin_port {
        doc.server.admin_port = port;
    }
    if let Some(port) = args.https_port {
        doc.server.https_port = port;
    }

    let engine = Engine::new(doc.server.clone());

    if let Some(auth) = &doc.auth {
        if let Err(e) = mockd::admin::ensure_api_key(&engine.state, auth) {
            error!("admin auth setup failed: {e}");
            std::process::exit(1);
        }
    }

    if let Err(e) = engine.load_document(&doc) {
        error!("config rejected: {e}");
        std::process::exit(1);
    }

    if let Err(e) = engine.start().await {
        error!("startup failed: {e}");
        std::process::exit(1);
    }
    info!(
        "mockd ready: mock listener :{}, admin :{}",
        doc.server.port, doc.server.admin_port
    );

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");

    // Optional config snapshot before teardown.
    if !doc.server.snapshot_on_exit.is_empty() {
        let snapshot = ConfigDocument {
            mocks: engine
                .state
                .registry
                .all()
                .iter()
                .map(|m| (**m).clone())
                .collect(),
            chaos: Some(engine.state.chaos.config()),
            custom_operations: engine.state.state.operations(),
            ..doc.clone()
        };
        match snapshot.to_yaml() {
            Ok(yaml) => {
                if let Err(e) = std::fs::write(&doc.server.snapshot_on_exit, yaml) {
                    error!("snapshot write failed: {e}");
                }
            }
            Err(e) => error!("snapshot serialization failed: {e}"),
        }
    }

    engine.stop(Duration::from_secs(5)).await;
}
