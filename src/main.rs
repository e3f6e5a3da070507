mod bus;
mod config;
mod error;
mod http;
mod layout_manager;
mod presets;
mod render;
mod scripts;
mod session;
mod sse;
mod terminal;

use std::error::Error;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::bus::client::BrokerClient;
use crate::presets::PresetRegistry;
use crate::render::RendererRegistry;
use crate::scripts::jobs::JobTable;
use crate::scripts::ScriptRunnerContext;
use crate::session::{JetStreamSessionStore, SessionStore};
use crate::sse::SseEngine;

#[derive(Parser)]
#[command(name = "switchboard", about = "Message-bus-driven session view and script runner")]
enum Cli {
    /// Start the HTTP server and durable consumers (default when no subcommand is given)
    #[command(alias = "run")]
    Serve {
        /// Path to switchboard.toml
        #[arg(long, default_value = "switchboard.toml")]
        config: std::path::PathBuf,
    },
    /// Verify the broker is reachable and streams/buckets exist, then exit
    Doctor {
        #[arg(long, default_value = "switchboard.toml")]
        config: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 {
        Cli::Serve {
            config: "switchboard.toml".into(),
        }
    } else {
        Cli::parse()
    };

    match cli {
        Cli::Serve { config } => run_server(&config).await,
        Cli::Doctor { config } => run_doctor(&config).await,
    }
}

fn init_tracing(config: &config::Config) -> sentry::ClientInitGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("switchboard=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    sentry::init((
        config.sentry_dsn(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.server.environment.clone().into()),
            send_default_pii: true,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ))
}

async fn run_doctor(config_path: &std::path::Path) -> Result<(), Box<dyn Error>> {
    let config = config::Config::load_or_default(config_path)?;
    let broker = BrokerClient::connect(&config.broker.url, &config.broker.store_dir).await?;
    broker.ensure_streams().await?;
    println!("broker reachable at {}, streams and buckets ensured", config.broker.url);
    Ok(())
}

async fn run_server(config_path: &std::path::Path) -> Result<(), Box<dyn Error>> {
    let config = config::Config::load_or_default(config_path)?;
    let _guard = init_tracing(&config);

    let broker = BrokerClient::connect(&config.broker.url, &config.broker.store_dir)
        .await
        .context("failed to connect to message bus")?;
    broker
        .ensure_streams()
        .await
        .context("failed to ensure streams/buckets")?;

    let store: Arc<dyn SessionStore> = Arc::new(JetStreamSessionStore::new(broker.clone()));
    let presets = Arc::new(
        PresetRegistry::load_builtin()
            .context("failed to load builtin presets")?
            .with_broker(broker.clone()),
    );
    let renderers = Arc::new(RendererRegistry::new());
    let sse = Arc::new(SseEngine::new(
        broker.clone(),
        store.clone(),
        presets.clone(),
        renderers.clone(),
    ));

    tokio::fs::create_dir_all(&config.scripts.root)
        .await
        .with_context(|| format!("failed to create scripts root {}", config.scripts.root.display()))?;

    let root_cancel = CancellationToken::new();

    let terminal_ctx = Arc::new(terminal::TerminalContext {
        broker: broker.clone(),
        store: store.clone(),
        presets: presets.clone(),
        scripts_root: config.scripts.root.clone(),
    });
    let layout_ctx = Arc::new(layout_manager::LayoutManagerContext {
        store: store.clone(),
        presets: presets.clone(),
    });
    let script_ctx = Arc::new(ScriptRunnerContext {
        broker: broker.clone(),
        scripts_root: config.scripts.root.clone(),
        repo_root: std::env::current_dir().context("failed to read current dir")?,
        jobs: Arc::new(JobTable::default()),
    });

    let mut consumer_tasks = Vec::new();
    consumer_tasks.push(tokio::spawn(terminal::run(terminal_ctx, root_cancel.clone())));
    consumer_tasks.push(tokio::spawn(layout_manager::run(
        broker.clone(),
        layout_ctx,
        root_cancel.clone(),
    )));
    consumer_tasks.push(tokio::spawn(scripts::run_create_loop(
        script_ctx.clone(),
        root_cancel.clone(),
    )));
    consumer_tasks.push(tokio::spawn(scripts::run_run_loop(
        script_ctx,
        root_cancel.clone(),
    )));

    let app_state = http::AppState {
        broker,
        store,
        presets,
        sse,
    };

    let app = http::router(app_state)
        .layer(tower_http::catch_panic::CatchPanicLayer::new())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<axum::extract::Request>::new_from_top());

    let port = config.server.port;
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "switchboard listening");

    let shutdown = {
        let root_cancel = root_cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, cancelling durable consumers");
            root_cancel.cancel();
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    root_cancel.cancel();
    for task in consumer_tasks {
        let _ = task.await;
    }

    Ok(())
}
