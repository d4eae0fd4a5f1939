//! Paper-trading server entry point.
//!
//! Boots the SQLite store, recovers open positions, connects the live price
//! feed, and serves the HTTP command API with its SSE stream until SIGINT or
//! SIGTERM.

use actix_web::{web, App, HttpServer};
use anyhow::Result;
use clap::Parser;
use perp_paper_trader::api::{self, AppState};
use perp_paper_trader::broker::Broker;
use perp_paper_trader::exchange::BinanceRestClient;
use perp_paper_trader::live_stream::LiveStream;
use perp_paper_trader::price_feed::PriceFeed;
use perp_paper_trader::store::Store;
use perp_paper_trader::trigger_engine::TriggerEngine;
use perp_paper_trader::AppConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "perp-paper-trader")]
#[command(about = "Local paper-trading simulator for perpetual-futures markets", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose (debug-level) logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the SQLite database path
    #[arg(long)]
    database_path: Option<String>,

    /// Override the HTTP bind address
    #[arg(long)]
    bind: Option<String>,
}

fn setup_logging(verbose: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;
    let log_filename = format!("server_{}.log", chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!("{level},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn,actix_server=warn");
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(log_file = %log_path.display(), "logging initialized");
    Ok(())
}

#[actix_web::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    let mut config = AppConfig::from_env()?;
    if let Some(db) = cli.database_path {
        config.database_path = db;
    }
    if let Some(bind) = cli.bind {
        config.http_bind = bind;
    }
    info!(?config, "starting perp-paper-trader");

    let store = Arc::new(Store::open(&config.database_path)?);
    let (feed, _feed_handle) = PriceFeed::spawn(config.binance_ws_url.clone());
    let trigger_engine = Arc::new(TriggerEngine::new(store.clone(), feed.clone()));

    let recovered = trigger_engine.recover_open_positions()?;
    info!(recovered, "recovered open positions, resubscribed price feed");

    let exchange = Arc::new(BinanceRestClient::new(config.binance_rest_url.clone()));
    let broker = Broker::new(store.clone(), feed.clone(), trigger_engine.clone(), exchange);

    let _trigger_handle = trigger_engine.clone().spawn();
    let (live_stream, _stream_relay_handle) = LiveStream::new(store.clone(), feed.clone(), trigger_engine.clone());

    let bind_addr = config.http_bind.clone();
    let state = web::Data::new(AppState { broker, live_stream });

    info!(bind = %bind_addr, "http server listening");
    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(api::configure))
        .bind(&bind_addr)?
        .run();
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping server");

    server_handle.stop(true).await;
    let _ = server_task.await;

    feed.close();
    if let Err(e) = store.flush() {
        tracing::warn!(error = %e, "failed to flush store on shutdown");
    }

    info!("server shut down");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
