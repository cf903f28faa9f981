// ===============================
// src/main.rs
// ===============================
/*
 # konfigurasi yang aktif
curl -s localhost:9898/metrics | egrep '^config_(feed_mode|broker_mode|symbol)'

# aktivitas per symbol & sektor
curl -s localhost:9898/metrics | grep '^ticks_total_by_symbol'
curl -s localhost:9898/metrics | grep '^signals_total_by'

# kesehatan feed & risk
curl -s localhost:9898/metrics | egrep '^(feed_connected|feed_reconnects_total|circuit_breaker_tripped|pnl_)'

 # replay rekaman sesi
 cargo run --release -- --feed replay --replay data/session.jsonl --record-file out/replay.jsonl
*/
/*
=============================================================================
Project : gapshort_bot — real-time gap-up short engine in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Streams equity quotes (mock/replay/WebSocket), detects gap-up
          selling pressure, sizes short entries against portfolio risk,
          manages stop/target/time exits, enforces a daily-loss breaker,
          exposes Prometheus metrics, and records JSONL events.
=============================================================================
*/
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gapshort_bot::config::{self, Args, BrokerMode, FeedMode};
use gapshort_bot::domain::{Event, ExecReport, Order};
use gapshort_bot::engine::{self, Channels, Clock, EngineError, EngineState, RunCfg, Summary};
use gapshort_bot::feed::{self, ConnState, FeedError, WsSource};
use gapshort_bot::gateway::{self, Broker, DispatchCfg, PaperBroker, RestBroker};
use gapshort_bot::{metrics, recorder};

async fn run_app(args: Args) -> Result<Summary, EngineError> {
    // ---- Load config ----
    let settings = config::load(&args)?;

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(settings.metrics_port);

    let broker_mode = match settings.broker.mode {
        BrokerMode::Paper => "paper",
        BrokerMode::Rest => "rest",
    };
    info!(
        feed_mode = settings.feed_mode.as_str(),
        broker_mode,
        symbols = settings.universe.len(),
        portfolio = gapshort_bot::domain::whole_units(settings.strategy.portfolio_value),
        max_positions = settings.strategy.max_positions,
        risk_per_trade_pct = settings.strategy.risk_per_trade_pct,
        "startup config"
    );
    metrics::CONFIG_FEED_MODE.with_label_values(&[settings.feed_mode.as_str()]).set(1);
    metrics::CONFIG_BROKER_MODE.with_label_values(&[broker_mode]).set(1);
    for s in &settings.universe {
        metrics::CONFIG_SYMBOL.with_label_values(&[&s.symbol, s.sector.as_str()]).set(1);
    }

    // ---- Buses ----
    let (raw_tx, raw_rx) = mpsc::channel::<String>(8192);
    let (ord_tx, ord_rx) = mpsc::channel::<Order>(1024);
    let (exec_tx, exec_rx) = mpsc::channel::<ExecReport>(4096);
    let (status_tx, status_rx) = watch::channel(ConnState::Disconnected);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (stop_tx, stop_rx) = mpsc::channel::<()>(4);

    // ---- Recorder (optional) ----
    let (rec_tx, rec_handle) = match settings.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            (Some(tx), Some(tokio::spawn(recorder::run(rx, path))))
        }
        None => (None, None),
    };

    // ---- Broker / gateway ----
    let broker: Arc<dyn Broker> = match settings.broker.mode {
        BrokerMode::Paper => Arc::new(PaperBroker::new(settings.broker.paper_fill_ms)),
        BrokerMode::Rest => Arc::new(RestBroker::new(&settings.broker)?),
    };
    let gw = tokio::spawn(gateway::run(ord_rx, exec_tx, broker, DispatchCfg::from_broker(&settings.broker)));

    // ---- Feed (market data) ----
    let (feed_handle, clock) = match settings.feed_mode {
        FeedMode::Mock => {
            let universe = settings.universe.clone();
            let hours = settings.hours.clone();
            (tokio::spawn(feed::run_mock(raw_tx, universe, hours, shutdown_rx)), Clock::Feed)
        }
        FeedMode::Replay => {
            let path = settings.replay_file.clone().unwrap_or_default();
            let h = tokio::spawn(async move {
                let sent = feed::run_replay(path, raw_tx, shutdown_rx).await?;
                info!(sent, "replay finished");
                Ok::<(), FeedError>(())
            });
            (h, Clock::Feed)
        }
        FeedMode::Ws => {
            let ws = settings.ws.clone();
            let symbols = settings.symbols();
            let h = tokio::spawn(async move {
                let mut source = WsSource::new(&ws);
                feed::run_session(&mut source, symbols, ws, raw_tx, status_tx, shutdown_rx).await
            });
            (h, Clock::Wall)
        }
    };

    // ---- Ctrl-C: pertama = graceful, kedua = paksa ----
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received");
            if stop_tx.send(()).await.is_err() {
                break;
            }
        }
    });

    let state = EngineState::new(&settings);
    let channels = Channels {
        raw_rx,
        exec_rx,
        ord_tx,
        rec_tx,
        feed_status: status_rx,
        feed_shutdown: shutdown_tx,
        stop_rx,
    };
    let run_cfg = RunCfg {
        clock,
        drain_timeout: settings.broker.drain_timeout,
        heartbeat: Duration::from_secs(10),
    };
    let result = engine::run(state, channels, feed_handle, run_cfg).await;

    // Channels engine sudah di-drop: gateway & recorder selesai sendiri
    let _ = gw.await;
    if let Some(h) = rec_handle {
        let _ = h.await;
    }
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match run_app(args).await {
        Ok(summary) => {
            info!(%summary, "engine stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "engine failed");
            ExitCode::FAILURE
        }
    }
}
