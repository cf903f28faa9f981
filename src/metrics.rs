// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// Nama metric statis & valid; gagal konstruksi = bug, jadi panic saat Lazy init.
fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).unwrap_or_else(|e| panic!("metric {name}: {e}"))
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).unwrap_or_else(|e| panic!("metric {name}: {e}"))
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).unwrap_or_else(|e| panic!("metric {name}: {e}"))
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    IntGaugeVec::new(Opts::new(name, help), labels).unwrap_or_else(|e| panic!("metric {name}: {e}"))
}

// -------- Market data --------
pub static TICKS: Lazy<IntCounter> = Lazy::new(|| counter("ticks_total", "accepted market data ticks"));

pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("ticks_total_by_symbol", "accepted ticks per symbol", &["symbol"]));

pub static TICKS_DROPPED: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("ticks_dropped_total", "dropped raw messages (label: reason)", &["reason"]));

pub static RECORDER_DROPPED: Lazy<IntCounter> =
    Lazy::new(|| counter("recorder_dropped_total", "events not written to the JSONL recorder"));

// -------- Signals / orders --------
pub static SIGNALS: Lazy<IntCounter> = Lazy::new(|| counter("signals_total", "short signals emitted"));

pub static SIGNALS_BY: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("signals_total_by", "short signals by sector & symbol (labels: sector, symbol)", &["sector", "symbol"])
});

pub static ORDERS: Lazy<IntCounter> = Lazy::new(|| counter("orders_total", "entry orders accepted by risk"));

pub static REJECTIONS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("risk_rejections_total", "signals rejected by risk (label: reason)", &["reason"]));

pub static EXECS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("exec_reports_total", "execution reports", &["status", "broker"]));

pub static BROKER_ERRORS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("broker_errors_total", "broker call failures (label: call)", &["call"]));

// -------- Positions & PnL --------
pub static EXITS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("exits_total", "closed positions by exit reason", &["reason"]));

pub static ESCALATIONS: Lazy<IntCounter> =
    Lazy::new(|| counter("escalations_total", "positions needing manual attention"));

pub static ACTIVE_POSITIONS: Lazy<IntGauge> =
    Lazy::new(|| gauge("active_positions", "pending/open/closing positions"));

pub static SECTOR_EXPOSURE: Lazy<IntGaugeVec> =
    Lazy::new(|| gauge_vec("sector_exposure_paise", "active notional per sector (paise)", &["sector"]));

pub static PNL_REALIZED: Lazy<IntGauge> = Lazy::new(|| gauge("pnl_realized", "realized PnL today (paise)"));

pub static PNL_UNREALIZED: Lazy<IntGauge> = Lazy::new(|| gauge("pnl_unrealized", "unrealized PnL (paise)"));

pub static BREAKER: Lazy<IntGauge> =
    Lazy::new(|| gauge("circuit_breaker_tripped", "1 if the daily loss breaker is latched"));

// -------- Feed connection health --------
pub static FEED_CONNECTED: Lazy<IntGauge> =
    Lazy::new(|| gauge("feed_connected", "1 if the market data stream is connected, 0 otherwise"));

pub static FEED_RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| counter("feed_reconnects_total", "reconnect attempts to the market data stream"));

pub static FEED_LAST_FRAME_TS: Lazy<IntGauge> =
    Lazy::new(|| gauge("feed_last_frame_ts", "unix seconds of the last received frame"));

// ---- Config visibility ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> =
    Lazy::new(|| gauge_vec("config_feed_mode", "feed mode (label: mode)", &["mode"]));

pub static CONFIG_BROKER_MODE: Lazy<IntGaugeVec> =
    Lazy::new(|| gauge_vec("config_broker_mode", "broker mode (label: mode)", &["mode"]));

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> =
    Lazy::new(|| gauge_vec("config_symbol", "configured symbols (labels: symbol, sector)", &["symbol", "sector"]));

pub fn init() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(TICKS.clone()),
        Box::new(TICKS_BY_SYMBOL.clone()),
        Box::new(TICKS_DROPPED.clone()),
        Box::new(RECORDER_DROPPED.clone()),
        Box::new(SIGNALS.clone()),
        Box::new(SIGNALS_BY.clone()),
        Box::new(ORDERS.clone()),
        Box::new(REJECTIONS.clone()),
        Box::new(EXECS.clone()),
        Box::new(BROKER_ERRORS.clone()),
        Box::new(EXITS.clone()),
        Box::new(ESCALATIONS.clone()),
        Box::new(ACTIVE_POSITIONS.clone()),
        Box::new(SECTOR_EXPOSURE.clone()),
        Box::new(PNL_REALIZED.clone()),
        Box::new(PNL_UNREALIZED.clone()),
        Box::new(BREAKER.clone()),
        Box::new(FEED_CONNECTED.clone()),
        Box::new(FEED_RECONNECTS.clone()),
        Box::new(FEED_LAST_FRAME_TS.clone()),
        Box::new(CONFIG_FEED_MODE.clone()),
        Box::new(CONFIG_BROKER_MODE.clone()),
        Box::new(CONFIG_SYMBOL.clone()),
    ];
    for c in collectors {
        // AlreadyReg diabaikan (init dipanggil ulang di test)
        let _ = REGISTRY.register(c);
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

/// Metrics server di thread OS terpisah. Gagal bind hanya di-log; engine tetap jalan.
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(%addr, ?e, "metrics bind failed, metrics endpoint disabled");
                return;
            }
        };
        info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => warn!(?e, "metrics accept error"),
            }
        }
    });
}
