// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : gapshort_bot — real-time gap-up short engine in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Streams equity quotes (mock/replay/WebSocket), detects gap-up
          selling pressure, sizes short entries against portfolio risk,
          manages stop/target/time exits, enforces a daily-loss breaker,
          exposes Prometheus metrics, and records JSONL events.
=============================================================================
*/
use std::env;
use std::str::FromStr;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::NaiveTime;
use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::domain::{to_px, Sector};
use crate::hours::MarketHours;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
    #[error("{key} out of range: {reason}")]
    Range { key: &'static str, reason: String },
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("failed to read env file {path}: {source}")]
    EnvFile { path: String, source: dotenvy::Error },
}

/// Sumber market data
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FeedMode {
    Mock,
    Ws,
    Replay,
}

impl FeedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Mock => "mock",
            FeedMode::Ws => "ws",
            FeedMode::Replay => "replay",
        }
    }
}

impl FromStr for FeedMode {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(FeedMode::Mock),
            "ws" | "websocket" => Ok(FeedMode::Ws),
            "replay" => Ok(FeedMode::Replay),
            other => Err(ConfigError::Invalid { key: "FEED_MODE".into(), value: other.into() }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerMode {
    Paper,
    Rest,
}

impl FromStr for BrokerMode {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paper" | "mock" => Ok(BrokerMode::Paper),
            "rest" | "live" => Ok(BrokerMode::Rest),
            other => Err(ConfigError::Invalid { key: "BROKER_MODE".into(), value: other.into() }),
        }
    }
}

/// Flag CLI; semua nilai lain dibaca dari ENV / .env
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "gapshort_bot", about = "Gap-up short engine")]
pub struct Args {
    /// Path file .env (default: ./.env kalau ada)
    #[arg(long)]
    pub env_file: Option<String>,
    /// Override FEED_MODE
    #[arg(long, value_enum)]
    pub feed: Option<FeedMode>,
    /// File JSONL berisi raw message untuk mode replay
    #[arg(long)]
    pub replay: Option<String>,
    #[arg(long)]
    pub metrics_port: Option<u16>,
    #[arg(long)]
    pub record_file: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SymbolSpec {
    pub symbol: String,
    pub sector: Sector,
}

/// Bobot selling-pressure score (dinormalisasi saat dipakai)
#[derive(Clone, Debug)]
pub struct PressureWeights {
    pub reversal: f64,
    pub volume: f64,
    pub momentum: f64,
    /// reversal (persen dari session high) yang dianggap skor penuh
    pub reversal_full_pct: f64,
    /// volume ratio yang dianggap skor penuh
    pub volume_full_ratio: f64,
}

impl Default for PressureWeights {
    fn default() -> Self {
        Self { reversal: 0.5, volume: 0.3, momentum: 0.2, reversal_full_pct: 2.0, volume_full_ratio: 3.0 }
    }
}

#[derive(Clone, Debug)]
pub struct ConfidenceWeights {
    pub pressure: f64,
    pub volume: f64,
    pub gap: f64,
    pub sector: f64,
    pub volume_full_ratio: f64,
    pub gap_full_pct: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self { pressure: 0.4, volume: 0.3, gap: 0.2, sector: 0.1, volume_full_ratio: 3.0, gap_full_pct: 5.0 }
    }
}

#[derive(Clone, Debug)]
pub struct StrategyConfig {
    /// nilai portofolio dalam paise
    pub portfolio_value: i64,
    pub risk_per_trade_pct: f64,
    pub max_positions: usize,
    pub min_gap_pct: f64,
    pub min_selling_pressure: f64,
    pub min_volume_ratio: f64,
    pub min_confidence: f64,
    pub stop_loss_pct: f64,
    pub target_pct: f64,
    pub max_sector_exposure_pct: f64,
    /// batas rugi harian (paise, positif)
    pub daily_loss_limit: i64,
    pub price_window: usize,
    pub rsi_period: usize,
    pub pressure: PressureWeights,
    pub confidence: ConfidenceWeights,
    pub sector_weights: HashMap<Sector, f64>,
    pub bellwethers: Vec<String>,
    pub breadth_min_ratio: f64,
    pub breadth_min_gap_pct: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        let sector_weights = [
            Sector::Fmcg, Sector::It, Sector::Banking, Sector::Auto,
            Sector::Pharma, Sector::Metals, Sector::Realty,
        ]
        .into_iter()
        .map(|s| (s, s.default_weight()))
        .collect();
        Self {
            portfolio_value: to_px(1_000_000.0),
            risk_per_trade_pct: 1.0,
            max_positions: 3,
            min_gap_pct: 0.5,
            min_selling_pressure: 40.0,
            min_volume_ratio: 1.2,
            min_confidence: 0.6,
            stop_loss_pct: 1.5,
            target_pct: 3.0,
            max_sector_exposure_pct: 100.0,
            daily_loss_limit: to_px(20_000.0),
            price_window: 20,
            rsi_period: 14,
            pressure: PressureWeights::default(),
            confidence: ConfidenceWeights::default(),
            sector_weights,
            bellwethers: Vec::new(),
            breadth_min_ratio: 0.6,
            breadth_min_gap_pct: 0.3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WsConfig {
    pub url: String,
    pub access_token: Option<String>,
    pub reconnect_base: Duration,
    pub backoff_cap: Duration,
    pub max_reconnect_attempts: u32,
    pub ping_interval: Duration,
    pub pong_deadline: Duration,
    pub connect_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: "wss://api-t1.fyers.in/socket/v2/dataSock".to_string(),
            access_token: None,
            reconnect_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(80),
            max_reconnect_attempts: 10,
            ping_interval: Duration::from_secs(30),
            pong_deadline: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub mode: BrokerMode,
    pub rest_url: String,
    pub client_id: Option<String>,
    pub access_token: Option<String>,
    pub max_exit_retries: u32,
    pub ack_timeout: Duration,
    pub drain_timeout: Duration,
    pub paper_fill_ms: u64,
    pub status_poll: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: BrokerMode::Paper,
            rest_url: "https://api-t1.fyers.in/api/v3".to_string(),
            client_id: None,
            access_token: None,
            max_exit_retries: 3,
            ack_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            paper_fill_ms: 50,
            status_poll: Duration::from_millis(200),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub universe: Vec<SymbolSpec>,
    pub strategy: StrategyConfig,
    pub hours: MarketHours,
    pub ws: WsConfig,
    pub broker: BrokerConfig,
    pub feed_mode: FeedMode,
    pub replay_file: Option<String>,
    pub record_file: Option<String>,
    pub metrics_port: u16,
}

impl Settings {
    pub fn symbols(&self) -> Vec<String> {
        self.universe.iter().map(|s| s.symbol.clone()).collect()
    }
}

/// Universe default: saham large-cap NSE per sektor
pub fn default_universe() -> Vec<SymbolSpec> {
    [
        ("NSE:NESTLEIND-EQ", Sector::Fmcg),
        ("NSE:COLPAL-EQ", Sector::Fmcg),
        ("NSE:TATACONSUM-EQ", Sector::Fmcg),
        ("NSE:HINDUNILVR-EQ", Sector::Fmcg),
        ("NSE:ITC-EQ", Sector::Fmcg),
        ("NSE:BRITANNIA-EQ", Sector::Fmcg),
        ("NSE:TCS-EQ", Sector::It),
        ("NSE:INFY-EQ", Sector::It),
        ("NSE:WIPRO-EQ", Sector::It),
        ("NSE:HCLTECH-EQ", Sector::It),
        ("NSE:TECHM-EQ", Sector::It),
        ("NSE:HDFCBANK-EQ", Sector::Banking),
        ("NSE:ICICIBANK-EQ", Sector::Banking),
        ("NSE:SBIN-EQ", Sector::Banking),
        ("NSE:AXISBANK-EQ", Sector::Banking),
        ("NSE:KOTAKBANK-EQ", Sector::Banking),
        ("NSE:MARUTI-EQ", Sector::Auto),
        ("NSE:TATAMOTORS-EQ", Sector::Auto),
        ("NSE:BAJAJ-AUTO-EQ", Sector::Auto),
        ("NSE:RELIANCE-EQ", Sector::Auto),
    ]
    .into_iter()
    .map(|(s, sector)| SymbolSpec { symbol: s.to_string(), sector })
    .collect()
}

/// `SYMBOLS=NSE:TCS-EQ:IT,NSE:ITC-EQ:FMCG`: sektor adalah segmen terakhir setelah ':'
pub fn parse_universe(raw: &str) -> Result<Vec<SymbolSpec>, ConfigError> {
    let mut out = Vec::new();
    for item in raw.split(',').map(|x| x.trim()).filter(|x| !x.is_empty()) {
        let (sym, sector) = item
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::Invalid { key: "SYMBOLS".into(), value: item.into() })?;
        let sector = Sector::parse(sector)
            .ok_or_else(|| ConfigError::Invalid { key: "SYMBOLS".into(), value: item.into() })?;
        out.push(SymbolSpec { symbol: sym.to_ascii_uppercase(), sector });
    }
    if out.is_empty() {
        return Err(ConfigError::Missing("SYMBOLS"));
    }
    Ok(out)
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { key: key.to_string(), value: v }),
        _ => Ok(default),
    }
}

fn env_time(key: &str, default: NaiveTime) -> Result<NaiveTime, ConfigError> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => NaiveTime::parse_from_str(v.trim(), "%H:%M")
            .map_err(|_| ConfigError::Invalid { key: key.to_string(), value: v }),
        _ => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

fn validate(s: &Settings) -> Result<(), ConfigError> {
    let st = &s.strategy;
    if st.portfolio_value <= 0 {
        return Err(ConfigError::Range { key: "PORTFOLIO_VALUE", reason: "must be positive".into() });
    }
    if !(0.0..=100.0).contains(&st.risk_per_trade_pct) || st.risk_per_trade_pct == 0.0 {
        return Err(ConfigError::Range { key: "RISK_PER_TRADE", reason: "must be in (0, 100]".into() });
    }
    if st.max_positions == 0 {
        return Err(ConfigError::Range { key: "MAX_POSITIONS", reason: "must be >= 1".into() });
    }
    if st.stop_loss_pct <= 0.0 || st.target_pct <= 0.0 || st.target_pct >= 100.0 {
        return Err(ConfigError::Range { key: "STOP_LOSS_PCT", reason: "stop/target must be positive".into() });
    }
    if !(0.0..=1.0).contains(&st.min_confidence) {
        return Err(ConfigError::Range { key: "MIN_CONFIDENCE", reason: "must be in [0, 1]".into() });
    }
    if st.price_window < 2 || st.rsi_period < 2 {
        return Err(ConfigError::Range { key: "PRICE_WINDOW", reason: "window and RSI period must be >= 2".into() });
    }
    // bellwether di luar SYMBOLS tidak pernah di-subscribe -> breadth selalu gagal
    if let Some(b) = st.bellwethers.iter().find(|b| !s.universe.iter().any(|u| &u.symbol == *b)) {
        return Err(ConfigError::Invalid { key: "BELLWETHERS".into(), value: format!("{b} is not in SYMBOLS") });
    }
    if s.hours.open >= s.hours.close {
        return Err(ConfigError::Range { key: "MARKET_OPEN", reason: "open must be before close".into() });
    }
    if s.ws.max_reconnect_attempts == 0 {
        return Err(ConfigError::Range { key: "MAX_RECONNECT_ATTEMPTS", reason: "must be >= 1".into() });
    }
    if s.feed_mode == FeedMode::Replay && s.replay_file.is_none() {
        return Err(ConfigError::Missing("REPLAY_FILE"));
    }
    if s.broker.mode == BrokerMode::Rest && (s.broker.client_id.is_none() || s.broker.access_token.is_none()) {
        return Err(ConfigError::Missing("BROKER_CLIENT_ID/BROKER_ACCESS_TOKEN"));
    }
    Ok(())
}

pub fn load(args: &Args) -> Result<Settings, ConfigError> {
    // Pastikan .env dibaca
    match &args.env_file {
        Some(path) => {
            dotenvy::from_path(path).map_err(|source| ConfigError::EnvFile { path: path.clone(), source })?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    // ===== Universe =====
    let universe = match env::var("SYMBOLS") {
        Ok(v) if !v.trim().is_empty() => parse_universe(&v)?,
        _ => default_universe(),
    };

    // ===== Strategy =====
    let mut strategy = StrategyConfig::default();
    strategy.portfolio_value = to_px(env_or("PORTFOLIO_VALUE", 1_000_000.0)?);
    strategy.risk_per_trade_pct = env_or("RISK_PER_TRADE", strategy.risk_per_trade_pct)?;
    strategy.max_positions = env_or("MAX_POSITIONS", strategy.max_positions)?;
    strategy.min_gap_pct = env_or("MIN_GAP_PERCENTAGE", strategy.min_gap_pct)?;
    strategy.min_selling_pressure = env_or("MIN_SELLING_PRESSURE", strategy.min_selling_pressure)?;
    strategy.min_volume_ratio = env_or("MIN_VOLUME_RATIO", strategy.min_volume_ratio)?;
    strategy.min_confidence = env_or("MIN_CONFIDENCE", strategy.min_confidence)?;
    strategy.stop_loss_pct = env_or("STOP_LOSS_PCT", strategy.stop_loss_pct)?;
    strategy.target_pct = env_or("TARGET_PCT", strategy.target_pct)?;
    strategy.max_sector_exposure_pct = env_or("MAX_SECTOR_EXPOSURE_PCT", strategy.max_sector_exposure_pct)?;
    strategy.daily_loss_limit = to_px(env_or("DAILY_LOSS_LIMIT", 20_000.0)?);
    strategy.price_window = env_or("PRICE_WINDOW", strategy.price_window)?;
    strategy.rsi_period = env_or("RSI_PERIOD", strategy.rsi_period)?;
    strategy.breadth_min_ratio = env_or("BREADTH_MIN_RATIO", strategy.breadth_min_ratio)?;
    strategy.breadth_min_gap_pct = env_or("BREADTH_MIN_GAP_PCT", strategy.breadth_min_gap_pct)?;
    strategy.bellwethers = env::var("BELLWETHERS")
        .ok()
        .map(|s| {
            s.split(',')
                .map(|x| x.trim().to_ascii_uppercase())
                .filter(|x| !x.is_empty())
                .collect()
        })
        .unwrap_or_default();

    // ===== Jam pasar =====
    let hours = MarketHours {
        utc_offset_minutes: env_or("UTC_OFFSET_MINUTES", 330)?,
        open: env_time("MARKET_OPEN", hm(9, 15))?,
        close: env_time("MARKET_CLOSE", hm(15, 30))?,
        signal_end: env_time("SIGNAL_WINDOW_END", hm(10, 30))?,
        eod_cutoff: env_time("EOD_CUTOFF", hm(15, 15))?,
    };

    // ===== Feed =====
    let d = WsConfig::default();
    let ws = WsConfig {
        url: env::var("FEED_WS_URL").unwrap_or(d.url),
        access_token: env::var("FEED_ACCESS_TOKEN").ok(),
        reconnect_base: env_secs("RECONNECT_BASE_SECS", d.reconnect_base)?,
        backoff_cap: env_secs("RECONNECT_CAP_SECS", d.backoff_cap)?,
        max_reconnect_attempts: env_or("MAX_RECONNECT_ATTEMPTS", d.max_reconnect_attempts)?,
        ping_interval: env_secs("PING_INTERVAL_SECS", d.ping_interval)?,
        pong_deadline: env_secs("PONG_DEADLINE_SECS", d.pong_deadline)?,
        connect_timeout: env_secs("CONNECT_TIMEOUT_SECS", d.connect_timeout)?,
    };

    // ===== Broker =====
    let b = BrokerConfig::default();
    let broker = BrokerConfig {
        mode: env_or("BROKER_MODE", b.mode)?,
        rest_url: env::var("BROKER_REST_URL").unwrap_or(b.rest_url),
        client_id: env::var("BROKER_CLIENT_ID").ok(),
        access_token: env::var("BROKER_ACCESS_TOKEN").ok(),
        max_exit_retries: env_or("MAX_EXIT_RETRIES", b.max_exit_retries)?,
        ack_timeout: env_secs("ACK_TIMEOUT_SECS", b.ack_timeout)?,
        drain_timeout: env_secs("DRAIN_TIMEOUT_SECS", b.drain_timeout)?,
        paper_fill_ms: env_or("PAPER_FILL_MS", b.paper_fill_ms)?,
        status_poll: Duration::from_millis(env_or("BROKER_STATUS_POLL_MS", 200u64)?),
    };

    let feed_mode = match args.feed {
        Some(m) => m,
        None => env_or("FEED_MODE", FeedMode::Mock)?,
    };
    let replay_file = args.replay.clone().or_else(|| env::var("REPLAY_FILE").ok());
    let record_file = args.record_file.clone().or_else(|| env::var("RECORD_FILE").ok());
    let metrics_port = match args.metrics_port {
        Some(p) => p,
        None => env_or("METRICS_PORT", 9898)?,
    };

    let settings = Settings {
        universe,
        strategy,
        hours,
        ws,
        broker,
        feed_mode,
        replay_file,
        record_file,
        metrics_port,
    };
    validate(&settings)?;
    Ok(settings)
}
