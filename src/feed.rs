// ===============================
// src/feed.rs
// ===============================
//
// Market data session:
// - MarketSource : transport (WebSocket asli / fake di test)
// - run_session  : state machine Disconnected -> Connecting -> Connected -> Reconnecting (-> Failed)
//                  heartbeat ping, deadline frame, backoff 5s,10s,20s,.. capped,
//                  resubscribe symbol yang sama sebelum data mengalir lagi.
// - run_mock     : random-walk quote generator (clock simulasi sesi bursa)
// - run_replay   : file JSONL (raw quote atau rekaman Event::Tick)
//
// Semua output berupa raw JSON string ke channel engine; parsing di normalizer.
//
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpStream,
    sync::{mpsc, watch},
    time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{SymbolSpec, WsConfig};
use crate::domain::{from_px, Event, Tick};
use crate::hours::MarketHours;
use crate::metrics::{FEED_CONNECTED, FEED_LAST_FRAME_TS, FEED_RECONNECTS};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ConnectionExhausted { attempts: u32 },
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Failed,
}

/// Frame dari transport
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data(String),
    Pong,
    Other,
}

#[async_trait]
pub trait MarketSource: Send {
    async fn connect(&mut self) -> Result<(), FeedError>;
    async fn subscribe(&mut self, symbols: &[String]) -> Result<(), FeedError>;
    async fn unsubscribe(&mut self, symbols: &[String]) -> Result<(), FeedError>;
    async fn ping(&mut self) -> Result<(), FeedError>;
    /// `Ok(None)` = stream ditutup remote
    async fn next_frame(&mut self) -> Result<Option<Frame>, FeedError>;
    async fn close(&mut self);
}

/// Exponential backoff: base, 2×base, 4×base, ... dibatasi `cap`, maksimal `max_attempts`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self { base, cap, max_attempts, attempt: 0 }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// None = percobaan habis
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        let factor = 1u32.checked_shl(self.attempt - 1).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.cap))
    }

    fn schedule(&mut self) -> ConnState {
        match self.next_delay() {
            Some(delay) => ConnState::Reconnecting { attempt: self.attempt, delay },
            None => ConnState::Failed,
        }
    }
}

/// Connect + subscribe. Handshake lewat `connect_timeout` -> `FeedError::Connection`.
pub async fn connect_and_subscribe<S: MarketSource + ?Sized>(
    source: &mut S,
    symbols: &[String],
    connect_timeout: Duration,
) -> Result<(), FeedError> {
    match timeout(connect_timeout, source.connect()).await {
        Ok(res) => res?,
        Err(_) => {
            return Err(FeedError::Connection(format!("handshake not completed within {}s", connect_timeout.as_secs())))
        }
    }
    source.subscribe(symbols).await
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

enum Pump {
    Shutdown,
    ConsumerGone,
    Lost(String),
}

/// Baca frame + heartbeat sampai koneksi putus / shutdown.
async fn pump<S: MarketSource + ?Sized>(
    source: &mut S,
    cfg: &WsConfig,
    tx: &mpsc::Sender<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> Pump {
    let mut ping = interval_at(Instant::now() + cfg.ping_interval, cfg.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // waktu ping pertama yang belum dibalas frame apa pun
    let mut awaiting: Option<Instant> = None;

    loop {
        let deadline = awaiting.map(|t| t + cfg.pong_deadline);
        tokio::select! {
            biased;
            _ = wait_shutdown(shutdown) => return Pump::Shutdown,
            frame = source.next_frame() => match frame {
                Ok(Some(f)) => {
                    awaiting = None;
                    FEED_LAST_FRAME_TS.set(Utc::now().timestamp());
                    if let Frame::Data(raw) = f {
                        if tx.send(raw).await.is_err() {
                            return Pump::ConsumerGone;
                        }
                    }
                }
                Ok(None) => return Pump::Lost("stream closed by remote".into()),
                Err(e) => return Pump::Lost(e.to_string()),
            },
            _ = ping.tick() => {
                if let Err(e) = source.ping().await {
                    return Pump::Lost(e.to_string());
                }
                if awaiting.is_none() {
                    awaiting = Some(Instant::now());
                }
            }
            _ = sleep_until_opt(deadline) => {
                return Pump::Lost(format!("no frame within {}s after ping", cfg.pong_deadline.as_secs()));
            }
        }
    }
}

/// Session driver. Return `Ok(())` saat shutdown / consumer hilang,
/// `Err(ConnectionExhausted)` kalau reconnect habis.
pub async fn run_session<S: MarketSource + ?Sized>(
    source: &mut S,
    symbols: Vec<String>,
    cfg: WsConfig,
    tx: mpsc::Sender<String>,
    status: watch::Sender<ConnState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), FeedError> {
    let mut backoff = Backoff::new(cfg.reconnect_base, cfg.backoff_cap, cfg.max_reconnect_attempts);
    let mut state = ConnState::Connecting;

    loop {
        status.send_replace(state);
        match state {
            ConnState::Connecting | ConnState::Reconnecting { .. } => {
                if let ConnState::Reconnecting { attempt, delay } = state {
                    FEED_RECONNECTS.inc();
                    info!(attempt, delay_secs = delay.as_secs(), "feed reconnect scheduled");
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = wait_shutdown(&mut shutdown) => {
                            status.send_replace(ConnState::Disconnected);
                            return Ok(());
                        }
                    }
                }
                match connect_and_subscribe(source, &symbols, cfg.connect_timeout).await {
                    Ok(()) => {
                        info!(symbols = symbols.len(), "feed connected & subscribed");
                        backoff.reset();
                        state = ConnState::Connected;
                    }
                    Err(e) => {
                        warn!(error = %e, "feed connect failed");
                        source.close().await;
                        state = backoff.schedule();
                    }
                }
            }
            ConnState::Connected => {
                FEED_CONNECTED.set(1);
                let outcome = pump(source, &cfg, &tx, &mut shutdown).await;
                FEED_CONNECTED.set(0);
                match outcome {
                    Pump::Shutdown => {
                        if let Err(e) = source.unsubscribe(&symbols).await {
                            warn!(error = %e, "feed unsubscribe failed");
                        }
                        source.close().await;
                        status.send_replace(ConnState::Disconnected);
                        info!("feed closed");
                        return Ok(());
                    }
                    Pump::ConsumerGone => {
                        source.close().await;
                        status.send_replace(ConnState::Disconnected);
                        return Ok(());
                    }
                    Pump::Lost(reason) => {
                        warn!(%reason, "feed disconnected");
                        source.close().await;
                        state = backoff.schedule();
                    }
                }
            }
            ConnState::Failed => {
                error!(attempts = backoff.attempts(), "feed reconnect exhausted");
                return Err(FeedError::ConnectionExhausted { attempts: backoff.attempts() });
            }
            ConnState::Disconnected => return Ok(()),
        }
    }
}

// ---------------- WebSocket source ----------------

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Quote stream JSON via WebSocket.
/// Subscribe: `{"T":"SUB_DATA","TLIST":[..],"SUB_T":1}`, unsubscribe dengan `SUB_T:0`.
pub struct WsSource {
    url: String,
    access_token: Option<String>,
    ws: Option<Ws>,
}

impl WsSource {
    pub fn new(cfg: &WsConfig) -> Self {
        Self { url: cfg.url.clone(), access_token: cfg.access_token.clone(), ws: None }
    }

    fn endpoint(&self) -> Result<Url, FeedError> {
        let mut url = Url::parse(&self.url).map_err(|e| FeedError::Connection(format!("bad ws url {}: {e}", self.url)))?;
        if let Some(tok) = &self.access_token {
            url.query_pairs_mut().append_pair("access_token", tok);
        }
        Ok(url)
    }

    async fn send(&mut self, msg: Message) -> Result<(), FeedError> {
        let ws = self.ws.as_mut().ok_or_else(|| FeedError::Transport("not connected".into()))?;
        ws.send(msg).await.map_err(|e| FeedError::Transport(e.to_string()))
    }

    fn sub_frame(symbols: &[String], on: bool) -> Message {
        Message::Text(json!({ "T": "SUB_DATA", "TLIST": symbols, "SUB_T": if on { 1 } else { 0 } }).to_string())
    }
}

#[async_trait]
impl MarketSource for WsSource {
    async fn connect(&mut self) -> Result<(), FeedError> {
        let url = self.endpoint()?;
        info!(host = url.host_str().unwrap_or("?"), "connecting market data ws");
        let (ws, _resp) = connect_async(url).await.map_err(|e| FeedError::Connection(e.to_string()))?;
        self.ws = Some(ws);
        Ok(())
    }

    async fn subscribe(&mut self, symbols: &[String]) -> Result<(), FeedError> {
        self.send(Self::sub_frame(symbols, true)).await
    }

    async fn unsubscribe(&mut self, symbols: &[String]) -> Result<(), FeedError> {
        self.send(Self::sub_frame(symbols, false)).await
    }

    async fn ping(&mut self) -> Result<(), FeedError> {
        self.send(Message::Ping(Vec::new())).await
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>, FeedError> {
        let ws = self.ws.as_mut().ok_or_else(|| FeedError::Transport("not connected".into()))?;
        match ws.next().await {
            Some(Ok(Message::Text(t))) => Ok(Some(Frame::Data(t))),
            Some(Ok(Message::Pong(_))) => Ok(Some(Frame::Pong)),
            Some(Ok(Message::Close(_))) | None => Ok(None),
            Some(Ok(_)) => Ok(Some(Frame::Other)),
            Some(Err(e)) => Err(FeedError::Transport(e.to_string())),
        }
    }

    async fn close(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(None).await;
        }
    }
}

// ---------------- Mock & replay ----------------

/// Raw quote JSON dari Tick (format yang sama dengan feed)
pub fn tick_to_raw(t: &Tick) -> String {
    let mut v = json!({
        "symbol": t.symbol,
        "ltp": from_px(t.last_price),
        "last_traded_qty": t.volume,
        "bid_price": from_px(t.bid),
        "ask_price": from_px(t.ask),
        "exch_feed_time": t.ts.timestamp_millis(),
    });
    if let Some(o) = t.open_price {
        v["open_price"] = json!(from_px(o));
    }
    if let Some(p) = t.prev_close {
        v["prev_close_price"] = json!(from_px(p));
    }
    v.to_string()
}

struct MockQuote {
    symbol: String,
    prev_close: f64,
    open: f64,
    px: f64,
    drift: f64,
}

fn mock_quote(q: &MockQuote, ts: DateTime<Utc>, volume: i64) -> String {
    json!({
        "symbol": q.symbol,
        "ltp": (q.px * 100.0).round() / 100.0,
        "last_traded_qty": volume,
        "bid_price": ((q.px - 0.05) * 100.0).round() / 100.0,
        "ask_price": ((q.px + 0.05) * 100.0).round() / 100.0,
        "open_price": q.open,
        "prev_close_price": q.prev_close,
        "exch_feed_time": ts.timestamp_millis(),
    })
    .to_string()
}

/// Random walk per symbol dengan clock simulasi: mulai jam buka sesi terakhir,
/// maju 1 detik per putaran (~50 putaran/detik), selesai saat jam tutup.
pub async fn run_mock(
    tx: mpsc::Sender<String>,
    universe: Vec<SymbolSpec>,
    hours: MarketHours,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), FeedError> {
    let mut rng = StdRng::from_entropy();
    let session = hours.last_weekday(Utc::now());
    let start = hours
        .open_at(session)
        .ok_or_else(|| FeedError::Connection(format!("no market open time for {session}")))?;
    let end = start + (hours.close - hours.open);

    let mut quotes: Vec<MockQuote> = universe
        .iter()
        .map(|s| {
            let prev_close: f64 = (rng.gen_range(100.0..3000.0_f64) * 100.0).round() / 100.0;
            let gap_pct = rng.gen_range(-1.0..3.0);
            let open = (prev_close * (1.0 + gap_pct / 100.0) * 100.0).round() / 100.0;
            // nama yang gap-up cenderung fade
            let drift = if gap_pct > 0.5 { -0.000_2 } else { 0.0 };
            MockQuote { symbol: s.symbol.clone(), prev_close, open, px: open, drift }
        })
        .collect();

    info!(symbols = quotes.len(), %session, "mock feed started");
    FEED_CONNECTED.set(1);
    let mut now = start;
    while now <= end {
        for q in quotes.iter_mut() {
            let step = q.drift + rng.gen_range(-0.000_5..0.000_5);
            q.px = (q.px * (1.0 + step)).max(1.0);
            let mut volume = rng.gen_range(100..1000);
            if rng.gen_bool(0.05) {
                volume *= 4;
            }
            if tx.send(mock_quote(q, now, volume)).await.is_err() {
                FEED_CONNECTED.set(0);
                return Ok(());
            }
        }
        tokio::select! {
            _ = sleep(Duration::from_millis(20)) => {}
            _ = wait_shutdown(&mut shutdown) => break,
        }
        now += chrono::Duration::seconds(1);
    }
    FEED_CONNECTED.set(0);
    info!("mock feed finished");
    Ok(())
}

/// Replay JSONL. Baris `{"Tick":{..}}` (rekaman recorder) dikonversi ke raw quote,
/// Event lain dilewati, selebihnya diteruskan apa adanya.
pub async fn run_replay(
    path: String,
    tx: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<usize, FeedError> {
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| FeedError::Connection(format!("replay open {path}: {e}")))?;
    let mut lines = BufReader::new(file).lines();
    let mut sent = 0usize;
    info!(%path, "replay started");

    loop {
        let line = tokio::select! {
            biased;
            _ = wait_shutdown(&mut shutdown) => break,
            line = lines.next_line() => line.map_err(|e| FeedError::Transport(e.to_string()))?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let raw = match serde_json::from_str::<Event>(line) {
            Ok(Event::Tick(t)) => tick_to_raw(&t),
            Ok(_) => continue,
            Err(_) => line.to_string(),
        };
        if tx.send(raw).await.is_err() {
            break;
        }
        sent += 1;
    }
    debug!(sent, "replay finished");
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Debug)]
    enum Step {
        Data(&'static str),
        Close,
    }

    #[derive(Default)]
    struct Script {
        /// hasil connect berurutan; kosong = sukses
        connects: VecDeque<bool>,
        /// handshake tidak pernah selesai
        hang_connect: bool,
        /// frame per koneksi sukses; habis = diam (tidak ada frame)
        sessions: VecDeque<Vec<Step>>,
        current: VecDeque<Step>,
        log: Vec<(Duration, String)>,
    }

    struct FakeSource {
        script: Arc<Mutex<Script>>,
        t0: Instant,
    }

    impl FakeSource {
        fn log(&self, s: String) {
            self.script.lock().unwrap().log.push((self.t0.elapsed(), s));
        }
    }

    #[async_trait]
    impl MarketSource for FakeSource {
        async fn connect(&mut self) -> Result<(), FeedError> {
            self.log("connect".into());
            let hang = self.script.lock().unwrap().hang_connect;
            if hang {
                return std::future::pending().await;
            }
            let mut sc = self.script.lock().unwrap();
            if sc.connects.pop_front().unwrap_or(true) {
                sc.current = sc.sessions.pop_front().unwrap_or_default().into();
                Ok(())
            } else {
                Err(FeedError::Connection("refused".into()))
            }
        }
        async fn subscribe(&mut self, symbols: &[String]) -> Result<(), FeedError> {
            self.log(format!("subscribe {}", symbols.join(",")));
            Ok(())
        }
        async fn unsubscribe(&mut self, symbols: &[String]) -> Result<(), FeedError> {
            self.log(format!("unsubscribe {}", symbols.join(",")));
            Ok(())
        }
        async fn ping(&mut self) -> Result<(), FeedError> {
            self.log("ping".into());
            Ok(())
        }
        async fn next_frame(&mut self) -> Result<Option<Frame>, FeedError> {
            let step = self.script.lock().unwrap().current.pop_front();
            match step {
                Some(Step::Data(s)) => Ok(Some(Frame::Data(s.to_string()))),
                Some(Step::Close) => Ok(None),
                None => std::future::pending().await,
            }
        }
        async fn close(&mut self) {
            self.log("close".into());
        }
    }

    fn cfg(max_attempts: u32) -> WsConfig {
        WsConfig { max_reconnect_attempts: max_attempts, ..WsConfig::default() }
    }

    fn symbols() -> Vec<String> {
        vec!["NSE:ITC-EQ".to_string(), "NSE:TCS-EQ".to_string()]
    }

    fn times_of(log: &[(Duration, String)], what: &str) -> Vec<u64> {
        log.iter().filter(|(_, s)| s == what).map(|(t, _)| t.as_secs()).collect()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(5), Duration::from_secs(30), 6);
        let delays: Vec<u64> = std::iter::from_fn(|| b.next_delay()).map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 30, 30, 30]);
        b.reset();
        assert_eq!(b.next_delay(), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_backoff_and_resubscribes_before_delivery() {
        let script = Arc::new(Mutex::new(Script {
            connects: VecDeque::from(vec![false, false, false, true, true]),
            sessions: VecDeque::from(vec![vec![Step::Data("q1"), Step::Close], vec![Step::Data("q2")]]),
            ..Default::default()
        }));
        let mut src = FakeSource { script: script.clone(), t0: Instant::now() };
        let (tx, mut rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(ConnState::Disconnected);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move { run_session(&mut src, symbols(), cfg(10), tx, status_tx, stop_rx).await });

        assert_eq!(rx.recv().await.as_deref(), Some("q1"));
        assert_eq!(rx.recv().await.as_deref(), Some("q2"));
        {
            let sc = script.lock().unwrap();
            let subs = sc.log.iter().filter(|(_, s)| s.starts_with("subscribe")).count();
            assert_eq!(subs, 2, "resubscribe happens before q2 is delivered");
            // gagal di t=0, lalu 5s, 10s, 20s; sukses di t=35, putus, reconnect 5s kemudian
            assert_eq!(times_of(&sc.log, "connect"), vec![0, 5, 15, 35, 40]);
            assert!(sc.log.iter().any(|(_, s)| s == "subscribe NSE:ITC-EQ,NSE:TCS-EQ"));
        }
        assert_eq!(*status_rx.borrow(), ConnState::Connected);

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        let sc = script.lock().unwrap();
        let tail: Vec<&str> = sc.log.iter().rev().take(2).map(|(_, s)| s.as_str()).collect();
        assert_eq!(tail, vec!["close", "unsubscribe NSE:ITC-EQ,NSE:TCS-EQ"]);
        assert_eq!(*status_rx.borrow(), ConnState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_handshake_times_out_without_subscribing() {
        let script = Arc::new(Mutex::new(Script { hang_connect: true, ..Default::default() }));
        let mut src = FakeSource { script: script.clone(), t0: Instant::now() };
        let t0 = Instant::now();

        let res = connect_and_subscribe(&mut src, &symbols(), Duration::from_secs(30)).await;
        match res {
            Err(FeedError::Connection(why)) => assert!(why.contains("30s"), "{why}"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(t0.elapsed().as_secs(), 30);
        let sc = script.lock().unwrap();
        assert!(!sc.log.iter().any(|(_, s)| s.starts_with("subscribe")));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let script = Arc::new(Mutex::new(Script {
            connects: VecDeque::from(vec![false; 10]),
            ..Default::default()
        }));
        let mut src = FakeSource { script: script.clone(), t0: Instant::now() };
        let (tx, _rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(ConnState::Disconnected);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let res = run_session(&mut src, symbols(), cfg(3), tx, status_tx, stop_rx).await;
        assert!(matches!(res, Err(FeedError::ConnectionExhausted { attempts: 3 })));
        assert_eq!(*status_rx.borrow(), ConnState::Failed);
        assert_eq!(times_of(&script.lock().unwrap().log, "connect"), vec![0, 5, 15, 35]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_stream_is_dropped_after_pong_deadline() {
        let script = Arc::new(Mutex::new(Script::default()));
        let mut src = FakeSource { script: script.clone(), t0: Instant::now() };
        let (tx, _rx) = mpsc::channel(16);
        let (status_tx, _status_rx) = watch::channel(ConnState::Disconnected);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move { run_session(&mut src, symbols(), cfg(10), tx, status_tx, stop_rx).await });
        // ping di 30s, tanpa frame sampai 40s -> putus, reconnect 5s kemudian (45s)
        sleep(Duration::from_secs(50)).await;
        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        let sc = script.lock().unwrap();
        assert_eq!(times_of(&sc.log, "ping").first(), Some(&30));
        assert_eq!(times_of(&sc.log, "connect"), vec![0, 45]);
    }

    #[tokio::test]
    async fn replay_forwards_raw_and_recorded_ticks() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let tick = Tick {
            symbol: "NSE:ITC-EQ".into(),
            ts: chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 3, 4, 4, 0, 0).unwrap(),
            last_price: 20_010,
            volume: 500,
            bid: 20_005,
            ask: 20_015,
            open_price: Some(20_400),
            prev_close: Some(20_000),
        };
        writeln!(f, r#"{{"symbol":"NSE:TCS-EQ","ltp":3000.5,"exch_feed_time":1709524800}}"#).unwrap();
        writeln!(f).unwrap();
        writeln!(f, "{}", serde_json::to_string(&Event::Tick(tick.clone())).unwrap()).unwrap();
        writeln!(f, "{}", serde_json::to_string(&Event::Note("skip".into())).unwrap()).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let n = run_replay(f.path().to_string_lossy().to_string(), tx, stop_rx).await.unwrap();
        assert_eq!(n, 2);
        assert!(rx.recv().await.unwrap().contains("NSE:TCS-EQ"));
        let raw: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let back = crate::normalizer::parse_quote(&raw).unwrap();
        assert_eq!(back, tick);
    }
}
