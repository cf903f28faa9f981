// ===============================
// src/engine.rs
// ===============================
//
// EngineState: satu-satunya pemilik state (normalizer, sinyal, risk, posisi, portfolio).
// Semua method sinkron dan menerima waktu dari luar (tick / clock) sehingga
// bisa di-drive langsung di test atau dari rekaman JSONL.
//
// `run` adalah shell async: select atas raw feed, exec report, timer, dan stop.
//
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::{
    select,
    sync::{mpsc, mpsc::error::TrySendError, watch},
    task::JoinHandle,
    time::{interval, sleep, timeout, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::config::{ConfigError, Settings};
use crate::domain::{whole_units, Event, ExecReport, Order, Position, PositionStatus, Signal};
use crate::feed::{ConnState, FeedError};
use crate::gateway::BrokerError;
use crate::hours::MarketHours;
use crate::metrics::RECORDER_DROPPED;
use crate::normalizer::{DropStats, Normalizer};
use crate::portfolio::PortfolioMonitor;
use crate::positions::{BookConfig, BookOutput, PositionBook};
use crate::risk::RiskManager;
use crate::strategy::{rank, SignalEngine};

/// Batas pesan raw per batch evaluasi
const MAX_BATCH: usize = 1024;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("feed task panicked: {0}")]
    FeedTask(String),
}

/// Order untuk broker + event untuk recorder dari satu langkah engine
#[derive(Debug, Default)]
pub struct Step {
    pub orders: Vec<Order>,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionLine {
    pub symbol: String,
    pub status: PositionStatus,
    pub entry_price: i64,
    pub last_price: i64,
    pub quantity: i64,
    pub unrealized_pnl: i64,
    pub escalated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub active: Vec<PositionLine>,
    pub realized_pnl: i64,
    pub unrealized_pnl: i64,
    pub daily_pnl: i64,
    pub closed_trades: usize,
    pub winning_trades: usize,
    pub breaker_tripped: bool,
    pub feed: String,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "active={} realized={} unrealized={} daily={} trades={} wins={} breaker={} feed={}",
            self.active.len(),
            whole_units(self.realized_pnl),
            whole_units(self.unrealized_pnl),
            whole_units(self.daily_pnl),
            self.closed_trades,
            self.winning_trades,
            self.breaker_tripped,
            self.feed
        )?;
        for p in &self.active {
            write!(
                f,
                "\n  {} {:?} qty={} entry={} last={} upnl={}{}",
                p.symbol,
                p.status,
                p.quantity,
                whole_units(p.entry_price),
                whole_units(p.last_price),
                whole_units(p.unrealized_pnl),
                if p.escalated { " ESCALATED" } else { "" }
            )?;
        }
        Ok(())
    }
}

pub struct EngineState {
    hours: MarketHours,
    normalizer: Normalizer,
    signals: SignalEngine,
    risk: RiskManager,
    book: PositionBook,
    portfolio: PortfolioMonitor,
    feed_state: ConnState,
    last_tick_ts: Option<DateTime<Utc>>,
    ticks: u64,
}

impl EngineState {
    pub fn new(s: &Settings) -> Self {
        let book_cfg = BookConfig {
            max_exit_retries: s.broker.max_exit_retries,
            ack_timeout: chrono::Duration::from_std(s.broker.ack_timeout).unwrap_or_else(|_| chrono::Duration::seconds(30)),
        };
        Self {
            hours: s.hours.clone(),
            normalizer: Normalizer::new(s.symbols(), s.hours.clone()),
            signals: SignalEngine::new(s.strategy.clone(), s.hours.clone(), &s.universe),
            risk: RiskManager::new(s.strategy.clone()),
            book: PositionBook::new(book_cfg, s.hours.clone()),
            portfolio: PortfolioMonitor::new(s.strategy.max_positions, s.strategy.daily_loss_limit),
            feed_state: ConnState::Disconnected,
            last_tick_ts: None,
            ticks: 0,
        }
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn portfolio(&self) -> &PortfolioMonitor {
        &self.portfolio
    }

    pub fn drop_stats(&self) -> &DropStats {
        &self.normalizer.stats
    }

    pub fn last_tick_ts(&self) -> Option<DateTime<Utc>> {
        self.last_tick_ts
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn set_feed_state(&mut self, st: ConnState) {
        if self.feed_state != st {
            info!(from = ?self.feed_state, to = ?st, "feed state");
            self.feed_state = st;
        }
    }

    fn absorb(&mut self, out: BookOutput, step: &mut Step) {
        for pnl in out.realized {
            self.portfolio.record_realized(pnl);
        }
        step.orders.extend(out.orders);
        step.events.extend(out.events);
    }

    /// Satu pesan raw = batch berisi satu pesan
    pub fn on_raw(&mut self, raw: &str) -> Step {
        self.on_batch(&[raw.to_string()])
    }

    /// Satu pass evaluasi atas batch raw message: update posisi + portfolio tick-by-tick,
    /// kumpulkan kandidat sinyal (terbaru per symbol), ranking (confidence desc, symbol), lalu sizing.
    pub fn on_batch(&mut self, raws: &[String]) -> Step {
        let mut step = Step::default();
        let mut latest: HashMap<String, Signal> = HashMap::new();

        for raw in raws {
            let Some(tick) = self.normalizer.normalize(raw) else { continue };
            self.ticks += 1;
            self.last_tick_ts = Some(self.last_tick_ts.map_or(tick.ts, |t| t.max(tick.ts)));
            self.portfolio.roll_session(self.hours.session_date(tick.ts));
            step.events.push(Event::Tick(tick.clone()));

            if self.book.is_active(&tick.symbol) {
                self.signals.observe(&tick);
                let out = self.book.on_tick(&tick);
                self.absorb(out, &mut step);
                // breaker harus melihat setiap mark, bukan hanya akhir batch
                self.portfolio.refresh(self.book.positions());
            } else if let Some(sig) = self.signals.evaluate(&tick) {
                latest.insert(sig.symbol.clone(), sig);
            }
        }

        let mut candidates: Vec<Signal> = latest.into_values().collect();
        rank(&mut candidates);
        for sig in candidates {
            step.events.push(Event::Sig(sig.clone()));
            let Ok(ord) = self.risk.size(&sig, &self.portfolio) else { continue };
            if let Some(ev) = self.book.open_pending(&ord, sig.ts) {
                step.events.push(ev);
            }
            step.events.push(Event::Ord(ord.clone()));
            step.orders.push(ord);
            self.portfolio.refresh(self.book.positions());
        }
        step
    }

    /// Exec report; `now` adalah clock engine saat report diterima.
    pub fn on_exec(&mut self, mut rep: ExecReport, now: DateTime<Utc>) -> Step {
        let mut step = Step::default();
        rep.ts = now;
        let out = self.book.on_exec(&rep);
        step.events.push(Event::Exec(rep));
        self.absorb(out, &mut step);
        self.portfolio.refresh(self.book.positions());
        step
    }

    /// Timer periodik: time-exit symbol sepi + timeout ack.
    pub fn on_timer(&mut self, now: DateTime<Utc>) -> Step {
        let mut step = Step::default();
        let out = self.book.on_timer(now);
        if !out.is_empty() {
            self.absorb(out, &mut step);
            self.portfolio.refresh(self.book.positions());
        }
        step
    }

    pub fn has_pending_exits(&self) -> bool {
        self.book.has_pending_exits()
    }

    /// Akuntansi akhir posisi non-terminal
    pub fn ledger(&self, now: DateTime<Utc>) -> Event {
        Event::Ledger { ts: now, positions: self.book.non_terminal() }
    }

    pub fn summary(&self) -> Summary {
        let st = self.portfolio.state();
        let active = self
            .book
            .non_terminal()
            .into_iter()
            .map(|p: Position| PositionLine {
                symbol: p.symbol,
                status: p.status,
                entry_price: p.entry_price,
                last_price: p.last_price,
                quantity: p.quantity,
                unrealized_pnl: p.unrealized_pnl,
                escalated: p.escalated,
            })
            .collect();
        let closed = self.book.closed();
        Summary {
            active,
            realized_pnl: closed.iter().map(|t| t.realized_pnl).sum(),
            unrealized_pnl: st.unrealized_pnl,
            daily_pnl: self.portfolio.total_pnl(),
            closed_trades: closed.len(),
            winning_trades: closed.iter().filter(|t| t.realized_pnl > 0).count(),
            breaker_tripped: st.breaker_tripped,
            feed: format!("{:?}", self.feed_state),
        }
    }
}

// ---------------- async shell ----------------

/// Sumber waktu engine: jam dinding (feed live) atau timestamp feed (mock/replay)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    Wall,
    Feed,
}

impl Clock {
    pub fn now(&self, state: &EngineState) -> DateTime<Utc> {
        match self {
            Clock::Wall => Utc::now(),
            Clock::Feed => state.last_tick_ts().unwrap_or_else(Utc::now),
        }
    }
}

pub struct Channels {
    pub raw_rx: mpsc::Receiver<String>,
    pub exec_rx: mpsc::Receiver<ExecReport>,
    pub ord_tx: mpsc::Sender<Order>,
    pub rec_tx: Option<mpsc::Sender<Event>>,
    pub feed_status: watch::Receiver<ConnState>,
    pub feed_shutdown: watch::Sender<bool>,
    /// tiap pesan = permintaan stop; yang kedua saat drain = paksa
    pub stop_rx: mpsc::Receiver<()>,
}

pub struct RunCfg {
    pub clock: Clock,
    pub drain_timeout: Duration,
    pub heartbeat: Duration,
}

/// Tick boleh di-drop saat recorder tertinggal (dihitung di metric); event lain ditunggu.
/// `lagging` menahan warn agar hanya sekali per burst.
async fn record(rec: &mpsc::Sender<Event>, events: Vec<Event>, lagging: &mut bool) {
    for ev in events {
        if !matches!(ev, Event::Tick(_)) {
            if rec.send(ev).await.is_err() {
                RECORDER_DROPPED.inc();
                error!("recorder closed, event dropped");
            }
            continue;
        }
        match rec.try_send(ev) {
            Ok(()) => *lagging = false,
            Err(e) => {
                RECORDER_DROPPED.inc();
                if !*lagging {
                    let closed = matches!(e, TrySendError::Closed(_));
                    warn!(closed, "recorder not keeping up, dropping tick events");
                    *lagging = true;
                }
            }
        }
    }
}

async fn dispatch(step: Step, ch: &Channels, lagging: &mut bool) {
    if let Some(rec) = &ch.rec_tx {
        record(rec, step.events, lagging).await;
    }
    for o in step.orders {
        if ch.ord_tx.send(o).await.is_err() {
            error!("gateway channel closed, order dropped");
        }
    }
}

/// Event loop utama. Selesai saat stop diminta atau feed berhenti;
/// ledger akhir selalu ditulis sebelum return (termasuk saat error feed).
pub async fn run(
    mut state: EngineState,
    mut ch: Channels,
    feed: JoinHandle<Result<(), FeedError>>,
    cfg: RunCfg,
) -> Result<Summary, EngineError> {
    let mut timer = interval(Duration::from_secs(1));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat = interval(cfg.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks_at_hb = 0u64;
    let mut forced = false;
    let mut rec_lagging = false;

    info!(clock = ?cfg.clock, "engine started");
    loop {
        select! {
            biased;
            Some(()) = ch.stop_rx.recv() => {
                info!("stop requested");
                break;
            }
            maybe = ch.raw_rx.recv() => {
                let Some(first) = maybe else {
                    info!("feed ended");
                    break;
                };
                let mut batch = vec![first];
                while batch.len() < MAX_BATCH {
                    match ch.raw_rx.try_recv() {
                        Ok(m) => batch.push(m),
                        Err(_) => break,
                    }
                }
                let step = state.on_batch(&batch);
                dispatch(step, &ch, &mut rec_lagging).await;
            }
            Some(rep) = ch.exec_rx.recv() => {
                let now = cfg.clock.now(&state);
                let step = state.on_exec(rep, now);
                dispatch(step, &ch, &mut rec_lagging).await;
            }
            Ok(()) = ch.feed_status.changed() => {
                let st = *ch.feed_status.borrow();
                state.set_feed_state(st);
            }
            _ = timer.tick() => {
                let now = cfg.clock.now(&state);
                let step = state.on_timer(now);
                dispatch(step, &ch, &mut rec_lagging).await;
            }
            _ = heartbeat.tick() => {
                let total = state.ticks();
                let summary = state.summary();
                info!(
                    ticks = total - ticks_at_hb,
                    active = summary.active.len(),
                    daily_pnl = whole_units(summary.daily_pnl),
                    feed = %summary.feed,
                    "heartbeat"
                );
                ticks_at_hb = total;
            }
        }
    }

    // ---- shutdown: tutup feed, drain exit, tulis ledger ----
    ch.feed_shutdown.send_replace(true);
    if state.has_pending_exits() {
        info!(timeout_secs = cfg.drain_timeout.as_secs(), "draining pending exits");
        let deadline = sleep(cfg.drain_timeout);
        tokio::pin!(deadline);
        while state.has_pending_exits() {
            select! {
                _ = &mut deadline => {
                    warn!("drain timeout, pending exits left unresolved");
                    break;
                }
                Some(()) = ch.stop_rx.recv() => {
                    warn!("forced stop during drain");
                    forced = true;
                    break;
                }
                maybe = ch.exec_rx.recv() => {
                    let Some(rep) = maybe else { break };
                    let now = cfg.clock.now(&state);
                    let step = state.on_exec(rep, now);
                    dispatch(step, &ch, &mut rec_lagging).await;
                }
                _ = timer.tick() => {
                    let now = cfg.clock.now(&state);
                    let step = state.on_timer(now);
                    dispatch(step, &ch, &mut rec_lagging).await;
                }
            }
        }
    }

    let now = cfg.clock.now(&state);
    let ledger = state.ledger(now);
    if let Event::Ledger { positions, .. } = &ledger {
        for p in positions {
            warn!(
                symbol = %p.symbol,
                status = ?p.status,
                qty = p.quantity,
                entry = whole_units(p.entry_price),
                upnl = whole_units(p.unrealized_pnl),
                escalated = p.escalated,
                "non-terminal position at shutdown"
            );
        }
    }
    if let Some(rec) = &ch.rec_tx {
        if rec.send(ledger).await.is_err() {
            error!("recorder closed, ledger only in log");
        }
    }
    let summary = state.summary();
    info!(forced, "final summary: {summary}");

    // feed sudah diminta berhenti; error fatal (ConnectionExhausted) diteruskan
    match timeout(Duration::from_secs(5), feed).await {
        Ok(Ok(Ok(()))) => Ok(summary),
        Ok(Ok(Err(e))) => {
            error!(error = %e, "feed failed");
            Err(e.into())
        }
        Ok(Err(join)) => Err(EngineError::FeedTask(join.to_string())),
        Err(_) => {
            warn!("feed task did not stop in time");
            Ok(summary)
        }
    }
}
