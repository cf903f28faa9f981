// ===============================
// src/strategy.rs
// ===============================
//
// Gap-up short (fade the gap):
//   Ide: saham dibuka gap-up dari prior close, lalu muncul tekanan jual
//        (harga berbalik turun dari session high + lonjakan volume + RSI melemah)
//        -> Short.
//   Kapan cocok:
//     - Awal sesi (signal window), ketika gap pembukaan mulai terisi.
//   Risiko:
//     - Gap-and-go (trend lanjut naik) -> dijaga stop-loss di modul positions.
//
// State per symbol dimiliki eksklusif oleh SignalEngine, di-update hanya
// saat tick symbol tersebut datang. Semua update O(1).
//
use ahash::AHashMap as HashMap;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info};

use crate::config::{ConfidenceWeights, PressureWeights, StrategyConfig, SymbolSpec};
use crate::domain::{Direction, Sector, Signal, Tick};
use crate::hours::MarketHours;
use crate::indicators::{RollingWindow, Rsi};
use crate::metrics::{SIGNALS, SIGNALS_BY};

const NEUTRAL_RSI: f64 = 50.0;

fn clamp01(x: f64) -> f64 {
    if x.is_nan() { 0.0 } else { x.clamp(0.0, 1.0) }
}

/// Hasil update satu tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub gap_pct: Option<f64>,
    pub reversal_pct: f64,
    pub volume_ratio: f64,
    pub rsi: f64,
}

#[derive(Debug, Clone)]
pub struct SymbolState {
    pub sector: Sector,
    pub session: Option<NaiveDate>,
    pub open_price: Option<i64>,
    pub prev_close: Option<i64>,
    pub session_high: i64,
    pub prices: RollingWindow,
    pub volumes: RollingWindow,
    rsi: Rsi,
    pub last_rsi: Option<f64>,
    pub last_gap_pct: Option<f64>,
    pub last_confidence: f64,
    pub last_ts: Option<DateTime<Utc>>,
}

impl SymbolState {
    pub fn new(sector: Sector, window: usize, rsi_period: usize) -> Self {
        Self {
            sector,
            session: None,
            open_price: None,
            prev_close: None,
            session_high: 0,
            prices: RollingWindow::new(window),
            volumes: RollingWindow::new(window),
            rsi: Rsi::new(rsi_period),
            last_rsi: None,
            last_gap_pct: None,
            last_confidence: 0.0,
            last_ts: None,
        }
    }

    fn reset_session(&mut self, session: NaiveDate, window: usize, rsi_period: usize) {
        *self = SymbolState::new(self.sector, window, rsi_period);
        self.session = Some(session);
    }

    pub fn update(&mut self, tick: &Tick) -> Observation {
        if let Some(pc) = tick.prev_close {
            self.prev_close = Some(pc);
        }
        match (tick.open_price, self.open_price) {
            (Some(o), _) => self.open_price = Some(o),
            (None, None) => self.open_price = Some(tick.last_price),
            _ => {}
        }
        self.session_high = self
            .session_high
            .max(tick.last_price)
            .max(self.open_price.unwrap_or(0));

        // rasio volume dihitung terhadap rata-rata tick sebelumnya
        let volume_ratio = match self.volumes.mean() {
            Some(avg) if avg > 0.0 => tick.volume as f64 / avg,
            _ => 0.0,
        };
        self.volumes.push(tick.volume);
        self.prices.push(tick.last_price);
        if let Some(r) = self.rsi.update(tick.last_price) {
            self.last_rsi = Some(r);
        }
        self.last_ts = Some(tick.ts);

        let gap_pct = match (self.open_price, self.prev_close) {
            (Some(o), Some(pc)) if pc > 0 => Some((o - pc) as f64 / pc as f64 * 100.0),
            _ => None,
        };
        self.last_gap_pct = gap_pct;

        let reversal_pct = if self.session_high > 0 {
            (self.session_high - tick.last_price).max(0) as f64 / self.session_high as f64 * 100.0
        } else {
            0.0
        };

        Observation {
            gap_pct,
            reversal_pct,
            volume_ratio,
            rsi: self.last_rsi.unwrap_or(NEUTRAL_RSI),
        }
    }
}

/// Skor tekanan jual [0, 100]. Monoton naik terhadap reversal dan volume ratio.
pub fn selling_pressure(obs: &Observation, w: &PressureWeights) -> f64 {
    let rev = if w.reversal_full_pct > 0.0 { clamp01(obs.reversal_pct / w.reversal_full_pct) } else { 0.0 };
    let vol = if w.volume_full_ratio > 1.0 {
        clamp01((obs.volume_ratio - 1.0) / (w.volume_full_ratio - 1.0))
    } else if obs.volume_ratio >= 1.0 {
        1.0
    } else {
        0.0
    };
    let mom = clamp01((100.0 - obs.rsi) / 100.0);
    let total = w.reversal + w.volume + w.momentum;
    if total <= 0.0 {
        return 0.0;
    }
    100.0 * (w.reversal * rev + w.volume * vol + w.momentum * mom) / total
}

/// Confidence [0, 1]; deterministik dari input yang sama.
pub fn confidence(pressure: f64, volume_ratio: f64, gap_pct: f64, sector_weight: f64, w: &ConfidenceWeights) -> f64 {
    let total = w.pressure + w.volume + w.gap + w.sector;
    if total <= 0.0 {
        return 0.0;
    }
    let vol = if w.volume_full_ratio > 0.0 { clamp01(volume_ratio / w.volume_full_ratio) } else { 0.0 };
    let gap = if w.gap_full_pct > 0.0 { clamp01(gap_pct / w.gap_full_pct) } else { 0.0 };
    let raw = w.pressure * clamp01(pressure / 100.0) + w.volume * vol + w.gap * gap + w.sector * clamp01(sector_weight);
    clamp01(raw / total)
}

/// Urutkan kandidat: confidence tertinggi dulu, lalu nama symbol (deterministik)
pub fn rank(signals: &mut [Signal]) {
    signals.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
}

pub struct SignalEngine {
    cfg: StrategyConfig,
    hours: MarketHours,
    sectors: HashMap<String, Sector>,
    states: HashMap<String, SymbolState>,
}

impl SignalEngine {
    pub fn new(cfg: StrategyConfig, hours: MarketHours, universe: &[SymbolSpec]) -> Self {
        let sectors = universe.iter().map(|s| (s.symbol.clone(), s.sector)).collect();
        Self { cfg, hours, sectors, states: HashMap::new() }
    }

    pub fn state(&self, symbol: &str) -> Option<&SymbolState> {
        self.states.get(symbol)
    }

    fn update(&mut self, tick: &Tick) -> Option<(Sector, Observation)> {
        let sector = *self.sectors.get(&tick.symbol)?;
        let session = self.hours.session_date(tick.ts);
        let (window, period) = (self.cfg.price_window, self.cfg.rsi_period);
        let st = self
            .states
            .entry(tick.symbol.clone())
            .or_insert_with(|| SymbolState::new(sector, window, period));
        if st.session != Some(session) {
            st.reset_session(session, window, period);
        }
        Some((sector, st.update(tick)))
    }

    /// Update state tanpa menghasilkan sinyal (symbol yang sedang punya posisi)
    pub fn observe(&mut self, tick: &Tick) {
        let _ = self.update(tick);
    }

    /// Filter breadth: mayoritas bellwether harus gap-up. Kosong = nonaktif.
    pub fn breadth_ok(&self) -> bool {
        if self.cfg.bellwethers.is_empty() {
            return true;
        }
        let mut total = 0usize;
        let mut up = 0usize;
        for sym in &self.cfg.bellwethers {
            if let Some(gap) = self.states.get(sym).and_then(|s| s.last_gap_pct) {
                total += 1;
                if gap > self.cfg.breadth_min_gap_pct {
                    up += 1;
                }
            }
        }
        total > 0 && (up as f64 / total as f64) > self.cfg.breadth_min_ratio
    }

    /// Dipanggil hanya untuk symbol tanpa posisi aktif.
    pub fn evaluate(&mut self, tick: &Tick) -> Option<Signal> {
        let (sector, obs) = self.update(tick)?;
        let gap_pct = obs.gap_pct?;

        if !self.hours.in_signal_window(tick.ts) {
            return None;
        }
        if gap_pct < self.cfg.min_gap_pct {
            return None;
        }
        let pressure = selling_pressure(&obs, &self.cfg.pressure);
        if pressure < self.cfg.min_selling_pressure {
            return None;
        }
        if obs.volume_ratio < self.cfg.min_volume_ratio {
            return None;
        }
        let sector_weight = self.cfg.sector_weights.get(&sector).copied().unwrap_or(0.5);
        let conf = confidence(pressure, obs.volume_ratio, gap_pct, sector_weight, &self.cfg.confidence);
        if let Some(st) = self.states.get_mut(&tick.symbol) {
            st.last_confidence = conf;
        }
        if conf < self.cfg.min_confidence {
            debug!(symbol = %tick.symbol, confidence = conf, "confidence below threshold");
            return None;
        }
        if !self.breadth_ok() {
            debug!(symbol = %tick.symbol, "market breadth filter blocked signal");
            return None;
        }

        SIGNALS.inc();
        SIGNALS_BY.with_label_values(&[sector.as_str(), &tick.symbol]).inc();
        info!(
            symbol = %tick.symbol,
            gap_pct,
            pressure,
            volume_ratio = obs.volume_ratio,
            confidence = conf,
            "short signal"
        );
        Some(Signal {
            symbol: tick.symbol.clone(),
            sector,
            direction: Direction::Short,
            entry_px: tick.last_price,
            gap_pct,
            selling_pressure: pressure,
            volume_ratio: obs.volume_ratio,
            rsi: obs.rsi,
            confidence: conf,
            ts: tick.ts,
        })
    }
}
