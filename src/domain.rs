// ===============================
// src/domain.rs
// ===============================
//
// Harga disimpan sebagai i64 paise (px * 100), sama seperti skala 2 desimal di feed.
// Persentase disimpan sebagai f64 dalam satuan persen (1.5 = 1.5%).
//
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const PX_SCALE: i64 = 100;

/// Konversi harga desimal -> paise
pub fn to_px(v: f64) -> i64 { (v * PX_SCALE as f64).round() as i64 }
/// Konversi paise -> harga desimal (untuk log/REST)
pub fn from_px(px: i64) -> f64 { px as f64 / PX_SCALE as f64 }

/// P&L dalam satuan mata uang utuh, dipotong ke arah nol.
pub fn whole_units(paise: i64) -> i64 { paise / PX_SCALE }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side { Buy, Sell }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sector { Fmcg, It, Banking, Auto, Pharma, Metals, Realty }

impl Sector {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FMCG" => Some(Sector::Fmcg),
            "IT" => Some(Sector::It),
            "BANKING" | "BANK" => Some(Sector::Banking),
            "AUTO" => Some(Sector::Auto),
            "PHARMA" => Some(Sector::Pharma),
            "METALS" | "METAL" => Some(Sector::Metals),
            "REALTY" => Some(Sector::Realty),
            _ => None,
        }
    }

    /// Preferensi sektor untuk confidence (short paling nyaman di FMCG/IT)
    pub fn default_weight(&self) -> f64 {
        match self {
            Sector::Fmcg => 1.0,
            Sector::It => 0.9,
            Sector::Pharma => 0.7,
            Sector::Banking => 0.6,
            Sector::Metals => 0.5,
            Sector::Realty => 0.4,
            Sector::Auto => 0.3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Sector::Fmcg => "FMCG",
            Sector::It => "IT",
            Sector::Banking => "BANKING",
            Sector::Auto => "AUTO",
            Sector::Pharma => "PHARMA",
            Sector::Metals => "METALS",
            Sector::Realty => "REALTY",
        }
    }
}

/// Tick kanonik hasil normalizer. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    pub last_price: i64,
    pub volume: i64,
    pub bid: i64,
    pub ask: i64,
    pub open_price: Option<i64>,
    pub prev_close: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction { Short }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub sector: Sector,
    pub direction: Direction,
    pub entry_px: i64,
    pub gap_pct: f64,
    pub selling_pressure: f64,
    pub volume_ratio: f64,
    pub rsi: f64,
    pub confidence: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason { StopLoss, TimeExit, Target }

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TimeExit => "time_exit",
            ExitReason::Target => "target",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderIntent { Entry, Exit(ExitReason) }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub cl_id: String,
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub sector: Sector,
    pub side: Side,
    pub px: i64,
    pub qty: i64,
    pub stop_loss_px: i64,
    pub target_px: i64,
    pub intent: OrderIntent,
}

impl Order {
    pub fn notional(&self) -> i64 { self.px.saturating_mul(self.qty) }
}

/// Unknown = nasib order tidak diketahui (error transport, tidak ada status terminal).
/// Order mungkin tetap hidup di broker, jadi jangan dianggap ditolak.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecStatus { Ack, Filled, Rejected(String), Unknown(String) }

/// Laporan eksekusi dari broker, dikorelasikan lewat cl_id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecReport {
    pub cl_id: String,
    pub symbol: String,
    pub status: ExecStatus,
    pub filled_qty: i64,
    pub avg_px: i64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus { Pending, Open, Closing, Closed }

impl PositionStatus {
    pub fn is_active(&self) -> bool { !matches!(self, PositionStatus::Closed) }
}

/// Posisi short. Quantity selalu positif; arah short tersirat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub sector: Sector,
    pub entry_price: i64,
    pub quantity: i64,
    pub stop_loss_price: i64,
    pub target_price: i64,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub entry_cl_id: String,
    pub exit_cl_id: Option<String>,
    pub exit_reason: Option<ExitReason>,
    pub exit_attempts: u32,
    pub awaiting_since: Option<DateTime<Utc>>,
    pub last_price: i64,
    pub unrealized_pnl: i64,
    pub escalated: bool,
}

impl Position {
    pub fn pnl_at(&self, px: i64) -> i64 { (self.entry_price - px) * self.quantity }
    pub fn notional(&self) -> i64 { self.entry_price.saturating_mul(self.quantity) }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub sector: Sector,
    pub entry_price: i64,
    pub exit_price: i64,
    pub quantity: i64,
    pub reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub realized_pnl: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Tick(Tick),
    Sig(Signal),
    Ord(Order),
    Exec(ExecReport),
    /// snapshot setiap transisi status posisi
    Pos(Position),
    EntryRejected { symbol: String, cl_id: String, reason: String, ts: DateTime<Utc> },
    Closed(ClosedTrade),
    Escalation { symbol: String, reason: String, ts: DateTime<Utc> },
    Ledger { ts: DateTime<Utc>, positions: Vec<Position> },
    Note(String),
}
