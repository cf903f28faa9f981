// ===============================
// src/normalizer.rs
// ===============================
//
// Raw quote (JSON) -> Tick kanonik.
// Drop: payload rusak, symbol di luar subscription, di luar jam pasar,
// dan timestamp yang tidak lebih besar dari tick terakhir yang diterima (per symbol).
//
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{to_px, Tick};
use crate::hours::MarketHours;
use crate::metrics::{TICKS, TICKS_BY_SYMBOL, TICKS_DROPPED};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    Unsubscribed,
    OutOfHours,
    Stale,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::Unsubscribed => "unsubscribed",
            DropReason::OutOfHours => "out_of_hours",
            DropReason::Stale => "stale",
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DropStats {
    pub malformed: u64,
    pub unsubscribed: u64,
    pub out_of_hours: u64,
    pub stale: u64,
}

pub struct Normalizer {
    subscribed: HashSet<String>,
    last_ts: HashMap<String, DateTime<Utc>>,
    hours: MarketHours,
    pub stats: DropStats,
}

fn field_f64(v: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match v.get(*k)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

fn field_str<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| v.get(*k).and_then(|x| x.as_str()))
}

/// Epoch detik atau milidetik (>= 1e12 dianggap ms)
fn parse_ts(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() || raw <= 0.0 {
        return None;
    }
    let ms = if raw >= 1e12 { raw as i64 } else { (raw * 1000.0) as i64 };
    Utc.timestamp_millis_opt(ms).single()
}

fn positive_px(v: Option<f64>) -> Option<i64> {
    v.filter(|x| x.is_finite() && *x > 0.0).map(to_px)
}

/// Parse raw quote tanpa validasi state (subscription / jam / urutan).
pub fn parse_quote(v: &Value) -> Option<Tick> {
    let symbol = field_str(v, &["symbol", "s"])?.trim().to_ascii_uppercase();
    if symbol.is_empty() {
        return None;
    }
    let last_price = positive_px(field_f64(v, &["ltp", "last_price", "lp"]))?;
    let ts = parse_ts(field_f64(v, &["exch_feed_time", "timestamp", "ts"])?)?;
    let volume = match field_f64(v, &["last_traded_qty", "volume", "vol"]) {
        Some(q) if q.is_finite() && q >= 0.0 => q as i64,
        Some(_) => return None,
        None => 0,
    };
    let bid = positive_px(field_f64(v, &["bid_price", "bid"])).unwrap_or(last_price);
    let ask = positive_px(field_f64(v, &["ask_price", "ask"])).unwrap_or(last_price);
    Some(Tick {
        symbol,
        ts,
        last_price,
        volume,
        bid,
        ask,
        open_price: positive_px(field_f64(v, &["open_price", "open"])),
        prev_close: positive_px(field_f64(v, &["prev_close_price", "prev_close"])),
    })
}

impl Normalizer {
    pub fn new<I: IntoIterator<Item = String>>(symbols: I, hours: MarketHours) -> Self {
        Self {
            subscribed: symbols.into_iter().map(|s| s.to_ascii_uppercase()).collect(),
            last_ts: HashMap::new(),
            hours,
            stats: DropStats::default(),
        }
    }

    fn reject(&mut self, reason: DropReason, symbol: &str) -> Option<Tick> {
        match reason {
            DropReason::Malformed => self.stats.malformed += 1,
            DropReason::Unsubscribed => self.stats.unsubscribed += 1,
            DropReason::OutOfHours => self.stats.out_of_hours += 1,
            DropReason::Stale => self.stats.stale += 1,
        }
        TICKS_DROPPED.with_label_values(&[reason.as_str()]).inc();
        debug!(%symbol, reason = reason.as_str(), "tick dropped");
        None
    }

    pub fn normalize(&mut self, raw: &str) -> Option<Tick> {
        match serde_json::from_str::<Value>(raw) {
            Ok(v) => self.normalize_value(&v),
            Err(e) => {
                warn!(?e, "malformed market data payload");
                self.reject(DropReason::Malformed, "?")
            }
        }
    }

    pub fn normalize_value(&mut self, v: &Value) -> Option<Tick> {
        let tick = match parse_quote(v) {
            Some(t) => t,
            None => {
                warn!(payload = %v, "malformed market data payload");
                return self.reject(DropReason::Malformed, "?");
            }
        };
        if !self.subscribed.contains(&tick.symbol) {
            return self.reject(DropReason::Unsubscribed, &tick.symbol);
        }
        if !self.hours.is_trading_time(tick.ts) {
            return self.reject(DropReason::OutOfHours, &tick.symbol);
        }
        if let Some(prev) = self.last_ts.get(&tick.symbol) {
            if tick.ts <= *prev {
                return self.reject(DropReason::Stale, &tick.symbol);
            }
        }
        self.last_ts.insert(tick.symbol.clone(), tick.ts);
        TICKS.inc();
        TICKS_BY_SYMBOL.with_label_values(&[&tick.symbol]).inc();
        Some(tick)
    }
}
