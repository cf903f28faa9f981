// ===============================
// src/risk.rs
// ===============================
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::config::StrategyConfig;
use crate::domain::{Order, OrderIntent, Sector, Side, Signal};
use crate::metrics::{ORDERS, REJECTIONS};
use crate::portfolio::PortfolioMonitor;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("daily loss circuit breaker tripped")]
    CircuitBreakerTripped,
    #[error("max positions reached ({0})")]
    MaxPositions(usize),
    #[error("per-trade risk {risk} exceeds budget {budget}")]
    RiskLimitExceeded { risk: i64, budget: i64 },
    #[error("sector {sector:?} exposure {exposure} would exceed cap {cap}")]
    SectorExposure { sector: Sector, exposure: i64, cap: i64 },
    #[error("computed size is zero (budget {budget}, stop distance {distance})")]
    SizeTooSmall { budget: i64, distance: i64 },
    #[error("invalid entry price {0}")]
    InvalidPrice(i64),
}

impl Rejection {
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::CircuitBreakerTripped => "circuit_breaker",
            Rejection::MaxPositions(_) => "max_positions",
            Rejection::RiskLimitExceeded { .. } => "risk_limit",
            Rejection::SectorExposure { .. } => "sector_exposure",
            Rejection::SizeTooSmall { .. } => "size_too_small",
            Rejection::InvalidPrice(_) => "invalid_price",
        }
    }
}

/// Harga stop-loss short: entry × (1 + pct)
pub fn stop_loss_px(entry: i64, stop_loss_pct: f64) -> i64 {
    (entry as f64 * (1.0 + stop_loss_pct / 100.0)).round() as i64
}

/// Harga target short: entry × (1 − pct)
pub fn target_px(entry: i64, target_pct: f64) -> i64 {
    (entry as f64 * (1.0 - target_pct / 100.0)).round() as i64
}

/// Risk budget per trade (paise)
pub fn risk_budget(portfolio_value: i64, risk_per_trade_pct: f64) -> i64 {
    (portfolio_value as f64 * risk_per_trade_pct / 100.0).floor() as i64
}

pub struct RiskManager {
    cfg: StrategyConfig,
    seq: u64,
}

impl RiskManager {
    pub fn new(cfg: StrategyConfig) -> Self {
        Self { cfg, seq: 0 }
    }

    /// cl_id unik dan deterministik (replay menghasilkan id yang sama)
    pub fn next_cl_id(&mut self, prefix: &str, ts: DateTime<Utc>) -> String {
        self.seq += 1;
        format!("{}-{}-{}", prefix, ts.timestamp_millis(), self.seq)
    }

    /// Pre-trade checks -> jika lolos, konversi Signal menjadi Order short
    pub fn check(&mut self, sig: &Signal, portfolio: &PortfolioMonitor) -> Result<Order, Rejection> {
        // 1) veto circuit breaker
        portfolio.allows_entry()?;

        // 2) kapasitas posisi
        let state = portfolio.state();
        if state.active_count >= self.cfg.max_positions {
            return Err(Rejection::MaxPositions(self.cfg.max_positions));
        }

        // 3) harga & jarak stop
        let entry = sig.entry_px;
        if entry <= 0 {
            return Err(Rejection::InvalidPrice(entry));
        }
        let stop = stop_loss_px(entry, self.cfg.stop_loss_pct);
        let target = target_px(entry, self.cfg.target_pct);
        let distance = stop - entry;
        if distance <= 0 || target <= 0 {
            return Err(Rejection::InvalidPrice(entry));
        }

        // 4) sizing: floor(budget / distance)
        let budget = risk_budget(self.cfg.portfolio_value, self.cfg.risk_per_trade_pct);
        let qty = budget / distance;
        if qty <= 0 {
            return Err(Rejection::SizeTooSmall { budget, distance });
        }
        let risk = qty.saturating_mul(distance);
        if risk > budget {
            return Err(Rejection::RiskLimitExceeded { risk, budget });
        }

        // 5) exposure sektor
        let cap = (self.cfg.portfolio_value as f64 * self.cfg.max_sector_exposure_pct / 100.0).floor() as i64;
        let current = state.sector_exposure.get(&sig.sector).copied().unwrap_or(0);
        let exposure = current.saturating_add(entry.saturating_mul(qty));
        if exposure > cap {
            return Err(Rejection::SectorExposure { sector: sig.sector, exposure, cap });
        }

        Ok(Order {
            cl_id: self.next_cl_id("GS", sig.ts),
            ts: sig.ts,
            symbol: sig.symbol.clone(),
            sector: sig.sector,
            side: Side::Sell,
            px: entry,
            qty,
            stop_loss_px: stop,
            target_px: target,
            intent: OrderIntent::Entry,
        })
    }

    /// Sama dengan `check`, plus metrics & log
    pub fn size(&mut self, sig: &Signal, portfolio: &PortfolioMonitor) -> Result<Order, Rejection> {
        match self.check(sig, portfolio) {
            Ok(ord) => {
                ORDERS.inc();
                Ok(ord)
            }
            Err(e) => {
                REJECTIONS.with_label_values(&[e.label()]).inc();
                warn!(symbol = %sig.symbol, reason = %e, "risk rejected");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{to_px, Direction, Position, PositionStatus};
    use chrono::TimeZone;
    use rand::{Rng, SeedableRng};

    fn signal(sym: &str, sector: Sector, entry: i64) -> Signal {
        Signal {
            symbol: sym.into(),
            sector,
            direction: Direction::Short,
            entry_px: entry,
            gap_pct: 1.0,
            selling_pressure: 60.0,
            volume_ratio: 2.0,
            rsi: 45.0,
            confidence: 0.8,
            ts: Utc.with_ymd_and_hms(2024, 3, 4, 4, 0, 0).unwrap(),
        }
    }

    fn monitor(cfg: &StrategyConfig) -> PortfolioMonitor {
        PortfolioMonitor::new(cfg.max_positions, cfg.daily_loss_limit)
    }

    fn open_position(sym: &str, sector: Sector, entry: i64, qty: i64) -> Position {
        Position {
            symbol: sym.into(),
            sector,
            entry_price: entry,
            quantity: qty,
            stop_loss_price: stop_loss_px(entry, 1.5),
            target_price: target_px(entry, 3.0),
            opened_at: Utc::now(),
            status: PositionStatus::Open,
            entry_cl_id: format!("E-{sym}"),
            exit_cl_id: None,
            exit_reason: None,
            exit_attempts: 0,
            awaiting_since: None,
            last_price: entry,
            unrealized_pnl: 0,
            escalated: false,
        }
    }

    #[test]
    fn sizes_end_to_end_example() {
        let cfg = StrategyConfig::default();
        let mut rm = RiskManager::new(cfg.clone());
        let ord = rm.check(&signal("NSE:ITC-EQ", Sector::Fmcg, to_px(200.0)), &monitor(&cfg)).unwrap();
        assert_eq!(ord.stop_loss_px, to_px(203.0));
        assert_eq!(ord.target_px, to_px(194.0));
        assert_eq!(ord.qty, 3333);
        assert_eq!(ord.side, Side::Sell);
        assert_eq!(ord.intent, OrderIntent::Entry);
    }

    #[test]
    fn stop_and_target_for_entry_100() {
        assert_eq!(stop_loss_px(to_px(100.0), 1.5), to_px(101.5));
        assert_eq!(target_px(to_px(100.0), 3.0), to_px(97.0));
    }

    #[test]
    fn rejects_zero_size() {
        let mut cfg = StrategyConfig::default();
        cfg.portfolio_value = to_px(100.0);
        cfg.max_sector_exposure_pct = 100_000.0;
        let mut rm = RiskManager::new(cfg.clone());
        let r = rm.check(&signal("NSE:MRF-EQ", Sector::Auto, to_px(100_000.0)), &monitor(&cfg));
        assert!(matches!(r, Err(Rejection::SizeTooSmall { .. })));
    }

    #[test]
    fn rejects_when_max_positions_reached() {
        let mut cfg = StrategyConfig::default();
        cfg.max_positions = 1;
        let mut pm = monitor(&cfg);
        pm.refresh([open_position("NSE:TCS-EQ", Sector::It, to_px(10.0), 10)].iter());
        let mut rm = RiskManager::new(cfg);
        let r = rm.check(&signal("NSE:ITC-EQ", Sector::Fmcg, to_px(200.0)), &pm);
        assert_eq!(r.unwrap_err(), Rejection::MaxPositions(1));
    }

    #[test]
    fn rejects_sector_overexposure() {
        let cfg = StrategyConfig::default();
        let mut pm = monitor(&cfg);
        // 400k notional FMCG terpakai; entry baru 666.6k -> lewat cap 1M
        pm.refresh([open_position("NSE:ITC-EQ", Sector::Fmcg, to_px(400.0), 1000)].iter());
        let mut rm = RiskManager::new(cfg);
        let r = rm.check(&signal("NSE:COLPAL-EQ", Sector::Fmcg, to_px(200.0)), &pm);
        assert!(matches!(r, Err(Rejection::SectorExposure { sector: Sector::Fmcg, .. })));
        // sektor lain masih boleh
        assert!(rm.check(&signal("NSE:TCS-EQ", Sector::It, to_px(200.0)), &pm).is_ok());
    }

    #[test]
    fn breaker_vetoes_entries() {
        let cfg = StrategyConfig::default();
        let mut pm = monitor(&cfg);
        pm.record_realized(-cfg.daily_loss_limit - 1);
        let mut rm = RiskManager::new(cfg);
        let r = rm.check(&signal("NSE:ITC-EQ", Sector::Fmcg, to_px(200.0)), &pm);
        assert_eq!(r.unwrap_err(), Rejection::CircuitBreakerTripped);
    }

    #[test]
    fn accepted_orders_never_exceed_risk_budget() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for _ in 0..500 {
            let mut cfg = StrategyConfig::default();
            cfg.risk_per_trade_pct = rng.gen_range(0.1..3.0);
            cfg.stop_loss_pct = rng.gen_range(0.2..5.0);
            cfg.max_sector_exposure_pct = 1_000.0;
            let budget = risk_budget(cfg.portfolio_value, cfg.risk_per_trade_pct);
            let mut rm = RiskManager::new(cfg.clone());
            let entry = rng.gen_range(100..5_000_000);
            if let Ok(ord) = rm.check(&signal("NSE:X-EQ", Sector::It, entry), &monitor(&cfg)) {
                assert!(ord.qty > 0);
                assert!(ord.qty * (ord.stop_loss_px - ord.px) <= budget);
            }
        }
    }

    #[test]
    fn cl_ids_are_unique() {
        let cfg = StrategyConfig::default();
        let mut rm = RiskManager::new(cfg.clone());
        let pm = monitor(&cfg);
        let a = rm.check(&signal("NSE:ITC-EQ", Sector::Fmcg, to_px(200.0)), &pm).unwrap();
        let b = rm.check(&signal("NSE:TCS-EQ", Sector::It, to_px(200.0)), &pm).unwrap();
        assert_ne!(a.cl_id, b.cl_id);
    }
}
