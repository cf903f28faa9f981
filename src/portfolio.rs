// ===============================
// src/portfolio.rs
// ===============================
//
// Agregasi P&L realized + unrealized dan circuit breaker rugi harian.
// Breaker hanya mem-veto entry baru; posisi yang ada tetap dikelola normal.
//
use ahash::AHashMap as HashMap;
use chrono::NaiveDate;
use tracing::{error, info};

use crate::domain::{whole_units, Position, Sector};
use crate::metrics::{ACTIVE_POSITIONS, BREAKER, PNL_REALIZED, PNL_UNREALIZED, SECTOR_EXPOSURE};
use crate::risk::Rejection;

#[derive(Debug, Clone, Default)]
pub struct PortfolioState {
    pub active_count: usize,
    pub realized_pnl: i64,
    pub unrealized_pnl: i64,
    /// notional per sektor (paise) dari posisi Pending/Open/Closing
    pub sector_exposure: HashMap<Sector, i64>,
    pub breaker_tripped: bool,
    pub session: Option<NaiveDate>,
}

pub struct PortfolioMonitor {
    max_positions: usize,
    daily_loss_limit: i64,
    state: PortfolioState,
}

impl PortfolioMonitor {
    pub fn new(max_positions: usize, daily_loss_limit: i64) -> Self {
        Self { max_positions, daily_loss_limit: daily_loss_limit.abs(), state: PortfolioState::default() }
    }

    pub fn state(&self) -> &PortfolioState {
        &self.state
    }

    pub fn total_pnl(&self) -> i64 {
        self.state.realized_pnl + self.state.unrealized_pnl
    }

    /// Reset P&L harian + breaker saat tanggal sesi berganti. true kalau berganti.
    pub fn roll_session(&mut self, date: NaiveDate) -> bool {
        if self.state.session == Some(date) {
            return false;
        }
        if self.state.session.is_some() {
            info!(%date, realized = whole_units(self.state.realized_pnl), "new session, daily P&L reset");
        }
        self.state.session = Some(date);
        self.state.realized_pnl = 0;
        self.state.breaker_tripped = false;
        BREAKER.set(0);
        PNL_REALIZED.set(0);
        true
    }

    pub fn record_realized(&mut self, pnl: i64) {
        self.state.realized_pnl += pnl;
        PNL_REALIZED.set(self.state.realized_pnl);
        self.check_breaker();
    }

    /// Hitung ulang count/unrealized/exposure dari posisi aktif.
    pub fn refresh<'a, I: IntoIterator<Item = &'a Position>>(&mut self, positions: I) {
        let mut count = 0usize;
        let mut unrealized = 0i64;
        let mut exposure: HashMap<Sector, i64> = HashMap::new();
        for p in positions.into_iter().filter(|p| p.status.is_active()) {
            count += 1;
            unrealized += p.unrealized_pnl;
            *exposure.entry(p.sector).or_insert(0) += p.notional();
        }

        for (sector, old) in self.state.sector_exposure.iter() {
            if !exposure.contains_key(sector) && *old != 0 {
                SECTOR_EXPOSURE.with_label_values(&[sector.as_str()]).set(0);
            }
        }
        for (sector, v) in exposure.iter() {
            SECTOR_EXPOSURE.with_label_values(&[sector.as_str()]).set(*v);
        }

        if count > self.max_positions {
            error!(count, max = self.max_positions, "active positions above limit");
        }
        self.state.active_count = count;
        self.state.unrealized_pnl = unrealized;
        self.state.sector_exposure = exposure;
        ACTIVE_POSITIONS.set(count as i64);
        PNL_UNREALIZED.set(unrealized);
        self.check_breaker();
    }

    fn check_breaker(&mut self) {
        if self.state.breaker_tripped {
            return;
        }
        let total = self.total_pnl();
        if total < -self.daily_loss_limit {
            self.state.breaker_tripped = true;
            BREAKER.set(1);
            error!(
                total_pnl = whole_units(total),
                limit = whole_units(self.daily_loss_limit),
                "daily loss limit breached, new entries blocked"
            );
        }
    }

    pub fn allows_entry(&self) -> Result<(), Rejection> {
        if self.state.breaker_tripped {
            return Err(Rejection::CircuitBreakerTripped);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{to_px, PositionStatus};
    use chrono::Utc;

    fn pos(sym: &str, sector: Sector, entry: i64, qty: i64, last: i64, status: PositionStatus) -> Position {
        Position {
            symbol: sym.into(),
            sector,
            entry_price: entry,
            quantity: qty,
            stop_loss_price: entry + entry / 50,
            target_price: entry - entry / 20,
            opened_at: Utc::now(),
            status,
            entry_cl_id: format!("E-{sym}"),
            exit_cl_id: None,
            exit_reason: None,
            exit_attempts: 0,
            awaiting_since: None,
            last_price: last,
            unrealized_pnl: (entry - last) * qty,
            escalated: false,
        }
    }

    #[test]
    fn aggregates_active_positions_only() {
        let mut pm = PortfolioMonitor::new(3, to_px(20_000.0));
        let book = vec![
            pos("NSE:ITC-EQ", Sector::Fmcg, to_px(200.0), 100, to_px(199.0), PositionStatus::Open),
            pos("NSE:TCS-EQ", Sector::It, to_px(3000.0), 10, to_px(3010.0), PositionStatus::Closing),
            pos("NSE:SBIN-EQ", Sector::Banking, to_px(500.0), 10, to_px(400.0), PositionStatus::Closed),
        ];
        pm.refresh(book.iter());
        let st = pm.state();
        assert_eq!(st.active_count, 2);
        // +100 (ITC) dan -100 (TCS)
        assert_eq!(st.unrealized_pnl, 0);
        assert_eq!(st.sector_exposure.get(&Sector::Fmcg), Some(&to_px(20_000.0)));
        assert!(st.sector_exposure.get(&Sector::Banking).is_none());
    }

    #[test]
    fn breaker_trips_on_combined_loss_and_latches() {
        let mut pm = PortfolioMonitor::new(3, to_px(1_000.0));
        pm.record_realized(-to_px(600.0));
        assert!(pm.allows_entry().is_ok());

        // unrealized -500 -> total -1100 < -1000
        let open = pos("NSE:ITC-EQ", Sector::Fmcg, to_px(100.0), 100, to_px(105.0), PositionStatus::Open);
        pm.refresh([open.clone()].iter());
        assert_eq!(pm.allows_entry(), Err(Rejection::CircuitBreakerTripped));
        // posisi tidak disentuh
        assert_eq!(pm.state().active_count, 1);

        // harga pulih, breaker tetap latched
        let mut recovered = open;
        recovered.unrealized_pnl = to_px(500.0);
        pm.refresh([recovered].iter());
        assert!(pm.state().breaker_tripped);
    }

    #[test]
    fn loss_exactly_at_limit_does_not_trip() {
        let mut pm = PortfolioMonitor::new(3, to_px(1_000.0));
        pm.record_realized(-to_px(1_000.0));
        assert!(pm.allows_entry().is_ok());
        pm.record_realized(-1);
        assert!(pm.allows_entry().is_err());
    }

    #[test]
    fn new_session_resets_breaker_and_realized() {
        let mut pm = PortfolioMonitor::new(3, to_px(1_000.0));
        let d1 = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert!(pm.roll_session(d1));
        pm.record_realized(-to_px(2_000.0));
        assert!(pm.state().breaker_tripped);
        assert!(!pm.roll_session(d1));
        assert!(pm.state().breaker_tripped);
        assert!(pm.roll_session(d2));
        assert!(!pm.state().breaker_tripped);
        assert_eq!(pm.state().realized_pnl, 0);
    }
}
