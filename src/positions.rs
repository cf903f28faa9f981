// ===============================
// src/positions.rs (Position book & exit manager)
// ===============================
//
// Pending -> Open (fill entry) -> Closing (trigger exit) -> Closed (fill exit).
// Exit dicek tiap tick dengan prioritas stop > time > target.
// Reject exit di-retry sampai `max_exit_retries`, lalu eskalasi (posisi tetap dilacak).
// Outcome Unknown langsung eskalasi, tanpa kirim ulang.
//
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::domain::{
    whole_units, ClosedTrade, Event, ExecReport, ExecStatus, ExitReason, Order, OrderIntent, Position,
    PositionStatus, Side, Tick,
};
use crate::hours::MarketHours;
use crate::metrics::{ESCALATIONS, EXITS};

#[derive(Clone, Debug)]
pub struct BookConfig {
    pub max_exit_retries: u32,
    pub ack_timeout: chrono::Duration,
}

/// Hasil satu langkah book: order exit untuk broker, event untuk recorder,
/// dan realized P&L yang harus dibukukan ke portfolio.
#[derive(Debug, Default)]
pub struct BookOutput {
    pub orders: Vec<Order>,
    pub events: Vec<Event>,
    pub realized: Vec<i64>,
}

impl BookOutput {
    fn merge(&mut self, other: BookOutput) {
        self.orders.extend(other.orders);
        self.events.extend(other.events);
        self.realized.extend(other.realized);
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty() && self.events.is_empty() && self.realized.is_empty()
    }
}

/// Exit yang harus diambil untuk harga `px` pada waktu `ts`, kalau ada.
pub fn exit_decision(p: &Position, px: i64, ts: DateTime<Utc>, hours: &MarketHours) -> Option<ExitReason> {
    if px >= p.stop_loss_price {
        Some(ExitReason::StopLoss)
    } else if hours.past_eod_cutoff(ts) {
        Some(ExitReason::TimeExit)
    } else if px <= p.target_price {
        Some(ExitReason::Target)
    } else {
        None
    }
}

pub struct PositionBook {
    cfg: BookConfig,
    hours: MarketHours,
    positions: HashMap<String, Position>,
    /// cl_id -> symbol (entry & exit yang masih ditunggu)
    by_cl_id: HashMap<String, String>,
    closed: Vec<ClosedTrade>,
    exit_seq: u64,
}

impl PositionBook {
    pub fn new(cfg: BookConfig, hours: MarketHours) -> Self {
        Self {
            cfg,
            hours,
            positions: HashMap::new(),
            by_cl_id: HashMap::new(),
            closed: Vec::new(),
            exit_seq: 0,
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Pending/Open/Closing -> symbol tidak boleh menghasilkan sinyal baru
    pub fn is_active(&self, symbol: &str) -> bool {
        self.positions.get(symbol).map(|p| p.status.is_active()).unwrap_or(false)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn closed(&self) -> &[ClosedTrade] {
        &self.closed
    }

    /// Posisi non-terminal, urut symbol (untuk ledger)
    pub fn non_terminal(&self) -> Vec<Position> {
        let mut v: Vec<Position> = self.positions.values().filter(|p| p.status.is_active()).cloned().collect();
        v.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        v
    }

    pub fn has_pending_exits(&self) -> bool {
        self.positions.values().any(|p| p.status == PositionStatus::Closing && !p.escalated)
    }

    /// Order entry yang disetujui risk -> posisi Pending.
    pub fn open_pending(&mut self, ord: &Order, now: DateTime<Utc>) -> Option<Event> {
        if self.is_active(&ord.symbol) {
            warn!(symbol = %ord.symbol, "position already active, entry ignored");
            return None;
        }
        let p = Position {
            symbol: ord.symbol.clone(),
            sector: ord.sector,
            entry_price: ord.px,
            quantity: ord.qty,
            stop_loss_price: ord.stop_loss_px,
            target_price: ord.target_px,
            opened_at: ord.ts,
            status: PositionStatus::Pending,
            entry_cl_id: ord.cl_id.clone(),
            exit_cl_id: None,
            exit_reason: None,
            exit_attempts: 0,
            awaiting_since: Some(now),
            last_price: ord.px,
            unrealized_pnl: 0,
            escalated: false,
        };
        self.by_cl_id.insert(ord.cl_id.clone(), ord.symbol.clone());
        self.positions.insert(ord.symbol.clone(), p.clone());
        Some(Event::Pos(p))
    }

    fn next_exit_id(&mut self, ts: DateTime<Utc>) -> String {
        self.exit_seq += 1;
        format!("GX-{}-{}", ts.timestamp_millis(), self.exit_seq)
    }

    /// Buat order exit (buy-to-cover) dan tandai posisi Closing.
    fn submit_exit(&mut self, symbol: &str, reason: ExitReason, px: i64, ts: DateTime<Utc>) -> BookOutput {
        let mut out = BookOutput::default();
        let cl_id = self.next_exit_id(ts);
        let Some(p) = self.positions.get_mut(symbol) else { return out };

        if let Some(old) = p.exit_cl_id.replace(cl_id.clone()) {
            self.by_cl_id.remove(&old);
        }
        p.status = PositionStatus::Closing;
        p.exit_reason = Some(reason);
        p.exit_attempts += 1;
        p.awaiting_since = Some(ts);
        self.by_cl_id.insert(cl_id.clone(), symbol.to_string());

        info!(
            %symbol,
            %reason,
            px = whole_units(px),
            attempt = p.exit_attempts,
            "exit triggered"
        );
        out.orders.push(Order {
            cl_id,
            ts,
            symbol: p.symbol.clone(),
            sector: p.sector,
            side: Side::Buy,
            px,
            qty: p.quantity,
            stop_loss_px: p.stop_loss_price,
            target_px: p.target_price,
            intent: OrderIntent::Exit(reason),
        });
        out.events.push(Event::Pos(p.clone()));
        out
    }

    fn escalate(&mut self, symbol: &str, why: String, ts: DateTime<Utc>) -> BookOutput {
        let mut out = BookOutput::default();
        let Some(p) = self.positions.get_mut(symbol) else { return out };
        if p.escalated {
            return out;
        }
        p.escalated = true;
        ESCALATIONS.inc();
        error!(%symbol, status = ?p.status, reason = %why, "position escalated, manual attention required");
        out.events.push(Event::Escalation { symbol: symbol.to_string(), reason: why, ts });
        out.events.push(Event::Pos(p.clone()));
        out
    }

    /// Tick untuk symbol yang punya posisi.
    pub fn on_tick(&mut self, tick: &Tick) -> BookOutput {
        let Some(p) = self.positions.get_mut(&tick.symbol) else { return BookOutput::default() };
        match p.status {
            PositionStatus::Open | PositionStatus::Closing => {
                p.last_price = tick.last_price;
                p.unrealized_pnl = p.pnl_at(tick.last_price);
            }
            _ => return BookOutput::default(),
        }
        if p.status != PositionStatus::Open {
            return BookOutput::default();
        }
        match exit_decision(p, tick.last_price, tick.ts, &self.hours) {
            Some(reason) => {
                let symbol = tick.symbol.clone();
                self.submit_exit(&symbol, reason, tick.last_price, tick.ts)
            }
            None => BookOutput::default(),
        }
    }

    /// Timer periodik: time-exit untuk symbol yang sepi + timeout ack.
    pub fn on_timer(&mut self, now: DateTime<Utc>) -> BookOutput {
        let mut out = BookOutput::default();
        let mut symbols: Vec<String> = self.positions.keys().cloned().collect();
        symbols.sort();

        for sym in symbols {
            let Some(p) = self.positions.get(&sym) else { continue };
            match p.status {
                PositionStatus::Open if self.hours.past_eod_cutoff(now) => {
                    let px = p.last_price;
                    out.merge(self.submit_exit(&sym, ExitReason::TimeExit, px, now));
                }
                PositionStatus::Pending | PositionStatus::Closing if !p.escalated => {
                    if let Some(since) = p.awaiting_since {
                        if now - since >= self.cfg.ack_timeout {
                            let why = format!("no broker response for {:?} order within {}s", p.status, self.cfg.ack_timeout.num_seconds());
                            out.merge(self.escalate(&sym, why, now));
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }

    pub fn on_exec(&mut self, rep: &ExecReport) -> BookOutput {
        let Some(symbol) = self.by_cl_id.get(&rep.cl_id).cloned() else {
            debug!(cl_id = %rep.cl_id, "exec report for unknown cl_id");
            return BookOutput::default();
        };
        let Some(p) = self.positions.get(&symbol) else {
            self.by_cl_id.remove(&rep.cl_id);
            return BookOutput::default();
        };
        let is_entry = p.entry_cl_id == rep.cl_id;

        match (&rep.status, is_entry) {
            (ExecStatus::Ack, _) => {
                if let Some(p) = self.positions.get_mut(&symbol) {
                    p.awaiting_since = Some(rep.ts);
                }
                BookOutput::default()
            }
            (ExecStatus::Filled, true) => self.entry_filled(&symbol, rep),
            (ExecStatus::Rejected(why), true) => self.entry_rejected(&symbol, rep, why.clone()),
            (ExecStatus::Filled, false) => self.exit_filled(&symbol, rep),
            (ExecStatus::Rejected(why), false) => self.exit_rejected(&symbol, rep, why.clone()),
            (ExecStatus::Unknown(why), _) => self.outcome_unknown(&symbol, rep, why.clone()),
        }
    }

    /// Order mungkin masih hidup di broker: jangan kirim ulang, jangan buang posisi.
    /// cl_id tetap dipetakan supaya fill yang telat masih dibukukan.
    fn outcome_unknown(&mut self, symbol: &str, rep: &ExecReport, why: String) -> BookOutput {
        let Some(p) = self.positions.get_mut(symbol) else { return BookOutput::default() };
        let current = match p.status {
            PositionStatus::Pending => p.entry_cl_id == rep.cl_id,
            PositionStatus::Closing => p.exit_cl_id.as_deref() == Some(rep.cl_id.as_str()),
            _ => false,
        };
        if !current {
            return BookOutput::default();
        }
        p.awaiting_since = None;
        let status = p.status;
        warn!(%symbol, cl_id = %rep.cl_id, reason = %why, "order outcome unknown");
        self.escalate(symbol, format!("{status:?} order outcome unknown: {why}"), rep.ts)
    }

    fn entry_filled(&mut self, symbol: &str, rep: &ExecReport) -> BookOutput {
        let mut out = BookOutput::default();
        let Some(p) = self.positions.get_mut(symbol) else { return out };
        if p.status != PositionStatus::Pending {
            return out;
        }
        if rep.avg_px > 0 && rep.avg_px != p.entry_price {
            // stop/target ikut harga fill; jarak stop tetap = jarak yang dipakai sizing
            let shift = rep.avg_px - p.entry_price;
            p.stop_loss_price += shift;
            p.target_price += shift;
            p.entry_price = rep.avg_px;
        }
        if rep.filled_qty > 0 {
            p.quantity = rep.filled_qty;
        }
        p.status = PositionStatus::Open;
        p.opened_at = rep.ts;
        p.awaiting_since = None;
        p.last_price = p.entry_price;
        p.unrealized_pnl = 0;
        self.by_cl_id.remove(&rep.cl_id);
        info!(
            %symbol,
            entry = whole_units(p.entry_price),
            qty = p.quantity,
            stop = whole_units(p.stop_loss_price),
            target = whole_units(p.target_price),
            "short position opened"
        );
        out.events.push(Event::Pos(p.clone()));
        out
    }

    fn entry_rejected(&mut self, symbol: &str, rep: &ExecReport, why: String) -> BookOutput {
        let mut out = BookOutput::default();
        self.by_cl_id.remove(&rep.cl_id);
        if self.positions.remove(symbol).is_some() {
            warn!(%symbol, cl_id = %rep.cl_id, reason = %why, "entry rejected by broker, position dropped");
            out.events.push(Event::EntryRejected {
                symbol: symbol.to_string(),
                cl_id: rep.cl_id.clone(),
                reason: why,
                ts: rep.ts,
            });
        }
        out
    }

    fn exit_filled(&mut self, symbol: &str, rep: &ExecReport) -> BookOutput {
        let mut out = BookOutput::default();
        let Some(mut p) = self.positions.remove(symbol) else { return out };
        self.by_cl_id.remove(&rep.cl_id);
        self.by_cl_id.remove(&p.entry_cl_id);

        let exit_px = if rep.avg_px > 0 { rep.avg_px } else { p.last_price };
        let realized = p.pnl_at(exit_px);
        let reason = p.exit_reason.unwrap_or(ExitReason::StopLoss);
        p.status = PositionStatus::Closed;
        p.last_price = exit_px;
        p.unrealized_pnl = 0;
        p.awaiting_since = None;

        let trade = ClosedTrade {
            symbol: p.symbol.clone(),
            sector: p.sector,
            entry_price: p.entry_price,
            exit_price: exit_px,
            quantity: p.quantity,
            reason,
            opened_at: p.opened_at,
            closed_at: rep.ts,
            realized_pnl: realized,
        };
        EXITS.with_label_values(&[&reason.to_string()]).inc();
        info!(%symbol, %reason, exit = whole_units(exit_px), pnl = whole_units(realized), "position closed");
        self.closed.push(trade.clone());
        out.events.push(Event::Pos(p));
        out.events.push(Event::Closed(trade));
        out.realized.push(realized);
        out
    }

    fn exit_rejected(&mut self, symbol: &str, rep: &ExecReport, why: String) -> BookOutput {
        let Some(p) = self.positions.get(symbol) else { return BookOutput::default() };
        if p.status != PositionStatus::Closing || p.exit_cl_id.as_deref() != Some(rep.cl_id.as_str()) {
            return BookOutput::default();
        }
        let retries_used = p.exit_attempts.saturating_sub(1);
        if retries_used < self.cfg.max_exit_retries {
            warn!(%symbol, reason = %why, attempt = p.exit_attempts, "exit rejected, retrying");
            let (reason, px) = (p.exit_reason.unwrap_or(ExitReason::StopLoss), p.last_price);
            self.submit_exit(symbol, reason, px, rep.ts)
        } else {
            let attempts = p.exit_attempts;
            if let Some(p) = self.positions.get_mut(symbol) {
                p.awaiting_since = None;
            }
            self.escalate(symbol, format!("exit rejected {attempts} times: {why}"), rep.ts)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{to_px, Sector};
    use crate::risk::{stop_loss_px, target_px};
    use chrono::TimeZone;

    // 2024-03-04 (Senin) 09:30 IST = 04:00 UTC
    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0).unwrap()
    }

    fn book() -> PositionBook {
        PositionBook::new(
            BookConfig { max_exit_retries: 2, ack_timeout: chrono::Duration::seconds(30) },
            MarketHours::default(),
        )
    }

    fn entry_order(sym: &str, entry: i64, qty: i64) -> Order {
        Order {
            cl_id: format!("GS-{sym}"),
            ts: at(4, 0),
            symbol: sym.into(),
            sector: Sector::Fmcg,
            side: Side::Sell,
            px: entry,
            qty,
            stop_loss_px: stop_loss_px(entry, 1.5),
            target_px: target_px(entry, 3.0),
            intent: OrderIntent::Entry,
        }
    }

    fn report(cl_id: &str, sym: &str, status: ExecStatus, qty: i64, px: i64, ts: DateTime<Utc>) -> ExecReport {
        ExecReport { cl_id: cl_id.into(), symbol: sym.into(), status, filled_qty: qty, avg_px: px, ts }
    }

    fn tick(sym: &str, px: i64, ts: DateTime<Utc>) -> Tick {
        Tick { symbol: sym.into(), ts, last_price: px, volume: 10, bid: px, ask: px, open_price: None, prev_close: None }
    }

    fn opened(sym: &str, entry: i64, qty: i64) -> PositionBook {
        let mut b = book();
        let ord = entry_order(sym, entry, qty);
        b.open_pending(&ord, at(4, 0));
        b.on_exec(&report(&ord.cl_id, sym, ExecStatus::Filled, qty, entry, at(4, 0)));
        b
    }

    fn exit_reason(out: &BookOutput) -> Option<ExitReason> {
        out.orders.first().and_then(|o| match o.intent {
            OrderIntent::Exit(r) => Some(r),
            OrderIntent::Entry => None,
        })
    }

    #[test]
    fn pending_then_open_on_fill() {
        let mut b = book();
        let ord = entry_order("NSE:ITC-EQ", to_px(200.0), 3333);
        b.open_pending(&ord, at(4, 0));
        assert_eq!(b.get("NSE:ITC-EQ").unwrap().status, PositionStatus::Pending);
        assert!(b.is_active("NSE:ITC-EQ"));
        b.on_exec(&report(&ord.cl_id, "NSE:ITC-EQ", ExecStatus::Ack, 0, 0, at(4, 0)));
        assert_eq!(b.get("NSE:ITC-EQ").unwrap().status, PositionStatus::Pending);
        b.on_exec(&report(&ord.cl_id, "NSE:ITC-EQ", ExecStatus::Filled, 3333, to_px(200.0), at(4, 1)));
        assert_eq!(b.get("NSE:ITC-EQ").unwrap().status, PositionStatus::Open);
    }

    #[test]
    fn unrealized_pnl_for_reference_trade() {
        let mut b = opened("NSE:ITC-EQ", to_px(200.0), 3333);
        let out = b.on_tick(&tick("NSE:ITC-EQ", to_px(200.30), at(4, 5)));
        assert!(out.orders.is_empty());
        let p = b.get("NSE:ITC-EQ").unwrap();
        assert_eq!(p.unrealized_pnl, -99_990);
        assert_eq!(whole_units(p.unrealized_pnl), -999);
    }

    #[test]
    fn stop_and_target_levels() {
        let b = opened("NSE:X-EQ", to_px(100.0), 10);
        let p = b.get("NSE:X-EQ").unwrap();
        assert!(p.stop_loss_price >= to_px(101.5));
        assert!(p.target_price <= to_px(97.0));

        let mut b = opened("NSE:X-EQ", to_px(100.0), 10);
        assert!(b.on_tick(&tick("NSE:X-EQ", to_px(101.49), at(4, 1))).orders.is_empty());
        let out = b.on_tick(&tick("NSE:X-EQ", to_px(101.5), at(4, 2)));
        assert_eq!(exit_reason(&out), Some(ExitReason::StopLoss));
        assert_eq!(out.orders[0].side, Side::Buy);
        assert_eq!(b.get("NSE:X-EQ").unwrap().status, PositionStatus::Closing);

        let mut b = opened("NSE:X-EQ", to_px(100.0), 10);
        let out = b.on_tick(&tick("NSE:X-EQ", to_px(97.0), at(4, 2)));
        assert_eq!(exit_reason(&out), Some(ExitReason::Target));
    }

    #[test]
    fn priority_stop_then_time_then_target() {
        let hours = MarketHours::default();
        let b = opened("NSE:X-EQ", to_px(100.0), 10);
        let p = b.get("NSE:X-EQ").unwrap().clone();
        // 15:20 IST = 09:50 UTC, lewat cutoff
        let late = at(9, 50);
        assert_eq!(exit_decision(&p, to_px(102.0), late, &hours), Some(ExitReason::StopLoss));
        assert_eq!(exit_decision(&p, to_px(96.0), late, &hours), Some(ExitReason::TimeExit));
        assert_eq!(exit_decision(&p, to_px(96.0), at(4, 0), &hours), Some(ExitReason::Target));
        assert_eq!(exit_decision(&p, to_px(100.0), at(4, 0), &hours), None);

        // stop == target tidak mungkin normal; paksa untuk cek urutan
        let mut weird = p;
        weird.stop_loss_price = to_px(100.0);
        weird.target_price = to_px(100.0);
        assert_eq!(exit_decision(&weird, to_px(100.0), at(4, 0), &hours), Some(ExitReason::StopLoss));
    }

    #[test]
    fn exit_fill_closes_and_archives() {
        let mut b = opened("NSE:X-EQ", to_px(100.0), 10);
        let out = b.on_tick(&tick("NSE:X-EQ", to_px(97.0), at(4, 2)));
        let exit_id = out.orders[0].cl_id.clone();
        // tick lain saat Closing tidak memicu exit kedua
        assert!(b.on_tick(&tick("NSE:X-EQ", to_px(96.0), at(4, 3))).orders.is_empty());

        let out = b.on_exec(&report(&exit_id, "NSE:X-EQ", ExecStatus::Filled, 10, to_px(97.0), at(4, 4)));
        assert_eq!(out.realized, vec![to_px(3.0) * 10]);
        assert!(b.get("NSE:X-EQ").is_none());
        assert!(!b.is_active("NSE:X-EQ"));
        assert_eq!(b.closed().len(), 1);
        assert_eq!(b.closed()[0].reason, ExitReason::Target);
        assert!(out.events.iter().any(|e| matches!(e, Event::Closed(_))));

        // fill duplikat diabaikan
        let again = b.on_exec(&report(&exit_id, "NSE:X-EQ", ExecStatus::Filled, 10, to_px(97.0), at(4, 5)));
        assert!(again.is_empty());
        assert_eq!(b.closed().len(), 1);
    }

    #[test]
    fn entry_rejection_drops_pending() {
        let mut b = book();
        let ord = entry_order("NSE:ITC-EQ", to_px(200.0), 10);
        b.open_pending(&ord, at(4, 0));
        let out = b.on_exec(&report(&ord.cl_id, "NSE:ITC-EQ", ExecStatus::Rejected("margin".into()), 0, 0, at(4, 0)));
        assert!(b.get("NSE:ITC-EQ").is_none());
        assert!(matches!(out.events.as_slice(), [Event::EntryRejected { .. }]));
    }

    #[test]
    fn exit_retries_then_escalates() {
        let mut b = opened("NSE:X-EQ", to_px(100.0), 10);
        let mut out = b.on_tick(&tick("NSE:X-EQ", to_px(102.0), at(4, 2)));
        // max_exit_retries = 2 -> 3 percobaan total
        for attempt in 1..=2 {
            let id = out.orders[0].cl_id.clone();
            out = b.on_exec(&report(&id, "NSE:X-EQ", ExecStatus::Rejected("rms".into()), 0, 0, at(4, 3)));
            assert_eq!(out.orders.len(), 1, "retry {attempt}");
            assert_ne!(out.orders[0].cl_id, id);
        }
        let id = out.orders[0].cl_id.clone();
        let out = b.on_exec(&report(&id, "NSE:X-EQ", ExecStatus::Rejected("rms".into()), 0, 0, at(4, 4)));
        assert!(out.orders.is_empty());
        assert!(out.events.iter().any(|e| matches!(e, Event::Escalation { .. })));

        let p = b.get("NSE:X-EQ").unwrap();
        assert_eq!(p.status, PositionStatus::Closing);
        assert!(p.escalated);
        assert_eq!(p.exit_attempts, 3);
        assert_eq!(b.non_terminal().len(), 1);
        assert!(!b.has_pending_exits());
    }

    #[test]
    fn ack_timeout_escalates_pending_once() {
        let mut b = book();
        let ord = entry_order("NSE:ITC-EQ", to_px(200.0), 10);
        b.open_pending(&ord, at(4, 0));
        assert!(b.on_timer(at(4, 0) + chrono::Duration::seconds(29)).is_empty());
        let out = b.on_timer(at(4, 0) + chrono::Duration::seconds(30));
        assert!(out.events.iter().any(|e| matches!(e, Event::Escalation { .. })));
        let p = b.get("NSE:ITC-EQ").unwrap();
        assert!(p.escalated);
        assert_eq!(p.status, PositionStatus::Pending);
        assert!(b.on_timer(at(4, 5)).is_empty());
    }

    #[test]
    fn fill_away_from_signal_price_moves_stop_and_target() {
        let mut b = book();
        let ord = entry_order("NSE:ITC-EQ", to_px(200.0), 3333);
        b.open_pending(&ord, at(4, 0));
        b.on_exec(&report(&ord.cl_id, "NSE:ITC-EQ", ExecStatus::Filled, 3333, to_px(199.50), at(4, 1)));
        let p = b.get("NSE:ITC-EQ").unwrap();
        assert_eq!(p.entry_price, to_px(199.50));
        assert_eq!(p.stop_loss_price, to_px(202.50));
        assert_eq!(p.target_price, to_px(193.50));
        // risiko di stop tidak melebihi budget 1% dari 10 lakh
        assert!(-p.pnl_at(p.stop_loss_price) <= to_px(10_000.0));

        // tick 202.00 belum kena stop baru
        assert!(b.on_tick(&tick("NSE:ITC-EQ", to_px(202.0), at(4, 2))).orders.is_empty());
        let out = b.on_tick(&tick("NSE:ITC-EQ", to_px(202.50), at(4, 3)));
        assert_eq!(exit_reason(&out), Some(ExitReason::StopLoss));
    }

    #[test]
    fn unknown_exit_outcome_escalates_without_resubmitting() {
        let mut b = opened("NSE:X-EQ", to_px(100.0), 10);
        let out = b.on_tick(&tick("NSE:X-EQ", to_px(102.0), at(4, 2)));
        let exit_id = out.orders[0].cl_id.clone();

        let out = b.on_exec(&report(&exit_id, "NSE:X-EQ", ExecStatus::Unknown("timed out".into()), 0, 0, at(4, 3)));
        assert!(out.orders.is_empty());
        assert!(out.events.iter().any(|e| matches!(e, Event::Escalation { .. })));
        let p = b.get("NSE:X-EQ").unwrap();
        assert_eq!(p.status, PositionStatus::Closing);
        assert!(p.escalated);
        assert_eq!(p.exit_attempts, 1);

        // fill yang telat tetap menutup posisi
        let out = b.on_exec(&report(&exit_id, "NSE:X-EQ", ExecStatus::Filled, 10, to_px(102.0), at(4, 4)));
        assert_eq!(out.realized, vec![-to_px(2.0) * 10]);
        assert!(b.get("NSE:X-EQ").is_none());
    }

    #[test]
    fn unknown_entry_outcome_keeps_pending_position() {
        let mut b = book();
        let ord = entry_order("NSE:ITC-EQ", to_px(200.0), 10);
        b.open_pending(&ord, at(4, 0));
        let out = b.on_exec(&report(&ord.cl_id, "NSE:ITC-EQ", ExecStatus::Unknown("reset".into()), 0, 0, at(4, 0)));
        assert!(out.orders.is_empty());
        assert!(!out.events.iter().any(|e| matches!(e, Event::EntryRejected { .. })));
        let p = b.get("NSE:ITC-EQ").unwrap();
        assert_eq!(p.status, PositionStatus::Pending);
        assert!(p.escalated);
        assert!(b.is_active("NSE:ITC-EQ"));

        b.on_exec(&report(&ord.cl_id, "NSE:ITC-EQ", ExecStatus::Filled, 10, to_px(200.0), at(4, 1)));
        assert_eq!(b.get("NSE:ITC-EQ").unwrap().status, PositionStatus::Open);
    }

    #[test]
    fn exit_ack_timeout_escalates_closing_without_new_order() {
        let mut b = opened("NSE:X-EQ", to_px(100.0), 10);
        let out = b.on_tick(&tick("NSE:X-EQ", to_px(102.0), at(4, 2)));
        assert_eq!(out.orders.len(), 1);
        assert!(b.has_pending_exits());

        assert!(b.on_timer(at(4, 2) + chrono::Duration::seconds(29)).is_empty());
        let out = b.on_timer(at(4, 2) + chrono::Duration::seconds(30));
        assert!(out.orders.is_empty());
        assert!(out.events.iter().any(|e| matches!(e, Event::Escalation { .. })));
        let p = b.get("NSE:X-EQ").unwrap();
        assert_eq!(p.status, PositionStatus::Closing);
        assert!(p.escalated);
        assert!(!b.has_pending_exits());
    }

    #[test]
    fn timer_time_exit_for_quiet_symbol() {
        let mut b = opened("NSE:X-EQ", to_px(100.0), 10);
        assert!(b.on_timer(at(9, 0)).orders.is_empty());
        // 15:15 IST = 09:45 UTC
        let out = b.on_timer(at(9, 45));
        assert_eq!(exit_reason(&out), Some(ExitReason::TimeExit));
        assert_eq!(out.orders[0].px, to_px(100.0));
    }
}
