// ===============================
// src/hours.rs
// ===============================
//
// Jam bursa dalam offset UTC tetap (IST = +05:30, tanpa DST).
// Semua keputusan waktu memakai timestamp tick / clock yang di-inject,
// bukan jam dinding langsung.
//
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc, Weekday};

#[derive(Clone, Debug)]
pub struct MarketHours {
    pub utc_offset_minutes: i32,
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub signal_end: NaiveTime,
    pub eod_cutoff: NaiveTime,
}

impl Default for MarketHours {
    fn default() -> Self {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN);
        Self {
            utc_offset_minutes: 330,
            open: t(9, 15),
            close: t(15, 30),
            signal_end: t(10, 30),
            eod_cutoff: t(15, 15),
        }
    }
}

impl MarketHours {
    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }

    fn local(&self, ts: DateTime<Utc>) -> DateTime<FixedOffset> {
        ts.with_timezone(&self.offset())
    }

    fn is_weekday(&self, ts: DateTime<Utc>) -> bool {
        !matches!(self.local(ts).weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// Tanggal sesi (kalender lokal bursa)
    pub fn session_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        self.local(ts).date_naive()
    }

    pub fn is_trading_time(&self, ts: DateTime<Utc>) -> bool {
        let t = self.local(ts).time();
        self.is_weekday(ts) && t >= self.open && t <= self.close
    }

    pub fn in_signal_window(&self, ts: DateTime<Utc>) -> bool {
        let t = self.local(ts).time();
        self.is_trading_time(ts) && t <= self.signal_end
    }

    pub fn past_eod_cutoff(&self, ts: DateTime<Utc>) -> bool {
        self.local(ts).time() >= self.eod_cutoff
    }

    /// Jam buka pada tanggal sesi `date`, dalam UTC
    pub fn open_at(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        self.offset()
            .from_local_datetime(&date.and_time(self.open))
            .single()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Hari kerja terakhir <= tanggal sesi dari `ts`
    pub fn last_weekday(&self, ts: DateTime<Utc>) -> NaiveDate {
        let mut d = self.session_date(ts);
        while matches!(d.weekday(), Weekday::Sat | Weekday::Sun) {
            match d.pred_opt() {
                Some(prev) => d = prev,
                None => break,
            }
        }
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-04 adalah hari Senin
    fn ist(h: u32, m: u32) -> DateTime<Utc> {
        FixedOffset::east_opt(330 * 60)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 4, h, m, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn trading_window_is_inclusive() {
        let h = MarketHours::default();
        assert!(!h.is_trading_time(ist(9, 14)));
        assert!(h.is_trading_time(ist(9, 15)));
        assert!(h.is_trading_time(ist(15, 30)));
        assert!(!h.is_trading_time(ist(15, 31)));
    }

    #[test]
    fn signal_window_ends_mid_morning() {
        let h = MarketHours::default();
        assert!(h.in_signal_window(ist(10, 0)));
        assert!(!h.in_signal_window(ist(10, 31)));
        assert!(h.is_trading_time(ist(10, 31)));
    }

    #[test]
    fn weekend_is_closed() {
        let h = MarketHours::default();
        let saturday = ist(11, 0) + chrono::Duration::days(5);
        assert!(!h.is_trading_time(saturday));
    }

    #[test]
    fn eod_cutoff_and_session_date() {
        let h = MarketHours::default();
        assert!(!h.past_eod_cutoff(ist(15, 14)));
        assert!(h.past_eod_cutoff(ist(15, 15)));
        assert_eq!(h.session_date(ist(9, 20)), NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
    }

    #[test]
    fn open_at_and_last_weekday() {
        let h = MarketHours::default();
        let monday = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        assert_eq!(h.open_at(monday), Some(ist(9, 15)));
        let sunday = ist(11, 0) + chrono::Duration::days(6);
        assert_eq!(h.last_weekday(sunday), NaiveDate::from_ymd_opt(2024, 3, 8).unwrap());
        assert_eq!(h.last_weekday(ist(11, 0)), monday);
    }
}
