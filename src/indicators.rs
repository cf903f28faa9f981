// ===============================
// src/indicators.rs
// ===============================
//
// Indikator inkremental O(1) per tick:
// - RollingWindow : jendela N nilai terakhir + running sum
// - Rsi           : RSI Wilder (smoothing eksponensial, tanpa re-scan window)
//
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct RollingWindow {
    window: VecDeque<i64>,
    sum: i64,
    cap: usize,
}

impl RollingWindow {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self { window: VecDeque::with_capacity(cap), sum: 0, cap }
    }

    pub fn push(&mut self, v: i64) {
        if self.window.len() == self.cap {
            if let Some(x) = self.window.pop_front() { self.sum -= x; }
        }
        self.window.push_back(v);
        self.sum += v;
    }

    pub fn len(&self) -> usize { self.window.len() }
    pub fn is_empty(&self) -> bool { self.window.is_empty() }
    pub fn is_full(&self) -> bool { self.window.len() == self.cap }
    pub fn last(&self) -> Option<i64> { self.window.back().copied() }

    pub fn mean(&self) -> Option<f64> {
        if self.window.is_empty() { None } else { Some(self.sum as f64 / self.window.len() as f64) }
    }
}

/// RSI Wilder. Fase seed memakai rata-rata sederhana `period` perubahan pertama.
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    prev: Option<i64>,
    seeded: usize,
    avg_gain: f64,
    avg_loss: f64,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self { period: period.max(1), prev: None, seeded: 0, avg_gain: 0.0, avg_loss: 0.0 }
    }

    pub fn update(&mut self, px: i64) -> Option<f64> {
        let prev = match self.prev.replace(px) {
            Some(p) => p,
            None => return None,
        };
        let delta = (px - prev) as f64;
        let (gain, loss) = if delta > 0.0 { (delta, 0.0) } else { (0.0, -delta) };

        if self.seeded < self.period {
            self.avg_gain += gain / self.period as f64;
            self.avg_loss += loss / self.period as f64;
            self.seeded += 1;
            if self.seeded < self.period {
                return None;
            }
        } else {
            let n = self.period as f64;
            self.avg_gain = (self.avg_gain * (n - 1.0) + gain) / n;
            self.avg_loss = (self.avg_loss * (n - 1.0) + loss) / n;
        }
        self.value()
    }

    pub fn value(&self) -> Option<f64> {
        if self.seeded < self.period {
            return None;
        }
        if self.avg_loss == 0.0 {
            return Some(if self.avg_gain == 0.0 { 50.0 } else { 100.0 });
        }
        let rs = self.avg_gain / self.avg_loss;
        Some(100.0 - 100.0 / (1.0 + rs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_window_evicts_oldest() {
        let mut w = RollingWindow::new(3);
        assert_eq!(w.mean(), None);
        for v in [10, 20, 30] { w.push(v); }
        assert!(w.is_full());
        assert_eq!(w.mean(), Some(20.0));
        w.push(60);
        assert_eq!(w.len(), 3);
        assert_eq!(w.mean(), Some(110.0 / 3.0));
        assert_eq!(w.last(), Some(60));
    }

    #[test]
    fn rsi_needs_period_changes_before_reporting() {
        let mut r = Rsi::new(3);
        assert_eq!(r.update(100), None);
        assert_eq!(r.update(101), None);
        assert_eq!(r.update(102), None);
        assert!(r.update(103).is_some());
    }

    #[test]
    fn rsi_extremes_and_flat() {
        let mut up = Rsi::new(4);
        let mut down = Rsi::new(4);
        let mut flat = Rsi::new(4);
        let mut last = (None, None, None);
        for i in 0..10 {
            last = (up.update(100 + i), down.update(100 - i), flat.update(100));
        }
        assert_eq!(last.0, Some(100.0));
        assert_eq!(last.1, Some(0.0));
        assert_eq!(last.2, Some(50.0));
    }

    #[test]
    fn rsi_matches_seed_average() {
        // gain: 2, 0 ; loss: 0, 1 -> avg_gain=1.0 avg_loss=0.5 -> RS=2 -> RSI=66.67
        let mut r = Rsi::new(2);
        r.update(100);
        r.update(102);
        let v = r.update(101).unwrap();
        assert!((v - 66.666_666).abs() < 1e-3);
        // Wilder: gain 3 -> avg_gain=(1*1+3)/2=2, avg_loss=(0.5*1+0)/2=0.25 -> RS=8 -> 88.89
        let v = r.update(104).unwrap();
        assert!((v - 88.888_888).abs() < 1e-3);
    }
}
