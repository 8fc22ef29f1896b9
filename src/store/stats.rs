use std::collections::VecDeque;

use serde::Serialize;

/// Roll outcome of a single hit or heal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitCategory {
    Normal,
    Critical,
    Lucky,
    CritLucky,
}

impl HitCategory {
    pub fn classify(critical: bool, lucky: bool) -> Self {
        match (critical, lucky) {
            (true, true) => HitCategory::CritLucky,
            (true, false) => HitCategory::Critical,
            (false, true) => HitCategory::Lucky,
            (false, false) => HitCategory::Normal,
        }
    }

    pub fn is_critical(self) -> bool {
        matches!(self, HitCategory::Critical | HitCategory::CritLucky)
    }

    pub fn is_lucky(self) -> bool {
        matches!(self, HitCategory::Lucky | HitCategory::CritLucky)
    }
}

/// Amount split by category. `total` is always the sum of the four
/// categories; `hp_lessen` is tracked on the side.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueBreakdown {
    pub normal: u64,
    pub critical: u64,
    pub lucky: u64,
    pub crit_lucky: u64,
    #[serde(rename = "hpLessen")]
    pub hp_lessen: u64,
    pub total: u64,
}

impl ValueBreakdown {
    pub fn add(&mut self, amount: u64, category: HitCategory) {
        let bucket = match category {
            HitCategory::Normal => &mut self.normal,
            HitCategory::Critical => &mut self.critical,
            HitCategory::Lucky => &mut self.lucky,
            HitCategory::CritLucky => &mut self.crit_lucky,
        };
        *bucket = bucket.saturating_add(amount);
        self.total = self.total.saturating_add(amount);
    }
}

/// Hit counts. `critical` and `lucky` include crit+lucky hits, `normal` only
/// hits that were neither.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountBreakdown {
    pub normal: u64,
    pub critical: u64,
    pub lucky: u64,
    pub crit_lucky: u64,
    pub total: u64,
}

impl CountBreakdown {
    pub fn add(&mut self, category: HitCategory) {
        if category.is_critical() {
            self.critical += 1;
        }
        if category.is_lucky() {
            self.lucky += 1;
        }
        match category {
            HitCategory::Normal => self.normal += 1,
            HitCategory::CritLucky => self.crit_lucky += 1,
            _ => {}
        }
        self.total += 1;
    }
}

/// Running totals of one quantity (damage or healing) plus its rates.
#[derive(Debug, Clone, Default)]
pub struct StatisticSet {
    values: ValueBreakdown,
    counts: CountBreakdown,
    window: VecDeque<(u64, u64)>,
    window_sum: u64,
    first_ts: Option<u64>,
    last_ts: Option<u64>,
    realtime: f64,
    realtime_max: f64,
}

impl StatisticSet {
    pub fn record(&mut self, amount: u64, category: HitCategory, hp_lessen: u64, ts_ms: u64, window_ms: u64) {
        self.values.add(amount, category);
        self.values.hp_lessen = self.values.hp_lessen.saturating_add(hp_lessen);
        self.counts.add(category);

        self.first_ts.get_or_insert(ts_ms);
        self.last_ts = Some(self.last_ts.map_or(ts_ms, |last| last.max(ts_ms)));

        self.window.push_back((ts_ms, amount));
        self.window_sum = self.window_sum.saturating_add(amount);
        self.refresh(ts_ms, window_ms);
    }

    /// Drops samples that fell out of the trailing window and recomputes the
    /// realtime rate and its running maximum.
    pub fn refresh(&mut self, now_ms: u64, window_ms: u64) {
        while let Some(&(ts, amount)) = self.window.front() {
            if now_ms.saturating_sub(ts) < window_ms {
                break;
            }
            self.window.pop_front();
            self.window_sum -= amount;
        }

        self.realtime = if window_ms == 0 { 0.0 } else { self.window_sum as f64 * 1000.0 / window_ms as f64 };
        if self.realtime > self.realtime_max {
            self.realtime_max = self.realtime;
        }
    }

    /// Average rate between the first and last recorded sample.
    pub fn total_rate(&self) -> f64 {
        match (self.first_ts, self.last_ts) {
            (Some(first), Some(last)) if last > first => self.values.total as f64 * 1000.0 / (last - first) as f64,
            _ => 0.0,
        }
    }

    pub fn realtime(&self) -> f64 {
        self.realtime
    }

    pub fn realtime_max(&self) -> f64 {
        self.realtime_max
    }

    pub fn values(&self) -> ValueBreakdown {
        self.values
    }

    pub fn counts(&self) -> CountBreakdown {
        self.counts
    }

    pub fn reset(&mut self) {
        *self = StatisticSet::default();
    }
}
