use crate::models::{DailySnapshot, PeriodSummary};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Calendar month. Orders chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonthKey {
    pub year: i32,
    pub month: u32,
}

impl MonthKey {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

/// Half of a calendar year: `half` is 1 for January-June, 2 for July-December.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HalfYearKey {
    pub year: i32,
    pub half: u8,
}

impl HalfYearKey {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            half: if date.month() <= 6 { 1 } else { 2 },
        }
    }
}

impl fmt::Display for HalfYearKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-H{}", self.year, self.half)
    }
}

/// Groups snapshots by `key_fn` and keeps the latest-dated snapshot of each group.
///
/// Output is sorted by key. `period_pnl` is the change in total value against
/// the previous output row and is `None` for the first one. Periods with no
/// snapshots do not appear.
pub fn roll_up<K, F>(snapshots: &[DailySnapshot], key_fn: F) -> Vec<PeriodSummary<K>>
where
    K: Ord + Copy,
    F: Fn(NaiveDate) -> K,
{
    let mut representatives: Vec<(K, &DailySnapshot)> = Vec::new();
    let mut sorted: Vec<&DailySnapshot> = snapshots.iter().collect();
    sorted.sort_by_key(|snapshot| (key_fn(snapshot.date), snapshot.date));

    for snapshot in sorted {
        let key = key_fn(snapshot.date);
        if let Some((last_key, representative)) = representatives.last_mut() {
            if *last_key == key {
                if snapshot.date >= representative.date {
                    *representative = snapshot;
                }
                continue;
            }
        }
        representatives.push((key, snapshot));
    }

    let mut previous_total: Option<f64> = None;
    representatives
        .into_iter()
        .map(|(period, snapshot)| {
            let period_pnl = previous_total.map(|previous| snapshot.total_value - previous);
            previous_total = Some(snapshot.total_value);
            PeriodSummary {
                period,
                date: snapshot.date,
                cash: snapshot.cash,
                positions_value: snapshot.positions_value,
                total_value: snapshot.total_value,
                positions: snapshot.positions.clone(),
                period_pnl,
            }
        })
        .collect()
}

pub fn monthly(snapshots: &[DailySnapshot]) -> Vec<PeriodSummary<MonthKey>> {
    roll_up(snapshots, MonthKey::of)
}

pub fn semiannual(snapshots: &[DailySnapshot]) -> Vec<PeriodSummary<HalfYearKey>> {
    roll_up(snapshots, HalfYearKey::of)
}
