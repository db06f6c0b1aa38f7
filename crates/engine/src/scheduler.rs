//! Trading-day calendar and task plan
//!
//! Pure planning: given a wall-clock instant, what fires next and when.
//! The runtime owns the loop that sleeps until each event and dispatches
//! it, so restarts mid-day naturally resume from the next undone slot.

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveTime, TimeZone, Weekday};
use std::collections::HashSet;

/// Scheduled work items across a trading day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayTask {
    /// 09:00: retry the failed-order queue before the open
    PreMarketRetry,
    /// 09:15: consume candidates, place sells for open positions
    MarketOpen,
    /// hourly through the session: exit cycle, reconciler, re-entries
    HourlyMonitor,
    /// 18:00: purge expired failed orders, emit the daily summary
    EodCleanup,
}

/// Weekend/holiday-aware calendar
#[derive(Debug, Clone)]
pub struct TradingCalendar {
    holidays: HashSet<NaiveDate>,
}

impl TradingCalendar {
    pub fn new(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
        }
    }

    pub fn is_trading_day(&self, day: NaiveDate) -> bool {
        !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&day)
    }

    /// Whether `now` falls inside market hours on a trading day
    pub fn in_market_hours(&self, now: DateTime<Local>) -> bool {
        if !self.is_trading_day(now.date_naive()) {
            return false;
        }
        let time = now.time();
        time >= slot(9, 15) && time <= slot(15, 30)
    }

    /// The next scheduled task at or after `now`. Scans forward day by day,
    /// so a weekend Friday evening resolves to Monday 09:00.
    pub fn next_event(&self, now: DateTime<Local>) -> (DateTime<Local>, DayTask) {
        let plan = day_plan();
        let mut day = now.date_naive();
        // bounded scan; even a festival week has a trading day inside it
        for _ in 0..30 {
            if self.is_trading_day(day) {
                for (time, task) in &plan {
                    let at = Local
                        .from_local_datetime(&day.and_time(*time))
                        .single()
                        .expect("unambiguous local time");
                    if at > now {
                        return (at, *task);
                    }
                }
            }
            day = day.succ_opt().expect("date in range");
        }
        unreachable!("no trading day within 30 days");
    }
}

fn slot(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).expect("valid slot")
}

/// The fixed daily plan, in time order
fn day_plan() -> Vec<(NaiveTime, DayTask)> {
    let mut plan = vec![
        (slot(9, 0), DayTask::PreMarketRetry),
        (slot(9, 15), DayTask::MarketOpen),
    ];
    // hourly monitors after the open, with a final pass at the close
    for hour in 10..=15 {
        plan.push((slot(hour, 15), DayTask::HourlyMonitor));
    }
    plan.push((slot(15, 30), DayTask::HourlyMonitor));
    plan.push((slot(18, 0), DayTask::EodCleanup));
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, hh, mm, 0).unwrap()
    }

    // 2025-06-17 is a Tuesday
    const Y: i32 = 2025;

    fn calendar() -> TradingCalendar {
        TradingCalendar::new(vec![NaiveDate::from_ymd_opt(Y, 6, 19).unwrap()])
    }

    #[test]
    fn weekdays_trade_weekends_do_not() {
        let cal = calendar();
        assert!(cal.is_trading_day(NaiveDate::from_ymd_opt(Y, 6, 17).unwrap()));
        assert!(!cal.is_trading_day(NaiveDate::from_ymd_opt(Y, 6, 21).unwrap())); // Sat
        assert!(!cal.is_trading_day(NaiveDate::from_ymd_opt(Y, 6, 22).unwrap())); // Sun
        assert!(!cal.is_trading_day(NaiveDate::from_ymd_opt(Y, 6, 19).unwrap())); // holiday
    }

    #[test]
    fn early_morning_resolves_to_premarket_retry() {
        let (when, task) = calendar().next_event(at(Y, 6, 17, 7, 0));
        assert_eq!(task, DayTask::PreMarketRetry);
        assert_eq!(when, at(Y, 6, 17, 9, 0));
    }

    #[test]
    fn midday_restart_resumes_at_next_monitor() {
        let (when, task) = calendar().next_event(at(Y, 6, 17, 11, 0));
        assert_eq!(task, DayTask::HourlyMonitor);
        assert_eq!(when, at(Y, 6, 17, 11, 15));
    }

    #[test]
    fn close_has_a_final_monitor_slot() {
        let (when, task) = calendar().next_event(at(Y, 6, 17, 15, 20));
        assert_eq!(task, DayTask::HourlyMonitor);
        assert_eq!(when, at(Y, 6, 17, 15, 30));
    }

    #[test]
    fn evening_rolls_to_eod_then_next_day() {
        let (when, task) = calendar().next_event(at(Y, 6, 17, 16, 0));
        assert_eq!(task, DayTask::EodCleanup);
        assert_eq!(when, at(Y, 6, 17, 18, 0));

        let (when, task) = calendar().next_event(at(Y, 6, 17, 19, 0));
        assert_eq!(task, DayTask::PreMarketRetry);
        assert_eq!(when, at(Y, 6, 18, 9, 0));
    }

    #[test]
    fn holiday_skipped_entirely() {
        // Wed 18th evening: Thu 19th is a holiday, next is Fri 20th
        let (when, task) = calendar().next_event(at(Y, 6, 18, 19, 0));
        assert_eq!(task, DayTask::PreMarketRetry);
        assert_eq!(when, at(Y, 6, 20, 9, 0));
    }

    #[test]
    fn friday_evening_rolls_to_monday() {
        let (when, _) = calendar().next_event(at(Y, 6, 20, 19, 0));
        assert_eq!(when, at(Y, 6, 23, 9, 0)); // Monday
    }

    #[test]
    fn market_hours_window() {
        let cal = calendar();
        assert!(!cal.in_market_hours(at(Y, 6, 17, 9, 0)));
        assert!(cal.in_market_hours(at(Y, 6, 17, 9, 15)));
        assert!(cal.in_market_hours(at(Y, 6, 17, 15, 30)));
        assert!(!cal.in_market_hours(at(Y, 6, 17, 15, 31)));
        assert!(!cal.in_market_hours(at(Y, 6, 21, 12, 0))); // Saturday
    }
}
