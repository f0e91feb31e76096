use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Timelike};

use crate::db::models::ScheduleConfig;

/// Whether the schedule wants the plug on at local wall-clock time `now`.
///
/// Off when there is no schedule, it is disabled, today is not an active
/// day, or its times do not parse. A window with `start <= end` is on for
/// `[start, end)`; otherwise it wraps midnight and is on for
/// `now >= start || now < end`. `start == end` is a zero-width window.
///
/// An overnight window is judged by the weekday of `now`, so the early
/// morning tail belongs to the day it falls on, not the day it started.
pub fn is_desired_on_by_schedule(now: NaiveDateTime, cfg: Option<&ScheduleConfig>) -> bool {
    let Some(cfg) = cfg else {
        return false;
    };
    if !cfg.enabled || !cfg.is_active_on(now.weekday().num_days_from_sunday()) {
        return false;
    }
    let (Ok(start), Ok(end)) = (cfg.start_minutes(), cfg.end_minutes()) else {
        return false;
    };
    let now_minutes = now.hour() * 60 + now.minute();

    if start <= end {
        start <= now_minutes && now_minutes < end
    } else {
        now_minutes >= start || now_minutes < end
    }
}

/// The next local time after `now` at which [`is_desired_on_by_schedule`]
/// changes its answer, together with the new answer. `None` when the answer
/// never changes within the coming week.
pub fn next_transition(now: NaiveDateTime, cfg: &ScheduleConfig) -> Option<(NaiveDateTime, bool)> {
    let (Ok(start), Ok(end)) = (cfg.start_minutes(), cfg.end_minutes()) else {
        return None;
    };
    let current = is_desired_on_by_schedule(now, Some(cfg));

    // The answer only flips at a window edge or at midnight (weekday change).
    let mut candidates: Vec<NaiveDateTime> = (0..=7)
        .flat_map(|d| {
            let date = now.date() + Duration::days(d);
            [0, start, end].into_iter().filter_map(move |m| {
                NaiveTime::from_hms_opt(m / 60, m % 60, 0).map(|t| date.and_time(t))
            })
        })
        .filter(|t| *t > now)
        .collect();
    candidates.sort();

    candidates
        .into_iter()
        .map(|t| (t, is_desired_on_by_schedule(t, Some(cfg))))
        .find(|(_, on)| *on != current)
}
