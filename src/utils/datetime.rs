use chrono::{NaiveDateTime, NaiveTime};
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Returns the next wall-clock occurrence of `at` strictly after `now`.
pub fn next_time_of_day_after(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        return today;
    }

    now.date()
        .checked_add_days(chrono::Days::new(1))
        .map(|tomorrow| tomorrow.and_time(at))
        .unwrap_or(today)
}

/// What a daily wall-clock alarm aiming at `target` should do at `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmStep {
    Fire,
    /// Sleep this long, then ask again
    Sleep(Duration),
    /// The clock was stepped; aim at this occurrence instead
    Retarget(NaiveDateTime),
}

/// Decide the next move of an alarm for time of day `at`.
///
/// Sleeps never exceed `recheck`, so a clock step is noticed within one
/// chunk. Reaching `target` more than two chunks late means the clock jumped
/// forward past it, which retargets rather than firing off-schedule.
pub fn alarm_step(now: NaiveDateTime, target: NaiveDateTime, at: NaiveTime, recheck: Duration) -> AlarmStep {
    if now >= target {
        let late = now.signed_duration_since(target).to_std().unwrap_or_default();
        if late <= recheck * 2 {
            return AlarmStep::Fire;
        }
        return AlarmStep::Retarget(next_time_of_day_after(now, at));
    }

    let wait = target.signed_duration_since(now).to_std().unwrap_or_default();
    if wait > DAY {
        // stepped backwards
        return AlarmStep::Retarget(next_time_of_day_after(now, at));
    }
    AlarmStep::Sleep(wait.min(recheck))
}
