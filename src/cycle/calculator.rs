use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc, Weekday,
};

use crate::{
    config::Settings,
    models::{CycleId, CycleKind, CycleWindow, QuarterLabel, Result, RewardsError},
};

/// Maps wall-clock time onto weekly and quarterly cycle windows.
///
/// Boundaries are computed in the community's local time, given as a fixed
/// offset from UTC, and returned in UTC. Every method is a pure function of
/// its arguments.
#[derive(Debug, Clone, Copy)]
pub struct CycleCalculator {
    week_start: Weekday,
    offset: FixedOffset,
}

impl Default for CycleCalculator {
    fn default() -> Self {
        Self::new(Weekday::Sun, Utc.fix())
    }
}

impl CycleCalculator {
    pub fn new(week_start: Weekday, offset: FixedOffset) -> Self {
        Self { week_start, offset }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let week_start = settings.week_start().map_err(RewardsError::ConfigurationError)?;
        let offset = settings.utc_offset().map_err(RewardsError::ConfigurationError)?;
        Ok(Self::new(week_start, offset))
    }

    pub fn week_start(&self) -> Weekday {
        self.week_start
    }

    /// The window of `kind` that contains `now`.
    pub fn current_cycle(&self, kind: CycleKind, now: DateTime<Utc>) -> Result<CycleWindow> {
        let local_date = now.with_timezone(&self.offset).date_naive();

        match kind {
            CycleKind::Weekly => {
                let days_back = (local_date.weekday().num_days_from_sunday() + 7
                    - self.week_start.num_days_from_sunday())
                    % 7;
                let start_date = local_date - Duration::days(days_back as i64);
                Ok(self.weekly_window(start_date))
            }
            CycleKind::Quarterly => self.quarter_window(&QuarterLabel::containing_date(local_date)),
        }
    }

    /// The window immediately before `window`, of the same kind.
    pub fn previous_cycle(&self, window: &CycleWindow) -> Result<CycleWindow> {
        self.current_cycle(window.kind, window.start - Duration::milliseconds(1))
    }

    /// The window immediately after `window`, of the same kind.
    pub fn next_cycle(&self, window: &CycleWindow) -> Result<CycleWindow> {
        self.current_cycle(window.kind, window.end)
    }

    pub fn quarter_window(&self, label: &QuarterLabel) -> Result<CycleWindow> {
        let invalid = || RewardsError::InvalidQuarterLabel(label.to_string());
        let first_day = label.first_day().ok_or_else(invalid)?;
        let day_after_end = label.day_after_end().ok_or_else(invalid)?;

        Ok(CycleWindow {
            id: CycleId::quarterly(label),
            kind: CycleKind::Quarterly,
            start: self.local_midnight(first_day),
            end: self.local_midnight(day_after_end),
        })
    }

    /// Quarter label of the quarter containing `now`.
    pub fn quarter_label_at(&self, now: DateTime<Utc>) -> QuarterLabel {
        QuarterLabel::containing_date(now.with_timezone(&self.offset).date_naive())
    }

    /// Recover the quarter label of a quarterly window.
    pub fn quarter_label_of(&self, window: &CycleWindow) -> QuarterLabel {
        self.quarter_label_at(window.start)
    }

    /// Weekly window whose last local day is `last_day`.
    pub fn weekly_window_ending(&self, last_day: NaiveDate) -> Result<CycleWindow> {
        let window = self.weekly_window(last_day - Duration::days(6));
        if window.start.with_timezone(&self.offset).weekday() != self.week_start {
            return Err(RewardsError::ConfigurationError(format!(
                "{} is not the last day of a weekly cycle starting on {}",
                last_day, self.week_start
            )));
        }
        Ok(window)
    }

    fn weekly_window(&self, start_date: NaiveDate) -> CycleWindow {
        let last_day = start_date + Duration::days(6);
        let start = self.local_midnight(start_date);

        CycleWindow {
            id: CycleId::weekly(last_day),
            kind: CycleKind::Weekly,
            start,
            end: start + Duration::days(7),
        }
    }

    fn local_midnight(&self, date: NaiveDate) -> DateTime<Utc> {
        let offset = Duration::seconds(self.offset.local_minus_utc() as i64);
        let local = date.and_time(NaiveTime::MIN) - offset;
        Utc.from_utc_datetime(&local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Quarter;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn test_weekly_window_starts_on_sunday() {
        let calc = CycleCalculator::default();
        // Wednesday 2026-10-21
        let window = calc.current_cycle(CycleKind::Weekly, utc(2026, 10, 21, 15, 30, 0)).unwrap();

        assert_eq!(window.start, utc(2026, 10, 18, 0, 0, 0));
        assert_eq!(window.end, utc(2026, 10, 25, 0, 0, 0));
        assert_eq!(
            window.last_instant(),
            utc(2026, 10, 24, 23, 59, 59) + Duration::milliseconds(999)
        );
        assert_eq!(window.id.as_str(), "weekly_2026-10-24");
    }

    #[test]
    fn test_weekly_boundary_instants() {
        let calc = CycleCalculator::default();
        let sunday_midnight = utc(2026, 10, 18, 0, 0, 0);

        let at_boundary = calc.current_cycle(CycleKind::Weekly, sunday_midnight).unwrap();
        assert_eq!(at_boundary.start, sunday_midnight);

        let just_before = calc
            .current_cycle(CycleKind::Weekly, sunday_midnight - Duration::milliseconds(1))
            .unwrap();
        assert_eq!(just_before.end, sunday_midnight);
        assert_eq!(just_before.id.as_str(), "weekly_2026-10-17");
    }

    #[test]
    fn test_weekly_windows_are_contiguous() {
        let calc = CycleCalculator::default();
        let current = calc.current_cycle(CycleKind::Weekly, utc(2026, 1, 1, 12, 0, 0)).unwrap();
        let previous = calc.previous_cycle(&current).unwrap();
        let next = calc.next_cycle(&current).unwrap();

        assert_eq!(previous.end, current.start);
        assert_eq!(current.end, next.start);
        assert_eq!(current.end - current.start, Duration::days(7));
        assert_eq!(calc.next_cycle(&previous).unwrap(), current);
    }

    #[test]
    fn test_weekly_respects_offset_and_start_day() {
        // UTC+09:00, weeks starting Monday
        let calc = CycleCalculator::new(Weekday::Mon, FixedOffset::east_opt(9 * 3600).unwrap());
        // 2026-10-18 20:00 UTC is Monday 2026-10-19 05:00 local
        let window = calc.current_cycle(CycleKind::Weekly, utc(2026, 10, 18, 20, 0, 0)).unwrap();

        assert_eq!(window.start, utc(2026, 10, 18, 15, 0, 0));
        assert_eq!(window.id.as_str(), "weekly_2026-10-25");
    }

    #[test]
    fn test_repeated_calls_do_not_drift() {
        let calc = CycleCalculator::default();
        let now = utc(2026, 7, 4, 9, 0, 0);
        let a = calc.current_cycle(CycleKind::Weekly, now).unwrap();
        let b = calc.current_cycle(CycleKind::Weekly, now).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_quarter_windows() {
        let calc = CycleCalculator::default();
        let window = calc.current_cycle(CycleKind::Quarterly, utc(2026, 8, 15, 0, 0, 0)).unwrap();

        assert_eq!(window.start, utc(2026, 7, 1, 0, 0, 0));
        assert_eq!(window.end, utc(2026, 10, 1, 0, 0, 0));
        assert_eq!(
            window.last_instant(),
            utc(2026, 9, 30, 23, 59, 59) + Duration::milliseconds(999)
        );
        assert_eq!(window.id.as_str(), "quarterly_2026-Q3");

        let q4 = calc.quarter_window(&QuarterLabel::new(2026, Quarter::Q4)).unwrap();
        let next = calc.next_cycle(&q4).unwrap();
        assert_eq!(next.id.as_str(), "quarterly_2027-Q1");
        assert_eq!(q4.end, next.start);
        assert_eq!(calc.previous_cycle(&next).unwrap(), q4);
    }

    #[test]
    fn test_weekly_window_ending_validates_day() {
        let calc = CycleCalculator::default();
        let saturday = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        let window = calc.weekly_window_ending(saturday).unwrap();
        assert_eq!(window.id.as_str(), "weekly_2026-10-17");

        let friday = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        assert!(calc.weekly_window_ending(friday).is_err());
    }
}
