use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};

const DAY_KEY_FORMAT: &str = "%Y-%m-%d";
const MAX_GAP_MINUTES: usize = 180;

/// Implemented for every `chrono` time zone, so `Local` drives production
/// while tests pin a `FixedOffset` or a named zone.
pub trait DayCalendar: Send + Sync {
    fn local_day(&self, timestamp: DateTime<Utc>) -> NaiveDate;

    /// The instant at which local `day` begins, or `None` when no local
    /// midnight (nor anything shortly after it) exists.
    fn day_start(&self, day: NaiveDate) -> Option<DateTime<Utc>>;
}

impl<Tz> DayCalendar for Tz
where
    Tz: TimeZone + Send + Sync,
{
    fn local_day(&self, timestamp: DateTime<Utc>) -> NaiveDate {
        timestamp.with_timezone(self).date_naive()
    }

    fn day_start(&self, day: NaiveDate) -> Option<DateTime<Utc>> {
        let midnight = day.and_hms_opt(0, 0, 0)?;
        resolve_local(self, midnight)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DaySlice {
    pub day: NaiveDate,
    pub seconds: f64,
}

/// Splits `[start, end)` into maximal pieces that each lie within a single
/// local day. Day boundaries come from calendar arithmetic, so 23h and 25h
/// days around DST changes are split at their real midnights.
pub fn split_by_local_day(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    calendar: &dyn DayCalendar,
) -> Vec<DaySlice> {
    let mut slices = Vec::new();
    let mut segment_start = start;

    while segment_start < end {
        let day = calendar.local_day(segment_start);
        let next_day_start = day
            .succ_opt()
            .and_then(|next| calendar.day_start(next))
            .filter(|next| *next > segment_start)
            .unwrap_or_else(|| segment_start + Duration::days(1));
        let segment_end = next_day_start.min(end);

        let seconds = seconds_between(segment_start, segment_end);
        if seconds > 0.0 {
            slices.push(DaySlice { day, seconds });
        }
        segment_start = segment_end;
    }

    slices
}

/// The `[start, end)` instants of local `day`. A DST day is 23 or 25 hours.
pub fn day_bounds_utc(
    calendar: &dyn DayCalendar,
    day: NaiveDate,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = calendar.day_start(day)?;
    let end = calendar.day_start(day.succ_opt()?)?;
    Some((start, end))
}

pub fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let span = end - start;
    match span.num_microseconds() {
        Some(micros) => micros as f64 / 1_000_000.0,
        None => span.num_seconds() as f64,
    }
}

pub fn day_key(day: NaiveDate) -> String {
    day.format(DAY_KEY_FORMAT).to_string()
}

pub fn parse_day_key(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DAY_KEY_FORMAT).ok()
}

pub fn format_duration(seconds: f64) -> String {
    let total_seconds = if seconds.is_finite() {
        seconds.max(0.0) as i64
    } else {
        0
    };
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

// Skipped local times (spring-forward gaps) resolve to the first valid
// minute after them; repeated ones resolve to the earlier instant.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    let mut cursor = naive;
    for _ in 0..=MAX_GAP_MINUTES {
        match tz.from_local_datetime(&cursor) {
            LocalResult::Single(local) => return Some(local.with_timezone(&Utc)),
            LocalResult::Ambiguous(first, second) => {
                return Some(first.min(second).with_timezone(&Utc));
            }
            LocalResult::None => cursor += Duration::minutes(1),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, NaiveDate, TimeZone, Utc};
    use chrono_tz::America::New_York;

    use super::{
        DaySlice, day_bounds_utc, day_key, format_duration, parse_day_key, split_by_local_day,
    };

    fn seoul() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).expect("valid offset")
    }

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
    }

    #[test]
    fn splits_session_at_local_midnight() {
        let tz = seoul();
        let start = tz
            .with_ymd_and_hms(2026, 1, 1, 23, 59, 50)
            .unwrap()
            .with_timezone(&Utc);
        let end = tz
            .with_ymd_and_hms(2026, 1, 2, 0, 0, 10)
            .unwrap()
            .with_timezone(&Utc);

        let slices = split_by_local_day(start, end, &tz);
        assert_eq!(
            slices,
            vec![
                DaySlice {
                    day: date(2026, 1, 1),
                    seconds: 10.0
                },
                DaySlice {
                    day: date(2026, 1, 2),
                    seconds: 10.0
                },
            ]
        );
    }

    #[test]
    fn covers_whole_days_in_between() {
        let tz = seoul();
        let start = tz
            .with_ymd_and_hms(2026, 1, 1, 22, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let end = tz
            .with_ymd_and_hms(2026, 1, 3, 2, 0, 0)
            .unwrap()
            .with_timezone(&Utc);

        let seconds = split_by_local_day(start, end, &tz)
            .into_iter()
            .map(|slice| (day_key(slice.day), slice.seconds))
            .collect::<Vec<_>>();
        assert_eq!(
            seconds,
            vec![
                ("2026-01-01".to_string(), 7200.0),
                ("2026-01-02".to_string(), 86400.0),
                ("2026-01-03".to_string(), 7200.0),
            ]
        );
    }

    #[test]
    fn uses_real_midnights_across_spring_forward() {
        let start = New_York
            .with_ymd_and_hms(2026, 3, 7, 23, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let end = New_York
            .with_ymd_and_hms(2026, 3, 9, 1, 0, 0)
            .unwrap()
            .with_timezone(&Utc);

        let slices = split_by_local_day(start, end, &New_York);
        let seconds = slices.iter().map(|slice| slice.seconds).collect::<Vec<_>>();
        assert_eq!(seconds, vec![3600.0, 23.0 * 3600.0, 3600.0]);
        assert_eq!(slices[1].day, date(2026, 3, 8));
    }

    #[test]
    fn keeps_a_fall_back_day_in_one_piece() {
        let start = New_York
            .with_ymd_and_hms(2026, 11, 1, 0, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let end = New_York
            .with_ymd_and_hms(2026, 11, 2, 0, 0, 0)
            .unwrap()
            .with_timezone(&Utc);

        let slices = split_by_local_day(start, end, &New_York);
        assert_eq!(
            slices,
            vec![DaySlice {
                day: date(2026, 11, 1),
                seconds: 25.0 * 3600.0
            }]
        );
    }

    #[test]
    fn empty_or_inverted_ranges_produce_nothing() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        assert!(split_by_local_day(at, at, &Utc).is_empty());
        assert!(split_by_local_day(at, at - chrono::Duration::seconds(5), &Utc).is_empty());
    }

    #[test]
    fn day_bounds_follow_the_zone() {
        let (start, end) = day_bounds_utc(&New_York, date(2026, 3, 8)).expect("bounds");
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 8, 5, 0, 0).unwrap());
        assert_eq!((end - start).num_hours(), 23);

        let (start, end) = day_bounds_utc(&seoul(), date(2026, 1, 1)).expect("bounds");
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 12, 31, 15, 0, 0).unwrap());
        assert_eq!((end - start).num_hours(), 24);
    }

    #[test]
    fn parses_and_formats_day_keys() {
        assert_eq!(parse_day_key(" 2026-02-28 "), Some(date(2026, 2, 28)));
        assert_eq!(parse_day_key("2026-02-30"), None);
        assert_eq!(day_key(date(2026, 7, 4)), "2026-07-04");
        assert_eq!(format_duration(3725.9), "01:02:05");
        assert_eq!(format_duration(-4.0), "00:00:00");
    }
}
