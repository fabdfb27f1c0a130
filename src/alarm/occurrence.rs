use chrono::{DateTime, Datelike, Days, LocalResult, NaiveDate, NaiveDateTime, TimeZone};

use crate::alarm::model::Alarm;

/// Day offsets examined for a repeating alarm. Offset 7 covers the case where
/// the only selected weekday is today and today's time has already passed.
const REPEATING_SCAN_DAYS: u64 = 7;

/// Day offsets examined for a one-shot alarm. Tomorrow's time may fall in a
/// DST gap, in which case the day after is used.
const ONE_SHOT_SCAN_DAYS: u64 = 2;

/// Returns the first instant strictly after `now` at which `alarm` is due.
///
/// One-shot alarms (no repeat days) are due today at their time of day, or
/// on the next day where that local time exists once today's has passed. Repeating alarms are due on the
/// nearest selected weekday whose time is still ahead. `is_active` is not
/// consulted; callers filter inactive alarms out.
pub fn next_occurrence<Tz>(alarm: &Alarm, now: &DateTime<Tz>) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    let timezone = now.timezone();
    let today = now.date_naive();
    if alarm.is_one_shot() {
        return (0..=ONE_SHOT_SCAN_DAYS)
            .find_map(|offset| candidate_after(alarm, today, offset, now, &timezone));
    }

    (0..=REPEATING_SCAN_DAYS).find_map(|offset| {
        let date = today.checked_add_days(Days::new(offset))?;
        if !alarm.repeats_on(date.weekday()) {
            return None;
        }
        candidate_after(alarm, today, offset, now, &timezone)
    })
}

fn candidate_after<Tz>(
    alarm: &Alarm,
    today: NaiveDate,
    offset: u64,
    now: &DateTime<Tz>,
    timezone: &Tz,
) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    let date = today.checked_add_days(Days::new(offset))?;
    let candidate = resolve_local_datetime(timezone, date.and_time(alarm.time.to_naive_time()))?;
    (candidate > *now).then_some(candidate)
}

fn resolve_local_datetime<Tz>(timezone: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    match timezone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(first, _second) => Some(first),
        LocalResult::None => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime, TimeZone, Weekday};
    use chrono_tz::America::New_York;
    use chrono_tz::Tz;

    use super::*;
    use crate::alarm::model::{TimeOfDay, weekday_index};

    fn alarm(time: &str, days: &[u8]) -> Alarm {
        Alarm {
            id: "a".to_string(),
            time: time.parse::<TimeOfDay>().expect("time"),
            label: "Alarm".to_string(),
            days: days.to_vec(),
            is_active: true,
        }
    }

    fn weekday(day: Weekday) -> u8 {
        weekday_index(day)
    }

    // 2026-10-19 is a Monday.
    fn utc(day: u32, hour: u32, minute: u32) -> DateTime<Tz> {
        Tz::UTC
            .with_ymd_and_hms(2026, 10, day, hour, minute, 0)
            .single()
            .expect("valid instant")
    }

    #[test]
    fn one_shot_later_today() {
        let next = next_occurrence(&alarm("08:00", &[]), &utc(19, 7, 0));
        assert_eq!(next, Some(utc(19, 8, 0)));
    }

    #[test]
    fn one_shot_already_passed_rolls_to_tomorrow() {
        let next = next_occurrence(&alarm("08:00", &[]), &utc(19, 9, 0));
        assert_eq!(next, Some(utc(20, 8, 0)));
    }

    #[test]
    fn one_shot_exactly_now_is_not_due() {
        let next = next_occurrence(&alarm("08:00", &[]), &utc(19, 8, 0));
        assert_eq!(next, Some(utc(20, 8, 0)));
    }

    #[test]
    fn repeating_picks_nearest_selected_weekday() {
        let days = [weekday(Weekday::Mon), weekday(Weekday::Wed)];
        // Tuesday 09:00
        let next = next_occurrence(&alarm("10:00", &days), &utc(20, 9, 0));
        assert_eq!(next, Some(utc(21, 10, 0)));
    }

    #[test]
    fn repeating_same_weekday_passed_goes_to_next_week() {
        let days = [weekday(Weekday::Mon)];
        // Monday 11:00
        let next = next_occurrence(&alarm("10:00", &days), &utc(19, 11, 0));
        assert_eq!(next, Some(utc(26, 10, 0)));
    }

    #[test]
    fn repeating_today_still_ahead() {
        let days = [weekday(Weekday::Mon)];
        let next = next_occurrence(&alarm("10:00", &days), &utc(19, 9, 59));
        assert_eq!(next, Some(utc(19, 10, 0)));
    }

    #[test]
    fn repeating_wraps_past_saturday() {
        let days = [weekday(Weekday::Sun)];
        // Saturday 2026-10-24 23:00 -> Sunday 2026-10-25 06:00
        let next = next_occurrence(&alarm("06:00", &days), &utc(24, 23, 0));
        assert_eq!(next, Some(utc(25, 6, 0)));
    }

    #[test]
    fn result_is_strictly_after_reference() {
        let every_day = [0, 1, 2, 3, 4, 5, 6];
        let midnight = alarm("00:00", &every_day);
        let now = utc(19, 0, 0);
        let next = next_occurrence(&midnight, &now).expect("next");
        assert!(next > now);
        assert_eq!(next, utc(20, 0, 0));
    }

    #[test]
    fn dst_spring_forward_nonexistent_time_is_skipped() {
        let days = [weekday(Weekday::Sun)];
        let now = New_York
            .with_ymd_and_hms(2026, 3, 8, 0, 30, 0)
            .single()
            .expect("valid");
        let next = next_occurrence(&alarm("02:30", &days), &now).expect("next occurrence");
        assert_eq!(
            next.date_naive(),
            NaiveDate::from_ymd_opt(2026, 3, 15).expect("valid date")
        );
    }

    #[test]
    fn one_shot_skips_tomorrow_when_it_falls_in_dst_gap() {
        // 02:30 on 2026-03-08 does not exist in New York.
        let now = New_York
            .with_ymd_and_hms(2026, 3, 7, 3, 0, 0)
            .single()
            .expect("valid");
        let expected = New_York
            .with_ymd_and_hms(2026, 3, 9, 2, 30, 0)
            .single()
            .expect("valid");

        let next = next_occurrence(&alarm("02:30", &[]), &now);
        assert_eq!(next, Some(expected));
    }

    #[test]
    fn dst_fall_back_chooses_first_ambiguous_instance() {
        let now = New_York
            .with_ymd_and_hms(2026, 11, 1, 0, 0, 0)
            .single()
            .expect("valid");
        let naive = NaiveDateTime::new(
            NaiveDate::from_ymd_opt(2026, 11, 1).expect("date"),
            NaiveTime::from_hms_opt(1, 30, 0).expect("time"),
        );
        let expected = match New_York.from_local_datetime(&naive) {
            LocalResult::Ambiguous(first, _second) => first,
            _ => panic!("expected ambiguous local time"),
        };

        let actual = next_occurrence(&alarm("01:30", &[]), &now).expect("next");
        assert_eq!(actual, expected);
    }
}
