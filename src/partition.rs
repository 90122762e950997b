use std::path::PathBuf;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};

use crate::model::Tier;

/// Enumerates the partition file paths a tier's storage layout would use to
/// cover `[start, end)` for the cartesian product of `sensors` and `assets`.
///
/// Path grammar: `<asset>/<YYYY>/<MM>[/<DD>[/<HH>]]/<sensor>[.suffix].parquet`,
/// relative to a storage root supplied by the caller. Raw partitions are
/// hourly, aggregated (minute) partitions are daily, daily partitions are
/// monthly. Calendar stepping always goes through `chrono` date arithmetic;
/// naive field increments (`hour + 1` without rollover) are never used,
/// since that silently produces invalid dates across hour/day/month/year
/// boundaries.
pub fn enumerate(
    sensors: &[String],
    assets: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    tier: Tier,
) -> Vec<PathBuf> {
    if start >= end || sensors.is_empty() || assets.is_empty() {
        return Vec::new();
    }

    let mut paths = Vec::new();
    for asset in assets {
        for sensor in sensors {
            match tier {
                Tier::Raw => paths.extend(hourly_paths(asset, sensor, start, end)),
                Tier::Aggregated => paths.extend(daily_paths(asset, sensor, start, end, "agg")),
                Tier::Daily => paths.extend(monthly_paths(asset, sensor, start, end)),
            }
        }
    }
    paths
}

fn hourly_paths(asset: &str, sensor: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<PathBuf> {
    let mut cursor = truncate_to_hour(start);
    let mut out = Vec::new();
    while cursor < end {
        out.push(PathBuf::from(format!(
            "{asset}/{:04}/{:02}/{:02}/{:02}/{sensor}.parquet",
            cursor.year(),
            cursor.month(),
            cursor.day(),
            cursor.hour()
        )));
        cursor = match cursor.checked_add_signed(Duration::hours(1)) {
            Some(next) => next,
            None => break,
        };
    }
    out
}

fn daily_paths(
    asset: &str,
    sensor: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    suffix: &str,
) -> Vec<PathBuf> {
    let mut cursor = truncate_to_day(start);
    let mut out = Vec::new();
    while cursor < end {
        out.push(PathBuf::from(format!(
            "{asset}/{:04}/{:02}/{:02}/{sensor}.{suffix}.parquet",
            cursor.year(),
            cursor.month(),
            cursor.day()
        )));
        cursor = match cursor.checked_add_signed(Duration::days(1)) {
            Some(next) => next,
            None => break,
        };
    }
    out
}

fn monthly_paths(asset: &str, sensor: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<PathBuf> {
    let mut cursor = truncate_to_month(start);
    let mut out = Vec::new();
    while cursor < end {
        out.push(PathBuf::from(format!(
            "{asset}/{:04}/{:02}/{sensor}.daily.parquet",
            cursor.year(),
            cursor.month()
        )));
        cursor = match next_month(cursor) {
            Some(next) => next,
            None => break,
        };
    }
    out
}

fn truncate_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
        .single()
        .unwrap_or(t)
}

fn truncate_to_day(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
        .single()
        .unwrap_or(t)
}

fn truncate_to_month(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(t)
}

/// Steps one calendar month forward, rolling the year over at December ->
/// January rather than incrementing the month field past 12.
fn next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    let date = NaiveDate::from_ymd_opt(year, month, 1)?;
    Utc.from_local_datetime(&date.and_hms_opt(0, 0, 0)?)
        .single()
}

/// Lists the calendar dates (UTC) touched by `[start, end)`, used by the
/// rebuilder to decide which aggregated-tier chunks need regenerating.
pub fn dates_in_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<NaiveDate> {
    if start >= end {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut cursor = start.date_naive();
    let last = (end - Duration::nanoseconds(1)).date_naive();
    while cursor <= last {
        out.push(cursor);
        cursor = match cursor.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn hourly_paths_cover_each_hour_in_range() {
        let sensors = vec!["temp".to_string()];
        let assets = vec!["pump1".to_string()];
        let paths = enumerate(
            &sensors,
            &assets,
            dt(2024, 1, 1, 22),
            dt(2024, 1, 2, 2),
            Tier::Raw,
        );
        assert_eq!(paths.len(), 4);
        assert_eq!(
            paths[0],
            PathBuf::from("pump1/2024/01/01/22/temp.parquet")
        );
        assert_eq!(
            paths[3],
            PathBuf::from("pump1/2024/01/02/01/temp.parquet")
        );
    }

    #[test]
    fn hourly_paths_roll_over_midnight_and_month_boundaries_correctly() {
        let sensors = vec!["temp".to_string()];
        let assets = vec!["pump1".to_string()];
        let paths = enumerate(
            &sensors,
            &assets,
            dt(2024, 1, 31, 23),
            dt(2024, 2, 1, 2),
            Tier::Raw,
        );
        let expected = [
            "pump1/2024/01/31/23/temp.parquet",
            "pump1/2024/02/01/00/temp.parquet",
            "pump1/2024/02/01/01/temp.parquet",
        ];
        assert_eq!(paths.len(), expected.len());
        for (path, exp) in paths.iter().zip(expected.iter()) {
            assert_eq!(path, &PathBuf::from(*exp));
        }
    }

    #[test]
    fn monthly_paths_roll_december_into_next_year() {
        let sensors = vec!["temp".to_string()];
        let assets = vec!["pump1".to_string()];
        let paths = enumerate(
            &sensors,
            &assets,
            dt(2023, 11, 1, 0),
            dt(2024, 2, 1, 0),
            Tier::Daily,
        );
        assert_eq!(
            paths,
            vec![
                PathBuf::from("pump1/2023/11/temp.daily.parquet"),
                PathBuf::from("pump1/2023/12/temp.daily.parquet"),
                PathBuf::from("pump1/2024/01/temp.daily.parquet"),
            ]
        );
    }

    #[test]
    fn cartesian_product_over_sensors_and_assets() {
        let sensors = vec!["a".to_string(), "b".to_string()];
        let assets = vec!["x".to_string(), "y".to_string()];
        let paths = enumerate(&sensors, &assets, dt(2024, 1, 1, 0), dt(2024, 1, 1, 1), Tier::Raw);
        assert_eq!(paths.len(), 4);
    }

    #[test]
    fn empty_range_or_empty_selectors_yield_no_paths() {
        let sensors = vec!["a".to_string()];
        let assets = vec!["x".to_string()];
        assert!(enumerate(&sensors, &assets, dt(2024, 1, 1, 1), dt(2024, 1, 1, 1), Tier::Raw).is_empty());
        assert!(enumerate(&[], &assets, dt(2024, 1, 1, 0), dt(2024, 1, 1, 1), Tier::Raw).is_empty());
    }

    #[test]
    fn dates_in_range_is_calendar_correct_across_month_end() {
        let dates = dates_in_range(dt(2024, 1, 30, 0), dt(2024, 2, 2, 0));
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2024, 1, 30).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
                NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            ]
        );
    }
}
