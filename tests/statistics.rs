use chrono::{DateTime, Duration, FixedOffset, Utc};

use envirocode::domain::{CellRef, RawSample};
use envirocode::statistics::{Aggregation, StatisticCatalogue, StatisticDefinition, aggregate};

fn utc(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .unwrap()
        .with_timezone(&Utc)
}

fn sample(timestamp: &str, value: Option<f64>) -> RawSample {
    RawSample {
        timestamp: utc(timestamp),
        cell: CellRef::Grid { x: 0, y: 0 },
        variable: "no2".to_string(),
        value,
    }
}

fn utc_tz() -> FixedOffset {
    FixedOffset::east_opt(0).unwrap()
}

fn builtin(name: &str) -> StatisticDefinition {
    StatisticCatalogue::with_builtins().resolve(name).unwrap()
}

#[test]
fn every_statistic_is_none_without_data() {
    let catalogue = StatisticCatalogue::with_builtins();
    let query = utc("2024-01-05T12:00:00Z");
    let all_missing = vec![
        sample("2024-01-05T11:00:00Z", None),
        sample("2024-01-05T12:00:00Z", None),
    ];
    for name in catalogue.names() {
        let statistic = catalogue.get(name).unwrap();
        assert_eq!(aggregate(&[], statistic, query, utc_tz()), None, "{name} on empty input");
        assert_eq!(
            aggregate(&all_missing, statistic, query, utc_tz()),
            None,
            "{name} on missing values"
        );
    }
}

#[test]
fn mean_of_three_samples() {
    let statistic =
        StatisticDefinition::new("mean_24h", -Duration::days(1), Duration::zero(), Aggregation::Mean)
            .unwrap();
    let samples = vec![
        sample("2024-01-01T12:00:00Z", Some(5.0)),
        sample("2024-01-01T13:00:00Z", Some(7.0)),
        sample("2024-01-01T14:00:00Z", Some(3.0)),
    ];
    let value = aggregate(&samples, &statistic, utc("2024-01-02T00:00:00Z"), utc_tz());
    assert_eq!(value, Some(5.0));
}

#[test]
fn missing_values_are_not_zeros() {
    let statistic =
        StatisticDefinition::new("min_24h", -Duration::days(1), Duration::zero(), Aggregation::Min)
            .unwrap();
    let samples = vec![
        sample("2024-01-01T12:00:00Z", Some(5.0)),
        sample("2024-01-01T13:00:00Z", None),
        sample("2024-01-01T14:00:00Z", Some(f64::NAN)),
    ];
    let value = aggregate(&samples, &statistic, utc("2024-01-02T00:00:00Z"), utc_tz());
    assert_eq!(value, Some(5.0));
}

#[test]
fn window_bounds_are_closed() {
    let statistic =
        StatisticDefinition::new("mean_24h", -Duration::days(1), Duration::zero(), Aggregation::Mean)
            .unwrap();
    let samples = vec![
        sample("2024-01-01T00:00:00Z", Some(10.0)),
        sample("2024-01-02T00:00:00Z", Some(20.0)),
        sample("2024-01-02T00:00:01Z", Some(1000.0)),
        sample("2023-12-31T23:59:59Z", Some(1000.0)),
    ];
    let value = aggregate(&samples, &statistic, utc("2024-01-02T00:00:00Z"), utc_tz());
    assert_eq!(value, Some(15.0));
}

#[test]
fn current_picks_the_closest_sample_within_tolerance() {
    let statistic = builtin("current");
    let query = utc("2024-01-01T12:00:00Z");
    let samples = vec![
        sample("2024-01-01T11:40:00Z", Some(1.0)),
        sample("2024-01-01T12:25:00Z", Some(2.0)),
        sample("2024-01-01T12:00:00Z", None),
    ];
    assert_eq!(aggregate(&samples, &statistic, query, utc_tz()), Some(1.0));

    let far = vec![sample("2024-01-01T12:45:00Z", Some(3.0))];
    assert_eq!(aggregate(&far, &statistic, query, utc_tz()), None);
}

#[test]
fn days_without_data_are_skipped_by_the_outer_function() {
    let statistic = builtin("3day_mean_day_max");
    let samples = vec![
        sample("2024-01-02T06:00:00Z", Some(4.0)),
        sample("2024-01-02T15:00:00Z", Some(10.0)),
        sample("2024-01-04T09:00:00Z", Some(20.0)),
        sample("2024-01-05T01:00:00Z", None),
    ];
    let value = aggregate(&samples, &statistic, utc("2024-01-05T12:00:00Z"), utc_tz());
    assert_eq!(value, Some(15.0));
}

#[test]
fn mean_of_daily_maxima_over_three_days_of_hourly_samples() {
    let statistic = builtin("3day_mean_day_max");
    let mut samples = Vec::new();
    for (day, peak) in [(2, 5.0), (3, 7.0), (4, 3.0)] {
        for hour in 0..24 {
            let value = if hour == 14 { peak } else { peak - 2.0 };
            samples.push(sample(&format!("2024-01-{day:02}T{hour:02}:00:00Z"), Some(value)));
        }
    }
    let value = aggregate(&samples, &statistic, utc("2024-01-04T23:00:00Z"), utc_tz());
    assert_eq!(value, Some(5.0));
}

#[test]
fn daily_buckets_follow_the_service_timezone() {
    let statistic = builtin("day_mean");
    let plus_one = FixedOffset::east_opt(3600).unwrap();
    let samples = vec![
        sample("2024-03-09T22:30:00Z", Some(100.0)),
        sample("2024-03-09T23:30:00Z", Some(4.0)),
        sample("2024-03-10T10:00:00Z", Some(6.0)),
    ];
    let value = aggregate(&samples, &statistic, utc("2024-03-10T12:00:00Z"), plus_one);
    assert_eq!(value, Some(5.0));
}

#[test]
fn amplitude_and_delta() {
    let query = utc("2024-01-02T00:00:00Z");
    let samples: Vec<RawSample> = [1.0, 2.0, 3.0, 4.0, 20.0, 6.0]
        .iter()
        .enumerate()
        .map(|(hour, value)| RawSample {
            timestamp: utc("2024-01-01T10:00:00Z") + Duration::hours(hour as i64),
            cell: CellRef::Grid { x: 0, y: 0 },
            variable: "t2m".to_string(),
            value: Some(*value),
        })
        .collect();
    assert_eq!(
        aggregate(&samples, &builtin("24h_amplitude"), query, utc_tz()),
        Some(19.0)
    );
    assert_eq!(
        aggregate(&samples, &builtin("24h_max_3h_delta"), query, utc_tz()),
        Some(18.0)
    );
}

#[test]
fn mda8_is_the_best_eight_hour_mean() {
    let samples: Vec<RawSample> = (0..24)
        .map(|hour| RawSample {
            timestamp: utc("2024-07-01T00:00:00Z") + Duration::hours(hour),
            cell: CellRef::Station {
                id: "DEBY099".to_string(),
            },
            variable: "o3".to_string(),
            value: Some(if (8..16).contains(&hour) { 9.0 } else { 1.0 }),
        })
        .collect();
    let value = aggregate(&samples, &builtin("mda8"), utc("2024-07-01T12:00:00Z"), utc_tz());
    assert_eq!(value, Some(9.0));
}
