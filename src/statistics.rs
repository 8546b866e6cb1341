//! Declarative statistics over raw samples.
//!
//! A [`StatisticDefinition`] is plain data: a window relative to the query
//! time, an outer [`Aggregation`] and an optional per-day aggregation. The
//! [`aggregate`] function interprets it. Missing values never turn into
//! zeros: an empty window yields `None` for every function.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};

use crate::domain::{RawSample, TimeRange};
use crate::error::EnviroError;

/// Tolerance of the built-in `current` statistic on either side of the query time.
pub const CURRENT_TOLERANCE_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Aggregation {
    /// Sample closest to the query time.
    Current,
    Mean,
    Min,
    Max,
    Sum,
    /// Max minus min.
    Amplitude,
    /// Largest absolute difference between samples `steps` positions apart.
    MaxAbsDelta { steps: usize },
    /// Maximum of the running 8-hour means of a day.
    Mda8,
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Current => write!(f, "current"),
            Aggregation::Mean => write!(f, "mean"),
            Aggregation::Min => write!(f, "min"),
            Aggregation::Max => write!(f, "max"),
            Aggregation::Sum => write!(f, "sum"),
            Aggregation::Amplitude => write!(f, "amplitude"),
            Aggregation::MaxAbsDelta { steps } => write!(f, "max_abs_delta_{steps}"),
            Aggregation::Mda8 => write!(f, "mda8"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticDefinition {
    name: String,
    #[serde(serialize_with = "serialize_offset")]
    start_offset: Duration,
    #[serde(serialize_with = "serialize_offset")]
    end_offset: Duration,
    function: Aggregation,
    daily: Option<Aggregation>,
    day_aligned: bool,
}

impl StatisticDefinition {
    pub fn new(
        name: impl Into<String>,
        start_offset: Duration,
        end_offset: Duration,
        function: Aggregation,
    ) -> Result<Self, EnviroError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(EnviroError::InvalidConfiguration(
                "statistic name must not be empty".to_string(),
            ));
        }
        if end_offset < start_offset {
            return Err(EnviroError::InvalidConfiguration(format!(
                "statistic {name}: window end {} before start {}",
                format_offset(end_offset),
                format_offset(start_offset)
            )));
        }
        Ok(Self {
            name,
            start_offset,
            end_offset,
            function,
            daily: None,
            day_aligned: false,
        })
    }

    /// Widen the window to whole local days.
    pub fn day_aligned(mut self) -> Self {
        self.day_aligned = true;
        self
    }

    /// Evaluate `daily` per local calendar day, then `function` over the days.
    pub fn bucketed(mut self, daily: Aggregation) -> Result<Self, EnviroError> {
        if matches!(daily, Aggregation::Current) || matches!(self.function, Aggregation::Current) {
            return Err(EnviroError::InvalidConfiguration(format!(
                "statistic {}: current cannot be combined with daily bucketing",
                self.name
            )));
        }
        self.daily = Some(daily);
        self.day_aligned = true;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_offset(&self) -> Duration {
        self.start_offset
    }

    pub fn end_offset(&self) -> Duration {
        self.end_offset
    }

    pub fn function(&self) -> Aggregation {
        self.function
    }

    pub fn daily(&self) -> Option<Aggregation> {
        self.daily
    }

    pub fn is_day_aligned(&self) -> bool {
        self.day_aligned
    }

    /// UTC window evaluated for a query at `query_time` in timezone `tz`.
    pub fn window(&self, query_time: DateTime<Utc>, tz: FixedOffset) -> TimeRange {
        let start = query_time + self.start_offset;
        let end = query_time + self.end_offset;
        if !self.day_aligned {
            return TimeRange { start, end };
        }
        TimeRange {
            start: local_midnight(start, tz),
            end: local_midnight(end, tz) + Duration::days(1) - Duration::nanoseconds(1),
        }
    }
}

/// Aggregate the samples of one variable according to `statistic`.
///
/// Returns `None` when the window holds no valid sample, for every
/// function. With daily bucketing, days without valid samples are skipped
/// by the outer function; if no day has data the result is `None`.
pub fn aggregate(
    samples: &[RawSample],
    statistic: &StatisticDefinition,
    query_time: DateTime<Utc>,
    tz: FixedOffset,
) -> Option<f64> {
    let window = statistic.window(query_time, tz);
    let mut points: Vec<(DateTime<Utc>, Option<f64>)> = samples
        .iter()
        .filter(|sample| window.contains(&sample.timestamp))
        .map(|sample| (sample.timestamp, sample.value.filter(|value| value.is_finite())))
        .collect();
    points.sort_by_key(|(timestamp, _)| *timestamp);

    match statistic.daily {
        None => apply(statistic.function, &points, query_time, tz),
        Some(daily) => {
            let mut days: BTreeMap<NaiveDate, Vec<(DateTime<Utc>, Option<f64>)>> = BTreeMap::new();
            for (timestamp, value) in points {
                days.entry(timestamp.with_timezone(&tz).date_naive())
                    .or_default()
                    .push((timestamp, value));
            }
            let per_day: Vec<(DateTime<Utc>, Option<f64>)> = local_days(&window, tz)
                .into_iter()
                .map(|day| {
                    let day_start = local_day_start(day, tz);
                    let value = days
                        .get(&day)
                        .and_then(|bucket| apply(daily, bucket, day_start, tz));
                    (day_start, value)
                })
                .collect();
            apply(statistic.function, &per_day, query_time, tz)
        }
    }
}

fn apply(
    function: Aggregation,
    points: &[(DateTime<Utc>, Option<f64>)],
    query_time: DateTime<Utc>,
    tz: FixedOffset,
) -> Option<f64> {
    let valid = || points.iter().filter_map(|(_, value)| *value);
    if valid().next().is_none() {
        return None;
    }
    match function {
        Aggregation::Current => {
            let mut best: Option<(Duration, f64)> = None;
            for (timestamp, value) in points {
                let Some(value) = value else { continue };
                let distance = (*timestamp - query_time).abs();
                if best.is_none_or(|(current, _)| distance < current) {
                    best = Some((distance, *value));
                }
            }
            best.map(|(_, value)| value)
        }
        Aggregation::Mean => {
            let (sum, count) = valid().fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
            Some(sum / count as f64)
        }
        Aggregation::Min => valid().reduce(f64::min),
        Aggregation::Max => valid().reduce(f64::max),
        Aggregation::Sum => Some(valid().sum()),
        Aggregation::Amplitude => {
            let max = valid().reduce(f64::max)?;
            let min = valid().reduce(f64::min)?;
            Some(max - min)
        }
        Aggregation::MaxAbsDelta { steps } => points
            .iter()
            .zip(points.iter().skip(steps.max(1)))
            .filter_map(|((_, earlier), (_, later))| Some((later.as_ref()? - earlier.as_ref()?).abs()))
            .reduce(f64::max),
        Aggregation::Mda8 => {
            let first = points.first()?.0;
            let base = local_midnight(first, tz);
            (0..16)
                .filter_map(|hour| {
                    let from = base + Duration::hours(hour);
                    let to = from + Duration::hours(8);
                    let values: Vec<f64> = points
                        .iter()
                        .filter(|(timestamp, _)| *timestamp >= from && *timestamp < to)
                        .filter_map(|(_, value)| *value)
                        .collect();
                    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
                })
                .reduce(f64::max)
        }
    }
}

fn local_midnight(time: DateTime<Utc>, tz: FixedOffset) -> DateTime<Utc> {
    local_day_start(time.with_timezone(&tz).date_naive(), tz)
}

fn local_day_start(day: NaiveDate, tz: FixedOffset) -> DateTime<Utc> {
    let midnight = day.and_hms_opt(0, 0, 0).unwrap_or_default();
    match tz.from_local_datetime(&midnight).single() {
        Some(local) => local.with_timezone(&Utc),
        None => Utc.from_utc_datetime(&midnight),
    }
}

fn local_days(window: &TimeRange, tz: FixedOffset) -> Vec<NaiveDate> {
    let first = window.start.with_timezone(&tz).date_naive();
    let last = window.end.with_timezone(&tz).date_naive();
    first.iter_days().take_while(|day| *day <= last).collect()
}

fn offset_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([+-]?\d+)\s*([dhm])$").unwrap())
}

/// Parse a signed window offset such as `-3d`, `1h`, `-30m` or `0`.
pub fn parse_offset(value: &str) -> Result<Duration, EnviroError> {
    let trimmed = value.trim();
    if trimmed == "0" {
        return Ok(Duration::zero());
    }
    let captures = offset_pattern()
        .captures(trimmed)
        .ok_or_else(|| EnviroError::InvalidConfiguration(format!("invalid offset: {value}")))?;
    let amount: i64 = captures[1]
        .parse()
        .map_err(|_| EnviroError::InvalidConfiguration(format!("invalid offset: {value}")))?;
    Ok(match &captures[2] {
        "d" => Duration::days(amount),
        "h" => Duration::hours(amount),
        _ => Duration::minutes(amount),
    })
}

pub fn format_offset(offset: Duration) -> String {
    let minutes = offset.num_minutes();
    if minutes == 0 {
        "0".to_string()
    } else if minutes % (24 * 60) == 0 {
        format!("{}d", minutes / (24 * 60))
    } else if minutes % 60 == 0 {
        format!("{}h", minutes / 60)
    } else {
        format!("{minutes}m")
    }
}

fn serialize_offset<S: Serializer>(offset: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_offset(*offset))
}

/// Named statistics available to variable definitions.
#[derive(Debug, Clone, Default)]
pub struct StatisticCatalogue {
    entries: BTreeMap<String, StatisticDefinition>,
}

impl StatisticCatalogue {
    pub fn with_builtins() -> Self {
        let mut catalogue = Self::default();
        for statistic in builtin_statistics() {
            catalogue.entries.insert(statistic.name.clone(), statistic);
        }
        catalogue
    }

    /// Adds or replaces a statistic.
    pub fn insert(&mut self, statistic: StatisticDefinition) {
        self.entries.insert(statistic.name.clone(), statistic);
    }

    pub fn get(&self, name: &str) -> Option<&StatisticDefinition> {
        self.entries.get(name)
    }

    pub fn resolve(&self, name: &str) -> Result<StatisticDefinition, EnviroError> {
        self.get(name)
            .cloned()
            .ok_or_else(|| EnviroError::InvalidConfiguration(format!("unknown statistic: {name}")))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

fn builtin_statistics() -> Vec<StatisticDefinition> {
    use Aggregation::*;

    let tolerance = Duration::minutes(CURRENT_TOLERANCE_MINUTES);
    let zero = Duration::zero();
    let day = Duration::days(1);
    let plain = |name: &str, start: Duration, function| {
        StatisticDefinition::new(name, start, zero, function)
    };
    let bucketed = |name: &str, start: Duration, daily, function| {
        StatisticDefinition::new(name, start, zero, function).and_then(|stat| stat.bucketed(daily))
    };

    let mut definitions = vec![
        StatisticDefinition::new("current", -tolerance, tolerance, Current),
        bucketed("day_min", zero, Min, Min),
        bucketed("day_mean", zero, Mean, Mean),
        bucketed("day_max", zero, Max, Max),
        bucketed("day_sum", zero, Sum, Sum),
        plain("24h_amplitude", -day, Amplitude),
        plain("24h_max_3h_delta", -day, MaxAbsDelta { steps: 3 }),
        plain("5day_max_3h_delta", -day * 5, MaxAbsDelta { steps: 3 }),
        bucketed("mda8", zero, Mda8, Mean),
        bucketed("3day_mean_mda8", -day * 3, Mda8, Mean),
        bucketed("7day_mean_mda8", -day * 7, Mda8, Mean),
    ];
    for days in [3, 5, 7] {
        let start = -day * days;
        definitions.extend([
            plain(format!("{days}day_min").as_str(), start, Min).map(StatisticDefinition::day_aligned),
            plain(format!("{days}day_mean").as_str(), start, Mean).map(StatisticDefinition::day_aligned),
            plain(format!("{days}day_max").as_str(), start, Max).map(StatisticDefinition::day_aligned),
            bucketed(format!("{days}day_mean_day_max").as_str(), start, Max, Mean),
            bucketed(format!("{days}day_max_day_max").as_str(), start, Max, Max),
            bucketed(format!("{days}day_mean_day_min").as_str(), start, Min, Mean),
            bucketed(format!("{days}day_min_day_min").as_str(), start, Min, Min),
        ]);
    }
    definitions.into_iter().flatten().collect()
}
