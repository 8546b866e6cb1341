//! Loader/Getter pairs for the three service families.
//!
//! Families differ in how a request is split, how a sub-range is fetched and
//! which store holds it. The rest of a load run is shared: clipping to the
//! upstream's availability, skipping cached sub-ranges, fetching on a bounded
//! pool and reporting each outcome.

pub mod gridded;
pub mod raster;
pub mod stations;

use chrono::{DateTime, Duration, Utc};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;

use crate::domain::{CancelFlag, Coordinate, RawSample, TimeRange};
use crate::error::EnviroError;
use crate::report::LoadReport;
use crate::service::{Getter, ServiceDefinition};
use crate::store::{CacheState, CacheStore};

/// The family-specific half of a loader.
pub trait Acquisition: Send + Sync {
    type Store: CacheStore;

    fn definition(&self) -> &ServiceDefinition;

    fn store(&self) -> &Self::Store;

    /// Cache-aligned units covering `range`.
    fn split(&self, range: &TimeRange) -> Vec<TimeRange>;

    fn is_cached(&self, part: &TimeRange) -> Result<bool, EnviroError>;

    fn fetch(&self, part: &TimeRange) -> Result<<Self::Store as CacheStore>::Payload, EnviroError>;
}

enum Outcome {
    Loaded,
    Cancelled,
    Failed(EnviroError),
}

pub fn run_load<A: Acquisition>(
    acquisition: &A,
    range: &TimeRange,
    cancel: &CancelFlag,
) -> LoadReport {
    let definition = acquisition.definition();
    let service = definition.label.as_str();
    let mut report = LoadReport::new(service);

    let Some(range) = clip_available(definition, range, &mut report) else {
        tracing::info!(service, "requested range predates upstream availability");
        return report;
    };

    let mut pending = Vec::new();
    for part in acquisition.split(&range) {
        if !definition.loader.refresh {
            match acquisition.is_cached(&part) {
                Ok(true) => {
                    tracing::debug!(service, %part, "already cached");
                    report.cached.push(part);
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(service, %part, error = %err, "cache lookup failed");
                    report.fail(part, err);
                    continue;
                }
            }
        }
        pending.push(part);
    }
    tracing::info!(
        service,
        %range,
        cached = report.cached.len(),
        pending = pending.len(),
        "loading"
    );

    let load_part = |part: &TimeRange| {
        if cancel.is_cancelled() {
            return (*part, Outcome::Cancelled);
        }
        let outcome = acquisition
            .fetch(part)
            .and_then(|payload| acquisition.store().put(part, &definition.domain, payload));
        match outcome {
            Ok(()) => (*part, Outcome::Loaded),
            Err(err) => (*part, Outcome::Failed(err)),
        }
    };
    let threads = definition.loader.max_parallel_fetches.max(1);
    let outcomes: Vec<(TimeRange, Outcome)> =
        match ThreadPoolBuilder::new().num_threads(threads).build() {
            Ok(pool) => pool.install(|| pending.par_iter().map(load_part).collect()),
            Err(err) => {
                tracing::debug!(error = %err, "falling back to sequential fetches");
                pending.iter().map(load_part).collect()
            }
        };

    for (part, outcome) in outcomes {
        match outcome {
            Outcome::Loaded => report.loaded.push(part),
            Outcome::Cancelled => report.cancelled.push(part),
            Outcome::Failed(err) => {
                tracing::warn!(service, %part, error = %err, "sub-range failed to load");
                report.fail(part, err);
            }
        }
    }
    report.sort();
    tracing::info!(
        service,
        loaded = report.loaded.len(),
        failed = report.failed.len(),
        cancelled = report.cancelled.len(),
        "load finished"
    );
    report
}

/// Cut off the part of `range` the upstream cannot serve.
fn clip_available(
    definition: &ServiceDefinition,
    range: &TimeRange,
    report: &mut LoadReport,
) -> Option<TimeRange> {
    let Some(from) = definition.loader.available_from else {
        return Some(*range);
    };
    if range.end < from {
        report.unavailable.push(*range);
        return None;
    }
    if range.start < from {
        report.unavailable.push(TimeRange {
            start: range.start,
            end: from - Duration::seconds(1),
        });
        return Some(TimeRange {
            start: from,
            end: range.end,
        });
    }
    Some(*range)
}

/// Answers queries from a family's store, converting to service variables.
pub struct StoreGetter<S: CacheStore> {
    definition: ServiceDefinition,
    store: S,
}

impl<S: CacheStore> StoreGetter<S> {
    pub fn new(definition: ServiceDefinition, store: S) -> Self {
        Self { definition, store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: CacheStore> Getter for StoreGetter<S> {
    fn get(
        &self,
        coordinate: &Coordinate,
        query_time: DateTime<Utc>,
        lookback: Duration,
        lookahead: Duration,
    ) -> Result<Vec<RawSample>, EnviroError> {
        if !self.definition.domain.contains(coordinate) {
            return Err(EnviroError::OutOfDomain(format!(
                "{coordinate} outside the domain of {}",
                self.definition.label
            )));
        }
        let window = TimeRange::around(query_time, lookback, lookahead);
        let mut samples = Vec::new();
        let mut first_error = None;
        let mut answered = false;
        for variable in &self.definition.variables {
            let binding = &variable.binding;
            match self.store.read(coordinate, &window, &binding.source) {
                Ok(raw) => {
                    answered = true;
                    samples.extend(raw.into_iter().map(|sample| RawSample {
                        variable: variable.name.clone(),
                        value: sample.value.map(|value| binding.convert(value)),
                        ..sample
                    }));
                }
                Err(err @ EnviroError::OutOfDomain(_)) => return Err(err),
                Err(err) => {
                    tracing::debug!(
                        service = %self.definition.label,
                        variable = %variable.name,
                        error = %err,
                        "variable unavailable"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) if !answered => Err(err),
            _ => Ok(samples),
        }
    }

    fn cache_state(&self) -> Result<CacheState, EnviroError> {
        self.store.cache_state()
    }
}
