use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::TimeRange;

/// Outcome of one `Loader::load` run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub service: String,
    /// Sub-ranges already present in the cache and skipped.
    pub cached: Vec<TimeRange>,
    /// Sub-ranges fetched and committed by this run.
    pub loaded: Vec<TimeRange>,
    pub failed: Vec<FailedRange>,
    /// Parts of the request before the upstream's first available date.
    pub unavailable: Vec<TimeRange>,
    /// Sub-ranges not started because the run was cancelled.
    pub cancelled: Vec<TimeRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedRange {
    pub range: TimeRange,
    pub error: String,
}

impl LoadReport {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }

    pub fn fail(&mut self, range: TimeRange, error: impl ToString) {
        self.failed.push(FailedRange {
            range,
            error: error.to_string(),
        });
    }

    pub(crate) fn sort(&mut self) {
        self.cached.sort();
        self.loaded.sort();
        self.failed.sort_by_key(|failed| failed.range);
        self.unavailable.sort();
        self.cancelled.sort();
    }

    /// Fold another report for the same service into this one.
    pub fn merge(&mut self, other: LoadReport) {
        self.cached.extend(other.cached);
        self.loaded.extend(other.loaded);
        self.failed.extend(other.failed);
        self.unavailable.extend(other.unavailable);
        self.cancelled.extend(other.cancelled);
        self.sort();
    }
}

/// Per-service reports of `Environment::load_all`, keyed by label.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSummary {
    pub services: BTreeMap<String, LoadReport>,
}

impl LoadSummary {
    pub fn record(&mut self, report: LoadReport) {
        match self.services.get_mut(&report.service) {
            Some(existing) => existing.merge(report),
            None => {
                let mut report = report;
                report.sort();
                self.services.insert(report.service.clone(), report);
            }
        }
    }

    pub fn is_success(&self) -> bool {
        self.services.values().all(LoadReport::is_success)
    }
}
