use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufReader, Write};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use super::{CacheState, CacheStore, WriteLock, write_bytes_atomic};
use crate::domain::{BoundingBox, CellRef, Coordinate, RawSample, TimeRange, day_range};
use crate::error::EnviroError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    #[default]
    Nearest,
    Bilinear,
}

/// A regular lon/lat grid over a series of time steps.
///
/// Values of each variable are stored flattened in `[t][y][x]` order with
/// `None` for cells without data. Axes are kept ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridFile {
    pub lon: Vec<f64>,
    pub lat: Vec<f64>,
    pub time: Vec<DateTime<Utc>>,
    pub variables: BTreeMap<String, Vec<Option<f64>>>,
}

impl GridFile {
    pub fn new(
        lon: Vec<f64>,
        lat: Vec<f64>,
        time: Vec<DateTime<Utc>>,
        variables: BTreeMap<String, Vec<Option<f64>>>,
    ) -> Result<Self, EnviroError> {
        if lon.is_empty() || lat.is_empty() {
            return Err(EnviroError::Decode("grid without spatial axes".to_string()));
        }
        let expected = lon.len() * lat.len() * time.len();
        for (name, values) in &variables {
            if values.len() != expected {
                return Err(EnviroError::Decode(format!(
                    "variable {name}: {} values for a {}x{}x{} grid",
                    values.len(),
                    time.len(),
                    lat.len(),
                    lon.len()
                )));
            }
        }
        let mut grid = Self {
            lon,
            lat,
            time,
            variables,
        };
        grid.make_ascending();
        Ok(grid)
    }

    fn make_ascending(&mut self) {
        let (nx, ny) = (self.lon.len(), self.lat.len());
        let flip_x = nx > 1 && self.lon[0] > self.lon[nx - 1];
        let flip_y = ny > 1 && self.lat[0] > self.lat[ny - 1];
        if !flip_x && !flip_y {
            return;
        }
        if flip_x {
            self.lon.reverse();
        }
        if flip_y {
            self.lat.reverse();
        }
        for values in self.variables.values_mut() {
            let original = values.clone();
            for (index, value) in values.iter_mut().enumerate() {
                let (t, rest) = (index / (nx * ny), index % (nx * ny));
                let (y, x) = (rest / nx, rest % nx);
                let source_y = if flip_y { ny - 1 - y } else { y };
                let source_x = if flip_x { nx - 1 - x } else { x };
                *value = original[t * nx * ny + source_y * nx + source_x];
            }
        }
    }

    pub fn extent(&self) -> BoundingBox {
        let half = |axis: &[f64]| {
            if axis.len() > 1 {
                (axis[1] - axis[0]).abs() / 2.0
            } else {
                0.0
            }
        };
        let (hx, hy) = (half(&self.lon), half(&self.lat));
        BoundingBox {
            west: self.lon[0] - hx,
            south: self.lat[0] - hy,
            east: self.lon[self.lon.len() - 1] + hx,
            north: self.lat[self.lat.len() - 1] + hy,
        }
    }

    fn value(&self, variable: &[Option<f64>], t: usize, y: usize, x: usize) -> Option<f64> {
        variable[t * self.lat.len() * self.lon.len() + y * self.lon.len() + x]
    }

    /// Time steps that fall within `range`, as a new grid.
    pub fn slice(&self, range: &TimeRange) -> GridFile {
        let cells = self.lon.len() * self.lat.len();
        let steps: Vec<usize> = (0..self.time.len())
            .filter(|t| range.contains(&self.time[*t]))
            .collect();
        let variables = self
            .variables
            .iter()
            .map(|(name, values)| {
                let sliced = steps
                    .iter()
                    .flat_map(|t| values[t * cells..(t + 1) * cells].iter().copied())
                    .collect();
                (name.clone(), sliced)
            })
            .collect();
        GridFile {
            lon: self.lon.clone(),
            lat: self.lat.clone(),
            time: steps.iter().map(|t| self.time[*t]).collect(),
            variables,
        }
    }

    /// Steps of `self` outside `range` combined with every step of `update`.
    ///
    /// A file on different axes cannot be combined and is replaced by `update`.
    pub fn merged_with(&self, update: GridFile, range: &TimeRange) -> GridFile {
        if self.lon != update.lon || self.lat != update.lat {
            return update;
        }
        let cells = self.lon.len() * self.lat.len();
        let mut steps: Vec<(DateTime<Utc>, &GridFile, usize)> = (0..self.time.len())
            .filter(|t| !range.contains(&self.time[*t]))
            .map(|t| (self.time[t], self, t))
            .chain((0..update.time.len()).map(|t| (update.time[t], &update, t)))
            .collect();
        steps.sort_by_key(|(timestamp, _, _)| *timestamp);

        let names: BTreeSet<&String> = self.variables.keys().chain(update.variables.keys()).collect();
        let variables = names
            .into_iter()
            .map(|name| {
                let values = steps
                    .iter()
                    .flat_map(|(_, grid, t)| match grid.variables.get(name) {
                        Some(values) => values[t * cells..(t + 1) * cells].to_vec(),
                        None => vec![None; cells],
                    })
                    .collect();
                (name.clone(), values)
            })
            .collect();
        GridFile {
            lon: update.lon.clone(),
            lat: update.lat.clone(),
            time: steps.iter().map(|(timestamp, _, _)| *timestamp).collect(),
            variables,
        }
    }

    fn sample(
        &self,
        coordinate: &Coordinate,
        variable: &[Option<f64>],
        t: usize,
        interpolation: Interpolation,
    ) -> (CellRef, Option<f64>) {
        let x = nearest_index(&self.lon, coordinate.longitude);
        let y = nearest_index(&self.lat, coordinate.latitude);
        let cell = CellRef::Grid { x, y };
        match interpolation {
            Interpolation::Nearest => (cell, self.value(variable, t, y, x)),
            Interpolation::Bilinear => {
                let (x0, x1, fx) = bracket(&self.lon, coordinate.longitude);
                let (y0, y1, fy) = bracket(&self.lat, coordinate.latitude);
                let corners = [
                    (self.value(variable, t, y0, x0), (1.0 - fx) * (1.0 - fy)),
                    (self.value(variable, t, y0, x1), fx * (1.0 - fy)),
                    (self.value(variable, t, y1, x0), (1.0 - fx) * fy),
                    (self.value(variable, t, y1, x1), fx * fy),
                ];
                let value = corners
                    .iter()
                    .try_fold(0.0, |acc, (value, weight)| value.map(|v| acc + v * weight));
                (cell, value)
            }
        }
    }
}

fn nearest_index(axis: &[f64], value: f64) -> usize {
    axis.iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (*a - value).abs().total_cmp(&(*b - value).abs()))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

/// Neighbouring indices around `value` on an ascending axis plus the weight of the upper one.
fn bracket(axis: &[f64], value: f64) -> (usize, usize, f64) {
    let last = axis.len() - 1;
    if last == 0 || value <= axis[0] {
        return (0, 0, 0.0);
    }
    if value >= axis[last] {
        return (last, last, 0.0);
    }
    let upper = axis.partition_point(|v| *v <= value).min(last);
    let lower = upper - 1;
    let span = axis[upper] - axis[lower];
    let weight = if span > 0.0 {
        (value - axis[lower]) / span
    } else {
        0.0
    };
    (lower, upper, weight)
}

/// Daily gzip-compressed JSON grid files laid out by a strftime pattern.
#[derive(Debug, Clone)]
pub struct GridStore {
    root: Utf8PathBuf,
    pattern: String,
    interpolation: Interpolation,
    lock: WriteLock,
}

impl GridStore {
    pub fn new(
        root: impl Into<Utf8PathBuf>,
        pattern: impl Into<String>,
        interpolation: Interpolation,
    ) -> Result<Self, EnviroError> {
        let pattern = pattern.into();
        validate_pattern(&pattern)?;
        Ok(Self {
            root: root.into(),
            pattern,
            interpolation,
            lock: WriteLock::default(),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn path_for(&self, day: NaiveDate) -> Utf8PathBuf {
        self.root.join(day.format(&self.pattern).to_string())
    }

    pub fn has_day(&self, day: NaiveDate) -> bool {
        self.path_for(day).is_file()
    }

    pub fn read_day(&self, day: NaiveDate) -> Result<Option<GridFile>, EnviroError> {
        let path = self.path_for(day);
        if !path.is_file() {
            return Ok(None);
        }
        let file = fs::File::open(path.as_std_path())
            .map_err(|err| EnviroError::Filesystem(format!("open {path}: {err}")))?;
        let grid: GridFile = serde_json::from_reader(BufReader::new(GzDecoder::new(file)))
            .map_err(|err| EnviroError::Decode(format!("{path}: {err}")))?;
        GridFile::new(grid.lon, grid.lat, grid.time, grid.variables).map(Some)
    }

    /// Writes the part of `payload` within `day_part`, keeping cached steps of the day outside it.
    fn write_day(
        &self,
        day: NaiveDate,
        day_part: &TimeRange,
        payload: &GridFile,
    ) -> Result<(), EnviroError> {
        let path = self.path_for(day);
        let _guard = self.lock.acquire(&path)?;
        let update = payload.slice(day_part);
        let grid = if *day_part == day_range(day) {
            update
        } else {
            match self.read_day(day)? {
                Some(existing) => existing.merged_with(update, day_part),
                None => update,
            }
        };
        let json = serde_json::to_vec(&grid).map_err(|err| EnviroError::Decode(err.to_string()))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .map_err(|err| EnviroError::Filesystem(err.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|err| EnviroError::Filesystem(err.to_string()))?;
        write_bytes_atomic(&path, &compressed)?;
        tracing::debug!(path = %path, steps = grid.time.len(), "wrote grid day");
        Ok(())
    }

    /// Days present in the cache, parsed back from the file layout.
    pub fn cached_days(&self) -> Result<Vec<NaiveDate>, EnviroError> {
        let mut files = Vec::new();
        collect_files(&self.root, &mut files)?;
        let mut days: Vec<NaiveDate> = files
            .iter()
            .filter_map(|path| path.strip_prefix(&self.root).ok())
            .filter_map(|relative| NaiveDate::parse_from_str(relative.as_str(), &self.pattern).ok())
            .collect();
        days.sort();
        days.dedup();
        Ok(days)
    }
}

impl CacheStore for GridStore {
    type Payload = GridFile;

    fn put(
        &self,
        range: &TimeRange,
        extent: &BoundingBox,
        payload: GridFile,
    ) -> Result<(), EnviroError> {
        let covered = payload.extent();
        if !(covered.contains(&Coordinate {
            longitude: extent.west,
            latitude: extent.south,
        }) && covered.contains(&Coordinate {
            longitude: extent.east,
            latitude: extent.north,
        })) {
            tracing::debug!(?covered, ?extent, "grid payload smaller than requested extent");
        }
        for day in range.days() {
            let Some(day_part) = day_range(day).intersection(range) else {
                continue;
            };
            self.write_day(day, &day_part, &payload)?;
        }
        Ok(())
    }

    fn read(
        &self,
        coordinate: &Coordinate,
        window: &TimeRange,
        variable: &str,
    ) -> Result<Vec<RawSample>, EnviroError> {
        let mut samples = Vec::new();
        let mut found_file = false;
        let mut found_variable = false;
        for day in window.days() {
            let Some(grid) = self.read_day(day)? else {
                continue;
            };
            found_file = true;
            if !grid.extent().contains(coordinate) {
                return Err(EnviroError::OutOfDomain(format!(
                    "{coordinate} outside cached grid {}",
                    self.path_for(day)
                )));
            }
            let Some(values) = grid.variables.get(variable) else {
                continue;
            };
            found_variable = true;
            for (t, timestamp) in grid.time.iter().enumerate() {
                if !window.contains(timestamp) {
                    continue;
                }
                let (cell, value) = grid.sample(coordinate, values, t, self.interpolation);
                samples.push(RawSample {
                    timestamp: *timestamp,
                    cell,
                    variable: variable.to_string(),
                    value,
                });
            }
        }
        if !found_file {
            return Err(EnviroError::CacheMiss(format!("{} for {window}", self.root)));
        }
        if !found_variable {
            return Err(EnviroError::CacheMiss(format!(
                "variable {variable} in {} for {window}",
                self.root
            )));
        }
        Ok(samples)
    }

    fn cache_state(&self) -> Result<CacheState, EnviroError> {
        let days = self.cached_days()?;
        Ok(CacheState {
            entries: days.len(),
            first: days.first().map(|day| day_range(*day).start),
            last: days.last().map(|day| day_range(*day).end),
        })
    }
}

/// The pattern must be relative, well formed and name one file per day.
fn validate_pattern(pattern: &str) -> Result<(), EnviroError> {
    if pattern.trim().is_empty() || pattern.starts_with('/') {
        return Err(EnviroError::InvalidConfiguration(format!(
            "grid path pattern must be a relative path: {pattern:?}"
        )));
    }
    if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
        return Err(EnviroError::InvalidConfiguration(format!(
            "malformed grid path pattern: {pattern}"
        )));
    }
    let probe = NaiveDate::from_ymd_opt(2001, 2, 3).unwrap_or_default();
    let rendered = probe.format(pattern).to_string();
    if NaiveDate::parse_from_str(&rendered, pattern).ok() != Some(probe) {
        return Err(EnviroError::InvalidConfiguration(format!(
            "grid path pattern must identify the day (year, month and day): {pattern}"
        )));
    }
    Ok(())
}

fn collect_files(dir: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> Result<(), EnviroError> {
    if !dir.is_dir() {
        return Ok(());
    }
    let entries = dir
        .read_dir_utf8()
        .map_err(|err| EnviroError::Filesystem(format!("read {dir}: {err}")))?;
    for entry in entries {
        let entry = entry.map_err(|err| EnviroError::Filesystem(err.to_string()))?;
        if entry.file_name().starts_with('.') {
            continue;
        }
        let path = entry.path().to_path_buf();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn pattern_validation() {
        assert!(validate_pattern("era5/%Y/%m/%Y%m%d.json.gz").is_ok());
        assert_matches!(
            validate_pattern("era5/%Y/%m.json.gz"),
            Err(EnviroError::InvalidConfiguration(_))
        );
        assert_matches!(
            validate_pattern("/abs/%Y%m%d.json.gz"),
            Err(EnviroError::InvalidConfiguration(_))
        );
        assert_matches!(
            validate_pattern("bad/%Q%Y%m%d"),
            Err(EnviroError::InvalidConfiguration(_))
        );
    }

    #[test]
    fn descending_latitude_is_flipped() {
        let grid = GridFile::new(
            vec![0.0, 1.0],
            vec![1.0, 0.0],
            vec![Utc::now()],
            BTreeMap::from([(
                "t2m".to_string(),
                vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)],
            )]),
        )
        .unwrap();
        assert_eq!(grid.lat, vec![0.0, 1.0]);
        assert_eq!(
            grid.variables["t2m"],
            vec![Some(3.0), Some(4.0), Some(1.0), Some(2.0)]
        );
    }

    #[test]
    fn bilinear_weights() {
        assert_eq!(bracket(&[0.0, 1.0, 2.0], 1.25), (1, 2, 0.25));
        assert_eq!(bracket(&[0.0, 1.0], -1.0), (0, 0, 0.0));
        assert_eq!(bracket(&[5.0], 5.0), (0, 0, 0.0));
    }
}
