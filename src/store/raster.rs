use std::collections::HashMap;
use std::fs;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Duration, Utc};

use super::{CacheState, CacheStore, WriteLock, write_bytes_atomic};
use crate::domain::{BoundingBox, CellRef, Coordinate, RawSample, TimeRange};
use crate::error::EnviroError;

/// An ESRI ASCII grid: header lines followed by rows from north to south.
#[derive(Debug, Clone, PartialEq)]
pub struct AsciiGrid {
    pub ncols: usize,
    pub nrows: usize,
    /// Lower-left corner of the lower-left cell.
    pub xllcorner: f64,
    pub yllcorner: f64,
    pub cellsize: f64,
    pub nodata: Option<f64>,
    values: Vec<f64>,
}

impl AsciiGrid {
    pub fn extent(&self) -> BoundingBox {
        BoundingBox {
            west: self.xllcorner,
            south: self.yllcorner,
            east: self.xllcorner + self.ncols as f64 * self.cellsize,
            north: self.yllcorner + self.nrows as f64 * self.cellsize,
        }
    }

    /// Row (from the top) and column of the pixel containing `coordinate`.
    pub fn pixel(&self, coordinate: &Coordinate) -> Option<(usize, usize)> {
        let col = ((coordinate.longitude - self.xllcorner) / self.cellsize).floor();
        let from_bottom = ((coordinate.latitude - self.yllcorner) / self.cellsize).floor();
        if col < 0.0 || from_bottom < 0.0 {
            return None;
        }
        // The far edges belong to the last pixel.
        let col = (col as usize).min(self.ncols);
        let from_bottom = (from_bottom as usize).min(self.nrows);
        let col = if col == self.ncols && self.extent().contains(coordinate) {
            col - 1
        } else {
            col
        };
        let from_bottom = if from_bottom == self.nrows && self.extent().contains(coordinate) {
            from_bottom - 1
        } else {
            from_bottom
        };
        if col >= self.ncols || from_bottom >= self.nrows {
            return None;
        }
        Some((self.nrows - 1 - from_bottom, col))
    }

    pub fn value(&self, row: usize, col: usize) -> Option<f64> {
        let value = *self.values.get(row * self.ncols + col)?;
        match self.nodata {
            Some(nodata) if value == nodata => None,
            _ if !value.is_finite() => None,
            _ => Some(value),
        }
    }
}

impl FromStr for AsciiGrid {
    type Err = EnviroError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let mut header: HashMap<String, f64> = HashMap::new();
        let mut lines = content.lines().filter(|line| !line.trim().is_empty()).peekable();
        while let Some(line) = lines.peek() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
                break;
            };
            if !key.starts_with(|c: char| c.is_ascii_alphabetic()) {
                break;
            }
            let value: f64 = value
                .parse()
                .map_err(|_| EnviroError::Decode(format!("invalid header value: {line}")))?;
            header.insert(key.to_ascii_lowercase(), value);
            lines.next();
        }

        let field = |name: &str| {
            header
                .get(name)
                .copied()
                .ok_or_else(|| EnviroError::Decode(format!("ascii grid header lacks {name}")))
        };
        let dimension = |name: &str| {
            let value = field(name)?;
            if value.fract() != 0.0 || !(1.0..=f64::from(u32::MAX)).contains(&value) {
                return Err(EnviroError::Decode(format!("invalid {name}: {value}")));
            }
            Ok(value as usize)
        };
        let ncols = dimension("ncols")?;
        let nrows = dimension("nrows")?;
        let cells = ncols
            .checked_mul(nrows)
            .ok_or_else(|| EnviroError::Decode(format!("ascii grid too large: {ncols}x{nrows}")))?;
        let cellsize = field("cellsize")?;
        if !(cellsize > 0.0) {
            return Err(EnviroError::Decode("ascii grid without a cell size".to_string()));
        }
        let half = cellsize / 2.0;
        let xllcorner = field("xllcorner").or_else(|_| field("xllcenter").map(|x| x - half))?;
        let yllcorner = field("yllcorner").or_else(|_| field("yllcenter").map(|y| y - half))?;
        let nodata = header.get("nodata_value").copied();

        let values = lines
            .flat_map(str::split_whitespace)
            .map(|token| {
                token
                    .parse::<f64>()
                    .map_err(|_| EnviroError::Decode(format!("invalid cell value: {token}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if values.len() != cells {
            return Err(EnviroError::Decode(format!(
                "expected {cells} cells, found {}",
                values.len()
            )));
        }
        Ok(Self {
            ncols,
            nrows,
            xllcorner,
            yllcorner,
            cellsize,
            nodata,
            values,
        })
    }
}

/// A static raster layer ready to be cached under its source variable name.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterLayer {
    pub variable: String,
    pub content: Vec<u8>,
}

/// Static rasters, one `.asc` file per source variable.
#[derive(Debug, Clone)]
pub struct RasterStore {
    root: Utf8PathBuf,
    lock: WriteLock,
}

impl RasterStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: WriteLock::default(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn path_for(&self, variable: &str) -> Utf8PathBuf {
        self.root.join(format!("{variable}.asc"))
    }

    pub fn has_layer(&self, variable: &str) -> bool {
        self.path_for(variable).is_file()
    }

    fn put_layer(&self, extent: &BoundingBox, layer: RasterLayer) -> Result<(), EnviroError> {
        let text = std::str::from_utf8(&layer.content)
            .map_err(|err| EnviroError::Decode(format!("{}: {err}", layer.variable)))?;
        let grid: AsciiGrid = text.parse()?;
        let covered = grid.extent();
        if covered.east < extent.west
            || covered.west > extent.east
            || covered.north < extent.south
            || covered.south > extent.north
        {
            return Err(EnviroError::Decode(format!(
                "raster {} does not overlap the service domain",
                layer.variable
            )));
        }

        let path = self.path_for(&layer.variable);
        let _guard = self.lock.acquire(&path)?;
        write_bytes_atomic(&path, &layer.content)?;
        tracing::debug!(path = %path, "wrote raster layer");
        Ok(())
    }

    /// Parses the committed file on every call so a reload by any writer is seen.
    fn layer(&self, variable: &str) -> Result<AsciiGrid, EnviroError> {
        let path = self.path_for(variable);
        if !path.is_file() {
            return Err(EnviroError::CacheMiss(format!("raster {path}")));
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| EnviroError::Filesystem(format!("read {path}: {err}")))?;
        content.parse()
    }
}

impl CacheStore for RasterStore {
    type Payload = Vec<RasterLayer>;

    fn put(
        &self,
        _range: &TimeRange,
        extent: &BoundingBox,
        payload: Vec<RasterLayer>,
    ) -> Result<(), EnviroError> {
        for layer in payload {
            self.put_layer(extent, layer)?;
        }
        Ok(())
    }

    fn read(
        &self,
        coordinate: &Coordinate,
        window: &TimeRange,
        variable: &str,
    ) -> Result<Vec<RawSample>, EnviroError> {
        let grid = self.layer(variable)?;
        let (row, col) = grid.pixel(coordinate).ok_or_else(|| {
            EnviroError::OutOfDomain(format!("{coordinate} outside raster {variable}"))
        })?;
        let value = grid.value(row, col);
        Ok(hourly_steps(window)
            .into_iter()
            .map(|timestamp| RawSample {
                timestamp,
                cell: CellRef::Pixel { row, col },
                variable: variable.to_string(),
                value,
            })
            .collect())
    }

    fn cache_state(&self) -> Result<CacheState, EnviroError> {
        let entries = match fs::read_dir(self.root.as_std_path()) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "asc"))
                .count(),
            Err(_) => 0,
        };
        Ok(CacheState {
            entries,
            first: None,
            last: None,
        })
    }
}

/// Window start, then every whole hour up to the window end.
fn hourly_steps(window: &TimeRange) -> Vec<DateTime<Utc>> {
    let mut steps = vec![window.start];
    let hour = window.start.timestamp().div_euclid(3600) + 1;
    let Some(mut next) = DateTime::from_timestamp(hour * 3600, 0) else {
        return steps;
    };
    while next <= window.end {
        steps.push(next);
        next += Duration::hours(1);
    }
    steps
}
