use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use super::{CacheState, CacheStore, WriteLock, ensure_parent};
use crate::domain::{BoundingBox, CellRef, Coordinate, RawSample, TimeRange};
use crate::error::EnviroError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    pub id: String,
    pub location: Coordinate,
    pub active_from: Option<DateTime<Utc>>,
    pub active_to: Option<DateTime<Utc>>,
}

impl Station {
    /// Whether the station reported at some point during `window`.
    pub fn active_during(&self, window: &TimeRange) -> bool {
        self.active_from.is_none_or(|from| from <= window.end)
            && self.active_to.is_none_or(|to| to >= window.start)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub station_id: String,
    pub variable: String,
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
}

/// One upstream delivery: station metadata plus the observations it covers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StationBatch {
    pub stations: Vec<Station>,
    pub observations: Vec<Observation>,
}

/// Point observations in an SQLite database (WAL mode).
///
/// Connections are opened per operation so that loader threads and getters
/// never share one; SQLite's own locking plus the busy timeout arbitrate.
#[derive(Debug, Clone)]
pub struct StationStore {
    path: Utf8PathBuf,
    max_distance_km: f64,
    writer: Arc<Mutex<()>>,
    lock: WriteLock,
}

impl StationStore {
    pub fn new(path: impl Into<Utf8PathBuf>, max_distance_km: f64) -> Result<Self, EnviroError> {
        if !(max_distance_km.is_finite() && max_distance_km > 0.0) {
            return Err(EnviroError::InvalidConfiguration(format!(
                "max_distance_km must be positive, got {max_distance_km}"
            )));
        }
        let store = Self {
            path: path.into(),
            max_distance_km,
            writer: Arc::new(Mutex::new(())),
            lock: WriteLock::default(),
        };
        ensure_parent(&store.path)?;
        let connection = store.open()?;
        initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn open(&self) -> Result<Connection, EnviroError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let connection = Connection::open_with_flags(self.path.as_std_path(), flags)?;
        connection.busy_timeout(BUSY_TIMEOUT)?;
        connection.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Ok(connection)
    }

    /// Whether exactly this range has been committed before.
    pub fn has_range(&self, range: &TimeRange) -> Result<bool, EnviroError> {
        let connection = self.open()?;
        let found: Option<i64> = connection
            .query_row(
                "SELECT 1 FROM loaded_ranges WHERE key = ?1",
                params![range_key(range)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn stations(&self) -> Result<Vec<Station>, EnviroError> {
        let connection = self.open()?;
        let mut statement = connection.prepare(
            "SELECT station_id, longitude, latitude, active_from, active_to FROM stations",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, Option<i64>>(4)?,
            ))
        })?;
        let mut stations = Vec::new();
        for row in rows {
            let (id, longitude, latitude, active_from, active_to) = row?;
            stations.push(Station {
                id,
                location: Coordinate {
                    longitude,
                    latitude,
                },
                active_from: active_from.and_then(from_epoch),
                active_to: active_to.and_then(from_epoch),
            });
        }
        Ok(stations)
    }

    fn observations(
        &self,
        connection: &Connection,
        station_id: &str,
        variable: &str,
        window: &TimeRange,
    ) -> Result<Vec<RawSample>, EnviroError> {
        let mut statement = connection.prepare(
            "SELECT timestamp, value FROM observations
             WHERE station_id = ?1 AND variable = ?2 AND timestamp BETWEEN ?3 AND ?4
             ORDER BY timestamp",
        )?;
        let rows = statement.query_map(
            params![
                station_id,
                variable,
                window.start.timestamp(),
                window.end.timestamp()
            ],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<f64>>(1)?)),
        )?;
        let mut samples = Vec::new();
        for row in rows {
            let (timestamp, value) = row?;
            let Some(timestamp) = from_epoch(timestamp) else {
                continue;
            };
            samples.push(RawSample {
                timestamp,
                cell: CellRef::Station {
                    id: station_id.to_string(),
                },
                variable: variable.to_string(),
                value,
            });
        }
        Ok(samples)
    }
}

impl CacheStore for StationStore {
    type Payload = StationBatch;

    fn put(
        &self,
        range: &TimeRange,
        extent: &BoundingBox,
        payload: StationBatch,
    ) -> Result<(), EnviroError> {
        let key_path = self.path.with_file_name(format!(
            "{}-{}",
            self.path.file_stem().unwrap_or("stations"),
            range.start.format("%Y%m%d%H%M%S")
        ));
        let _guard = self.lock.acquire(&key_path)?;
        let _writer = self
            .writer
            .lock()
            .map_err(|_| EnviroError::WriteConflict(self.path.to_string()))?;

        let mut connection = self.open()?;
        let tx = connection.transaction()?;
        {
            let mut insert_station = tx.prepare(
                "INSERT INTO stations (station_id, longitude, latitude, active_from, active_to)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (station_id) DO UPDATE SET
                    longitude = excluded.longitude,
                    latitude = excluded.latitude,
                    active_from = CASE
                        WHEN stations.active_from IS NULL OR excluded.active_from IS NULL THEN NULL
                        ELSE MIN(stations.active_from, excluded.active_from) END,
                    active_to = CASE
                        WHEN stations.active_to IS NULL OR excluded.active_to IS NULL THEN NULL
                        ELSE MAX(stations.active_to, excluded.active_to) END",
            )?;
            for station in payload
                .stations
                .iter()
                .filter(|station| extent.contains(&station.location))
            {
                insert_station.execute(params![
                    station.id,
                    station.location.longitude,
                    station.location.latitude,
                    station.active_from.map(|time| time.timestamp()),
                    station.active_to.map(|time| time.timestamp()),
                ])?;
            }
            let mut insert_observation = tx.prepare(
                "INSERT OR REPLACE INTO observations (station_id, variable, timestamp, value)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for observation in payload
                .observations
                .iter()
                .filter(|observation| range.contains(&observation.timestamp))
            {
                insert_observation.execute(params![
                    observation.station_id,
                    observation.variable,
                    observation.timestamp.timestamp(),
                    observation.value,
                ])?;
            }
            tx.execute(
                "INSERT OR REPLACE INTO loaded_ranges (key, start, end, loaded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    range_key(range),
                    range.start.timestamp(),
                    range.end.timestamp(),
                    Utc::now().timestamp()
                ],
            )?;
        }
        tx.commit()?;
        tracing::debug!(
            db = %self.path,
            %range,
            stations = payload.stations.len(),
            observations = payload.observations.len(),
            "committed station batch"
        );
        Ok(())
    }

    fn read(
        &self,
        coordinate: &Coordinate,
        window: &TimeRange,
        variable: &str,
    ) -> Result<Vec<RawSample>, EnviroError> {
        let connection = self.open()?;
        let overlapping: i64 = connection.query_row(
            "SELECT COUNT(*) FROM loaded_ranges WHERE start <= ?1 AND end >= ?2",
            params![window.end.timestamp(), window.start.timestamp()],
            |row| row.get(0),
        )?;
        if overlapping == 0 {
            return Err(EnviroError::CacheMiss(format!("{} for {window}", self.path)));
        }

        let mut candidates: Vec<(f64, Station)> = self
            .stations()?
            .into_iter()
            .map(|station| (coordinate.haversine_km(&station.location), station))
            .filter(|(distance, _)| *distance <= self.max_distance_km)
            .collect();
        if candidates.is_empty() {
            return Err(EnviroError::OutOfDomain(format!(
                "no station within {} km of {coordinate}",
                self.max_distance_km
            )));
        }
        candidates.sort_by(|(a, _), (b, _)| a.total_cmp(b));

        for (distance, station) in candidates
            .iter()
            .filter(|(_, station)| station.active_during(window))
        {
            let samples = self.observations(&connection, &station.id, variable, window)?;
            if !samples.is_empty() {
                tracing::debug!(station = %station.id, distance, variable, "selected station");
                return Ok(samples);
            }
        }
        Ok(Vec::new())
    }

    fn cache_state(&self) -> Result<CacheState, EnviroError> {
        let connection = self.open()?;
        let (entries, first, last): (i64, Option<i64>, Option<i64>) = connection.query_row(
            "SELECT COUNT(*), MIN(start), MAX(end) FROM loaded_ranges",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(CacheState {
            entries: usize::try_from(entries).unwrap_or_default(),
            first: first.and_then(from_epoch),
            last: last.and_then(from_epoch),
        })
    }
}

fn initialize_schema(connection: &Connection) -> Result<(), EnviroError> {
    connection.execute_batch(
        "CREATE TABLE IF NOT EXISTS stations (
            station_id TEXT PRIMARY KEY,
            longitude REAL NOT NULL,
            latitude REAL NOT NULL,
            active_from INTEGER,
            active_to INTEGER
        );
        CREATE TABLE IF NOT EXISTS observations (
            station_id TEXT NOT NULL,
            variable TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            value REAL,
            PRIMARY KEY (station_id, variable, timestamp)
        );
        CREATE TABLE IF NOT EXISTS loaded_ranges (
            key TEXT PRIMARY KEY,
            start INTEGER NOT NULL,
            end INTEGER NOT NULL,
            loaded_at INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

fn range_key(range: &TimeRange) -> String {
    range.to_string()
}

fn from_epoch(seconds: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
}
