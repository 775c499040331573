//! Append-only sighting history in SQLite
//!
//! The connection lives on a dedicated thread; async callers hand it closures
//! and await the reply, so a slow disk never stalls the scan event pump.

use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::{error, info};
use rusqlite::types::Value;
use rusqlite::{params, Connection};
use tokio::sync::oneshot;

use crate::error::StoreError;
use crate::sighting::{Location, RecordId, SessionId, Sighting};

mod migrations;

pub use migrations::{MigrationReport, SchemaOutcome, CURRENT_SCHEMA_VERSION, TABLE_NAME};

/// Destination for sightings admitted by the deduplicator
#[async_trait]
pub trait SightingSink: Send + Sync {
    async fn append(&self, sighting: Sighting, session_id: SessionId) -> Result<RecordId, StoreError>;
}

/// A row read back from the store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSighting {
    pub id: RecordId,
    pub session_id: SessionId,
    pub sighting: Sighting,
}

/// Per-session aggregate of stored rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub sightings: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

enum DbTarget {
    File(PathBuf),
    Memory,
}

struct StoreInner {
    sender: Mutex<mpsc::Sender<DbCommand>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Ok(sender) = self.sender.lock() {
                if let Err(err) = sender.send(DbCommand::Shutdown) {
                    error!("Failed to send shutdown to store thread: {}", err);
                }
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join store thread: {:?}", join_err);
            }
        }
    }
}

/// SQLite-backed sighting history
#[derive(Clone)]
pub struct SightingStore {
    inner: Arc<StoreInner>,
    db_path: Option<Arc<PathBuf>>,
    report: MigrationReport,
}

impl SightingStore {
    /// Open (creating if needed) the database at `db_path` and migrate it
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self::spawn(DbTarget::File(db_path.clone()))?;
        info!("Sighting store opened at {}", db_path.display());
        Ok(Self {
            db_path: Some(Arc::new(db_path)),
            ..store
        })
    }

    /// A private database that disappears with the store
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::spawn(DbTarget::Memory)
    }

    fn spawn(target: DbTarget) -> Result<Self, StoreError> {
        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<MigrationReport, StoreError>>();

        let worker = thread::Builder::new()
            .name("blescout-db".into())
            .spawn(move || {
                let opened = match &target {
                    DbTarget::File(path) => Connection::open(path),
                    DbTarget::Memory => Connection::open_in_memory(),
                };
                let mut conn = match opened {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.into()));
                        return;
                    }
                };

                if let DbTarget::File(_) = target {
                    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                        error!("Failed to enable WAL mode: {}", err);
                    }
                }

                let init = migrations::run_migrations(&mut conn);
                if ready_tx.send(init).is_err() {
                    error!("Store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => task(&mut conn),
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Store thread shutting down");
            })?;

        let report = match ready_rx.recv() {
            Ok(result) => result?,
            Err(_) => {
                let _ = worker.join();
                return Err(StoreError::WorkerUnavailable);
            }
        };

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: Mutex::new(command_tx),
                worker: Mutex::new(Some(worker)),
            }),
            db_path: None,
            report,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref().map(PathBuf::as_path)
    }

    /// What happened to the schema when this store was opened
    pub fn migration_report(&self) -> &MigrationReport {
        &self.report
    }

    async fn execute<F, T>(&self, task: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                log::debug!("Store caller dropped before receiving result");
            }
        }));

        {
            let sender = self.inner.sender.lock().map_err(|_| StoreError::WorkerUnavailable)?;
            sender.send(command).map_err(|_| StoreError::WorkerUnavailable)?;
        }

        reply_rx.await.map_err(|_| StoreError::WorkerUnavailable)?
    }

    /// Append one sighting under `session_id`; each row gets a fresh id
    pub async fn append(&self, sighting: &Sighting, session_id: &SessionId) -> Result<RecordId, StoreError> {
        self.insert(sighting.clone(), session_id.clone()).await
    }

    async fn insert(&self, sighting: Sighting, session_id: SessionId) -> Result<RecordId, StoreError> {
        let id = RecordId::new();
        let record_id = id.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO discovered_devices
                    (id, address, name, rssi, distance, timestamp, scan_session, latitude, longitude)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record_id.as_str(),
                    sighting.address,
                    sighting.display_name,
                    sighting.signal_strength,
                    sighting.estimated_distance,
                    sighting.observed_at.timestamp_millis(),
                    session_id.as_str(),
                    sighting.latitude(),
                    sighting.longitude(),
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    /// Total number of stored sightings
    pub async fn count(&self) -> Result<u64, StoreError> {
        self.execute(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM discovered_devices", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    /// Rows of one session, oldest first
    pub async fn session_rows(&self, session_id: &SessionId) -> Result<Vec<StoredSighting>, StoreError> {
        let session_id = session_id.clone();
        self.query_rows(
            "WHERE scan_session = ?1 ORDER BY timestamp ASC, address ASC",
            vec![Value::Text(session_id.as_str().to_string())],
        )
        .await
    }

    /// Most recent rows across sessions
    pub async fn recent(&self, limit: usize) -> Result<Vec<StoredSighting>, StoreError> {
        self.query_rows(
            "ORDER BY timestamp DESC, address ASC LIMIT ?1",
            vec![Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX))],
        )
        .await
    }

    /// One summary per scan session, newest first
    pub async fn sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT scan_session, COUNT(*), MIN(timestamp), MAX(timestamp)
                 FROM discovered_devices
                 GROUP BY scan_session
                 ORDER BY MIN(timestamp) DESC",
            )?;
            let raw = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            raw.into_iter()
                .map(|(session, sightings, first, last)| {
                    Ok(SessionSummary {
                        session_id: SessionId::from(session),
                        sightings: sightings.max(0) as u64,
                        first_seen: from_millis(first)?,
                        last_seen: from_millis(last)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn query_rows(&self, clause: &'static str, args: Vec<Value>) -> Result<Vec<StoredSighting>, StoreError> {
        self.execute(move |conn| {
            let sql = format!(
                "SELECT id, address, name, rssi, distance, timestamp, scan_session, latitude, longitude
                 FROM discovered_devices {}",
                clause
            );
            let mut stmt = conn.prepare(&sql)?;
            let raw = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                    Ok(RawRow {
                        id: row.get(0)?,
                        address: row.get(1)?,
                        name: row.get(2)?,
                        rssi: row.get(3)?,
                        distance: row.get(4)?,
                        timestamp: row.get(5)?,
                        session: row.get(6)?,
                        latitude: row.get(7)?,
                        longitude: row.get(8)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            raw.into_iter().map(RawRow::into_stored).collect()
        })
        .await
    }
}

#[async_trait]
impl SightingSink for SightingStore {
    async fn append(&self, sighting: Sighting, session_id: SessionId) -> Result<RecordId, StoreError> {
        self.insert(sighting, session_id).await
    }
}

struct RawRow {
    id: String,
    address: String,
    name: Option<String>,
    rssi: i64,
    distance: Option<f64>,
    timestamp: i64,
    session: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl RawRow {
    fn into_stored(self) -> Result<StoredSighting, StoreError> {
        let signal_strength = i16::try_from(self.rssi)
            .map_err(|_| StoreError::Conversion(format!("rssi {} out of range", self.rssi)))?;
        let location = match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Location::new(latitude, longitude)),
            _ => None,
        };
        Ok(StoredSighting {
            id: RecordId::from(self.id),
            session_id: SessionId::from(self.session),
            sighting: Sighting {
                address: self.address,
                display_name: self
                    .name
                    .unwrap_or_else(|| crate::sighting::UNKNOWN_DEVICE_NAME.to_string()),
                signal_strength,
                estimated_distance: self.distance,
                observed_at: from_millis(self.timestamp)?,
                location,
            },
        })
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::Conversion(format!("timestamp {} out of range", millis)))
}
