//! Call Log Database
//!
//! SQLite-Datenbank für die Anrufhistorie.
//! Jeder Call-Versuch mit Session wird mit Ziel, Modus, Ergebnis und
//! Zeitstempeln gespeichert.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Result as SqliteResult, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Call not found: {0}")]
    CallNotFound(String),
}

// ============================================================================
// CALL RECORD
// ============================================================================

/// Ergebnis eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    /// Läuft noch
    Active,
    /// War verbunden und wurde beendet
    Completed,
    /// Vor dem Verbindungsaufbau abgebrochen
    Cancelled,
}

impl CallOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            _ => Self::Active,
        }
    }
}

/// Ein Eintrag in der Anrufhistorie
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub target: String,
    /// `real`, `fallback` oder `simulated`
    pub mode: String,
    pub outcome: CallOutcome,
    pub started_at: DateTime<Utc>,
    pub established_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallRecord {
    /// Gesprächsdauer, falls verbunden und beendet
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.established_at?)
    }

    fn from_row(row: &Row<'_>) -> SqliteResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            target: row.get(1)?,
            mode: row.get(2)?,
            outcome: CallOutcome::parse(&row.get::<_, String>(3)?),
            started_at: row.get(4)?,
            established_at: row.get(5)?,
            ended_at: row.get(6)?,
        })
    }
}

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Datenbank für die Anrufhistorie (Thread-safe durch Mutex)
pub struct CallLog {
    conn: Mutex<Connection>,
}

impl CallLog {
    /// Öffnet oder erstellt die Datenbank im Datenverzeichnis
    pub fn open() -> Result<Self, DatabaseError> {
        let db_path = Self::get_database_path()?;
        Self::open_at(&db_path)
    }

    /// Öffnet oder erstellt die Datenbank unter `path`
    pub fn open_at(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening call log at {:?}", path);

        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// In-Memory Datenbank für Tests
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn get_database_path() -> Result<PathBuf, DatabaseError> {
        let proj_dirs =
            directories::ProjectDirs::from("com", "softphone", "softphone").ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        Ok(proj_dirs.data_dir().join("calls.db"))
    }

    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS calls (
                id TEXT PRIMARY KEY,
                target TEXT NOT NULL,
                mode TEXT NOT NULL,
                outcome TEXT NOT NULL DEFAULT 'active',
                started_at TEXT NOT NULL,
                established_at TEXT,
                ended_at TEXT
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_calls_started_at ON calls(started_at)
            "#,
            [],
        )?;

        Ok(())
    }

    /// Legt einen neuen Call an
    pub fn insert(&self, record: &CallRecord) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO calls (id, target, mode, outcome, started_at, established_at, ended_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.id,
                record.target,
                record.mode,
                record.outcome.as_str(),
                record.started_at,
                record.established_at,
                record.ended_at
            ],
        )?;
        Ok(())
    }

    /// Aktualisiert den Modus (z.B. nach Fallback)
    pub fn set_mode(&self, id: &str, mode: &str) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE calls SET mode = ?2 WHERE id = ?1",
            params![id, mode],
        )?;
        Self::ensure_found(changed, id)
    }

    /// Markiert den Call als verbunden
    pub fn mark_established(&self, id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE calls SET established_at = ?2 WHERE id = ?1 AND established_at IS NULL",
            params![id, at],
        )?;
        if changed == 0 {
            // Schon gesetzt ist kein Fehler
            Self::get_inner(&conn, id)?;
        }
        Ok(())
    }

    /// Schließt den Call ab. Das Ergebnis hängt davon ab, ob er verbunden war.
    pub fn finish(&self, id: &str, at: DateTime<Utc>) -> Result<CallRecord, DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE calls
            SET ended_at = ?2,
                outcome = CASE WHEN established_at IS NULL THEN 'cancelled' ELSE 'completed' END
            WHERE id = ?1 AND ended_at IS NULL
            "#,
            params![id, at],
        )?;
        Self::get_inner(&conn, id)
    }

    pub fn get(&self, id: &str) -> Result<CallRecord, DatabaseError> {
        let conn = self.conn.lock();
        Self::get_inner(&conn, id)
    }

    /// Die letzten `limit` Calls, neueste zuerst
    pub fn recent(&self, limit: usize) -> Result<Vec<CallRecord>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, target, mode, outcome, started_at, established_at, ended_at
            FROM calls
            ORDER BY started_at DESC
            LIMIT ?1
            "#,
        )?;

        let records = stmt
            .query_map(params![limit as i64], CallRecord::from_row)?
            .collect::<SqliteResult<Vec<CallRecord>>>()?;

        Ok(records)
    }

    fn get_inner(conn: &Connection, id: &str) -> Result<CallRecord, DatabaseError> {
        conn.query_row(
            r#"
            SELECT id, target, mode, outcome, started_at, established_at, ended_at
            FROM calls
            WHERE id = ?1
            "#,
            params![id],
            CallRecord::from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DatabaseError::CallNotFound(id.to_string()),
            other => DatabaseError::Sqlite(other),
        })
    }

    fn ensure_found(changed: usize, id: &str) -> Result<(), DatabaseError> {
        if changed == 0 {
            Err(DatabaseError::CallNotFound(id.to_string()))
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for CallLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallLog").finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
