use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::Storage;
use crate::error::{AppError, Result};
use crate::models::{Flash, MealBooking, Member, MembershipTier, NewBooking, NewMember, Session};

const SCHEMA: &str = r#"
    PRAGMA foreign_keys = ON;
    CREATE TABLE IF NOT EXISTS members (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        username         TEXT NOT NULL UNIQUE COLLATE NOCASE,
        email            TEXT NOT NULL UNIQUE COLLATE NOCASE,
        password_hash    TEXT NOT NULL,
        membership_tier  TEXT NOT NULL,
        created_at       TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS sessions (
        id          TEXT PRIMARY KEY,
        member_id   INTEGER REFERENCES members(id) ON DELETE CASCADE,
        csrf_token  TEXT NOT NULL,
        flashes     TEXT NOT NULL DEFAULT '[]',
        created_at  TEXT NOT NULL,
        expires_at  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions (expires_at);
    CREATE TABLE IF NOT EXISTS meal_bookings (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        member_id   INTEGER NOT NULL REFERENCES members(id) ON DELETE CASCADE,
        meal_name   TEXT NOT NULL,
        meal_key    TEXT NOT NULL,
        meal_date   TEXT NOT NULL,
        created_at  TEXT NOT NULL,
        UNIQUE (member_id, meal_key, meal_date)
    );
"#;

const MEMBER_COLUMNS: &str = "id, username, email, password_hash, membership_tier, created_at";
const SESSION_COLUMNS: &str = "id, member_id, csrf_token, flashes, created_at, expires_at";
const BOOKING_COLUMNS: &str = "id, member_id, meal_name, meal_date, created_at";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// SQLite-backed storage. One connection, serialized by a mutex and driven from
/// the blocking thread pool.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        info!("Opened SQLite database at {}", path.display());
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| AppError::internal("sqlite connection lock poisoned"))?;
            f(&conn)
        })
        .await
        .map_err(|e| AppError::internal(format!("storage task failed: {e}")))?
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    // Fixed-width so that lexical order in SQL matches time order
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// SQLite's NOCASE only folds ASCII, so uniqueness is enforced on a Unicode-lowercased copy.
fn meal_key(meal_name: &str) -> String {
    meal_name.to_lowercase()
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn member_from_row(row: &Row<'_>) -> rusqlite::Result<Member> {
    let tier: String = row.get(4)?;
    Ok(Member {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        membership_tier: tier
            .parse::<MembershipTier>()
            .map_err(|e| conversion_error(4, e))?,
        created_at: timestamp_column(row, 5)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let flashes: String = row.get(3)?;
    Ok(Session {
        id: row.get(0)?,
        member_id: row.get(1)?,
        csrf_token: row.get(2)?,
        flashes: serde_json::from_str(&flashes).map_err(|e| conversion_error(3, e))?,
        created_at: timestamp_column(row, 4)?,
        expires_at: timestamp_column(row, 5)?,
    })
}

fn booking_from_row(row: &Row<'_>) -> rusqlite::Result<MealBooking> {
    let meal_date: String = row.get(3)?;
    Ok(MealBooking {
        id: row.get(0)?,
        member_id: row.get(1)?,
        meal_name: row.get(2)?,
        meal_date: NaiveDate::parse_from_str(&meal_date, DATE_FORMAT)
            .map_err(|e| conversion_error(3, e))?,
        created_at: timestamp_column(row, 4)?,
    })
}

/// Maps constraint violations onto domain errors; everything else stays a database error.
fn constraint_error(e: rusqlite::Error) -> AppError {
    if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &e {
        if failure.code == ErrorCode::ConstraintViolation {
            if message.contains("members.username") {
                return AppError::UsernameTaken;
            }
            if message.contains("members.email") {
                return AppError::EmailTaken;
            }
            if message.contains("meal_bookings.") {
                return AppError::DuplicateBooking;
            }
        }
    }
    AppError::Database(e)
}

fn load_flashes(conn: &Connection, session_id: &str) -> Result<Option<Vec<Flash>>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT flashes FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

fn store_flashes(conn: &Connection, session_id: &str, flashes: &[Flash]) -> Result<()> {
    conn.execute(
        "UPDATE sessions SET flashes = ?1 WHERE id = ?2",
        params![serde_json::to_string(flashes)?, session_id],
    )?;
    Ok(())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn init(&self) -> Result<()> {
        self.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        info!("Database schema is up to date");
        Ok(())
    }

    async fn create_member(&self, member: NewMember) -> Result<Member> {
        let created = self
            .call(move |conn| {
                let created_at = Utc::now();
                conn.execute(
                    "INSERT INTO members
                         (username, email, password_hash, membership_tier, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        member.username,
                        member.email,
                        member.password_hash,
                        member.membership_tier.as_str(),
                        format_timestamp(&created_at),
                    ],
                )
                .map_err(constraint_error)?;

                Ok(Member {
                    id: conn.last_insert_rowid(),
                    username: member.username,
                    email: member.email,
                    password_hash: member.password_hash,
                    membership_tier: member.membership_tier,
                    created_at,
                })
            })
            .await?;

        debug!("Created member: {} with id {}", created.username, created.id);
        Ok(created)
    }

    async fn get_member(&self, id: i64) -> Result<Option<Member>> {
        self.call(move |conn| {
            let sql = format!("SELECT {MEMBER_COLUMNS} FROM members WHERE id = ?1");
            Ok(conn.query_row(&sql, params![id], member_from_row).optional()?)
        })
        .await
    }

    async fn get_member_by_username(&self, username: &str) -> Result<Option<Member>> {
        let username = username.to_string();
        self.call(move |conn| {
            let sql = format!("SELECT {MEMBER_COLUMNS} FROM members WHERE username = ?1");
            Ok(conn
                .query_row(&sql, params![username], member_from_row)
                .optional()?)
        })
        .await
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        let session = session.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, member_id, csrf_token, flashes, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session.id,
                    session.member_id,
                    session.csrf_token,
                    serde_json::to_string(&session.flashes)?,
                    format_timestamp(&session.created_at),
                    format_timestamp(&session.expires_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let id = id.to_string();
        self.call(move |conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
            Ok(conn.query_row(&sql, params![id], session_from_row).optional()?)
        })
        .await
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.call(move |conn| {
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        self.call(move |conn| {
            Ok(conn.execute(
                "DELETE FROM sessions WHERE expires_at <= ?1",
                params![format_timestamp(&now)],
            )?)
        })
        .await
    }

    async fn push_flash(&self, session_id: &str, flash: Flash) -> Result<()> {
        let session_id = session_id.to_string();
        self.call(move |conn| {
            if let Some(mut flashes) = load_flashes(conn, &session_id)? {
                flashes.push(flash);
                store_flashes(conn, &session_id, &flashes)?;
            }
            Ok(())
        })
        .await
    }

    async fn take_flashes(&self, session_id: &str) -> Result<Vec<Flash>> {
        let session_id = session_id.to_string();
        self.call(move |conn| match load_flashes(conn, &session_id)? {
            Some(flashes) if !flashes.is_empty() => {
                store_flashes(conn, &session_id, &[])?;
                Ok(flashes)
            }
            _ => Ok(Vec::new()),
        })
        .await
    }

    async fn create_booking(&self, booking: NewBooking) -> Result<MealBooking> {
        let created = self
            .call(move |conn| {
                let member_exists: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM members WHERE id = ?1",
                        params![booking.member_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if member_exists.is_none() {
                    return Err(AppError::UnknownMember(booking.member_id));
                }

                let created_at = Utc::now();
                conn.execute(
                    "INSERT INTO meal_bookings
                         (member_id, meal_name, meal_key, meal_date, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        booking.member_id,
                        booking.meal_name,
                        meal_key(&booking.meal_name),
                        booking.meal_date.format(DATE_FORMAT).to_string(),
                        format_timestamp(&created_at),
                    ],
                )
                .map_err(constraint_error)?;

                Ok(MealBooking {
                    id: conn.last_insert_rowid(),
                    member_id: booking.member_id,
                    meal_name: booking.meal_name,
                    meal_date: booking.meal_date,
                    created_at,
                })
            })
            .await?;

        debug!(
            "Created booking {} for member {} on {}",
            created.id, created.member_id, created.meal_date
        );
        Ok(created)
    }

    async fn get_booking(&self, member_id: i64, booking_id: i64) -> Result<Option<MealBooking>> {
        self.call(move |conn| {
            let sql = format!(
                "SELECT {BOOKING_COLUMNS} FROM meal_bookings WHERE id = ?1 AND member_id = ?2"
            );
            Ok(conn
                .query_row(&sql, params![booking_id, member_id], booking_from_row)
                .optional()?)
        })
        .await
    }

    async fn list_bookings(&self, member_id: i64) -> Result<Vec<MealBooking>> {
        self.call(move |conn| {
            let sql = format!(
                "SELECT {BOOKING_COLUMNS} FROM meal_bookings
                 WHERE member_id = ?1
                 ORDER BY meal_date, id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let bookings = stmt
                .query_map(params![member_id], booking_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(bookings)
        })
        .await
    }

    async fn delete_booking(&self, member_id: i64, booking_id: i64) -> Result<bool> {
        self.call(move |conn| {
            let removed = conn.execute(
                "DELETE FROM meal_bookings WHERE id = ?1 AND member_id = ?2",
                params![booking_id, member_id],
            )?;
            Ok(removed > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contract;
    use tempfile::tempdir;

    async fn storage() -> SqliteStorage {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.init().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_member_round_trip() {
        contract::member_round_trip(&storage().await).await;
    }

    #[tokio::test]
    async fn test_member_uniqueness() {
        contract::member_uniqueness(&storage().await).await;
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        contract::session_lifecycle(&storage().await).await;
    }

    #[tokio::test]
    async fn test_flashes_are_taken_once() {
        contract::flashes_are_taken_once(&storage().await).await;
    }

    #[tokio::test]
    async fn test_bookings() {
        contract::bookings(&storage().await).await;
    }

    #[tokio::test]
    async fn test_booking_requires_member() {
        contract::booking_requires_member(&storage().await).await;
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let storage = storage().await;
        storage.init().await.unwrap();
        storage.init().await.unwrap();
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("members.db");

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.init().await.unwrap();
            storage
                .create_member(contract::new_member("dora", "dora@example.com"))
                .await
                .unwrap();
        }

        let reopened = SqliteStorage::open(&path).unwrap();
        reopened.init().await.unwrap();
        let member = reopened.get_member_by_username("dora").await.unwrap();
        assert_eq!(member.map(|m| m.email), Some("dora@example.com".to_string()));
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let early = DateTime::parse_from_rfc3339("2030-01-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2030-01-01T10:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(format_timestamp(&early) < format_timestamp(&late));
    }
}
