// 🗄️ Database - SQLite schema, audit trail and row helpers
//
// Two generations of tables live side by side while the migration is in flight:
// - legacy `students` (one row per student, billing columns inline)
// - normalized persons / program_profiles / enrollments / billing_* tables
//
// Referential integrity is left to SQLite (foreign keys ON, unique indexes).

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, types::Type, Connection};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::Result;

/// Event for audit trail ("every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: new_id(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Fresh UUID v4 as text (primary keys are TEXT throughout)
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery (in-memory databases answer "memory")
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Legacy single-table model (read by the migration, never written by services)
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS students (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            date_of_birth TEXT,
            program TEXT NOT NULL DEFAULT 'MAHAD',
            status TEXT NOT NULL DEFAULT 'registered',
            batch_id TEXT,
            monthly_rate INTEGER NOT NULL DEFAULT 0,
            stripe_customer_id TEXT,
            stripe_subscription_id TEXT,
            subscription_status TEXT,
            migrated_person_id TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );",
    )?;

    // ==========================================================================
    // People and programs
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS persons (
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            date_of_birth TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS contact_points (
            id TEXT PRIMARY KEY,
            person_id TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
            contact_type TEXT NOT NULL,
            value TEXT NOT NULL,
            is_primary INTEGER NOT NULL DEFAULT 0,
            UNIQUE (person_id, contact_type, value)
        );

        CREATE TABLE IF NOT EXISTS guardian_relationships (
            id TEXT PRIMARY KEY,
            guardian_id TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
            dependent_id TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
            role TEXT NOT NULL DEFAULT 'PARENT',
            UNIQUE (guardian_id, dependent_id)
        );

        CREATE TABLE IF NOT EXISTS batches (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            start_date TEXT NOT NULL,
            end_date TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS program_profiles (
            id TEXT PRIMARY KEY,
            person_id TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
            program TEXT NOT NULL,
            status TEXT NOT NULL,
            monthly_rate INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (person_id, program)
        );

        CREATE TABLE IF NOT EXISTS enrollments (
            id TEXT PRIMARY KEY,
            program_profile_id TEXT NOT NULL REFERENCES program_profiles(id) ON DELETE CASCADE,
            batch_id TEXT REFERENCES batches(id),
            status TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT,
            end_reason TEXT
        );",
    )?;

    // ==========================================================================
    // Billing
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS billing_accounts (
            id TEXT PRIMARY KEY,
            person_id TEXT REFERENCES persons(id) ON DELETE SET NULL,
            program TEXT NOT NULL,
            stripe_customer_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (stripe_customer_id, program)
        );

        CREATE TABLE IF NOT EXISTS subscriptions (
            id TEXT PRIMARY KEY,
            billing_account_id TEXT NOT NULL REFERENCES billing_accounts(id) ON DELETE CASCADE,
            stripe_subscription_id TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            amount INTEGER NOT NULL DEFAULT 0,
            currency TEXT NOT NULL DEFAULT 'usd',
            current_period_start TEXT,
            current_period_end TEXT,
            paid_until TEXT,
            last_payment_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS subscription_history (
            id TEXT PRIMARY KEY,
            subscription_id TEXT NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
            from_status TEXT,
            to_status TEXT NOT NULL,
            source_event_id TEXT,
            changed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS billing_assignments (
            id TEXT PRIMARY KEY,
            subscription_id TEXT NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
            program_profile_id TEXT NOT NULL REFERENCES program_profiles(id) ON DELETE CASCADE,
            amount INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            start_date TEXT NOT NULL,
            end_date TEXT
        );",
    )?;

    // ==========================================================================
    // Siblings and attendance
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sibling_relationships (
            id TEXT PRIMARY KEY,
            person1_id TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
            person2_id TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
            detection_method TEXT NOT NULL,
            confidence REAL NOT NULL,
            verified INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            CHECK (person1_id < person2_id),
            UNIQUE (person1_id, person2_id)
        );

        CREATE TABLE IF NOT EXISTS attendance_sessions (
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
            session_date TEXT NOT NULL,
            notes TEXT,
            UNIQUE (batch_id, session_date)
        );

        CREATE TABLE IF NOT EXISTS attendance_records (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES attendance_sessions(id) ON DELETE CASCADE,
            program_profile_id TEXT NOT NULL REFERENCES program_profiles(id) ON DELETE CASCADE,
            status TEXT NOT NULL,
            notes TEXT,
            UNIQUE (session_id, program_profile_id)
        );",
    )?;

    // ==========================================================================
    // Webhook idempotency + audit trail
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS webhook_events (
            id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL,
            source TEXT NOT NULL,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            processed_at TEXT NOT NULL,
            UNIQUE (event_id, source)
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );",
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_contact_value ON contact_points(contact_type, value);
        CREATE INDEX IF NOT EXISTS idx_profiles_person ON program_profiles(person_id);
        CREATE INDEX IF NOT EXISTS idx_enrollments_profile ON enrollments(program_profile_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_enrollments_open
            ON enrollments(program_profile_id) WHERE end_date IS NULL;
        CREATE INDEX IF NOT EXISTS idx_assignments_subscription ON billing_assignments(subscription_id);
        CREATE INDEX IF NOT EXISTS idx_assignments_profile ON billing_assignments(program_profile_id);
        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);",
    )?;

    Ok(())
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Shorthand for the common "build event and insert it" pair
pub fn record_event(
    conn: &Connection,
    event_type: &str,
    entity_type: &str,
    entity_id: &str,
    data: serde_json::Value,
    actor: &str,
) -> Result<()> {
    insert_event(
        conn,
        &Event::new(event_type, entity_type, entity_id, data, actor),
    )
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: timestamp_from_sql(1, &timestamp_str)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                })?,
                actor: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// ROW CONVERSION HELPERS
// ============================================================================

pub fn date_from_sql(idx: usize, value: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn opt_date_from_sql(idx: usize, value: Option<String>) -> rusqlite::Result<Option<NaiveDate>> {
    value.map(|v| date_from_sql(idx, &v)).transpose()
}

pub fn timestamp_from_sql(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn opt_timestamp_from_sql(
    idx: usize,
    value: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| timestamp_from_sql(idx, &v)).transpose()
}

/// Parse a TEXT column into one of the crate's string-backed enums
pub fn enum_from_sql<T>(idx: usize, value: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn date_to_sql(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
