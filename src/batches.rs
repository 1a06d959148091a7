// 🗓️ Batches - cohorts and moving students between them

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::{date_to_sql, new_id, record_event};
use crate::enrollment::{close_enrollment, get_profile, insert_enrollment, open_enrollment};
use crate::entities::{Batch, Enrollment};
use crate::error::{AdminError, Result};
use crate::validation::{require_name, Validator};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBatch {
    pub name: String,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchUpdate {
    pub name: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// Batch plus the number of students whose open enrollment points at it
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    #[serde(flatten)]
    pub batch: Batch,
    pub student_count: i64,
}

pub struct BatchService<'a> {
    conn: &'a Connection,
}

impl<'a> BatchService<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        BatchService { conn }
    }

    pub fn create_batch(
        &self,
        name: &str,
        start_date: NaiveDate,
        end_date: Option<NaiveDate>,
    ) -> Result<Batch> {
        let name = validate_batch(name, start_date, end_date)?;
        let batch = Batch {
            id: new_id(),
            name,
            start_date,
            end_date,
            created_at: Utc::now(),
        };

        let inserted = self.conn.execute(
            "INSERT INTO batches (id, name, start_date, end_date, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                batch.id,
                batch.name,
                date_to_sql(batch.start_date),
                batch.end_date.map(date_to_sql),
                batch.created_at.to_rfc3339(),
            ],
        );
        if let Err(e) = inserted {
            let err = AdminError::from(e);
            if err.is_constraint_violation() {
                return Err(AdminError::Conflict(format!("Batch {:?} already exists", batch.name)));
            }
            return Err(err);
        }

        info!(batch_id = %batch.id, name = %batch.name, "Batch created");
        Ok(batch)
    }

    pub fn find_batch(&self, batch_id: &str) -> Result<Option<Batch>> {
        let sql = format!("SELECT {} FROM batches WHERE id = ?1", Batch::COLUMNS);
        Ok(self.conn.query_row(&sql, [batch_id], Batch::from_row).optional()?)
    }

    pub fn get_batch(&self, batch_id: &str) -> Result<Batch> {
        self.find_batch(batch_id)?
            .ok_or_else(|| AdminError::not_found("Batch", batch_id))
    }

    /// Newest first
    pub fn list_batches(&self) -> Result<Vec<BatchSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT b.id, b.name, b.start_date, b.end_date, b.created_at,
                    (SELECT COUNT(*) FROM enrollments e WHERE e.batch_id = b.id AND e.end_date IS NULL)
             FROM batches b
             ORDER BY b.start_date DESC, b.name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(BatchSummary {
                    batch: Batch::from_row(row)?,
                    student_count: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_batch(&self, batch_id: &str, update: &BatchUpdate) -> Result<Batch> {
        let current = self.get_batch(batch_id)?;
        let start = update.start_date.unwrap_or(current.start_date);
        let end = update.end_date.or(current.end_date);
        let name = validate_batch(update.name.as_deref().unwrap_or(&current.name), start, end)?;

        let result = self.conn.execute(
            "UPDATE batches SET name = ?1, start_date = ?2, end_date = ?3 WHERE id = ?4",
            params![name, date_to_sql(start), end.map(date_to_sql), batch_id],
        );
        if let Err(e) = result {
            let err = AdminError::from(e);
            if err.is_constraint_violation() {
                return Err(AdminError::Conflict(format!("Batch {:?} already exists", name)));
            }
            return Err(err);
        }
        self.get_batch(batch_id)
    }

    /// Refused while any open enrollment still points at the batch.
    /// Closed enrollments keep their history but lose the batch link.
    pub fn delete_batch(&self, batch_id: &str) -> Result<()> {
        let batch = self.get_batch(batch_id)?;
        let open: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM enrollments WHERE batch_id = ?1 AND end_date IS NULL",
            [batch_id],
            |row| row.get(0),
        )?;
        if open > 0 {
            return Err(AdminError::Conflict(format!(
                "Batch {:?} still has {} enrolled student(s)",
                batch.name, open
            )));
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute("UPDATE enrollments SET batch_id = NULL WHERE batch_id = ?1", [batch_id])?;
        tx.execute("DELETE FROM batches WHERE id = ?1", [batch_id])?;
        tx.commit()?;

        info!(batch_id, name = %batch.name, "Batch deleted");
        Ok(())
    }

    /// Move profiles into a batch: their open enrollment is closed and a new
    /// one with the same status is opened in the batch. Returns how many moved.
    pub fn assign_profiles(
        &self,
        batch_id: &str,
        profile_ids: &[String],
        on: NaiveDate,
    ) -> Result<usize> {
        let batch = self.get_batch(batch_id)?;
        let tx = self.conn.unchecked_transaction()?;
        let mut moved = 0;

        for profile_id in profile_ids {
            let profile = get_profile(&tx, profile_id)?;
            let open = open_enrollment(&tx, profile_id)?.ok_or_else(|| {
                AdminError::Conflict(format!("Profile {} has no open enrollment", profile.id))
            })?;
            if open.batch_id.as_deref() == Some(batch_id) {
                continue;
            }

            close_enrollment(&tx, &open.id, on, "batch transfer")?;
            insert_enrollment(
                &tx,
                &Enrollment::open(profile_id, Some(batch_id.to_string()), open.status, on),
            )?;
            record_event(
                &tx,
                "batch_assigned",
                "program_profile",
                profile_id,
                serde_json::json!({ "from_batch": open.batch_id, "to_batch": batch_id }),
                "admin",
            )?;
            moved += 1;
        }

        tx.commit()?;
        info!(batch_id, batch = %batch.name, moved, "Profiles assigned to batch");
        Ok(moved)
    }
}

fn validate_batch(name: &str, start: NaiveDate, end: Option<NaiveDate>) -> Result<String> {
    let mut v = Validator::new();
    let name = v.check(require_name("name", name));
    if let Some(end) = end {
        if end < start {
            v.check::<()>(Err(crate::validation::ValidationError::new(
                "end_date",
                "is before start_date",
            )));
        }
    }
    v.finish()?;
    name.ok_or_else(|| AdminError::validation("name: required"))
}
