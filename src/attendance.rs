// 📋 Attendance - sessions per batch, one mark per student per session

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::batches::BatchService;
use crate::db::{date_to_sql, new_id};
use crate::enrollment::get_profile;
use crate::entities::{AttendanceRecord, AttendanceSession, AttendanceStatus};
use crate::error::{AdminError, Result};

// ============================================================================
// COUNTS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AttendanceCounts {
    pub present: u32,
    pub absent: u32,
    pub late: u32,
    pub excused: u32,
}

impl AttendanceCounts {
    pub fn add(&mut self, status: AttendanceStatus) {
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Late => self.late += 1,
            AttendanceStatus::Excused => self.excused += 1,
        }
    }

    pub fn marked(&self) -> u32 {
        self.present + self.absent + self.late + self.excused
    }

    /// (present + late) / marked; None when nobody was marked
    pub fn rate(&self) -> Option<f64> {
        match self.marked() {
            0 => None,
            marked => Some(f64::from(self.present + self.late) / f64::from(marked)),
        }
    }
}

impl FromIterator<AttendanceStatus> for AttendanceCounts {
    fn from_iter<I: IntoIterator<Item = AttendanceStatus>>(iter: I) -> Self {
        let mut counts = AttendanceCounts::default();
        for status in iter {
            counts.add(status);
        }
        counts
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session: AttendanceSession,
    pub counts: AttendanceCounts,
    pub marked: u32,
    pub rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileAttendance {
    pub program_profile_id: String,
    pub sessions: u32,
    pub counts: AttendanceCounts,
    pub rate: Option<f64>,
}

// ============================================================================
// ATTENDANCE SERVICE
// ============================================================================

pub struct AttendanceService<'a> {
    conn: &'a Connection,
}

impl<'a> AttendanceService<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        AttendanceService { conn }
    }

    pub fn create_session(
        &self,
        batch_id: &str,
        date: NaiveDate,
        notes: Option<&str>,
    ) -> Result<AttendanceSession> {
        BatchService::new(self.conn).get_batch(batch_id)?;
        let session = AttendanceSession {
            id: new_id(),
            batch_id: batch_id.to_string(),
            session_date: date,
            notes: notes.map(str::to_string),
        };

        let inserted = self.conn.execute(
            "INSERT INTO attendance_sessions (id, batch_id, session_date, notes)
             VALUES (?1, ?2, ?3, ?4)",
            params![session.id, session.batch_id, date_to_sql(date), session.notes],
        );
        if let Err(e) = inserted {
            let err = AdminError::from(e);
            if err.is_constraint_violation() {
                return Err(AdminError::Conflict(format!(
                    "Batch {} already has a session on {}",
                    batch_id, date
                )));
            }
            return Err(err);
        }

        info!(session_id = %session.id, batch_id, %date, "Attendance session created");
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Result<AttendanceSession> {
        let sql = format!(
            "SELECT {} FROM attendance_sessions WHERE id = ?1",
            AttendanceSession::COLUMNS
        );
        self.conn
            .query_row(&sql, [session_id], AttendanceSession::from_row)
            .optional()?
            .ok_or_else(|| AdminError::not_found("Attendance session", session_id))
    }

    /// Oldest first
    pub fn sessions_for_batch(&self, batch_id: &str) -> Result<Vec<AttendanceSession>> {
        let sql = format!(
            "SELECT {} FROM attendance_sessions WHERE batch_id = ?1 ORDER BY session_date",
            AttendanceSession::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([batch_id], AttendanceSession::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Record (or overwrite) one student's mark for a session
    pub fn mark(
        &self,
        session_id: &str,
        profile_id: &str,
        status: AttendanceStatus,
        notes: Option<&str>,
    ) -> Result<AttendanceRecord> {
        self.get_session(session_id)?;
        get_profile(self.conn, profile_id)?;

        self.conn.execute(
            "INSERT INTO attendance_records (id, session_id, program_profile_id, status, notes)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (session_id, program_profile_id)
             DO UPDATE SET status = excluded.status, notes = excluded.notes",
            params![new_id(), session_id, profile_id, status.as_str(), notes],
        )?;

        let sql = format!(
            "SELECT {} FROM attendance_records WHERE session_id = ?1 AND program_profile_id = ?2",
            AttendanceRecord::COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![session_id, profile_id], AttendanceRecord::from_row)?)
    }

    /// Mark a whole roll in one transaction
    pub fn mark_all(
        &self,
        session_id: &str,
        marks: &[(String, AttendanceStatus)],
    ) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let service = AttendanceService::new(&tx);
        for (profile_id, status) in marks {
            service.mark(session_id, profile_id, *status, None)?;
        }
        tx.commit()?;
        Ok(marks.len())
    }

    pub fn records_for_session(&self, session_id: &str) -> Result<Vec<AttendanceRecord>> {
        let sql = format!(
            "SELECT {} FROM attendance_records WHERE session_id = ?1 ORDER BY program_profile_id",
            AttendanceRecord::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([session_id], AttendanceRecord::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn session_summary(&self, session_id: &str) -> Result<SessionSummary> {
        let session = self.get_session(session_id)?;
        let counts: AttendanceCounts = self
            .records_for_session(session_id)?
            .into_iter()
            .map(|r| r.status)
            .collect();
        Ok(SessionSummary {
            session,
            marked: counts.marked(),
            rate: counts.rate(),
            counts,
        })
    }

    /// Attendance of one student across every session they were marked in
    pub fn profile_attendance(&self, profile_id: &str) -> Result<ProfileAttendance> {
        get_profile(self.conn, profile_id)?;
        let sql = format!(
            "SELECT {} FROM attendance_records WHERE program_profile_id = ?1",
            AttendanceRecord::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let counts: AttendanceCounts = stmt
            .query_map([profile_id], AttendanceRecord::from_row)?
            .map(|r| r.map(|r| r.status))
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .collect();

        Ok(ProfileAttendance {
            program_profile_id: profile_id.to_string(),
            sessions: counts.marked(),
            rate: counts.rate(),
            counts,
        })
    }
}
