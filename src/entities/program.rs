// 🏫 Programs, profiles, batches and enrollments
//
// A Person can hold one ProgramProfile per program. The profile carries the
// current status; Enrollment rows carry the dated history of that status and
// the batch the student sat in at the time.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ParseEnumError;
use crate::db::{date_from_sql, enum_from_sql, opt_date_from_sql, timestamp_from_sql};

// ============================================================================
// PROGRAM
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Program {
    /// Adult / college-age program
    Mahad,

    /// Weekend children's program
    Dugsi,
}

impl Program {
    pub const ALL: [Program; 2] = [Program::Mahad, Program::Dugsi];

    pub fn as_str(&self) -> &'static str {
        match self {
            Program::Mahad => "MAHAD",
            Program::Dugsi => "DUGSI",
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Program {
    type Err = ParseEnumError;

    /// Case-insensitive so URL segments like `/webhooks/dugsi` parse too
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MAHAD" => Ok(Program::Mahad),
            "DUGSI" => Ok(Program::Dugsi),
            _ => Err(ParseEnumError::new("program", s)),
        }
    }
}

// ============================================================================
// ENROLLMENT STATUS
// ============================================================================

/// Status shared by ProgramProfile (current) and Enrollment (historical)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentStatus {
    Registered,
    Enrolled,
    Withdrawn,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Registered => "REGISTERED",
            EnrollmentStatus::Enrolled => "ENROLLED",
            EnrollmentStatus::Withdrawn => "WITHDRAWN",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, EnrollmentStatus::Withdrawn)
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrollmentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REGISTERED" => Ok(EnrollmentStatus::Registered),
            "ENROLLED" => Ok(EnrollmentStatus::Enrolled),
            "WITHDRAWN" => Ok(EnrollmentStatus::Withdrawn),
            _ => Err(ParseEnumError::new("enrollment status", s)),
        }
    }
}

// ============================================================================
// PROGRAM PROFILE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramProfile {
    pub id: String,
    pub person_id: String,
    pub program: Program,
    pub status: EnrollmentStatus,
    /// Monthly tuition in cents
    pub monthly_rate: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProgramProfile {
    pub const COLUMNS: &'static str =
        "id, person_id, program, status, monthly_rate, created_at, updated_at";

    pub fn new(person_id: &str, program: Program, monthly_rate: i64) -> Self {
        let now = Utc::now();
        ProgramProfile {
            id: crate::db::new_id(),
            person_id: person_id.to_string(),
            program,
            status: EnrollmentStatus::Registered,
            monthly_rate,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let program: String = row.get(2)?;
        let status: String = row.get(3)?;
        let created_at: String = row.get(5)?;
        let updated_at: String = row.get(6)?;
        Ok(ProgramProfile {
            id: row.get(0)?,
            person_id: row.get(1)?,
            program: enum_from_sql(2, &program)?,
            status: enum_from_sql(3, &status)?,
            monthly_rate: row.get(4)?,
            created_at: timestamp_from_sql(5, &created_at)?,
            updated_at: timestamp_from_sql(6, &updated_at)?,
        })
    }
}

// ============================================================================
// BATCH
// ============================================================================

/// A cohort of students that meets together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub const COLUMNS: &'static str = "id, name, start_date, end_date, created_at";

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let start_date: String = row.get(2)?;
        let created_at: String = row.get(4)?;
        Ok(Batch {
            id: row.get(0)?,
            name: row.get(1)?,
            start_date: date_from_sql(2, &start_date)?,
            end_date: opt_date_from_sql(3, row.get(3)?)?,
            created_at: timestamp_from_sql(4, &created_at)?,
        })
    }
}

// ============================================================================
// ENROLLMENT
// ============================================================================

/// One dated span of a profile's status. At most one is open (no end_date).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: String,
    pub program_profile_id: String,
    pub batch_id: Option<String>,
    pub status: EnrollmentStatus,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub end_reason: Option<String>,
}

impl Enrollment {
    pub const COLUMNS: &'static str =
        "id, program_profile_id, batch_id, status, start_date, end_date, end_reason";

    pub fn open(
        program_profile_id: &str,
        batch_id: Option<String>,
        status: EnrollmentStatus,
        start_date: NaiveDate,
    ) -> Self {
        Enrollment {
            id: crate::db::new_id(),
            program_profile_id: program_profile_id.to_string(),
            batch_id,
            status,
            start_date,
            end_date: None,
            end_reason: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_date.is_none()
    }

    /// Was this enrollment in effect on `date`? End date is exclusive.
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date <= date && self.end_date.map_or(true, |end| end > date)
    }

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status: String = row.get(3)?;
        let start_date: String = row.get(4)?;
        Ok(Enrollment {
            id: row.get(0)?,
            program_profile_id: row.get(1)?,
            batch_id: row.get(2)?,
            status: enum_from_sql(3, &status)?,
            start_date: date_from_sql(4, &start_date)?,
            end_date: opt_date_from_sql(5, row.get(5)?)?,
            end_reason: row.get(6)?,
        })
    }
}
