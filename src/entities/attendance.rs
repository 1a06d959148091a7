// 📋 Attendance - one session per batch per day, one record per student per session

use chrono::NaiveDate;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ParseEnumError;
use crate::db::{date_from_sql, enum_from_sql};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "PRESENT",
            AttendanceStatus::Absent => "ABSENT",
            AttendanceStatus::Late => "LATE",
            AttendanceStatus::Excused => "EXCUSED",
        }
    }

    /// Late still counts as attended
    pub fn counts_as_attended(&self) -> bool {
        matches!(self, AttendanceStatus::Present | AttendanceStatus::Late)
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PRESENT" => Ok(AttendanceStatus::Present),
            "ABSENT" => Ok(AttendanceStatus::Absent),
            "LATE" => Ok(AttendanceStatus::Late),
            "EXCUSED" => Ok(AttendanceStatus::Excused),
            _ => Err(ParseEnumError::new("attendance status", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceSession {
    pub id: String,
    pub batch_id: String,
    pub session_date: NaiveDate,
    pub notes: Option<String>,
}

impl AttendanceSession {
    pub const COLUMNS: &'static str = "id, batch_id, session_date, notes";

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let session_date: String = row.get(2)?;
        Ok(AttendanceSession {
            id: row.get(0)?,
            batch_id: row.get(1)?,
            session_date: date_from_sql(2, &session_date)?,
            notes: row.get(3)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub session_id: String,
    pub program_profile_id: String,
    pub status: AttendanceStatus,
    pub notes: Option<String>,
}

impl AttendanceRecord {
    pub const COLUMNS: &'static str = "id, session_id, program_profile_id, status, notes";

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status: String = row.get(3)?;
        Ok(AttendanceRecord {
            id: row.get(0)?,
            session_id: row.get(1)?,
            program_profile_id: row.get(2)?,
            status: enum_from_sql(3, &status)?,
            notes: row.get(4)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attended_statuses() {
        assert!(AttendanceStatus::Present.counts_as_attended());
        assert!(AttendanceStatus::Late.counts_as_attended());
        assert!(!AttendanceStatus::Absent.counts_as_attended());
        assert!(!AttendanceStatus::Excused.counts_as_attended());
    }

    #[test]
    fn test_parse() {
        assert_eq!("late".parse::<AttendanceStatus>().unwrap(), AttendanceStatus::Late);
        assert!("tardy".parse::<AttendanceStatus>().is_err());
    }
}
