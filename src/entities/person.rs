// 👤 Person + contact points
//
// A Person is the stable identity. Names and contact points are values
// attached to it; the same person can appear in several programs.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ParseEnumError;
use crate::db::{enum_from_sql, opt_date_from_sql, timestamp_from_sql};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Person {
    pub const COLUMNS: &'static str =
        "id, first_name, last_name, date_of_birth, created_at, updated_at";

    pub fn new(first_name: String, last_name: String, date_of_birth: Option<NaiveDate>) -> Self {
        let now = Utc::now();
        Person {
            id: crate::db::new_id(),
            first_name,
            last_name,
            date_of_birth,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// Age in whole years on `on`, if date of birth is known
    pub fn age_on(&self, on: NaiveDate) -> Option<u32> {
        self.date_of_birth.and_then(|dob| on.years_since(dob))
    }

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let created_at: String = row.get(4)?;
        let updated_at: String = row.get(5)?;
        Ok(Person {
            id: row.get(0)?,
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            date_of_birth: opt_date_from_sql(3, row.get(3)?)?,
            created_at: timestamp_from_sql(4, &created_at)?,
            updated_at: timestamp_from_sql(5, &updated_at)?,
        })
    }
}

// ============================================================================
// CONTACT POINTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContactType {
    Email,
    Phone,
}

impl ContactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactType::Email => "EMAIL",
            ContactType::Phone => "PHONE",
        }
    }
}

impl fmt::Display for ContactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContactType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EMAIL" => Ok(ContactType::Email),
            "PHONE" => Ok(ContactType::Phone),
            _ => Err(ParseEnumError::new("contact type", s)),
        }
    }
}

/// Email or phone, always stored normalized (see `validation`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactPoint {
    pub id: String,
    pub person_id: String,
    pub contact_type: ContactType,
    pub value: String,
    pub is_primary: bool,
}

impl ContactPoint {
    pub const COLUMNS: &'static str = "id, person_id, contact_type, value, is_primary";

    pub fn new(
        person_id: &str,
        contact_type: ContactType,
        value: String,
        is_primary: bool,
    ) -> Self {
        ContactPoint {
            id: crate::db::new_id(),
            person_id: person_id.to_string(),
            contact_type,
            value,
            is_primary,
        }
    }

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let contact_type: String = row.get(2)?;
        Ok(ContactPoint {
            id: row.get(0)?,
            person_id: row.get(1)?,
            contact_type: enum_from_sql(2, &contact_type)?,
            value: row.get(3)?,
            is_primary: row.get(4)?,
        })
    }
}
