// 👨‍👩‍👧 Sibling relationship between two persons

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ParseEnumError;
use crate::db::{enum_from_sql, timestamp_from_sql};

/// How the pair was found, strongest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectionMethod {
    /// Entered by an administrator
    Manual,

    /// Both persons are dependents of the same guardian
    SharedGuardian,

    /// Both persons are paid for by the same billing account
    SharedBillingAccount,

    /// Same normalized phone number or email on both persons
    SharedContact,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::Manual => "MANUAL",
            DetectionMethod::SharedGuardian => "SHARED_GUARDIAN",
            DetectionMethod::SharedBillingAccount => "SHARED_BILLING_ACCOUNT",
            DetectionMethod::SharedContact => "SHARED_CONTACT",
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionMethod {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MANUAL" => Ok(DetectionMethod::Manual),
            "SHARED_GUARDIAN" => Ok(DetectionMethod::SharedGuardian),
            "SHARED_BILLING_ACCOUNT" => Ok(DetectionMethod::SharedBillingAccount),
            "SHARED_CONTACT" => Ok(DetectionMethod::SharedContact),
            _ => Err(ParseEnumError::new("detection method", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiblingRelationship {
    pub id: String,
    /// Always the smaller of the two ids
    pub person1_id: String,
    pub person2_id: String,
    pub detection_method: DetectionMethod,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub verified: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl SiblingRelationship {
    pub const COLUMNS: &'static str =
        "id, person1_id, person2_id, detection_method, confidence, verified, is_active, created_at";

    /// Order a pair so (a, b) and (b, a) map to the same row
    pub fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// The other side of the pair, if `person_id` is in it
    pub fn other(&self, person_id: &str) -> Option<&str> {
        if self.person1_id == person_id {
            Some(&self.person2_id)
        } else if self.person2_id == person_id {
            Some(&self.person1_id)
        } else {
            None
        }
    }

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let method: String = row.get(3)?;
        let created_at: String = row.get(7)?;
        Ok(SiblingRelationship {
            id: row.get(0)?,
            person1_id: row.get(1)?,
            person2_id: row.get(2)?,
            detection_method: enum_from_sql(3, &method)?,
            confidence: row.get(4)?,
            verified: row.get(5)?,
            is_active: row.get(6)?,
            created_at: timestamp_from_sql(7, &created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_pair() {
        assert_eq!(SiblingRelationship::ordered_pair("b", "a"), ("a", "b"));
        assert_eq!(SiblingRelationship::ordered_pair("a", "b"), ("a", "b"));
    }

    #[test]
    fn test_other() {
        let rel = SiblingRelationship {
            id: "r".to_string(),
            person1_id: "a".to_string(),
            person2_id: "b".to_string(),
            detection_method: DetectionMethod::Manual,
            confidence: 1.0,
            verified: true,
            is_active: true,
            created_at: Utc::now(),
        };
        assert_eq!(rel.other("a"), Some("b"));
        assert_eq!(rel.other("b"), Some("a"));
        assert_eq!(rel.other("c"), None);
    }
}
