// 👨‍👩‍👧‍👦 Sibling Detection Engine - Find persons who belong to one family
// Three strategies: Shared Guardian, Shared Billing Account, Shared Contact

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use crate::config::DEFAULT_SIBLING_THRESHOLD;
use crate::db::{new_id, record_event};
use crate::entities::{DetectionMethod, SiblingRelationship};
use crate::error::{AdminError, Result};
use crate::students::find_person;

// ============================================================================
// PERSON SNAPSHOT
// ============================================================================

/// What the engine needs to know about one person
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersonSnapshot {
    pub person_id: String,
    pub guardian_ids: BTreeSet<String>,
    pub billing_account_ids: BTreeSet<String>,
    /// "EMAIL:value" / "PHONE:value", already normalized
    pub contacts: BTreeSet<String>,
}

impl PersonSnapshot {
    pub fn new(person_id: &str) -> Self {
        PersonSnapshot {
            person_id: person_id.to_string(),
            ..Default::default()
        }
    }
}

// ============================================================================
// SIBLING MATCH RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiblingMatch {
    /// Smaller id of the pair
    pub person1_id: String,
    pub person2_id: String,

    /// Confidence score (0.0 - 1.0)
    pub confidence: f64,

    /// Which strategy detected this match
    pub method: DetectionMethod,

    /// Human-readable reason
    pub reason: String,
}

// ============================================================================
// SIBLING DETECTION ENGINE
// ============================================================================

pub struct SiblingDetectionEngine {
    /// Confidence for a shared guardian (default: 0.95)
    pub shared_guardian_confidence: f64,

    /// Confidence for a shared billing account (default: 0.90)
    pub shared_billing_confidence: f64,

    /// Confidence for a shared phone or email (default: 0.80)
    pub shared_contact_confidence: f64,

    /// Matches below this are dropped (default: 0.75)
    pub threshold: f64,
}

impl SiblingDetectionEngine {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_SIBLING_THRESHOLD)
    }

    pub fn with_threshold(threshold: f64) -> Self {
        SiblingDetectionEngine {
            shared_guardian_confidence: 0.95,
            shared_billing_confidence: 0.90,
            shared_contact_confidence: 0.80,
            threshold,
        }
    }

    /// Compare every person with every other person; strongest strategy wins
    pub fn find_siblings(&self, persons: &[PersonSnapshot]) -> Vec<SiblingMatch> {
        let mut matches = Vec::new();

        for i in 0..persons.len() {
            for j in (i + 1)..persons.len() {
                let a = &persons[i];
                let b = &persons[j];

                if a.person_id == b.person_id || is_guardian_of(a, b) || is_guardian_of(b, a) {
                    continue;
                }

                let found = self
                    .check_shared_guardian(a, b)
                    .or_else(|| self.check_shared_billing(a, b))
                    .or_else(|| self.check_shared_contact(a, b));

                if let Some(m) = found {
                    if m.confidence >= self.threshold {
                        matches.push(m);
                    }
                }
            }
        }

        matches
    }

    /// Strategy 1: Shared Guardian
    fn check_shared_guardian(
        &self,
        a: &PersonSnapshot,
        b: &PersonSnapshot,
    ) -> Option<SiblingMatch> {
        let shared = a.guardian_ids.intersection(&b.guardian_ids).next()?;
        Some(self.build(
            a,
            b,
            DetectionMethod::SharedGuardian,
            self.shared_guardian_confidence,
            format!("Shared guardian {}", shared),
        ))
    }

    /// Strategy 2: Shared Billing Account
    fn check_shared_billing(&self, a: &PersonSnapshot, b: &PersonSnapshot) -> Option<SiblingMatch> {
        let shared = a.billing_account_ids.intersection(&b.billing_account_ids).next()?;
        Some(self.build(
            a,
            b,
            DetectionMethod::SharedBillingAccount,
            self.shared_billing_confidence,
            format!("Shared billing account {}", shared),
        ))
    }

    /// Strategy 3: Shared Contact
    fn check_shared_contact(&self, a: &PersonSnapshot, b: &PersonSnapshot) -> Option<SiblingMatch> {
        let shared = a.contacts.intersection(&b.contacts).next()?;
        Some(self.build(
            a,
            b,
            DetectionMethod::SharedContact,
            self.shared_contact_confidence,
            format!("Shared contact {}", shared),
        ))
    }

    fn build(
        &self,
        a: &PersonSnapshot,
        b: &PersonSnapshot,
        method: DetectionMethod,
        confidence: f64,
        reason: String,
    ) -> SiblingMatch {
        let (p1, p2) = SiblingRelationship::ordered_pair(&a.person_id, &b.person_id);
        SiblingMatch {
            person1_id: p1.to_string(),
            person2_id: p2.to_string(),
            confidence,
            method,
            reason,
        }
    }
}

impl Default for SiblingDetectionEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn is_guardian_of(guardian: &PersonSnapshot, dependent: &PersonSnapshot) -> bool {
    dependent.guardian_ids.contains(&guardian.person_id)
}

// ============================================================================
// PERSISTENCE
// ============================================================================

/// A sibling as seen from one person
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiblingInfo {
    pub relationship_id: String,
    pub person_id: String,
    pub first_name: String,
    pub last_name: String,
    pub detection_method: DetectionMethod,
    pub confidence: f64,
    pub verified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    Created,
    Upgraded,
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetectionSummary {
    pub pairs_found: usize,
    pub created: usize,
    pub upgraded: usize,
}

fn string_pair(row: &rusqlite::Row) -> rusqlite::Result<(String, String)> {
    Ok((row.get(0)?, row.get(1)?))
}

pub struct SiblingService<'a> {
    conn: &'a Connection,
}

impl<'a> SiblingService<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        SiblingService { conn }
    }

    pub fn find_relationship(&self, relationship_id: &str) -> Result<Option<SiblingRelationship>> {
        let sql = format!(
            "SELECT {} FROM sibling_relationships WHERE id = ?1",
            SiblingRelationship::COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, [relationship_id], SiblingRelationship::from_row)
            .optional()?)
    }

    fn find_pair(&self, a: &str, b: &str) -> Result<Option<SiblingRelationship>> {
        let (p1, p2) = SiblingRelationship::ordered_pair(a, b);
        let sql = format!(
            "SELECT {} FROM sibling_relationships WHERE person1_id = ?1 AND person2_id = ?2",
            SiblingRelationship::COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![p1, p2], SiblingRelationship::from_row)
            .optional()?)
    }

    /// Store a detected pair. An existing row only changes when the new
    /// confidence is higher; MANUAL rows and deactivated rows are left alone.
    pub fn upsert_detected(&self, found: &SiblingMatch) -> Result<UpsertResult> {
        match self.find_pair(&found.person1_id, &found.person2_id)? {
            None => {
                self.insert(
                    &found.person1_id,
                    &found.person2_id,
                    found.method,
                    found.confidence,
                    false,
                )?;
                Ok(UpsertResult::Created)
            }
            Some(existing)
                if existing.is_active
                    && existing.detection_method != DetectionMethod::Manual
                    && found.confidence > existing.confidence =>
            {
                self.conn.execute(
                    "UPDATE sibling_relationships SET detection_method = ?1, confidence = ?2 WHERE id = ?3",
                    params![found.method.as_str(), found.confidence, existing.id],
                )?;
                Ok(UpsertResult::Upgraded)
            }
            Some(_) => Ok(UpsertResult::Unchanged),
        }
    }

    fn insert(
        &self,
        a: &str,
        b: &str,
        method: DetectionMethod,
        confidence: f64,
        verified: bool,
    ) -> Result<SiblingRelationship> {
        let (p1, p2) = SiblingRelationship::ordered_pair(a, b);
        let relationship = SiblingRelationship {
            id: new_id(),
            person1_id: p1.to_string(),
            person2_id: p2.to_string(),
            detection_method: method,
            confidence,
            verified,
            is_active: true,
            created_at: Utc::now(),
        };
        self.conn.execute(
            "INSERT INTO sibling_relationships
             (id, person1_id, person2_id, detection_method, confidence, verified, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
            params![
                relationship.id,
                relationship.person1_id,
                relationship.person2_id,
                method.as_str(),
                confidence,
                verified,
                relationship.created_at.to_rfc3339(),
            ],
        )?;
        Ok(relationship)
    }

    /// Administrator-entered pair: MANUAL, full confidence, verified
    pub fn add_manual(&self, a: &str, b: &str) -> Result<SiblingRelationship> {
        if a == b {
            return Err(AdminError::validation("siblings: a person cannot be their own sibling"));
        }
        for id in [a, b] {
            if find_person(self.conn, id)?.is_none() {
                return Err(AdminError::not_found("Person", id));
            }
        }

        let relationship = match self.find_pair(a, b)? {
            Some(existing) => {
                self.conn.execute(
                    "UPDATE sibling_relationships
                     SET detection_method = 'MANUAL', confidence = 1.0, verified = 1, is_active = 1
                     WHERE id = ?1",
                    [&existing.id],
                )?;
                self.find_relationship(&existing.id)?
                    .ok_or_else(|| AdminError::not_found("Sibling relationship", &existing.id))?
            }
            None => self.insert(a, b, DetectionMethod::Manual, 1.0, true)?,
        };

        record_event(
            self.conn,
            "sibling_added",
            "sibling_relationship",
            &relationship.id,
            serde_json::json!({
                "person1_id": relationship.person1_id,
                "person2_id": relationship.person2_id,
            }),
            "admin",
        )?;
        Ok(relationship)
    }

    pub fn verify(&self, relationship_id: &str) -> Result<SiblingRelationship> {
        let updated = self.conn.execute(
            "UPDATE sibling_relationships SET verified = 1 WHERE id = ?1",
            [relationship_id],
        )?;
        if updated == 0 {
            return Err(AdminError::not_found("Sibling relationship", relationship_id));
        }
        self.find_relationship(relationship_id)?
            .ok_or_else(|| AdminError::not_found("Sibling relationship", relationship_id))
    }

    /// Deactivate; the row stays so detection does not bring the pair back
    pub fn remove(&self, relationship_id: &str) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE sibling_relationships SET is_active = 0 WHERE id = ?1",
            [relationship_id],
        )?;
        if updated == 0 {
            return Err(AdminError::not_found("Sibling relationship", relationship_id));
        }
        record_event(
            self.conn,
            "sibling_removed",
            "sibling_relationship",
            relationship_id,
            serde_json::json!({}),
            "admin",
        )?;
        Ok(())
    }

    /// Active siblings of a person, strongest first
    pub fn siblings_of(&self, person_id: &str) -> Result<Vec<SiblingInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.id, p.id, p.first_name, p.last_name, r.detection_method, r.confidence, r.verified
             FROM sibling_relationships r
             JOIN persons p ON p.id = CASE WHEN r.person1_id = ?1 THEN r.person2_id ELSE r.person1_id END
             WHERE (r.person1_id = ?1 OR r.person2_id = ?1) AND r.is_active = 1
             ORDER BY r.confidence DESC, p.first_name",
        )?;
        let rows = stmt
            .query_map([person_id], |row| {
                let method: String = row.get(4)?;
                Ok(SiblingInfo {
                    relationship_id: row.get(0)?,
                    person_id: row.get(1)?,
                    first_name: row.get(2)?,
                    last_name: row.get(3)?,
                    detection_method: crate::db::enum_from_sql(4, &method)?,
                    confidence: row.get(5)?,
                    verified: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Snapshot of every person that has at least one program profile
    pub fn snapshots(&self) -> Result<Vec<PersonSnapshot>> {
        let mut by_person: BTreeMap<String, PersonSnapshot> = BTreeMap::new();

        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT person_id FROM program_profiles ORDER BY person_id")?;
        for id in stmt.query_map([], |row| row.get::<_, String>(0))? {
            let id = id?;
            by_person.insert(id.clone(), PersonSnapshot::new(&id));
        }

        let mut stmt = self
            .conn
            .prepare("SELECT dependent_id, guardian_id FROM guardian_relationships")?;
        for pair in stmt.query_map([], string_pair)? {
            let (dependent, guardian) = pair?;
            if let Some(snapshot) = by_person.get_mut(&dependent) {
                snapshot.guardian_ids.insert(guardian);
            }
        }

        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT pp.person_id, s.billing_account_id
             FROM billing_assignments a
             JOIN subscriptions s ON s.id = a.subscription_id
             JOIN program_profiles pp ON pp.id = a.program_profile_id
             WHERE a.is_active = 1",
        )?;
        for pair in stmt.query_map([], string_pair)? {
            let (person, account) = pair?;
            if let Some(snapshot) = by_person.get_mut(&person) {
                snapshot.billing_account_ids.insert(account);
            }
        }

        let mut stmt = self
            .conn
            .prepare("SELECT person_id, contact_type, value FROM contact_points")?;
        for contact in stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })? {
            let (person, contact_type, value) = contact?;
            if let Some(snapshot) = by_person.get_mut(&person) {
                snapshot.contacts.insert(format!("{}:{}", contact_type, value));
            }
        }

        Ok(by_person.into_values().collect())
    }

    /// Run the engine over the whole database and store what it finds
    pub fn detect_and_store(&self, engine: &SiblingDetectionEngine) -> Result<DetectionSummary> {
        let snapshots = self.snapshots()?;
        let found = engine.find_siblings(&snapshots);

        let tx = self.conn.unchecked_transaction()?;
        let service = SiblingService::new(&tx);
        let mut summary = DetectionSummary {
            pairs_found: found.len(),
            ..Default::default()
        };
        for m in &found {
            match service.upsert_detected(m)? {
                UpsertResult::Created => summary.created += 1,
                UpsertResult::Upgraded => summary.upgraded += 1,
                UpsertResult::Unchanged => {}
            }
        }
        tx.commit()?;

        info!(
            persons = snapshots.len(),
            pairs = summary.pairs_found,
            created = summary.created,
            upgraded = summary.upgraded,
            "Sibling detection finished"
        );
        Ok(summary)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrollment::test_support::*;
    use crate::entities::{EnrollmentStatus, Program};

    fn snapshot(
        id: &str,
        guardians: &[&str],
        accounts: &[&str],
        contacts: &[&str],
    ) -> PersonSnapshot {
        PersonSnapshot {
            person_id: id.to_string(),
            guardian_ids: guardians.iter().map(|s| s.to_string()).collect(),
            billing_account_ids: accounts.iter().map(|s| s.to_string()).collect(),
            contacts: contacts.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_shared_guardian() {
        let engine = SiblingDetectionEngine::new();
        let persons = vec![
            snapshot("b", &["mom"], &[], &[]),
            snapshot("a", &["mom"], &[], &[]),
        ];
        let matches = engine.find_siblings(&persons);

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].method, DetectionMethod::SharedGuardian);
        assert_eq!(matches[0].person1_id, "a");
        assert_eq!(matches[0].person2_id, "b");
        assert!(matches[0].confidence >= 0.95);
    }

    #[test]
    fn test_strongest_strategy_wins() {
        let engine = SiblingDetectionEngine::new();
        let persons = vec![
            snapshot("a", &[], &["acct"], &["PHONE:6125550100"]),
            snapshot("b", &[], &["acct"], &["PHONE:6125550100"]),
        ];
        let matches = engine.find_siblings(&persons);

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].method, DetectionMethod::SharedBillingAccount);
    }

    #[test]
    fn test_shared_contact_and_threshold() {
        let persons = vec![
            snapshot("a", &[], &[], &["EMAIL:family@example.com"]),
            snapshot("b", &[], &[], &["EMAIL:family@example.com"]),
            snapshot("c", &[], &[], &["EMAIL:other@example.com"]),
        ];
        let matches = SiblingDetectionEngine::new().find_siblings(&persons);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].method, DetectionMethod::SharedContact);

        let strict = SiblingDetectionEngine::with_threshold(0.85);
        assert!(strict.find_siblings(&persons).is_empty());
    }

    #[test]
    fn test_guardian_is_not_a_sibling_of_their_child() {
        let persons = vec![
            snapshot("parent", &[], &[], &["PHONE:6125550100"]),
            snapshot("child", &["parent"], &[], &["PHONE:6125550100"]),
        ];
        assert!(SiblingDetectionEngine::new().find_siblings(&persons).is_empty());
    }

    #[test]
    fn test_upsert_keeps_higher_confidence_and_manual() {
        let conn = fresh_db();
        let service = SiblingService::new(&conn);
        let a = insert_person(&conn, "Aamir", "Hassan");
        let b = insert_person(&conn, "Bilan", "Hassan");
        let (p1, p2) = SiblingRelationship::ordered_pair(&a.id, &b.id);

        let contact = SiblingMatch {
            person1_id: p1.to_string(),
            person2_id: p2.to_string(),
            confidence: 0.80,
            method: DetectionMethod::SharedContact,
            reason: "test".to_string(),
        };
        let guardian = SiblingMatch {
            confidence: 0.95,
            method: DetectionMethod::SharedGuardian,
            ..contact.clone()
        };

        assert_eq!(service.upsert_detected(&contact).unwrap(), UpsertResult::Created);
        assert_eq!(service.upsert_detected(&guardian).unwrap(), UpsertResult::Upgraded);
        assert_eq!(service.upsert_detected(&contact).unwrap(), UpsertResult::Unchanged);

        let manual = service.add_manual(&b.id, &a.id).unwrap();
        assert_eq!(manual.detection_method, DetectionMethod::Manual);
        assert!(manual.verified);
        assert_eq!(service.upsert_detected(&guardian).unwrap(), UpsertResult::Unchanged);

        let siblings = service.siblings_of(&a.id).unwrap();
        assert_eq!(siblings.len(), 1);
        assert_eq!(siblings[0].person_id, b.id);
        assert_eq!(siblings[0].detection_method, DetectionMethod::Manual);
    }

    #[test]
    fn test_remove_and_verify() {
        let conn = fresh_db();
        let service = SiblingService::new(&conn);
        let a = insert_person(&conn, "Deeqa", "Ahmed");
        let b = insert_person(&conn, "Faisal", "Ahmed");
        let (p1, p2) = SiblingRelationship::ordered_pair(&a.id, &b.id);
        let found = SiblingMatch {
            person1_id: p1.to_string(),
            person2_id: p2.to_string(),
            confidence: 0.9,
            method: DetectionMethod::SharedBillingAccount,
            reason: "test".to_string(),
        };
        service.upsert_detected(&found).unwrap();
        let rel_id = service.siblings_of(&a.id).unwrap()[0].relationship_id.clone();

        assert!(service.verify(&rel_id).unwrap().verified);
        service.remove(&rel_id).unwrap();
        assert!(service.siblings_of(&a.id).unwrap().is_empty());

        // Removed pairs are not revived by detection
        assert_eq!(service.upsert_detected(&found).unwrap(), UpsertResult::Unchanged);
        assert!(matches!(service.remove("missing").unwrap_err(), AdminError::NotFound(_)));
    }

    #[test]
    fn test_manual_validation() {
        let conn = fresh_db();
        let service = SiblingService::new(&conn);
        let a = insert_person(&conn, "Hani", "Nur");
        assert!(matches!(service.add_manual(&a.id, &a.id).unwrap_err(), AdminError::Validation(_)));
        assert!(matches!(
            service.add_manual(&a.id, "missing").unwrap_err(),
            AdminError::NotFound(_)
        ));
    }

    #[test]
    fn test_detect_and_store_from_database() {
        let conn = fresh_db();
        let service = SiblingService::new(&conn);
        let first = insert_student(&conn, "Maryan", Program::Dugsi, EnrollmentStatus::Enrolled);
        let second = insert_student(&conn, "Mustafe", Program::Dugsi, EnrollmentStatus::Enrolled);
        insert_student(&conn, "Other", Program::Mahad, EnrollmentStatus::Enrolled);
        let parent = insert_person(&conn, "Parent", "Test");
        for child in [&first.person_id, &second.person_id] {
            conn.execute(
                "INSERT INTO guardian_relationships (id, guardian_id, dependent_id) VALUES (?1, ?2, ?3)",
                params![new_id(), parent.id, child],
            )
            .unwrap();
        }

        let summary = service.detect_and_store(&SiblingDetectionEngine::new()).unwrap();
        assert_eq!(summary.pairs_found, 1);
        assert_eq!(summary.created, 1);

        let siblings = service.siblings_of(&first.person_id).unwrap();
        assert_eq!(siblings.len(), 1);
        assert_eq!(siblings[0].person_id, second.person_id);
        assert_eq!(siblings[0].detection_method, DetectionMethod::SharedGuardian);

        // Second run finds the same pair and changes nothing
        let again = service.detect_and_store(&SiblingDetectionEngine::new()).unwrap();
        assert_eq!(again.created, 0);
        assert_eq!(again.upgraded, 0);
    }
}
