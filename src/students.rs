// 🎓 Student service - person + program profile CRUD over the normalized model
//
// "Student" is a view: Person (identity, contacts) joined with one
// ProgramProfile (program, status, rate) and its open Enrollment (batch).

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::info;

use crate::billing::BillingService;
use crate::db::{date_to_sql, new_id, record_event};
use crate::enrollment::{
    apply_profile_status, enrollment_history, get_profile, insert_enrollment, insert_profile,
    open_enrollment, profiles_for_person,
};
use crate::entities::{
    Batch, ContactPoint, ContactType, Enrollment, EnrollmentStatus, ParseEnumError, Person,
    Program, ProgramProfile, Subscription,
};
use crate::error::{AdminError, Result};
use crate::siblings::{SiblingInfo, SiblingService};
use crate::status_mapping::StatusChange;
use crate::validation::{
    normalize_email, normalize_phone, require_name, validate_amount, validate_date_of_birth,
    validate_new_student, ValidatedStudent, Validator,
};

// ============================================================================
// INPUT / OUTPUT TYPES
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewStudent {
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    pub program: Option<Program>,
    #[serde(default)]
    pub batch_id: Option<String>,
    /// Cents per month
    #[serde(default)]
    pub monthly_rate: i64,
    /// Existing persons (parents) this student depends on
    #[serde(default)]
    pub guardian_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudentUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub monthly_rate: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StudentFilter {
    pub program: Option<Program>,
    pub status: Option<EnrollmentStatus>,
    pub batch_id: Option<String>,
    /// Case-insensitive match on first or last name
    pub search: Option<String>,
}

/// One row of the student list / export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentSummary {
    pub profile_id: String,
    pub person_id: String,
    pub first_name: String,
    pub last_name: String,
    pub program: Program,
    pub status: EnrollmentStatus,
    pub monthly_rate: i64,
    pub batch_id: Option<String>,
    pub batch_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentDetail {
    pub person: Person,
    pub profile: ProgramProfile,
    pub contacts: Vec<ContactPoint>,
    pub enrollment: Option<Enrollment>,
    pub batch: Option<Batch>,
    pub enrollment_history: Vec<Enrollment>,
    pub subscription: Option<Subscription>,
    pub siblings: Vec<SiblingInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            _ => Err(ParseEnumError::new("export format", s)),
        }
    }
}

// ============================================================================
// ROW-LEVEL HELPERS (no transaction handling; shared with the legacy migration)
// ============================================================================

pub(crate) fn insert_person(conn: &Connection, person: &Person) -> Result<()> {
    conn.execute(
        "INSERT INTO persons (id, first_name, last_name, date_of_birth, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            person.id,
            person.first_name,
            person.last_name,
            person.date_of_birth.map(date_to_sql),
            person.created_at.to_rfc3339(),
            person.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Add a contact point; an identical one already on the person is left alone
pub(crate) fn add_contact(
    conn: &Connection,
    person_id: &str,
    contact_type: ContactType,
    value: &str,
    is_primary: bool,
) -> Result<()> {
    if is_primary {
        conn.execute(
            "UPDATE contact_points SET is_primary = 0 WHERE person_id = ?1 AND contact_type = ?2",
            params![person_id, contact_type.as_str()],
        )?;
    }
    let contact = ContactPoint::new(person_id, contact_type, value.to_string(), is_primary);
    conn.execute(
        "INSERT INTO contact_points (id, person_id, contact_type, value, is_primary)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (person_id, contact_type, value) DO UPDATE SET is_primary = excluded.is_primary",
        params![contact.id, contact.person_id, contact_type.as_str(), contact.value, is_primary],
    )?;
    Ok(())
}

pub fn find_person(conn: &Connection, person_id: &str) -> Result<Option<Person>> {
    let sql = format!("SELECT {} FROM persons WHERE id = ?1", Person::COLUMNS);
    Ok(conn.query_row(&sql, [person_id], Person::from_row).optional()?)
}

/// Look a person up by an already-normalized contact value
pub fn find_person_by_contact(
    conn: &Connection,
    contact_type: ContactType,
    value: &str,
) -> Result<Option<Person>> {
    let sql = format!(
        "SELECT {} FROM persons WHERE id = (
            SELECT person_id FROM contact_points WHERE contact_type = ?1 AND value = ?2
            ORDER BY is_primary DESC LIMIT 1)",
        Person::COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![contact_type.as_str(), value], Person::from_row)
        .optional()?)
}

/// Same contact value and same full name. Siblings often share a parent's
/// email, so the contact alone does not identify a person.
pub(crate) fn find_person_by_contact_and_name(
    conn: &Connection,
    contact_type: ContactType,
    value: &str,
    first_name: &str,
    last_name: &str,
) -> Result<Option<Person>> {
    let sql = format!(
        "SELECT {} FROM persons WHERE first_name = ?3 AND last_name = ?4 AND id IN (
            SELECT person_id FROM contact_points WHERE contact_type = ?1 AND value = ?2)
         ORDER BY created_at LIMIT 1",
        Person::COLUMNS
    );
    Ok(conn
        .query_row(
            &sql,
            params![contact_type.as_str(), value, first_name, last_name],
            Person::from_row,
        )
        .optional()?)
}

pub fn contacts_for_person(conn: &Connection, person_id: &str) -> Result<Vec<ContactPoint>> {
    let sql = format!(
        "SELECT {} FROM contact_points WHERE person_id = ?1 ORDER BY contact_type, is_primary DESC, value",
        ContactPoint::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([person_id], ContactPoint::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Escape `%`, `_` and the escape character itself for `LIKE ... ESCAPE '\'`
fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub(crate) fn batch_exists(conn: &Connection, batch_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM batches WHERE id = ?1", [batch_id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

// ============================================================================
// STUDENT SERVICE
// ============================================================================

pub struct StudentService<'a> {
    conn: &'a Connection,
}

impl<'a> StudentService<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        StudentService { conn }
    }

    /// Create Person (or reuse the one with the same email and name), contacts,
    /// REGISTERED profile and its first enrollment.
    pub fn create_student(&self, input: &NewStudent, today: NaiveDate) -> Result<ProgramProfile> {
        let ValidatedStudent {
            first_name,
            last_name,
            email,
            phone,
            date_of_birth,
            program,
            monthly_rate,
        } = validate_new_student(input, today)?;

        if let Some(batch_id) = &input.batch_id {
            if !batch_exists(self.conn, batch_id)? {
                return Err(AdminError::not_found("Batch", batch_id));
            }
        }

        let tx = self.conn.unchecked_transaction()?;

        let existing = match &email {
            Some(email) => find_person_by_contact_and_name(
                &tx,
                ContactType::Email,
                email,
                &first_name,
                &last_name,
            )?,
            None => None,
        };
        let person = match existing {
            Some(person) => {
                if profiles_for_person(&tx, &person.id)?
                    .iter()
                    .any(|p| p.program == program)
                {
                    return Err(AdminError::Conflict(format!(
                        "{} already has a {} profile",
                        person.full_name(),
                        program
                    )));
                }
                person
            }
            None => {
                let person = Person::new(first_name, last_name, date_of_birth);
                insert_person(&tx, &person)?;
                person
            }
        };

        if let Some(email) = &email {
            add_contact(&tx, &person.id, ContactType::Email, email, true)?;
        }
        if let Some(phone) = &phone {
            add_contact(&tx, &person.id, ContactType::Phone, phone, true)?;
        }
        for guardian_id in &input.guardian_ids {
            self.link_guardian(&tx, guardian_id, &person.id, "PARENT")?;
        }

        let profile = ProgramProfile::new(&person.id, program, monthly_rate);
        insert_profile(&tx, &profile)?;
        insert_enrollment(
            &tx,
            &Enrollment::open(&profile.id, input.batch_id.clone(), profile.status, today),
        )?;

        record_event(
            &tx,
            "student_created",
            "program_profile",
            &profile.id,
            serde_json::json!({ "person_id": person.id, "program": program }),
            "admin",
        )?;
        tx.commit()?;

        info!(profile_id = %profile.id, program = %program, "Student created");
        Ok(profile)
    }

    /// Person record for a guardian (parent) who is not a student
    pub fn create_guardian(
        &self,
        first_name: &str,
        last_name: &str,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Person> {
        let mut v = Validator::new();
        let first = v.check(require_name("first_name", first_name));
        let last = v.check(require_name("last_name", last_name));
        let email = email.and_then(|e| v.check(normalize_email(e)));
        let phone = phone.and_then(|p| v.check(normalize_phone(p)));
        v.finish()?;
        let (Some(first), Some(last)) = (first, last) else {
            return Err(AdminError::validation("first_name/last_name: required"));
        };

        let tx = self.conn.unchecked_transaction()?;
        let person = Person::new(first, last, None);
        insert_person(&tx, &person)?;
        if let Some(email) = &email {
            add_contact(&tx, &person.id, ContactType::Email, email, true)?;
        }
        if let Some(phone) = &phone {
            add_contact(&tx, &person.id, ContactType::Phone, phone, true)?;
        }
        tx.commit()?;
        Ok(person)
    }

    fn link_guardian(
        &self,
        conn: &Connection,
        guardian_id: &str,
        dependent_id: &str,
        role: &str,
    ) -> Result<()> {
        if guardian_id == dependent_id {
            return Err(AdminError::validation(
                "guardian_ids: a person cannot be their own guardian",
            ));
        }
        if find_person(conn, guardian_id)?.is_none() {
            return Err(AdminError::not_found("Guardian", guardian_id));
        }
        conn.execute(
            "INSERT OR IGNORE INTO guardian_relationships (id, guardian_id, dependent_id, role)
             VALUES (?1, ?2, ?3, ?4)",
            params![new_id(), guardian_id, dependent_id, role],
        )?;
        Ok(())
    }

    pub fn add_guardian(&self, guardian_id: &str, dependent_id: &str) -> Result<()> {
        if find_person(self.conn, dependent_id)?.is_none() {
            return Err(AdminError::not_found("Person", dependent_id));
        }
        self.link_guardian(self.conn, guardian_id, dependent_id, "PARENT")
    }

    pub fn get_student(&self, profile_id: &str) -> Result<StudentDetail> {
        let profile = get_profile(self.conn, profile_id)?;
        let person = find_person(self.conn, &profile.person_id)?
            .ok_or_else(|| AdminError::not_found("Person", &profile.person_id))?;
        let enrollment = open_enrollment(self.conn, profile_id)?;
        let batch = match enrollment.as_ref().and_then(|e| e.batch_id.as_deref()) {
            Some(batch_id) => crate::batches::BatchService::new(self.conn).find_batch(batch_id)?,
            None => None,
        };

        Ok(StudentDetail {
            contacts: contacts_for_person(self.conn, &person.id)?,
            enrollment_history: enrollment_history(self.conn, profile_id)?,
            subscription: BillingService::new(self.conn).subscription_for_profile(profile_id)?,
            siblings: SiblingService::new(self.conn).siblings_of(&person.id)?,
            person,
            profile,
            enrollment,
            batch,
        })
    }

    pub fn list_students(&self, filter: &StudentFilter) -> Result<Vec<StudentSummary>> {
        let search = filter
            .search
            .as_deref()
            .map(|s| format!("%{}%", escape_like(&s.trim().to_lowercase())));

        let mut stmt = self.conn.prepare(
            "SELECT pp.id, p.id, p.first_name, p.last_name, pp.program, pp.status, pp.monthly_rate,
                    e.batch_id, b.name,
                    (SELECT value FROM contact_points c
                     WHERE c.person_id = p.id AND c.contact_type = 'EMAIL'
                     ORDER BY c.is_primary DESC LIMIT 1),
                    (SELECT value FROM contact_points c
                     WHERE c.person_id = p.id AND c.contact_type = 'PHONE'
                     ORDER BY c.is_primary DESC LIMIT 1)
             FROM program_profiles pp
             JOIN persons p ON p.id = pp.person_id
             LEFT JOIN enrollments e ON e.program_profile_id = pp.id AND e.end_date IS NULL
             LEFT JOIN batches b ON b.id = e.batch_id
             WHERE (?1 IS NULL OR pp.program = ?1)
               AND (?2 IS NULL OR pp.status = ?2)
               AND (?3 IS NULL OR e.batch_id = ?3)
               AND (?4 IS NULL
                    OR lower(p.first_name) LIKE ?4 ESCAPE '\\'
                    OR lower(p.last_name) LIKE ?4 ESCAPE '\\')
             ORDER BY p.last_name, p.first_name, pp.program",
        )?;

        let rows = stmt
            .query_map(
                params![
                    filter.program.map(|p| p.as_str()),
                    filter.status.map(|s| s.as_str()),
                    filter.batch_id,
                    search,
                ],
                |row| {
                    let program: String = row.get(4)?;
                    let status: String = row.get(5)?;
                    Ok(StudentSummary {
                        profile_id: row.get(0)?,
                        person_id: row.get(1)?,
                        first_name: row.get(2)?,
                        last_name: row.get(3)?,
                        program: crate::db::enum_from_sql(4, &program)?,
                        status: crate::db::enum_from_sql(5, &status)?,
                        monthly_rate: row.get(6)?,
                        batch_id: row.get(7)?,
                        batch_name: row.get(8)?,
                        email: row.get(9)?,
                        phone: row.get(10)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_student(
        &self,
        profile_id: &str,
        update: &StudentUpdate,
        today: NaiveDate,
    ) -> Result<StudentDetail> {
        let profile = get_profile(self.conn, profile_id)?;

        let mut v = Validator::new();
        let first_name = update
            .first_name
            .as_deref()
            .and_then(|n| v.check(require_name("first_name", n)));
        let last_name = update
            .last_name
            .as_deref()
            .and_then(|n| v.check(require_name("last_name", n)));
        let email = update.email.as_deref().and_then(|e| v.check(normalize_email(e)));
        let phone = update.phone.as_deref().and_then(|p| v.check(normalize_phone(p)));
        if let Some(dob) = update.date_of_birth {
            v.check(validate_date_of_birth(dob, today));
        }
        if let Some(rate) = update.monthly_rate {
            v.check(validate_amount("monthly_rate", rate));
        }
        v.finish()?;

        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE persons
             SET first_name = COALESCE(?1, first_name),
                 last_name = COALESCE(?2, last_name),
                 date_of_birth = COALESCE(?3, date_of_birth),
                 updated_at = ?4
             WHERE id = ?5",
            params![
                first_name,
                last_name,
                update.date_of_birth.map(date_to_sql),
                now,
                profile.person_id
            ],
        )?;
        if let Some(email) = &email {
            add_contact(&tx, &profile.person_id, ContactType::Email, email, true)?;
        }
        if let Some(phone) = &phone {
            add_contact(&tx, &profile.person_id, ContactType::Phone, phone, true)?;
        }
        if let Some(rate) = update.monthly_rate {
            tx.execute(
                "UPDATE program_profiles SET monthly_rate = ?1, updated_at = ?2 WHERE id = ?3",
                params![rate, now, profile_id],
            )?;
        }
        record_event(
            &tx,
            "student_updated",
            "program_profile",
            profile_id,
            serde_json::to_value(update)?,
            "admin",
        )?;
        tx.commit()?;

        self.get_student(profile_id)
    }

    /// Manual status change by an administrator
    pub fn set_status(
        &self,
        profile_id: &str,
        status: EnrollmentStatus,
        today: NaiveDate,
        reason: &str,
    ) -> Result<Option<StatusChange>> {
        let tx = self.conn.unchecked_transaction()?;
        let change = apply_profile_status(&tx, profile_id, status, today, reason, "admin")?;
        tx.commit()?;
        Ok(change)
    }

    pub fn withdraw(
        &self,
        profile_id: &str,
        today: NaiveDate,
        reason: &str,
    ) -> Result<Option<StatusChange>> {
        self.set_status(profile_id, EnrollmentStatus::Withdrawn, today, reason)
    }

    /// Delete a profile. The person goes too when nothing else refers to it.
    /// Returns true when the person was deleted.
    pub fn delete_student(&self, profile_id: &str) -> Result<bool> {
        let profile = get_profile(self.conn, profile_id)?;
        let tx = self.conn.unchecked_transaction()?;

        tx.execute("DELETE FROM program_profiles WHERE id = ?1", [profile_id])?;

        let still_referenced: i64 = tx.query_row(
            "SELECT (SELECT COUNT(*) FROM program_profiles WHERE person_id = ?1)
                  + (SELECT COUNT(*) FROM guardian_relationships WHERE guardian_id = ?1)
                  + (SELECT COUNT(*) FROM billing_accounts WHERE person_id = ?1)",
            [&profile.person_id],
            |row| row.get(0),
        )?;
        let person_deleted = still_referenced == 0;
        if person_deleted {
            tx.execute("DELETE FROM persons WHERE id = ?1", [&profile.person_id])?;
        }

        record_event(
            &tx,
            "student_deleted",
            "program_profile",
            profile_id,
            serde_json::json!({ "person_id": profile.person_id, "person_deleted": person_deleted }),
            "admin",
        )?;
        tx.commit()?;

        info!(profile_id, person_deleted, "Student deleted");
        Ok(person_deleted)
    }

    pub fn export_students(&self, format: ExportFormat) -> Result<String> {
        let students = self.list_students(&StudentFilter::default())?;
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&students)?),
            ExportFormat::Csv => {
                let mut writer = csv::Writer::from_writer(Vec::new());
                for student in &students {
                    writer.serialize(student)?;
                }
                let bytes = writer
                    .into_inner()
                    .map_err(|e| AdminError::Csv(csv::Error::from(e.into_error())))?;
                String::from_utf8(bytes)
                    .map_err(|e| AdminError::Internal(format!("export is not UTF-8: {}", e)))
            }
        }
    }
}
