// 📚 Profile + enrollment persistence
//
// Applies a planned `StatusChange` (see status_mapping) to the database:
// profile status column, open enrollment row, and an audit event.
// Callers run these inside their own transaction.

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::db::{date_to_sql, record_event};
use crate::entities::{Enrollment, EnrollmentStatus, ProgramProfile};
use crate::error::{AdminError, Result};
use crate::status_mapping::{plan_transition, EnrollmentTransition, StatusChange};

// ============================================================================
// PROFILES
// ============================================================================

pub fn find_profile(conn: &Connection, profile_id: &str) -> Result<Option<ProgramProfile>> {
    let sql = format!(
        "SELECT {} FROM program_profiles WHERE id = ?1",
        ProgramProfile::COLUMNS
    );
    Ok(conn
        .query_row(&sql, [profile_id], ProgramProfile::from_row)
        .optional()?)
}

pub fn get_profile(conn: &Connection, profile_id: &str) -> Result<ProgramProfile> {
    find_profile(conn, profile_id)?.ok_or_else(|| AdminError::not_found("Profile", profile_id))
}

pub fn profiles_for_person(conn: &Connection, person_id: &str) -> Result<Vec<ProgramProfile>> {
    let sql = format!(
        "SELECT {} FROM program_profiles WHERE person_id = ?1 ORDER BY program",
        ProgramProfile::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let profiles = stmt
        .query_map([person_id], ProgramProfile::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(profiles)
}

pub fn insert_profile(conn: &Connection, profile: &ProgramProfile) -> Result<()> {
    conn.execute(
        "INSERT INTO program_profiles (id, person_id, program, status, monthly_rate, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            profile.id,
            profile.person_id,
            profile.program.as_str(),
            profile.status.as_str(),
            profile.monthly_rate,
            profile.created_at.to_rfc3339(),
            profile.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn set_profile_status(conn: &Connection, profile_id: &str, status: EnrollmentStatus) -> Result<()> {
    conn.execute(
        "UPDATE program_profiles SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), Utc::now().to_rfc3339(), profile_id],
    )?;
    Ok(())
}

// ============================================================================
// ENROLLMENTS
// ============================================================================

pub fn open_enrollment(conn: &Connection, profile_id: &str) -> Result<Option<Enrollment>> {
    let sql = format!(
        "SELECT {} FROM enrollments WHERE program_profile_id = ?1 AND end_date IS NULL",
        Enrollment::COLUMNS
    );
    Ok(conn
        .query_row(&sql, [profile_id], Enrollment::from_row)
        .optional()?)
}

/// All enrollments of a profile, oldest first
pub fn enrollment_history(conn: &Connection, profile_id: &str) -> Result<Vec<Enrollment>> {
    let sql = format!(
        "SELECT {} FROM enrollments WHERE program_profile_id = ?1
         ORDER BY start_date, end_date IS NULL, end_date",
        Enrollment::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([profile_id], Enrollment::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn insert_enrollment(conn: &Connection, enrollment: &Enrollment) -> Result<()> {
    conn.execute(
        "INSERT INTO enrollments (id, program_profile_id, batch_id, status, start_date, end_date, end_reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            enrollment.id,
            enrollment.program_profile_id,
            enrollment.batch_id,
            enrollment.status.as_str(),
            date_to_sql(enrollment.start_date),
            enrollment.end_date.map(date_to_sql),
            enrollment.end_reason,
        ],
    )?;
    Ok(())
}

pub fn close_enrollment(
    conn: &Connection,
    enrollment_id: &str,
    on: NaiveDate,
    reason: &str,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE enrollments SET end_date = ?1, end_reason = ?2 WHERE id = ?3 AND end_date IS NULL",
        params![date_to_sql(on), reason, enrollment_id],
    )?;
    if updated == 0 {
        return Err(AdminError::Conflict(format!(
            "Enrollment {} is not open",
            enrollment_id
        )));
    }
    Ok(())
}

fn update_enrollment_status(
    conn: &Connection,
    enrollment_id: &str,
    status: EnrollmentStatus,
) -> Result<()> {
    conn.execute(
        "UPDATE enrollments SET status = ?1 WHERE id = ?2",
        params![status.as_str(), enrollment_id],
    )?;
    Ok(())
}

/// Batch of the most recent enrollment, used when a withdrawn student comes back
fn last_batch_id(conn: &Connection, profile_id: &str) -> Result<Option<String>> {
    let batch: Option<Option<String>> = conn
        .query_row(
            "SELECT batch_id FROM enrollments WHERE program_profile_id = ?1
             ORDER BY start_date DESC, end_date IS NULL DESC, end_date DESC LIMIT 1",
            [profile_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(batch.flatten())
}

// ============================================================================
// APPLYING A STATUS
// ============================================================================

/// Move a profile to `target`, keeping its enrollment rows consistent.
///
/// Returns `None` when nothing had to change.
pub fn apply_profile_status(
    conn: &Connection,
    profile_id: &str,
    target: EnrollmentStatus,
    on: NaiveDate,
    reason: &str,
    actor: &str,
) -> Result<Option<StatusChange>> {
    let profile = get_profile(conn, profile_id)?;
    let open = open_enrollment(conn, profile_id)?;
    let change = plan_transition(profile.status, open.as_ref().map(|e| e.status), target);

    if change.is_noop() {
        return Ok(None);
    }

    match (change.transition, open) {
        (EnrollmentTransition::UpdateOpen(status), Some(open)) => {
            update_enrollment_status(conn, &open.id, status)?;
        }
        (EnrollmentTransition::CloseOpen, Some(open)) => {
            close_enrollment(conn, &open.id, on, reason)?;
        }
        (EnrollmentTransition::OpenNew(status), _) => {
            let batch_id = last_batch_id(conn, profile_id)?;
            insert_enrollment(conn, &Enrollment::open(profile_id, batch_id, status, on))?;
        }
        _ => {}
    }

    if change.from != change.to {
        set_profile_status(conn, profile_id, change.to)?;
    }

    record_event(
        conn,
        "profile_status_changed",
        "program_profile",
        profile_id,
        serde_json::json!({
            "from": change.from,
            "to": change.to,
            "transition": change.transition,
            "reason": reason,
        }),
        actor,
    )?;

    info!(
        profile_id,
        from = %change.from,
        to = %change.to,
        reason,
        "Profile status changed"
    );

    Ok(Some(change))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::db::setup_database;
    use crate::entities::{Person, Program};

    pub fn fresh_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    pub fn insert_person(conn: &Connection, first: &str, last: &str) -> Person {
        let person = Person::new(first.to_string(), last.to_string(), None);
        conn.execute(
            "INSERT INTO persons (id, first_name, last_name, date_of_birth, created_at, updated_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?4)",
            params![person.id, person.first_name, person.last_name, person.created_at.to_rfc3339()],
        )
        .unwrap();
        person
    }

    /// Person + profile + open enrollment at `status`
    pub fn insert_student(
        conn: &Connection,
        first: &str,
        program: Program,
        status: EnrollmentStatus,
    ) -> ProgramProfile {
        let person = insert_person(conn, first, "Test");
        let mut profile = ProgramProfile::new(&person.id, program, 10000);
        profile.status = status;
        insert_profile(conn, &profile).unwrap();
        if status.is_active() {
            let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
            insert_enrollment(conn, &Enrollment::open(&profile.id, None, status, start)).unwrap();
        }
        profile
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::db::get_events_for_entity;
    use crate::entities::Program;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    fn apply(
        conn: &Connection,
        profile_id: &str,
        target: EnrollmentStatus,
        on: NaiveDate,
        reason: &str,
    ) -> Result<Option<StatusChange>> {
        apply_profile_status(conn, profile_id, target, on, reason, "tester")
    }

    #[test]
    fn test_enroll_updates_profile_and_open_enrollment() {
        let conn = fresh_db();
        let profile = insert_student(&conn, "Ayaan", Program::Mahad, EnrollmentStatus::Registered);

        let change = apply(&conn, &profile.id, EnrollmentStatus::Enrolled, day(1), "test")
            .unwrap()
            .unwrap();
        assert_eq!(change.transition, EnrollmentTransition::UpdateOpen(EnrollmentStatus::Enrolled));

        assert_eq!(get_profile(&conn, &profile.id).unwrap().status, EnrollmentStatus::Enrolled);
        let open = open_enrollment(&conn, &profile.id).unwrap().unwrap();
        assert_eq!(open.status, EnrollmentStatus::Enrolled);

        let events = get_events_for_entity(&conn, "program_profile", &profile.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["to"], "ENROLLED");
    }

    #[test]
    fn test_withdraw_closes_enrollment_then_reenroll_opens_new_one() {
        let conn = fresh_db();
        let profile = insert_student(&conn, "Sahra", Program::Dugsi, EnrollmentStatus::Enrolled);

        apply(&conn, &profile.id, EnrollmentStatus::Withdrawn, day(10), "canceled").unwrap();
        assert!(open_enrollment(&conn, &profile.id).unwrap().is_none());
        assert_eq!(get_profile(&conn, &profile.id).unwrap().status, EnrollmentStatus::Withdrawn);

        apply(&conn, &profile.id, EnrollmentStatus::Enrolled, day(20), "reactivated").unwrap();
        let history = enrollment_history(&conn, &profile.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].end_date, Some(day(10)));
        assert_eq!(history[0].end_reason.as_deref(), Some("canceled"));
        assert!(history[1].is_open());
        assert_eq!(history[1].start_date, day(20));
    }

    #[test]
    fn test_noop_writes_nothing() {
        let conn = fresh_db();
        let profile = insert_student(&conn, "Nuur", Program::Mahad, EnrollmentStatus::Enrolled);

        let change = apply(&conn, &profile.id, EnrollmentStatus::Enrolled, day(1), "test").unwrap();
        assert!(change.is_none());
        assert!(get_events_for_entity(&conn, "program_profile", &profile.id).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_profile() {
        let conn = fresh_db();
        let err = apply(&conn, "missing", EnrollmentStatus::Enrolled, day(1), "t").unwrap_err();
        assert!(matches!(err, AdminError::NotFound(_)));
    }

    #[test]
    fn test_only_one_open_enrollment_per_profile() {
        let conn = fresh_db();
        let profile = insert_student(&conn, "Ilhan", Program::Mahad, EnrollmentStatus::Registered);
        let second = Enrollment::open(&profile.id, None, EnrollmentStatus::Registered, day(2));
        assert!(insert_enrollment(&conn, &second).unwrap_err().is_constraint_violation());
    }
}
