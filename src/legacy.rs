// 🚚 Legacy migration - single-table `students` → normalized model
//
// Each unmigrated legacy row becomes Person + contacts + ProgramProfile +
// Enrollment, plus BillingAccount / Subscription / BillingAssignment when the
// row carries provider ids. The row is stamped with `migrated_person_id`, so
// running the migration again only picks up rows it has not handled yet.

use chrono::{NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::billing::{BillingService, SubscriptionUpsert};
use crate::enrollment::{insert_enrollment, insert_profile, profiles_for_person};
use crate::entities::{
    ContactType, Enrollment, EnrollmentStatus, Person, Program, ProgramProfile, SubscriptionStatus,
};
use crate::error::Result;
use crate::students::{add_contact, batch_exists, find_person_by_contact_and_name, insert_person};
use crate::validation::{normalize_email, normalize_phone, split_full_name};

#[derive(Debug, Clone)]
struct LegacyStudent {
    id: String,
    name: String,
    email: Option<String>,
    phone: Option<String>,
    date_of_birth: Option<String>,
    program: String,
    status: String,
    batch_id: Option<String>,
    monthly_rate: i64,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    subscription_status: Option<String>,
    created_at: Option<String>,
}

impl LegacyStudent {
    const COLUMNS: &'static str = "id, name, email, phone, date_of_birth, program, status, batch_id, monthly_rate,
         stripe_customer_id, stripe_subscription_id, subscription_status, created_at";

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(LegacyStudent {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            phone: row.get(3)?,
            date_of_birth: row.get(4)?,
            program: row.get(5)?,
            status: row.get(6)?,
            batch_id: row.get(7)?,
            monthly_rate: row.get(8)?,
            stripe_customer_id: row.get(9)?,
            stripe_subscription_id: row.get(10)?,
            subscription_status: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    /// Day the legacy row was created (`CURRENT_TIMESTAMP` or RFC3339 text)
    fn created_on(&self) -> Option<NaiveDate> {
        let raw = self.created_at.as_deref()?;
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .map(|dt| dt.date())
            .ok()
            .or_else(|| chrono::DateTime::parse_from_rfc3339(raw).map(|dt| dt.date_naive()).ok())
            .or_else(|| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
    }
}

/// Legacy free-text status → profile status
pub fn map_legacy_status(raw: &str) -> Option<EnrollmentStatus> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "registered" | "pending" | "new" => Some(EnrollmentStatus::Registered),
        "enrolled" | "active" => Some(EnrollmentStatus::Enrolled),
        "withdrawn" | "inactive" | "dropped" => Some(EnrollmentStatus::Withdrawn),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRow {
    pub legacy_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub migrated: usize,
    pub skipped: Vec<SkippedRow>,
    /// Data dropped from rows that were still migrated (bad email, unknown batch ...)
    pub warnings: Vec<String>,
}

/// Everything a row needs, checked before anything is written
struct PlannedRow {
    first_name: String,
    last_name: String,
    program: Program,
    status: EnrollmentStatus,
    subscription_status: Option<SubscriptionStatus>,
}

fn plan_row(row: &LegacyStudent) -> std::result::Result<PlannedRow, String> {
    let (first_name, last_name) = split_full_name(&row.name);
    if first_name.is_empty() {
        return Err("empty name".to_string());
    }
    let program = row
        .program
        .parse::<Program>()
        .map_err(|_| format!("unknown program {:?}", row.program))?;
    let status = map_legacy_status(&row.status)
        .ok_or_else(|| format!("unknown status {:?}", row.status))?;
    let subscription_status = match row.subscription_status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            raw.parse::<SubscriptionStatus>()
                .map_err(|_| format!("unknown subscription status {:?}", raw))?,
        ),
        None => None,
    };
    Ok(PlannedRow {
        first_name,
        last_name,
        program,
        status,
        subscription_status,
    })
}

/// State carried across the rows of one migration run
struct MigrationRun {
    today: NaiveDate,
    warnings: Vec<String>,
    /// Subscriptions inserted by this run; only these accumulate sibling rates
    created_subscriptions: HashSet<String>,
}

/// Migrate every legacy row that has no `migrated_person_id` yet
pub fn migrate_legacy_students(conn: &Connection, today: NaiveDate) -> Result<MigrationReport> {
    let sql = format!(
        "SELECT {} FROM students WHERE migrated_person_id IS NULL ORDER BY created_at, id",
        LegacyStudent::COLUMNS
    );
    let rows = {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], LegacyStudent::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    let mut report = MigrationReport::default();
    if rows.is_empty() {
        return Ok(report);
    }

    let mut run = MigrationRun {
        today,
        warnings: Vec::new(),
        created_subscriptions: HashSet::new(),
    };
    let tx = conn.unchecked_transaction()?;
    for row in &rows {
        let plan = match plan_row(row) {
            Ok(plan) => plan,
            Err(reason) => {
                warn!(legacy_id = %row.id, %reason, "Legacy row skipped");
                report.skipped.push(SkippedRow {
                    legacy_id: row.id.clone(),
                    reason,
                });
                continue;
            }
        };
        match migrate_row(&tx, row, &plan, &mut run)? {
            Some(person_id) => {
                tx.execute(
                    "UPDATE students SET migrated_person_id = ?1 WHERE id = ?2",
                    params![person_id, row.id],
                )?;
                report.migrated += 1;
            }
            None => report.skipped.push(SkippedRow {
                legacy_id: row.id.clone(),
                reason: format!("already has a {} profile", plan.program),
            }),
        }
    }
    tx.commit()?;
    report.warnings = run.warnings;

    info!(
        migrated = report.migrated,
        skipped = report.skipped.len(),
        warnings = report.warnings.len(),
        "Legacy migration finished"
    );
    Ok(report)
}

/// Returns the person id, or None when the person already has this program
fn migrate_row(
    conn: &Connection,
    row: &LegacyStudent,
    plan: &PlannedRow,
    run: &mut MigrationRun,
) -> Result<Option<String>> {
    let today = run.today;
    let email = match row.email.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(raw) => match normalize_email(raw) {
            Ok(email) => Some(email),
            Err(_) => {
                run.warnings.push(format!("{}: dropped invalid email {:?}", row.id, raw));
                None
            }
        },
        None => None,
    };
    let phone = match row.phone.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(raw) => match normalize_phone(raw) {
            Ok(phone) => Some(phone),
            Err(_) => {
                run.warnings.push(format!("{}: dropped invalid phone {:?}", row.id, raw));
                None
            }
        },
        None => None,
    };
    let date_of_birth = row
        .date_of_birth
        .as_deref()
        .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok());

    // Siblings often share a parent's email, so only the same name counts as the same person
    let existing = match &email {
        Some(email) => find_person_by_contact_and_name(
            conn,
            ContactType::Email,
            email,
            &plan.first_name,
            &plan.last_name,
        )?,
        None => None,
    };
    let person = match existing {
        Some(person) => {
            if profiles_for_person(conn, &person.id)?.iter().any(|p| p.program == plan.program) {
                return Ok(None);
            }
            person
        }
        None => {
            let person = Person::new(
                plan.first_name.clone(),
                plan.last_name.clone(),
                date_of_birth,
            );
            insert_person(conn, &person)?;
            person
        }
    };
    if let Some(email) = &email {
        add_contact(conn, &person.id, ContactType::Email, email, true)?;
    }
    if let Some(phone) = &phone {
        add_contact(conn, &person.id, ContactType::Phone, phone, true)?;
    }

    let mut profile = ProgramProfile::new(&person.id, plan.program, row.monthly_rate.max(0));
    profile.status = plan.status;
    insert_profile(conn, &profile)?;

    let batch_id = match &row.batch_id {
        Some(id) if batch_exists(conn, id)? => Some(id.clone()),
        Some(id) => {
            run.warnings.push(format!("{}: unknown batch {}", row.id, id));
            None
        }
        None => None,
    };
    let start = row.created_on().unwrap_or(today).min(today);
    let mut enrollment = Enrollment::open(&profile.id, batch_id, plan.status, start);
    if plan.status == EnrollmentStatus::Withdrawn {
        enrollment.end_date = Some(today);
        enrollment.end_reason = Some("withdrawn before migration".to_string());
    }
    insert_enrollment(conn, &enrollment)?;

    migrate_billing(conn, row, plan, &person.id, &profile.id, run)?;
    Ok(Some(person.id))
}

/// A subscription that already existed before this run belongs to the provider
/// sync: its status and amount are never touched, the row only gets an
/// assignment when the subscription has room for its rate.
fn migrate_billing(
    conn: &Connection,
    row: &LegacyStudent,
    plan: &PlannedRow,
    person_id: &str,
    profile_id: &str,
    run: &mut MigrationRun,
) -> Result<()> {
    let Some(customer) = row.stripe_customer_id.as_deref().filter(|s| !s.is_empty()) else {
        return Ok(());
    };
    let billing = BillingService::new(conn);
    let account = billing.upsert_account(plan.program, customer, Some(person_id))?;

    let Some(stripe_id) = row.stripe_subscription_id.as_deref().filter(|s| !s.is_empty()) else {
        return Ok(());
    };
    let Some(status) = plan.subscription_status else {
        run.warnings.push(format!(
            "{}: subscription {} has no status, billing not migrated",
            row.id, stripe_id
        ));
        return Ok(());
    };

    let rate = row.monthly_rate.max(0);
    let existing = billing.find_subscription(stripe_id)?;
    let subscription = match existing {
        Some(existing) if !run.created_subscriptions.contains(stripe_id) => {
            let assigned: i64 = billing
                .active_assignments(&existing.id)?
                .iter()
                .map(|a| a.amount)
                .sum();
            if assigned + rate > existing.amount {
                run.warnings.push(format!(
                    "{}: subscription {} is already fully assigned, billing not migrated",
                    row.id, stripe_id
                ));
                return Ok(());
            }
            existing
        }
        existing => {
            // Siblings on one subscription: the amount is the sum of their rates
            let amount = existing.map(|s| s.amount).unwrap_or(0) + rate;
            let outcome = billing.upsert_subscription(
                &SubscriptionUpsert {
                    billing_account_id: account.id,
                    stripe_subscription_id: stripe_id.to_string(),
                    status,
                    amount,
                    currency: "usd".to_string(),
                    current_period_start: None,
                    current_period_end: None,
                },
                None,
            )?;
            run.created_subscriptions.insert(stripe_id.to_string());
            outcome.subscription
        }
    };
    billing.create_assignment(&subscription.id, profile_id, rate, run.today)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrollment::{open_enrollment, test_support::fresh_db};
    use crate::students::{StudentFilter, StudentService};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 9, 1).unwrap()
    }

    fn legacy(
        conn: &Connection,
        id: &str,
        name: &str,
        email: &str,
        program: &str,
        status: &str,
        rate: i64,
    ) {
        conn.execute(
            "INSERT INTO students (id, name, email, phone, program, status, monthly_rate, created_at)
             VALUES (?1, ?2, ?3, '612-555-0100', ?4, ?5, ?6, '2025-01-15 10:00:00')",
            params![id, name, email, program, status, rate],
        )
        .unwrap();
    }

    fn with_billing(conn: &Connection, id: &str, customer: &str, subscription: &str, status: &str) {
        conn.execute(
            "UPDATE students
             SET stripe_customer_id = ?2, stripe_subscription_id = ?3, subscription_status = ?4
             WHERE id = ?1",
            params![id, customer, subscription, status],
        )
        .unwrap();
    }

    #[test]
    fn test_map_legacy_status() {
        assert_eq!(map_legacy_status("Enrolled"), Some(EnrollmentStatus::Enrolled));
        assert_eq!(map_legacy_status("registered"), Some(EnrollmentStatus::Registered));
        assert_eq!(map_legacy_status("withdrawn"), Some(EnrollmentStatus::Withdrawn));
        assert_eq!(map_legacy_status("graduated"), None);
    }

    #[test]
    fn test_migrates_rows_and_billing() {
        let conn = fresh_db();
        legacy(&conn, "s1", "Abdi Warsame", "abdi@example.com", "MAHAD", "enrolled", 15000);
        with_billing(&conn, "s1", "cus_abdi", "sub_abdi", "active");
        legacy(&conn, "s2", "Sagal Ali", "family@example.com", "dugsi", "enrolled", 8000);
        with_billing(&conn, "s2", "cus_family", "sub_family", "active");
        legacy(&conn, "s3", "Samatar Ali", "family@example.com", "DUGSI", "enrolled", 8000);
        with_billing(&conn, "s3", "cus_family", "sub_family", "active");
        legacy(&conn, "s4", "Broken Row", "x@example.com", "MAHAD", "graduated", 0);

        let report = migrate_legacy_students(&conn, today()).unwrap();
        assert_eq!(report.migrated, 3);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].legacy_id, "s4");

        // Siblings sharing an email stay separate persons
        let students = StudentService::new(&conn).list_students(&StudentFilter::default()).unwrap();
        assert_eq!(students.len(), 3);
        let persons: std::collections::BTreeSet<_> =
            students.iter().map(|s| s.person_id.clone()).collect();
        assert_eq!(persons.len(), 3);
        assert!(students.iter().all(|s| s.status == EnrollmentStatus::Enrolled));

        let billing = BillingService::new(&conn);
        let family = billing.find_subscription("sub_family").unwrap().unwrap();
        assert_eq!(family.amount, 16000);
        assert_eq!(billing.active_assignments(&family.id).unwrap().len(), 2);

        let sagal = students.iter().find(|s| s.first_name == "Sagal").unwrap();
        let enrollment = open_enrollment(&conn, &sagal.profile_id).unwrap().unwrap();
        assert_eq!(enrollment.start_date, NaiveDate::from_ymd_opt(2025, 1, 15).unwrap());
    }

    #[test]
    fn test_second_run_is_a_noop() {
        let conn = fresh_db();
        legacy(&conn, "s1", "Abdi Warsame", "abdi@example.com", "MAHAD", "registered", 15000);

        assert_eq!(migrate_legacy_students(&conn, today()).unwrap().migrated, 1);
        let again = migrate_legacy_students(&conn, today()).unwrap();
        assert_eq!(again.migrated, 0);
        assert!(again.skipped.is_empty());

        let stamped: Option<String> = conn
            .query_row(
                "SELECT migrated_person_id FROM students WHERE id = 's1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(stamped.is_some());
    }

    #[test]
    fn test_withdrawn_row_gets_closed_enrollment_and_bad_email_is_dropped() {
        let conn = fresh_db();
        legacy(&conn, "s1", "Faduma Noor", "not-an-email", "MAHAD", "withdrawn", 0);

        let report = migrate_legacy_students(&conn, today()).unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(report.warnings.len(), 1);

        let students = StudentService::new(&conn).list_students(&StudentFilter::default()).unwrap();
        assert_eq!(students[0].status, EnrollmentStatus::Withdrawn);
        assert!(students[0].email.is_none());
        assert!(open_enrollment(&conn, &students[0].profile_id).unwrap().is_none());
    }

    #[test]
    fn test_existing_subscription_is_not_overwritten() {
        let conn = fresh_db();
        let billing = BillingService::new(&conn);
        let account = billing.upsert_account(Program::Dugsi, "cus_family", None).unwrap();
        billing
            .upsert_subscription(
                &SubscriptionUpsert {
                    billing_account_id: account.id,
                    stripe_subscription_id: "sub_family".to_string(),
                    status: SubscriptionStatus::Canceled,
                    amount: 20000,
                    currency: "usd".to_string(),
                    current_period_start: None,
                    current_period_end: None,
                },
                Some("evt_synced"),
            )
            .unwrap();

        legacy(&conn, "s1", "Hodan Cali", "family@example.com", "DUGSI", "enrolled", 8000);
        with_billing(&conn, "s1", "cus_family", "sub_family", "active");
        legacy(&conn, "s2", "Nasra Cali", "family@example.com", "DUGSI", "enrolled", 15000);
        with_billing(&conn, "s2", "cus_family", "sub_family", "active");

        let report = migrate_legacy_students(&conn, today()).unwrap();
        assert_eq!(report.migrated, 2);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("s2:"));

        let sub = billing.find_subscription("sub_family").unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert_eq!(sub.amount, 20000);
        let assignments = billing.active_assignments(&sub.id).unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].amount, 8000);
    }
}
