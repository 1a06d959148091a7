// 🔔 Payment provider webhooks - signature, idempotency, dispatch
//
// Pipeline for one delivery:
//   1. verify `Stripe-Signature` (t=<unix>,v1=<hex hmac-sha256 of "{t}.{payload}">)
//   2. BEGIN; insert (event id, program) into webhook_events
//      unique violation → duplicate delivery, acknowledge and stop
//   3. look up / upsert billing rows, map subscription status onto profiles
//   4. history + audit events; COMMIT
//
// Any error rolls the whole transaction back, idempotency row included, so a
// retried delivery is processed from scratch.

use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::billing::{BillingService, SubscriptionUpsert};
use crate::config::AppConfig;
use crate::db::{new_id, record_event};
use crate::enrollment::{apply_profile_status, find_profile};
use crate::entities::{ContactType, Program, SubscriptionStatus};
use crate::error::{AdminError, Result};
use crate::status_mapping::map_subscription_status;
use crate::students::{find_person, find_person_by_contact};
use crate::validation::normalize_email;

type HmacSha256 = Hmac<Sha256>;

// ============================================================================
// SIGNATURE
// ============================================================================

/// Hex HMAC-SHA256 of "{timestamp}.{payload}"
pub fn sign_payload(secret: &str, timestamp: i64, payload: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AdminError::Config(format!("webhook secret: {}", e)))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a signature header against the payload. Returns the signed timestamp.
///
/// Several `v1` entries may be present (secret rotation); any one matching is
/// enough. Comparison is constant-time (`Mac::verify_slice`).
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<i64> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse().map_err(|_| {
                    AdminError::InvalidSignature(format!("malformed timestamp {:?}", value))
                })?);
            }
            Some(("v1", value)) => candidates.push(value),
            Some(_) => {}
            None => return Err(AdminError::InvalidSignature("malformed header".to_string())),
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| AdminError::InvalidSignature("missing timestamp".to_string()))?;
    if candidates.is_empty() {
        return Err(AdminError::InvalidSignature("missing v1 signature".to_string()));
    }
    if now.abs_diff(timestamp) > tolerance_secs.unsigned_abs() {
        return Err(AdminError::InvalidSignature(format!(
            "timestamp {} outside tolerance of {}s",
            timestamp, tolerance_secs
        )));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AdminError::Config(format!("webhook secret: {}", e)))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());

    let matched = candidates.iter().any(|candidate| match hex::decode(candidate) {
        Ok(bytes) => mac.clone().verify_slice(&bytes).is_ok(),
        Err(_) => false,
    });
    if matched {
        Ok(timestamp)
    } else {
        Err(AdminError::InvalidSignature("no matching v1 signature".to_string()))
    }
}

// ============================================================================
// EVENT
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: Option<i64>,
    data: RawData,
}

#[derive(Debug, Deserialize)]
struct RawData {
    object: Value,
}

/// The parts of a provider event we use
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub created: DateTime<Utc>,
    pub object: Value,
}

impl WebhookEvent {
    pub fn parse(payload: &str) -> Result<Self> {
        let raw: RawEvent = serde_json::from_str(payload)?;
        Ok(WebhookEvent {
            id: raw.id,
            event_type: raw.event_type,
            created: raw
                .created
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .unwrap_or_else(Utc::now),
            object: raw.data.object,
        })
    }

    /// Day the event happened; enrollment changes are dated with it
    pub fn date(&self) -> NaiveDate {
        self.created.date_naive()
    }
}

fn str_at<'v>(value: &'v Value, path: &[&str]) -> Option<&'v str> {
    path.iter()
        .try_fold(value, |v, key| v.get(key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn i64_at(value: &Value, path: &[&str]) -> Option<i64> {
    path.iter().try_fold(value, |v, key| v.get(key)).and_then(Value::as_i64)
}

fn time_at(value: &Value, path: &[&str]) -> Option<DateTime<Utc>> {
    i64_at(value, path).and_then(|secs| DateTime::from_timestamp(secs, 0))
}

fn require_str<'v>(value: &'v Value, path: &[&str]) -> Result<&'v str> {
    str_at(value, path)
        .ok_or_else(|| AdminError::validation(format!("webhook: missing {}", path.join("."))))
}

/// `customer` is either an id or an expanded object
fn customer_id(object: &Value) -> Option<&str> {
    str_at(object, &["customer"]).or_else(|| str_at(object, &["customer", "id"]))
}

fn first_item(object: &Value) -> Option<&Value> {
    object.get("items")?.get("data")?.as_array()?.first()
}

/// Sum of item unit amounts × quantity, else the legacy `plan.amount`
fn subscription_amount(object: &Value) -> i64 {
    let items = object
        .get("items")
        .and_then(|i| i.get("data"))
        .and_then(Value::as_array);
    match items {
        Some(items) if !items.is_empty() => items
            .iter()
            .map(|item| {
                let unit = i64_at(item, &["price", "unit_amount"])
                    .or_else(|| i64_at(item, &["plan", "amount"]))
                    .unwrap_or(0);
                unit * i64_at(item, &["quantity"]).unwrap_or(1)
            })
            .sum(),
        _ => {
            i64_at(object, &["plan", "amount"]).unwrap_or(0)
                * i64_at(object, &["quantity"]).unwrap_or(1)
        }
    }
}

/// Period bounds moved from the subscription onto its items in newer API versions
fn period_bound(object: &Value, key: &str) -> Option<DateTime<Utc>> {
    time_at(object, &[key]).or_else(|| first_item(object).and_then(|item| time_at(item, &[key])))
}

/// `metadata.profileIds`, comma separated (provider metadata values are strings)
/// Repeated ids are kept once, in first-seen order
fn metadata_profile_ids(object: &Value) -> Vec<String> {
    let mut seen = HashSet::new();
    str_at(object, &["metadata", "profileIds"])
        .map(|ids| {
            ids.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty() && seen.insert(*id))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_status(raw: &str) -> Result<SubscriptionStatus> {
    raw.parse()
        .map_err(|_| AdminError::UnknownStatus(raw.to_string()))
}

// ============================================================================
// PROCESSOR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed { event_id: String, event_type: String },
    Duplicate { event_id: String },
    Ignored { event_id: String, event_type: String },
}

pub struct WebhookProcessor {
    program: Program,
    secret: String,
    tolerance_secs: i64,
}

impl WebhookProcessor {
    pub fn new(program: Program, secret: impl Into<String>, tolerance_secs: i64) -> Self {
        WebhookProcessor {
            program,
            secret: secret.into(),
            tolerance_secs,
        }
    }

    pub fn from_config(config: &AppConfig, program: Program) -> Result<Self> {
        let secret = config
            .webhook_secret(program)
            .ok_or_else(|| {
                AdminError::Config(format!("no webhook secret configured for {}", program))
            })?;
        Ok(Self::new(program, secret, config.webhook_tolerance_secs_or_default()))
    }

    /// Verify then process one delivery
    pub fn handle(
        &self,
        conn: &Connection,
        payload: &str,
        signature: Option<&str>,
    ) -> Result<WebhookOutcome> {
        let header = signature.ok_or_else(|| {
            AdminError::InvalidSignature("missing Stripe-Signature header".to_string())
        })?;
        let now = Utc::now().timestamp();
        let verified = verify_signature(payload, header, &self.secret, self.tolerance_secs, now);
        if let Err(err) = verified {
            warn!(program = %self.program, error = %err, "Webhook rejected");
            return Err(err);
        }
        self.process(conn, payload)
    }

    /// Process an already-verified payload inside one transaction
    pub fn process(&self, conn: &Connection, payload: &str) -> Result<WebhookOutcome> {
        let event = WebhookEvent::parse(payload)?;
        let tx = conn.unchecked_transaction()?;

        let claimed = tx.execute(
            "INSERT INTO webhook_events (id, event_id, source, event_type, payload, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new_id(),
                event.id,
                self.program.as_str(),
                event.event_type,
                payload,
                Utc::now().to_rfc3339(),
            ],
        );
        if let Err(e) = claimed {
            let err = AdminError::from(e);
            if err.is_constraint_violation() {
                info!(event_id = %event.id, program = %self.program, "Duplicate webhook delivery");
                return Ok(WebhookOutcome::Duplicate { event_id: event.id });
            }
            return Err(err);
        }

        let handled = match event.event_type.as_str() {
            "customer.subscription.created" | "customer.subscription.updated" => {
                self.sync_subscription(&tx, &event, None, true)?;
                true
            }
            "customer.subscription.deleted" => {
                self.subscription_deleted(&tx, &event)?;
                true
            }
            "invoice.paid" | "invoice.payment_succeeded" => {
                self.invoice_paid(&tx, &event)?;
                true
            }
            "invoice.payment_failed" => {
                self.invoice_failed(&tx, &event)?;
                true
            }
            "checkout.session.completed" => {
                self.checkout_completed(&tx, &event)?;
                true
            }
            _ => false,
        };

        tx.commit()?;

        if handled {
            info!(
                event_id = %event.id,
                event_type = %event.event_type,
                program = %self.program,
                "Webhook processed"
            );
            Ok(WebhookOutcome::Processed {
                event_id: event.id,
                event_type: event.event_type,
            })
        } else {
            info!(event_id = %event.id, event_type = %event.event_type, "Webhook ignored");
            Ok(WebhookOutcome::Ignored {
                event_id: event.id,
                event_type: event.event_type,
            })
        }
    }

    fn actor(&self) -> String {
        format!("webhook:{}", self.program)
    }

    // ========================================================================
    // HANDLERS
    // ========================================================================

    /// Upsert the subscription and push its mapped status onto the profiles it pays for
    fn sync_subscription(
        &self,
        conn: &Connection,
        event: &WebhookEvent,
        status_override: Option<SubscriptionStatus>,
        create_assignments: bool,
    ) -> Result<String> {
        let object = &event.object;
        let stripe_id = require_str(object, &["id"])?;
        let customer = customer_id(object)
            .ok_or_else(|| AdminError::validation("webhook: missing customer"))?;
        let status = match status_override {
            Some(status) => status,
            None => parse_status(require_str(object, &["status"])?)?,
        };

        let billing = BillingService::new(conn);
        let person_id = match str_at(object, &["metadata", "personId"]) {
            Some(id) if find_person(conn, id)?.is_some() => Some(id),
            _ => None,
        };
        let account = billing.upsert_account(self.program, customer, person_id)?;
        let outcome = billing.upsert_subscription(
            &SubscriptionUpsert {
                billing_account_id: account.id,
                stripe_subscription_id: stripe_id.to_string(),
                status,
                amount: subscription_amount(object),
                currency: str_at(object, &["currency"]).unwrap_or("usd").to_string(),
                current_period_start: period_bound(object, "current_period_start"),
                current_period_end: period_bound(object, "current_period_end"),
            },
            Some(&event.id),
        )?;
        let subscription = outcome.subscription;

        let mut assignments = billing.active_assignments(&subscription.id)?;
        if assignments.is_empty() && create_assignments {
            let mut profile_ids = Vec::new();
            for id in metadata_profile_ids(object) {
                match find_profile(conn, &id)? {
                    Some(profile) if profile.program == self.program => profile_ids.push(id),
                    Some(_) => warn!(
                        profile_id = %id,
                        program = %self.program,
                        "Profile belongs to another program"
                    ),
                    None => warn!(profile_id = %id, "Unknown profile in subscription metadata"),
                }
            }
            if !profile_ids.is_empty() {
                assignments = billing.assign_evenly(&subscription, &profile_ids, event.date())?;
            }
        }

        let target = map_subscription_status(status);
        let reason = format!("subscription {}", status);
        let actor = self.actor();
        let mut changed = 0;
        for assignment in &assignments {
            let change = apply_profile_status(
                conn,
                &assignment.program_profile_id,
                target,
                event.date(),
                &reason,
                &actor,
            )?;
            if change.is_some() {
                changed += 1;
            }
        }

        record_event(
            conn,
            "subscription_synced",
            "subscription",
            &subscription.id,
            serde_json::json!({
                "event_id": event.id,
                "status": status,
                "previous_status": outcome.previous_status,
                "profiles": assignments.len(),
                "profiles_changed": changed,
            }),
            &actor,
        )?;
        Ok(subscription.id)
    }

    fn subscription_deleted(&self, conn: &Connection, event: &WebhookEvent) -> Result<()> {
        let subscription_id =
            self.sync_subscription(conn, event, Some(SubscriptionStatus::Canceled), false)?;
        let ended =
            BillingService::new(conn).deactivate_assignments(&subscription_id, event.date())?;
        info!(
            subscription_id = %subscription_id,
            assignments_ended = ended,
            "Subscription canceled"
        );
        Ok(())
    }

    fn invoice_subscription_id(object: &Value) -> Option<&str> {
        str_at(object, &["subscription"])
            .or_else(|| str_at(object, &["subscription", "id"]))
            .or_else(|| str_at(object, &["parent", "subscription_details", "subscription"]))
    }

    fn invoice_paid(&self, conn: &Connection, event: &WebhookEvent) -> Result<()> {
        let object = &event.object;
        let Some(stripe_id) = Self::invoice_subscription_id(object) else {
            info!(
                invoice = ?str_at(object, &["id"]),
                "Invoice without subscription, nothing to record"
            );
            return Ok(());
        };

        let billing = BillingService::new(conn);
        let paid_at = time_at(object, &["status_transitions", "paid_at"]).unwrap_or(event.created);
        let line_end = object
            .get("lines")
            .and_then(|l| l.get("data"))
            .and_then(Value::as_array)
            .and_then(|lines| lines.first())
            .and_then(|line| time_at(line, &["period", "end"]));
        let paid_until = line_end.or_else(|| time_at(object, &["period_end"]));

        // Unknown subscription: fail so the provider retries after subscription.created lands
        let subscription = billing.record_payment(stripe_id, paid_at, paid_until)?;

        record_event(
            conn,
            "payment_recorded",
            "subscription",
            &subscription.id,
            serde_json::json!({
                "event_id": event.id,
                "invoice_id": str_at(object, &["id"]),
                "amount_paid": i64_at(object, &["amount_paid"]),
                "paid_until": subscription.paid_until,
            }),
            &self.actor(),
        )?;
        Ok(())
    }

    fn invoice_failed(&self, conn: &Connection, event: &WebhookEvent) -> Result<()> {
        let object = &event.object;
        let stripe_id = Self::invoice_subscription_id(object);
        let entity_id = match stripe_id {
            Some(id) => BillingService::new(conn)
                .find_subscription(id)?
                .map(|s| s.id)
                .unwrap_or_else(|| id.to_string()),
            None => require_str(object, &["id"])?.to_string(),
        };

        warn!(
            subscription = ?stripe_id,
            attempt = ?i64_at(object, &["attempt_count"]),
            "Invoice payment failed"
        );
        record_event(
            conn,
            "payment_failed",
            "subscription",
            &entity_id,
            serde_json::json!({
                "event_id": event.id,
                "invoice_id": str_at(object, &["id"]),
                "amount_due": i64_at(object, &["amount_due"]),
                "attempt_count": i64_at(object, &["attempt_count"]),
            }),
            &self.actor(),
        )
    }

    /// Attach the customer to a person: explicit `metadata.personId`, else the checkout email
    fn checkout_completed(&self, conn: &Connection, event: &WebhookEvent) -> Result<()> {
        let object = &event.object;
        let customer = customer_id(object)
            .ok_or_else(|| AdminError::validation("webhook: missing customer"))?;

        let mut person = match str_at(object, &["metadata", "personId"]) {
            Some(id) => find_person(conn, id)?,
            None => None,
        };
        if person.is_none() {
            let email = str_at(object, &["customer_details", "email"])
                .or_else(|| str_at(object, &["customer_email"]))
                .and_then(|raw| normalize_email(raw).ok());
            if let Some(email) = email {
                person = find_person_by_contact(conn, ContactType::Email, &email)?;
            }
        }

        let account = BillingService::new(conn).upsert_account(
            self.program,
            customer,
            person.as_ref().map(|p| p.id.as_str()),
        )?;
        match &person {
            Some(p) => info!(customer, person_id = %p.id, "Billing account linked"),
            None => warn!(
                customer,
                "Checkout completed for a customer we cannot match to a person"
            ),
        }

        record_event(
            conn,
            "checkout_completed",
            "billing_account",
            &account.id,
            serde_json::json!({
                "event_id": event.id,
                "session_id": str_at(object, &["id"]),
                "person_id": person.map(|p| p.id),
            }),
            &self.actor(),
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrollment::{get_profile, open_enrollment, test_support::*};
    use crate::entities::EnrollmentStatus;
    use serde_json::json;

    const SECRET: &str = "whsec_test_secret";
    /// 2025-09-01T00:00:00Z
    const CREATED: i64 = 1_756_684_800;

    fn processor() -> WebhookProcessor {
        WebhookProcessor::new(Program::Dugsi, SECRET, 300)
    }

    fn header_for(payload: &str) -> String {
        let t = Utc::now().timestamp();
        format!("t={},v1={}", t, sign_payload(SECRET, t, payload).unwrap())
    }

    fn deliver(conn: &Connection, payload: &Value) -> Result<WebhookOutcome> {
        let body = payload.to_string();
        processor().handle(conn, &body, Some(&header_for(&body)))
    }

    fn sync(
        conn: &Connection,
        id: &str,
        event_type: &str,
        status: &str,
        profile_ids: &[&str],
    ) -> Result<WebhookOutcome> {
        deliver(conn, &event(id, event_type, subscription_object(status, profile_ids)))
    }

    fn event(id: &str, event_type: &str, object: Value) -> Value {
        json!({ "id": id, "type": event_type, "created": CREATED, "data": { "object": object } })
    }

    fn subscription_object(status: &str, profile_ids: &[&str]) -> Value {
        json!({
            "id": "sub_family",
            "customer": "cus_family",
            "status": status,
            "currency": "usd",
            "items": { "data": [{
                "price": { "unit_amount": 20000 },
                "quantity": 1,
                "current_period_start": CREATED,
                "current_period_end": CREATED + 30 * 86_400
            }]},
            "metadata": { "profileIds": profile_ids.join(",") }
        })
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    // ------------------------------------------------------------------------
    // signature
    // ------------------------------------------------------------------------

    #[test]
    fn test_verify_signature() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let good = sign_payload(SECRET, now, payload).unwrap();

        let header = format!("t={},v1={}", now, good);
        assert_eq!(verify_signature(payload, &header, SECRET, 300, now).unwrap(), now);

        // Any v1 entry may match
        let rotated = format!("t={},v1={},v1={}", now, "00".repeat(32), good);
        assert!(verify_signature(payload, &rotated, SECRET, 300, now + 10).is_ok());

        assert!(verify_signature(payload, &header, "other_secret", 300, now).is_err());
        assert!(verify_signature(r#"{"id":"evt_2"}"#, &header, SECRET, 300, now).is_err());
        assert!(verify_signature(payload, &header, SECRET, 300, now + 301).is_err());
    }

    #[test]
    fn test_malformed_headers() {
        for header in [
            "",
            "garbage",
            "t=abc,v1=00",
            "v1=00",
            "t=1700000000",
            "t=-9223372036854775808,v1=00",
            "t=9223372036854775807,v1=00",
        ] {
            let err = verify_signature("{}", header, SECRET, 300, 1_700_000_000).unwrap_err();
            assert!(matches!(err, AdminError::InvalidSignature(_)), "{}", header);
        }
    }

    #[test]
    fn test_bad_signature_is_not_recorded() {
        let conn = fresh_db();
        let body = event("evt_bad", "customer.subscription.updated", json!({})).to_string();
        let header = format!("t={},v1={}", Utc::now().timestamp(), "ab".repeat(32));

        let err = processor().handle(&conn, &body, Some(&header)).unwrap_err();
        assert!(matches!(err, AdminError::InvalidSignature(_)));
        assert!(processor().handle(&conn, &body, None).is_err());
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM webhook_events"), 0);
    }

    // ------------------------------------------------------------------------
    // dispatch
    // ------------------------------------------------------------------------

    #[test]
    fn test_subscription_created_enrolls_profiles_and_splits() {
        let conn = fresh_db();
        let a = insert_student(&conn, "Hamdi", Program::Dugsi, EnrollmentStatus::Registered);
        let b = insert_student(&conn, "Iman", Program::Dugsi, EnrollmentStatus::Registered);

        let payload = event(
            "evt_created",
            "customer.subscription.created",
            subscription_object("active", &[&a.id, &b.id]),
        );
        let outcome = deliver(&conn, &payload).unwrap();
        assert!(matches!(outcome, WebhookOutcome::Processed { .. }));

        for profile in [&a, &b] {
            assert_eq!(get_profile(&conn, &profile.id).unwrap().status, EnrollmentStatus::Enrolled);
        }

        let billing = BillingService::new(&conn);
        let sub = billing.find_subscription("sub_family").unwrap().unwrap();
        assert_eq!(sub.amount, 20000);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.current_period_end, DateTime::from_timestamp(CREATED + 30 * 86_400, 0));

        let amounts: Vec<i64> = billing
            .active_assignments(&sub.id)
            .unwrap()
            .iter()
            .map(|a| a.amount)
            .collect();
        assert_eq!(amounts.iter().sum::<i64>(), 20000);
        assert_eq!(amounts.len(), 2);
        assert_eq!(billing.history(&sub.id).unwrap().len(), 1);
    }

    #[test]
    fn test_repeated_profile_id_in_metadata_is_assigned_once() {
        let conn = fresh_db();
        let a = insert_student(&conn, "Khadra", Program::Dugsi, EnrollmentStatus::Registered);
        let b = insert_student(&conn, "Liban", Program::Dugsi, EnrollmentStatus::Registered);

        let payload = event(
            "evt_repeat_ids",
            "customer.subscription.created",
            subscription_object("active", &[&a.id, &b.id, &a.id]),
        );
        assert!(matches!(deliver(&conn, &payload).unwrap(), WebhookOutcome::Processed { .. }));

        let billing = BillingService::new(&conn);
        let sub = billing.find_subscription("sub_family").unwrap().unwrap();
        let assignments = billing.active_assignments(&sub.id).unwrap();
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments.iter().map(|a| a.amount).sum::<i64>(), 20000);
    }

    #[test]
    fn test_event_without_created_is_dated_now() {
        let undated =
            WebhookEvent::parse(r#"{"id":"evt","type":"x","data":{"object":{}}}"#).unwrap();
        assert_eq!(undated.date(), Utc::now().date_naive());

        let dated = WebhookEvent::parse(&event("evt", "x", json!({})).to_string()).unwrap();
        assert_eq!(dated.date(), NaiveDate::from_ymd_opt(2025, 9, 1).unwrap());
    }

    #[test]
    fn test_duplicate_delivery_is_acknowledged_once() {
        let conn = fresh_db();
        let a = insert_student(&conn, "Jibril", Program::Dugsi, EnrollmentStatus::Registered);
        let object = subscription_object("active", &[&a.id]);
        let payload = event("evt_dup", "customer.subscription.created", object);

        deliver(&conn, &payload).unwrap();
        let events_after_first = count(&conn, "SELECT COUNT(*) FROM events");

        let second = deliver(&conn, &payload).unwrap();
        assert_eq!(second, WebhookOutcome::Duplicate { event_id: "evt_dup".to_string() });
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM events"), events_after_first);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM webhook_events"), 1);
    }

    #[test]
    fn test_same_event_id_from_other_program_is_not_a_duplicate() {
        let conn = fresh_db();
        let body = event("evt_shared", "customer.created", json!({ "id": "cus_1" })).to_string();

        processor().process(&conn, &body).unwrap();
        let mahad = WebhookProcessor::new(Program::Mahad, SECRET, 300);
        let outcome = mahad.process(&conn, &body).unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM webhook_events"), 2);
    }

    #[test]
    fn test_subscription_updates_follow_status_mapping() {
        let conn = fresh_db();
        let a = insert_student(&conn, "Kaltun", Program::Dugsi, EnrollmentStatus::Registered);
        sync(&conn, "evt_1", "customer.subscription.created", "incomplete", &[&a.id]).unwrap();
        assert_eq!(get_profile(&conn, &a.id).unwrap().status, EnrollmentStatus::Registered);

        sync(&conn, "evt_2", "customer.subscription.updated", "past_due", &[]).unwrap();
        assert_eq!(get_profile(&conn, &a.id).unwrap().status, EnrollmentStatus::Enrolled);

        sync(&conn, "evt_3", "customer.subscription.updated", "unpaid", &[]).unwrap();
        assert_eq!(get_profile(&conn, &a.id).unwrap().status, EnrollmentStatus::Withdrawn);
        assert!(open_enrollment(&conn, &a.id).unwrap().is_none());

        let sub = BillingService::new(&conn).find_subscription("sub_family").unwrap().unwrap();
        let history = BillingService::new(&conn).history(&sub.id).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].source_event_id.as_deref(), Some("evt_3"));
    }

    #[test]
    fn test_subscription_deleted_withdraws_and_ends_assignments() {
        let conn = fresh_db();
        let a = insert_student(&conn, "Luul", Program::Dugsi, EnrollmentStatus::Registered);
        sync(&conn, "evt_1", "customer.subscription.created", "active", &[&a.id]).unwrap();
        sync(&conn, "evt_2", "customer.subscription.deleted", "canceled", &[&a.id]).unwrap();

        assert_eq!(get_profile(&conn, &a.id).unwrap().status, EnrollmentStatus::Withdrawn);
        let billing = BillingService::new(&conn);
        let sub = billing.find_subscription("sub_family").unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert!(billing.active_assignments(&sub.id).unwrap().is_empty());
        assert_eq!(billing.assignments_for_profile(&a.id).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_status_rolls_back() {
        let conn = fresh_db();
        let object = subscription_object("frozen", &[]);
        let payload = event("evt_odd", "customer.subscription.updated", object);

        let err = deliver(&conn, &payload).unwrap_err();
        assert!(matches!(err, AdminError::UnknownStatus(ref s) if s == "frozen"));
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM webhook_events"), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM billing_accounts"), 0);
    }

    #[test]
    fn test_invoice_paid_records_payment() {
        let conn = fresh_db();
        sync(&conn, "evt_1", "customer.subscription.created", "active", &[]).unwrap();

        let invoice = json!({
            "id": "in_1",
            "subscription": "sub_family",
            "amount_paid": 20000,
            "status_transitions": { "paid_at": CREATED + 60 },
            "lines": { "data": [{ "period": { "start": CREATED, "end": CREATED + 30 * 86_400 } }] }
        });
        deliver(&conn, &event("evt_2", "invoice.paid", invoice)).unwrap();

        let sub = BillingService::new(&conn).find_subscription("sub_family").unwrap().unwrap();
        assert_eq!(sub.last_payment_at, DateTime::from_timestamp(CREATED + 60, 0));
        assert_eq!(sub.paid_until, DateTime::from_timestamp(CREATED + 30 * 86_400, 0));
    }

    #[test]
    fn test_invoice_for_unknown_subscription_fails_for_retry() {
        let conn = fresh_db();
        let invoice = json!({ "id": "in_1", "subscription": "sub_later" });

        let early = event("evt_early", "invoice.payment_succeeded", invoice.clone());
        let err = deliver(&conn, &early).unwrap_err();
        assert!(matches!(err, AdminError::NotFound(_)));
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM webhook_events"), 0);
    }

    #[test]
    fn test_payment_failed_is_audit_only() {
        let conn = fresh_db();
        let a = insert_student(&conn, "Muna", Program::Dugsi, EnrollmentStatus::Registered);
        sync(&conn, "evt_1", "customer.subscription.created", "active", &[&a.id]).unwrap();

        let invoice = json!({
            "id": "in_2",
            "subscription": "sub_family",
            "amount_due": 20000,
            "attempt_count": 1
        });
        deliver(&conn, &event("evt_2", "invoice.payment_failed", invoice)).unwrap();

        assert_eq!(get_profile(&conn, &a.id).unwrap().status, EnrollmentStatus::Enrolled);
        let failures = count(
            &conn,
            "SELECT COUNT(*) FROM events WHERE event_type = 'payment_failed'",
        );
        assert_eq!(failures, 1);
    }

    #[test]
    fn test_checkout_links_account_by_email() {
        let conn = fresh_db();
        let parent = insert_person(&conn, "Nasra", "Yusuf");
        conn.execute(
            "INSERT INTO contact_points (id, person_id, contact_type, value, is_primary)
             VALUES ('c1', ?1, 'EMAIL', 'nasra@example.com', 1)",
            [&parent.id],
        )
        .unwrap();

        let session = json!({
            "id": "cs_1",
            "customer": "cus_nasra",
            "customer_details": { "email": "Nasra@Example.com" }
        });
        deliver(&conn, &event("evt_checkout", "checkout.session.completed", session)).unwrap();

        let account = BillingService::new(&conn)
            .find_account(Program::Dugsi, "cus_nasra")
            .unwrap()
            .unwrap();
        assert_eq!(account.person_id.as_deref(), Some(parent.id.as_str()));
    }

    #[test]
    fn test_unknown_event_type_is_recorded_and_ignored() {
        let conn = fresh_db();
        let payload = event("evt_misc", "customer.created", json!({ "id": "cus_1" }));

        assert!(matches!(deliver(&conn, &payload).unwrap(), WebhookOutcome::Ignored { .. }));
        assert!(matches!(deliver(&conn, &payload).unwrap(), WebhookOutcome::Duplicate { .. }));
    }

    #[test]
    fn test_profiles_from_other_program_are_skipped() {
        let conn = fresh_db();
        let mahad = insert_student(&conn, "Nimco", Program::Mahad, EnrollmentStatus::Registered);
        let ids = [mahad.id.as_str(), "missing"];
        sync(&conn, "evt_1", "customer.subscription.created", "active", &ids).unwrap();

        assert_eq!(get_profile(&conn, &mahad.id).unwrap().status, EnrollmentStatus::Registered);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM billing_assignments"), 0);
    }
}
