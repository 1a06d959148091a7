// 💵 Billing service - accounts, subscriptions, split assignments
//
// Subscription rows mirror the provider; every status change is appended to
// subscription_history. Assignments split one subscription across profiles
// (e.g. one parent paying for three Dugsi children).

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::{date_to_sql, new_id};
use crate::entities::{
    BillingAccount, BillingAssignment, Program, Subscription, SubscriptionHistoryEntry,
    SubscriptionStatus,
};
use crate::error::{AdminError, Result};

/// Split `total` cents across `parts` payers; the remainder goes to the first.
pub fn split_evenly(total: i64, parts: usize) -> Vec<i64> {
    if parts == 0 {
        return Vec::new();
    }
    let n = parts as i64;
    let base = total / n;
    let remainder = total - base * n;
    let mut shares = vec![base; parts];
    shares[0] += remainder;
    shares
}

/// Fields the provider tells us about a subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionUpsert {
    pub billing_account_id: String,
    pub stripe_subscription_id: String,
    pub status: SubscriptionStatus,
    pub amount: i64,
    pub currency: String,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub subscription: Subscription,
    /// `None` for a freshly created subscription
    pub previous_status: Option<SubscriptionStatus>,
    pub created: bool,
}

impl UpsertOutcome {
    pub fn status_changed(&self) -> bool {
        self.created || self.previous_status != Some(self.subscription.status)
    }
}

pub struct BillingService<'a> {
    conn: &'a Connection,
}

impl<'a> BillingService<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        BillingService { conn }
    }

    // ========================================================================
    // ACCOUNTS
    // ========================================================================

    pub fn find_account(
        &self,
        program: Program,
        customer_id: &str,
    ) -> Result<Option<BillingAccount>> {
        let sql = format!(
            "SELECT {} FROM billing_accounts WHERE stripe_customer_id = ?1 AND program = ?2",
            BillingAccount::COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![customer_id, program.as_str()], BillingAccount::from_row)
            .optional()?)
    }

    /// Create the account for (customer, program) if missing. A known person
    /// is attached; an unknown one never clears an existing link.
    pub fn upsert_account(
        &self,
        program: Program,
        customer_id: &str,
        person_id: Option<&str>,
    ) -> Result<BillingAccount> {
        self.conn.execute(
            "INSERT INTO billing_accounts (id, person_id, program, stripe_customer_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (stripe_customer_id, program) DO UPDATE
             SET person_id = COALESCE(excluded.person_id, billing_accounts.person_id)",
            params![new_id(), person_id, program.as_str(), customer_id, Utc::now().to_rfc3339()],
        )?;
        self.find_account(program, customer_id)?
            .ok_or_else(|| AdminError::not_found("Billing account", customer_id))
    }

    // ========================================================================
    // SUBSCRIPTIONS
    // ========================================================================

    pub fn find_subscription(&self, stripe_subscription_id: &str) -> Result<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE stripe_subscription_id = ?1",
            Subscription::COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, [stripe_subscription_id], Subscription::from_row)
            .optional()?)
    }

    pub fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions ORDER BY created_at",
            Subscription::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], Subscription::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Insert or refresh a subscription; history gets a row whenever the status moves.
    pub fn upsert_subscription(
        &self,
        upsert: &SubscriptionUpsert,
        source_event_id: Option<&str>,
    ) -> Result<UpsertOutcome> {
        let now = Utc::now().to_rfc3339();
        let existing = self.find_subscription(&upsert.stripe_subscription_id)?;

        let (subscription_id, previous_status) = match &existing {
            Some(sub) => {
                self.conn.execute(
                    "UPDATE subscriptions
                     SET billing_account_id = ?1, status = ?2, amount = ?3, currency = ?4,
                         current_period_start = ?5, current_period_end = ?6, updated_at = ?7
                     WHERE id = ?8",
                    params![
                        upsert.billing_account_id,
                        upsert.status.as_str(),
                        upsert.amount,
                        upsert.currency,
                        upsert.current_period_start.map(|t| t.to_rfc3339()),
                        upsert.current_period_end.map(|t| t.to_rfc3339()),
                        now,
                        sub.id,
                    ],
                )?;
                (sub.id.clone(), Some(sub.status))
            }
            None => {
                let id = new_id();
                self.conn.execute(
                    "INSERT INTO subscriptions (
                        id, billing_account_id, stripe_subscription_id, status, amount, currency,
                        current_period_start, current_period_end, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                    params![
                        id,
                        upsert.billing_account_id,
                        upsert.stripe_subscription_id,
                        upsert.status.as_str(),
                        upsert.amount,
                        upsert.currency,
                        upsert.current_period_start.map(|t| t.to_rfc3339()),
                        upsert.current_period_end.map(|t| t.to_rfc3339()),
                        now,
                    ],
                )?;
                (id, None)
            }
        };

        if previous_status != Some(upsert.status) {
            self.append_history(&subscription_id, previous_status, upsert.status, source_event_id)?;
            info!(
                subscription = %upsert.stripe_subscription_id,
                from = ?previous_status.map(|s| s.as_str()),
                to = %upsert.status,
                "Subscription status recorded"
            );
        }

        let subscription = self
            .find_subscription(&upsert.stripe_subscription_id)?
            .ok_or_else(|| AdminError::not_found("Subscription", &upsert.stripe_subscription_id))?;

        Ok(UpsertOutcome {
            subscription,
            previous_status,
            created: existing.is_none(),
        })
    }

    fn append_history(
        &self,
        subscription_id: &str,
        from: Option<SubscriptionStatus>,
        to: SubscriptionStatus,
        source_event_id: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO subscription_history (id, subscription_id, from_status, to_status, source_event_id, changed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new_id(),
                subscription_id,
                from.map(|s| s.as_str()),
                to.as_str(),
                source_event_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn history(&self, subscription_id: &str) -> Result<Vec<SubscriptionHistoryEntry>> {
        let sql = format!(
            "SELECT {} FROM subscription_history WHERE subscription_id = ?1 ORDER BY changed_at, rowid",
            SubscriptionHistoryEntry::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([subscription_id], SubscriptionHistoryEntry::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Successful invoice: remember when, and how far it pays
    pub fn record_payment(
        &self,
        stripe_subscription_id: &str,
        paid_at: DateTime<Utc>,
        paid_until: Option<DateTime<Utc>>,
    ) -> Result<Subscription> {
        let updated = self.conn.execute(
            "UPDATE subscriptions
             SET last_payment_at = ?1, paid_until = COALESCE(?2, paid_until), updated_at = ?3
             WHERE stripe_subscription_id = ?4",
            params![
                paid_at.to_rfc3339(),
                paid_until.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
                stripe_subscription_id,
            ],
        )?;
        if updated == 0 {
            return Err(AdminError::not_found("Subscription", stripe_subscription_id));
        }
        self.find_subscription(stripe_subscription_id)?
            .ok_or_else(|| AdminError::not_found("Subscription", stripe_subscription_id))
    }

    /// Most recently updated subscription actively paying for a profile
    pub fn subscription_for_profile(&self, profile_id: &str) -> Result<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions
             WHERE id IN (SELECT subscription_id FROM billing_assignments
                          WHERE program_profile_id = ?1 AND is_active = 1)
             ORDER BY updated_at DESC LIMIT 1",
            Subscription::COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, [profile_id], Subscription::from_row)
            .optional()?)
    }

    // ========================================================================
    // ASSIGNMENTS
    // ========================================================================

    pub fn active_assignments(&self, subscription_id: &str) -> Result<Vec<BillingAssignment>> {
        let sql = format!(
            "SELECT {} FROM billing_assignments WHERE subscription_id = ?1 AND is_active = 1
             ORDER BY start_date, rowid",
            BillingAssignment::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([subscription_id], BillingAssignment::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn assignments_for_profile(&self, profile_id: &str) -> Result<Vec<BillingAssignment>> {
        let sql = format!(
            "SELECT {} FROM billing_assignments WHERE program_profile_id = ?1 ORDER BY start_date, rowid",
            BillingAssignment::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([profile_id], BillingAssignment::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Assign part of a subscription to a profile.
    ///
    /// The sum of active assignment amounts may not exceed the subscription amount,
    /// and a profile holds at most one active assignment per subscription.
    pub fn create_assignment(
        &self,
        subscription_id: &str,
        profile_id: &str,
        amount: i64,
        on: NaiveDate,
    ) -> Result<BillingAssignment> {
        if amount < 0 {
            return Err(AdminError::validation("amount: must not be negative"));
        }

        let subscription_amount: i64 = self
            .conn
            .query_row(
                "SELECT amount FROM subscriptions WHERE id = ?1",
                [subscription_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| AdminError::not_found("Subscription", subscription_id))?;

        let active = self.active_assignments(subscription_id)?;
        if active.iter().any(|a| a.program_profile_id == profile_id) {
            return Err(AdminError::Conflict(format!(
                "Profile {} already has an active assignment on this subscription",
                profile_id
            )));
        }
        let assigned: i64 = active.iter().map(|a| a.amount).sum();
        if assigned + amount > subscription_amount {
            return Err(AdminError::validation(format!(
                "amount: assignments would total {} cents, subscription is {} cents",
                assigned + amount,
                subscription_amount
            )));
        }

        let assignment = BillingAssignment {
            id: new_id(),
            subscription_id: subscription_id.to_string(),
            program_profile_id: profile_id.to_string(),
            amount,
            is_active: true,
            start_date: on,
            end_date: None,
        };
        self.conn.execute(
            "INSERT INTO billing_assignments (id, subscription_id, program_profile_id, amount, is_active, start_date)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![
                assignment.id,
                assignment.subscription_id,
                assignment.program_profile_id,
                assignment.amount,
                date_to_sql(on),
            ],
        )?;
        Ok(assignment)
    }

    /// Split the subscription amount evenly over `profile_ids`
    pub fn assign_evenly(
        &self,
        subscription: &Subscription,
        profile_ids: &[String],
        on: NaiveDate,
    ) -> Result<Vec<BillingAssignment>> {
        let shares = split_evenly(subscription.amount, profile_ids.len());
        profile_ids
            .iter()
            .zip(shares)
            .map(|(profile_id, share)| {
                self.create_assignment(&subscription.id, profile_id, share, on)
            })
            .collect()
    }

    /// End every active assignment of a subscription; returns how many were ended
    pub fn deactivate_assignments(&self, subscription_id: &str, on: NaiveDate) -> Result<usize> {
        let ended = self.conn.execute(
            "UPDATE billing_assignments SET is_active = 0, end_date = ?1
             WHERE subscription_id = ?2 AND is_active = 1",
            params![date_to_sql(on), subscription_id],
        )?;
        Ok(ended)
    }
}
