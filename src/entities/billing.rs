// 💳 Billing entities - accounts, subscriptions, assignments
//
// BillingAccount  = one payment-provider customer inside one program
// Subscription    = provider subscription, status mirrored from webhooks
// BillingAssignment = which profiles a subscription pays for, and how much of it
//
// All money is integer cents, the same unit the provider reports.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{ParseEnumError, Program};
use crate::db::{
    date_from_sql, enum_from_sql, opt_date_from_sql, opt_timestamp_from_sql, timestamp_from_sql,
};

// ============================================================================
// SUBSCRIPTION STATUS (provider vocabulary)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    IncompleteExpired,
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 8] = [
        SubscriptionStatus::Incomplete,
        SubscriptionStatus::IncompleteExpired,
        SubscriptionStatus::Trialing,
        SubscriptionStatus::Active,
        SubscriptionStatus::PastDue,
        SubscriptionStatus::Canceled,
        SubscriptionStatus::Unpaid,
        SubscriptionStatus::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
        }
    }

    /// Terminal states never come back to life on the provider side
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::IncompleteExpired
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Provider spells it "canceled"; older exports used "cancelled"
        match s.trim().to_ascii_lowercase().as_str() {
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Ok(SubscriptionStatus::IncompleteExpired),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" | "cancelled" => Ok(SubscriptionStatus::Canceled),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "paused" => Ok(SubscriptionStatus::Paused),
            _ => Err(ParseEnumError::new("subscription status", s)),
        }
    }
}

// ============================================================================
// BILLING ACCOUNT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingAccount {
    pub id: String,
    /// Paying person (parent for Dugsi, the student for Mahad). Unknown until checkout links it.
    pub person_id: Option<String>,
    pub program: Program,
    pub stripe_customer_id: String,
    pub created_at: DateTime<Utc>,
}

impl BillingAccount {
    pub const COLUMNS: &'static str = "id, person_id, program, stripe_customer_id, created_at";

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let program: String = row.get(2)?;
        let created_at: String = row.get(4)?;
        Ok(BillingAccount {
            id: row.get(0)?,
            person_id: row.get(1)?,
            program: enum_from_sql(2, &program)?,
            stripe_customer_id: row.get(3)?,
            created_at: timestamp_from_sql(4, &created_at)?,
        })
    }
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub billing_account_id: String,
    pub stripe_subscription_id: String,
    pub status: SubscriptionStatus,
    /// Amount per billing period, in cents
    pub amount: i64,
    pub currency: String,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub paid_until: Option<DateTime<Utc>>,
    pub last_payment_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub const COLUMNS: &'static str = "id, billing_account_id, stripe_subscription_id, status, amount, currency,
         current_period_start, current_period_end, paid_until, last_payment_at, created_at, updated_at";

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status: String = row.get(3)?;
        let created_at: String = row.get(10)?;
        let updated_at: String = row.get(11)?;
        Ok(Subscription {
            id: row.get(0)?,
            billing_account_id: row.get(1)?,
            stripe_subscription_id: row.get(2)?,
            status: enum_from_sql(3, &status)?,
            amount: row.get(4)?,
            currency: row.get(5)?,
            current_period_start: opt_timestamp_from_sql(6, row.get(6)?)?,
            current_period_end: opt_timestamp_from_sql(7, row.get(7)?)?,
            paid_until: opt_timestamp_from_sql(8, row.get(8)?)?,
            last_payment_at: opt_timestamp_from_sql(9, row.get(9)?)?,
            created_at: timestamp_from_sql(10, &created_at)?,
            updated_at: timestamp_from_sql(11, &updated_at)?,
        })
    }

    /// Paid through `at`? Falls back to the current period when no payment was seen yet.
    pub fn is_paid_through(&self, at: DateTime<Utc>) -> bool {
        match self.paid_until.or(self.current_period_end) {
            Some(until) => until >= at,
            None => false,
        }
    }
}

/// One status change of a subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionHistoryEntry {
    pub id: String,
    pub subscription_id: String,
    pub from_status: Option<SubscriptionStatus>,
    pub to_status: SubscriptionStatus,
    pub source_event_id: Option<String>,
    pub changed_at: DateTime<Utc>,
}

impl SubscriptionHistoryEntry {
    pub const COLUMNS: &'static str =
        "id, subscription_id, from_status, to_status, source_event_id, changed_at";

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let from_status: Option<String> = row.get(2)?;
        let to_status: String = row.get(3)?;
        let changed_at: String = row.get(5)?;
        Ok(SubscriptionHistoryEntry {
            id: row.get(0)?,
            subscription_id: row.get(1)?,
            from_status: from_status.map(|s| enum_from_sql(2, &s)).transpose()?,
            to_status: enum_from_sql(3, &to_status)?,
            source_event_id: row.get(4)?,
            changed_at: timestamp_from_sql(5, &changed_at)?,
        })
    }
}

// ============================================================================
// BILLING ASSIGNMENT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingAssignment {
    pub id: String,
    pub subscription_id: String,
    pub program_profile_id: String,
    /// This profile's share of the subscription amount, in cents
    pub amount: i64,
    pub is_active: bool,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

impl BillingAssignment {
    pub const COLUMNS: &'static str =
        "id, subscription_id, program_profile_id, amount, is_active, start_date, end_date";

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let start_date: String = row.get(5)?;
        Ok(BillingAssignment {
            id: row.get(0)?,
            subscription_id: row.get(1)?,
            program_profile_id: row.get(2)?,
            amount: row.get(3)?,
            is_active: row.get(4)?,
            start_date: date_from_sql(5, &start_date)?,
            end_date: opt_date_from_sql(6, row.get(6)?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_subscription_status_parses_provider_strings() {
        for status in SubscriptionStatus::ALL {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>().unwrap(), status);
        }
        assert_eq!(
            "cancelled".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::Canceled
        );
        let err = "bogus".parse::<SubscriptionStatus>().unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SubscriptionStatus::Canceled.is_terminal());
        assert!(SubscriptionStatus::IncompleteExpired.is_terminal());
        assert!(!SubscriptionStatus::PastDue.is_terminal());
    }

    #[test]
    fn test_is_paid_through() {
        let now = Utc::now();
        let mut sub = Subscription {
            id: "s".to_string(),
            billing_account_id: "b".to_string(),
            stripe_subscription_id: "sub_1".to_string(),
            status: SubscriptionStatus::Active,
            amount: 10000,
            currency: "usd".to_string(),
            current_period_start: None,
            current_period_end: None,
            paid_until: None,
            last_payment_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(!sub.is_paid_through(now));

        sub.current_period_end = Some(now + Duration::days(3));
        assert!(sub.is_paid_through(now));

        // An explicit paid_until wins over the period end
        sub.paid_until = Some(now - Duration::days(1));
        assert!(!sub.is_paid_through(now));
    }
}
