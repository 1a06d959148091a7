// ⚖️ Reconciliation Engine - Validate enrollment matches billing
//
// For every subscription:
//   map(subscription.status) == status of every actively-assigned profile
//   sum(active assignment amounts) == subscription.amount
//
// Webhooks keep these in step; this pass finds the rows where they drifted
// (missed deliveries, manual edits, legacy data) and can repair status drift.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::billing::BillingService;
use crate::db::enum_from_sql;
use crate::enrollment::apply_profile_status;
use crate::entities::{EnrollmentStatus, Subscription, SubscriptionStatus};
use crate::error::Result;
use crate::status_mapping::map_subscription_status;

// ============================================================================
// RECONCILIATION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReconciliationResult {
    /// Every assigned profile matches the subscription and the split adds up
    Consistent {
        expected_status: EnrollmentStatus,
        assigned_profiles: usize,
        assigned_total: i64,
    },

    /// At least one discrepancy
    Drifted {
        expected_status: EnrollmentStatus,
        discrepancy_count: usize,
    },
}

impl ReconciliationResult {
    pub fn is_consistent(&self) -> bool {
        matches!(self, ReconciliationResult::Consistent { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiscrepancyCategory {
    /// Profile status differs from the mapped subscription status
    StatusMismatch,
    /// Active assignment amounts do not add up to the subscription amount
    SplitMismatch,
    /// Live subscription with no active assignment
    Unassigned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    pub description: String,
    pub category: DiscrepancyCategory,
    pub program_profile_id: Option<String>,
    pub expected_status: Option<EnrollmentStatus>,
    pub actual_status: Option<EnrollmentStatus>,
    /// Cents, assigned total minus subscription amount (SplitMismatch only)
    pub amount_difference: i64,
}

// ============================================================================
// INPUT + REPORT
// ============================================================================

/// One active assignment and the current status of its profile
#[derive(Debug, Clone, PartialEq)]
pub struct AssignedProfile {
    pub program_profile_id: String,
    pub amount: i64,
    pub status: EnrollmentStatus,
}

#[derive(Debug, Clone)]
pub struct SubscriptionState {
    pub subscription: Subscription,
    pub assignments: Vec<AssignedProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionReconciliation {
    pub subscription_id: String,
    pub stripe_subscription_id: String,
    pub subscription_status: SubscriptionStatus,
    pub result: ReconciliationResult,
    pub discrepancies: Vec<Discrepancy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub subscriptions_checked: usize,
    pub consistent: usize,
    pub drifted: usize,
    pub results: Vec<SubscriptionReconciliation>,
    pub reconciled_at: DateTime<Utc>,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.drifted == 0
    }

    pub fn discrepancies(
        &self,
    ) -> impl Iterator<Item = (&SubscriptionReconciliation, &Discrepancy)> {
        self.results
            .iter()
            .flat_map(|r| r.discrepancies.iter().map(move |d| (r, d)))
    }

    pub fn summary(&self) -> String {
        format!(
            "Reconciliation: {} subscriptions, {} consistent, {} drifted, {} discrepancies",
            self.subscriptions_checked,
            self.consistent,
            self.drifted,
            self.discrepancies().count()
        )
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

#[derive(Debug, Default)]
pub struct ReconciliationEngine;

impl ReconciliationEngine {
    pub fn new() -> Self {
        ReconciliationEngine
    }

    /// Check one subscription against its assignments
    pub fn reconcile(&self, state: &SubscriptionState) -> SubscriptionReconciliation {
        let sub = &state.subscription;
        let expected = map_subscription_status(sub.status);
        let mut discrepancies = Vec::new();

        for assigned in &state.assignments {
            if assigned.status != expected {
                discrepancies.push(Discrepancy {
                    description: format!(
                        "Profile {} is {} but subscription {} is {} (expects {})",
                        assigned.program_profile_id,
                        assigned.status,
                        sub.stripe_subscription_id,
                        sub.status,
                        expected
                    ),
                    category: DiscrepancyCategory::StatusMismatch,
                    program_profile_id: Some(assigned.program_profile_id.clone()),
                    expected_status: Some(expected),
                    actual_status: Some(assigned.status),
                    amount_difference: 0,
                });
            }
        }

        let assigned_total: i64 = state.assignments.iter().map(|a| a.amount).sum();

        if !sub.status.is_terminal() {
            if state.assignments.is_empty() {
                discrepancies.push(Discrepancy {
                    description: format!(
                        "Subscription {} ({}) pays for nobody",
                        sub.stripe_subscription_id, sub.status
                    ),
                    category: DiscrepancyCategory::Unassigned,
                    program_profile_id: None,
                    expected_status: None,
                    actual_status: None,
                    amount_difference: 0,
                });
            } else if assigned_total != sub.amount {
                discrepancies.push(Discrepancy {
                    description: format!(
                        "Subscription {} charges {} but assignments total {}",
                        sub.stripe_subscription_id, sub.amount, assigned_total
                    ),
                    category: DiscrepancyCategory::SplitMismatch,
                    program_profile_id: None,
                    expected_status: None,
                    actual_status: None,
                    amount_difference: assigned_total - sub.amount,
                });
            }
        }

        let result = if discrepancies.is_empty() {
            ReconciliationResult::Consistent {
                expected_status: expected,
                assigned_profiles: state.assignments.len(),
                assigned_total,
            }
        } else {
            ReconciliationResult::Drifted {
                expected_status: expected,
                discrepancy_count: discrepancies.len(),
            }
        };

        SubscriptionReconciliation {
            subscription_id: sub.id.clone(),
            stripe_subscription_id: sub.stripe_subscription_id.clone(),
            subscription_status: sub.status,
            result,
            discrepancies,
        }
    }

    pub fn reconcile_all(&self, states: &[SubscriptionState]) -> ReconciliationReport {
        let results: Vec<SubscriptionReconciliation> =
            states.iter().map(|s| self.reconcile(s)).collect();
        let consistent = results.iter().filter(|r| r.result.is_consistent()).count();
        ReconciliationReport {
            subscriptions_checked: results.len(),
            consistent,
            drifted: results.len() - consistent,
            results,
            reconciled_at: Utc::now(),
        }
    }

    /// Load every subscription with its active assignments
    pub fn load_states(&self, conn: &Connection) -> Result<Vec<SubscriptionState>> {
        let subscriptions = BillingService::new(conn).list_subscriptions()?;

        let mut stmt = conn.prepare(
            "SELECT a.subscription_id, a.program_profile_id, a.amount, pp.status
             FROM billing_assignments a
             JOIN program_profiles pp ON pp.id = a.program_profile_id
             WHERE a.is_active = 1
             ORDER BY a.start_date, a.program_profile_id",
        )?;
        let mut by_subscription: BTreeMap<String, Vec<AssignedProfile>> = BTreeMap::new();
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(3)?;
            Ok((
                row.get::<_, String>(0)?,
                AssignedProfile {
                    program_profile_id: row.get(1)?,
                    amount: row.get(2)?,
                    status: enum_from_sql(3, &status)?,
                },
            ))
        })?;
        for row in rows {
            let (subscription_id, assigned) = row?;
            by_subscription.entry(subscription_id).or_default().push(assigned);
        }

        Ok(subscriptions
            .into_iter()
            .map(|subscription| SubscriptionState {
                assignments: by_subscription.remove(&subscription.id).unwrap_or_default(),
                subscription,
            })
            .collect())
    }

    pub fn run(&self, conn: &Connection) -> Result<ReconciliationReport> {
        let report = self.reconcile_all(&self.load_states(conn)?);
        if report.is_consistent() {
            info!(subscriptions = report.subscriptions_checked, "Reconciliation clean");
        } else {
            for (sub, d) in report.discrepancies() {
                warn!(
                    subscription = %sub.stripe_subscription_id,
                    category = ?d.category,
                    "{}",
                    d.description
                );
            }
        }
        Ok(report)
    }

    /// Apply the mapping to every StatusMismatch in one transaction.
    /// A profile that two subscriptions disagree about is left for a human.
    /// Returns how many profiles changed.
    pub fn repair(&self, conn: &Connection, today: NaiveDate) -> Result<usize> {
        let report = self.run(conn)?;

        let mut targets: BTreeMap<String, Option<EnrollmentStatus>> = BTreeMap::new();
        for (_, d) in report.discrepancies() {
            if let (DiscrepancyCategory::StatusMismatch, Some(profile_id), Some(expected)) =
                (&d.category, &d.program_profile_id, d.expected_status)
            {
                targets
                    .entry(profile_id.clone())
                    .and_modify(|t| {
                        if *t != Some(expected) {
                            *t = None;
                        }
                    })
                    .or_insert(Some(expected));
            }
        }

        let tx = conn.unchecked_transaction()?;
        let mut repaired = 0;
        for (profile_id, target) in &targets {
            match target {
                Some(status) => {
                    let change = apply_profile_status(
                        &tx,
                        profile_id,
                        *status,
                        today,
                        "reconciliation",
                        "reconciliation",
                    )?;
                    if change.is_some() {
                        repaired += 1;
                    }
                }
                None => warn!(profile_id = %profile_id, "Conflicting subscriptions, not repaired"),
            }
        }
        tx.commit()?;

        info!(repaired, "Reconciliation repair finished");
        Ok(repaired)
    }
}

// ============================================================================
// TESTS
// ============================================================================
