// 🔁 Subscription status → enrollment status
//
// The provider owns the subscription lifecycle; we own enrollment. This module
// is the single table that translates one into the other, plus the pure
// decision of what that means for a profile's open enrollment row.
//
// Nothing here touches the database (see `enrollment::apply_profile_status`).

use serde::{Deserialize, Serialize};

use crate::entities::{EnrollmentStatus, SubscriptionStatus};

/// The mapping table.
///
/// | provider status                       | enrollment status |
/// |---------------------------------------|-------------------|
/// | active, trialing, past_due            | ENROLLED          |
/// | incomplete, paused                    | REGISTERED        |
/// | canceled, incomplete_expired, unpaid  | WITHDRAWN         |
///
/// past_due stays ENROLLED: the provider is still retrying the charge and
/// will move the subscription to unpaid or canceled if retries run out.
pub fn map_subscription_status(status: SubscriptionStatus) -> EnrollmentStatus {
    match status {
        SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue => {
            EnrollmentStatus::Enrolled
        }
        SubscriptionStatus::Incomplete | SubscriptionStatus::Paused => EnrollmentStatus::Registered,
        SubscriptionStatus::Canceled
        | SubscriptionStatus::IncompleteExpired
        | SubscriptionStatus::Unpaid => EnrollmentStatus::Withdrawn,
    }
}

// ============================================================================
// ENROLLMENT TRANSITION
// ============================================================================

/// What to do with the enrollment rows when a profile moves to a new status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrollmentTransition {
    /// Status already matches, nothing to write
    NoChange,

    /// Rewrite the status of the open enrollment
    UpdateOpen(EnrollmentStatus),

    /// End the open enrollment (withdrawal)
    CloseOpen,

    /// No open enrollment exists; start a new one (re-enrollment after withdrawal)
    OpenNew(EnrollmentStatus),

    /// Profile status changes but there is no enrollment row to touch
    ProfileOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: EnrollmentStatus,
    pub to: EnrollmentStatus,
    pub transition: EnrollmentTransition,
}

impl StatusChange {
    pub fn is_noop(&self) -> bool {
        self.from == self.to && self.transition == EnrollmentTransition::NoChange
    }
}

/// Decide the transition for a profile currently at `current`, with or
/// without an open enrollment, that should end up at `target`.
pub fn plan_transition(
    current: EnrollmentStatus,
    open_enrollment_status: Option<EnrollmentStatus>,
    target: EnrollmentStatus,
) -> StatusChange {
    let transition = match (open_enrollment_status, target) {
        (Some(_), EnrollmentStatus::Withdrawn) => EnrollmentTransition::CloseOpen,
        (None, EnrollmentStatus::Withdrawn) => {
            if current == EnrollmentStatus::Withdrawn {
                EnrollmentTransition::NoChange
            } else {
                EnrollmentTransition::ProfileOnly
            }
        }
        (Some(open), target) if open == target => EnrollmentTransition::NoChange,
        (Some(_), target) => EnrollmentTransition::UpdateOpen(target),
        (None, target) => EnrollmentTransition::OpenNew(target),
    };

    StatusChange {
        from: current,
        to: target,
        transition,
    }
}

/// Plan directly from a provider status
pub fn plan_for_subscription(
    current: EnrollmentStatus,
    open_enrollment_status: Option<EnrollmentStatus>,
    subscription_status: SubscriptionStatus,
) -> StatusChange {
    plan_transition(
        current,
        open_enrollment_status,
        map_subscription_status(subscription_status),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use EnrollmentStatus::*;

    #[test]
    fn test_mapping_table() {
        let expected = [
            (SubscriptionStatus::Active, Enrolled),
            (SubscriptionStatus::Trialing, Enrolled),
            (SubscriptionStatus::PastDue, Enrolled),
            (SubscriptionStatus::Incomplete, Registered),
            (SubscriptionStatus::Paused, Registered),
            (SubscriptionStatus::Canceled, Withdrawn),
            (SubscriptionStatus::IncompleteExpired, Withdrawn),
            (SubscriptionStatus::Unpaid, Withdrawn),
        ];
        for (sub, enrollment) in expected {
            assert_eq!(map_subscription_status(sub), enrollment, "{}", sub);
        }
    }

    #[test]
    fn test_every_status_is_mapped() {
        // Adding a provider status must force a decision here
        for status in SubscriptionStatus::ALL {
            let _ = map_subscription_status(status);
        }
    }

    #[test]
    fn test_registered_to_enrolled_updates_open_enrollment() {
        let change =
            plan_for_subscription(Registered, Some(Registered), SubscriptionStatus::Active);
        assert_eq!(change.from, Registered);
        assert_eq!(change.to, Enrolled);
        assert_eq!(change.transition, EnrollmentTransition::UpdateOpen(Enrolled));
        assert!(!change.is_noop());
    }

    #[test]
    fn test_same_status_is_noop() {
        let change = plan_for_subscription(Enrolled, Some(Enrolled), SubscriptionStatus::PastDue);
        assert!(change.is_noop());
    }

    #[test]
    fn test_cancel_closes_open_enrollment() {
        let change = plan_for_subscription(Enrolled, Some(Enrolled), SubscriptionStatus::Canceled);
        assert_eq!(change.transition, EnrollmentTransition::CloseOpen);
        assert_eq!(change.to, Withdrawn);
    }

    #[test]
    fn test_cancel_without_open_enrollment() {
        let change = plan_transition(Enrolled, None, Withdrawn);
        assert_eq!(change.transition, EnrollmentTransition::ProfileOnly);

        let change = plan_transition(Withdrawn, None, Withdrawn);
        assert!(change.is_noop());
    }

    #[test]
    fn test_reactivation_opens_new_enrollment() {
        let change = plan_for_subscription(Withdrawn, None, SubscriptionStatus::Active);
        assert_eq!(change.transition, EnrollmentTransition::OpenNew(Enrolled));
    }

    #[test]
    fn test_drifted_profile_with_matching_enrollment() {
        // Profile says REGISTERED, open enrollment already ENROLLED: only the profile moves
        let change = plan_transition(Registered, Some(Enrolled), Enrolled);
        assert_eq!(change.transition, EnrollmentTransition::NoChange);
        assert!(!change.is_noop());
    }
}
