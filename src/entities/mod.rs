// Entity Models
//
// Each entity has:
// - Stable identity (UUID text) that never changes
// - A `COLUMNS` list and `from_row` so services share one row mapping
// - String-backed enums stored as TEXT and parsed back with FromStr

pub mod person;
pub mod program;
pub mod billing;
pub mod sibling;
pub mod attendance;

pub use person::{ContactPoint, ContactType, Person};
pub use program::{Batch, Enrollment, EnrollmentStatus, Program, ProgramProfile};
pub use billing::{
    BillingAccount, BillingAssignment, Subscription, SubscriptionHistoryEntry, SubscriptionStatus,
};
pub use sibling::{DetectionMethod, SiblingRelationship};
pub use attendance::{AttendanceRecord, AttendanceSession, AttendanceStatus};

/// A TEXT value that does not name any variant of the target enum
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        ParseEnumError {
            kind,
            value: value.to_string(),
        }
    }
}

impl From<ParseEnumError> for crate::error::AdminError {
    fn from(err: ParseEnumError) -> Self {
        crate::error::AdminError::Validation(vec![err.to_string()])
    }
}
