// School Administration System - Core Library
// Exposes all modules for use by the API server and tests

pub mod config;
pub mod db;
pub mod error;
pub mod entities;
pub mod validation;
pub mod status_mapping;  // Subscription status -> enrollment status
pub mod enrollment;
pub mod billing;
pub mod students;
pub mod batches;
pub mod siblings;        // Sibling detection engine
pub mod attendance;
pub mod reconciliation;  // Billing vs enrollment drift
pub mod webhook;         // Payment provider webhooks
pub mod legacy;          // One-shot migration of the flat students table

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::{setup_database, insert_event, record_event, get_events_for_entity, Event};
pub use error::{AdminError, Result};
pub use entities::{
    Person, ContactPoint, ContactType,
    Program, ProgramProfile, EnrollmentStatus, Enrollment, Batch,
    BillingAccount, Subscription, SubscriptionStatus, BillingAssignment,
    SiblingRelationship, DetectionMethod,
    AttendanceSession, AttendanceRecord, AttendanceStatus,
};
pub use status_mapping::{map_subscription_status, StatusChange};
pub use billing::BillingService;
pub use students::{
    NewStudent, StudentDetail, StudentFilter, StudentService, StudentSummary, ExportFormat,
};
pub use batches::{BatchService, NewBatch};
pub use siblings::{SiblingDetectionEngine, SiblingMatch, SiblingService};
pub use attendance::{AttendanceService, AttendanceCounts};
pub use reconciliation::{
    ReconciliationEngine, ReconciliationReport, ReconciliationResult,
    Discrepancy, DiscrepancyCategory,
};
pub use webhook::{WebhookOutcome, WebhookProcessor};
pub use legacy::{migrate_legacy_students, MigrationReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
