//! Application configuration: database path, listen address, per-program webhook secrets.

use serde::Deserialize;

use crate::entities::Program;
use crate::error::{AdminError, Result};

pub const DEFAULT_DATABASE_PATH: &str = "school_admin.db";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
/// Webhook signatures older than this are rejected as replays.
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;
pub const DEFAULT_SIBLING_THRESHOLD: f64 = 0.75;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct AppConfig {
    /// SQLite file. Read from SCHOOL_ADMIN_DATABASE_PATH.
    #[serde(default)]
    pub database_path: Option<String>,

    /// Listen address. Read from SCHOOL_ADMIN_BIND_ADDR.
    #[serde(default)]
    pub bind_addr: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // Payment provider webhooks (one signing secret per program)
    // ─────────────────────────────────────────────────────────────────────────
    /// Read from SCHOOL_ADMIN_MAHAD_WEBHOOK_SECRET.
    #[serde(default)]
    pub mahad_webhook_secret: Option<String>,

    /// Read from SCHOOL_ADMIN_DUGSI_WEBHOOK_SECRET.
    #[serde(default)]
    pub dugsi_webhook_secret: Option<String>,

    /// Read from SCHOOL_ADMIN_WEBHOOK_TOLERANCE_SECS.
    #[serde(default)]
    pub webhook_tolerance_secs: Option<i64>,

    /// Minimum confidence for automatic sibling detection.
    /// Read from SCHOOL_ADMIN_SIBLING_THRESHOLD.
    #[serde(default)]
    pub sibling_threshold: Option<f64>,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut c = config::Config::builder();
        c = c.add_source(config::Environment::with_prefix("SCHOOL_ADMIN"));
        if let Ok(path) = std::env::var("SCHOOL_ADMIN_CONFIG") {
            c = c.add_source(config::File::with_name(&path));
        }
        let cfg: Self = c.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if let Some(t) = self.sibling_threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(AdminError::Config(format!(
                    "sibling_threshold must be within 0..=1, got {}",
                    t
                )));
            }
        }
        if let Some(secs) = self.webhook_tolerance_secs {
            if secs <= 0 {
                return Err(AdminError::Config(
                    "webhook_tolerance_secs must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn database_path_or_default(&self) -> String {
        self.database_path
            .clone()
            .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string())
    }

    pub fn bind_addr_or_default(&self) -> String {
        self.bind_addr
            .clone()
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
    }

    pub fn webhook_tolerance_secs_or_default(&self) -> i64 {
        self.webhook_tolerance_secs
            .unwrap_or(DEFAULT_WEBHOOK_TOLERANCE_SECS)
    }

    pub fn sibling_threshold_or_default(&self) -> f64 {
        self.sibling_threshold.unwrap_or(DEFAULT_SIBLING_THRESHOLD)
    }

    /// Signing secret for a program's webhook endpoint, if configured.
    pub fn webhook_secret(&self, program: Program) -> Option<&str> {
        match program {
            Program::Mahad => self.mahad_webhook_secret.as_deref(),
            Program::Dugsi => self.dugsi_webhook_secret.as_deref(),
        }
        .filter(|s| !s.is_empty())
    }
}
