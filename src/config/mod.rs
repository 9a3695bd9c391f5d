//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast on malformed values. The database
//! URL is wrapped in secrecy::SecretString since it may carry credentials
//! for remote deployments.

pub mod secrets;

use std::path::PathBuf;

use crate::engine::DEFAULT_MAX_FAILURES;
use crate::error::{Error, Result};
use secrecy::SecretString;

/// Name of the SQLite file created inside the project directory.
pub const DATABASE_FILE: &str = "features.db";

#[derive(Debug)]
pub struct Config {
    /// Directory holding the backlog database and any legacy feature list.
    pub project_dir: PathBuf,
    pub database_url: SecretString,
    /// Stuck-loop threshold reported back to session drivers.
    pub max_feature_failures: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let project_dir = PathBuf::from(std::env::var("PROJECT_DIR").unwrap_or_else(|_| ".".into()));

        let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}", project_dir.join(DATABASE_FILE).display())
        });

        let max_feature_failures = match std::env::var("MAX_FEATURE_FAILURES") {
            Ok(raw) => parse_threshold(&raw)?,
            Err(_) => DEFAULT_MAX_FAILURES,
        };

        Ok(Self {
            project_dir,
            database_url: SecretString::from(database_url),
            max_feature_failures,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn parse_threshold(raw: &str) -> Result<u32> {
    match raw.trim().parse::<u32>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(Error::Config(format!(
            "MAX_FEATURE_FAILURES must be a positive integer, got '{raw}'"
        ))),
    }
}
