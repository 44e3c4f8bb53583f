use std::path::PathBuf;
use std::str::FromStr;

use chrono::{FixedOffset, Offset, Utc};

/// Server settings, read from `ROOMBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Shared secret every login must present.
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// Offset from UTC, in minutes, at which "today" is computed.
    pub utc_offset_minutes: i32,
    /// Administrator created at startup when no user has this email.
    pub admin_email: Option<String>,
    pub admin_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5480,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "roombook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            utc_offset_minutes: 0,
            admin_email: None,
            admin_name: "Administrator".into(),
        }
    }
}

fn parsed<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Malformed numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("ROOMBOOK_{name}"));
        let d = Self::default();
        Self {
            port: parsed(var("PORT"), d.port),
            bind: var("BIND").unwrap_or(d.bind),
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: var("PASSWORD").unwrap_or(d.password),
            max_connections: parsed(var("MAX_CONNECTIONS"), d.max_connections).max(1),
            compact_threshold: parsed(var("COMPACT_THRESHOLD"), d.compact_threshold),
            metrics_port: var("METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            utc_offset_minutes: parsed(var("UTC_OFFSET_MINUTES"), d.utc_offset_minutes),
            admin_email: var("ADMIN_EMAIL").filter(|s| !s.trim().is_empty()),
            admin_name: var("ADMIN_NAME").unwrap_or(d.admin_name),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roombook.wal")
    }

    /// Out-of-range offsets fall back to UTC.
    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix())
    }
}
