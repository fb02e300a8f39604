use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::{Result, TabulaError};

/// Default cap on artifacts held for a channel that has no subscriber yet.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Broker configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Pending artifacts kept per channel before the oldest is dropped.
    /// `0` keeps everything.
    pub max_pending_per_channel: usize,
    /// Pending artifacts older than this are discarded when their queue is touched.
    pub pending_ttl: Option<Duration>,
    /// Filter directive used by `telemetry::init_tracing` when RUST_LOG is unset.
    pub log_filter: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_pending_per_channel: std::env::var("TABULA_MAX_PENDING")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(DEFAULT_MAX_PENDING),
            pending_ttl: std::env::var("TABULA_PENDING_TTL_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            log_filter: std::env::var("TABULA_LOG")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "info,tabula_core=info".to_string()),
        }
    }
}

impl BrokerConfig {
    /// Unbounded queues, no expiry.
    pub fn unbounded() -> Self {
        Self {
            max_pending_per_channel: 0,
            pending_ttl: None,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file (path via TABULA_CONFIG or ./tabula.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("TABULA_CONFIG").unwrap_or_else(|_| "tabula.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "config", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match Self::load_from(p) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(target: "config", error = %e, "Failed to load TOML; using defaults");
                default
            }
        }
    }

    /// Strict variant of [`BrokerConfig::load`] for an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let t = toml::from_str::<TabulaToml>(s)
            .map_err(|e| TabulaError::Config(e.to_string()))?;
        Ok(t.overlay(Self::default()))
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct TabulaToml {
    pub broker: Option<BrokerToml>,
    pub log: Option<LogToml>,
}

impl TabulaToml {
    fn overlay(self, mut base: BrokerConfig) -> BrokerConfig {
        if let Some(b) = self.broker {
            b.apply(&mut base);
        }
        if let Some(l) = self.log {
            if let Some(f) = l.filter.filter(|f| !f.is_empty()) {
                base.log_filter = f;
            }
        }
        base
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct BrokerToml {
    pub max_pending_per_channel: Option<usize>,
    pub pending_ttl_ms: Option<u64>,
}

impl BrokerToml {
    fn apply(self, b: &mut BrokerConfig) {
        if let Some(x) = self.max_pending_per_channel {
            b.max_pending_per_channel = x;
        }
        if let Some(x) = self.pending_ttl_ms {
            // 0 switches expiry off
            b.pending_ttl = (x > 0).then(|| Duration::from_millis(x));
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct LogToml {
    pub filter: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn overlay_replaces_only_given_keys() {
        let cfg = BrokerConfig::from_toml_str(
            r#"
            [broker]
            max_pending_per_channel = 8
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_pending_per_channel, 8);
        assert_eq!(cfg.log_filter, BrokerConfig::default().log_filter);
    }

    #[test]
    fn ttl_zero_disables_expiry() {
        let cfg = BrokerConfig::from_toml_str(
            r#"
            [broker]
            pending_ttl_ms = 0
            [log]
            filter = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.pending_ttl, None);
        assert_eq!(cfg.log_filter, "debug");
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        let err = BrokerConfig::from_toml_str("[broker\nmax = ").unwrap_err();
        assert!(matches!(err, TabulaError::Config(_)));
    }

    #[test]
    fn load_from_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[broker]\npending_ttl_ms = 250").unwrap();
        let cfg = BrokerConfig::load_from(file.path()).unwrap();
        assert_eq!(cfg.pending_ttl, Some(Duration::from_millis(250)));
    }
}
