//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// Process-level configuration read once at startup.
///
/// Values that an operator edits at runtime (allow-list, insurer overrides,
/// business calendar) live in the `settings` table instead; the fields here
/// only seed the defaults for those.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// How often the poller asks the transport for new mail.
    pub poll_interval: Duration,
    /// Overlap subtracted from the persisted fetch watermark.
    pub fetch_lookback: Duration,
    /// Upper bound on a single AI classification call.
    pub classifier_timeout: Duration,
    /// Bumping this invalidates every cached classification.
    pub classifier_version: String,
    /// AI results below this confidence are not cached.
    pub classifier_confidence_threshold: f32,
    /// Upper bound on a single outbound send.
    pub send_timeout: Duration,
    /// How long a configuration snapshot is reused before reloading.
    pub snapshot_ttl: Duration,
    /// The mailbox being polled. Mail from this address is ignored.
    /// Empty when `CLAIMS_MONITORED_MAILBOX` is unset; startup fills it in.
    pub monitored_mailbox: String,
    /// Where complaint alerts go.
    pub escalation_address: String,
    pub default_sla_hours: u32,
    pub default_business_hours_only: bool,
    /// `{hours}` is substituted with the resolved SLA hours.
    pub default_commitment_template: String,
    /// Directory for daily rolling log files (unset = stderr only).
    pub log_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/claim-intake.db"),
            poll_interval: Duration::from_secs(60),
            fetch_lookback: Duration::from_secs(600), // 10 minutes
            classifier_timeout: Duration::from_secs(20),
            classifier_version: "v1".to_string(),
            classifier_confidence_threshold: 0.7,
            send_timeout: Duration::from_secs(30),
            snapshot_ttl: Duration::from_secs(300), // 5 minutes
            monitored_mailbox: "claims@localhost".to_string(),
            escalation_address: "complaints@localhost".to_string(),
            default_sla_hours: 24,
            default_business_hours_only: true,
            default_commitment_template: "We will contact you within {hours} business hours"
                .to_string(),
            log_dir: None,
        }
    }
}

impl RuntimeConfig {
    /// Load from `CLAIMS_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    /// Zero is rejected for the poll interval and both timeouts.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let secs = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let positive_secs = |key: &str, default: Duration| {
            secs(key)
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let any_secs =
            |key: &str, default: Duration| secs(key).map(Duration::from_secs).unwrap_or(default);

        Self {
            db_path: lookup("CLAIMS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            poll_interval: positive_secs("CLAIMS_POLL_INTERVAL_SECS", defaults.poll_interval),
            fetch_lookback: any_secs("CLAIMS_FETCH_LOOKBACK_SECS", defaults.fetch_lookback),
            classifier_timeout: positive_secs(
                "CLAIMS_CLASSIFIER_TIMEOUT_SECS",
                defaults.classifier_timeout,
            ),
            classifier_version: lookup("CLAIMS_CLASSIFIER_VERSION")
                .unwrap_or(defaults.classifier_version),
            classifier_confidence_threshold: lookup("CLAIMS_CLASSIFIER_THRESHOLD")
                .and_then(|v| v.parse::<f32>().ok())
                .filter(|t| (0.0..=1.0).contains(t))
                .unwrap_or(defaults.classifier_confidence_threshold),
            send_timeout: positive_secs("CLAIMS_SEND_TIMEOUT_SECS", defaults.send_timeout),
            snapshot_ttl: any_secs("CLAIMS_SNAPSHOT_TTL_SECS", defaults.snapshot_ttl),
            monitored_mailbox: lookup("CLAIMS_MONITORED_MAILBOX")
                .map(|v| v.trim().to_lowercase())
                .unwrap_or_default(),
            escalation_address: lookup("CLAIMS_ESCALATION_ADDRESS")
                .unwrap_or(defaults.escalation_address),
            default_sla_hours: lookup("CLAIMS_DEFAULT_SLA_HOURS")
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|h| *h > 0)
                .unwrap_or(defaults.default_sla_hours),
            default_business_hours_only: lookup("CLAIMS_BUSINESS_HOURS_ONLY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.default_business_hours_only),
            default_commitment_template: lookup("CLAIMS_COMMITMENT_TEMPLATE")
                .unwrap_or(defaults.default_commitment_template),
            log_dir: lookup("CLAIMS_LOG_DIR").map(PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert_eq!(config.default_sla_hours, 24);
        assert!(config.default_business_hours_only);
        assert!(config.default_commitment_template.contains("{hours}"));
        assert!(config.classifier_confidence_threshold > 0.0);
        assert!(config.log_dir.is_none());
    }

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn zero_poll_interval_falls_back() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("CLAIMS_POLL_INTERVAL_SECS", "0"),
            ("CLAIMS_SEND_TIMEOUT_SECS", "0"),
            ("CLAIMS_SNAPSHOT_TTL_SECS", "0"),
        ]));
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.send_timeout, Duration::from_secs(30));
        assert_eq!(config.snapshot_ttl, Duration::ZERO);
    }

    #[test]
    fn env_values_override_defaults() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("CLAIMS_POLL_INTERVAL_SECS", "15"),
            ("CLAIMS_MONITORED_MAILBOX", " Claims@Assessors.example "),
            ("CLAIMS_DEFAULT_SLA_HOURS", "0"),
        ]));
        assert_eq!(config.poll_interval, Duration::from_secs(15));
        assert_eq!(config.monitored_mailbox, "claims@assessors.example");
        assert_eq!(config.default_sla_hours, 24);
    }

    #[test]
    fn unset_mailbox_is_left_empty() {
        let config = RuntimeConfig::from_lookup(lookup(&[]));
        assert!(config.monitored_mailbox.is_empty());
    }
}
