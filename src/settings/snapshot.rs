//! Immutable configuration snapshot consumed by the router.
//!
//! A snapshot is built from `RuntimeConfig` defaults and then overlaid with
//! rows from the `settings` table. Each row is applied independently: a row
//! that fails to parse is logged and skipped so one bad edit cannot take the
//! whole router down. Two exceptions fail closed instead. A malformed insurer
//! SLA override is kept as [`InsurerOverride::Malformed`], and an unreadable
//! allow-list or insurer toggle row is recorded in `malformed_gates` so the
//! new-job gate denies every sender until the row is fixed.

use std::collections::BTreeMap;

use chrono::Weekday;
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::warn;

use crate::config::RuntimeConfig;
use crate::error::ConfigError;

// ── Keys ────────────────────────────────────────────────────────────

pub const KEY_MONITORED_MAILBOX: &str = "monitored_mailbox";
pub const KEY_AUTHORIZED_SENDERS: &str = "authorized_senders";
pub const KEY_INSURER_ENABLED: &str = "insurer_enabled";
pub const KEY_BUSINESS_HOURS: &str = "business_hours";
pub const KEY_AUTO_REPLY_ENABLED: &str = "auto_reply_enabled";
pub const KEY_INSURER_SLA_OVERRIDES: &str = "insurer_sla_overrides";
pub const KEY_DEFAULT_SLA_HOURS: &str = "default_sla_hours";
pub const KEY_DEFAULT_BUSINESS_HOURS_ONLY: &str = "default_business_hours_only";
pub const KEY_DEFAULT_COMMITMENT: &str = "default_commitment";
pub const KEY_ESCALATION_ADDRESS: &str = "escalation_address";

/// Every key the snapshot reads.
pub const SNAPSHOT_KEYS: &[&str] = &[
    KEY_MONITORED_MAILBOX,
    KEY_AUTHORIZED_SENDERS,
    KEY_INSURER_ENABLED,
    KEY_BUSINESS_HOURS,
    KEY_AUTO_REPLY_ENABLED,
    KEY_INSURER_SLA_OVERRIDES,
    KEY_DEFAULT_SLA_HOURS,
    KEY_DEFAULT_BUSINESS_HOURS_ONLY,
    KEY_DEFAULT_COMMITMENT,
    KEY_ESCALATION_ADDRESS,
];

/// Keys that gate new-job acknowledgments.
const GATE_KEYS: &[&str] = &[KEY_AUTHORIZED_SENDERS, KEY_INSURER_ENABLED];

// ── Business calendar ───────────────────────────────────────────────

/// Working-hours calendar used for business-hours SLA deadlines.
#[derive(Debug, Clone, PartialEq)]
pub struct BusinessCalendar {
    pub enabled: bool,
    pub timezone: Tz,
    pub weekdays: Vec<Weekday>,
    /// First working hour (inclusive), 0-23.
    pub start_hour: u32,
    /// End of the working day (exclusive), 1-24.
    pub end_hour: u32,
}

impl Default for BusinessCalendar {
    fn default() -> Self {
        Self {
            enabled: true,
            timezone: chrono_tz::Europe::London,
            weekdays: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            start_hour: 9,
            end_hour: 17,
        }
    }
}

impl BusinessCalendar {
    /// A calendar with no working days or an empty working window can never
    /// consume hours.
    pub fn is_valid(&self) -> bool {
        !self.weekdays.is_empty() && self.start_hour < self.end_hour && self.end_hour <= 24
    }

    pub fn is_business_day(&self, day: Weekday) -> bool {
        self.weekdays.contains(&day)
    }
}

/// Stored form of the calendar row.
#[derive(Debug, Deserialize)]
struct CalendarRow {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    weekdays: Option<Vec<String>>,
    #[serde(default)]
    start_hour: Option<u32>,
    #[serde(default)]
    end_hour: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn parse_calendar(value: &serde_json::Value) -> Result<BusinessCalendar, ConfigError> {
    let row: CalendarRow =
        serde_json::from_value(value.clone()).map_err(|e| ConfigError::InvalidValue {
            key: KEY_BUSINESS_HOURS.into(),
            message: e.to_string(),
        })?;

    let defaults = BusinessCalendar::default();
    let timezone = match row.timezone {
        Some(name) => name.parse::<Tz>().map_err(|e| ConfigError::InvalidValue {
            key: KEY_BUSINESS_HOURS.into(),
            message: format!("unknown timezone '{name}': {e}"),
        })?,
        None => defaults.timezone,
    };
    let weekdays = match row.weekdays {
        Some(days) => days
            .iter()
            .map(|d| {
                d.parse::<Weekday>().map_err(|_| ConfigError::InvalidValue {
                    key: KEY_BUSINESS_HOURS.into(),
                    message: format!("unknown weekday '{d}'"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => defaults.weekdays,
    };

    Ok(BusinessCalendar {
        enabled: row.enabled,
        timezone,
        weekdays,
        start_hour: row.start_hour.unwrap_or(defaults.start_hour),
        end_hour: row.end_hour.unwrap_or(defaults.end_hour),
    })
}

// ── Insurer overrides ───────────────────────────────────────────────

/// Per-insurer SLA terms.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SlaOverride {
    pub hours: u32,
    #[serde(default = "default_true")]
    pub business_hours_only: bool,
    /// Commitment text; `{hours}` is substituted.
    #[serde(default)]
    pub commitment: Option<String>,
}

/// An override entry as loaded. Malformed entries are retained.
#[derive(Debug, Clone, PartialEq)]
pub enum InsurerOverride {
    Valid(SlaOverride),
    Malformed { reason: String },
}

fn parse_override(value: &serde_json::Value) -> InsurerOverride {
    match serde_json::from_value::<SlaOverride>(value.clone()) {
        Ok(o) if o.hours == 0 => InsurerOverride::Malformed {
            reason: "hours must be positive".into(),
        },
        Ok(o) => InsurerOverride::Valid(o),
        Err(e) => InsurerOverride::Malformed {
            reason: e.to_string(),
        },
    }
}

// ── Domain matching ─────────────────────────────────────────────────

/// True if `domain` is `key` or a subdomain of it (label boundary).
pub fn domain_matches(domain: &str, key: &str) -> bool {
    let domain = domain.trim().trim_end_matches('.').to_lowercase();
    let key = key.trim().trim_start_matches('@').trim_end_matches('.').to_lowercase();
    if key.is_empty() {
        return false;
    }
    domain == key || domain.ends_with(&format!(".{key}"))
}

/// Look up `domain` in a domain-keyed map: exact match first, then the
/// longest key that `domain` is a subdomain of.
fn resolve_domain<'a, V>(map: &'a BTreeMap<String, V>, domain: &str) -> Option<(&'a str, &'a V)> {
    let domain = domain.to_lowercase();
    if let Some((k, v)) = map.get_key_value(&domain) {
        return Some((k.as_str(), v));
    }
    map.iter()
        .filter(|(k, _)| domain_matches(&domain, k))
        .max_by_key(|(k, _)| k.len())
        .map(|(k, v)| (k.as_str(), v))
}

/// Check a sender against the allow-list.
///
/// - Empty list → allow all
/// - `*` in list → allow all
/// - `@domain.com` or `domain.com` → domain or subdomain match
/// - `user@domain.com` → exact address match
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() || allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email = email.trim().to_lowercase();
    let Some(domain) = email.rsplit_once('@').map(|(_, d)| d) else {
        return false;
    };
    allowed.iter().any(|a| {
        let a = a.trim();
        if a.contains('@') && !a.starts_with('@') {
            a.eq_ignore_ascii_case(&email)
        } else {
            domain_matches(domain, a)
        }
    })
}

// ── Snapshot ────────────────────────────────────────────────────────

/// Resolved SLA terms for one sender.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSla {
    /// Override key that matched, if any.
    pub matched_key: Option<String>,
    pub hours: u32,
    pub business_hours_only: bool,
    /// Commitment text template, `{hours}` not yet substituted.
    pub commitment: String,
}

/// Read-only view of runtime configuration.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub monitored_mailbox: String,
    pub authorized_senders: Vec<String>,
    pub insurer_enabled: BTreeMap<String, bool>,
    pub calendar: BusinessCalendar,
    pub auto_reply_enabled: bool,
    pub insurer_overrides: BTreeMap<String, InsurerOverride>,
    pub default_sla_hours: u32,
    pub default_business_hours_only: bool,
    pub default_commitment: String,
    pub escalation_address: String,
    /// Gate settings whose stored row could not be parsed.
    pub malformed_gates: Vec<String>,
}

impl ConfigSnapshot {
    /// Snapshot with no stored settings applied.
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            monitored_mailbox: config.monitored_mailbox.to_lowercase(),
            authorized_senders: Vec::new(),
            insurer_enabled: BTreeMap::new(),
            calendar: BusinessCalendar::default(),
            auto_reply_enabled: true,
            insurer_overrides: BTreeMap::new(),
            default_sla_hours: config.default_sla_hours,
            default_business_hours_only: config.default_business_hours_only,
            default_commitment: config.default_commitment_template.clone(),
            escalation_address: config.escalation_address.clone(),
            malformed_gates: Vec::new(),
        }
    }

    /// Record a stored row that failed to apply. Returns true if the key
    /// guards new-job acknowledgments, which then fail closed.
    pub fn mark_malformed(&mut self, key: &str) -> bool {
        if !GATE_KEYS.contains(&key) {
            return false;
        }
        if !self.malformed_gates.iter().any(|k| k == key) {
            self.malformed_gates.push(key.to_string());
        }
        true
    }

    fn gate_malformed(&self, key: &str) -> bool {
        self.malformed_gates.iter().any(|k| k == key)
    }

    /// Overlay one stored setting.
    pub fn apply(&mut self, key: &str, value: &serde_json::Value) -> Result<(), ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };

        match key {
            KEY_MONITORED_MAILBOX => {
                let s = value.as_str().ok_or_else(|| invalid("expected a string"))?;
                self.monitored_mailbox = s.trim().to_lowercase();
            }
            KEY_AUTHORIZED_SENDERS => {
                let list: Vec<String> = serde_json::from_value(value.clone())
                    .map_err(|e| invalid(&e.to_string()))?;
                self.authorized_senders = list
                    .into_iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            KEY_INSURER_ENABLED => {
                let map: BTreeMap<String, bool> = serde_json::from_value(value.clone())
                    .map_err(|e| invalid(&e.to_string()))?;
                self.insurer_enabled = map
                    .into_iter()
                    .map(|(k, v)| (k.trim().to_lowercase(), v))
                    .collect();
            }
            KEY_BUSINESS_HOURS => {
                self.calendar = parse_calendar(value)?;
            }
            KEY_AUTO_REPLY_ENABLED => {
                self.auto_reply_enabled =
                    value.as_bool().ok_or_else(|| invalid("expected a boolean"))?;
            }
            KEY_INSURER_SLA_OVERRIDES => {
                let map = value
                    .as_object()
                    .ok_or_else(|| invalid("expected an object keyed by domain"))?;
                self.insurer_overrides = map
                    .iter()
                    .map(|(k, v)| {
                        let parsed = parse_override(v);
                        if let InsurerOverride::Malformed { reason } = &parsed {
                            warn!(insurer = %k, reason = %reason, "Malformed SLA override retained");
                        }
                        (k.trim().to_lowercase(), parsed)
                    })
                    .collect();
            }
            KEY_DEFAULT_SLA_HOURS => {
                let hours = value
                    .as_u64()
                    .filter(|h| *h > 0)
                    .ok_or_else(|| invalid("expected a positive integer"))?;
                self.default_sla_hours =
                    u32::try_from(hours).map_err(|_| invalid("value out of range"))?;
            }
            KEY_DEFAULT_BUSINESS_HOURS_ONLY => {
                self.default_business_hours_only =
                    value.as_bool().ok_or_else(|| invalid("expected a boolean"))?;
            }
            KEY_DEFAULT_COMMITMENT => {
                let s = value.as_str().ok_or_else(|| invalid("expected a string"))?;
                self.default_commitment = s.to_string();
            }
            KEY_ESCALATION_ADDRESS => {
                let s = value.as_str().ok_or_else(|| invalid("expected a string"))?;
                self.escalation_address = s.trim().to_string();
            }
            other => {
                return Err(ConfigError::InvalidValue {
                    key: other.to_string(),
                    message: "unknown setting".into(),
                });
            }
        }
        Ok(())
    }

    /// True if the sender is the monitored mailbox itself.
    pub fn is_self(&self, sender: &str) -> bool {
        !self.monitored_mailbox.is_empty() && sender.trim().eq_ignore_ascii_case(&self.monitored_mailbox)
    }

    /// False for everyone while the stored allow-list is unreadable.
    pub fn is_sender_authorized(&self, sender: &str) -> bool {
        !self.gate_malformed(KEY_AUTHORIZED_SENDERS)
            && is_sender_allowed(&self.authorized_senders, sender)
    }

    /// Insurers absent from the map are enabled. None are while the stored
    /// toggle row is unreadable.
    pub fn is_insurer_enabled(&self, domain: &str) -> bool {
        if self.gate_malformed(KEY_INSURER_ENABLED) {
            return false;
        }
        resolve_domain(&self.insurer_enabled, domain)
            .map(|(_, enabled)| *enabled)
            .unwrap_or(true)
    }

    /// Resolve SLA terms for an insurer domain.
    ///
    /// A matching malformed override is a configuration error; the caller
    /// must not fall back to the defaults.
    pub fn resolve_sla(&self, domain: &str) -> Result<ResolvedSla, ConfigError> {
        match resolve_domain(&self.insurer_overrides, domain) {
            Some((key, InsurerOverride::Valid(o))) => Ok(ResolvedSla {
                matched_key: Some(key.to_string()),
                hours: o.hours,
                business_hours_only: o.business_hours_only,
                commitment: o
                    .commitment
                    .clone()
                    .unwrap_or_else(|| self.default_commitment.clone()),
            }),
            Some((key, InsurerOverride::Malformed { reason })) => Err(ConfigError::InvalidValue {
                key: format!("{KEY_INSURER_SLA_OVERRIDES}.{key}"),
                message: reason.clone(),
            }),
            None => Ok(ResolvedSla {
                matched_key: None,
                hours: self.default_sla_hours,
                business_hours_only: self.default_business_hours_only,
                commitment: self.default_commitment.clone(),
            }),
        }
    }
}
