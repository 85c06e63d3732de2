//! Runtime-editable configuration: the snapshot the router reads and the
//! provider that caches it.

pub mod provider;
pub mod snapshot;

pub use provider::SettingsProvider;
pub use snapshot::{
    BusinessCalendar, ConfigSnapshot, InsurerOverride, ResolvedSla, SlaOverride, domain_matches,
    is_sender_allowed,
};
