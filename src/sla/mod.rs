//! Service-level clocks for new jobs.

pub mod calculator;
pub mod tracker;

pub use calculator::deadline;
pub use tracker::{SlaRequest, SlaStart, SlaTerms, sweep_breaches, urgent_hours};
