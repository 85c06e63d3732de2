//! Claim intake: routes inbound insurer and customer email.

pub mod audit;
pub mod classify;
pub mod config;
pub mod error;
pub mod llm;
pub mod model;
pub mod pipeline;
pub mod settings;
pub mod sla;
pub mod store;
pub mod templates;
pub mod transport;
