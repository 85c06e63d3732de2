//! Inbound message pipeline.
//!
//! Every fetched message flows through:
//! 1. `Poller::poll_once()`: transport fetch since the watermark
//! 2. `MessageProcessor::process()`: staged fact gathering
//! 3. `router::route()`: ordered pure rules, first terminal verdict wins
//! 4. Ledger claim, then side effects (sends, SLA clock, drafts, complaints)
//!
//! **Nothing is sent before the ledger row is claimed.** A redelivered
//! message finds its row and stops.

pub mod drafts;
pub mod ledger;
pub mod poller;
pub mod processor;
pub mod router;
pub mod types;
