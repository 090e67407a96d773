//! CRM account extraction and enrichment.
//!
//! Pulls account, membership, and event data from a NeonCRM-style REST API,
//! enriches a base account table with concurrent per-account lookups, joins
//! event attendance, and writes per-account-type CSV exports.
//!
//! Modules:
//! - client: paced, authenticated GET with bounded retry
//! - accounts: paginated account listing per user type
//! - membership / enrich: concurrent per-account enrichment fan-out
//! - events: event attendance join
//! - export: column filtering and CSV output
//! - pipeline: end-to-end orchestration

pub mod accounts;
pub mod client;
pub mod config;
pub mod enrich;
pub mod error;
pub mod events;
pub mod export;
pub mod membership;
pub mod pipeline;
pub mod table;

#[cfg(test)]
pub(crate) mod testutil;
