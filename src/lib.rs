//! Webtier: reconciliation engine for a load-balanced, autoscaling web tier.
//!
//! Resolves read-only lookups, builds the resource dependency graph, plans
//! create-before-destroy replacements against observed state, applies plans
//! concurrently through a provider, and tracks instance membership with a
//! health-driven state machine. BLAKE3 attribute hashing, JSONL provenance.

pub mod core;
pub mod health;
pub mod journal;
pub mod provider;
