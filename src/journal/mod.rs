//! Provenance: BLAKE3 attribute hashing and the append-only JSONL journal.

pub mod eventlog;
pub mod hasher;
