//! Security primitives for the Orkestra workspace.
//!
//! Provides the tamper-evident forensic ledger and the secret redaction used
//! before anything reaches disk.
//!
//! # Main types
//!
//! - [`ForensicLogger`]: Append-only, SHA-256 hash-chained JSON-Lines ledger.
//! - [`ForensicLogEntry`]: A single persisted ledger entry.
//! - [`ChainVerification`]: Result of replaying a ledger file.
//! - [`Redactor`]: Pattern-based secret redaction for text and JSON payloads.

/// Hash-chained forensic ledger.
pub mod forensic;
/// Secret redaction.
pub mod redact;

pub use forensic::{
    verify_chain, ChainVerification, ForensicLogEntry, ForensicLogger, IntegrityAlarm,
    LedgerOutcome, LedgerRecord, GENESIS_HASH,
};
pub use redact::Redactor;
