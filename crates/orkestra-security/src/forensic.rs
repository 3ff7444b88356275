use crate::redact::Redactor;
use chrono::{DateTime, Utc};
use orkestra_core::{OrkestraError, OrkestraResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

/// `previous_hash` of the first entry in every ledger.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Outcome recorded for a ledger action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOutcome {
    /// The action succeeded.
    Success,
    /// The action failed.
    Failure,
    /// The action failed and will be retried.
    Retry,
    /// The action was skipped.
    Skipped,
    /// The action was escalated to a human.
    Escalated,
    /// The action was refused by policy.
    Denied,
    /// The action ran without containment.
    DryRun,
    /// Informational record.
    Info,
}

/// A persisted ledger entry. Field order is the on-disk order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForensicLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: String,
    pub agent_id: String,
    pub session_id: Uuid,
    pub chain_of_thought: String,
    pub action_type: String,
    pub action_payload: serde_json::Value,
    pub outcome: LedgerOutcome,
}

/// An action to append. The writer assigns id, timestamp and chain hash.
#[derive(Debug, Clone)]
pub struct LedgerRecord {
    pub agent_id: String,
    pub action_type: String,
    pub chain_of_thought: String,
    pub action_payload: serde_json::Value,
    pub outcome: LedgerOutcome,
}

impl LedgerRecord {
    /// A record with empty reasoning and payload.
    pub fn new(
        agent_id: impl Into<String>,
        action_type: impl Into<String>,
        outcome: LedgerOutcome,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            action_type: action_type.into(),
            chain_of_thought: String::new(),
            action_payload: serde_json::Value::Null,
            outcome,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.chain_of_thought = reasoning.into();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.action_payload = payload;
        self
    }
}

enum LedgerCommand {
    Append(LedgerRecord),
    Flush(oneshot::Sender<()>),
}

/// Hex-encoded SHA-256 of a ledger line (without its trailing newline).
pub fn hash_line(line: &[u8]) -> String {
    hex::encode(Sha256::digest(line))
}

/// Append-only, hash-chained ledger of every orchestration action.
///
/// Appends are handed to a single background writer, so chain order is the
/// order of [`ForensicLogger::record`] calls. Writing is best-effort: failures
/// are logged and never surface to the caller.
pub struct ForensicLogger {
    tx: mpsc::UnboundedSender<LedgerCommand>,
    path: PathBuf,
    session_id: Uuid,
    redactor: Redactor,
}

impl ForensicLogger {
    /// Open (or create) the ledger at `path`. Spawns the background writer,
    /// which resumes the chain from the file's last line.
    pub fn new(path: PathBuf, session_id: Uuid) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LedgerCommand>();
        let writer_path = path.clone();

        tokio::spawn(async move {
            let mut writer = ChainWriter::open(writer_path, session_id).await;
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    LedgerCommand::Append(record) => {
                        if let Err(e) = writer.append(record).await {
                            error!(path = %writer.path.display(), error = %e, "forensic ledger write failed");
                        }
                    }
                    LedgerCommand::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });

        Self {
            tx,
            path,
            session_id,
            redactor: Redactor::new(),
        }
    }

    /// Replace the default redaction rules.
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Path of the ledger file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Session all entries of this logger belong to.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Redact and enqueue a record for appending.
    pub fn record(&self, record: LedgerRecord) {
        let record = LedgerRecord {
            chain_of_thought: self.redactor.redact_text(&record.chain_of_thought),
            action_payload: self.redactor.redact_value(&record.action_payload),
            ..record
        };
        info!(
            session_id = %self.session_id,
            agent_id = %record.agent_id,
            action = %record.action_type,
            outcome = ?record.outcome,
            "forensic"
        );
        if self.tx.send(LedgerCommand::Append(record)).is_err() {
            warn!("forensic ledger writer has stopped; entry dropped");
        }
    }

    /// Wait until every record enqueued so far has been processed.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(LedgerCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

struct ChainWriter {
    path: PathBuf,
    session_id: Uuid,
    last_hash: String,
    file: Option<File>,
}

impl ChainWriter {
    async fn open(path: PathBuf, session_id: Uuid) -> Self {
        let last_hash = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes
                .split(|b| *b == b'\n')
                .filter(|line| !line.is_empty())
                .last()
                .map(hash_line)
                .unwrap_or_else(|| GENESIS_HASH.to_string()),
            Err(_) => GENESIS_HASH.to_string(),
        };
        Self {
            path,
            session_id,
            last_hash,
            file: None,
        }
    }

    async fn append(&mut self, record: LedgerRecord) -> OrkestraResult<()> {
        let entry = ForensicLogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            previous_hash: self.last_hash.clone(),
            agent_id: record.agent_id,
            session_id: self.session_id,
            chain_of_thought: record.chain_of_thought,
            action_type: record.action_type,
            action_payload: record.action_payload,
            outcome: record.outcome,
        };
        let line = serde_json::to_string(&entry)?;

        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            self.file = Some(file);
        }
        let Some(file) = self.file.as_mut() else {
            return Err(OrkestraError::Ledger("ledger file unavailable".into()));
        };

        let mut bytes = line.into_bytes();
        let hash = hash_line(&bytes);
        bytes.push(b'\n');
        file.write_all(&bytes).await?;
        file.flush().await?;

        self.last_hash = hash;
        Ok(())
    }
}

/// Result of replaying a ledger file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    pub valid: bool,
    pub total_entries: usize,
    /// Entries before the break; everything from `broken_at` on is unverifiable.
    pub verified_entries: usize,
    pub broken_at: Option<usize>,
    pub reason: Option<String>,
}

impl ChainVerification {
    fn intact(total: usize) -> Self {
        Self {
            valid: true,
            total_entries: total,
            verified_entries: total,
            broken_at: None,
            reason: None,
        }
    }

    fn broken(total: usize, index: usize, reason: String) -> Self {
        Self {
            valid: false,
            total_entries: total,
            verified_entries: index,
            broken_at: Some(index),
            reason: Some(reason),
        }
    }

    /// The integrity alarm for a broken chain, if any.
    pub fn alarm(&self, path: &Path) -> Option<IntegrityAlarm> {
        self.broken_at.map(|broken_at| IntegrityAlarm {
            path: path.to_path_buf(),
            broken_at,
            reason: self.reason.clone().unwrap_or_default(),
        })
    }
}

/// Raised when a ledger fails verification. Distinct from task errors.
#[derive(Debug, Clone, thiserror::Error)]
#[error("ledger {} integrity broken at entry {broken_at}: {reason}", .path.display())]
pub struct IntegrityAlarm {
    pub path: PathBuf,
    pub broken_at: usize,
    pub reason: String,
}

/// Replay a ledger and check every hash link.
///
/// Entry `i` is reported broken when its bytes no longer hash to entry
/// `i + 1`'s `previous_hash`, when it cannot be parsed, or (for entry 0)
/// when it does not point at [`GENESIS_HASH`]. A missing file is an empty,
/// valid chain.
pub async fn verify_chain(path: &Path) -> OrkestraResult<ChainVerification> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ChainVerification::intact(0))
        }
        Err(e) => {
            return Err(OrkestraError::Ledger(format!(
                "cannot read {}: {e}",
                path.display()
            )))
        }
    };

    let lines: Vec<&[u8]> = bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .collect();
    let total = lines.len();

    let mut expected = GENESIS_HASH.to_string();
    for (index, line) in lines.iter().enumerate() {
        let entry: ForensicLogEntry = match serde_json::from_slice(line) {
            Ok(entry) => entry,
            Err(e) => {
                return Ok(ChainVerification::broken(
                    total,
                    index,
                    format!("entry {index} is not a valid ledger entry: {e}"),
                ))
            }
        };
        if entry.previous_hash != expected {
            let (culprit, reason) = if index == 0 {
                (0, "first entry does not point at the genesis hash".to_string())
            } else {
                (
                    index - 1,
                    format!(
                        "entry {} does not hash to entry {index}'s previous_hash",
                        index - 1
                    ),
                )
            };
            return Ok(ChainVerification::broken(total, culprit, reason));
        }
        expected = hash_line(line);
    }

    Ok(ChainVerification::intact(total))
}
