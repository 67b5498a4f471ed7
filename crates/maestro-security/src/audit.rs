use chrono::{DateTime, Utc};
use maestro_core::AgentId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

/// Entries retained in memory for inspection.
const RECENT_CAPACITY: usize = 4096;

/// Hash used as predecessor of the first entry.
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One link in the hash chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the log, starting at 0.
    pub sequence: u64,
    /// When the entry was appended.
    pub timestamp: DateTime<Utc>,
    /// Execution the action belongs to, if any.
    pub execution_id: Option<Uuid>,
    /// Agent that acted, if any.
    pub agent_id: Option<AgentId>,
    /// What happened, e.g. `escalation` or `self_heal`.
    pub action: String,
    /// Action-specific payload.
    pub details: serde_json::Value,
    /// How the action ended.
    pub outcome: AuditOutcome,
    /// Hash of the previous entry, or the genesis hash.
    pub prev_hash: String,
    /// SHA-256 over this entry's fields and `prev_hash`.
    pub hash: String,
}

impl AuditEntry {
    fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(self.sequence.to_be_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        if let Some(id) = self.execution_id {
            hasher.update(id.as_bytes());
        }
        if let Some(agent) = self.agent_id {
            hasher.update(agent.0.to_be_bytes());
        }
        hasher.update(self.action.as_bytes());
        hasher.update(self.details.to_string().as_bytes());
        hasher.update(self.outcome.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// How an audited action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// Action completed.
    Success,
    /// Action failed in an expected way.
    Failure,
    /// Handed to a higher layer.
    Escalated,
    /// Unexpected error.
    Error,
}

impl AuditOutcome {
    fn as_str(self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
            AuditOutcome::Escalated => "escalated",
            AuditOutcome::Error => "error",
        }
    }
}

enum WriterCommand {
    Append(String),
    Flush(oneshot::Sender<()>),
}

struct ChainState {
    next_sequence: u64,
    last_hash: String,
    recent: VecDeque<AuditEntry>,
}

/// Append-only audit log that records escalations and workflow decisions.
#[derive(Clone)]
pub struct AuditLog {
    tx: Option<mpsc::UnboundedSender<WriterCommand>>,
    state: Arc<Mutex<ChainState>>,
}

impl AuditLog {
    /// Create a new AuditLog. Spawns a background task that appends entries to
    /// `<log_dir>/audit.jsonl`.
    pub fn new(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriterCommand>();

        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                warn!(error = %e, dir = %log_dir.display(), "Failed to create audit directory");
            }
            let log_file = log_dir.join("audit.jsonl");
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .await
            {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!(error = %e, file = %log_file.display(), "Audit file unavailable, entries kept in memory only");
                    None
                }
            };

            while let Some(cmd) = rx.recv().await {
                match cmd {
                    WriterCommand::Append(line) => {
                        if let Some(f) = file.as_mut() {
                            if let Err(e) = f.write_all(line.as_bytes()).await {
                                warn!(error = %e, "Failed to append audit entry");
                            }
                        }
                    }
                    WriterCommand::Flush(done) => {
                        if let Some(f) = file.as_mut() {
                            let _ = f.flush().await;
                        }
                        let _ = done.send(());
                    }
                }
            }
        });

        Self {
            tx: Some(tx),
            state: Arc::new(Mutex::new(Self::empty_chain())),
        }
    }

    /// An audit log that keeps entries in memory only.
    pub fn in_memory() -> Self {
        Self {
            tx: None,
            state: Arc::new(Mutex::new(Self::empty_chain())),
        }
    }

    fn empty_chain() -> ChainState {
        ChainState {
            next_sequence: 0,
            last_hash: GENESIS_HASH.to_string(),
            recent: VecDeque::new(),
        }
    }

    /// Append an entry. Never blocks and never fails; write errors are logged
    /// by the background writer.
    pub fn log_action(
        &self,
        execution_id: Option<Uuid>,
        agent_id: Option<AgentId>,
        action: impl Into<String>,
        details: serde_json::Value,
        outcome: AuditOutcome,
    ) -> AuditEntry {
        let entry = {
            let mut state = self.state.lock();
            let mut entry = AuditEntry {
                sequence: state.next_sequence,
                timestamp: Utc::now(),
                execution_id,
                agent_id,
                action: action.into(),
                details,
                outcome,
                prev_hash: state.last_hash.clone(),
                hash: String::new(),
            };
            entry.hash = entry.digest();
            state.next_sequence += 1;
            state.last_hash.clone_from(&entry.hash);
            if state.recent.len() == RECENT_CAPACITY {
                state.recent.pop_front();
            }
            state.recent.push_back(entry.clone());
            entry
        };

        info!(
            sequence = entry.sequence,
            action = %entry.action,
            outcome = ?entry.outcome,
            "audit"
        );

        if let Some(tx) = &self.tx {
            match serde_json::to_string(&entry) {
                Ok(line) => {
                    let _ = tx.send(WriterCommand::Append(format!("{line}\n")));
                }
                Err(e) => warn!(error = %e, "Failed to serialize audit entry"),
            }
        }
        entry
    }

    /// Recent entries, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.state.lock().recent.iter().cloned().collect()
    }

    /// Recent entries for one execution.
    pub fn entries_for(&self, execution_id: Uuid) -> Vec<AuditEntry> {
        self.state
            .lock()
            .recent
            .iter()
            .filter(|e| e.execution_id == Some(execution_id))
            .cloned()
            .collect()
    }

    /// Total number of entries appended since creation.
    pub fn len(&self) -> u64 {
        self.state.lock().next_sequence
    }

    /// Whether nothing was appended yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every entry appended so far has reached the file.
    pub async fn flush(&self) {
        if let Some(tx) = &self.tx {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(WriterCommand::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
    }

    /// Check that a sequence of entries forms an unbroken hash chain.
    pub fn verify_chain(entries: &[AuditEntry]) -> bool {
        entries.windows(2).all(|w| w[1].prev_hash == w[0].hash)
            && entries.iter().all(|e| e.digest() == e.hash)
    }
}
