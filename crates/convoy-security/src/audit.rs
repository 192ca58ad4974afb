use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One line of the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// When the action happened.
    pub timestamp: DateTime<Utc>,
    /// Who acted (identity subject or agent id).
    pub actor: String,
    /// Dotted action name, e.g. `task.create` or `approval.approve`.
    pub action: String,
    /// What was acted on (task id, approval id, agent id).
    pub target: Option<String>,
    /// Free-form context for the action.
    pub details: serde_json::Value,
    /// How the action ended.
    pub outcome: AuditOutcome,
}

/// Result recorded with an [`AuditEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// The action went through.
    Success,
    /// Refused for lack of role or credentials.
    Denied,
    /// Allowed but failed while running.
    Error,
}

/// Append-only JSONL audit trail.
///
/// Entries are handed to a background task that appends them, in order, to
/// `audit.jsonl` inside the log directory.
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditEntry>,
    path: PathBuf,
}

impl AuditLog {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn new(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEntry>();
        let path = log_dir.join("audit.jsonl");
        let log_file = path.clone();

        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                warn!(dir = %log_dir.display(), error = %e, "Cannot create audit directory");
            }
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    warn!(path = %log_file.display(), error = %e, "Cannot open audit log");
                    return;
                }
            };

            while let Some(entry) = rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&entry) else {
                    continue;
                };
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!(error = %e, "Audit write failed");
                    continue;
                }
                let _ = file.flush().await;
            }
        });

        Self { tx, path }
    }

    /// Location of the JSONL file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Emit `entry` as a tracing event and queue it for the JSONL file.
    /// Never blocks; entries sent after the writer stopped are dropped.
    pub fn log(&self, entry: AuditEntry) {
        info!(
            actor = %entry.actor,
            action = %entry.action,
            target = ?entry.target,
            outcome = ?entry.outcome,
            "audit"
        );
        let _ = self.tx.send(entry);
    }

    /// Build an entry stamped with the current time and [`log`](Self::log) it.
    pub fn log_action(
        &self,
        actor: impl Into<String>,
        action: impl Into<String>,
        target: Option<String>,
        details: serde_json::Value,
        outcome: AuditOutcome,
    ) {
        self.log(AuditEntry {
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            target,
            details,
            outcome,
        });
    }
}
