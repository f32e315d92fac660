use crate::config::CallRecordConfig;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::{fs::File, io::AsyncWriteExt, select};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub type CallRecordSender = tokio::sync::mpsc::UnboundedSender<CallRecord>;
pub type CallRecordReceiver = tokio::sync::mpsc::UnboundedReceiver<CallRecord>;

/// Persisted summary of one finished call, handed to the storage
/// collaborator after the call leaves the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub caller: Option<String>,
    pub callee: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: u64,
    pub disposition: CallDisposition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallDisposition {
    Completed,
    Transferred { target: String },
    Failed { reason: String },
}

impl CallDisposition {
    pub fn describe(&self) -> String {
        match self {
            CallDisposition::Completed => "completed".to_string(),
            CallDisposition::Transferred { target } => format!("transferred to {}", target),
            CallDisposition::Failed { reason } => format!("failed: {}", reason),
        }
    }
}

/// Background saver draining the record queue. Saving is best effort; a
/// failed write is logged and the queue moves on.
pub struct CallRecordManager {
    pub sender: CallRecordSender,
    config: Option<CallRecordConfig>,
    cancel_token: CancellationToken,
    receiver: CallRecordReceiver,
}

impl CallRecordManager {
    pub fn new(cancel_token: CancellationToken, config: Option<CallRecordConfig>) -> Self {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        if let Some(CallRecordConfig::Local { root }) = &config {
            if !Path::new(root).exists() {
                match std::fs::create_dir_all(root) {
                    Ok(_) => {
                        info!("CallRecordManager created directory: {}", root);
                    }
                    Err(e) => {
                        error!("CallRecordManager failed to create directory: {}", e);
                    }
                }
            }
        }
        Self {
            sender,
            config,
            cancel_token,
            receiver,
        }
    }

    pub async fn serve(mut self) {
        loop {
            select! {
                record = self.receiver.recv() => match record {
                    Some(record) => {
                        if let Err(e) = Self::save(&self.config, &record).await {
                            error!(call_id = record.call_id, "failed to save call record: {}", e);
                        }
                    }
                    None => break,
                },
                _ = self.cancel_token.cancelled() => {
                    // flush whatever is already queued before stopping
                    while let Ok(record) = self.receiver.try_recv() {
                        if let Err(e) = Self::save(&self.config, &record).await {
                            error!(call_id = record.call_id, "failed to save call record: {}", e);
                        }
                    }
                    break;
                }
            }
        }
    }

    async fn save(config: &Option<CallRecordConfig>, record: &CallRecord) -> Result<()> {
        let Some(CallRecordConfig::Local { root }) = config else {
            warn!(call_id = record.call_id, "no call record storage configured");
            return Ok(());
        };
        let file_name = Path::new(root).join(format!("{}.json", record.call_id));
        let content = serde_json::to_string(record)?;
        let mut file = File::create(&file_name).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        info!(
            call_id = record.call_id,
            file_name = file_name.to_string_lossy().to_string(),
            "call record saved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_records_are_saved_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().to_string();
        let token = CancellationToken::new();
        let manager = CallRecordManager::new(
            token.clone(),
            Some(CallRecordConfig::Local { root: root.clone() }),
        );
        let sender = manager.sender.clone();
        let serve = tokio::spawn(manager.serve());

        let start = Utc::now();
        sender
            .send(CallRecord {
                call_id: "CA123".to_string(),
                caller: Some("+390200000000".to_string()),
                callee: Some("+390211111111".to_string()),
                start_time: start,
                end_time: start,
                duration_secs: 42,
                disposition: CallDisposition::Transferred {
                    target: "+39021111111".to_string(),
                },
            })
            .unwrap();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), serve)
            .await
            .unwrap()
            .unwrap();

        let saved = std::fs::read_to_string(Path::new(&root).join("CA123.json")).unwrap();
        let record: CallRecord = serde_json::from_str(&saved).unwrap();
        assert_eq!(record.duration_secs, 42);
        assert_eq!(
            record.disposition,
            CallDisposition::Transferred {
                target: "+39021111111".to_string()
            }
        );
    }
}
