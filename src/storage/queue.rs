//! On-disk message queue
//!
//! Each queued message is a pair of files keyed by a unique name: the JSON
//! envelope under `env/` and the opaque message bytes under `msg/`. Both
//! are staged in `tmp/` and renamed into place, message first, so a reader
//! scanning `env/` never finds an envelope whose body is missing.

use crate::error::{MailError, Result};
use crate::storage::maildir::unique_name;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// Delivery metadata for a queued message, kept separate from the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "MessagePath")]
    pub message_path: String,
    #[serde(rename = "EnvelopePath")]
    pub envelope_path: String,
    /// The authenticated submitter, when the session authenticated.
    #[serde(rename = "Sender")]
    pub sender: Option<String>,
    /// The claimed MAIL FROM address; empty denotes a bounce.
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "Recipients")]
    pub recipients: Vec<EnvelopeRecipient>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeRecipient {
    #[serde(rename = "Recipient")]
    pub recipient: String,
    #[serde(rename = "Delivered")]
    pub delivered: bool,
    #[serde(rename = "Result")]
    pub result: Vec<DeliveryAttempt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    #[serde(rename = "DeliveryResult")]
    pub delivery_result: String,
}

/// A durable queue rooted at a directory with `env/`, `msg/` and `tmp/`
/// subdirectories.
pub struct Queue {
    dir: PathBuf,
}

impl Queue {
    /// Open the queue at `dir`, creating the directory layout as needed.
    /// Fails if the path exists and is not a directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        match fs::metadata(&dir).await {
            Ok(meta) if !meta.is_dir() => {
                return Err(MailError::Storage(format!(
                    "queue path is not a directory: {}",
                    dir.display()
                )))
            }
            Ok(_) => {}
            Err(_) => fs::create_dir_all(&dir).await?,
        }
        for sub in ["env", "msg", "tmp"] {
            fs::create_dir_all(dir.join(sub)).await?;
        }
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Accept a message into the queue. Every recipient starts undelivered
    /// with an empty attempt history. Returns the queue entry's name.
    pub async fn enqueue(
        &self,
        sender: Option<&str>,
        from: &str,
        recipients: &[String],
        msg: &[u8],
    ) -> Result<String> {
        let name = unique_name();
        let env_path = self.dir.join("env").join(format!("{}.env", name));
        let msg_path = self.dir.join("msg").join(format!("{}.msg", name));

        let envelope = Envelope {
            message_path: msg_path.display().to_string(),
            envelope_path: env_path.display().to_string(),
            sender: sender.map(|s| s.to_string()),
            from: from.to_string(),
            recipients: recipients
                .iter()
                .map(|r| EnvelopeRecipient {
                    recipient: r.clone(),
                    delivered: false,
                    result: Vec::new(),
                })
                .collect(),
        };

        let tmp_msg = self.dir.join("tmp").join(format!("{}.msg", name));
        let tmp_env = self.dir.join("tmp").join(format!("{}.env", name));
        fs::write(&tmp_msg, msg).await?;
        fs::write(&tmp_env, serde_json::to_vec(&envelope)?).await?;

        // Publish the body before the envelope: an envelope in env/ must
        // always point at an existing message.
        fs::rename(&tmp_msg, &msg_path).await?;
        fs::rename(&tmp_env, &env_path).await?;

        info!(
            "queued message {} from {} for {} recipient(s)",
            name,
            if from.is_empty() { "<>" } else { from },
            recipients.len()
        );
        Ok(name)
    }

    /// The names of every queued entry, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(self.dir.join("env")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".env") {
                names.push(stem.to_string());
            }
        }
        names.sort_unstable();
        Ok(names)
    }

    /// Read one queue entry: its envelope and message bytes.
    pub async fn read(&self, name: &str) -> Result<(Envelope, Vec<u8>)> {
        let env_path = self.dir.join("env").join(format!("{}.env", name));
        let raw = fs::read(&env_path)
            .await
            .map_err(|_| MailError::NotFound(name.to_string()))?;
        let envelope: Envelope = serde_json::from_slice(&raw)?;
        let msg = fs::read(self.dir.join("msg").join(format!("{}.msg", name))).await?;
        Ok((envelope, msg))
    }
}
