// src/bot/violations.rs - Durable per-user violation counters

use anyhow::{Context, Result};
use log::{info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// Per-user violation counts, persisted write-through as a flat JSON object
/// so restarts keep the escalation history. Counts only ever grow; there is
/// no decay policy.
pub struct ViolationLedger {
    counts: Mutex<HashMap<String, u32>>,
    path: PathBuf,
}

impl ViolationLedger {
    /// Read the durable table. A missing or unreadable file is not fatal:
    /// the ledger starts empty and the condition is logged.
    pub async fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();

        let counts = match fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<HashMap<String, u32>>(&content) {
                Ok(counts) => {
                    info!(
                        "Loaded {} violation records from {}",
                        counts.len(),
                        path.display()
                    );
                    counts
                }
                Err(e) => {
                    warn!(
                        "Violation table {} is corrupt ({}), reinitializing empty",
                        path.display(),
                        e
                    );
                    HashMap::new()
                }
            },
            Err(_) => {
                info!("No violation table at {}, starting empty", path.display());
                HashMap::new()
            }
        };

        Self {
            counts: Mutex::new(counts),
            path,
        }
    }

    /// Increment the counter for `user_key`, flush the whole table, and
    /// return the new count. The mutex makes the read-modify-write-flush
    /// atomic against concurrent callers.
    pub async fn record_violation(&self, user_key: &str) -> Result<u32> {
        let mut counts = self.counts.lock().await;
        let count = counts.entry(user_key.to_string()).or_insert(0);
        *count += 1;
        let new_count = *count;

        self.write_table(&counts).await?;
        Ok(new_count)
    }

    pub async fn count(&self, user_key: &str) -> u32 {
        self.counts.lock().await.get(user_key).copied().unwrap_or(0)
    }

    /// Rewrite the table. Called on shutdown so the last state is on disk
    /// even if the final increment's flush failed.
    pub async fn flush(&self) -> Result<()> {
        let counts = self.counts.lock().await;
        self.write_table(&counts).await
    }

    async fn write_table(&self, counts: &HashMap<String, u32>) -> Result<()> {
        let json =
            serde_json::to_string_pretty(&*counts).context("Failed to serialize violation table")?;
        fs::write(&self.path, json)
            .await
            .with_context(|| format!("Failed to write violation table: {}", self.path.display()))
    }
}
