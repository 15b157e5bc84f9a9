//! Telemetry and command bus.
//!
//! A small key/value surface is all the scheduler needs: bounded telemetry
//! lists ("push and cap to the N most recent"), one-shot command flags an
//! operator sets and the scheduler clears, and small values. Backed by NATS
//! JetStream KV in production and by memory in tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

/// Command flags polled and cleared every tick.
pub const CMD_FULL_SYNC: &str = "cmd.full_sync";
pub const CMD_EXPORT: &str = "cmd.export";
pub const CMD_CAPTURE: &str = "cmd.capture";

/// Telemetry list key.
pub const TELEMETRY_TICKS: &str = "telemetry.ticks";

#[async_trait]
pub trait CommandBus: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Reads and clears a one-shot flag, returning whether it was set.
    async fn take_flag(&self, key: &str) -> Result<bool>;

    /// Appends `line` to the JSON list stored at `key`, keeping only the
    /// `cap` most recent entries.
    async fn push_capped(&self, key: &str, line: String, cap: usize) -> Result<()>;
}

fn push_capped_lines(existing: Option<&[u8]>, line: String, cap: usize) -> Result<Vec<u8>> {
    let mut lines: Vec<String> = match existing {
        Some(bytes) => serde_json::from_slice(bytes).unwrap_or_default(),
        None => Vec::new(),
    };
    lines.push(line);
    if lines.len() > cap {
        let excess = lines.len() - cap;
        lines.drain(..excess);
    }
    serde_json::to_vec(&lines).context("failed to serialize telemetry list")
}

pub struct NatsBus {
    store: async_nats::jetstream::kv::Store,
}

impl NatsBus {
    pub async fn connect(url: &str, bucket: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("failed to connect to NATS at {url}"))?;
        let jetstream = async_nats::jetstream::new(client);
        let store = jetstream
            .create_key_value(async_nats::jetstream::kv::Config {
                bucket: bucket.to_string(),
                ..Default::default()
            })
            .await
            .with_context(|| format!("failed to open KV bucket {bucket}"))?;
        info!("connected to NATS KV bucket {bucket}");
        Ok(Self { store })
    }
}

#[async_trait]
impl CommandBus for NatsBus {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.store
            .put(key, Bytes::from(value))
            .await
            .with_context(|| format!("failed to put {key}"))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entry = self
            .store
            .get(key)
            .await
            .with_context(|| format!("failed to get {key}"))?;
        Ok(entry.map(|bytes| bytes.to_vec()))
    }

    async fn take_flag(&self, key: &str) -> Result<bool> {
        let set = self.get(key).await?.is_some();
        if set {
            self.store
                .delete(key)
                .await
                .with_context(|| format!("failed to clear flag {key}"))?;
        }
        Ok(set)
    }

    async fn push_capped(&self, key: &str, line: String, cap: usize) -> Result<()> {
        let existing = self.get(key).await?;
        let updated = push_capped_lines(existing.as_deref(), line, cap)?;
        self.put(key, updated).await
    }
}

/// In-process bus for tests and for running without a NATS server.
#[derive(Default)]
pub struct MemoryBus {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: arms a one-shot flag.
    pub fn set_flag(&self, key: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), b"1".to_vec());
    }
}

#[async_trait]
impl CommandBus for MemoryBus {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn take_flag(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().unwrap().remove(key).is_some())
    }

    async fn push_capped(&self, key: &str, line: String, cap: usize) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let updated = push_capped_lines(entries.get(key).map(|v| v.as_slice()), line, cap)?;
        entries.insert(key.to_string(), updated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_take_flag_clears() {
        let bus = MemoryBus::new();
        assert!(!bus.take_flag(CMD_EXPORT).await.unwrap());
        bus.set_flag(CMD_EXPORT);
        assert!(bus.take_flag(CMD_EXPORT).await.unwrap());
        assert!(!bus.take_flag(CMD_EXPORT).await.unwrap());
    }

    #[tokio::test]
    async fn test_push_capped_keeps_most_recent() {
        let bus = MemoryBus::new();
        for i in 0..7 {
            bus.push_capped(TELEMETRY_TICKS, format!("tick-{i}"), 5)
                .await
                .unwrap();
        }
        let stored = bus.get(TELEMETRY_TICKS).await.unwrap().unwrap();
        let lines: Vec<String> = serde_json::from_slice(&stored).unwrap();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines.first().unwrap(), "tick-2");
        assert_eq!(lines.last().unwrap(), "tick-6");
    }

    #[test]
    fn test_push_capped_recovers_from_corrupt_list() {
        let updated = push_capped_lines(Some(b"not json"), "fresh".to_string(), 3).unwrap();
        let lines: Vec<String> = serde_json::from_slice(&updated).unwrap();
        assert_eq!(lines, vec!["fresh"]);
    }
}
