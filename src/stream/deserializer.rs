//! Shared deserializer settings, large-message registry and counters
//!
//! One [`Deserializer`] is shared by every peer stream. Each stream builds
//! its own [`MessageDecoder`](crate::stream::MessageDecoder) on top of it.

use crate::config::ConfigError;
use crate::stream::large::{BigBlockDeserializer, CallbackMode, LargeMessageDeserializer};
use crate::wire::{MessageHeader, MessageType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeserializerConfig {
    /// Network magic every header must carry
    pub magic: u32,
    /// Largest body that is buffered and decoded in one go
    pub max_message_size: u64,
    /// Bodies above this size are streamed when a large deserializer is
    /// registered for their command. `None` disables streaming.
    pub large_msg_threshold: Option<u64>,
    /// Target size of each emitted batch. Required when streaming is enabled.
    pub large_msg_batch_size: Option<usize>,
    pub callback_mode: CallbackMode,
    pub verify_checksum: bool,
    /// Decoded messages buffered per stream before reading pauses
    pub stream_capacity: usize,
}

impl Default for DeserializerConfig {
    fn default() -> Self {
        Self {
            magic: crate::config::Network::Mainnet.magic(),
            max_message_size: 32 * MIB,
            large_msg_threshold: Some(10 * MIB),
            large_msg_batch_size: Some(10 * MIB as usize),
            callback_mode: CallbackMode::Sync,
            verify_checksum: true,
            stream_capacity: 64,
        }
    }
}

impl DeserializerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream_capacity == 0 {
            return Err(ConfigError::Invalid {
                name: "stream_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.large_msg_threshold.is_some() {
            match self.large_msg_batch_size {
                None => return Err(ConfigError::Missing("large_msg_batch_size")),
                Some(0) => {
                    return Err(ConfigError::Invalid {
                        name: "large_msg_batch_size",
                        reason: "must be greater than 0".to_string(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Snapshot of the deserializer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeserializerState {
    pub msgs_decoded: u64,
    pub large_msgs_started: u64,
    pub large_msgs_completed: u64,
    pub large_msgs_failed: u64,
    pub partial_msgs_emitted: u64,
}

#[derive(Default)]
struct Counters {
    msgs_decoded: AtomicU64,
    large_msgs_started: AtomicU64,
    large_msgs_completed: AtomicU64,
    large_msgs_failed: AtomicU64,
    partial_msgs_emitted: AtomicU64,
}

pub struct Deserializer {
    config: DeserializerConfig,
    large: HashMap<MessageType, Arc<dyn LargeMessageDeserializer>>,
    counters: Counters,
}

impl Deserializer {
    /// Fails if streaming is enabled without a batch size
    pub fn new(config: DeserializerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut deserializer = Self {
            config,
            large: HashMap::new(),
            counters: Counters::default(),
        };
        deserializer.register_large(Arc::new(BigBlockDeserializer));
        Ok(deserializer)
    }

    /// Register (or replace) the streaming deserializer for a message type
    pub fn register_large(&mut self, deserializer: Arc<dyn LargeMessageDeserializer>) {
        self.large.insert(deserializer.message_type(), deserializer);
    }

    pub fn config(&self) -> &DeserializerConfig {
        &self.config
    }

    pub fn magic(&self) -> u32 {
        self.config.magic
    }

    /// Streaming deserializer and batch size to use for this header, if
    /// its body is to be streamed
    pub fn large_for(
        &self,
        header: &MessageHeader,
    ) -> Option<(Arc<dyn LargeMessageDeserializer>, usize)> {
        let threshold = self.config.large_msg_threshold?;
        if (header.length as u64) <= threshold {
            return None;
        }
        let batch_size = self.config.large_msg_batch_size?;
        self.large
            .get(&MessageType::from_command(&header.command))
            .map(|d| (Arc::clone(d), batch_size))
    }

    pub fn state(&self) -> DeserializerState {
        let c = &self.counters;
        DeserializerState {
            msgs_decoded: c.msgs_decoded.load(Ordering::Relaxed),
            large_msgs_started: c.large_msgs_started.load(Ordering::Relaxed),
            large_msgs_completed: c.large_msgs_completed.load(Ordering::Relaxed),
            large_msgs_failed: c.large_msgs_failed.load(Ordering::Relaxed),
            partial_msgs_emitted: c.partial_msgs_emitted.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_decoded(&self) {
        self.counters.msgs_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_large_started(&self) {
        self.counters
            .large_msgs_started
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_large_completed(&self) {
        self.counters
            .large_msgs_completed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_large_failed(&self) {
        self.counters
            .large_msgs_failed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_partials(&self, count: usize) {
        self.counters
            .partial_msgs_emitted
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

impl fmt::Debug for Deserializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deserializer")
            .field("config", &self.config)
            .field("large", &self.large.keys().collect::<Vec<_>>())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_batch_size_is_fatal() {
        let config = DeserializerConfig {
            large_msg_batch_size: None,
            ..Default::default()
        };
        assert!(matches!(
            Deserializer::new(config),
            Err(ConfigError::Missing("large_msg_batch_size"))
        ));
    }

    #[test]
    fn test_batch_size_not_needed_without_streaming() {
        let config = DeserializerConfig {
            large_msg_threshold: None,
            large_msg_batch_size: None,
            ..Default::default()
        };
        assert!(Deserializer::new(config).is_ok());
    }

    #[test]
    fn test_large_path_selection() {
        let deserializer = Deserializer::new(DeserializerConfig {
            large_msg_threshold: Some(1000),
            large_msg_batch_size: Some(200),
            ..Default::default()
        })
        .unwrap();

        let mut header = MessageHeader::for_body(1, "block", &[0u8; 1001]);
        let (large, batch) = deserializer.large_for(&header).unwrap();
        assert_eq!(large.message_type(), MessageType::Block);
        assert_eq!(batch, 200);

        header.length = 1000;
        assert!(deserializer.large_for(&header).is_none());

        // No streaming deserializer for tx
        let header = MessageHeader::for_body(1, "tx", &[0u8; 1001]);
        assert!(deserializer.large_for(&header).is_none());
    }
}
