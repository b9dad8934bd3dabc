//! Streaming deserialization of large messages
//!
//! When a header declares a body above the configured threshold and a
//! [`LargeMessageDeserializer`] is registered for its command, the body is
//! never buffered whole. The deserializer is fed the body bytes as they
//! arrive and emits bounded [`PartialMessage`]s instead:
//!
//! - one header part first
//! - then batches of the repeated element, numbered `0..k`
//! - or an error notification, after which nothing else is emitted
//!
//! Notifications reach the consumer through a [`Notifier`], either inline
//! on the decoding task or on the blocking pool (see [`CallbackMode`]).

pub mod big_block;

pub use big_block::BigBlockDeserializer;

use crate::wire::{BlockHeader, MessageHeader, MessageType, Transaction, WireError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Header part of a streamed block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialBlockHeader {
    pub header: BlockHeader,
    /// Declared number of transactions
    pub tx_count: u64,
    /// Body bytes that follow the header and the tx count
    pub txs_size_in_bytes: u64,
}

/// One batch of transactions of a streamed block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialBlockTxs {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
    /// Position of this batch within the block, starting at 0
    pub order_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartialMessage {
    BlockHeader(PartialBlockHeader),
    BlockTxs(PartialBlockTxs),
}

/// What a [`Notifier`] delivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LargeMsgEvent {
    Partial(PartialMessage),
    /// Decoding of the current message was aborted
    Error(WireError),
}

/// How large-message notifications are delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackMode {
    /// Inline: decoding waits until the callback returns
    #[default]
    Sync,
    /// On the blocking pool. Callbacks may run out of order, so consumers
    /// must rely on `order_number` only.
    Pooled,
}

/// Streams the body of one message type
pub trait LargeMessageDeserializer: Send + Sync {
    fn message_type(&self) -> MessageType;

    /// Start decoding a new body described by `header`
    fn start(&self, header: &MessageHeader, batch_size: usize) -> Box<dyn LargeMessageDecoding>;
}

/// Decoding state of one message body
pub trait LargeMessageDecoding: Send {
    /// Decode from the next body bytes in `data`, pushing any notification
    /// into `out`. `complete` is set when `data` holds the whole rest of the
    /// body. Returns the number of bytes consumed; bytes of an element that
    /// is not complete yet are left for the next call.
    fn feed(
        &mut self,
        data: &[u8],
        complete: bool,
        out: &mut Vec<PartialMessage>,
    ) -> Result<usize, WireError>;
}

type Callback = Arc<dyn Fn(LargeMsgEvent) + Send + Sync>;

/// Delivers [`LargeMsgEvent`]s to a callback
#[derive(Clone)]
pub struct Notifier {
    mode: CallbackMode,
    callback: Callback,
}

impl Notifier {
    pub fn new<F>(mode: CallbackMode, callback: F) -> Self
    where
        F: Fn(LargeMsgEvent) + Send + Sync + 'static,
    {
        Self {
            mode,
            callback: Arc::new(callback),
        }
    }

    pub fn mode(&self) -> CallbackMode {
        self.mode
    }

    pub fn notify(&self, event: LargeMsgEvent) {
        match (self.mode, Handle::try_current()) {
            (CallbackMode::Pooled, Ok(runtime)) => {
                let callback = Arc::clone(&self.callback);
                runtime.spawn_blocking(move || callback(event));
            }
            _ => (self.callback)(event),
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier").field("mode", &self.mode).finish()
    }
}
