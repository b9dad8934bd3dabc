//! Streaming deserializer for `block` messages
//!
//! The 80-byte header and the tx count are decoded first and emitted as a
//! [`PartialBlockHeader`]. Transactions are then decoded one at a time and
//! grouped into [`PartialBlockTxs`] batches: a batch is closed once its
//! encoded size reaches the batch size, except on the very first
//! transaction of the block. Whatever is left at the end is emitted as the
//! last batch.

use crate::stream::large::{
    LargeMessageDecoding, LargeMessageDeserializer, PartialBlockHeader, PartialBlockTxs,
    PartialMessage,
};
use crate::wire::{
    varint_size, BlockHeader, ByteReader, Decode, Encode, MessageHeader, MessageType,
    Transaction, WireError, BLOCK_HEADER_SIZE,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct BigBlockDeserializer;

impl LargeMessageDeserializer for BigBlockDeserializer {
    fn message_type(&self) -> MessageType {
        MessageType::Block
    }

    fn start(&self, header: &MessageHeader, batch_size: usize) -> Box<dyn LargeMessageDecoding> {
        Box::new(BigBlockDecoding::new(header, batch_size))
    }
}

#[derive(Debug)]
enum Stage {
    Header,
    TxCount(BlockHeader),
    Txs(BlockHeader),
    Done,
}

/// Decoding state of one block body
#[derive(Debug)]
pub struct BigBlockDecoding {
    command: String,
    body_len: u64,
    batch_size: usize,
    stage: Stage,
    tx_count: u64,
    /// Transactions decoded so far
    index: u64,
    batch: Vec<Transaction>,
    batch_bytes: usize,
    order_number: u64,
}

impl BigBlockDecoding {
    pub fn new(header: &MessageHeader, batch_size: usize) -> Self {
        Self {
            command: header.command.clone(),
            body_len: header.length as u64,
            batch_size,
            stage: Stage::Header,
            tx_count: 0,
            index: 0,
            batch: Vec::new(),
            batch_bytes: 0,
            order_number: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.stage, Stage::Done)
    }

    fn take_batch(&mut self, header: &BlockHeader) -> PartialMessage {
        let part = PartialBlockTxs {
            header: header.clone(),
            txs: std::mem::take(&mut self.batch),
            order_number: self.order_number,
        };
        log::trace!(
            "Block {}: batch #{} of {} txs ({} bytes)",
            header.hash(),
            part.order_number,
            part.txs.len(),
            self.batch_bytes
        );
        self.batch_bytes = 0;
        self.order_number += 1;
        PartialMessage::BlockTxs(part)
    }
}

impl LargeMessageDecoding for BigBlockDecoding {
    fn feed(
        &mut self,
        data: &[u8],
        complete: bool,
        out: &mut Vec<PartialMessage>,
    ) -> Result<usize, WireError> {
        let mut pos = 0;
        loop {
            match std::mem::replace(&mut self.stage, Stage::Done) {
                Stage::Header => match attempt(&data[pos..], complete, BlockHeader::decode)? {
                    Some((header, used)) => {
                        pos += used;
                        self.stage = Stage::TxCount(header);
                    }
                    None => {
                        self.stage = Stage::Header;
                        return Ok(pos);
                    }
                },
                Stage::TxCount(header) => {
                    match attempt(&data[pos..], complete, |r| r.read_varint("block: tx count"))? {
                        Some((count, used)) => {
                            pos += used;
                            self.tx_count = count;
                            let txs_size_in_bytes = self
                                .body_len
                                .saturating_sub((BLOCK_HEADER_SIZE + varint_size(count)) as u64);
                            out.push(PartialMessage::BlockHeader(PartialBlockHeader {
                                header: header.clone(),
                                tx_count: count,
                                txs_size_in_bytes,
                            }));
                            self.stage = Stage::Txs(header);
                        }
                        None => {
                            self.stage = Stage::TxCount(header);
                            return Ok(pos);
                        }
                    }
                }
                Stage::Txs(header) => {
                    if self.index == self.tx_count {
                        if !self.batch.is_empty() {
                            out.push(self.take_batch(&header));
                        }
                        // stage stays Done
                        continue;
                    }
                    match attempt(&data[pos..], complete, Transaction::decode)? {
                        Some((tx, used)) => {
                            pos += used;
                            self.batch_bytes += tx.encoded_len();
                            self.batch.push(tx);
                            if self.index > 0 && self.batch_bytes >= self.batch_size {
                                out.push(self.take_batch(&header));
                            }
                            self.index += 1;
                            self.stage = Stage::Txs(header);
                        }
                        None => {
                            self.stage = Stage::Txs(header);
                            return Ok(pos);
                        }
                    }
                }
                Stage::Done => {
                    if pos < data.len() {
                        return Err(WireError::LengthMismatch {
                            command: self.command.clone(),
                            declared: self.body_len,
                            actual: self.body_len.saturating_sub((data.len() - pos) as u64),
                        });
                    }
                    return Ok(pos);
                }
            }
        }
    }
}

/// Decode one item from the front of `data`. `Ok(None)` means the item is
/// cut off and more of the body is still to come.
fn attempt<T, F>(data: &[u8], complete: bool, decode: F) -> Result<Option<(T, usize)>, WireError>
where
    F: FnOnce(&mut ByteReader<'_>) -> Result<T, WireError>,
{
    let mut reader = ByteReader::new(data);
    match decode(&mut reader) {
        Ok(item) => Ok(Some((item, reader.position()))),
        Err(e) if e.is_incomplete() && !complete => Ok(None),
        Err(e) => Err(e),
    }
}
