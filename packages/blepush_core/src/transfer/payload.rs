//! Payload store: the bytes being pushed and the shared send cursor.

use bytes::Bytes;

use super::TransferError;

/// Result of asking the store for the next block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextBlock {
    /// `[offset, offset_after)` of the payload. Shorter than the block size
    /// only for the final block.
    Block {
        data: Bytes,
        offset: usize,
        offset_after: usize,
    },
    /// The cursor has reached the end of the payload.
    Complete,
}

/// Holds the armed payload and the offset of the next unsent byte.
///
/// `next_block` is a pure read; the offset moves only through `commit`, and
/// only the scheduler tick calls it.
#[derive(Debug, Default)]
pub struct PayloadStore {
    data: Bytes,
    offset: usize,
}

impl PayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new payload and rewind the cursor. Empty payloads are rejected.
    pub fn arm(&mut self, data: impl Into<Bytes>) -> Result<(), TransferError> {
        let data = data.into();
        if data.is_empty() {
            return Err(TransferError::InvalidPayload(
                "payload is empty".to_string(),
            ));
        }
        self.data = data;
        self.offset = 0;
        Ok(())
    }

    /// Drop the payload. The store reports `Complete` until re-armed.
    pub fn disarm(&mut self) {
        self.data = Bytes::new();
        self.offset = 0;
    }

    /// Slice the next block without moving the cursor.
    pub fn next_block(&self, block_size: usize) -> NextBlock {
        if self.offset >= self.data.len() {
            return NextBlock::Complete;
        }
        let end = (self.offset + block_size.max(1)).min(self.data.len());
        NextBlock::Block {
            data: self.data.slice(self.offset..end),
            offset: self.offset,
            offset_after: end,
        }
    }

    /// Advance the cursor. It may only move forward and never past the end.
    pub fn commit(&mut self, offset_after: usize) -> Result<(), TransferError> {
        if offset_after <= self.offset || offset_after > self.data.len() {
            return Err(TransferError::InvalidCommit {
                offset: self.offset,
                requested: offset_after,
                len: self.data.len(),
            });
        }
        self.offset = offset_after;
        Ok(())
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_armed(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}
