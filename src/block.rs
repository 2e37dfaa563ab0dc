//! Block-wise transfers (RFC 7959).
//!
//! [`BlockValue`] is the three-field option value; [`Block1State`] fragments
//! an outbound request body and [`Block2State`] reassembles an inbound
//! response body. Both states are tied to an exchange and expire when no
//! progress is made within `blockwiseStatusLifetime`.

use std::time::{Duration, Instant};

use crate::error::FormatError;
use crate::message::option::{self, CoapOption};
use crate::message::Message;

/// Decoded Block1/Block2 option value: block number, more-flag and the size
/// exponent (block size = `2^(szx + 4)`, SZX 0..=6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockValue {
    pub num: u32,
    pub more: bool,
    pub size_exponent: u8,
}

impl BlockValue {
    pub fn new(num: usize, more: bool, size: usize) -> Result<BlockValue, FormatError> {
        let size_exponent = szx_for_size(size);
        let num = u32::try_from(num).map_err(|_| FormatError::InvalidOptionLength)?;
        if num >= 1 << 20 {
            return Err(FormatError::InvalidOptionLength);
        }
        Ok(BlockValue {
            num,
            more,
            size_exponent,
        })
    }

    /// Block size in bytes.
    pub fn size(&self) -> usize {
        1 << (self.size_exponent + 4)
    }

    /// Byte offset of this block in the full body.
    pub fn offset(&self) -> usize {
        self.num as usize * self.size()
    }

    /// Reads the option value off a message.
    pub fn from_message(message: &Message, tp: CoapOption) -> Option<BlockValue> {
        let raw = message.get_first_option(tp)?;
        BlockValue::try_from(raw.as_slice()).ok()
    }

    /// Writes the option value onto a message, replacing any previous one.
    pub fn set_on(&self, message: &mut Message, tp: CoapOption) {
        message.clear_option(tp);
        message.add_option(tp, Vec::from(*self));
    }
}

impl From<BlockValue> for Vec<u8> {
    fn from(block: BlockValue) -> Vec<u8> {
        let scalar = block.num << 4
            | u32::from(block.more) << 3
            | u32::from(block.size_exponent & 0x7);
        option::encode_integer(scalar)
    }
}

impl TryFrom<&[u8]> for BlockValue {
    type Error = FormatError;

    fn try_from(value: &[u8]) -> Result<BlockValue, FormatError> {
        if value.len() > 3 {
            return Err(FormatError::OptionValueTooLong {
                actual: value.len(),
                max: 3,
            });
        }
        let scalar = value.iter().fold(0u32, |acc, b| acc << 8 | u32::from(*b));
        Ok(BlockValue {
            num: scalar >> 4,
            more: scalar >> 3 & 0x1 == 0x1,
            size_exponent: (scalar & 0x7) as u8,
        })
    }
}

/// Largest SZX whose block size does not exceed `size`, clamped to 0..=6.
pub fn szx_for_size(size: usize) -> u8 {
    let mut szx: u8 = 0;
    while szx < 6 && (1usize << (szx + 5)) <= size {
        szx += 1;
    }
    szx
}

/// Outbound request-body fragmentation (Block1).
#[derive(Debug, Clone)]
pub struct Block1State {
    payload: Vec<u8>,
    offset: usize,
    size_exponent: u8,
    last_progress: Instant,
}

impl Block1State {
    pub fn new(payload: Vec<u8>, preferred_block_size: usize) -> Block1State {
        Block1State {
            payload,
            offset: 0,
            size_exponent: szx_for_size(preferred_block_size),
            last_progress: Instant::now(),
        }
    }

    pub fn block_size(&self) -> usize {
        1 << (self.size_exponent + 4)
    }

    /// The Block1 value describing the current chunk.
    pub fn current_block(&self) -> BlockValue {
        BlockValue {
            num: (self.offset / self.block_size()) as u32,
            more: self.offset + self.block_size() < self.payload.len(),
            size_exponent: self.size_exponent,
        }
    }

    /// The bytes of the current chunk.
    pub fn chunk(&self) -> &[u8] {
        let end = (self.offset + self.block_size()).min(self.payload.len());
        &self.payload[self.offset..end]
    }

    /// Moves past the current chunk; `false` once the body is exhausted.
    pub fn advance(&mut self) -> bool {
        self.offset += self.block_size();
        self.last_progress = Instant::now();
        self.offset < self.payload.len()
    }

    /// Adopts a smaller block size announced by the server, realigning the
    /// block number to the new boundary. Size increases are ignored.
    pub fn renegotiate(&mut self, server_szx: u8) {
        if server_szx < self.size_exponent {
            // The offset is a multiple of the old (larger) size, so it is
            // already aligned to the new one.
            self.size_exponent = server_szx.min(6);
        }
    }

    pub fn is_stale(&self, lifetime: Duration) -> bool {
        self.last_progress.elapsed() >= lifetime
    }
}

/// Inbound response-body reassembly (Block2).
#[derive(Debug, Clone, Default)]
pub struct Block2State {
    buffer: Vec<u8>,
    next_num: u32,
    size_exponent: Option<u8>,
    last_progress: Option<Instant>,
}

impl Block2State {
    pub fn new() -> Block2State {
        Block2State::default()
    }

    /// The Block2 value for early size negotiation on the initial request.
    pub fn early_negotiation(preferred_block_size: usize) -> BlockValue {
        BlockValue {
            num: 0,
            more: false,
            size_exponent: szx_for_size(preferred_block_size),
        }
    }

    /// Accepts one response block. Returns `true` when more blocks follow.
    /// A block that does not continue at the reassembly offset is rejected.
    pub fn accept(
        &mut self,
        block: &BlockValue,
        payload: &[u8],
    ) -> Result<bool, FormatError> {
        // Contiguity is judged by byte offset, not block number: a
        // mid-transfer size decrease renumbers the remaining blocks.
        if block.offset() != self.buffer.len() {
            return Err(FormatError::InvalidOptionLength);
        }
        // Mixing sizes mid-transfer is only permitted on a decrease.
        if let Some(szx) = self.size_exponent {
            if block.size_exponent > szx {
                return Err(FormatError::InvalidOptionLength);
            }
        }

        self.buffer.extend_from_slice(payload);
        self.next_num = block.num + 1;
        self.size_exponent = Some(block.size_exponent);
        self.last_progress = Some(Instant::now());
        Ok(block.more)
    }

    /// The Block2 value requesting the next block.
    pub fn next_request(&self) -> BlockValue {
        BlockValue {
            num: self.next_num,
            more: false,
            size_exponent: self.size_exponent.unwrap_or(6),
        }
    }

    pub fn is_stale(&self, lifetime: Duration) -> bool {
        match self.last_progress {
            Some(instant) => instant.elapsed() >= lifetime,
            None => false,
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.buffer
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_block_value_codec() {
        let block = BlockValue::new(0, true, 64).unwrap();
        assert_eq!(block.size_exponent, 2);
        assert_eq!(block.size(), 64);
        // num 0, more, szx 2 => one byte 0b0000_1010.
        assert_eq!(Vec::from(block), vec![0x0A]);

        let decoded = BlockValue::try_from(&[0x0A][..]).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_block_value_zero_is_empty() {
        let block = BlockValue::new(0, false, 16).unwrap();
        assert_eq!(Vec::from(block), Vec::<u8>::new());
        assert_eq!(
            BlockValue::try_from(&[][..]).unwrap(),
            BlockValue {
                num: 0,
                more: false,
                size_exponent: 0
            }
        );
    }

    #[test]
    fn test_block_value_large_num() {
        let block = BlockValue::new(1000, true, 1024).unwrap();
        let bytes = Vec::from(block);
        assert_eq!(bytes.len(), 2);
        let decoded = BlockValue::try_from(bytes.as_slice()).unwrap();
        assert_eq!(decoded.num, 1000);
        assert!(decoded.more);
        assert_eq!(decoded.size(), 1024);
    }

    #[test]
    fn test_block_value_num_bound() {
        assert!(BlockValue::new(1 << 20, false, 1024).is_err());
        assert!(BlockValue::new((1 << 20) - 1, false, 1024).is_ok());
    }

    #[test]
    fn test_szx_clamping() {
        assert_eq!(szx_for_size(16), 0);
        assert_eq!(szx_for_size(17), 0);
        assert_eq!(szx_for_size(32), 1);
        assert_eq!(szx_for_size(512), 5);
        assert_eq!(szx_for_size(1024), 6);
        assert_eq!(szx_for_size(65536), 6);
        assert_eq!(szx_for_size(0), 0);
    }

    #[test]
    fn test_block1_walks_payload() {
        let mut state = Block1State::new(vec![0xAB; 2048], 512);
        assert_eq!(state.block_size(), 512);

        let block = state.current_block();
        assert_eq!((block.num, block.more, block.size_exponent), (0, true, 5));
        assert_eq!(state.chunk().len(), 512);

        assert!(state.advance());
        let block = state.current_block();
        assert_eq!((block.num, block.more), (1, true));

        assert!(state.advance());
        assert!(state.advance());
        let block = state.current_block();
        assert_eq!((block.num, block.more), (3, false));
        assert_eq!(state.chunk().len(), 512);
        assert!(!state.advance());
    }

    #[test]
    fn test_block1_offset_invariant() {
        let mut state = Block1State::new(vec![0; 5000], 1024);
        loop {
            let block = state.current_block();
            assert_eq!(block.offset(), block.num as usize * block.size());
            if !state.advance() {
                break;
            }
        }
    }

    #[test]
    fn test_block1_renegotiation_realigns() {
        let mut state = Block1State::new(vec![0; 4096], 1024);
        assert_eq!(state.current_block().num, 0);
        assert!(state.advance());

        // Server answered with SZX 4 (256 bytes): the 1024-byte offset is
        // block number 4 in the new size.
        state.renegotiate(4);
        let block = state.current_block();
        assert_eq!(block.num, 4);
        assert_eq!(block.size(), 256);
        assert_eq!(block.offset(), 1024);

        // Size increases are not adopted.
        state.renegotiate(6);
        assert_eq!(state.current_block().size(), 256);
    }

    #[test]
    fn test_block2_reassembly() {
        let mut state = Block2State::new();

        let b0 = BlockValue::new(0, true, 64).unwrap();
        assert!(state.accept(&b0, &[0x01; 64]).unwrap());

        let b1 = BlockValue::new(1, true, 64).unwrap();
        assert!(state.accept(&b1, &[0x02; 64]).unwrap());
        assert_eq!(state.next_request().num, 2);

        let b2 = BlockValue::new(2, false, 64).unwrap();
        assert!(!state.accept(&b2, &[0x03; 32]).unwrap());

        let payload = state.into_payload();
        assert_eq!(payload.len(), 160);
        assert_eq!(payload[0], 0x01);
        assert_eq!(payload[64], 0x02);
        assert_eq!(payload[128], 0x03);
    }

    #[test]
    fn test_block2_rejects_gap() {
        let mut state = Block2State::new();
        let b1 = BlockValue::new(1, true, 64).unwrap();
        assert!(state.accept(&b1, &[0; 64]).is_err());
    }

    #[test]
    fn test_block2_rejects_size_increase() {
        let mut state = Block2State::new();
        let b0 = BlockValue::new(0, true, 64).unwrap();
        state.accept(&b0, &[0; 64]).unwrap();

        // Size decrease is fine on the right boundary; an increase is not.
        let bigger = BlockValue {
            num: 1,
            more: true,
            size_exponent: 6,
        };
        assert!(state.accept(&bigger, &[0; 1024]).is_err());
    }

    #[test]
    fn test_early_negotiation_value() {
        let block = Block2State::early_negotiation(512);
        assert_eq!((block.num, block.more, block.size_exponent), (0, false, 5));
    }

    #[test]
    fn test_staleness() {
        let state = Block1State::new(vec![0; 100], 64);
        assert!(!state.is_stale(Duration::from_secs(600)));
        assert!(state.is_stale(Duration::from_nanos(0)));
    }
}
