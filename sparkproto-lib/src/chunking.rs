//! Length-prefix framing of encrypted messages.
//!
//! Wire format:
//! ```text
//! ┌────────────┬──────────────────────────────┐
//! │ Length (2B)│ AES-CBC ciphertext (N bytes) │
//! │ BE u16     │                              │
//! └────────────┴──────────────────────────────┘
//! ```
//!
//! The cipher works on whole messages, so the decoder must hand it complete
//! frames only. A single socket read may carry part of the header, part of a
//! payload, or several frames back to back.

use crate::constants::{CHUNK_HEADER_SIZE, MAX_FRAME_SIZE};
use crate::error::ProtocolError;
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

/// Decoder state machine.
#[derive(Debug)]
enum DecoderState {
    /// Waiting for header bytes.
    ReadingHeader { collected: usize },
    /// Header received, filling a frame of exactly `expected` bytes.
    ReadingPayload { expected: usize },
}

/// Streaming frame decoder.
#[derive(Debug)]
pub struct ChunkDecoder {
    state: DecoderState,
    header: [u8; CHUNK_HEADER_SIZE],
    frame: BytesMut,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::ReadingHeader { collected: 0 },
            header: [0; CHUNK_HEADER_SIZE],
            frame: BytesMut::new(),
        }
    }

    /// Feed bytes from the socket and collect every frame they complete.
    pub fn feed(&mut self, mut data: &[u8]) -> Vec<Bytes> {
        let mut frames = Vec::new();

        while !data.is_empty() {
            match self.state {
                DecoderState::ReadingHeader { collected } => {
                    let to_copy = (CHUNK_HEADER_SIZE - collected).min(data.len());
                    self.header[collected..collected + to_copy].copy_from_slice(&data[..to_copy]);
                    data = &data[to_copy..];

                    let collected = collected + to_copy;
                    if collected < CHUNK_HEADER_SIZE {
                        self.state = DecoderState::ReadingHeader { collected };
                        continue;
                    }

                    let expected = BigEndian::read_u16(&self.header) as usize;
                    if expected == 0 {
                        trace!("Skipping empty frame");
                        self.state = DecoderState::ReadingHeader { collected: 0 };
                        continue;
                    }
                    self.frame = BytesMut::with_capacity(expected);
                    self.state = DecoderState::ReadingPayload { expected };
                }

                DecoderState::ReadingPayload { expected } => {
                    let to_copy = (expected - self.frame.len()).min(data.len());
                    self.frame.extend_from_slice(&data[..to_copy]);
                    data = &data[to_copy..];

                    if self.frame.len() == expected {
                        frames.push(std::mem::take(&mut self.frame).freeze());
                        self.state = DecoderState::ReadingHeader { collected: 0 };
                    }
                }
            }
        }

        frames
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecoderState::ReadingHeader { collected: 0 })
    }

    pub fn reset(&mut self) {
        self.state = DecoderState::ReadingHeader { collected: 0 };
        self.frame.clear();
    }
}

/// Prefix a ciphertext with its big-endian 16-bit length.
pub fn encode_chunk(payload: &[u8]) -> Result<Bytes, ProtocolError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    let mut out = BytesMut::with_capacity(CHUNK_HEADER_SIZE + payload.len());
    out.put_u16(payload.len() as u16);
    out.put_slice(payload);
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn encode_prefixes_big_endian_length() {
        let encoded = encode_chunk(&[0xAA; 0x0102]).unwrap();
        assert_eq!(&encoded[..2], &[0x01u8, 0x02]);
        assert_eq!(encoded.len(), 2 + 0x0102);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        assert!(matches!(
            encode_chunk(&vec![0u8; MAX_FRAME_SIZE + 1]),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn reassembles_across_every_split() {
        for len in [1usize, 16, 48, 300] {
            let original = frame(len, len as u8);
            let wire = encode_chunk(&original).unwrap();

            // Split into pieces of every size from one byte to the whole frame.
            for piece in 1..=wire.len() {
                let mut decoder = ChunkDecoder::new();
                let mut out = Vec::new();
                for part in wire.chunks(piece) {
                    out.extend(decoder.feed(part));
                }
                assert_eq!(out.len(), 1, "len {len} piece {piece}");
                assert_eq!(out[0].as_ref(), original.as_slice());
                assert!(decoder.is_idle());
            }
        }
    }

    #[test]
    fn trailing_bytes_start_the_next_frame() {
        let first = frame(32, 1);
        let second = frame(20, 99);
        let mut wire = encode_chunk(&first).unwrap().to_vec();
        wire.extend_from_slice(&encode_chunk(&second).unwrap());

        let mut decoder = ChunkDecoder::new();
        // First read ends three bytes into the second frame's payload.
        let split = 2 + first.len() + 2 + 3;
        let frames = decoder.feed(&wire[..split]);
        assert_eq!(frames, vec![Bytes::from(first)]);
        assert!(!decoder.is_idle());

        let frames = decoder.feed(&wire[split..]);
        assert_eq!(frames, vec![Bytes::from(second)]);
    }

    #[test]
    fn many_frames_in_one_read() {
        let mut wire = Vec::new();
        for i in 0..5u8 {
            wire.extend_from_slice(&encode_chunk(&frame(16, i)).unwrap());
        }
        let frames = ChunkDecoder::new().feed(&wire);
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[4].as_ref(), frame(16, 4).as_slice());
    }

    #[test]
    fn partial_frame_is_never_emitted() {
        let wire = encode_chunk(&frame(64, 0)).unwrap();
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.feed(&wire[..wire.len() - 1]).is_empty());
        assert_eq!(decoder.feed(&wire[wire.len() - 1..]).len(), 1);
    }
}
