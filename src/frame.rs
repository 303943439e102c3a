//! The buffer types that flow between pins, codec modules, and the muxer.
//!
//! The original implementation assembles access units out of a linked chain
//! of buffers so it never has to copy a NALU twice. A position-tracking
//! writer ultimately needs contiguous bytes anyway (to hand to
//! [`std::io::Write`]), so instead of a full zero-copy chain abstraction we
//! keep a frame as either one contiguous [`Bytes`] or a small ordered list of
//! them, materializing only when something downstream actually needs
//! contiguous bytes.

use bytes::{Bytes, BytesMut};

/// A frame's timestamp, in whatever clock domain the producer last set:
/// codec-native rate on ingest, 1 kHz once it has passed through the time
/// corrector, and the destination pin's codec rate again on playback.
pub type Timestamp = i64;

/// One or more NAL units (or other codec packets) that together make up a
/// single access unit / frame, plus its timestamp.
#[derive(Debug, Clone)]
pub struct Buffer {
    pub timestamp: Timestamp,
    chunks: Vec<Bytes>,
}

impl Buffer {
    /// Creates a buffer from a single contiguous chunk.
    pub fn single(timestamp: Timestamp, data: Bytes) -> Self {
        Buffer { timestamp, chunks: vec![data] }
    }

    /// Creates an empty buffer that chunks can be appended to.
    pub fn empty(timestamp: Timestamp) -> Self {
        Buffer { timestamp, chunks: Vec::new() }
    }

    /// Appends one more chunk to the chain, preserving order.
    pub fn push(&mut self, data: Bytes) {
        self.chunks.push(data);
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.is_empty())
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Total length across all chunks.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    /// Flattens the chain into one contiguous buffer. A no-op copy when
    /// there's already exactly one chunk.
    pub fn to_contiguous(&self) -> Bytes {
        if self.chunks.len() == 1 {
            return self.chunks[0].clone();
        }
        let mut out = BytesMut::with_capacity(self.len());
        for c in &self.chunks {
            out.extend_from_slice(c);
        }
        out.freeze()
    }
}

/// A frame ready for (or read from) container storage: a contiguous payload,
/// a timestamp, and whether it starts a new GOP (always true for non-video).
#[derive(Debug, Clone)]
pub struct ContainerFrame {
    pub timestamp: Timestamp,
    pub data: Bytes,
    pub keyframe: bool,
}
