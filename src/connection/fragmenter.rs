//! Splits an outgoing (possibly compressed) payload into frames.

use bytes::Bytes;

use crate::protocol::{Frame, OpCode};

/// Iterator over the frames of one message.
///
/// The first frame carries the message opcode and, for a compressed
/// message, RSV1; the rest are continuations with RSV1 clear. An empty
/// payload still yields one final frame.
#[derive(Debug)]
pub struct MessageFragmenter {
    payload: Bytes,
    opcode: OpCode,
    compressed: bool,
    fragment_size: usize,
    first: bool,
}

impl MessageFragmenter {
    /// Create a fragmenter; `fragment_size` is clamped to at least 1.
    #[must_use]
    pub fn new(
        payload: impl Into<Bytes>,
        opcode: OpCode,
        compressed: bool,
        fragment_size: usize,
    ) -> Self {
        Self {
            payload: payload.into(),
            opcode,
            compressed,
            fragment_size: fragment_size.max(1),
            first: true,
        }
    }

    /// Bytes not yet handed out.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.payload.len()
    }
}

impl Iterator for MessageFragmenter {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.payload.is_empty() && !self.first {
            return None;
        }

        let chunk = self
            .payload
            .split_to(self.payload.len().min(self.fragment_size));
        let fin = self.payload.is_empty();

        let frame = if self.first {
            self.first = false;
            Frame::new(fin, self.opcode, chunk).with_rsv1(self.compressed)
        } else {
            Frame::continuation(fin, chunk)
        };
        Some(frame)
    }
}
