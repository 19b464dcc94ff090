//! Reassembly of fragmented data messages, with inflation at completion.
//!
//! One assembler exists per connection per direction. Text and binary go
//! through exactly the same size checks: the compressed bytes are bounded
//! while fragments accumulate and the inflated bytes are bounded while the
//! finished message is decompressed.

use bytes::BytesMut;

use crate::config::Limits;
use crate::error::{Error, Result};
use crate::extensions::Inflater;
use crate::message::Message;
use crate::protocol::{Frame, OpCode};

/// Where the assembler is in the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    /// No message in progress.
    Idle,
    /// First frame seen, waiting for the final fragment.
    Accumulating,
    /// The last pushed frame completed a message.
    Complete,
    /// A limit or protocol rule was broken; the connection must close.
    Failed,
}

/// A fully assembled, inflated and validated data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledMessage {
    /// `Message::Text` or `Message::Binary`.
    pub message: Message,
    /// Payload bytes as they arrived, before inflation.
    pub wire_len: usize,
    /// Whether the first frame carried RSV1.
    pub compressed: bool,
}

/// Reassembles fragmented messages.
#[derive(Debug)]
pub struct MessageAssembler {
    state: AssemblerState,
    buffer: BytesMut,
    opcode: Option<OpCode>,
    compressed: bool,
    fragment_count: usize,
    limits: Limits,
    inflater: Option<Inflater>,
}

impl MessageAssembler {
    /// Create an assembler; `inflater` is present when permessage-deflate
    /// was negotiated.
    pub fn new(limits: Limits, inflater: Option<Inflater>) -> Self {
        Self {
            state: AssemblerState::Idle,
            buffer: BytesMut::new(),
            opcode: None,
            compressed: false,
            fragment_count: 0,
            limits,
            inflater,
        }
    }

    /// Current state.
    pub fn state(&self) -> AssemblerState {
        self.state
    }

    /// Whether a message is partially assembled.
    pub fn is_assembling(&self) -> bool {
        self.state == AssemblerState::Accumulating
    }

    /// Add a data frame. Returns the message when `frame` completes it.
    ///
    /// Control frames are ignored; the connection answers them directly.
    ///
    /// # Errors
    ///
    /// - `Error::ProtocolViolation` for a continuation without a start, or a
    ///   new message while one is in progress
    /// - `Error::ReservedBitsSet` for RSV1 without a negotiated inflater
    /// - `Error::MessageTooLarge` / `Error::TooManyFragments` past the limits
    /// - `Error::Decompression` for a corrupt compressed message
    /// - `Error::InvalidUtf8` for a text message that is not UTF-8
    ///
    /// Any error moves the assembler to [`AssemblerState::Failed`] for good.
    pub fn push(&mut self, frame: Frame) -> Result<Option<AssembledMessage>> {
        if frame.opcode.is_control() {
            return Ok(None);
        }
        if self.state == AssemblerState::Failed {
            return Err(Error::ProtocolViolation(
                "message assembler already failed".into(),
            ));
        }

        match self.accept(frame) {
            Ok(done) => {
                self.state = if done.is_some() {
                    AssemblerState::Complete
                } else {
                    AssemblerState::Accumulating
                };
                Ok(done)
            }
            Err(err) => {
                self.fail();
                Err(err)
            }
        }
    }

    fn accept(&mut self, frame: Frame) -> Result<Option<AssembledMessage>> {
        match (frame.opcode, self.opcode) {
            (OpCode::Continuation, None) => {
                return Err(Error::ProtocolViolation(
                    "continuation frame without a message in progress".into(),
                ));
            }
            (OpCode::Continuation, Some(_)) => {}
            (_, Some(_)) => {
                return Err(Error::ProtocolViolation(
                    "new data frame while a fragmented message is in progress".into(),
                ));
            }
            (opcode, None) => {
                if frame.rsv1 && self.inflater.is_none() {
                    return Err(Error::ReservedBitsSet);
                }
                self.opcode = Some(opcode);
                self.compressed = frame.rsv1;
                self.buffer.reserve(frame.payload().len());
            }
        }

        self.limits.check_fragment_count(self.fragment_count + 1)?;
        let size = self.buffer.len() + frame.payload().len();
        if self.compressed {
            self.limits.check_compressed_size(size)?;
        } else {
            self.limits.check_message_size(size)?;
        }

        self.buffer.extend_from_slice(frame.payload());
        self.fragment_count += 1;

        if frame.fin {
            self.finish().map(Some)
        } else {
            Ok(None)
        }
    }

    fn finish(&mut self) -> Result<AssembledMessage> {
        let opcode = self.opcode.take();
        let compressed = std::mem::take(&mut self.compressed);
        let raw = self.buffer.split();
        let wire_len = raw.len();
        self.fragment_count = 0;

        let payload = match (&mut self.inflater, compressed) {
            (Some(inflater), true) => inflater.decompress(&raw, self.limits.max_message_size)?,
            _ => Vec::from(raw),
        };

        let message = match opcode {
            Some(OpCode::Text) => Message::Text(String::from_utf8(payload)?),
            _ => Message::Binary(payload),
        };

        Ok(AssembledMessage {
            message,
            wire_len,
            compressed,
        })
    }

    fn fail(&mut self) {
        self.state = AssemblerState::Failed;
        self.buffer = BytesMut::new();
        self.opcode = None;
        self.compressed = false;
        self.fragment_count = 0;
    }
}
