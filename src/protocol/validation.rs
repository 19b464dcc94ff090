//! Header checks applied before a frame's payload is buffered.
//!
//! - masking direction per RFC 6455 section 5.1
//! - RSV bits: RSV1 only on the first frame of a message, and only when
//!   permessage-deflate was negotiated
//! - control frame shape and the per-frame size limit

use crate::config::Limits;
use crate::connection::Role;
use crate::error::{Error, Result};
use crate::protocol::FrameHeader;
use crate::protocol::frame::MAX_CONTROL_FRAME_PAYLOAD;

/// Validator for incoming frame headers.
#[derive(Debug, Clone)]
pub struct FrameValidator {
    role: Role,
    limits: Limits,
    compression: bool,
}

impl FrameValidator {
    /// Create a validator for the receiving side of `role`.
    pub fn new(role: Role, limits: Limits) -> Self {
        Self {
            role,
            limits,
            compression: false,
        }
    }

    /// Allow RSV1 on message-opening frames.
    pub fn with_compression(mut self, negotiated: bool) -> Self {
        self.compression = negotiated;
        self
    }

    /// Validate a decoded header.
    ///
    /// # Errors
    ///
    /// - `Error::UnmaskedClientFrame` / `Error::MaskedServerFrame` on a masking violation
    /// - `Error::ReservedBitsSet` for RSV2/RSV3, or RSV1 where it is not allowed
    /// - `Error::FragmentedControlFrame` / `Error::ControlFrameTooLarge` for bad control frames
    /// - `Error::FrameTooLarge` if the announced length exceeds the frame limit
    pub fn validate_header(&self, header: &FrameHeader) -> Result<()> {
        self.validate_masking(header.is_masked())?;

        if header.rsv2 || header.rsv3 {
            return Err(Error::ReservedBitsSet);
        }
        if header.rsv1 && !(self.compression && header.opcode.starts_message()) {
            return Err(Error::ReservedBitsSet);
        }

        if header.opcode.is_control() {
            if !header.fin {
                return Err(Error::FragmentedControlFrame);
            }
            if header.payload_len > MAX_CONTROL_FRAME_PAYLOAD as u64 {
                return Err(Error::ControlFrameTooLarge(
                    usize::try_from(header.payload_len).unwrap_or(usize::MAX),
                ));
            }
        }

        if header.payload_len > self.limits.max_frame_size as u64 {
            return Err(Error::FrameTooLarge {
                size: usize::try_from(header.payload_len).unwrap_or(usize::MAX),
                max: self.limits.max_frame_size,
            });
        }
        Ok(())
    }

    fn validate_masking(&self, masked: bool) -> Result<()> {
        match self.role {
            Role::Server if !masked => Err(Error::UnmaskedClientFrame),
            Role::Client if masked => Err(Error::MaskedServerFrame),
            _ => Ok(()),
        }
    }
}
