//! WebSocket protocol core (RFC 6455) with the RSV1 handling permessage-deflate needs.

pub mod assembler;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod opcode;
pub mod validation;

pub use assembler::{AssembledMessage, AssemblerState, MessageAssembler};
pub use frame::{Frame, FrameHeader};
pub use handshake::{
    HandshakeRequest, HandshakeResponse, WS_GUID, compute_accept_key, find_head_end,
    generate_key, write_rejection,
};
pub use mask::{apply_mask, apply_mask_fast};
pub use opcode::OpCode;
pub use validation::FrameValidator;
