//! WebSocket protocol core (RFC 6455): frame headers, masking,
//! handshake and UTF-8 validation.

pub mod frame;
pub mod handshake;
pub mod mask;
pub mod opcode;
pub mod utf8;

pub use frame::{encode_header, FrameHeader, MAX_CONTROL_PAYLOAD, MAX_HEADER_SIZE};
pub use handshake::{
    compute_accept_key, contains_token, select_subprotocol, HttpRejection, Origin, UpgradeRequest,
    UpgradeResponse, WS_GUID,
};
pub use mask::{apply_mask, apply_mask_offset};
pub use opcode::OpCode;
pub use utf8::{floor_char_boundary, Utf8Validator};
