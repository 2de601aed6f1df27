//! Protocol module containing the upgrade handshake, the frame codec, the
//! deflate contexts, and the session handshake messages.

pub mod deflate;
pub mod frame;
pub mod handshake;
pub mod messages;

pub use deflate::{DeflateError, MessageDeflater, MessageInflater};
pub use frame::{decode_frame, encode_frame, encode_frame_masked, Frame, FrameError, Opcode};
pub use handshake::{
    bad_request_response, compute_upgrade_response, parse_request_head, HandshakeError,
    HandshakeResult, UpgradeHeaders, UpgradeRequest,
};
pub use messages::*;
