//! Length-prefixed multipart message framing.
//!
//! A message is one or more parts. Each part travels as one frame:
//! - 2-byte magic ("SM") for stream synchronization
//! - 4-byte little-endian payload length
//! - 2-byte little-endian flags (`MORE` when another part follows,
//!   `CONTROL` for connection-management frames such as the handshake)
//!
//! Routing envelopes are ordinary parts; an empty part is the delimiter
//! between the routing prefix and the body.

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, Multipart, CONTROL, DEFAULT_MAX_PARTS,
    DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MORE,
};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
