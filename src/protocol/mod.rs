//! Protocol module - handshake, headers and framing.
//!
//! This module implements the wire protocol of a connection:
//! - JSON option handshake, sent once by the client
//! - `Header` carried before every body
//! - length-prefixed header/body frames encoded by the negotiated codec

mod frame;
mod handshake;
mod header;

pub use frame::{FrameReader, FrameWriter, OutboundFrame, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE};
pub use handshake::{
    read_options, write_options, Options, DEFAULT_CONNECT_TIMEOUT, MAGIC_NUMBER, MAX_HANDSHAKE_SIZE,
};
pub use header::Header;
