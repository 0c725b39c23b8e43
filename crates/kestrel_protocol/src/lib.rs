//! Coordinator ↔ data-node wire protocol.
//!
//! Frames are a 1-byte tag, a 4-byte big-endian length that counts itself,
//! then the payload. The startup packet is the only untagged frame.

pub mod codec;
pub mod frame;

pub use codec::{
    command_row_count, decode_data_row, encode_data_row, BackendMessage, DescribeTarget,
    ErrorFields, FieldDescription, FrontendMessage,
};
pub use frame::{Frame, FrameBuffer, FRAME_HEADER_LEN};
