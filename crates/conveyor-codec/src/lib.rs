//! Wire envelope and payload codec for conveyor node messages.
//!
//! Every message is a UTF-8 JSON envelope carrying a performative tag and a
//! typed payload whose integer `msg_type` selects the payload schema.

pub mod envelope;
pub mod error;
pub mod payload;

pub use envelope::{decode_envelope, encode_envelope, Envelope, Performative, ReplyBody};
pub use error::CodecError;
pub use payload::{
    ChangeState, FindPathAbort, FindPathReply, FindPathReq, MessageType, Payload, TransferPallet,
    MAX_PATH_LEN,
};
