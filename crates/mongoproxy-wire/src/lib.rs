//! Document-database wire protocol codec for mongoproxy.
//!
//! Every message on the wire is framed with a 16-byte header:
//! - `messageLength` (int32 LE, header included)
//! - `requestID` (int32 LE)
//! - `responseTo` (int32 LE)
//! - `opCode` (int32 LE)
//!
//! followed by an op-code specific body. This crate turns inbound frames into
//! typed [`Request`] values and [`Response`] values back into reply frames,
//! covering the legacy op codes (query, insert, update, delete, get-more,
//! kill-cursors, reply) and the single-command `OP_MSG` framing.

pub mod codec;
pub mod error;
pub mod header;
pub mod namespace;
pub mod reader;
pub mod request;
pub mod response;
pub mod writer;

mod body;

pub use codec::{
    decode_frame, decode_reply, decode_request, encode_msg, encode_request, encode_response,
    next_request_id, Frame, ServerReply,
};
pub use error::{Result, WireError};
pub use header::{MsgHeader, OpCode, DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE};
pub use namespace::Namespace;
pub use reader::FrameReader;
pub use request::{
    CommandRequest, DeleteRequest, DocumentSequence, FindRequest, GetMoreRequest, InsertRequest,
    KillCursorsRequest, MsgRequest, OtherRequest, Request, RequestKind, SingleDelete,
    SingleUpdate, UpdateRequest,
};
pub use response::{
    CommandError, CommandReply, DeleteReply, FindReply, GetMoreReply, InsertReply, Outcome,
    Reply, Response, UpdateReply, NOT_APPLICABLE,
};
pub use writer::FrameWriter;
