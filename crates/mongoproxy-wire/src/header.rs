use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, WireError};

/// Header: messageLength (4) + requestID (4) + responseTo (4) + opCode (4).
pub const HEADER_SIZE: usize = 16;

/// Default maximum message size: 48 MB, the server's advertised
/// `maxMessageSizeBytes`.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;

/// Operation codes of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
    Msg,
    /// Any op code this proxy has no dedicated parser for.
    Other(i32),
}

impl OpCode {
    pub const OP_REPLY: i32 = 1;
    pub const OP_UPDATE: i32 = 2001;
    pub const OP_INSERT: i32 = 2002;
    pub const OP_QUERY: i32 = 2004;
    pub const OP_GET_MORE: i32 = 2005;
    pub const OP_DELETE: i32 = 2006;
    pub const OP_KILL_CURSORS: i32 = 2007;
    pub const OP_MSG: i32 = 2013;

    pub fn code(self) -> i32 {
        match self {
            OpCode::Reply => Self::OP_REPLY,
            OpCode::Update => Self::OP_UPDATE,
            OpCode::Insert => Self::OP_INSERT,
            OpCode::Query => Self::OP_QUERY,
            OpCode::GetMore => Self::OP_GET_MORE,
            OpCode::Delete => Self::OP_DELETE,
            OpCode::KillCursors => Self::OP_KILL_CURSORS,
            OpCode::Msg => Self::OP_MSG,
            OpCode::Other(code) => code,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Reply => "OP_REPLY",
            OpCode::Update => "OP_UPDATE",
            OpCode::Insert => "OP_INSERT",
            OpCode::Query => "OP_QUERY",
            OpCode::GetMore => "OP_GET_MORE",
            OpCode::Delete => "OP_DELETE",
            OpCode::KillCursors => "OP_KILL_CURSORS",
            OpCode::Msg => "OP_MSG",
            OpCode::Other(_) => "OP_UNKNOWN",
        }
    }
}

impl From<i32> for OpCode {
    fn from(value: i32) -> Self {
        match value {
            Self::OP_REPLY => OpCode::Reply,
            Self::OP_UPDATE => OpCode::Update,
            Self::OP_INSERT => OpCode::Insert,
            Self::OP_QUERY => OpCode::Query,
            Self::OP_GET_MORE => OpCode::GetMore,
            Self::OP_DELETE => OpCode::Delete,
            Self::OP_KILL_CURSORS => OpCode::KillCursors,
            Self::OP_MSG => OpCode::Msg,
            other => OpCode::Other(other),
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

/// The fixed frame header.
///
/// Invariant: `message_length == HEADER_SIZE + body length`. A reply's
/// `response_to` equals the `request_id` of the frame it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MsgHeader {
    /// Build a header for a body of `body_len` bytes.
    pub fn for_body(body_len: usize, request_id: i32, response_to: i32, op_code: OpCode) -> Self {
        Self {
            message_length: (HEADER_SIZE + body_len) as i32,
            request_id,
            response_to,
            op_code,
        }
    }

    /// Length of the body that follows this header.
    pub fn body_len(&self) -> usize {
        (self.message_length as usize).saturating_sub(HEADER_SIZE)
    }

    /// Parse and validate a header from the first [`HEADER_SIZE`] bytes of `src`.
    ///
    /// Does not consume anything; callers advance once the whole frame is present.
    pub fn peek(src: &[u8], max_message_size: usize) -> Result<Self> {
        debug_assert!(src.len() >= HEADER_SIZE);
        let mut raw = &src[..HEADER_SIZE];
        let message_length = raw.get_i32_le();
        let request_id = raw.get_i32_le();
        let response_to = raw.get_i32_le();
        let op_code = OpCode::from(raw.get_i32_le());

        if message_length < HEADER_SIZE as i32 {
            return Err(WireError::InvalidLength(message_length));
        }
        if message_length as usize > max_message_size {
            return Err(WireError::MessageTooLarge {
                size: message_length as usize,
                max: max_message_size,
            });
        }

        Ok(Self {
            message_length,
            request_id,
            response_to,
            op_code,
        })
    }

    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.message_length);
        dst.put_i32_le(self.request_id);
        dst.put_i32_le(self.response_to);
        dst.put_i32_le(self.op_code.code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_code_table_roundtrips() {
        for code in [1, 2001, 2002, 2004, 2005, 2006, 2007, 2013, 2012, 9999] {
            assert_eq!(OpCode::from(code).code(), code);
        }
        assert_eq!(OpCode::from(2010), OpCode::Other(2010));
    }

    #[test]
    fn header_write_then_peek() {
        let header = MsgHeader::for_body(10, 7, 3, OpCode::Query);
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);

        assert_eq!(buf.len(), HEADER_SIZE);
        let parsed = MsgHeader::peek(&buf, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.body_len(), 10);
    }

    #[test]
    fn peek_rejects_short_length() {
        let mut buf = BytesMut::new();
        MsgHeader {
            message_length: 8,
            request_id: 1,
            response_to: 0,
            op_code: OpCode::Msg,
        }
        .write_to(&mut buf);

        let err = MsgHeader::peek(&buf, DEFAULT_MAX_MESSAGE_SIZE).unwrap_err();
        assert!(matches!(err, WireError::InvalidLength(8)));
        assert!(err.is_fatal());
    }

    #[test]
    fn peek_rejects_oversized_length() {
        let mut buf = BytesMut::new();
        MsgHeader::for_body(1024, 1, 0, OpCode::Msg).write_to(&mut buf);

        let err = MsgHeader::peek(&buf, 64).unwrap_err();
        assert!(matches!(err, WireError::MessageTooLarge { .. }));
    }
}
