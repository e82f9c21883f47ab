use std::sync::atomic::{AtomicI32, Ordering};

use bson::Document;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::body::{put_document, BodyReader};
use crate::error::{Result, WireError};
use crate::header::{MsgHeader, OpCode, HEADER_SIZE};
use crate::request::{self, encode_msg_body, OtherRequest, Request, RequestKind};
use crate::response::{CommandError, Outcome, Reply, Response};

/// `OP_REPLY` response flags.
pub mod reply_flags {
    pub const CURSOR_NOT_FOUND: i32 = 1;
    pub const QUERY_FAILURE: i32 = 1 << 1;
    pub const AWAIT_CAPABLE: i32 = 1 << 3;
}

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Allocate a process-unique request id for an outbound frame.
pub fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// A complete frame: validated header plus its body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MsgHeader,
    pub body: Bytes,
}

impl Frame {
    /// Re-encode header and body into contiguous bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body.len());
        self.header.write_to(&mut buf);
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

/// Try to split one complete frame off the front of `src`.
///
/// Returns `Ok(None)` if more bytes are needed. Header validation errors
/// surface as soon as the header is buffered, before the body arrives.
pub fn decode_frame(src: &mut BytesMut, max_message_size: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header = MsgHeader::peek(src, max_message_size)?;
    let total = header.message_length as usize;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    let mut raw = src.split_to(total);
    raw.advance(HEADER_SIZE);
    Ok(Some(Frame {
        header,
        body: raw.freeze(),
    }))
}

/// Parse a frame body into a typed [`Request`] according to its op code.
///
/// Unknown op codes become [`Request::Other`] carrying the raw body. An
/// `OP_REPLY` arriving from a client is treated the same way.
pub fn decode_request(frame: &Frame) -> Result<Request> {
    let op = frame.header.op_code;
    let body = BodyReader::new(op.name(), frame.body.clone());
    match op {
        OpCode::Query => request::decode_query(body),
        OpCode::Insert => request::decode_insert(body),
        OpCode::Update => request::decode_update(body),
        OpCode::Delete => request::decode_delete(body),
        OpCode::GetMore => request::decode_get_more(body),
        OpCode::KillCursors => request::decode_kill_cursors(body),
        OpCode::Msg => request::decode_msg(body).map(Request::Msg),
        OpCode::Reply | OpCode::Other(_) => {
            tracing::trace!(op_code = op.code(), "unrecognised op code, keeping raw body");
            Ok(Request::Other(OtherRequest {
                op_code: op.code(),
                body: body.into_bytes(),
            }))
        }
    }
}

fn finish(request_id: i32, response_to: i32, op_code: OpCode, body: &[u8]) -> Bytes {
    let header = MsgHeader::for_body(body.len(), request_id, response_to, op_code);
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    header.write_to(&mut buf);
    buf.put_slice(body);
    buf.freeze()
}

/// Encode a request in its native framing under `request_id`.
pub fn encode_request(request_id: i32, request: &Request) -> Result<Bytes> {
    let mut body = BytesMut::new();
    request.encode_body(&mut body)?;
    Ok(finish(request_id, 0, request.op_code(), &body))
}

/// Encode a single-section `OP_MSG` frame.
pub fn encode_msg(request_id: i32, response_to: i32, flags: u32, body: &Document) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    encode_msg_body(&mut buf, flags, body, &[])?;
    Ok(finish(request_id, response_to, OpCode::Msg, &buf))
}

fn encode_op_reply(
    response_to: i32,
    flags: i32,
    cursor_id: i64,
    documents: &[Document],
) -> Result<Bytes> {
    let mut body = BytesMut::new();
    body.put_i32_le(flags);
    body.put_i64_le(cursor_id);
    body.put_i32_le(0);
    body.put_i32_le(documents.len() as i32);
    for doc in documents {
        put_document(&mut body, doc)?;
    }
    Ok(finish(next_request_id(), response_to, OpCode::Reply, &body))
}

fn query_failure(error: &CommandError) -> Document {
    bson::doc! { "$err": &error.message, "code": error.code }
}

/// Encode the reply frame answering `request`.
///
/// The framing follows the request: `OP_MSG` is answered with `OP_MSG`,
/// every legacy op code with `OP_REPLY`. Query-style requests (find and
/// get-more) report errors through the `QueryFailure` flag and invalidated
/// cursors through the `CursorNotFound` flag; command-style requests carry
/// errors as `{ ok: 0, errmsg, code }`. An empty response is encoded as an
/// unknown error so the client never waits on a reply that will not come.
pub fn encode_response(
    request: &MsgHeader,
    kind: RequestKind,
    response: &Response,
) -> Result<Bytes> {
    let response_to = request.request_id;

    if kind == RequestKind::Msg {
        return encode_msg(next_request_id(), response_to, 0, &response.to_document());
    }

    let query_style = matches!(kind, RequestKind::Find | RequestKind::GetMore);
    match response.outcome() {
        Outcome::Reply(Reply::Find(find)) => encode_op_reply(
            response_to,
            reply_flags::AWAIT_CAPABLE,
            find.cursor_id,
            &find.documents,
        ),
        Outcome::Reply(Reply::GetMore(more)) if more.invalid_cursor => {
            encode_op_reply(response_to, reply_flags::CURSOR_NOT_FOUND, 0, &[])
        }
        Outcome::Reply(Reply::GetMore(more)) => encode_op_reply(
            response_to,
            reply_flags::AWAIT_CAPABLE,
            more.cursor_id,
            &more.documents,
        ),
        Outcome::Reply(reply) => encode_op_reply(response_to, 0, 0, &[reply.to_document()]),
        Outcome::Error(error) if query_style => {
            encode_op_reply(response_to, reply_flags::QUERY_FAILURE, 0, &[query_failure(error)])
        }
        Outcome::Empty if query_style => encode_op_reply(
            response_to,
            reply_flags::QUERY_FAILURE,
            0,
            &[query_failure(&CommandError::unknown("no stage produced a response"))],
        ),
        Outcome::Error(_) | Outcome::Empty => {
            encode_op_reply(response_to, 0, 0, &[response.to_document()])
        }
    }
}

/// A reply frame as a client sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerReply {
    Legacy {
        flags: i32,
        cursor_id: i64,
        starting_from: i32,
        documents: Vec<Document>,
    },
    Msg {
        flags: u32,
        body: Document,
    },
}

impl ServerReply {
    /// The command-reply document: the `OP_MSG` body, or the first legacy document.
    pub fn into_document(self) -> Document {
        match self {
            ServerReply::Legacy { documents, .. } => {
                documents.into_iter().next().unwrap_or_default()
            }
            ServerReply::Msg { body, .. } => body,
        }
    }
}

/// Decode an `OP_REPLY` or `OP_MSG` reply frame.
pub fn decode_reply(frame: &Frame) -> Result<ServerReply> {
    let op = frame.header.op_code;
    let mut body = BodyReader::new(op.name(), frame.body.clone());
    match op {
        OpCode::Reply => {
            let flags = body.i32("responseFlags")?;
            let cursor_id = body.i64("cursorID")?;
            let starting_from = body.i32("startingFrom")?;
            let number_returned = body.i32("numberReturned")?;
            let documents = body.documents("document")?;
            if documents.len() != number_returned.max(0) as usize {
                return Err(WireError::malformed(
                    "OP_REPLY",
                    format!(
                        "numberReturned {number_returned} but {} documents present",
                        documents.len()
                    ),
                ));
            }
            Ok(ServerReply::Legacy {
                flags,
                cursor_id,
                starting_from,
                documents,
            })
        }
        OpCode::Msg => {
            let msg = request::decode_msg(body)?;
            let body = msg.to_command();
            Ok(ServerReply::Msg {
                flags: msg.flags,
                body,
            })
        }
        other => Err(WireError::malformed(
            other.name(),
            "not a reply op code",
        )),
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;
    use crate::header::DEFAULT_MAX_MESSAGE_SIZE;
    use crate::namespace::Namespace;
    use crate::request::{
        CommandRequest, DeleteRequest, FindRequest, GetMoreRequest, InsertRequest,
        KillCursorsRequest, MsgRequest, SingleDelete, SingleUpdate, UpdateRequest,
    };
    use crate::response::{
        CommandReply, DeleteReply, FindReply, GetMoreReply, InsertReply, UpdateReply,
    };

    fn frame_of(bytes: Bytes) -> Frame {
        let mut buf = BytesMut::from(bytes.as_ref());
        let frame = decode_frame(&mut buf, DEFAULT_MAX_MESSAGE_SIZE)
            .unwrap()
            .unwrap();
        assert!(buf.is_empty());
        frame
    }

    fn ns() -> Namespace {
        Namespace::new("app", "users")
    }

    fn roundtrip(request: Request) {
        let bytes = encode_request(77, &request).unwrap();
        let frame = frame_of(bytes);
        assert_eq!(frame.header.request_id, 77);
        assert_eq!(decode_request(&frame).unwrap(), request);
    }

    #[test]
    fn decode_frame_waits_for_complete_frame() {
        let bytes = encode_msg(1, 0, 0, &doc! { "ping": 1 }).unwrap();
        let mut partial = BytesMut::from(&bytes[..10]);
        assert!(decode_frame(&mut partial, DEFAULT_MAX_MESSAGE_SIZE)
            .unwrap()
            .is_none());

        let mut partial = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert!(decode_frame(&mut partial, DEFAULT_MAX_MESSAGE_SIZE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn decode_frame_splits_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_msg(1, 0, 0, &doc! { "a": 1 }).unwrap());
        buf.extend_from_slice(&encode_msg(2, 0, 0, &doc! { "b": 1 }).unwrap());

        let first = decode_frame(&mut buf, DEFAULT_MAX_MESSAGE_SIZE).unwrap().unwrap();
        let second = decode_frame(&mut buf, DEFAULT_MAX_MESSAGE_SIZE).unwrap().unwrap();
        assert_eq!(first.header.request_id, 1);
        assert_eq!(second.header.request_id, 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn every_request_kind_survives_encoding() {
        let mut command = CommandRequest::new("admin", doc! { "isMaster": 1 }).unwrap();
        command.metadata = doc! { "$readPreference": { "mode": "primary" } };
        roundtrip(Request::Command(command));

        roundtrip(Request::Find(FindRequest {
            namespace: ns(),
            filter: doc! { "age": { "$gt": 30 } },
            projection: Some(doc! { "name": 1 }),
            sort: Some(doc! { "age": 1 }),
            skip: 2,
            limit: 10,
            flags: 0,
        }));
        roundtrip(Request::Insert(InsertRequest {
            namespace: ns(),
            documents: vec![doc! { "_id": 1 }, doc! { "_id": 2 }],
            ordered: false,
        }));
        roundtrip(Request::Update(UpdateRequest {
            namespace: ns(),
            updates: vec![SingleUpdate {
                selector: doc! { "_id": 1 },
                update: doc! { "$inc": { "n": 1 } },
                upsert: true,
                multi: false,
            }],
            ordered: true,
        }));
        roundtrip(Request::Delete(DeleteRequest {
            namespace: ns(),
            deletes: vec![SingleDelete {
                selector: doc! { "_id": 1 },
                limit: 1,
            }],
            ordered: true,
        }));
        roundtrip(Request::GetMore(GetMoreRequest {
            namespace: ns(),
            batch_size: 50,
            cursor_id: 1234,
        }));
        roundtrip(Request::KillCursors(KillCursorsRequest {
            cursor_ids: vec![1, 2, 3],
        }));
        roundtrip(Request::Msg(MsgRequest::new(doc! { "find": "users", "$db": "app" })));
        roundtrip(Request::Other(OtherRequest {
            op_code: 2012,
            body: Bytes::from_static(b"\x01\x02\x03"),
        }));
    }

    #[test]
    fn unknown_op_code_passes_through_raw() {
        let request = Request::Other(OtherRequest {
            op_code: 4242,
            body: Bytes::from_static(b"opaque"),
        });
        let frame = frame_of(encode_request(5, &request).unwrap());
        let Request::Other(other) = decode_request(&frame).unwrap() else {
            panic!("expected other");
        };
        assert_eq!(other.op_code, 4242);
        assert_eq!(other.body.as_ref(), b"opaque");
    }

    fn header(request_id: i32, op: OpCode) -> MsgHeader {
        MsgHeader::for_body(0, request_id, 0, op)
    }

    fn reply_of(
        request: &MsgHeader,
        kind: RequestKind,
        response: &Response,
    ) -> (Frame, ServerReply) {
        let frame = frame_of(encode_response(request, kind, response).unwrap());
        assert_eq!(frame.header.response_to, request.request_id);
        let reply = decode_reply(&frame).unwrap();
        (frame, reply)
    }

    #[test]
    fn find_reply_roundtrips_documents_and_cursor() {
        let docs = vec![doc! { "_id": 1 }, doc! { "_id": 2 }];
        let mut response = Response::new();
        response.write(FindReply {
            namespace: ns(),
            documents: docs.clone(),
            cursor_id: 0,
        });

        let (frame, reply) = reply_of(&header(9, OpCode::Query), RequestKind::Find, &response);
        assert_eq!(frame.header.op_code, OpCode::Reply);
        let ServerReply::Legacy { documents, cursor_id, flags, .. } = reply else {
            panic!("expected legacy reply");
        };
        assert_eq!(documents, docs);
        assert_eq!(cursor_id, 0);
        assert_eq!(flags & reply_flags::QUERY_FAILURE, 0);
    }

    #[test]
    fn find_error_sets_query_failure() {
        let mut response = Response::new();
        response.write_error(CommandError::new(2, "bad filter"));

        let (_, reply) = reply_of(&header(3, OpCode::Query), RequestKind::Find, &response);
        let ServerReply::Legacy { flags, documents, .. } = reply else {
            panic!("expected legacy reply");
        };
        assert_ne!(flags & reply_flags::QUERY_FAILURE, 0);
        assert_eq!(documents[0].get_str("$err").unwrap(), "bad filter");
        assert_eq!(documents[0].get_i32("code").unwrap(), 2);
    }

    #[test]
    fn get_more_reply_carries_cursor_and_end_flag() {
        let mut response = Response::new();
        response.write(GetMoreReply {
            namespace: ns(),
            cursor_id: 0,
            documents: vec![doc! { "x": 1 }],
            invalid_cursor: false,
        });
        let (_, reply) = reply_of(&header(4, OpCode::GetMore), RequestKind::GetMore, &response);
        let ServerReply::Legacy { cursor_id, documents, flags, .. } = reply else {
            panic!("expected legacy reply");
        };
        assert_eq!(cursor_id, 0);
        assert_eq!(documents.len(), 1);
        assert_eq!(flags & reply_flags::CURSOR_NOT_FOUND, 0);

        let mut response = Response::new();
        response.write(GetMoreReply::invalid(ns(), 55));
        let (_, reply) = reply_of(&header(5, OpCode::GetMore), RequestKind::GetMore, &response);
        let ServerReply::Legacy { flags, documents, .. } = reply else {
            panic!("expected legacy reply");
        };
        assert_ne!(flags & reply_flags::CURSOR_NOT_FOUND, 0);
        assert!(documents.is_empty());
    }

    #[test]
    fn command_reply_and_error_roundtrip() {
        let mut response = Response::new();
        response.write(CommandReply {
            reply: doc! { "ismaster": true, "ok": 1.0 },
        });
        let (_, reply) = reply_of(&header(6, OpCode::Query), RequestKind::Command, &response);
        assert_eq!(reply.into_document(), doc! { "ismaster": true, "ok": 1.0 });

        let mut response = Response::new();
        response.write_error(CommandError::new(13, "unauthorized"));
        let (_, reply) = reply_of(&header(7, OpCode::Query), RequestKind::Command, &response);
        let doc = reply.into_document();
        assert_eq!(doc.get_f64("ok").unwrap(), 0.0);
        assert_eq!(doc.get_i32("code").unwrap(), 13);
        assert_eq!(doc.get_str("errmsg").unwrap(), "unauthorized");
    }

    #[test]
    fn write_replies_are_encodable() {
        for reply in [
            Reply::Insert(InsertReply { n: 3, write_errors: vec![] }),
            Reply::Update(UpdateReply {
                n: 1,
                n_modified: 1,
                upserted: vec![],
                write_errors: vec![],
            }),
            Reply::Delete(DeleteReply { n: 4, write_errors: vec![] }),
        ] {
            let mut response = Response::new();
            response.write(reply.clone());
            let (_, decoded) = reply_of(&header(8, OpCode::Insert), RequestKind::Insert, &response);
            assert_eq!(decoded.into_document(), reply.to_document());
        }
    }

    #[test]
    fn msg_requests_get_msg_replies() {
        let mut response = Response::new();
        response.write(FindReply {
            namespace: ns(),
            documents: vec![doc! { "_id": 7 }],
            cursor_id: 0,
        });
        let (frame, reply) = reply_of(&header(10, OpCode::Msg), RequestKind::Msg, &response);
        assert_eq!(frame.header.op_code, OpCode::Msg);
        let body = reply.into_document();
        let cursor = body.get_document("cursor").unwrap();
        assert_eq!(cursor.get_str("ns").unwrap(), "app.users");
        assert_eq!(cursor.get_array("firstBatch").unwrap().len(), 1);
    }

    #[test]
    fn reply_request_ids_are_fresh() {
        let response = Response::new();
        let request = header(1, OpCode::Msg);
        let a = frame_of(encode_response(&request, RequestKind::Msg, &response).unwrap());
        let b = frame_of(encode_response(&request, RequestKind::Msg, &response).unwrap());
        assert_ne!(a.header.request_id, b.header.request_id);
    }

    #[test]
    fn decode_reply_rejects_request_op_codes() {
        let frame = frame_of(encode_request(1, &Request::KillCursors(KillCursorsRequest {
            cursor_ids: vec![],
        })).unwrap());
        assert!(decode_reply(&frame).is_err());
    }
}
