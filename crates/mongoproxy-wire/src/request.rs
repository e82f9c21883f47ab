//! Typed inbound requests.
//!
//! Each variant carries what a backend needs to reproduce the operation:
//! the namespace split into database and collection, the filter/update
//! documents, batch sizes and cursor ids. Variants know how to parse
//! themselves from a frame body and how to write themselves back out, so
//! the same model serves the proxy (decoding client traffic) and the native
//! backend client (encoding traffic towards the server).

use std::fmt;

use bson::{doc, Bson, Document};
use bytes::{BufMut, Bytes, BytesMut};

use crate::body::{put_cstring, put_document, BodyReader};
use crate::error::{Result, WireError};
use crate::header::OpCode;
use crate::namespace::Namespace;

/// `OP_QUERY` flag bits that matter to the proxy.
pub mod query_flags {
    pub const TAILABLE_CURSOR: i32 = 1 << 1;
    pub const SECONDARY_OK: i32 = 1 << 2;
    pub const NO_CURSOR_TIMEOUT: i32 = 1 << 4;
}

const INSERT_CONTINUE_ON_ERROR: i32 = 1;
const UPDATE_UPSERT: i32 = 1;
const UPDATE_MULTI: i32 = 1 << 1;
const DELETE_SINGLE_REMOVE: i32 = 1;

/// `OP_MSG` flag bits.
pub mod msg_flags {
    pub const CHECKSUM_PRESENT: u32 = 1;
    pub const MORE_TO_COME: u32 = 1 << 1;
    pub const EXHAUST_ALLOWED: u32 = 1 << 16;
}

const SECTION_BODY: u8 = 0;
const SECTION_DOCUMENT_SEQUENCE: u8 = 1;

/// Discriminant of a [`Request`], used to pick reply framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Command,
    Find,
    Insert,
    Update,
    Delete,
    GetMore,
    KillCursors,
    Msg,
    Other,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Command => "command",
            RequestKind::Find => "find",
            RequestKind::Insert => "insert",
            RequestKind::Update => "update",
            RequestKind::Delete => "delete",
            RequestKind::GetMore => "getMore",
            RequestKind::KillCursors => "killCursors",
            RequestKind::Msg => "msg",
            RequestKind::Other => "other",
        }
    }

    /// Mutations whose outcome is never sent back directly.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            RequestKind::Insert | RequestKind::Update | RequestKind::Delete
        )
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command addressed to `<db>.$cmd` through `OP_QUERY`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub database: String,
    /// First key of `args`.
    pub command_name: String,
    pub args: Document,
    /// Query modifiers that accompanied a `$query`-wrapped command
    /// (`$readPreference` and friends).
    pub metadata: Document,
    pub input_docs: Vec<Document>,
    pub flags: i32,
}

impl CommandRequest {
    pub fn new(database: impl Into<String>, args: Document) -> Result<Self> {
        let command_name = first_key(&args, "OP_QUERY")?;
        Ok(Self {
            database: database.into(),
            command_name,
            args,
            metadata: Document::new(),
            input_docs: Vec::new(),
            flags: 0,
        })
    }

    pub fn to_command(&self) -> Document {
        self.args.clone()
    }
}

/// A legacy query against a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct FindRequest {
    pub namespace: Namespace,
    pub filter: Document,
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub skip: i32,
    /// Maximum documents to return; zero means no limit.
    pub limit: i32,
    pub flags: i32,
}

impl FindRequest {
    pub fn new(namespace: Namespace, filter: Document) -> Self {
        Self {
            namespace,
            filter,
            projection: None,
            sort: None,
            skip: 0,
            limit: 0,
            flags: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertRequest {
    pub namespace: Namespace,
    pub documents: Vec<Document>,
    pub ordered: bool,
}

impl InsertRequest {
    pub fn to_command(&self) -> Document {
        doc! {
            "insert": &self.namespace.collection,
            "documents": self.documents.iter().cloned().map(Bson::Document).collect::<Vec<_>>(),
            "ordered": self.ordered,
        }
    }
}

/// One update statement.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleUpdate {
    pub selector: Document,
    pub update: Document,
    pub upsert: bool,
    pub multi: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub namespace: Namespace,
    pub updates: Vec<SingleUpdate>,
    pub ordered: bool,
}

impl UpdateRequest {
    pub fn to_command(&self) -> Document {
        let updates: Vec<Bson> = self
            .updates
            .iter()
            .map(|u| {
                Bson::Document(doc! {
                    "q": u.selector.clone(),
                    "u": u.update.clone(),
                    "upsert": u.upsert,
                    "multi": u.multi,
                })
            })
            .collect();
        doc! {
            "update": &self.namespace.collection,
            "updates": updates,
            "ordered": self.ordered,
        }
    }
}

/// One delete statement. `limit` is 1 for single-document removal, 0 for all matches.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleDelete {
    pub selector: Document,
    pub limit: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRequest {
    pub namespace: Namespace,
    pub deletes: Vec<SingleDelete>,
    pub ordered: bool,
}

impl DeleteRequest {
    pub fn to_command(&self) -> Document {
        let deletes: Vec<Bson> = self
            .deletes
            .iter()
            .map(|d| Bson::Document(doc! { "q": d.selector.clone(), "limit": d.limit }))
            .collect();
        doc! {
            "delete": &self.namespace.collection,
            "deletes": deletes,
            "ordered": self.ordered,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetMoreRequest {
    pub namespace: Namespace,
    /// Documents wanted in this batch; zero or less means "whatever is left".
    pub batch_size: i32,
    pub cursor_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KillCursorsRequest {
    pub cursor_ids: Vec<i64>,
}

/// A kind-1 `OP_MSG` section: a named run of documents.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSequence {
    pub identifier: String,
    pub documents: Vec<Document>,
}

/// A single-command `OP_MSG` request.
#[derive(Debug, Clone, PartialEq)]
pub struct MsgRequest {
    pub flags: u32,
    pub body: Document,
    pub sequences: Vec<DocumentSequence>,
}

impl MsgRequest {
    pub fn new(body: Document) -> Self {
        Self {
            flags: 0,
            body,
            sequences: Vec::new(),
        }
    }

    /// Target database (`$db`), `admin` when absent.
    pub fn database(&self) -> &str {
        self.body.get_str("$db").unwrap_or("admin")
    }

    pub fn command_name(&self) -> &str {
        self.body.keys().next().map(String::as_str).unwrap_or("")
    }

    /// The client does not wait for a reply.
    pub fn more_to_come(&self) -> bool {
        self.flags & msg_flags::MORE_TO_COME != 0
    }

    /// The command body with document sequences folded in as arrays and
    /// `$db` removed, i.e. what a `runCommand` call takes.
    pub fn to_command(&self) -> Document {
        let mut command = self.body.clone();
        command.remove("$db");
        for sequence in &self.sequences {
            let docs: Vec<Bson> = sequence
                .documents
                .iter()
                .cloned()
                .map(Bson::Document)
                .collect();
            command.insert(sequence.identifier.clone(), docs);
        }
        command
    }
}

/// Traffic for an op code without a dedicated parser, kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct OtherRequest {
    pub op_code: i32,
    pub body: Bytes,
}

/// A decoded inbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Command(CommandRequest),
    Find(FindRequest),
    Insert(InsertRequest),
    Update(UpdateRequest),
    Delete(DeleteRequest),
    GetMore(GetMoreRequest),
    KillCursors(KillCursorsRequest),
    Msg(MsgRequest),
    Other(OtherRequest),
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Command(_) => RequestKind::Command,
            Request::Find(_) => RequestKind::Find,
            Request::Insert(_) => RequestKind::Insert,
            Request::Update(_) => RequestKind::Update,
            Request::Delete(_) => RequestKind::Delete,
            Request::GetMore(_) => RequestKind::GetMore,
            Request::KillCursors(_) => RequestKind::KillCursors,
            Request::Msg(_) => RequestKind::Msg,
            Request::Other(_) => RequestKind::Other,
        }
    }

    /// Collection namespace for collection-scoped operations.
    pub fn namespace(&self) -> Option<&Namespace> {
        match self {
            Request::Find(r) => Some(&r.namespace),
            Request::Insert(r) => Some(&r.namespace),
            Request::Update(r) => Some(&r.namespace),
            Request::Delete(r) => Some(&r.namespace),
            Request::GetMore(r) => Some(&r.namespace),
            _ => None,
        }
    }

    pub fn database(&self) -> Option<&str> {
        match self {
            Request::Command(r) => Some(&r.database),
            Request::Msg(r) => Some(r.database()),
            other => other.namespace().map(|ns| ns.database.as_str()),
        }
    }

    /// Command name for command-shaped requests.
    pub fn command_name(&self) -> Option<&str> {
        match self {
            Request::Command(r) => Some(&r.command_name),
            Request::Msg(r) => Some(r.command_name()),
            _ => None,
        }
    }

    /// Whether the protocol expects a reply frame for this request.
    ///
    /// Writes are answered through a later `getLastError`, `OP_KILL_CURSORS`
    /// has no reply at all, and `OP_MSG` with `moreToCome` asks for none.
    pub fn expects_reply(&self) -> bool {
        match self {
            Request::Insert(_)
            | Request::Update(_)
            | Request::Delete(_)
            | Request::KillCursors(_) => false,
            Request::Msg(msg) => !msg.more_to_come(),
            _ => true,
        }
    }

    /// Op code this request travels under.
    pub fn op_code(&self) -> OpCode {
        match self {
            Request::Command(_) | Request::Find(_) => OpCode::Query,
            Request::Insert(_) => OpCode::Insert,
            Request::Update(_) => OpCode::Update,
            Request::Delete(_) => OpCode::Delete,
            Request::GetMore(_) => OpCode::GetMore,
            Request::KillCursors(_) => OpCode::KillCursors,
            Request::Msg(_) => OpCode::Msg,
            Request::Other(r) => OpCode::from(r.op_code),
        }
    }
}

fn first_key(doc: &Document, op: &'static str) -> Result<String> {
    doc.keys()
        .next()
        .cloned()
        .ok_or_else(|| WireError::malformed(op, "empty command document"))
}

/// `{ $query: {...}, <modifiers> }` or `{ query: {...}, ... }` when the first
/// key wraps the real query document.
fn split_query_wrapper(query: &Document) -> Option<(Document, Document)> {
    let (key, value) = query.iter().next()?;
    if key != "$query" && key != "query" {
        return None;
    }
    let Bson::Document(inner) = value else {
        return None;
    };
    let modifiers: Document = query
        .iter()
        .skip(1)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Some((inner.clone(), modifiers))
}

fn read_namespace(body: &mut BodyReader) -> Result<Namespace> {
    Namespace::parse(&body.cstring("fullCollectionName")?)
}

pub(crate) fn decode_query(mut body: BodyReader) -> Result<Request> {
    let flags = body.i32("flags")?;
    let namespace = read_namespace(&mut body)?;
    let skip = body.i32("numberToSkip")?;
    let number_to_return = body.i32("numberToReturn")?;
    let query = body.document("query")?;
    let projection = if body.has_remaining() {
        Some(body.document("returnFieldsSelector")?)
    } else {
        None
    };

    let wrapped = split_query_wrapper(&query);

    if namespace.is_command() {
        let (args, metadata) = wrapped.unwrap_or((query, Document::new()));
        let mut command = CommandRequest::new(namespace.database, args)?;
        command.metadata = metadata;
        command.flags = flags;
        return Ok(Request::Command(command));
    }

    let (filter, sort) = match wrapped {
        Some((filter, modifiers)) => {
            let sort = modifiers
                .get_document("$orderby")
                .or_else(|_| modifiers.get_document("orderby"))
                .ok()
                .cloned();
            (filter, sort)
        }
        None => (query, None),
    };

    Ok(Request::Find(FindRequest {
        namespace,
        filter,
        projection: projection.filter(|p| !p.is_empty()),
        sort,
        skip,
        limit: number_to_return.saturating_abs(),
        flags,
    }))
}

pub(crate) fn decode_insert(mut body: BodyReader) -> Result<Request> {
    let flags = body.i32("flags")?;
    let namespace = read_namespace(&mut body)?;
    let documents = body.documents("document")?;
    if documents.is_empty() {
        return Err(WireError::malformed("OP_INSERT", "no documents"));
    }
    Ok(Request::Insert(InsertRequest {
        namespace,
        documents,
        ordered: flags & INSERT_CONTINUE_ON_ERROR == 0,
    }))
}

pub(crate) fn decode_update(mut body: BodyReader) -> Result<Request> {
    let _zero = body.i32("ZERO")?;
    let namespace = read_namespace(&mut body)?;
    let flags = body.i32("flags")?;
    let selector = body.document("selector")?;
    let update = body.document("update")?;
    Ok(Request::Update(UpdateRequest {
        namespace,
        updates: vec![SingleUpdate {
            selector,
            update,
            upsert: flags & UPDATE_UPSERT != 0,
            multi: flags & UPDATE_MULTI != 0,
        }],
        ordered: true,
    }))
}

pub(crate) fn decode_delete(mut body: BodyReader) -> Result<Request> {
    let _zero = body.i32("ZERO")?;
    let namespace = read_namespace(&mut body)?;
    let flags = body.i32("flags")?;
    let selector = body.document("selector")?;
    let limit = if flags & DELETE_SINGLE_REMOVE != 0 { 1 } else { 0 };
    Ok(Request::Delete(DeleteRequest {
        namespace,
        deletes: vec![SingleDelete { selector, limit }],
        ordered: true,
    }))
}

pub(crate) fn decode_get_more(mut body: BodyReader) -> Result<Request> {
    let _zero = body.i32("ZERO")?;
    let namespace = read_namespace(&mut body)?;
    let batch_size = body.i32("numberToReturn")?;
    let cursor_id = body.i64("cursorID")?;
    Ok(Request::GetMore(GetMoreRequest {
        namespace,
        batch_size,
        cursor_id,
    }))
}

pub(crate) fn decode_kill_cursors(mut body: BodyReader) -> Result<Request> {
    let _zero = body.i32("ZERO")?;
    let count = body.i32("numberOfCursorIDs")?;
    if count < 0 || count as usize * 8 > body.remaining() {
        return Err(WireError::malformed(
            "OP_KILL_CURSORS",
            format!("cursor count {count} does not match body"),
        ));
    }
    let cursor_ids = (0..count)
        .map(|_| body.i64("cursorID"))
        .collect::<Result<Vec<_>>>()?;
    Ok(Request::KillCursors(KillCursorsRequest { cursor_ids }))
}

pub(crate) fn decode_msg(mut body: BodyReader) -> Result<MsgRequest> {
    let flags = body.u32("flagBits")?;
    if flags & msg_flags::CHECKSUM_PRESENT != 0 {
        body.truncate_tail(4, "checksum")?;
    }

    let mut command = None;
    let mut sequences = Vec::new();
    while body.has_remaining() {
        match body.u8("section kind")? {
            SECTION_BODY => {
                if command.is_some() {
                    return Err(WireError::malformed("OP_MSG", "more than one body section"));
                }
                command = Some(body.document("body")?);
            }
            SECTION_DOCUMENT_SEQUENCE => {
                let size = body.i32("section size")?;
                if size < 4 {
                    return Err(WireError::malformed(
                        "OP_MSG",
                        format!("invalid document sequence size {size}"),
                    ));
                }
                let mut section = body.sub_reader(size as usize - 4, "document sequence")?;
                let identifier = section.cstring("sequence identifier")?;
                let documents = section.documents("sequence document")?;
                sequences.push(DocumentSequence {
                    identifier,
                    documents,
                });
            }
            other => {
                return Err(WireError::malformed(
                    "OP_MSG",
                    format!("unsupported section kind {other}"),
                ));
            }
        }
    }

    let body = command.ok_or_else(|| WireError::malformed("OP_MSG", "missing body section"))?;
    Ok(MsgRequest {
        flags: flags & !msg_flags::CHECKSUM_PRESENT,
        body,
        sequences,
    })
}

impl Request {
    /// Write this request's body in its native framing.
    pub(crate) fn encode_body(&self, dst: &mut BytesMut) -> Result<()> {
        match self {
            Request::Command(r) => {
                dst.put_i32_le(r.flags);
                put_cstring(dst, &format!("{}.$cmd", r.database));
                dst.put_i32_le(0);
                dst.put_i32_le(-1);
                if r.metadata.is_empty() {
                    put_document(dst, &r.args)?;
                } else {
                    let mut wrapped = doc! { "$query": r.args.clone() };
                    wrapped.extend(r.metadata.clone());
                    put_document(dst, &wrapped)?;
                }
            }
            Request::Find(r) => {
                dst.put_i32_le(r.flags);
                put_cstring(dst, &r.namespace.to_string());
                dst.put_i32_le(r.skip);
                dst.put_i32_le(-r.limit);
                let needs_wrapper =
                    r.sort.is_some() || split_query_wrapper(&r.filter).is_some();
                if needs_wrapper {
                    let mut wrapped = doc! { "$query": r.filter.clone() };
                    if let Some(sort) = &r.sort {
                        wrapped.insert("$orderby", sort.clone());
                    }
                    put_document(dst, &wrapped)?;
                } else {
                    put_document(dst, &r.filter)?;
                }
                if let Some(projection) = &r.projection {
                    put_document(dst, projection)?;
                }
            }
            Request::Insert(r) => {
                let flags = if r.ordered { 0 } else { INSERT_CONTINUE_ON_ERROR };
                dst.put_i32_le(flags);
                put_cstring(dst, &r.namespace.to_string());
                for doc in &r.documents {
                    put_document(dst, doc)?;
                }
            }
            Request::Update(r) => {
                let [single] = r.updates.as_slice() else {
                    return Err(WireError::malformed(
                        "OP_UPDATE",
                        "legacy framing carries exactly one update",
                    ));
                };
                dst.put_i32_le(0);
                put_cstring(dst, &r.namespace.to_string());
                let mut flags = 0;
                if single.upsert {
                    flags |= UPDATE_UPSERT;
                }
                if single.multi {
                    flags |= UPDATE_MULTI;
                }
                dst.put_i32_le(flags);
                put_document(dst, &single.selector)?;
                put_document(dst, &single.update)?;
            }
            Request::Delete(r) => {
                let [single] = r.deletes.as_slice() else {
                    return Err(WireError::malformed(
                        "OP_DELETE",
                        "legacy framing carries exactly one delete",
                    ));
                };
                dst.put_i32_le(0);
                put_cstring(dst, &r.namespace.to_string());
                let flags = if single.limit == 1 {
                    DELETE_SINGLE_REMOVE
                } else {
                    0
                };
                dst.put_i32_le(flags);
                put_document(dst, &single.selector)?;
            }
            Request::GetMore(r) => {
                dst.put_i32_le(0);
                put_cstring(dst, &r.namespace.to_string());
                dst.put_i32_le(r.batch_size);
                dst.put_i64_le(r.cursor_id);
            }
            Request::KillCursors(r) => {
                dst.put_i32_le(0);
                dst.put_i32_le(r.cursor_ids.len() as i32);
                for id in &r.cursor_ids {
                    dst.put_i64_le(*id);
                }
            }
            Request::Msg(r) => encode_msg_body(dst, r.flags, &r.body, &r.sequences)?,
            Request::Other(r) => dst.put_slice(&r.body),
        }
        Ok(())
    }
}

pub(crate) fn encode_msg_body(
    dst: &mut BytesMut,
    flags: u32,
    body: &Document,
    sequences: &[DocumentSequence],
) -> Result<()> {
    dst.put_u32_le(flags & !msg_flags::CHECKSUM_PRESENT);
    dst.put_u8(SECTION_BODY);
    put_document(dst, body)?;
    for sequence in sequences {
        let mut section = BytesMut::new();
        put_cstring(&mut section, &sequence.identifier);
        for doc in &sequence.documents {
            put_document(&mut section, doc)?;
        }
        dst.put_u8(SECTION_DOCUMENT_SEQUENCE);
        dst.put_i32_le(section.len() as i32 + 4);
        dst.put_slice(&section);
    }
    Ok(())
}
