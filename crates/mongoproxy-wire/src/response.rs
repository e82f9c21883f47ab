//! The response carrier stages write into.

use std::fmt;

use bson::{doc, Bson, Document};

use crate::namespace::Namespace;

/// Count reported when an operation was deliberately not performed.
pub const NOT_APPLICABLE: i32 = -1;

/// A structured command failure: numeric code plus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub code: i32,
    pub message: String,
}

impl CommandError {
    pub const INTERNAL_ERROR: i32 = 1;
    pub const BAD_VALUE: i32 = 2;
    pub const UNKNOWN_ERROR: i32 = 8;
    pub const FAILED_TO_PARSE: i32 = 9;
    pub const CURSOR_NOT_FOUND: i32 = 43;
    pub const COMMAND_NOT_FOUND: i32 = 59;
    pub const INVALID_NAMESPACE: i32 = 73;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Self::UNKNOWN_ERROR, message)
    }

    /// `{ ok: 0, errmsg, code }`, the command-reply shape of an error.
    pub fn to_document(&self) -> Document {
        doc! { "ok": 0.0, "errmsg": &self.message, "code": self.code }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for CommandError {}

#[derive(Debug, Clone, PartialEq)]
pub struct FindReply {
    pub namespace: Namespace,
    pub documents: Vec<Document>,
    /// Zero once the result set is exhausted.
    pub cursor_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertReply {
    pub n: i32,
    pub write_errors: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateReply {
    pub n: i32,
    pub n_modified: i32,
    pub upserted: Vec<Document>,
    pub write_errors: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteReply {
    pub n: i32,
    pub write_errors: Vec<Document>,
}

impl InsertReply {
    pub fn not_applicable() -> Self {
        Self {
            n: NOT_APPLICABLE,
            write_errors: Vec::new(),
        }
    }
}

impl UpdateReply {
    pub fn not_applicable() -> Self {
        Self {
            n: NOT_APPLICABLE,
            n_modified: NOT_APPLICABLE,
            upserted: Vec::new(),
            write_errors: Vec::new(),
        }
    }
}

impl DeleteReply {
    pub fn not_applicable() -> Self {
        Self {
            n: NOT_APPLICABLE,
            write_errors: Vec::new(),
        }
    }
}

/// A raw command reply, passed through as the backend produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub reply: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetMoreReply {
    pub namespace: Namespace,
    /// Zero once the cursor is exhausted.
    pub cursor_id: i64,
    pub documents: Vec<Document>,
    /// The cursor id is unknown to the backend; callers should stop using it.
    pub invalid_cursor: bool,
}

impl GetMoreReply {
    pub fn invalid(namespace: Namespace, cursor_id: i64) -> Self {
        Self {
            namespace,
            cursor_id,
            documents: Vec::new(),
            invalid_cursor: true,
        }
    }
}

/// Typed success payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Find(FindReply),
    Insert(InsertReply),
    Update(UpdateReply),
    Delete(DeleteReply),
    Command(CommandReply),
    GetMore(GetMoreReply),
}

fn documents_to_bson(docs: &[Document]) -> Vec<Bson> {
    docs.iter().cloned().map(Bson::Document).collect()
}

fn put_count(doc: &mut Document, key: &str, n: i32) {
    if n >= 0 {
        doc.insert(key, n);
    }
}

fn put_list(doc: &mut Document, key: &str, list: &[Document]) {
    if !list.is_empty() {
        doc.insert(key, documents_to_bson(list));
    }
}

impl Reply {
    /// The command-reply document for this payload.
    ///
    /// Negative counts (see [`NOT_APPLICABLE`]) are left out.
    pub fn to_document(&self) -> Document {
        match self {
            Reply::Find(r) => doc! {
                "cursor": {
                    "id": r.cursor_id,
                    "ns": r.namespace.to_string(),
                    "firstBatch": documents_to_bson(&r.documents),
                },
                "ok": 1.0,
            },
            Reply::GetMore(r) if r.invalid_cursor => CommandError::new(
                CommandError::CURSOR_NOT_FOUND,
                format!("cursor id {} not found", r.cursor_id),
            )
            .to_document(),
            Reply::GetMore(r) => doc! {
                "cursor": {
                    "id": r.cursor_id,
                    "ns": r.namespace.to_string(),
                    "nextBatch": documents_to_bson(&r.documents),
                },
                "ok": 1.0,
            },
            Reply::Insert(r) => {
                let mut reply = Document::new();
                put_count(&mut reply, "n", r.n);
                put_list(&mut reply, "writeErrors", &r.write_errors);
                reply.insert("ok", 1.0);
                reply
            }
            Reply::Update(r) => {
                let mut reply = Document::new();
                put_count(&mut reply, "n", r.n);
                put_count(&mut reply, "nModified", r.n_modified);
                put_list(&mut reply, "upserted", &r.upserted);
                put_list(&mut reply, "writeErrors", &r.write_errors);
                reply.insert("ok", 1.0);
                reply
            }
            Reply::Delete(r) => {
                let mut reply = Document::new();
                put_count(&mut reply, "n", r.n);
                put_list(&mut reply, "writeErrors", &r.write_errors);
                reply.insert("ok", 1.0);
                reply
            }
            Reply::Command(r) => r.reply.clone(),
        }
    }
}

macro_rules! impl_into_reply {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(impl From<$ty> for Reply {
            fn from(value: $ty) -> Self {
                Reply::$variant(value)
            }
        })*
    };
}

impl_into_reply! {
    Find => FindReply,
    Insert => InsertReply,
    Update => UpdateReply,
    Delete => DeleteReply,
    Command => CommandReply,
    GetMore => GetMoreReply,
}

/// What a response currently holds.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Outcome {
    #[default]
    Empty,
    Reply(Reply),
    Error(CommandError),
}

/// Uniform response carrier, created empty per request.
///
/// Holds at most one of a payload or an error; the latest write wins.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Response {
    outcome: Outcome,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, reply: impl Into<Reply>) {
        self.outcome = Outcome::Reply(reply.into());
    }

    pub fn write_error(&mut self, error: CommandError) {
        self.outcome = Outcome::Error(error);
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn into_outcome(self) -> Outcome {
        self.outcome
    }

    pub fn reply(&self) -> Option<&Reply> {
        match &self.outcome {
            Outcome::Reply(reply) => Some(reply),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&CommandError> {
        match &self.outcome {
            Outcome::Error(error) => Some(error),
            _ => None,
        }
    }

    pub fn has_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.outcome, Outcome::Empty)
    }

    /// Command-reply document for whatever the response holds.
    pub fn to_document(&self) -> Document {
        match &self.outcome {
            Outcome::Reply(reply) => reply.to_document(),
            Outcome::Error(error) => error.to_document(),
            Outcome::Empty => {
                CommandError::unknown("no stage produced a response").to_document()
            }
        }
    }
}
