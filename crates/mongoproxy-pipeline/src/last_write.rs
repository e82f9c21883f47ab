//! Per-connection memory of the last reply-suppressed write.
//!
//! Legacy clients learn the result of an insert/update/delete by sending
//! `getLastError` right after it. The connection loop keeps the outcome of
//! the last write here and folds it into that status reply.

use bson::{Bson, Document};
use mongoproxy_wire::{CommandError, CommandReply, Outcome, Reply, Request, Response};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LastWrite {
    n: i32,
    n_modified: Option<i32>,
    upserted: Option<Bson>,
    updated_existing: Option<bool>,
    write_errors: Vec<Document>,
    error: Option<CommandError>,
}

impl LastWrite {
    pub(crate) fn from_response(response: &Response) -> Self {
        let mut last = Self {
            n: 0,
            n_modified: None,
            upserted: None,
            updated_existing: None,
            write_errors: Vec::new(),
            error: None,
        };
        match response.outcome() {
            Outcome::Reply(Reply::Insert(r)) => {
                last.n = r.n;
                last.write_errors = r.write_errors.clone();
            }
            Outcome::Reply(Reply::Update(r)) => {
                last.n = r.n;
                last.n_modified = Some(r.n_modified);
                last.upserted = r.upserted.first().and_then(|u| u.get("_id").cloned());
                last.updated_existing = Some(r.n > 0 && r.upserted.is_empty());
                last.write_errors = r.write_errors.clone();
            }
            Outcome::Reply(Reply::Delete(r)) => {
                last.n = r.n;
                last.write_errors = r.write_errors.clone();
            }
            Outcome::Reply(_) | Outcome::Empty => {}
            Outcome::Error(error) => last.error = Some(error.clone()),
        }
        last
    }

    /// A write that never reached the pipeline because its body was unreadable.
    pub(crate) fn rejected(error: CommandError) -> Self {
        let mut response = Response::new();
        response.write_error(error);
        Self::from_response(&response)
    }

    fn first_error(&self) -> Option<(String, i32)> {
        if let Some(error) = &self.error {
            return Some((error.message.clone(), error.code));
        }
        self.write_errors.first().map(|we| {
            let message = we.get_str("errmsg").unwrap_or("write error").to_string();
            let code = we
                .get_i32("code")
                .unwrap_or(CommandError::UNKNOWN_ERROR);
            (message, code)
        })
    }

    /// Overwrite the `getLastError` reply in `response` with this outcome.
    pub(crate) fn fold_into(&self, response: &mut Response) {
        let mut reply = match response.reply() {
            Some(reply) => reply.to_document(),
            None => Document::new(),
        };

        if self.n >= 0 {
            reply.insert("n", self.n);
        }
        if let Some(n_modified) = self.n_modified.filter(|n| *n >= 0) {
            reply.insert("nModified", n_modified);
        }
        if let Some(updated) = self.updated_existing {
            reply.insert("updatedExisting", updated);
        }
        if let Some(id) = &self.upserted {
            reply.insert("upserted", id.clone());
        }
        if !self.write_errors.is_empty() {
            let errors: Vec<Bson> = self.write_errors.iter().cloned().map(Bson::Document).collect();
            reply.insert("writeErrors", errors);
        }
        match self.first_error() {
            Some((message, code)) => {
                reply.insert("err", message);
                reply.insert("code", code);
            }
            None => {
                reply.insert("err", Bson::Null);
            }
        }
        reply.insert("ok", 1.0);

        response.write(CommandReply { reply });
    }
}

pub(crate) fn is_get_last_error(request: &Request) -> bool {
    request
        .command_name()
        .is_some_and(|name| name.eq_ignore_ascii_case("getLastError"))
}
