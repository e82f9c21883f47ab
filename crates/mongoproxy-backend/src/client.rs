//! The collaborator seam between the execution stage and a backend.
//!
//! A [`Connector`] produces a shared [`Client`]; each request leases a
//! [`Session`] from it and gives it back by dropping it. Query results come
//! back as a [`Cursor`].

use std::sync::Arc;

use bson::Document;
use mongoproxy_wire::Namespace;

use crate::error::Result;
use crate::options::ConnectOptions;

/// Options applied to a `find`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub skip: i64,
    /// Zero means no limit.
    pub limit: i64,
    pub batch_size: Option<i32>,
}

/// Establishes a client from connection options.
pub trait Connector: Send + Sync {
    fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn Client>>;
}

/// A connected backend, shared by every connection worker.
pub trait Client: Send + Sync {
    /// Lease a session for one request. It is released when dropped.
    fn start_session(&self) -> Result<Box<dyn Session + '_>>;
}

/// One `getMore` worth of documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CursorBatch {
    pub documents: Vec<Document>,
    /// Zero once the backend has nothing left.
    pub cursor_id: i64,
}

/// A per-request handle onto the backend.
pub trait Session {
    /// Run a command and return the reply as the backend wrote it, `ok: 0` included.
    fn run_command(&mut self, database: &str, command: Document) -> Result<Document>;

    fn find(
        &mut self,
        namespace: &Namespace,
        filter: Document,
        options: &FindOptions,
    ) -> Result<Box<dyn Cursor + '_>>;

    /// Read from a server cursor opened by an earlier request. A
    /// `batch_size` of zero or less reads until the cursor is exhausted;
    /// otherwise the cursor stays open for the next call.
    fn get_more(
        &mut self,
        namespace: &Namespace,
        cursor_id: i64,
        batch_size: i32,
    ) -> Result<CursorBatch>;

    fn kill_cursors(&mut self, namespace: &Namespace, cursor_ids: &[i64]) -> Result<()>;
}

/// A forward-only result stream. Dropping it releases the server cursor.
pub trait Cursor {
    fn next(&mut self) -> Option<Result<Document>>;

    /// Drain every remaining document.
    fn all(&mut self) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        while let Some(document) = self.next() {
            documents.push(document?);
        }
        Ok(documents)
    }
}
