//! The shipped backend: the `mongodb` driver's blocking client.
//!
//! The driver owns server discovery, primary selection, TLS, SCRAM and the
//! connection pool. This module only adapts its API to the
//! [`Connector`]/[`Client`]/[`Session`]/[`Cursor`] seam: replies come back
//! raw (`ok: 0` included) and cursors opened by earlier requests are
//! resumed with plain `getMore` commands.

use std::sync::Arc;

use bson::{doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::FindOptions as DriverFindOptions;
use mongodb::sync::{Client as DriverClient, ClientSession, Database, SessionCursor};
use mongoproxy_wire::Namespace;
use tracing::{debug, trace};

use crate::client::{Client, Connector, Cursor, CursorBatch, FindOptions, Session};
use crate::error::{BackendError, Result};
use crate::options::ConnectOptions;

/// Fields the driver writes itself; a client's copy would clash with them.
const DRIVER_OWNED_FIELDS: [&str; 3] = ["$db", "lsid", "$clusterTime"];

/// Handshakes run outside the request's session, and the driver has already
/// sent its own client metadata on every connection.
const HANDSHAKE_COMMANDS: [&str; 3] = ["isMaster", "ismaster", "hello"];

/// Creates [`MongoClient`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct MongoConnector;

impl Connector for MongoConnector {
    fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn Client>> {
        Ok(Arc::new(MongoClient::connect(options)?))
    }
}

/// A driver client shared by every connection worker.
///
/// Creating one does not touch the network; the first session performs
/// server selection and surfaces unreachable backends.
#[derive(Debug, Clone)]
pub struct MongoClient {
    client: DriverClient,
    addresses: String,
}

impl MongoClient {
    pub fn connect(options: &ConnectOptions) -> Result<Self> {
        let client = DriverClient::with_uri_str(options.connection_string(false))?;
        debug!(uri = %options.connection_string(true), "backend client created");
        Ok(Self {
            client,
            addresses: options.addresses.join(","),
        })
    }
}

impl Client for MongoClient {
    fn start_session(&self) -> Result<Box<dyn Session + '_>> {
        let session = self
            .client
            .start_session(None)
            .map_err(|error| classify(error, &self.addresses))?;
        Ok(Box::new(MongoSession {
            client: &self.client,
            addresses: &self.addresses,
            session,
        }))
    }
}

/// One request's view of the backend; the driver session ends on drop.
pub struct MongoSession<'c> {
    client: &'c DriverClient,
    addresses: &'c str,
    session: ClientSession,
}

impl MongoSession<'_> {
    fn database(&self, name: &str) -> Database {
        self.client.database(name)
    }

    /// Run `command`, turning a driver-side command failure back into the
    /// `ok: 0` reply the backend wrote.
    fn command(&mut self, database: &str, command: Document) -> Result<Document> {
        let database = self.database(database);
        let outcome = if is_handshake(&command) {
            database.run_command(command, None)
        } else {
            database.run_command_with_session(command, None, &mut self.session)
        };
        match outcome {
            Ok(reply) => Ok(reply),
            Err(error) => match error.kind.as_ref() {
                ErrorKind::Command(failure) => Ok(doc! {
                    "ok": 0.0,
                    "errmsg": failure.message.clone(),
                    "code": failure.code,
                    "codeName": failure.code_name.clone(),
                }),
                _ => Err(classify(error, self.addresses)),
            },
        }
    }
}

impl Session for MongoSession<'_> {
    fn run_command(&mut self, database: &str, command: Document) -> Result<Document> {
        self.command(database, strip_driver_fields(command))
    }

    fn find(
        &mut self,
        namespace: &Namespace,
        filter: Document,
        options: &FindOptions,
    ) -> Result<Box<dyn Cursor + '_>> {
        let collection = self
            .database(&namespace.database)
            .collection::<Document>(&namespace.collection);

        let mut find = DriverFindOptions::default();
        find.projection = options.projection.clone();
        find.sort = options.sort.clone();
        find.skip = u64::try_from(options.skip).ok().filter(|skip| *skip > 0);
        find.limit = (options.limit > 0).then_some(options.limit);
        find.batch_size = options
            .batch_size
            .and_then(|size| u32::try_from(size).ok())
            .filter(|size| *size > 0);

        let cursor = collection
            .find_with_session(filter, find, &mut self.session)
            .map_err(|error| classify(error, self.addresses))?;
        Ok(Box::new(MongoCursor {
            cursor,
            session: &mut self.session,
        }))
    }

    fn get_more(
        &mut self,
        namespace: &Namespace,
        cursor_id: i64,
        batch_size: i32,
    ) -> Result<CursorBatch> {
        let mut batch = CursorBatch {
            documents: Vec::new(),
            cursor_id,
        };
        loop {
            let mut command = doc! {
                "getMore": batch.cursor_id,
                "collection": namespace.collection.as_str(),
            };
            if batch_size > 0 {
                command.insert("batchSize", batch_size);
            }
            let reply = self.command(&namespace.database, command)?;
            if let Some(error) = BackendError::from_reply(&reply) {
                return Err(if error.is_cursor_not_found() {
                    BackendError::CursorNotFound(batch.cursor_id)
                } else {
                    error
                });
            }

            let cursor = reply
                .get_document("cursor")
                .map_err(|_| BackendError::Protocol("getMore reply without a cursor".into()))?;
            batch.cursor_id = cursor.get_i64("id").unwrap_or(0);
            if let Ok(documents) = cursor.get_array("nextBatch") {
                batch
                    .documents
                    .extend(documents.iter().filter_map(Bson::as_document).cloned());
            }
            trace!(
                cursor_id = batch.cursor_id,
                documents = batch.documents.len(),
                "getMore batch"
            );
            if batch_size > 0 || batch.cursor_id == 0 {
                return Ok(batch);
            }
        }
    }

    fn kill_cursors(&mut self, namespace: &Namespace, cursor_ids: &[i64]) -> Result<()> {
        let command = doc! {
            "killCursors": namespace.collection.as_str(),
            "cursors": cursor_ids.iter().copied().map(Bson::Int64).collect::<Vec<_>>(),
        };
        let reply = self.command(&namespace.database, command)?;
        match BackendError::from_reply(&reply) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// A driver cursor bound to the session that opened it.
struct MongoCursor<'s> {
    cursor: SessionCursor<Document>,
    session: &'s mut ClientSession,
}

impl Cursor for MongoCursor<'_> {
    fn next(&mut self) -> Option<Result<Document>> {
        self.cursor
            .next(self.session)
            .map(|item| item.map_err(BackendError::from))
    }
}

/// Server-selection timeouts mean no backend answered in time.
fn classify(error: mongodb::error::Error, addresses: &str) -> BackendError {
    match error.kind.as_ref() {
        ErrorKind::ServerSelection { message, .. } => BackendError::Unreachable {
            addresses: addresses.to_string(),
            reason: message.clone(),
        },
        _ => BackendError::Driver(error),
    }
}

fn is_handshake(command: &Document) -> bool {
    command
        .keys()
        .next()
        .is_some_and(|name| HANDSHAKE_COMMANDS.contains(&name.as_str()))
}

fn strip_driver_fields(mut command: Document) -> Document {
    for field in DRIVER_OWNED_FIELDS {
        command.remove(field);
    }
    if is_handshake(&command) {
        command.remove("client");
    }
    command
}
