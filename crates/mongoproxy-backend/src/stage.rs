//! The `mongod` stage: executes each request against the backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bson::{doc, Bson, Document};
use mongoproxy_pipeline::{ConfigError, Next, Stage, StageConfig};
use mongoproxy_wire::{
    CommandError, CommandReply, DeleteReply, FindReply, FindRequest, GetMoreReply,
    GetMoreRequest, InsertReply, Namespace, Reply, Request, Response, UpdateReply,
    NOT_APPLICABLE,
};
use tracing::{debug, warn};

use crate::client::{Client, Connector, Cursor, FindOptions, Session};
use crate::driver::MongoConnector;
use crate::error::{BackendError, Result};
use crate::options::ConnectOptions;

/// Upper bound on remembered cursor namespaces.
const MAX_TRACKED_CURSORS: usize = 4096;

/// Terminal execution stage.
///
/// The backend client is created on first use and shared by all
/// connections; every request leases its own session from it.
pub struct BackendStage {
    connector: Arc<dyn Connector>,
    options: ConnectOptions,
    client: RwLock<Option<Arc<dyn Client>>>,
    cursors: CursorDirectory,
}

impl BackendStage {
    pub const NAME: &'static str = "mongod";

    /// A stage backed by the `mongodb` driver.
    pub fn new() -> Self {
        Self::with_connector(Arc::new(MongoConnector))
    }

    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            options: ConnectOptions::default(),
            client: RwLock::new(None),
            cursors: CursorDirectory::default(),
        }
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// The shared client, connecting on first use.
    ///
    /// Connecting happens outside the lock so a slow or failing backend
    /// never queues other workers behind it. When two workers race, the
    /// first client published wins and the other is dropped.
    fn client(&self) -> Result<Arc<dyn Client>> {
        if let Some(client) = self.client.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            return Ok(Arc::clone(client));
        }
        let client = self.connector.connect(&self.options)?;
        let mut slot = self.client.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(slot.get_or_insert(client)))
    }

    fn execute(&self, request: &Request, response: &mut Response) -> Result<()> {
        let client = self.client()?;
        let mut session = client.start_session()?;
        let session = session.as_mut();

        match request {
            Request::Command(command) => {
                let body = command.to_command();
                let released = released_cursors(&body);
                let reply = run_command(session, &command.database, body)?;
                self.cursors.observe(&released, &reply);
                response.write(CommandReply { reply });
                Ok(())
            }
            Request::Msg(msg) => {
                let body = msg.to_command();
                let released = released_cursors(&body);
                let reply = run_command(session, msg.database(), body)?;
                self.cursors.observe(&released, &reply);
                response.write(CommandReply { reply });
                Ok(())
            }
            Request::Find(find) => self::find(session, find, response),
            Request::GetMore(get_more) => {
                let reply = self::get_more(session, get_more)?;
                if reply.invalid_cursor || reply.cursor_id == 0 {
                    self.cursors.forget(&[get_more.cursor_id]);
                } else {
                    self.cursors.remember(reply.cursor_id, &get_more.namespace);
                }
                response.write(reply);
                Ok(())
            }
            Request::Insert(insert) => {
                let reply = checked(session.run_command(
                    &insert.namespace.database,
                    insert.to_command(),
                )?)?;
                response.write(InsertReply {
                    n: count(&reply, "n"),
                    write_errors: documents(&reply, "writeErrors"),
                });
                Ok(())
            }
            Request::Update(update) => {
                let reply = checked(session.run_command(
                    &update.namespace.database,
                    update.to_command(),
                )?)?;
                response.write(UpdateReply {
                    n: count(&reply, "n"),
                    n_modified: count(&reply, "nModified"),
                    upserted: documents(&reply, "upserted"),
                    write_errors: documents(&reply, "writeErrors"),
                });
                Ok(())
            }
            Request::Delete(delete) => {
                let reply = checked(session.run_command(
                    &delete.namespace.database,
                    delete.to_command(),
                )?)?;
                response.write(DeleteReply {
                    n: count(&reply, "n"),
                    write_errors: documents(&reply, "writeErrors"),
                });
                Ok(())
            }
            Request::KillCursors(kill) => {
                let (known, unknown) = self.cursors.take(&kill.cursor_ids);
                if !unknown.is_empty() {
                    debug!(cursor_ids = ?unknown, "no namespace on record, not killed");
                }
                for (namespace, ids) in known {
                    session.kill_cursors(&namespace, &ids)?;
                }
                Ok(())
            }
            Request::Other(other) => Err(BackendError::Command {
                code: CommandError::COMMAND_NOT_FOUND,
                message: format!("unsupported op code {}", other.op_code),
            }),
        }
    }
}

impl Default for BackendStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for BackendStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn configure(&mut self, config: &StageConfig) -> std::result::Result<(), ConfigError> {
        let options = ConnectOptions::from_config(config)?;
        debug!(
            uri = %options.connection_string(true),
            read_only = options.read_only,
            "backend stage configured"
        );
        self.options = options;
        *self.client.get_mut().unwrap_or_else(PoisonError::into_inner) = None;
        self.cursors.clear();
        Ok(())
    }

    fn process(&self, request: &Request, response: &mut Response, next: Next<'_>) {
        if response.has_error() {
            next.run(request, response);
            return;
        }

        if self.options.read_only {
            if let Some(reply) = read_only_reply(request) {
                debug!(kind = %request.kind(), "read-only mode, write not performed");
                response.write(reply);
                return;
            }
        }

        if let Some(reply) = local_reply(request) {
            debug!(command = request.command_name().unwrap_or(""), "answered locally");
            response.write(reply);
            return;
        }

        if let Err(error) = self.execute(request, response) {
            warn!(
                kind = %request.kind(),
                command = request.command_name().unwrap_or(""),
                code = ?error.code(),
                error = %error,
                "backend call failed"
            );
            response.write_error(error.to_command_error());
        }
        next.run(request, response);
    }
}

/// The sentinel reply for a write refused by read-only mode.
fn read_only_reply(request: &Request) -> Option<Reply> {
    match request {
        Request::Insert(_) => Some(InsertReply::not_applicable().into()),
        Request::Update(_) => Some(UpdateReply::not_applicable().into()),
        Request::Delete(_) => Some(DeleteReply::not_applicable().into()),
        Request::Command(_) | Request::Msg(_) => {
            match request.command_name()?.to_ascii_lowercase().as_str() {
                "insert" => Some(InsertReply::not_applicable().into()),
                "update" | "findandmodify" => Some(UpdateReply::not_applicable().into()),
                "delete" => Some(DeleteReply::not_applicable().into()),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Commands the proxy answers itself instead of forwarding.
///
/// Index builds are acknowledged without touching the backend.
fn local_reply(request: &Request) -> Option<Reply> {
    match request {
        Request::Command(_) | Request::Msg(_) => {
            let name = request.command_name()?;
            name.eq_ignore_ascii_case("createIndexes").then(|| {
                CommandReply {
                    reply: doc! { "ok": 1.0, "code": 0 },
                }
                .into()
            })
        }
        _ => None,
    }
}

/// Old clients spell the handshake `ismaster`; servers want `isMaster`.
fn normalise_command(command: Document) -> Document {
    match command.keys().next() {
        Some(name) if name == "ismaster" => command
            .into_iter()
            .map(|(key, value)| match key.as_str() {
                "ismaster" => ("isMaster".to_string(), value),
                _ => (key, value),
            })
            .collect(),
        _ => command,
    }
}

/// Cursor ids a `getMore` or `killCursors` command may close.
fn released_cursors(command: &Document) -> Vec<i64> {
    match command.keys().next().map(String::as_str) {
        Some("getMore") => command.get_i64("getMore").into_iter().collect(),
        Some("killCursors") => command
            .get_array("cursors")
            .map(|ids| ids.iter().filter_map(Bson::as_i64).collect())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn checked(reply: Document) -> Result<Document> {
    match BackendError::from_reply(&reply) {
        Some(error) => Err(error),
        None => Ok(reply),
    }
}

/// A count from a write reply; [`NOT_APPLICABLE`] when absent or not a
/// whole number that fits.
fn count(reply: &Document, key: &str) -> i32 {
    match reply.get(key) {
        Some(Bson::Int32(n)) => *n,
        Some(Bson::Int64(n)) => i32::try_from(*n).unwrap_or(NOT_APPLICABLE),
        Some(Bson::Double(n))
            if n.fract() == 0.0 && (f64::from(i32::MIN)..=f64::from(i32::MAX)).contains(n) =>
        {
            *n as i32
        }
        _ => NOT_APPLICABLE,
    }
}

fn documents(reply: &Document, key: &str) -> Vec<Document> {
    reply
        .get_array(key)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_document().cloned())
                .collect()
        })
        .unwrap_or_default()
}

fn run_command(session: &mut dyn Session, database: &str, command: Document) -> Result<Document> {
    checked(session.run_command(database, normalise_command(command))?)
}

fn collect(cursor: &mut dyn Cursor, limit: usize) -> Result<Vec<Document>> {
    if limit == 0 {
        return cursor.all();
    }
    let mut found = Vec::with_capacity(limit.min(1024));
    while found.len() < limit {
        match cursor.next() {
            Some(document) => found.push(document?),
            None => break,
        }
    }
    Ok(found)
}

fn find(session: &mut dyn Session, find: &FindRequest, response: &mut Response) -> Result<()> {
    let limit = usize::try_from(find.limit).unwrap_or(0);
    let options = FindOptions {
        projection: find.projection.clone(),
        sort: find.sort.clone(),
        skip: i64::from(find.skip),
        limit: i64::from(find.limit),
        batch_size: (find.limit > 0).then_some(find.limit),
    };

    let mut cursor = session.find(&find.namespace, find.filter.clone(), &options)?;
    let documents = collect(cursor.as_mut(), limit)?;
    // The reply never hands out a cursor; dropping it releases the server side.
    drop(cursor);

    response.write(FindReply {
        namespace: find.namespace.clone(),
        documents,
        cursor_id: 0,
    });
    Ok(())
}

fn get_more(session: &mut dyn Session, get_more: &GetMoreRequest) -> Result<GetMoreReply> {
    match session.get_more(&get_more.namespace, get_more.cursor_id, get_more.batch_size) {
        Ok(batch) => Ok(GetMoreReply {
            namespace: get_more.namespace.clone(),
            cursor_id: batch.cursor_id,
            documents: batch.documents,
            invalid_cursor: false,
        }),
        Err(error) if error.is_cursor_not_found() => {
            debug!(cursor_id = get_more.cursor_id, "cursor no longer exists");
            Ok(GetMoreReply::invalid(
                get_more.namespace.clone(),
                get_more.cursor_id,
            ))
        }
        Err(error) => Err(error),
    }
}

/// Namespaces of cursors clients may still resume or kill.
///
/// A kill request names only cursor ids, while the backend wants the
/// collection too, so the stage records it whenever a reply opens a cursor.
#[derive(Default)]
struct CursorDirectory {
    open: Mutex<HashMap<i64, Namespace>>,
}

impl CursorDirectory {
    fn remember(&self, cursor_id: i64, namespace: &Namespace) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if open.len() >= MAX_TRACKED_CURSORS && !open.contains_key(&cursor_id) {
            debug!(cursor_id, "cursor directory full, not tracked");
            return;
        }
        open.insert(cursor_id, namespace.clone());
    }

    /// Forget `released`, then record the cursor a command reply hands out.
    fn observe(&self, released: &[i64], reply: &Document) {
        self.forget(released);
        let Ok(cursor) = reply.get_document("cursor") else {
            return;
        };
        let id = cursor.get_i64("id").unwrap_or(0);
        let namespace = cursor.get_str("ns").ok().and_then(|ns| Namespace::parse(ns).ok());
        if let (true, Some(namespace)) = (id != 0, namespace) {
            self.remember(id, &namespace);
        }
    }

    fn forget(&self, cursor_ids: &[i64]) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        for id in cursor_ids {
            open.remove(id);
        }
    }

    /// Remove `cursor_ids`, grouping the known ones by namespace.
    fn take(&self, cursor_ids: &[i64]) -> (Vec<(Namespace, Vec<i64>)>, Vec<i64>) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        let mut known: Vec<(Namespace, Vec<i64>)> = Vec::new();
        let mut unknown = Vec::new();
        for id in cursor_ids {
            match open.remove(id) {
                Some(namespace) => match known.iter_mut().find(|(ns, _)| *ns == namespace) {
                    Some((_, ids)) => ids.push(*id),
                    None => known.push((namespace, vec![*id])),
                },
                None => unknown.push(*id),
            }
        }
        (known, unknown)
    }

    fn clear(&self) {
        self.open.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use mongoproxy_wire::{CommandRequest, InsertRequest, MsgRequest, Namespace};

    use super::*;

    #[test]
    fn ismaster_is_renamed_in_place() {
        let command = normalise_command(doc! { "ismaster": 1, "client": { "x": 1 } });
        assert_eq!(command.keys().next().map(String::as_str), Some("isMaster"));
        assert!(command.contains_key("client"));

        let untouched = normalise_command(doc! { "ping": 1, "ismaster": 1 });
        assert_eq!(untouched.keys().next().map(String::as_str), Some("ping"));
    }

    #[test]
    fn write_commands_get_sentinels_in_read_only_mode() {
        let insert = Request::Insert(InsertRequest {
            namespace: Namespace::new("db", "c"),
            documents: vec![doc! {}],
            ordered: true,
        });
        assert!(matches!(
            read_only_reply(&insert),
            Some(Reply::Insert(InsertReply { n: -1, .. }))
        ));

        let msg = Request::Msg(MsgRequest::new(doc! { "findAndModify": "c", "$db": "db" }));
        assert!(matches!(read_only_reply(&msg), Some(Reply::Update(_))));

        let read = Request::Command(CommandRequest::new("db", doc! { "count": "c" }).unwrap());
        assert!(read_only_reply(&read).is_none());
    }

    #[test]
    fn counts_accept_numeric_variants() {
        let reply = doc! { "a": 3, "b": 4_i64, "c": 5.0, "zero": 0 };
        assert_eq!(count(&reply, "a"), 3);
        assert_eq!(count(&reply, "b"), 4);
        assert_eq!(count(&reply, "c"), 5);
        assert_eq!(count(&reply, "zero"), 0);
    }

    #[test]
    fn unusable_counts_are_not_applicable() {
        let reply = doc! {
            "fraction": 2.5,
            "huge": 1e12,
            "wide": i64::MAX,
            "text": "3",
        };
        assert_eq!(count(&reply, "missing"), NOT_APPLICABLE);
        assert_eq!(count(&reply, "fraction"), NOT_APPLICABLE);
        assert_eq!(count(&reply, "huge"), NOT_APPLICABLE);
        assert_eq!(count(&reply, "wide"), NOT_APPLICABLE);
        assert_eq!(count(&reply, "text"), NOT_APPLICABLE);
    }

    #[test]
    fn create_indexes_is_acknowledged_locally() {
        let msg = Request::Msg(MsgRequest::new(
            doc! { "createIndexes": "c", "indexes": [], "$db": "db" },
        ));
        let reply = local_reply(&msg).expect("a local reply").to_document();
        assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
        assert_eq!(reply.get_i32("code").unwrap(), 0);

        let other = Request::Command(CommandRequest::new("db", doc! { "ping": 1 }).unwrap());
        assert!(local_reply(&other).is_none());
    }

    #[test]
    fn directory_groups_kills_by_namespace() {
        let directory = CursorDirectory::default();
        directory.observe(
            &[],
            &doc! {
                "cursor": { "id": 7_i64, "ns": "app.users", "firstBatch": [] },
                "ok": 1.0,
            },
        );
        directory.remember(8, &Namespace::new("app", "users"));
        directory.remember(9, &Namespace::new("app", "orders"));
        directory.observe(&[], &doc! { "cursor": { "id": 0_i64, "ns": "app.x" }, "ok": 1 });

        let (known, unknown) = directory.take(&[7, 9, 8, 10]);
        assert_eq!(
            known,
            vec![
                (Namespace::new("app", "users"), vec![7, 8]),
                (Namespace::new("app", "orders"), vec![9]),
            ]
        );
        assert_eq!(unknown, vec![10]);
        let (known, _) = directory.take(&[7]);
        assert!(known.is_empty(), "taken ids are forgotten");
    }

    #[test]
    fn command_style_cursor_traffic_updates_the_directory() {
        let directory = CursorDirectory::default();
        directory.remember(5, &Namespace::new("app", "users"));
        directory.remember(6, &Namespace::new("app", "users"));

        let get_more = doc! { "getMore": 5_i64, "collection": "users" };
        let exhausted = doc! { "cursor": { "id": 0_i64, "ns": "app.users" }, "ok": 1.0 };
        directory.observe(&released_cursors(&get_more), &exhausted);

        let kill = doc! { "killCursors": "users", "cursors": [6_i64] };
        assert_eq!(released_cursors(&kill), vec![6]);
        directory.observe(&released_cursors(&kill), &doc! { "ok": 1.0 });

        let (known, unknown) = directory.take(&[5, 6]);
        assert!(known.is_empty());
        assert_eq!(unknown, vec![5, 6]);
    }
}
