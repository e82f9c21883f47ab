//! Acceptor and per-connection loop.
//!
//! One acceptor thread dispatches every accepted connection to its own
//! worker thread. A worker reads one frame at a time, runs it through the
//! pipeline to completion and writes the reply (if the protocol wants one)
//! before reading the next frame.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use mongoproxy_transport::{Listener, ProxyStream};
use mongoproxy_wire::{
    decode_request, encode_response, CommandError, Frame, FrameReader, FrameWriter, MsgHeader,
    OpCode, RequestKind, Response, WireError, DEFAULT_MAX_MESSAGE_SIZE,
};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::last_write::{is_get_last_error, LastWrite};
use crate::pipeline::Pipeline;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_message_size: usize,
    /// Idle limit while waiting for the next client frame.
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// Stops a running [`ProxyServer`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    listener: Arc<Listener>,
}

impl ShutdownHandle {
    /// Ask the acceptor to stop and unblock it. Open connections finish on their own.
    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.listener.wake() {
            warn!(error = %err, "failed to wake acceptor");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Accepts client connections and serves each on its own worker thread.
pub struct ProxyServer {
    listener: Arc<Listener>,
    pipeline: Pipeline,
    config: ConnectionConfig,
    stop: Arc<AtomicBool>,
    next_connection_id: AtomicU64,
}

impl ProxyServer {
    pub fn new(listener: Listener, pipeline: Pipeline) -> Self {
        Self {
            listener: Arc::new(listener),
            pipeline,
            config: ConnectionConfig::default(),
            stop: Arc::new(AtomicBool::new(false)),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            listener: Arc::clone(&self.listener),
        }
    }

    /// Bound address for diagnostics.
    pub fn local_description(&self) -> String {
        self.listener.describe()
    }

    /// Accept connections until shut down.
    ///
    /// Accept failures are logged and the loop carries on; the acceptor
    /// never waits on a worker.
    pub fn serve(&self) -> Result<()> {
        info!(
            listen = %self.listener.describe(),
            stages = ?self.pipeline.stage_names(),
            "proxy accepting connections"
        );

        loop {
            let accepted = self.listener.accept();
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let stream = match accepted {
                Ok(stream) => stream,
                Err(err) => {
                    error!(error = %err, "failed to accept connection");
                    continue;
                }
            };

            let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            let pipeline = self.pipeline.clone();
            let config = self.config.clone();
            let spawned = thread::Builder::new()
                .name(format!("mongoproxy-conn-{id}"))
                .spawn(move || serve_stream(id, stream, pipeline, config));
            if let Err(err) = spawned {
                error!(connection = id, error = %err, "failed to spawn connection worker");
            }
        }

        info!("proxy stopped accepting connections");
        Ok(())
    }
}

fn serve_stream(id: u64, stream: ProxyStream, pipeline: Pipeline, config: ConnectionConfig) {
    let peer = stream.peer_label();
    info!(connection = id, %peer, "accepted connection");

    let prepared = stream
        .set_read_timeout(config.read_timeout)
        .and_then(|()| stream.set_write_timeout(config.write_timeout))
        .and_then(|()| stream.try_clone());
    let reader = match prepared {
        Ok(reader) => reader,
        Err(err) => {
            error!(connection = id, %peer, error = %err, "failed to prepare connection");
            return;
        }
    };

    let mut connection = Connection::new(&pipeline, &peer, config.max_message_size);
    match connection.run(reader, stream) {
        Ok(()) => info!(connection = id, %peer, "client disconnected"),
        Err(err) => warn!(connection = id, %peer, error = %err, "connection closed"),
    }
}

/// State of one client connection.
pub struct Connection<'a> {
    pipeline: &'a Pipeline,
    peer: &'a str,
    max_message_size: usize,
    last_write: Option<LastWrite>,
}

impl<'a> Connection<'a> {
    pub fn new(pipeline: &'a Pipeline, peer: &'a str, max_message_size: usize) -> Self {
        Self {
            pipeline,
            peer,
            max_message_size,
            last_write: None,
        }
    }

    /// Serve frames until the client disconnects.
    ///
    /// Returns `Ok(())` on a clean disconnect between frames. Framing and
    /// transport errors end the connection with an error; anything wrong
    /// inside a well-framed body is answered (or logged) and the loop goes on.
    pub fn run<R: Read, W: Write>(&mut self, reader: R, writer: W) -> Result<()> {
        let mut reader = FrameReader::with_max_message_size(reader, self.max_message_size);
        let mut writer = FrameWriter::new(writer);

        while let Some(frame) = reader.read_frame()? {
            if let Some(reply) = self.handle_frame(&frame)? {
                writer.write_frame(&reply)?;
            }
        }
        Ok(())
    }

    /// Process one frame; returns the encoded reply, if one is due.
    fn handle_frame(&mut self, frame: &Frame) -> Result<Option<Bytes>> {
        let header = frame.header;
        let request = match decode_request(frame) {
            Ok(request) => request,
            Err(err) => return self.reject(&header, err),
        };
        debug!(
            peer = self.peer,
            request_id = header.request_id,
            op_code = %header.op_code,
            kind = %request.kind(),
            "request"
        );

        let mut response = Response::new();
        self.pipeline.handle(&request, &mut response);

        if !request.expects_reply() {
            if request.kind().is_write() {
                if let Some(error) = response.error() {
                    warn!(
                        peer = self.peer,
                        request_id = header.request_id,
                        code = error.code,
                        error = %error.message,
                        "write failed; reported through getLastError only"
                    );
                }
                self.last_write = Some(LastWrite::from_response(&response));
            }
            debug!(
                peer = self.peer,
                request_id = header.request_id,
                kind = %request.kind(),
                "reply suppressed"
            );
            return Ok(None);
        }

        // Any reply-bearing request ends the window in which the write is reportable.
        let last_write = self.last_write.take();
        if is_get_last_error(&request) {
            if let Some(last) = last_write {
                last.fold_into(&mut response);
            }
        }

        Ok(Some(encode_response(&header, request.kind(), &response)?))
    }

    /// Answer a frame whose body could not be decoded.
    fn reject(&mut self, header: &MsgHeader, err: WireError) -> Result<Option<Bytes>> {
        if err.is_fatal() {
            return Err(err.into());
        }
        warn!(
            peer = self.peer,
            request_id = header.request_id,
            op_code = %header.op_code,
            error = %err,
            "undecodable request"
        );

        let code = match err {
            WireError::InvalidNamespace(_) => CommandError::INVALID_NAMESPACE,
            _ => CommandError::FAILED_TO_PARSE,
        };
        let error = CommandError::new(code, err.to_string());

        let kind = match header.op_code {
            OpCode::Insert | OpCode::Update | OpCode::Delete => {
                self.last_write = Some(LastWrite::rejected(error));
                return Ok(None);
            }
            OpCode::KillCursors => return Ok(None),
            OpCode::Query => RequestKind::Find,
            OpCode::GetMore => RequestKind::GetMore,
            OpCode::Msg => RequestKind::Msg,
            _ => RequestKind::Command,
        };

        let mut response = Response::new();
        response.write_error(error);
        Ok(Some(encode_response(header, kind, &response)?))
    }
}
