//! A multiplexed connection to one CQL node.
//!
//! [`dial`] opens the transport, runs the handshake and then hands the read
//! half to a background read loop. Requests are correlated with responses by
//! stream id, so any number of callers may share one connection. A second
//! background task sends OPTIONS heartbeats and closes the connection after
//! too many consecutive failures.

use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::handshake::Handshake;
use crate::hooks::{ConnectionErrorHandler, Tracer};
use crate::inflight::{CallId, InFlight, Taken};
use crate::prepare::{PreparedCache, PreparedStatement, StatementKey};
use crate::reader::{FrameReader, Incoming};
use crate::stream::{self, ClientStream};
use crate::stream_ids::StreamIds;
use crate::writer::{DeadlineWriter, WriteFailure, WritePath};
use cqlwire_protocol::{
    decode_response, Compressor, Encoder, Event, EventType, ParsedResponse, ProtocolError,
    ProtocolVersion, Query, QueryParameters, QueryResult, RawFrame, Request, Response, StreamId,
    Supported, EVENT_STREAM_ID,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadHalf, WriteHalf};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle of an established connection.
///
/// Dialing, TLS and the handshake happen inside [`dial`]; a `Connection`
/// value only exists once they succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Ready,
    Closed,
}

/// Per-request options.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Requests server-side tracing and receives the trace id.
    pub tracer: Option<Arc<dyn Tracer>>,
    /// Overrides the connection's request timeout. Zero waits indefinitely.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn deadline(&self, default: Duration) -> Option<Duration> {
        Some(self.timeout.unwrap_or(default)).filter(|d| !d.is_zero())
    }
}

type Writer = WritePath<WriteHalf<ClientStream>>;

/// A connection to one node.
pub struct Connection {
    addr: SocketAddr,
    config: ConnectionConfig,
    encoder: Encoder,
    compressor: Option<Arc<dyn Compressor>>,
    supported: Supported,
    streams: StreamIds,
    calls: InFlight,
    writer: Writer,
    closed: AtomicBool,
    shutdown: CancellationToken,
    keyspace: Mutex<Option<String>>,
    events: broadcast::Sender<Event>,
    error_handler: Arc<dyn ConnectionErrorHandler>,
    prepared: PreparedCache,
    timeouts: AtomicU64,
    unsolicited: AtomicU64,
}

/// Opens a connection to `addr` and runs the handshake.
///
/// If `config` names a keyspace or events, `USE` and `REGISTER` are issued
/// before returning. `error_handler` is notified once when the established
/// connection is torn down; failures inside `dial` are only returned.
pub async fn dial(
    addr: SocketAddr,
    config: ConnectionConfig,
    error_handler: Arc<dyn ConnectionErrorHandler>,
) -> Result<Arc<Connection>, ClientError> {
    let span = tracing::info_span!("connection", %addr);
    Connection::establish(addr, config, error_handler, span.clone())
        .instrument(span)
        .await
}

impl Connection {
    async fn establish(
        addr: SocketAddr,
        config: ConnectionConfig,
        error_handler: Arc<dyn ConnectionErrorHandler>,
        span: tracing::Span,
    ) -> Result<Arc<Self>, ClientError> {
        let transport = stream::connect(addr, &config).await?;
        let is_tls = transport.is_tls();
        let (read_half, write_half) = tokio::io::split(transport);

        let mut reader = FrameReader::new(read_half, config.max_frame_size);
        let writer = Arc::new(DeadlineWriter::new(
            write_half,
            Some(config.effective_write_timeout()),
        ));

        let handshake = Handshake::new(&mut reader, &writer, &config).run();
        let negotiated = match tokio::time::timeout(config.connect_timeout, handshake).await {
            Ok(Ok(negotiated)) => negotiated,
            Ok(Err(err)) => {
                writer.shutdown().await;
                return Err(err);
            }
            Err(_) => {
                tracing::debug!("handshake timed out");
                writer.shutdown().await;
                return Err(ClientError::Timeout);
            }
        };

        let window = coalesce_window(&config, is_tls);
        if config.coalesce_window.is_some() && window.is_none() {
            tracing::debug!("write coalescing disabled on TLS transport");
        }
        let shutdown = CancellationToken::new();
        let mut encoder = Encoder::new(config.protocol_version);
        if let Some(compressor) = &negotiated.compressor {
            encoder = encoder.with_compressor(Arc::clone(compressor));
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let conn = Arc::new(Self {
            addr,
            encoder,
            compressor: negotiated.compressor,
            supported: negotiated.supported,
            streams: StreamIds::new(config.protocol_version),
            calls: InFlight::new(),
            writer: WritePath::new(writer, window, shutdown.clone()),
            closed: AtomicBool::new(false),
            shutdown: shutdown.clone(),
            keyspace: Mutex::new(None),
            events,
            error_handler,
            prepared: PreparedCache::default(),
            timeouts: AtomicU64::new(0),
            unsolicited: AtomicU64::new(0),
            config,
        });

        tokio::spawn(
            read_loop(Arc::downgrade(&conn), reader, shutdown.clone()).instrument(span.clone()),
        );
        tokio::spawn(heartbeat(Arc::downgrade(&conn), shutdown).instrument(span));
        tracing::debug!(
            version = %conn.config.protocol_version,
            coalescing = conn.writer.is_coalesced(),
            "connection ready"
        );

        if let Err(err) = conn.setup().await {
            conn.teardown(err.clone(), true, false);
            return Err(err);
        }
        Ok(conn)
    }

    async fn setup(&self) -> Result<(), ClientError> {
        if let Some(keyspace) = self.config.keyspace.clone() {
            self.use_keyspace(&keyspace).await?;
        }
        if !self.config.events.is_empty() {
            self.register(self.config.events.clone()).await?;
        }
        Ok(())
    }

    /// Sends `request` and waits for its response.
    ///
    /// Server errors are returned as `Ok` with [`Response::Error`]. A timed
    /// out or cancelled request keeps its stream id reserved until the
    /// server answers or the connection closes; the same applies if this
    /// future is dropped while waiting.
    pub async fn execute(
        &self,
        request: &Request,
        options: ExecuteOptions,
    ) -> Result<ParsedResponse, ClientError> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }

        let stream = self.streams.allocate().ok_or(ClientError::NoStreams)?;
        let (call, rx) = match self.calls.register(stream) {
            Ok(registered) => registered,
            Err(err) => {
                self.streams.release(stream);
                return Err(err);
            }
        };
        let frame = match self.encoder.encode(request, stream, options.tracer.is_some()) {
            Ok(frame) => frame.freeze(),
            Err(err) => {
                self.calls.remove(stream, call);
                self.streams.release(stream);
                return Err(err.into());
            }
        };
        let _pending = PendingCall {
            calls: &self.calls,
            stream,
            call,
        };

        tracing::trace!(stream, opcode = %request.opcode(), len = frame.len(), "sending request");
        if let Err(failure) = self.writer.write(frame).await {
            if survives_write_failure(&failure) {
                if self.calls.remove(stream, call) {
                    self.streams.release(stream);
                }
            } else {
                self.calls.abandon(stream, call);
                self.fail(failure.error.clone());
            }
            return Err(failure.error);
        }

        let deadline = options.deadline(self.config.request_timeout);
        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending().await,
            }
        };
        let cancelled = async {
            match &options.cancel {
                Some(cancel) => cancel.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let frame = tokio::select! {
            biased;
            result = rx => result.unwrap_or(Err(ClientError::ConnectionClosed))?,
            _ = self.shutdown.cancelled() => return Err(ClientError::ConnectionClosed),
            _ = expired => {
                tracing::debug!(stream, "request timed out");
                self.record_timeout();
                return Err(ClientError::Timeout);
            }
            _ = cancelled => return Err(ClientError::Cancelled),
        };

        let version = self.config.protocol_version;
        if frame.header.version != version {
            return Err(ClientError::UnexpectedProtocolVersion {
                expected: version,
                got: frame.header.version,
            });
        }
        let parsed = decode_response(frame, self.compressor.as_deref())?;

        if let (Some(tracer), Some(tracing_id)) = (&options.tracer, parsed.tracing_id) {
            tracer.trace(tracing_id);
        }
        for warning in &parsed.warnings {
            tracing::warn!(stream, %warning, "server warning");
        }
        Ok(parsed)
    }

    /// Switches the connection to `keyspace`.
    pub async fn use_keyspace(&self, keyspace: &str) -> Result<(), ClientError> {
        let statement = format!("USE \"{}\"", keyspace.replace('"', "\"\""));
        let request = Request::Query(Query::new(statement));
        match self.execute(&request, ExecuteOptions::default()).await?.response {
            Response::Result(QueryResult::SetKeyspace(keyspace)) => {
                tracing::debug!(%keyspace, "keyspace set");
                *self.keyspace.lock() = Some(keyspace);
                Ok(())
            }
            Response::Error(err) => Err(err.into()),
            other => Err(ClientError::UnexpectedResponse(other.opcode())),
        }
    }

    /// Subscribes the connection to server events.
    pub async fn register(&self, events: Vec<EventType>) -> Result<(), ClientError> {
        match self
            .execute(&Request::Register(events), ExecuteOptions::default())
            .await?
            .response
        {
            Response::Ready => Ok(()),
            Response::Error(err) => Err(err.into()),
            other => Err(ClientError::UnexpectedResponse(other.opcode())),
        }
    }

    /// Prepares `statement`, sharing the round-trip with concurrent callers.
    pub async fn prepare(
        self: &Arc<Self>,
        statement: &str,
    ) -> Result<Arc<PreparedStatement>, ClientError> {
        self.prepare_keyed(self.statement_key(statement)).await
    }

    async fn prepare_keyed(
        self: &Arc<Self>,
        key: StatementKey,
    ) -> Result<Arc<PreparedStatement>, ClientError> {
        let conn = Arc::clone(self);
        let statement = key.statement.clone();
        self.prepared
            .get_or_prepare(key, move || async move {
                conn.prepare_uncached(statement).await.map(Arc::new)
            })
            .await
    }

    async fn prepare_uncached(&self, statement: String) -> Result<PreparedStatement, ClientError> {
        let request = Request::Prepare {
            statement,
            keyspace: None,
        };
        match self.execute(&request, ExecuteOptions::default()).await?.response {
            Response::Result(QueryResult::Prepared(result)) => Ok(result.into()),
            Response::Error(err) => Err(err.into()),
            other => Err(ClientError::UnexpectedResponse(other.opcode())),
        }
    }

    /// Prepares (or reuses) `statement` and executes it.
    ///
    /// If the server no longer knows the prepared id, the statement is
    /// prepared again and executed once more.
    pub async fn execute_statement(
        self: &Arc<Self>,
        statement: &str,
        params: QueryParameters,
        options: ExecuteOptions,
    ) -> Result<ParsedResponse, ClientError> {
        let key = self.statement_key(statement);
        let prepared = self.prepare_keyed(key.clone()).await?;
        let parsed = self
            .execute(&prepared.execute(params.clone()), options.clone())
            .await?;

        let Response::Error(err) = &parsed.response else {
            return Ok(parsed);
        };
        if err.unprepared_id() != Some(&prepared.id) {
            return Ok(parsed);
        }

        tracing::debug!(statement, "statement unknown to server, preparing again");
        self.prepared.evict(&key);
        let prepared = self.prepare_keyed(key).await?;
        self.execute(&prepared.execute(params), options).await
    }

    fn statement_key(&self, statement: &str) -> StatementKey {
        StatementKey {
            addr: self.addr,
            keyspace: self.current_keyspace(),
            statement: statement.to_string(),
        }
    }

    /// Closes the connection, failing every in-flight request.
    ///
    /// Idempotent. The error handler sees a non-fatal `ConnectionClosed`.
    pub fn close(&self) {
        self.teardown(ClientError::ConnectionClosed, false, true);
    }

    pub(crate) fn fail(&self, err: ClientError) {
        self.teardown(err, true, true);
    }

    fn teardown(&self, err: ClientError, fatal: bool, notify: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if fatal {
            tracing::warn!(error = %err, in_flight = self.calls.len(), "closing connection");
        } else {
            tracing::debug!(in_flight = self.calls.len(), "closing connection");
        }

        for stream in self.calls.drain(&err) {
            self.streams.release(stream);
        }
        self.shutdown.cancel();
        if notify {
            self.error_handler.handle_error(self, &err, fatal);
        }
    }

    fn record_timeout(&self) {
        let timeouts = self.timeouts.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(limit) = self.config.timeout_limit {
            if timeouts > limit {
                self.fail(ClientError::TooManyTimeouts(timeouts));
            }
        }
    }

    /// Dispatches one frame from the read loop.
    fn route(&self, incoming: Incoming) -> Result<(), ClientError> {
        let (stream, outcome) = match incoming {
            Incoming::Frame(frame) => (frame.header.stream, Ok(frame)),
            Incoming::Oversized { header, error } => {
                tracing::warn!(stream = header.stream, %error, "discarded oversized frame");
                (header.stream, Err(ClientError::Protocol(error)))
            }
        };

        if stream == EVENT_STREAM_ID {
            if let Ok(frame) = outcome {
                self.dispatch_event(frame);
            }
            return Ok(());
        }
        if stream <= 0 {
            if let Ok(frame) = outcome {
                match decode_response(frame, self.compressor.as_deref()) {
                    Ok(parsed) => tracing::debug!(stream, response = ?parsed.response, "frame on reserved stream"),
                    Err(err) => tracing::debug!(stream, %err, "undecodable frame on reserved stream"),
                }
            }
            return Err(ProtocolError::InvalidStream(stream).into());
        }

        match self.calls.take(stream) {
            Taken::Waiting(tx) => {
                self.streams.release(stream);
                let _ = tx.send(outcome);
            }
            Taken::Abandoned => {
                self.streams.release(stream);
                tracing::debug!(stream, "late response for abandoned request");
            }
            Taken::Unregistered => {
                self.unsolicited.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(stream, "response for unknown stream id");
            }
        }
        Ok(())
    }

    fn dispatch_event(&self, frame: RawFrame) {
        match decode_response(frame, self.compressor.as_deref()) {
            Ok(ParsedResponse {
                response: Response::Event(event),
                ..
            }) => {
                tracing::debug!(?event, "server event");
                // No subscribers is fine.
                let _ = self.events.send(event);
            }
            Ok(parsed) => {
                tracing::warn!(opcode = %parsed.response.opcode(), "non-event frame on event stream")
            }
            Err(err) => tracing::warn!(%err, "failed to decode event"),
        }
    }

    /// Stream ids currently free for new requests.
    pub fn available_capacity(&self) -> usize {
        self.streams.available()
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        } else {
            ConnectionState::Ready
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.config.protocol_version
    }

    pub fn current_keyspace(&self) -> Option<String> {
        self.keyspace.lock().clone()
    }

    /// Registered calls, including abandoned ones awaiting a late response.
    pub fn in_flight_count(&self) -> usize {
        self.calls.len()
    }

    /// Requests that timed out on this connection.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Frames received for stream ids nobody was waiting on.
    pub fn unsolicited_frames(&self) -> u64 {
        self.unsolicited.load(Ordering::Relaxed)
    }

    /// Options the server advertised during the handshake.
    pub fn supported(&self) -> &Supported {
        &self.supported
    }

    pub fn prepared_cache(&self) -> &PreparedCache {
        &self.prepared
    }

    /// Subscribes to server events. Only events registered for are pushed.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Only a write deadline that expired before any byte of the frame reached
/// the transport leaves the byte stream intact. Transport errors and
/// partial frames fail the connection.
fn survives_write_failure(failure: &WriteFailure) -> bool {
    !failure.started && matches!(failure.error, ClientError::Timeout)
}

/// Picks the coalescing window for a transport; TLS always writes directly.
fn coalesce_window(config: &ConnectionConfig, is_tls: bool) -> Option<Duration> {
    config.coalesce_window.filter(|_| !is_tls)
}

/// Abandons a call whose caller stopped waiting.
///
/// A no-op once the read loop took the entry or the connection drained it.
struct PendingCall<'a> {
    calls: &'a InFlight,
    stream: StreamId,
    call: CallId,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.calls.abandon(self.stream, self.call);
    }
}

async fn read_loop(
    conn: Weak<Connection>,
    mut reader: FrameReader<ReadHalf<ClientStream>>,
    shutdown: CancellationToken,
) {
    let result = read_frames(&conn, &mut reader, &shutdown).await;
    let Some(conn) = conn.upgrade() else {
        return;
    };
    if let Err(err) = result {
        conn.fail(err);
    }
    conn.writer.shutdown().await;
    tracing::debug!("read loop stopped");
}

async fn read_frames<R: AsyncRead + Unpin>(
    conn: &Weak<Connection>,
    reader: &mut FrameReader<R>,
    shutdown: &CancellationToken,
) -> Result<(), ClientError> {
    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            incoming = reader.read_frame() => incoming?,
        };
        let Some(conn) = conn.upgrade() else {
            return Ok(());
        };
        conn.route(incoming)?;
    }
}

async fn heartbeat(conn: Weak<Connection>, shutdown: CancellationToken) {
    let Some((initial, steady, threshold)) = conn.upgrade().map(|c| {
        (
            c.config.heartbeat_interval,
            c.config.heartbeat_steady_interval,
            c.config.heartbeat_failure_threshold,
        )
    }) else {
        return;
    };

    let mut interval = initial;
    let mut failures = 0u32;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(conn) = conn.upgrade() else {
            return;
        };

        match conn.execute(&Request::Options, ExecuteOptions::default()).await {
            Ok(ParsedResponse {
                response: Response::Supported(_),
                ..
            }) => {
                failures = 0;
                interval = steady;
                continue;
            }
            Ok(parsed) => {
                tracing::warn!(opcode = %parsed.response.opcode(), "unexpected heartbeat response")
            }
            Err(_) if conn.is_closed() => return,
            Err(err) => tracing::debug!(%err, "heartbeat failed"),
        }

        failures += 1;
        interval = initial;
        if failures > threshold {
            conn.fail(ClientError::HeartbeatFailed(failures));
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PasswordAuthenticator;
    use crate::testing::*;
    use cqlwire_protocol::{Consistency, ErrorCode, FrameFlags, Opcode};
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingHandler {
        errors: parking_lot::Mutex<Vec<(String, bool)>>,
    }

    impl ConnectionErrorHandler for RecordingHandler {
        fn handle_error(&self, _conn: &Connection, error: &ClientError, fatal: bool) {
            self.errors.lock().push((error.to_string(), fatal));
        }
    }

    #[derive(Default)]
    struct RecordingTracer {
        ids: parking_lot::Mutex<Vec<Uuid>>,
    }

    impl Tracer for RecordingTracer {
        fn trace(&self, tracing_id: Uuid) {
            self.ids.lock().push(tracing_id);
        }
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::new().with_coalesce_window(None)
    }

    async fn connect(server: &FakeServer, config: ConnectionConfig) -> Arc<Connection> {
        dial(server.addr, config, Arc::new(crate::hooks::LogErrorHandler))
            .await
            .unwrap()
    }

    fn query(statement: &str) -> Request {
        Request::Query(Query::new(statement))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_select_one_returns_empty_rows_and_frees_stream() {
        let server = FakeServer::start(|req| match req.header.opcode {
            Opcode::Query => Reply::Frame(rows(req, &[])),
            _ => handshake_only(req),
        })
        .await;
        let conn = connect(&server, config()).await;
        let before = conn.available_capacity();

        let request = Request::Query(Query::new("SELECT 1").with_consistency(Consistency::One));
        let parsed = conn
            .execute(&request, ExecuteOptions::default())
            .await
            .unwrap();

        let Response::Result(QueryResult::Rows(rows)) = &parsed.response else {
            panic!("expected rows, got {:?}", parsed.response);
        };
        assert!(rows.is_empty());

        let sent = server.frames(Opcode::Query);
        assert_eq!(sent.len(), 1);
        assert_eq!(statement(&sent[0]), "SELECT 1");
        let stream = sent[0].header.stream;
        assert!(stream > 0);
        assert_eq!(parsed.header.stream, stream);
        assert!(!conn.streams.is_allocated(stream));
        assert_eq!(conn.available_capacity(), before);
        assert_eq!(conn.in_flight_count(), 0);
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_concurrent_responses_reach_their_callers() {
        let server = FakeServer::start(|req| match req.header.opcode {
            Opcode::Query => {
                let text = statement(req);
                let n: u64 = text[1..].parse().unwrap();
                // Later requests answer first.
                let delay = Duration::from_millis(5 * (20 - n));
                Reply::Delayed(delay, rows(req, &[text.as_bytes()]))
            }
            _ => handshake_only(req),
        })
        .await;
        // Coalescing on, so requests also share flushes.
        let conn = connect(&server, ConnectionConfig::new()).await;
        assert!(conn.writer.is_coalesced());

        let tasks: Vec<_> = (0..20)
            .map(|n| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move {
                    let text = format!("q{n}");
                    let parsed = conn
                        .execute(&query(&text), ExecuteOptions::default())
                        .await
                        .unwrap();
                    (text, parsed)
                })
            })
            .collect();

        for task in tasks {
            let (text, parsed) = task.await.unwrap();
            let Response::Result(QueryResult::Rows(rows)) = parsed.response else {
                panic!("expected rows");
            };
            assert_eq!(rows.rows[0][0].as_deref(), Some(text.as_bytes()));
        }
        assert_eq!(conn.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_keeps_stream_reserved_until_late_response() {
        let server = FakeServer::start(|req| match req.header.opcode {
            Opcode::Query => Reply::Delayed(Duration::from_millis(150), void(req)),
            _ => handshake_only(req),
        })
        .await;
        let conn = connect(&server, config()).await;

        let err = conn
            .execute(
                &query("SELECT slow"),
                ExecuteOptions::new().with_timeout(Duration::from_millis(30)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert_eq!(conn.timeouts(), 1);

        let stream = server.frames(Opcode::Query)[0].header.stream;
        assert!(conn.streams.is_allocated(stream));
        assert!(conn.calls.is_abandoned(stream));
        assert_eq!(conn.in_flight_count(), 1);

        wait_until(|| !conn.streams.is_allocated(stream)).await;
        assert_eq!(conn.in_flight_count(), 0);
        assert_eq!(conn.unsolicited_frames(), 0);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_fails_every_waiter_once() {
        let server = FakeServer::start(handshake_only).await;
        let handler = Arc::new(RecordingHandler::default());
        let conn = dial(server.addr, config(), handler.clone()).await.unwrap();
        let capacity = conn.available_capacity();

        let waiters: Vec<_> = (0..8)
            .map(|n| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move {
                    conn.execute(&query(&format!("q{n}")), ExecuteOptions::default())
                        .await
                })
            })
            .collect();
        wait_until(|| server.frames(Opcode::Query).len() == 8).await;

        conn.close();
        conn.close();
        for waiter in waiters {
            assert!(matches!(
                waiter.await.unwrap(),
                Err(ClientError::ConnectionClosed)
            ));
        }

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.available_capacity(), capacity);
        assert_eq!(
            *handler.errors.lock(),
            vec![("connection closed".to_string(), false)]
        );
        assert!(matches!(
            conn.execute(&query("SELECT 1"), ExecuteOptions::default()).await,
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_server_hangup_is_fatal() {
        let server = FakeServer::start(|req| match req.header.opcode {
            Opcode::Query => Reply::Hangup,
            _ => handshake_only(req),
        })
        .await;
        let handler = Arc::new(RecordingHandler::default());
        let conn = dial(server.addr, config(), handler.clone()).await.unwrap();

        let err = conn
            .execute(&query("SELECT 1"), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_fatal(), "{err}");
        assert!(conn.is_closed());

        let errors = handler.errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].1);
    }

    #[tokio::test]
    async fn test_transport_write_error_fails_connection() {
        for window in [None, Some(Duration::from_micros(200))] {
            let server = FakeServer::start(handshake_then_void).await;
            let handler = Arc::new(RecordingHandler::default());
            let conn = dial(
                server.addr,
                config().with_coalesce_window(window),
                handler.clone(),
            )
            .await
            .unwrap();
            let capacity = conn.available_capacity();

            // Writes after a shutdown fail before any byte reaches the socket.
            conn.writer.shutdown().await;
            let err = conn
                .execute(&query("SELECT 1"), ExecuteOptions::default())
                .await
                .unwrap_err();

            assert!(err.is_fatal(), "{err}");
            assert!(conn.is_closed());
            assert_eq!(conn.in_flight_count(), 0);
            assert_eq!(conn.available_capacity(), capacity);
            let errors = handler.errors.lock();
            assert_eq!(errors.len(), 1, "{errors:?}");
            assert!(errors[0].1);
        }
    }

    #[test]
    fn test_only_unstarted_write_timeouts_keep_the_connection() {
        let failure = |error, started| WriteFailure { error, started };

        assert!(survives_write_failure(&failure(ClientError::Timeout, false)));
        assert!(!survives_write_failure(&failure(ClientError::Timeout, true)));

        let broken_pipe = ClientError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(!survives_write_failure(&failure(broken_pipe.clone(), false)));
        assert!(!survives_write_failure(&failure(broken_pipe, true)));
        assert!(!survives_write_failure(&failure(ClientError::ConnectionClosed, false)));
    }

    #[test]
    fn test_coalescing_disabled_on_tls() {
        let window = Duration::from_micros(200);
        let coalesced = ConnectionConfig::new().with_coalesce_window(Some(window));
        assert_eq!(coalesce_window(&coalesced, false), Some(window));
        assert_eq!(coalesce_window(&coalesced, true), None);

        let direct = ConnectionConfig::new().with_coalesce_window(None);
        assert_eq!(coalesce_window(&direct, false), None);
        assert_eq!(coalesce_window(&direct, true), None);
    }

    #[tokio::test]
    async fn test_handshake_deadline() {
        let server = FakeServer::start(|req| match req.header.opcode {
            Opcode::Options => Reply::Nothing,
            _ => handshake_only(req),
        })
        .await;
        let handler = Arc::new(RecordingHandler::default());
        let config = config().with_connect_timeout(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let result = dial(server.addr, config, handler.clone()).await;

        assert!(matches!(result, Err(ClientError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(server.frames(Opcode::Startup).len(), 0);
        assert!(handler.errors.lock().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_closes_unresponsive_connection() {
        let server = FakeServer::start(|req| match req.header.opcode {
            // Only the handshake OPTIONS is answered.
            Opcode::Options if req.header.stream != 0 => Reply::Nothing,
            _ => handshake_only(req),
        })
        .await;
        let handler = Arc::new(RecordingHandler::default());
        let config = config()
            .with_heartbeat(Duration::from_millis(10), Duration::from_millis(10))
            .with_heartbeat_failure_threshold(1)
            .with_request_timeout(Duration::from_millis(40));
        let conn = dial(server.addr, config, handler.clone()).await.unwrap();

        wait_until(|| conn.is_closed()).await;
        let errors = handler.errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].0.contains("heartbeat failed 2 times"), "{:?}", errors[0]);
        assert!(errors[0].1);
    }

    #[tokio::test]
    async fn test_heartbeat_threshold_zero_closes_on_first_failure() {
        let server = FakeServer::start(|req| match req.header.opcode {
            Opcode::Options if req.header.stream != 0 => Reply::Nothing,
            _ => handshake_only(req),
        })
        .await;
        let handler = Arc::new(RecordingHandler::default());
        let config = config()
            .with_heartbeat(Duration::from_millis(10), Duration::from_millis(10))
            .with_heartbeat_failure_threshold(0)
            .with_request_timeout(Duration::from_millis(40));
        let conn = dial(server.addr, config, handler.clone()).await.unwrap();

        wait_until(|| conn.is_closed()).await;
        let errors = handler.errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].0.contains("heartbeat failed 1 times"), "{:?}", errors[0]);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_healthy_connection_open() {
        let server = FakeServer::start(handshake_only).await;
        let config = config().with_heartbeat(Duration::from_millis(5), Duration::from_millis(5));
        let conn = connect(&server, config).await;

        wait_until(|| server.frames(Opcode::Options).len() > 3).await;
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_oversized_response_fails_only_its_caller() {
        let server = FakeServer::start(|req| match req.header.opcode {
            Opcode::Query => {
                let big = vec![0u8; crate::config::MIN_FRAME_SIZE_LIMIT + 16];
                Reply::Frames(vec![
                    response(req, Opcode::Result, &big),
                    status_event(req.header.version, "UP", "10.0.0.1:9042".parse().unwrap()),
                ])
            }
            _ => handshake_only(req),
        })
        .await;
        let config = config().with_max_frame_size(crate::config::MIN_FRAME_SIZE_LIMIT);
        let conn = connect(&server, config).await;
        let mut events = conn.subscribe_events();

        let err = conn
            .execute(&query("SELECT big"), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::FrameTooLarge { .. })
        ));
        assert!(!err.is_fatal());

        // The frame after the oversized one is still parsed.
        let event = events.recv().await.unwrap();
        assert!(matches!(event, Event::StatusChange { ref change, .. } if change == "UP"));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_stream_is_counted_and_skipped() {
        let server = FakeServer::start(|req| match req.header.opcode {
            Opcode::Query => Reply::Frames(vec![
                frame_on(
                    req.header.version,
                    30000,
                    Opcode::Result,
                    FrameFlags::new(),
                    &1i32.to_be_bytes(),
                ),
                void(req),
            ]),
            _ => handshake_only(req),
        })
        .await;
        let conn = connect(&server, config()).await;

        let parsed = conn
            .execute(&query("SELECT 1"), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(parsed.response, Response::Result(QueryResult::Void));
        assert_eq!(conn.unsolicited_frames(), 1);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_reserved_stream_is_a_protocol_violation() {
        let server = FakeServer::start(|req| match req.header.opcode {
            Opcode::Query => Reply::Frame(frame_on(
                req.header.version,
                0,
                Opcode::Ready,
                FrameFlags::new(),
                &[],
            )),
            _ => handshake_only(req),
        })
        .await;
        let conn = connect(&server, config()).await;

        let err = conn
            .execute(&query("SELECT 1"), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::InvalidStream(0))
        ));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let server = FakeServer::start(|req| match req.header.opcode {
            Opcode::Query => Reply::Frames(vec![
                status_event(req.header.version, "DOWN", "10.0.0.2:9042".parse().unwrap()),
                void(req),
            ]),
            _ => handshake_only(req),
        })
        .await;
        let config = config().with_events(vec![EventType::StatusChange]);
        let conn = connect(&server, config).await;
        assert_eq!(server.frames(Opcode::Register).len(), 1);

        let mut events = conn.subscribe_events();
        conn.execute(&query("SELECT 1"), ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            Event::StatusChange {
                change: "DOWN".into(),
                address: "10.0.0.2:9042".parse().unwrap(),
            }
        );
    }

    #[tokio::test]
    async fn test_use_keyspace() {
        let server = FakeServer::start(|req| match req.header.opcode {
            Opcode::Query => {
                let text = statement(req);
                let keyspace = text
                    .trim_start_matches("USE \"")
                    .trim_end_matches('"')
                    .replace("\"\"", "\"");
                Reply::Frame(set_keyspace(req, &keyspace))
            }
            _ => handshake_only(req),
        })
        .await;
        let conn = connect(&server, config().with_keyspace("metrics")).await;
        assert_eq!(conn.current_keyspace().as_deref(), Some("metrics"));

        conn.use_keyspace("odd\"name").await.unwrap();
        assert_eq!(conn.current_keyspace().as_deref(), Some("odd\"name"));

        let sent: Vec<_> = server.frames(Opcode::Query).iter().map(statement).collect();
        assert_eq!(sent, vec!["USE \"metrics\"", "USE \"odd\"\"name\""]);
    }

    #[tokio::test]
    async fn test_dial_fails_when_keyspace_rejected() {
        let server = FakeServer::start(|req| match req.header.opcode {
            Opcode::Query => Reply::Frame(error(req, ErrorCode::Invalid, "Keyspace 'nope' does not exist")),
            _ => handshake_only(req),
        })
        .await;
        let handler = Arc::new(RecordingHandler::default());
        let result = dial(server.addr, config().with_keyspace("nope"), handler.clone()).await;

        let Err(ClientError::Server(err)) = result else {
            panic!("expected server error");
        };
        assert_eq!(err.code, ErrorCode::Invalid);
        assert!(handler.errors.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dial_requires_authenticator() {
        let server = FakeServer::start(|req| match req.header.opcode {
            Opcode::Startup => Reply::Frame(authenticate(
                req,
                "org.apache.cassandra.auth.PasswordAuthenticator",
            )),
            _ => handshake_only(req),
        })
        .await;
        let result = dial(server.addr, config(), Arc::new(crate::hooks::LogErrorHandler)).await;
        assert!(matches!(result, Err(ClientError::AuthRequired(_))));
    }

    #[tokio::test]
    async fn test_dial_with_password() {
        let server = FakeServer::start(|req| match req.header.opcode {
            Opcode::Startup => Reply::Frame(authenticate(
                req,
                "org.apache.cassandra.auth.PasswordAuthenticator",
            )),
            Opcode::AuthResponse => Reply::Frame(auth_success(req)),
            _ => handshake_then_void(req),
        })
        .await;
        let config =
            config().with_authenticator(Arc::new(PasswordAuthenticator::new("cassandra", "pw")));
        let conn = connect(&server, config).await;

        let token = auth_token(&server.frames(Opcode::AuthResponse)[0]).unwrap();
        assert_eq!(&token[..], b"\0cassandra\0pw");
        conn.execute(&query("SELECT 1"), ExecuteOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_prepare_is_single_flight() {
        let server = FakeServer::start(|req| match req.header.opcode {
            Opcode::Prepare => Reply::Delayed(Duration::from_millis(20), prepared(req, b"p1")),
            _ => handshake_only(req),
        })
        .await;
        let conn = connect(&server, config()).await;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move { conn.prepare("SELECT * FROM t WHERE k = ?").await })
            })
            .collect();
        for task in tasks {
            assert_eq!(&task.await.unwrap().unwrap().id[..], b"p1");
        }
        assert_eq!(server.frames(Opcode::Prepare).len(), 1);
        assert_eq!(conn.prepared_cache().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_prepare_can_be_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        let server = FakeServer::start(move |req| match req.header.opcode {
            Opcode::Prepare => {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    Reply::Frame(error(req, ErrorCode::Overloaded, "busy"))
                } else {
                    Reply::Frame(prepared(req, b"p2"))
                }
            }
            _ => handshake_only(req),
        })
        .await;
        let conn = connect(&server, config()).await;

        let err = conn.prepare("SELECT v FROM t").await.unwrap_err();
        assert_eq!(err.as_server_error().unwrap().code, ErrorCode::Overloaded);
        let prepared = conn.prepare("SELECT v FROM t").await.unwrap();
        assert_eq!(&prepared.id[..], b"p2");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unprepared_statement_is_prepared_again() {
        let prepares = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&prepares);
        let server = FakeServer::start(move |req| match req.header.opcode {
            Opcode::Prepare => {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Reply::Frame(prepared(req, format!("id-{n}").as_bytes()))
            }
            Opcode::Execute if &execute_id(req)[..] == b"id-1" => {
                Reply::Frame(unprepared(req, b"id-1"))
            }
            _ => handshake_then_void(req),
        })
        .await;
        let conn = connect(&server, config()).await;

        let parsed = conn
            .execute_statement(
                "INSERT INTO t (k) VALUES (?)",
                QueryParameters::default(),
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(parsed.response, Response::Result(QueryResult::Void));

        let executes = server.frames(Opcode::Execute);
        assert_eq!(executes.len(), 2);
        assert_eq!(&execute_id(&executes[1])[..], b"id-2");
        assert_eq!(prepares.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_keeps_stream_reserved() {
        let server = FakeServer::start(handshake_only).await;
        let conn = connect(&server, config()).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = conn
            .execute(
                &query("SELECT 1"),
                ExecuteOptions::new()
                    .with_cancel(cancel)
                    .with_timeout(Duration::ZERO),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));

        let stream = server.frames(Opcode::Query)[0].header.stream;
        assert!(conn.calls.is_abandoned(stream));
        assert_eq!(conn.timeouts(), 0);
    }

    #[tokio::test]
    async fn test_dropped_caller_abandons_call() {
        let server = FakeServer::start(handshake_only).await;
        let conn = connect(&server, config()).await;

        let request = query("SELECT 1");
        let call = conn.execute(&request, ExecuteOptions::default());
        assert!(tokio::time::timeout(Duration::from_millis(20), call)
            .await
            .is_err());

        let stream = server.frames(Opcode::Query)[0].header.stream;
        assert!(conn.calls.is_abandoned(stream));
        assert!(conn.streams.is_allocated(stream));
    }

    #[tokio::test]
    async fn test_timeout_limit_closes_connection() {
        let server = FakeServer::start(handshake_only).await;
        let handler = Arc::new(RecordingHandler::default());
        let config = config()
            .with_request_timeout(Duration::from_millis(10))
            .with_timeout_limit(1);
        let conn = dial(server.addr, config, handler.clone()).await.unwrap();

        for _ in 0..2 {
            let err = conn
                .execute(&query("SELECT 1"), ExecuteOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, ClientError::Timeout));
        }
        assert!(conn.is_closed());
        assert_eq!(
            handler.errors.lock()[0],
            ("too many request timeouts (2)".to_string(), true)
        );
    }

    #[tokio::test]
    async fn test_exhausted_streams() {
        let server = FakeServer::start(handshake_only).await;
        let config = config().with_protocol_version(ProtocolVersion::V2);
        let conn = connect(&server, config).await;
        assert_eq!(conn.available_capacity(), 127);

        let waiters: Vec<_> = (0..127)
            .map(|_| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move {
                    conn.execute(&query("SELECT 1"), ExecuteOptions::default())
                        .await
                })
            })
            .collect();
        wait_until(|| conn.in_flight_count() == 127).await;

        assert!(matches!(
            conn.execute(&query("SELECT 1"), ExecuteOptions::default())
                .await,
            Err(ClientError::NoStreams)
        ));
        conn.close();
        for waiter in waiters {
            assert!(waiter.await.unwrap().is_err());
        }
        assert_eq!(conn.available_capacity(), 127);
    }

    #[tokio::test]
    async fn test_tracer_receives_trace_id() {
        let trace = Uuid::new_v4();
        let server = FakeServer::start(move |req| match req.header.opcode {
            Opcode::Query => {
                let mut body = trace.as_bytes().to_vec();
                body.extend_from_slice(&1i32.to_be_bytes());
                Reply::Frame(frame_on(
                    req.header.version,
                    req.header.stream,
                    Opcode::Result,
                    FrameFlags::new().with_tracing(),
                    &body,
                ))
            }
            _ => handshake_only(req),
        })
        .await;
        let conn = connect(&server, config()).await;
        let tracer = Arc::new(RecordingTracer::default());

        let parsed = conn
            .execute(
                &query("SELECT 1"),
                ExecuteOptions::new().with_tracer(tracer.clone()),
            )
            .await
            .unwrap();
        assert_eq!(parsed.tracing_id, Some(trace));
        assert_eq!(*tracer.ids.lock(), vec![trace]);
        assert!(server.frames(Opcode::Query)[0].header.flags.is_tracing());
    }

    #[tokio::test]
    async fn test_version_mismatch_fails_the_call() {
        let server = FakeServer::start(|req| match req.header.opcode {
            Opcode::Query => Reply::Frame(frame_on(
                ProtocolVersion::V3,
                req.header.stream,
                Opcode::Result,
                FrameFlags::new(),
                &1i32.to_be_bytes(),
            )),
            _ => handshake_only(req),
        })
        .await;
        let conn = connect(&server, config()).await;

        let err = conn
            .execute(&query("SELECT 1"), ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::UnexpectedProtocolVersion {
                expected: ProtocolVersion::V4,
                got: ProtocolVersion::V3,
            }
        ));
        assert!(!conn.is_closed());
    }
}
