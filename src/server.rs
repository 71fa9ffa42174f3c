//! The server acceptor (spec.md §4.9, C9) and the public `MockWireServer`
//! facade (spec.md §6 "Programmatic surface").
//!
//! Grounded in the teacher's `server::conn::AddrIncoming` paired with
//! `hyper::server::Server::serve`: a bound listener driving a
//! spawn-one-task-per-accepted-socket loop. Where the teacher hands each
//! connection to a `MakeService`, mockwire hands it to the shared
//! `Dispatcher` and then, per connection, sequences the tunnel phase and
//! protocol selection from spec.md §4.6 before running the matching
//! exchange engine.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::{JoinHandle, JoinSet};

use crate::dispatcher::{Dispatcher, QueueDispatcher};
use crate::error::{Error, Result};
use crate::h1::conn::{Connection, ConnectionContext, DuplexSocket};
use crate::recorder::Recorder;
use crate::request::RecordedRequest;
use crate::response::MockResponse;

#[cfg(feature = "http2")]
use crate::h2;

/// How long `close()` waits for in-flight connections to idle before
/// forcing them closed (spec.md §4.9).
const QUIESCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on captured (not received) request body bytes, handed to
/// every `ConnectionContext` a connection is started with.
const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// ALPN/prior-knowledge protocol tokens accepted by `MockWireServer::set_protocols`
/// (spec.md §6 `protocols`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1_1,
    H2PriorKnowledge,
}

/// The wire protocol actually selected for one connection once the tunnel
/// phase has exited (spec.md §4.6 step 2). Distinct from `Protocol`: this
/// is the outcome of ALPN negotiation or prior-knowledge selection, not a
/// configuration knob.
enum Negotiated {
    Http1,
    Http2,
}

/// `server.useHttps(socketFactory)`'s client-auth knob. Certificate
/// loading, hostname verification, and the handshake itself are the
/// caller's responsibility (spec.md §1 Non-goals: "TLS certificate loading
/// and hostname verification" is an external collaborator); mockwire only
/// records which mode was requested and sequences the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    NoClientAuth,
    RequestClientAuth,
    RequireClientAuth,
}

/// Caller-supplied TLS wrap-up: given the raw accepted socket (post tunnel
/// phase), returns the encrypted stream and the ALPN protocol the
/// handshake negotiated, if any. mockwire never speaks TLS itself.
pub trait TlsAcceptor: Send + Sync {
    fn accept<'a>(
        &'a self,
        io: DuplexSocket,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<(DuplexSocket, Option<String>)>> + Send + 'a>>;
}

#[derive(Clone)]
struct TlsConfig {
    acceptor: Arc<dyn TlsAcceptor>,
    client_auth: ClientAuth,
}

struct Inner {
    default_dispatcher: Arc<QueueDispatcher>,
    dispatcher: Mutex<Arc<dyn Dispatcher>>,
    recorder: Arc<Recorder>,
    body_limit: Mutex<usize>,
    connection_index: AtomicU64,
    local_addr: Mutex<Option<SocketAddr>>,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown_triggered: AtomicBool,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    open_tasks: AsyncMutex<JoinSet<()>>,
    protocols: Mutex<Vec<Protocol>>,
    tls: Mutex<Option<TlsConfig>>,
    ping_interval: Mutex<Option<Duration>>,
}

impl Inner {
    fn active_dispatcher(&self) -> Arc<dyn Dispatcher> {
        self.dispatcher.lock().unwrap().clone()
    }

    fn select_alpn(&self, alpn: Option<&str>) -> Negotiated {
        match alpn {
            Some("h2") => Negotiated::Http2,
            _ => Negotiated::Http1,
        }
    }

    fn begin_shutdown(self: &Arc<Inner>) {
        if self.shutdown_triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move { inner.close().await });
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        #[cfg(feature = "layers")]
        tracing::debug!("server closing, quiescing active connections");
        if let Some(handle) = self.accept_task.lock().unwrap().take() {
            handle.abort();
        }
        self.active_dispatcher().close();

        let mut tasks = self.open_tasks.lock().await;
        let deadline = tokio::time::sleep(QUIESCE_TIMEOUT);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
                _ = &mut deadline => {
                    #[cfg(feature = "layers")]
                    tracing::warn!("quiesce deadline elapsed, forcing remaining connections closed");
                    tasks.shutdown().await;
                    break;
                }
            }
        }
    }
}

/// A scriptable in-process mock HTTP server (spec.md §1 OVERVIEW). Cheap to
/// clone: every clone shares the same listener, dispatcher, and recorder.
#[derive(Clone)]
pub struct MockWireServer {
    inner: Arc<Inner>,
}

impl Default for MockWireServer {
    fn default() -> Self {
        MockWireServer::new()
    }
}

impl MockWireServer {
    pub fn new() -> MockWireServer {
        let default_dispatcher = Arc::new(QueueDispatcher::new());
        MockWireServer {
            inner: Arc::new(Inner {
                dispatcher: Mutex::new(default_dispatcher.clone() as Arc<dyn Dispatcher>),
                default_dispatcher,
                recorder: Arc::new(Recorder::new()),
                body_limit: Mutex::new(DEFAULT_BODY_LIMIT),
                connection_index: AtomicU64::new(0),
                local_addr: Mutex::new(None),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown_triggered: AtomicBool::new(false),
                accept_task: Mutex::new(None),
                open_tasks: AsyncMutex::new(JoinSet::new()),
                protocols: Mutex::new(vec![Protocol::Http1_1]),
                tls: Mutex::new(None),
                ping_interval: Mutex::new(None),
            }),
        }
    }

    /// Schedules an HTTP/2 degraded-liveness PING (spec.md §4.4 "PING
    /// liveness with 'degraded' detection") on every connection at this
    /// cadence. Has no effect on HTTP/1 connections. `None` (the default)
    /// disables the scheduler.
    pub fn set_ping_interval(&self, interval: Option<Duration>) {
        *self.inner.ping_interval.lock().unwrap() = interval;
    }

    /// Binds and spawns the accept loop. Idempotent for repeated calls with
    /// the same (or an unspecified) address; returns an error if the
    /// server is already listening on a different port (spec.md §4.9).
    pub async fn start(&self, host: Option<&str>, port: Option<u16>) -> Result<()> {
        let host = host.unwrap_or("127.0.0.1").to_string();
        let port = port.unwrap_or(0);

        if self.inner.started.load(Ordering::SeqCst) {
            let current = *self.inner.local_addr.lock().unwrap();
            if let Some(current) = current {
                if port == 0 || current.port() == port {
                    return Ok(());
                }
            }
            return Err(Error::new_user("server already started on a different address"));
        }

        let listener = TcpListener::bind((host.as_str(), port)).await.map_err(Error::new_io)?;
        let local_addr = listener.local_addr().map_err(Error::new_io)?;
        *self.inner.local_addr.lock().unwrap() = Some(local_addr);
        self.inner.started.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { accept_loop(inner, listener).await });
        *self.inner.accept_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Idempotent: closes the listening socket, then waits up to 5s for
    /// active connections to idle before forcing them closed (spec.md
    /// §4.9).
    pub async fn close(&self) {
        self.inner.close().await;
    }

    pub fn port(&self) -> u16 {
        self.inner.local_addr.lock().unwrap().map(|a| a.port()).unwrap_or(0)
    }

    pub fn host_name(&self) -> String {
        self.inner
            .local_addr
            .lock()
            .unwrap()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn url(&self, path: &str) -> String {
        let scheme = if self.inner.tls.lock().unwrap().is_some() { "https" } else { "http" };
        format!("{}://{}:{}{}", scheme, self.host_name(), self.port(), path)
    }

    /// `host:port`, for pointing a client under test at this server as an
    /// HTTP proxy (spec.md §4.6 step 1's tunnel phase is how `CONNECT`
    /// requests through that proxy address get served).
    pub fn proxy_address(&self) -> String {
        format!("{}:{}", self.host_name(), self.port())
    }

    /// Shortcut for the default FIFO dispatcher; has no effect once
    /// `set_dispatcher` has replaced the active strategy.
    pub fn enqueue(&self, response: MockResponse) {
        self.inner.default_dispatcher.enqueue(response);
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        *self.inner.dispatcher.lock().unwrap() = dispatcher;
    }

    pub async fn take_request(&self) -> RecordedRequest {
        self.inner.recorder.take_request().await
    }

    pub async fn take_request_timeout(&self, timeout: Duration) -> Option<RecordedRequest> {
        self.inner.recorder.take_request_timeout(timeout).await
    }

    pub fn request_count(&self) -> u64 {
        self.inner.recorder.request_count()
    }

    pub fn set_body_limit(&self, limit: usize) {
        *self.inner.body_limit.lock().unwrap() = limit;
    }

    pub fn use_https(&self, acceptor: Arc<dyn TlsAcceptor>) {
        let mut tls = self.inner.tls.lock().unwrap();
        let client_auth = tls.as_ref().map(|t| t.client_auth).unwrap_or(ClientAuth::NoClientAuth);
        *tls = Some(TlsConfig { acceptor, client_auth });
    }

    pub fn no_client_auth(&self) {
        self.set_client_auth(ClientAuth::NoClientAuth);
    }

    pub fn request_client_auth(&self) {
        self.set_client_auth(ClientAuth::RequestClientAuth);
    }

    pub fn require_client_auth(&self) {
        self.set_client_auth(ClientAuth::RequireClientAuth);
    }

    fn set_client_auth(&self, auth: ClientAuth) {
        if let Some(tls) = self.inner.tls.lock().unwrap().as_mut() {
            tls.client_auth = auth;
        }
    }

    /// Sets the ordered ALPN candidate list. Rejects an empty list, a list
    /// containing neither `HTTP_1_1` nor `H2_PRIOR_KNOWLEDGE`, and a list
    /// combining `H2_PRIOR_KNOWLEDGE` with any other entry (spec.md §6).
    pub fn set_protocols(&self, protocols: Vec<Protocol>) -> Result<()> {
        if protocols.is_empty() {
            return Err(Error::new_user("protocols must not be empty"));
        }
        let has_h2_prior_knowledge = protocols.iter().any(|p| matches!(p, Protocol::H2PriorKnowledge));
        if has_h2_prior_knowledge && protocols.len() > 1 {
            return Err(Error::new_user("H2_PRIOR_KNOWLEDGE cannot be combined with any other protocol"));
        }
        *self.inner.protocols.lock().unwrap() = protocols;
        Ok(())
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        let (socket, _peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => return,
        };
        let connection_index = inner.connection_index.fetch_add(1, Ordering::SeqCst);
        #[cfg(feature = "layers")]
        tracing::debug!(connection_index, peer = %_peer_addr, "accepted connection");

        let peeked = inner.active_dispatcher().peek();
        if let Some(crate::response::SocketEffect::CloseSocket { .. }) = peeked.on_request_start {
            #[cfg(feature = "layers")]
            tracing::debug!(connection_index, "closing socket pre-read per scripted onRequestStart");
            inner
                .recorder
                .record(RecordedRequest::bookkeeping(connection_index, 0, None));
            drop(socket);
            continue;
        }

        let inner_for_task = inner.clone();
        let mut tasks = inner.open_tasks.lock().await;
        tasks.spawn(async move {
            handle_connection(inner_for_task, socket, connection_index).await;
        });
    }
}

async fn handle_connection(inner: Arc<Inner>, socket: tokio::net::TcpStream, connection_index: u64) {
    let _ = socket.set_nodelay(true);
    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let ctx = ConnectionContext {
        dispatcher: inner.active_dispatcher(),
        recorder: inner.recorder.clone(),
        connection_index,
        body_limit: *inner.body_limit.lock().unwrap(),
        shutdown_requested: shutdown_requested.clone(),
        ping_interval: *inner.ping_interval.lock().unwrap(),
    };

    let mut conn = Connection::new(socket, ctx);
    let ready = matches!(conn.serve_tunnel().await, Ok(true));
    if !ready {
        if shutdown_requested.load(Ordering::SeqCst) {
            inner.begin_shutdown();
        }
        return;
    }

    let (duplex, ctx) = conn.into_duplex();
    let tls = inner.tls.lock().unwrap().clone();

    let (io, negotiated) = if let Some(tls_config) = tls {
        if ctx.dispatcher.peek().fail_handshake() {
            inner.recorder.record(RecordedRequest::bookkeeping(
                ctx.connection_index,
                0,
                Some(Error::new_handshake("scripted TLS handshake failure")),
            ));
            return;
        }
        match tls_config.acceptor.accept(duplex).await {
            Ok((encrypted, alpn)) => {
                let negotiated = inner.select_alpn(alpn.as_deref());
                (encrypted, negotiated)
            }
            Err(err) => {
                inner
                    .recorder
                    .record(RecordedRequest::bookkeeping(ctx.connection_index, 0, Some(Error::new_handshake(err))));
                return;
            }
        }
    } else if inner.protocols.lock().unwrap().iter().any(|p| matches!(p, Protocol::H2PriorKnowledge)) {
        (duplex, Negotiated::Http2)
    } else {
        (duplex, Negotiated::Http1)
    };

    match negotiated {
        Negotiated::Http2 => {
            #[cfg(feature = "http2")]
            {
                let _ = h2::serve(io, ctx).await;
            }
            #[cfg(not(feature = "http2"))]
            {
                drop(io);
                drop(ctx);
            }
        }
        Negotiated::Http1 => {
            Connection::new(io, ctx).serve().await;
        }
    }

    if shutdown_requested.load(Ordering::SeqCst) {
        inner.begin_shutdown();
    }
}

