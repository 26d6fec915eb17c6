use crate::error::{Result, SyncError};
use crate::protocol::{self, Envelope, MessageBody};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Events surfaced to the engine: connection lifecycle plus
/// server-initiated envelopes that match no pending request.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Reconnected,
    ServerPush(Envelope),
    Error(String),
}

/// Unified request/response + server-push surface the engine consumes.
/// Implementations are single-writer: the engine serializes sends.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<()>> + Send;
    fn disconnect(&self) -> impl Future<Output = Result<()>> + Send;
    /// Sends one message and resolves with the correlated reply. An `error`
    /// reply resolves to `Err(SyncError::Server)`.
    fn send(&self, body: MessageBody) -> impl Future<Output = Result<Envelope>> + Send;
    fn is_connected(&self) -> bool;
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// One established bidirectional byte stream.
pub struct Conn {
    pub read: Box<dyn AsyncRead + Send + Unpin>,
    pub write: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Substrate abstraction: anything that can produce a fresh [`Conn`].
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self) -> impl Future<Output = Result<Conn>> + Send;
}

/// Newline-delimited JSON over TCP.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub fn new(url: &str) -> Result<Self> {
        let addr = match url.split_once("://") {
            Some(("tcp", rest)) => rest,
            Some((scheme, _)) => {
                return Err(SyncError::TransportFatal(format!(
                    "unsupported url scheme {scheme:?}"
                )));
            }
            None => url,
        };
        if addr.is_empty() {
            return Err(SyncError::TransportFatal(format!("bad server url {url:?}")));
        }
        Ok(TcpDialer {
            addr: addr.to_string(),
        })
    }
}

impl Dialer for TcpDialer {
    async fn dial(&self) -> Result<Conn> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| SyncError::Transport(format!("connect {}: {e}", self.addr)))?;
        let (read, write) = stream.into_split();
        Ok(Conn {
            read: Box::new(read),
            write: Box::new(write),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub request_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            request_timeout: Duration::from_millis(10_000),
            reconnect_base: Duration::from_millis(500),
            reconnect_cap: Duration::from_millis(30_000),
        }
    }
}

struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Envelope>>>,
    outbound: Mutex<VecDeque<String>>,
    connected: AtomicBool,
    stopping: AtomicBool,
    wake: Notify,
    events: broadcast::Sender<TransportEvent>,
}

impl Shared {
    fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Shared {
            pending: Mutex::new(HashMap::new()),
            outbound: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            wake: Notify::new(),
            events,
        }
    }

    fn fail_pending(&self) {
        // Dropping the senders resolves every waiting request with a
        // connection-lost error.
        self.pending.lock().expect("pending lock").clear();
    }

    fn dispatch(&self, line: &str) {
        match protocol::decode_line(line) {
            Ok(envelope) => {
                let waiter = self.pending.lock().expect("pending lock").remove(&envelope.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(envelope);
                    }
                    None => {
                        let _ = self.events.send(TransportEvent::ServerPush(envelope));
                    }
                }
            }
            Err(e) => {
                warn!("dropping inbound frame: {e}");
                let _ = self.events.send(TransportEvent::Error(e.to_string()));
            }
        }
    }
}

/// Long-lived bidirectional transport. One supervisor task owns the
/// connection: it drains the outbound queue, dispatches inbound frames and
/// reconnects with capped exponential back-off. The outbound queue and the
/// correlation table live outside the connection: an unsent frame survives a
/// reconnect, a request whose reply was lost runs into its own deadline.
pub struct StreamingTransport<D: Dialer> {
    dialer: Arc<D>,
    options: TransportOptions,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Dialer> StreamingTransport<D> {
    pub fn new(dialer: D, options: TransportOptions) -> Self {
        StreamingTransport {
            dialer: Arc::new(dialer),
            options,
            shared: Arc::new(Shared::new()),
            next_id: AtomicU64::new(1),
            supervisor: Mutex::new(None),
        }
    }

    async fn run_io(conn: Conn, shared: &Shared) {
        let mut lines = BufReader::new(conn.read).lines();
        let mut writer = conn.write;
        loop {
            if shared.stopping.load(Ordering::SeqCst) {
                return;
            }
            let queued = shared.outbound.lock().expect("outbound lock").pop_front();
            if let Some(line) = queued {
                let failed = writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err();
                if failed {
                    // Put it back; it goes out on the next connection.
                    shared
                        .outbound
                        .lock()
                        .expect("outbound lock")
                        .push_front(line);
                    return;
                }
                continue;
            }
            tokio::select! {
                _ = shared.wake.notified() => {}
                inbound = lines.next_line() => match inbound {
                    Ok(Some(line)) => shared.dispatch(&line),
                    Ok(None) => return,
                    Err(e) => {
                        debug!("read failed: {e}");
                        return;
                    }
                },
            }
        }
    }

    async fn supervise(dialer: Arc<D>, shared: Arc<Shared>, options: TransportOptions, first_conn: Conn) {
        let mut conn = Some(first_conn);
        let mut backoff = options.reconnect_base;
        let mut first = true;
        loop {
            if shared.stopping.load(Ordering::SeqCst) {
                break;
            }
            let established = match conn.take() {
                Some(c) => Some(c),
                None => match dialer.dial().await {
                    Ok(c) => Some(c),
                    Err(e) => {
                        let _ = shared.events.send(TransportEvent::Error(e.to_string()));
                        None
                    }
                },
            };
            if let Some(c) = established {
                backoff = options.reconnect_base;
                shared.connected.store(true, Ordering::SeqCst);
                let _ = shared.events.send(if first {
                    TransportEvent::Connected
                } else {
                    TransportEvent::Reconnected
                });
                first = false;
                Self::run_io(c, &shared).await;
                shared.connected.store(false, Ordering::SeqCst);
                // Pending completions are left in place: an unsent request
                // goes out after the reconnect, a lost one hits its own
                // deadline.
                if shared.stopping.load(Ordering::SeqCst) {
                    break;
                }
                let _ = shared.events.send(TransportEvent::Disconnected);
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(options.reconnect_cap);
        }
        shared.connected.store(false, Ordering::SeqCst);
    }
}

impl<D: Dialer> Transport for StreamingTransport<D> {
    async fn connect(&self) -> Result<()> {
        if self.supervisor.lock().expect("supervisor lock").is_some() {
            return Ok(());
        }
        self.shared.stopping.store(false, Ordering::SeqCst);
        // The first dial happens inline so startup failures surface to the
        // caller; reconnects after that belong to the supervisor.
        let conn = self.dialer.dial().await?;
        let handle = tokio::spawn(Self::supervise(
            self.dialer.clone(),
            self.shared.clone(),
            self.options.clone(),
            conn,
        ));
        *self.supervisor.lock().expect("supervisor lock") = Some(handle);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
        let handle = self.supervisor.lock().expect("supervisor lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.fail_pending();
        self.shared.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, body: MessageBody) -> Result<Envelope> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope::new(id, body);
        let line = protocol::encode_line(&envelope)?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().expect("pending lock").insert(id, tx);
        self.shared
            .outbound
            .lock()
            .expect("outbound lock")
            .push_back(line);
        self.shared.wake.notify_one();

        let deadline = self.options.request_timeout;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => match reply.body {
                MessageBody::Error(error) => Err(error.into()),
                _ => Ok(reply),
            },
            Ok(Err(_)) => Err(SyncError::Transport("connection lost".into())),
            Err(_) => {
                self.shared.pending.lock().expect("pending lock").remove(&id);
                Err(SyncError::Timeout {
                    id,
                    after_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }
}

/// Request/response transport: one dial per round trip. No server push; the
/// engine compensates with its pull interval.
pub struct PollingTransport<D: Dialer> {
    dialer: D,
    options: TransportOptions,
    next_id: AtomicU64,
    connected: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl<D: Dialer> PollingTransport<D> {
    pub fn new(dialer: D, options: TransportOptions) -> Self {
        let (events, _) = broadcast::channel(16);
        PollingTransport {
            dialer,
            options,
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            events,
        }
    }

    async fn round_trip(&self, envelope: &Envelope) -> Result<Envelope> {
        let conn = self.dialer.dial().await?;
        let mut writer = conn.write;
        let line = protocol::encode_line(envelope)?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        let mut lines = BufReader::new(conn.read).lines();
        loop {
            match lines.next_line().await? {
                Some(line) => {
                    let reply = protocol::decode_line(&line)?;
                    if reply.id == envelope.id {
                        return Ok(reply);
                    }
                    // Unsolicited frame on a polling substrate; skip it.
                    debug!("ignoring uncorrelated reply {}", reply.id);
                }
                None => {
                    return Err(SyncError::Transport("connection closed mid-request".into()));
                }
            }
        }
    }
}

impl<D: Dialer> Transport for PollingTransport<D> {
    async fn connect(&self) -> Result<()> {
        // Probe dial to validate reachability.
        let _ = self.dialer.dial().await?;
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, body: MessageBody) -> Result<Envelope> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope::new(id, body);
        let deadline = self.options.request_timeout;
        let reply = tokio::time::timeout(deadline, self.round_trip(&envelope))
            .await
            .map_err(|_| SyncError::Timeout {
                id,
                after_ms: deadline.as_millis() as u64,
            })??;
        match reply.body {
            MessageBody::Error(error) => Err(error.into()),
            _ => Ok(reply),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Streaming or polling behind one type, picked by configuration.
pub enum EitherTransport<D: Dialer> {
    Streaming(StreamingTransport<D>),
    Polling(PollingTransport<D>),
}

impl<D: Dialer> Transport for EitherTransport<D> {
    async fn connect(&self) -> Result<()> {
        match self {
            EitherTransport::Streaming(t) => t.connect().await,
            EitherTransport::Polling(t) => t.connect().await,
        }
    }

    async fn disconnect(&self) -> Result<()> {
        match self {
            EitherTransport::Streaming(t) => t.disconnect().await,
            EitherTransport::Polling(t) => t.disconnect().await,
        }
    }

    async fn send(&self, body: MessageBody) -> Result<Envelope> {
        match self {
            EitherTransport::Streaming(t) => t.send(body).await,
            EitherTransport::Polling(t) => t.send(body).await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            EitherTransport::Streaming(t) => t.is_connected(),
            EitherTransport::Polling(t) => t.is_connected(),
        }
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        match self {
            EitherTransport::Streaming(t) => t.events(),
            EitherTransport::Polling(t) => t.events(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageBody, PROTOCOL, VERSION};
    use std::sync::atomic::AtomicU32;
    use tokio::io::DuplexStream;

    /// Dialer whose every connection is handled by `serve` on the peer end.
    struct PipeDialer<F> {
        serve: F,
        dials: AtomicU32,
    }

    impl<F> PipeDialer<F>
    where
        F: Fn(u32, DuplexStream) + Send + Sync + 'static,
    {
        fn new(serve: F) -> Self {
            PipeDialer {
                serve,
                dials: AtomicU32::new(0),
            }
        }
    }

    impl<F> Dialer for PipeDialer<F>
    where
        F: Fn(u32, DuplexStream) + Send + Sync + 'static,
    {
        async fn dial(&self) -> Result<Conn> {
            let n = self.dials.fetch_add(1, Ordering::SeqCst);
            let (client, server) = tokio::io::duplex(64 * 1024);
            (self.serve)(n, server);
            let (read, write) = tokio::io::split(client);
            Ok(Conn {
                read: Box::new(read),
                write: Box::new(write),
            })
        }
    }

    /// Peer that answers every ping with a pong on the same id.
    fn pong_server(_: u32, stream: DuplexStream) {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(stream);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let env = protocol::decode_line(&line).unwrap();
                let reply = Envelope::new(env.id, MessageBody::Pong);
                let out = protocol::encode_line(&reply).unwrap();
                write.write_all(out.as_bytes()).await.unwrap();
                write.write_all(b"\n").await.unwrap();
            }
        });
    }

    fn options(timeout_ms: u64) -> TransportOptions {
        TransportOptions {
            request_timeout: Duration::from_millis(timeout_ms),
            reconnect_base: Duration::from_millis(10),
            reconnect_cap: Duration::from_millis(100),
        }
    }

    #[test_log::test(tokio::test)]
    async fn streaming_correlates_replies() {
        let transport = StreamingTransport::new(PipeDialer::new(pong_server), options(1000));
        transport.connect().await.unwrap();
        let reply = transport.send(MessageBody::Ping).await.unwrap();
        assert_eq!(reply.body, MessageBody::Pong);
        assert_eq!(reply.protocol, PROTOCOL);
        assert_eq!(reply.version, VERSION);
        assert!(transport.is_connected());
        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn streaming_times_out_dangling_requests() {
        // Peer that reads but never replies.
        let transport = StreamingTransport::new(
            PipeDialer::new(|_, stream| {
                tokio::spawn(async move {
                    let (read, _write) = tokio::io::split(stream);
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(_)) = lines.next_line().await {}
                });
            }),
            options(50),
        );
        transport.connect().await.unwrap();
        let err = transport.send(MessageBody::Ping).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout { .. }));
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn streaming_surfaces_server_push() {
        // Peer pushes an unsolicited envelope as soon as it sees a line.
        let transport = StreamingTransport::new(
            PipeDialer::new(|_, stream| {
                tokio::spawn(async move {
                    let (read, mut write) = tokio::io::split(stream);
                    let mut lines = BufReader::new(read).lines();
                    if let Ok(Some(line)) = lines.next_line().await {
                        let env = protocol::decode_line(&line).unwrap();
                        // Unsolicited first, then the reply.
                        let push = Envelope::new(9999, MessageBody::Ping);
                        let out = protocol::encode_line(&push).unwrap();
                        write.write_all(out.as_bytes()).await.unwrap();
                        write.write_all(b"\n").await.unwrap();
                        let reply = Envelope::new(env.id, MessageBody::Pong);
                        let out = protocol::encode_line(&reply).unwrap();
                        write.write_all(out.as_bytes()).await.unwrap();
                        write.write_all(b"\n").await.unwrap();
                    }
                });
            }),
            options(1000),
        );
        let mut events = transport.events();
        transport.connect().await.unwrap();
        let reply = transport.send(MessageBody::Ping).await.unwrap();
        assert_eq!(reply.body, MessageBody::Pong);

        loop {
            match events.recv().await.unwrap() {
                TransportEvent::ServerPush(env) => {
                    assert_eq!(env.id, 9999);
                    break;
                }
                _ => continue,
            }
        }
        transport.disconnect().await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn streaming_reconnects_and_flushes_buffered_sends() {
        // First connection dies immediately; the second one answers.
        let transport = StreamingTransport::new(
            PipeDialer::new(|n, stream| {
                if n == 0 {
                    drop(stream);
                } else {
                    pong_server(n, stream);
                }
            }),
            options(2000),
        );
        let mut events = transport.events();
        transport.connect().await.unwrap();

        // The send may race the first (dead) connection; the line stays
        // buffered and goes out after the reconnect.
        let reply = transport.send(MessageBody::Ping).await.unwrap();
        assert_eq!(reply.body, MessageBody::Pong);

        let mut saw_reconnect = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TransportEvent::Reconnected) {
                saw_reconnect = true;
            }
        }
        assert!(saw_reconnect);
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn polling_round_trips() {
        let transport = PollingTransport::new(PipeDialer::new(pong_server), options(1000));
        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        let reply = transport.send(MessageBody::Ping).await.unwrap();
        assert_eq!(reply.body, MessageBody::Pong);
        let reply = transport.send(MessageBody::Ping).await.unwrap();
        assert_eq!(reply.body, MessageBody::Pong);
    }

    #[tokio::test]
    async fn error_reply_becomes_server_error() {
        let transport = StreamingTransport::new(
            PipeDialer::new(|_, stream| {
                tokio::spawn(async move {
                    let (read, mut write) = tokio::io::split(stream);
                    let mut lines = BufReader::new(read).lines();
                    if let Ok(Some(line)) = lines.next_line().await {
                        let env = protocol::decode_line(&line).unwrap();
                        let reply = Envelope::error(env.id, "busy", "try later", true);
                        let out = protocol::encode_line(&reply).unwrap();
                        write.write_all(out.as_bytes()).await.unwrap();
                        write.write_all(b"\n").await.unwrap();
                    }
                });
            }),
            options(1000),
        );
        transport.connect().await.unwrap();
        let err = transport.send(MessageBody::Ping).await.unwrap_err();
        match err {
            SyncError::Server { code, retriable, .. } => {
                assert_eq!(code, "busy");
                assert!(retriable);
            }
            other => panic!("unexpected error {other:?}"),
        }
        transport.disconnect().await.unwrap();
    }

    #[test]
    fn tcp_dialer_rejects_bad_urls() {
        assert!(TcpDialer::new("tcp://localhost:7070").is_ok());
        assert!(TcpDialer::new("localhost:7070").is_ok());
        assert!(matches!(
            TcpDialer::new("http://localhost:7070"),
            Err(SyncError::TransportFatal(_))
        ));
        assert!(TcpDialer::new("tcp://").is_err());
    }
}
