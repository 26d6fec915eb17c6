use crate::change::{ChangeRecord, Document, Operation};
use crate::checkpoint::CheckpointSnapshot;
use crate::error::Result;
use crate::protocol::{
    self, ChangeBatch, Envelope, Handshake, HandshakeAck, MessageBody, Pull, PullResponse, Push,
    PushAck, PushConflict, codes,
};
use crate::transport::{Conn, Dialer};
use crate::vclock::Causality;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct Session {
    node_id: String,
    collections: Vec<String>,
    outbox: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct ServerState {
    documents: BTreeMap<String, BTreeMap<String, Document>>,
    log: BTreeMap<String, Vec<ChangeRecord>>,
    next_seq: BTreeMap<String, u64>,
    sessions: HashMap<String, Session>,
    next_session: u64,
}

struct ServerCore {
    node_id: String,
    auth: Option<String>,
    state: Mutex<ServerState>,
    push_ids: AtomicU64,
    /// (requests to let through, requests to fail after that).
    fault: Mutex<(u32, u32)>,
}

/// In-process reference implementation of the Universal Sync Protocol.
///
/// It speaks newline-delimited JSON over any byte stream: in-memory duplex
/// pipes through [`LocalServer::dialer`] or real sockets through
/// [`LocalServer::listen`]. The test suite and the conformance battery both
/// run against it.
#[derive(Clone)]
pub struct LocalServer {
    core: Arc<ServerCore>,
}

impl Default for LocalServer {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalServer {
    pub fn new() -> Self {
        Self::with_auth_option(None)
    }

    /// A server that rejects handshakes whose auth token differs.
    pub fn with_auth(token: impl Into<String>) -> Self {
        Self::with_auth_option(Some(token.into()))
    }

    fn with_auth_option(auth: Option<String>) -> Self {
        LocalServer {
            core: Arc::new(ServerCore {
                node_id: "server".to_string(),
                auth,
                state: Mutex::new(ServerState::default()),
                push_ids: AtomicU64::new(1_000_000_000),
                fault: Mutex::new((0, 0)),
            }),
        }
    }

    /// Dialer producing in-process connections to this server.
    pub fn dialer(&self) -> LocalDialer {
        LocalDialer {
            core: self.core.clone(),
        }
    }

    /// Binds a TCP listener and serves connections until the handle is
    /// dropped. Returns the bound address.
    pub async fn listen(&self, addr: &str) -> Result<std::net::SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        let core = self.core.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("accepted {peer}");
                        let (read, write) = stream.into_split();
                        tokio::spawn(serve_io(core.clone(), read, write));
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        break;
                    }
                }
            }
        });
        Ok(bound)
    }

    /// Makes the next `n` push/pull requests fail with a retriable error.
    pub fn inject_failures(&self, n: u32) {
        self.inject_failures_after(0, n);
    }

    /// Lets `skip` push/pull requests through, then fails the next `n`.
    pub fn inject_failures_after(&self, skip: u32, n: u32) {
        *self.core.fault.lock().expect("fault lock") = (skip, n);
    }

    /// Canonical server-side copy of a document.
    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        self.core
            .state
            .lock()
            .expect("server state lock")
            .documents
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Number of accepted changes in a collection's log.
    pub fn change_count(&self, collection: &str) -> usize {
        self.core
            .state
            .lock()
            .expect("server state lock")
            .log
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// In-process [`Dialer`]: every dial spawns a server session on the peer end
/// of a fresh duplex pipe.
pub struct LocalDialer {
    core: Arc<ServerCore>,
}

impl Dialer for LocalDialer {
    async fn dial(&self) -> Result<Conn> {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let (read, write) = tokio::io::split(server);
        tokio::spawn(serve_io(self.core.clone(), read, write));
        let (read, write) = tokio::io::split(client);
        Ok(Conn {
            read: Box::new(read),
            write: Box::new(write),
        })
    }
}

async fn serve_io<R, W>(core: Arc<ServerCore>, read: R, mut write: W)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(read).lines();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();

    loop {
        tokio::select! {
            Some(envelope) = out_rx.recv() => {
                if write_envelope(&mut write, &envelope).await.is_err() {
                    break;
                }
            }
            inbound = lines.next_line() => {
                let line = match inbound {
                    Ok(Some(line)) => line,
                    _ => break,
                };
                let reply = handle_line(&core, &out_tx, &line);
                if let Some(reply) = reply {
                    if write_envelope(&mut write, &reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    // Sessions outlive the connection on purpose: polling clients send each
    // request on a fresh connection. Dead outboxes are simply skipped.
}

async fn write_envelope<W: AsyncWrite + Unpin>(write: &mut W, envelope: &Envelope) -> Result<()> {
    let line = protocol::encode_line(envelope)?;
    write.write_all(line.as_bytes()).await?;
    write.write_all(b"\n").await?;
    write.flush().await?;
    Ok(())
}

fn handle_line(
    core: &Arc<ServerCore>,
    outbox: &mpsc::UnboundedSender<Envelope>,
    line: &str,
) -> Option<Envelope> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            return Some(Envelope::error(
                0,
                codes::MALFORMED_MESSAGE,
                format!("invalid json: {e}"),
                false,
            ));
        }
    };
    let id = value.get("id").and_then(Value::as_u64).unwrap_or(0);

    if let Err(error) = protocol::validate_value(&value) {
        return Some(Envelope::new(id, MessageBody::Error(error)));
    }
    let envelope: Envelope = match serde_json::from_value(value) {
        Ok(envelope) => envelope,
        Err(e) => {
            return Some(Envelope::error(
                id,
                codes::MALFORMED_MESSAGE,
                format!("undecodable payload: {e}"),
                false,
            ));
        }
    };

    match envelope.body {
        MessageBody::Ping => Some(Envelope::new(id, MessageBody::Pong)),
        MessageBody::Handshake(handshake) => Some(handle_handshake(core, outbox, id, handshake)),
        MessageBody::Push(push) => {
            if take_injected_failure(core) {
                return Some(Envelope::error(id, "unavailable", "injected failure", true));
            }
            Some(handle_push(core, id, push))
        }
        MessageBody::Pull(pull) => {
            if take_injected_failure(core) {
                return Some(Envelope::error(id, "unavailable", "injected failure", true));
            }
            Some(handle_pull(core, id, pull))
        }
        other => Some(Envelope::error(
            id,
            codes::MALFORMED_MESSAGE,
            format!("unexpected message type {:?}", other.type_name()),
            false,
        )),
    }
}

fn take_injected_failure(core: &ServerCore) -> bool {
    let mut fault = core.fault.lock().expect("fault lock");
    if fault.0 > 0 {
        fault.0 -= 1;
        false
    } else if fault.1 > 0 {
        fault.1 -= 1;
        true
    } else {
        false
    }
}

fn handle_handshake(
    core: &Arc<ServerCore>,
    outbox: &mpsc::UnboundedSender<Envelope>,
    id: u64,
    handshake: Handshake,
) -> Envelope {
    if let Some(expected) = &core.auth {
        if handshake.auth.as_deref() != Some(expected.as_str()) {
            return Envelope::error(id, codes::AUTH_REJECTED, "invalid auth token", false);
        }
    }

    let mut state = core.state.lock().expect("server state lock");
    state.next_session += 1;
    let sid = format!("s{}", state.next_session);
    state.sessions.insert(
        sid.clone(),
        Session {
            node_id: handshake.node_id.clone(),
            collections: handshake.collections.clone(),
            outbox: outbox.clone(),
        },
    );
    Envelope::new(
        id,
        MessageBody::HandshakeAck(HandshakeAck {
            session_id: sid,
            server_node_id: core.node_id.clone(),
            accepted_collections: handshake.collections,
        }),
    )
}

fn handle_push(core: &Arc<ServerCore>, id: u64, push: Push) -> Envelope {
    let records = match push.changes.into_records() {
        Ok(records) => records,
        Err(e) => {
            return Envelope::error(id, codes::MALFORMED_MESSAGE, e.to_string(), false);
        }
    };

    let mut state = core.state.lock().expect("server state lock");
    let Some(session) = state.sessions.get(&push.session_id) else {
        return Envelope::error(id, codes::UNKNOWN_SESSION, "handshake first", false);
    };
    let pusher = session.node_id.clone();

    let mut accepted = Vec::new();
    let mut accepted_records = Vec::new();
    let mut conflicts = Vec::new();

    for record in records {
        let current = state
            .documents
            .get(&push.collection)
            .and_then(|docs| docs.get(&record.document_id))
            .cloned();

        if let Some(current) = &current {
            // Replay of an already accepted revision acks without relogging.
            if current.rev.is_some() && current.rev.as_deref() == record.rev() {
                accepted.push(record.document_id.clone());
                continue;
            }
            let relation = record.vclock.compare(&current.vclock);
            if relation == Causality::Concurrent || relation == Causality::Before {
                conflicts.push(PushConflict {
                    document_id: record.document_id.clone(),
                    server_document: current.clone(),
                });
                continue;
            }
        }

        let document = match (&record.operation, &record.document) {
            (Operation::Delete, None) => {
                Document::tombstone(&record.document_id, None, record.vclock.clone())
            }
            (_, Some(document)) => document.clone(),
            _ => {
                conflicts.push(PushConflict {
                    document_id: record.document_id.clone(),
                    server_document: current.unwrap_or_default(),
                });
                continue;
            }
        };

        let seq = {
            let counter = state.next_seq.entry(push.collection.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        state
            .documents
            .entry(push.collection.clone())
            .or_default()
            .insert(record.document_id.clone(), document);

        let mut stored = record.clone();
        stored.sequence = Some(seq);
        state
            .log
            .entry(push.collection.clone())
            .or_default()
            .push(stored.clone());
        accepted.push(record.document_id.clone());
        accepted_records.push(stored);
    }

    let checkpoint = server_checkpoint(&state);

    // Streamed sessions subscribed to this collection hear about accepted
    // changes immediately, feeding their pull pipeline.
    if !accepted_records.is_empty() {
        let batch = ChangeBatch::plain(accepted_records);
        for session in state.sessions.values() {
            if session.node_id == pusher || !session.collections.contains(&push.collection) {
                continue;
            }
            let mut changes = BTreeMap::new();
            changes.insert(push.collection.clone(), batch.clone());
            let envelope = Envelope::new(
                core.push_ids.fetch_add(1, Ordering::SeqCst),
                MessageBody::PullResponse(PullResponse {
                    changes,
                    checkpoint: checkpoint.clone(),
                    has_more: false,
                }),
            );
            let _ = session.outbox.send(envelope);
        }
    }

    Envelope::new(
        id,
        MessageBody::PushAck(PushAck {
            accepted,
            conflicts,
            checkpoint,
        }),
    )
}

fn handle_pull(core: &Arc<ServerCore>, id: u64, pull: Pull) -> Envelope {
    let state = core.state.lock().expect("server state lock");
    if !state.sessions.contains_key(&pull.session_id) {
        return Envelope::error(id, codes::UNKNOWN_SESSION, "handshake first", false);
    }

    let limit = if pull.limit == 0 { usize::MAX } else { pull.limit };
    let mut remaining = limit;
    let mut has_more = false;
    let mut changes = BTreeMap::new();

    for collection in pull.collections.iter() {
        let since = pull.checkpoint.sequence(collection);
        let Some(log) = state.log.get(collection) else {
            continue;
        };
        let newer: Vec<&ChangeRecord> = log
            .iter()
            .filter(|r| r.sequence.is_some_and(|seq| seq > since))
            .collect();
        if newer.is_empty() {
            continue;
        }
        let take = remaining.min(newer.len());
        if take < newer.len() {
            has_more = true;
        }
        if take == 0 {
            break;
        }
        let batch: Vec<ChangeRecord> = newer[..take].iter().map(|r| (*r).clone()).collect();
        remaining -= take;
        changes.insert(collection.clone(), ChangeBatch::plain(batch));
    }

    Envelope::new(
        id,
        MessageBody::PullResponse(PullResponse {
            changes,
            checkpoint: server_checkpoint(&state),
            has_more,
        }),
    )
}

fn server_checkpoint(state: &ServerState) -> CheckpointSnapshot {
    let total: u64 = state.next_seq.values().sum();
    CheckpointSnapshot {
        sequences: state.next_seq.clone(),
        server_cursor: Some(format!("c{total}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::now_ms;
    use crate::error::SyncError;
    use crate::transport::{StreamingTransport, Transport, TransportOptions};
    use crate::vclock::VectorClock;
    use serde_json::json;
    use std::time::Duration;

    fn options() -> TransportOptions {
        TransportOptions {
            request_timeout: Duration::from_millis(2000),
            reconnect_base: Duration::from_millis(10),
            reconnect_cap: Duration::from_millis(100),
        }
    }

    async fn handshaken(
        server: &LocalServer,
        node: &str,
    ) -> (StreamingTransport<LocalDialer>, String) {
        let transport = StreamingTransport::new(server.dialer(), options());
        transport.connect().await.unwrap();
        let reply = transport
            .send(MessageBody::Handshake(Handshake {
                node_id: node.into(),
                collections: vec!["todos".into()],
                capabilities: vec!["columnar".into()],
                auth: None,
            }))
            .await
            .unwrap();
        let ack = match reply.body {
            MessageBody::HandshakeAck(ack) => ack,
            other => panic!("expected handshake ack, got {other:?}"),
        };
        assert_eq!(ack.server_node_id, "server");
        (transport, ack.session_id)
    }

    fn insert_record(id: &str, node: &str, counter: u64, title: &str) -> ChangeRecord {
        let mut document = Document::new(
            id,
            json!({"title": title}).as_object().cloned().unwrap_or_default(),
        );
        document.vclock = VectorClock::from([(node, counter)]);
        document.updated_at = now_ms();
        document.rev = Some(crate::revision::Revision::mint(counter, &document.content()));
        ChangeRecord {
            collection: "todos".into(),
            document_id: id.into(),
            operation: Operation::Insert,
            vclock: document.vclock.clone(),
            document: Some(document),
            previous_document: None,
            sequence: None,
            timestamp: now_ms(),
            node_id: node.into(),
            from_sync: false,
        }
    }

    async fn push(
        transport: &StreamingTransport<LocalDialer>,
        session: &str,
        records: Vec<ChangeRecord>,
    ) -> PushAck {
        let reply = transport
            .send(MessageBody::Push(Push {
                session_id: session.into(),
                collection: "todos".into(),
                changes: ChangeBatch::plain(records),
                checkpoint: CheckpointSnapshot::default(),
            }))
            .await
            .unwrap();
        match reply.body {
            MessageBody::PushAck(ack) => ack,
            other => panic!("expected push ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn push_assigns_sequences_and_stores_documents() {
        let server = LocalServer::new();
        let (transport, session) = handshaken(&server, "a").await;

        let ack = push(&transport, &session, vec![insert_record("t1", "a", 1, "x")]).await;
        assert_eq!(ack.accepted, vec!["t1"]);
        assert!(ack.conflicts.is_empty());
        assert_eq!(ack.checkpoint.sequence("todos"), 1);
        assert!(server.document("todos", "t1").is_some());
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn replayed_push_is_idempotent() {
        let server = LocalServer::new();
        let (transport, session) = handshaken(&server, "a").await;

        let record = insert_record("t1", "a", 1, "x");
        let first = push(&transport, &session, vec![record.clone()]).await;
        let second = push(&transport, &session, vec![record]).await;
        assert_eq!(first.accepted, second.accepted);
        assert_eq!(server.change_count("todos"), 1);
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_push_reports_conflict() {
        let server = LocalServer::new();
        let (ta, sa) = handshaken(&server, "a").await;
        let (tb, sb) = handshaken(&server, "b").await;

        let ack = push(&ta, &sa, vec![insert_record("t1", "a", 1, "from a")]).await;
        assert_eq!(ack.accepted, vec!["t1"]);

        // b never saw a's write: concurrent clocks.
        let ack = push(&tb, &sb, vec![insert_record("t1", "b", 1, "from b")]).await;
        assert!(ack.accepted.is_empty());
        assert_eq!(ack.conflicts.len(), 1);
        assert_eq!(ack.conflicts[0].document_id, "t1");
        assert_eq!(ack.conflicts[0].server_document.fields["title"], "from a");

        ta.disconnect().await.unwrap();
        tb.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn pull_pages_with_limit_and_checkpoint() {
        let server = LocalServer::new();
        let (transport, session) = handshaken(&server, "a").await;
        let records = (0..5)
            .map(|i| insert_record(&format!("t{i}"), "a", 1, "x"))
            .collect();
        push(&transport, &session, records).await;

        let (puller, pull_session) = handshaken(&server, "b").await;
        let mut checkpoint = CheckpointSnapshot::default();
        let mut seen = Vec::new();
        loop {
            let reply = puller
                .send(MessageBody::Pull(Pull {
                    session_id: pull_session.clone(),
                    collections: vec!["todos".into()],
                    checkpoint: checkpoint.clone(),
                    limit: 2,
                }))
                .await
                .unwrap();
            let MessageBody::PullResponse(response) = reply.body else {
                panic!("expected pull response");
            };
            let mut got_any = false;
            for (collection, batch) in response.changes {
                for record in batch.into_records().unwrap() {
                    let seq = record.sequence.unwrap();
                    checkpoint.sequences.insert(collection.clone(), seq);
                    seen.push(record.document_id);
                    got_any = true;
                }
            }
            if !response.has_more {
                break;
            }
            assert!(got_any);
        }
        assert_eq!(seen.len(), 5);
        transport.disconnect().await.unwrap();
        puller.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn auth_is_enforced() {
        let server = LocalServer::with_auth("sesame");
        let transport = StreamingTransport::new(server.dialer(), options());
        transport.connect().await.unwrap();
        let err = transport
            .send(MessageBody::Handshake(Handshake {
                node_id: "a".into(),
                collections: vec![],
                capabilities: vec![],
                auth: Some("wrong".into()),
            }))
            .await
            .unwrap_err();
        match err {
            SyncError::Server { code, .. } => assert_eq!(code, codes::AUTH_REJECTED),
            other => panic!("unexpected {other:?}"),
        }
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn push_without_session_is_rejected() {
        let server = LocalServer::new();
        let transport = StreamingTransport::new(server.dialer(), options());
        transport.connect().await.unwrap();
        let err = transport
            .send(MessageBody::Push(Push {
                session_id: "bogus".into(),
                collection: "todos".into(),
                changes: ChangeBatch::plain(vec![]),
                checkpoint: CheckpointSnapshot::default(),
            }))
            .await
            .unwrap_err();
        match err {
            SyncError::Server { code, .. } => assert_eq!(code, codes::UNKNOWN_SESSION),
            other => panic!("unexpected {other:?}"),
        }
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn columnar_pushes_are_unpacked() {
        let server = LocalServer::new();
        let (transport, session) = handshaken(&server, "a").await;
        let records = vec![
            insert_record("t1", "a", 1, "one"),
            insert_record("t2", "a", 1, "two"),
        ];
        let reply = transport
            .send(MessageBody::Push(Push {
                session_id: session,
                collection: "todos".into(),
                changes: ChangeBatch::packed(&records).unwrap(),
                checkpoint: CheckpointSnapshot::default(),
            }))
            .await
            .unwrap();
        let MessageBody::PushAck(ack) = reply.body else {
            panic!("expected push ack");
        };
        assert_eq!(ack.accepted.len(), 2);
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn streamed_peers_receive_server_push() {
        let server = LocalServer::new();
        let (ta, sa) = handshaken(&server, "a").await;
        let (tb, _sb) = handshaken(&server, "b").await;
        let mut events = tb.events();

        push(&ta, &sa, vec![insert_record("t1", "a", 1, "x")]).await;

        loop {
            match events.recv().await.unwrap() {
                crate::transport::TransportEvent::ServerPush(envelope) => {
                    let MessageBody::PullResponse(response) = envelope.body else {
                        panic!("expected pull response push");
                    };
                    assert!(response.changes.contains_key("todos"));
                    break;
                }
                _ => continue,
            }
        }
        ta.disconnect().await.unwrap();
        tb.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn injected_failures_return_retriable_errors() {
        let server = LocalServer::new();
        let (transport, session) = handshaken(&server, "a").await;
        server.inject_failures(1);

        let err = transport
            .send(MessageBody::Push(Push {
                session_id: session.clone(),
                collection: "todos".into(),
                changes: ChangeBatch::plain(vec![insert_record("t1", "a", 1, "x")]),
                checkpoint: CheckpointSnapshot::default(),
            }))
            .await
            .unwrap_err();
        assert!(err.is_retriable());

        // Budget exhausted: the next push succeeds.
        let ack = push(&transport, &session, vec![insert_record("t1", "a", 1, "x")]).await;
        assert_eq!(ack.accepted, vec!["t1"]);
        transport.disconnect().await.unwrap();
    }
}
