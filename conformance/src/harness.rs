//! Black-box battery driving a candidate server through the minimal
//! Universal Sync Protocol: handshake, auth rejection, push accept, pull
//! since checkpoint, ping/pong, malformed-message rejection and version
//! echo. Works over raw wire lines so a server's framing is exercised
//! exactly as a client would.

use pocket_sync::change::{ChangeRecord, Document, now_ms};
use pocket_sync::checkpoint::CheckpointSnapshot;
use pocket_sync::protocol::{
    self, ChangeBatch, Envelope, Handshake, HandshakeAck, MessageBody, Pull, Push, codes,
};
use pocket_sync::revision::Revision;
use pocket_sync::transport::Dialer;
use pocket_sync::vclock::VectorClock;
use pocket_sync::Operation;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

const REPLY_TIMEOUT: Duration = Duration::from_millis(2_000);

#[derive(Debug, Clone, Default)]
pub struct ConformanceOptions {
    /// Token the server accepts, when it requires auth.
    pub auth_token: Option<String>,
    /// Whether to exercise the invalid-auth rejection case.
    pub expect_auth: bool,
}

#[derive(Debug, Clone)]
pub struct CaseResult {
    pub name: String,
    pub passed: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct ConformanceReport {
    pub cases: Vec<CaseResult>,
}

impl ConformanceReport {
    pub fn compliant(&self) -> bool {
        self.cases.iter().all(|c| c.passed)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for case in &self.cases {
            let mark = if case.passed { "PASS" } else { "FAIL" };
            out.push_str(&format!(
                "{mark}  {:<36} {:>6.1?}",
                case.name, case.duration
            ));
            if let Some(error) = &case.error {
                out.push_str(&format!("  {error}"));
            }
            out.push('\n');
        }
        let verdict = if self.compliant() {
            "server is protocol compliant"
        } else {
            "server is NOT protocol compliant"
        };
        out.push_str(&format!(
            "{}/{} cases passed - {verdict}\n",
            self.cases.iter().filter(|c| c.passed).count(),
            self.cases.len()
        ));
        out
    }

    async fn run<F>(&mut self, name: &str, case: F)
    where
        F: Future<Output = Result<(), String>>,
    {
        let started = Instant::now();
        let outcome = case.await;
        let duration = started.elapsed();
        self.cases.push(CaseResult {
            name: name.to_string(),
            passed: outcome.is_ok(),
            duration,
            error: outcome.err(),
        });
    }
}

/// Runs the full battery against whatever the dialer connects to.
pub async fn run_battery<D: Dialer>(dialer: &D, options: &ConformanceOptions) -> ConformanceReport {
    let mut report = ConformanceReport::default();
    report
        .run("valid handshake", valid_handshake(dialer, options))
        .await;
    if options.expect_auth {
        report
            .run("invalid auth rejected", invalid_auth(dialer))
            .await;
    }
    report.run("push accepted", push_accept(dialer, options)).await;
    report
        .run("pull since checkpoint", pull_since_checkpoint(dialer, options))
        .await;
    report.run("ping pong", ping_pong(dialer, options)).await;
    report
        .run("malformed message rejected", malformed_rejected(dialer))
        .await;
    report
        .run("unknown version rejected", unknown_version_rejected(dialer))
        .await;
    report.run("version echo", version_echo(dialer)).await;
    report
}

/// One raw wire connection with request/reply correlation by envelope id.
struct Probe {
    lines: Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>,
    write: Box<dyn AsyncWrite + Send + Unpin>,
    next_id: u64,
}

impl Probe {
    async fn open<D: Dialer>(dialer: &D) -> Result<Probe, String> {
        let conn = dialer.dial().await.map_err(|e| format!("dial: {e}"))?;
        Ok(Probe {
            lines: BufReader::new(conn.read).lines(),
            write: conn.write,
            next_id: 1,
        })
    }

    async fn send_raw(&mut self, line: &str) -> Result<(), String> {
        self.write
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("write: {e}"))?;
        self.write
            .write_all(b"\n")
            .await
            .map_err(|e| format!("write: {e}"))?;
        self.write.flush().await.map_err(|e| format!("flush: {e}"))?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Envelope, String> {
        let line = tokio::time::timeout(REPLY_TIMEOUT, self.lines.next_line())
            .await
            .map_err(|_| "timed out waiting for reply".to_string())?
            .map_err(|e| format!("read: {e}"))?
            .ok_or_else(|| "connection closed".to_string())?;
        protocol::decode_line(&line).map_err(|e| format!("reply not decodable: {e}"))
    }

    /// Sends a body under a fresh id and waits for the correlated reply.
    async fn request(&mut self, body: MessageBody) -> Result<Envelope, String> {
        let id = self.next_id;
        self.next_id += 1;
        let envelope = Envelope::new(id, body);
        let line = protocol::encode_line(&envelope).map_err(|e| e.to_string())?;
        self.send_raw(&line).await?;
        loop {
            let reply = self.recv().await?;
            if reply.id == id {
                return Ok(reply);
            }
            // Server-initiated pushes may interleave; skip them.
        }
    }

    async fn handshake(
        &mut self,
        node_id: &str,
        auth: Option<String>,
    ) -> Result<HandshakeAck, String> {
        let reply = self
            .request(MessageBody::Handshake(Handshake {
                node_id: node_id.to_string(),
                collections: vec!["conformance".to_string()],
                capabilities: vec!["columnar".to_string()],
                auth,
            }))
            .await?;
        match reply.body {
            MessageBody::HandshakeAck(ack) => Ok(ack),
            other => Err(format!("expected handshake-ack, got {}", other.type_name())),
        }
    }
}

fn make_change(node: &str, doc_id: &str, counter: u64, value: i64) -> ChangeRecord {
    let mut document = Document::new(
        doc_id,
        json!({"value": value}).as_object().cloned().unwrap_or_default(),
    );
    let mut vclock = VectorClock::new();
    for _ in 0..counter {
        vclock.increment(node);
    }
    document.vclock = vclock.clone();
    document.updated_at = now_ms();
    document.rev = Some(Revision::mint(counter, &document.content()));
    ChangeRecord {
        collection: "conformance".to_string(),
        document_id: doc_id.to_string(),
        operation: Operation::Insert,
        document: Some(document),
        previous_document: None,
        sequence: None,
        timestamp: now_ms(),
        node_id: node.to_string(),
        vclock,
        from_sync: false,
    }
}

async fn valid_handshake<D: Dialer>(dialer: &D, options: &ConformanceOptions) -> Result<(), String> {
    let mut probe = Probe::open(dialer).await?;
    let ack = probe
        .handshake("conf-client", options.auth_token.clone())
        .await?;
    if ack.session_id.is_empty() {
        return Err("empty session id".into());
    }
    if ack.server_node_id.is_empty() {
        return Err("empty server node id".into());
    }
    if !ack.accepted_collections.contains(&"conformance".to_string()) {
        return Err("requested collection not accepted".into());
    }
    Ok(())
}

async fn invalid_auth<D: Dialer>(dialer: &D) -> Result<(), String> {
    let mut probe = Probe::open(dialer).await?;
    let reply = probe
        .request(MessageBody::Handshake(Handshake {
            node_id: "conf-client".to_string(),
            collections: vec![],
            capabilities: vec![],
            auth: Some("definitely-not-the-right-token".to_string()),
        }))
        .await?;
    match reply.body {
        MessageBody::Error(error) if error.code == codes::AUTH_REJECTED => Ok(()),
        MessageBody::Error(error) => Err(format!(
            "rejected with code {:?}, expected {:?}",
            error.code,
            codes::AUTH_REJECTED
        )),
        other => Err(format!(
            "bad auth was not rejected, got {}",
            other.type_name()
        )),
    }
}

async fn push_accept<D: Dialer>(dialer: &D, options: &ConformanceOptions) -> Result<(), String> {
    let mut probe = Probe::open(dialer).await?;
    let ack = probe
        .handshake("conf-push", options.auth_token.clone())
        .await?;
    let change = make_change("conf-push", "push-1", 1, 42);
    let reply = probe
        .request(MessageBody::Push(Push {
            session_id: ack.session_id,
            collection: "conformance".to_string(),
            changes: ChangeBatch::plain(vec![change]),
            checkpoint: CheckpointSnapshot::default(),
        }))
        .await?;
    match reply.body {
        MessageBody::PushAck(ack) => {
            if !ack.accepted.contains(&"push-1".to_string()) {
                return Err(format!("change not accepted: {:?}", ack.accepted));
            }
            if ack.checkpoint.sequence("conformance") == 0 {
                return Err("push-ack checkpoint did not advance".into());
            }
            Ok(())
        }
        other => Err(format!("expected push-ack, got {}", other.type_name())),
    }
}

async fn pull_since_checkpoint<D: Dialer>(
    dialer: &D,
    options: &ConformanceOptions,
) -> Result<(), String> {
    let mut probe = Probe::open(dialer).await?;
    let ack = probe
        .handshake("conf-pull", options.auth_token.clone())
        .await?;
    let session_id = ack.session_id;

    let changes: Vec<ChangeRecord> = (1..=3)
        .map(|i| make_change("conf-pull", &format!("pull-{i}"), 1, i))
        .collect();
    let reply = probe
        .request(MessageBody::Push(Push {
            session_id: session_id.clone(),
            collection: "conformance".to_string(),
            changes: ChangeBatch::plain(changes),
            checkpoint: CheckpointSnapshot::default(),
        }))
        .await?;
    let MessageBody::PushAck(_) = reply.body else {
        return Err("push before pull failed".into());
    };

    // First pull from zero: everything comes back in sequence order.
    let reply = probe
        .request(MessageBody::Pull(Pull {
            session_id: session_id.clone(),
            collections: vec!["conformance".to_string()],
            checkpoint: CheckpointSnapshot::default(),
            limit: 100,
        }))
        .await?;
    let response = match reply.body {
        MessageBody::PullResponse(response) => response,
        other => return Err(format!("expected pull-response, got {}", other.type_name())),
    };
    let records = response
        .changes
        .get("conformance")
        .cloned()
        .map(ChangeBatch::into_records)
        .transpose()
        .map_err(|e| e.to_string())?
        .unwrap_or_default();
    if records.len() < 3 {
        return Err(format!("expected at least 3 changes, got {}", records.len()));
    }
    let sequences: Vec<u64> = records.iter().filter_map(|r| r.sequence).collect();
    if sequences.len() != records.len() || sequences.windows(2).any(|w| w[0] >= w[1]) {
        return Err(format!("sequences not strictly increasing: {sequences:?}"));
    }

    // Second pull from a mid checkpoint: only later changes come back.
    let mut checkpoint = CheckpointSnapshot::default();
    checkpoint
        .sequences
        .insert("conformance".to_string(), sequences[sequences.len() - 2]);
    let reply = probe
        .request(MessageBody::Pull(Pull {
            session_id,
            collections: vec!["conformance".to_string()],
            checkpoint,
            limit: 100,
        }))
        .await?;
    let MessageBody::PullResponse(response) = reply.body else {
        return Err("expected pull-response".into());
    };
    let later = response
        .changes
        .get("conformance")
        .cloned()
        .map(ChangeBatch::into_records)
        .transpose()
        .map_err(|e| e.to_string())?
        .unwrap_or_default();
    if later.len() != 1 {
        return Err(format!(
            "pull past checkpoint returned {} changes, expected 1",
            later.len()
        ));
    }
    Ok(())
}

async fn ping_pong<D: Dialer>(dialer: &D, _options: &ConformanceOptions) -> Result<(), String> {
    let mut probe = Probe::open(dialer).await?;
    let reply = probe.request(MessageBody::Ping).await?;
    match reply.body {
        MessageBody::Pong => Ok(()),
        other => Err(format!("expected pong, got {}", other.type_name())),
    }
}

async fn malformed_rejected<D: Dialer>(dialer: &D) -> Result<(), String> {
    let mut probe = Probe::open(dialer).await?;

    // A push with no payload at all.
    let line = format!(
        r#"{{"protocol":"usp","version":"1.0.0","type":"push","id":7,"timestamp":{}}}"#,
        now_ms()
    );
    probe.send_raw(&line).await?;
    let reply = probe.recv().await?;
    let error = match reply.body {
        MessageBody::Error(error) => error,
        other => {
            return Err(format!(
                "payload-less push not rejected, got {}",
                other.type_name()
            ));
        }
    };
    if error.code != codes::MALFORMED_MESSAGE {
        return Err(format!("unexpected error code {:?}", error.code));
    }

    // Outright junk must also produce an error envelope.
    probe.send_raw("this is not json").await?;
    let reply = probe.recv().await?;
    match reply.body {
        MessageBody::Error(_) => Ok(()),
        other => Err(format!("junk line not rejected, got {}", other.type_name())),
    }
}

async fn unknown_version_rejected<D: Dialer>(dialer: &D) -> Result<(), String> {
    let mut probe = Probe::open(dialer).await?;
    let line = format!(
        r#"{{"protocol":"usp","version":"9.9.9","type":"ping","id":11,"timestamp":{}}}"#,
        now_ms()
    );
    probe.send_raw(&line).await?;
    let reply = probe.recv().await?;
    match reply.body {
        MessageBody::Error(error) if error.code == codes::UNSUPPORTED_VERSION => Ok(()),
        MessageBody::Error(error) => Err(format!("unexpected error code {:?}", error.code)),
        other => Err(format!(
            "unknown version not rejected, got {}",
            other.type_name()
        )),
    }
}

async fn version_echo<D: Dialer>(dialer: &D) -> Result<(), String> {
    let mut probe = Probe::open(dialer).await?;
    let reply = probe.request(MessageBody::Ping).await?;
    if reply.protocol != protocol::PROTOCOL {
        return Err(format!("reply protocol {:?}", reply.protocol));
    }
    if reply.version != protocol::VERSION {
        return Err(format!(
            "reply version {:?}, expected {:?}",
            reply.version,
            protocol::VERSION
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pocket_sync::server::LocalServer;

    #[tokio::test]
    async fn reference_server_passes_battery() {
        let server = LocalServer::with_auth("sesame");
        let options = ConformanceOptions {
            auth_token: Some("sesame".to_string()),
            expect_auth: true,
        };
        let report = run_battery(&server.dialer(), &options).await;
        assert!(report.compliant(), "{}", report.render());
        assert_eq!(report.cases.len(), 8);
    }

    #[tokio::test]
    async fn battery_over_tcp() {
        let server = LocalServer::new();
        let addr = server.listen("127.0.0.1:0").await.unwrap();
        let dialer = pocket_sync::transport::TcpDialer::new(&format!("tcp://{addr}")).unwrap();
        let report = run_battery(&dialer, &ConformanceOptions::default()).await;
        assert!(report.compliant(), "{}", report.render());
    }

    #[tokio::test]
    async fn auth_case_fails_against_open_server() {
        // A server that accepts any token must fail the rejection case.
        let server = LocalServer::new();
        let options = ConformanceOptions {
            auth_token: None,
            expect_auth: true,
        };
        let report = run_battery(&server.dialer(), &options).await;
        assert!(!report.compliant());
        let failed: Vec<&str> = report
            .cases
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(failed, ["invalid auth rejected"]);
    }
}
