use crate::adaptive::{AdaptiveController, AdaptiveSettings, NetworkSignals};
use crate::change::{ChangeEvent, ChangeRecord, Document, Operation, now_ms};
use crate::checkpoint::CheckpointManager;
use crate::config::SyncConfig;
use crate::conflict::{self, Resolver, Winner};
use crate::error::{Result, SyncError};
use crate::ledger::{Ledger, LedgerEntry};
use crate::observe::{Observables, SyncStats, SyncStatus};
use crate::protocol::{
    ChangeBatch, Envelope, Handshake, HandshakeAck, MessageBody, Pull, PullResponse, Push, codes,
};
use crate::retry::{self, RetryEvent, RetryMonitor};
use crate::revision::Revision;
use crate::store::{DocumentStore, PersistedState};
use crate::transport::{
    EitherTransport, PollingTransport, StreamingTransport, TcpDialer, Transport, TransportEvent,
    TransportOptions,
};
use crate::vclock::Causality;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Small window for coalescing bursts of local changes into one push batch.
const PUSH_DEBOUNCE: Duration = Duration::from_millis(20);
/// How long `stop` waits for the engine task before abandoning it.
const STOP_GRACE: Duration = Duration::from_millis(5_000);

enum Command {
    ForceSync(oneshot::Sender<Result<()>>),
    UpdateSignals(NetworkSignals),
    SetPriority(String, i32),
    Stop(oneshot::Sender<()>),
}

/// Handle to a running sync engine. Dropping it stops the engine; prefer
/// [`SyncHandle::stop`] for an orderly shutdown.
#[derive(Debug)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SyncStatus>,
    stats: watch::Receiver<SyncStats>,
    retry_events: broadcast::Sender<RetryEvent>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Runs one full push/pull cycle now and reports its outcome.
    pub async fn force_sync(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::ForceSync(tx))
            .await
            .map_err(|_| SyncError::Stopped)?;
        rx.await.map_err(|_| SyncError::Stopped)?
    }

    /// Feeds fresh network/power signals to the adaptive controller.
    pub async fn update_network(&self, signals: NetworkSignals) -> Result<()> {
        self.commands
            .send(Command::UpdateSignals(signals))
            .await
            .map_err(|_| SyncError::Stopped)
    }

    pub async fn set_priority(&self, collection: &str, priority: i32) -> Result<()> {
        self.commands
            .send(Command::SetPriority(collection.to_string(), priority))
            .await
            .map_err(|_| SyncError::Stopped)
    }

    /// Status stream with last-value replay.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    pub fn current_status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    /// Stats stream with last-value replay.
    pub fn stats(&self) -> watch::Receiver<SyncStats> {
        self.stats.clone()
    }

    pub fn current_stats(&self) -> SyncStats {
        self.stats.borrow().clone()
    }

    /// Event-wise retry/circuit event stream.
    pub fn retry_events(&self) -> broadcast::Receiver<RetryEvent> {
        self.retry_events.subscribe()
    }

    /// Stops the engine: halts the tickers, waits out any in-flight request
    /// up to a grace period, persists ledger and checkpoint, disconnects.
    pub async fn stop(self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).await.is_ok() {
            if tokio::time::timeout(STOP_GRACE, rx).await.is_err() {
                warn!("engine did not stop within grace period, aborting");
                self.task.abort();
            }
        } else {
            self.task.abort();
        }
    }
}

pub struct SyncEngine;

impl SyncEngine {
    /// Starts against `server_url` over newline-delimited JSON TCP, picking
    /// the streaming or polling transport per the configuration.
    pub async fn start_tcp<S>(config: SyncConfig, store: Arc<S>) -> Result<SyncHandle>
    where
        S: DocumentStore,
    {
        let dialer = TcpDialer::new(&config.server_url)?;
        let options = TransportOptions {
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            ..TransportOptions::default()
        };
        let transport = if config.use_streaming_transport {
            EitherTransport::Streaming(StreamingTransport::new(dialer, options))
        } else {
            EitherTransport::Polling(PollingTransport::new(dialer, options))
        };
        Self::start(config, store, transport).await
    }

    /// Validates the configuration, restores durable state from the store,
    /// connects and spawns the engine task. A transient connection failure
    /// starts the engine offline; a fatal one (bad URL, rejected auth)
    /// refuses to start.
    pub async fn start<S, T>(config: SyncConfig, store: Arc<S>, transport: T) -> Result<SyncHandle>
    where
        S: DocumentStore,
        T: Transport,
    {
        config.validate()?;

        let persisted = store.load_state(&config.node_id).await?;
        let retention_ms = config.synced_retention().as_millis() as i64;
        let (checkpoint, ledger) = match persisted {
            Some(state) => (
                CheckpointManager::new(Some(state.checkpoint)),
                Ledger::restore(retention_ms, state.ledger),
            ),
            None => (CheckpointManager::new(None), Ledger::new(retention_ms)),
        };

        let monitor = RetryMonitor::new(config.retry_policy());
        let retry_events = monitor.event_sender();
        let observables = Observables::new(retry_events.clone());
        let status = observables.watch_status();
        let stats = observables.watch_stats();

        // Subscribe before spawning so no change between start and the run
        // loop is lost.
        let change_rx = store.subscribe_changes();
        let transport = Arc::new(transport);
        let transport_rx = transport.events();

        let resolver = Resolver::new(config.conflict_strategy.clone());
        let adaptive = AdaptiveController::new(config.adaptive_bounds());

        let mut task = EngineTask {
            config,
            store,
            transport,
            ledger,
            checkpoint,
            resolver,
            monitor,
            adaptive,
            observables,
            session: None,
            fatal: false,
            push_due: None,
        };

        match task.establish().await {
            Ok(()) => {
                task.observables.set_status(SyncStatus::Idle);
                info!(node = %task.config.node_id, "sync engine connected");
            }
            Err(e) if e.is_fatal() => {
                let _ = task.transport.disconnect().await;
                return Err(e);
            }
            Err(e) => {
                warn!("starting offline: {e}");
                task.observables.set_status(SyncStatus::Offline);
            }
        }

        let (commands_tx, commands_rx) = mpsc::channel(32);
        let task = tokio::spawn(task.run(commands_rx, change_rx, transport_rx));

        Ok(SyncHandle {
            commands: commands_tx,
            status,
            stats,
            retry_events,
            task,
        })
    }
}

struct EngineTask<S, T> {
    config: SyncConfig,
    store: Arc<S>,
    transport: Arc<T>,
    ledger: Ledger,
    checkpoint: CheckpointManager,
    resolver: Resolver,
    monitor: RetryMonitor,
    adaptive: AdaptiveController,
    observables: Observables,
    session: Option<HandshakeAck>,
    /// Set on fatal errors; the engine refuses further cycles until restart.
    fatal: bool,
    /// Deadline of the debounced push triggered by local changes.
    push_due: Option<Instant>,
}

impl<S, T> EngineTask<S, T>
where
    S: DocumentStore,
    T: Transport,
{
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut change_rx: broadcast::Receiver<ChangeEvent>,
        mut transport_rx: broadcast::Receiver<TransportEvent>,
    ) {
        let mut pull_period = self.pull_period();
        let mut pull_tick = Self::make_interval(pull_period);
        let mut maintenance_tick = tokio::time::interval(Duration::from_millis(
            self.config.network_check_interval_ms.max(100),
        ));
        maintenance_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let push_due = self.push_due;
            tokio::select! {
                biased;

                event = change_rx.recv() => match event {
                    Ok(event) => self.on_local_change(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("dropped {n} change events; forcing a full cycle");
                        let _ = self.sync_cycle(true, true).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("store change stream closed");
                        self.fatal = true;
                        self.observables.set_status(SyncStatus::Error);
                    }
                },

                event = transport_rx.recv() => match event {
                    Ok(event) => self.on_transport_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("dropped {n} transport events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },

                command = commands.recv() => match command {
                    Some(Command::ForceSync(reply)) => {
                        let result = self.sync_cycle(true, true).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::UpdateSignals(signals)) => {
                        self.adaptive.update_signals(signals);
                    }
                    Some(Command::SetPriority(collection, priority)) => {
                        self.adaptive.set_priority(&collection, priority);
                    }
                    Some(Command::Stop(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },

                () = async move {
                    match push_due {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.push_due = None;
                    let _ = self.sync_cycle(true, false).await;
                },

                _ = pull_tick.tick(), if pull_period.is_some() => {
                    let _ = self.sync_cycle(true, true).await;
                },

                _ = maintenance_tick.tick() => {
                    self.ledger.purge();
                },
            }

            let desired = self.pull_period();
            if desired != pull_period {
                pull_period = desired;
                pull_tick = Self::make_interval(pull_period);
            }
        }
    }

    fn make_interval(period: Option<Duration>) -> tokio::time::Interval {
        let period = period.unwrap_or(Duration::from_secs(86_400));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    /// Live pull period: the configured interval stretched by the adaptive
    /// profile, `None` when periodic pulls are disabled.
    fn pull_period(&self) -> Option<Duration> {
        if self.config.pull_interval_ms == 0 {
            return None;
        }
        let collections = self.sync_collections();
        let settings = self.adaptive.settings(&collections);
        Some(
            settings
                .sync_interval
                .max(Duration::from_millis(self.config.pull_interval_ms)),
        )
    }

    async fn establish(&mut self) -> Result<()> {
        self.transport.connect().await?;
        self.handshake().await
    }

    async fn handshake(&mut self) -> Result<()> {
        let body = MessageBody::Handshake(Handshake {
            node_id: self.config.node_id.clone(),
            collections: self.sync_collections(),
            capabilities: vec!["columnar".to_string()],
            auth: self.config.auth_token.clone(),
        });
        match self.transport.send(body).await {
            Ok(reply) => match reply.body {
                MessageBody::HandshakeAck(ack) => {
                    debug!(session = %ack.session_id, "handshake complete");
                    self.session = Some(ack);
                    Ok(())
                }
                other => Err(SyncError::Protocol(format!(
                    "expected handshake-ack, got {}",
                    other.type_name()
                ))),
            },
            Err(SyncError::Server { code, message, .. }) if code == codes::AUTH_REJECTED => {
                Err(SyncError::TransportFatal(format!(
                    "handshake rejected: {message}"
                )))
            }
            Err(e) => Err(e),
        }
    }

    fn session_id(&self) -> Result<String> {
        self.session
            .as_ref()
            .map(|s| s.session_id.clone())
            .ok_or_else(|| SyncError::Transport("no active session".into()))
    }

    /// The configured collection set, or everything the store and the ledger
    /// know about.
    fn sync_collections(&self) -> Vec<String> {
        if let Some(collections) = &self.config.collections {
            return collections.clone();
        }
        let mut out = self.store.list_collections();
        for collection in self.ledger.pending_collections() {
            if !out.contains(&collection) {
                out.push(collection);
            }
        }
        out
    }

    async fn on_local_change(&mut self, event: ChangeEvent) {
        // Remote-originated writes come back through the store's change
        // stream flagged from_sync; re-recording them would echo forever.
        if event.from_sync {
            return;
        }
        if !self.config.direction.allows_push() {
            return;
        }
        let collection = event.collection.clone();
        let previous = event.previous_document.clone();
        let record = event.into_record(&self.config.node_id);
        self.ledger.add(&collection, record, previous);

        let pending = self.ledger.pending_sync(&collection, usize::MAX).len();
        self.adaptive.observe_pending(&collection, pending);

        if let Err(e) = self.persist_state().await {
            warn!("could not persist ledger: {e}");
        }
        if self.push_due.is_none() {
            self.push_due = Some(Instant::now() + PUSH_DEBOUNCE);
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {}
            TransportEvent::Disconnected => {
                debug!("transport disconnected");
                self.session = None;
                self.observables.set_status(SyncStatus::Offline);
            }
            TransportEvent::Reconnected => {
                info!("transport reconnected, resyncing");
                self.session = None;
                let _ = self.sync_cycle(true, true).await;
            }
            TransportEvent::ServerPush(envelope) => match envelope.body {
                MessageBody::PullResponse(response) => {
                    match self.apply_pull_response(response).await {
                        Ok(applied) => {
                            self.observables
                                .update_stats(|s| s.pull_count += applied as u64);
                        }
                        Err(e) => warn!("server push failed to apply: {e}"),
                    }
                }
                other => {
                    warn!("unexpected server push {}", other.type_name());
                    let _ = self.monitor.event_sender().send(RetryEvent::ProtocolViolation {
                        detail: format!("unexpected server push {}", other.type_name()),
                    });
                }
            },
            TransportEvent::Error(detail) => {
                debug!("transport error event: {detail}");
                let _ = self
                    .monitor
                    .event_sender()
                    .send(RetryEvent::ProtocolViolation { detail });
            }
        }
    }

    /// One sync cycle. Direction gates apply on top of the `push`/`pull`
    /// arguments, which distinguish a debounced push from a full cycle.
    async fn sync_cycle(&mut self, push: bool, pull: bool) -> Result<()> {
        if self.fatal {
            return Err(SyncError::Stopped);
        }
        let started = std::time::Instant::now();
        let result = self.sync_cycle_inner(push, pull).await;
        self.adaptive.record_sync(started.elapsed(), result.is_ok());

        match &result {
            Ok(()) => {
                self.observables.update_stats(|s| {
                    s.last_sync_at = Some(now_ms());
                    s.last_error = None;
                });
                self.observables.set_status(SyncStatus::Idle);
            }
            Err(e) => {
                self.observables
                    .update_stats(|s| s.last_error = Some(e.to_string()));
                if e.is_fatal() {
                    error!("fatal sync error, stopping cycles: {e}");
                    self.fatal = true;
                    self.observables.set_status(SyncStatus::Error);
                } else if !self.transport.is_connected() {
                    self.observables.set_status(SyncStatus::Offline);
                } else {
                    self.observables.set_status(SyncStatus::Error);
                }
            }
        }
        result
    }

    async fn sync_cycle_inner(&mut self, push: bool, pull: bool) -> Result<()> {
        if !self.monitor.can_attempt() {
            return Err(SyncError::CircuitOpen);
        }
        if let Err(e) = self.ensure_session().await {
            if e.is_retriable() {
                self.monitor.record_failure();
            }
            return Err(e);
        }
        self.observables.set_status(SyncStatus::Syncing);

        let collections = self.sync_collections();
        for collection in &collections {
            let pending = self.ledger.pending_sync(collection, usize::MAX).len();
            self.adaptive.observe_pending(collection, pending);
        }
        let settings = self.adaptive.settings(&collections);

        if push && self.config.direction.allows_push() {
            self.push_phase(&settings).await?;
        }
        if pull && self.config.direction.allows_pull() {
            self.pull_phase(&settings).await?;
        }
        Ok(())
    }

    async fn ensure_session(&mut self) -> Result<()> {
        if !self.transport.is_connected() {
            self.transport.connect().await?;
        }
        if self.session.is_none() {
            self.handshake().await?;
        }
        Ok(())
    }

    async fn push_phase(&mut self, settings: &AdaptiveSettings) -> Result<()> {
        for collection in settings.priorities.clone() {
            loop {
                let batch = self.ledger.pending_sync(&collection, settings.batch_size);
                if batch.is_empty() {
                    break;
                }
                self.push_batch(&collection, batch, settings).await?;
            }
        }
        Ok(())
    }

    async fn push_batch(
        &mut self,
        collection: &str,
        batch: Vec<LedgerEntry>,
        settings: &AdaptiveSettings,
    ) -> Result<()> {
        // An open circuit rejects the push without touching the ledger.
        if !self.monitor.can_attempt() {
            return Err(SyncError::CircuitOpen);
        }
        let session_id = self.session_id()?;
        for entry in &batch {
            self.ledger.mark_in_flight(entry.id);
        }

        let records: Vec<ChangeRecord> = batch.iter().map(|e| e.change.clone()).collect();
        let body = MessageBody::Push(Push {
            session_id,
            collection: collection.to_string(),
            changes: ChangeBatch::encode(records, settings.compression)?,
            checkpoint: self.checkpoint.snapshot(),
        });

        let reply = match self.send_with_retry(body, settings).await {
            Ok(reply) => reply,
            Err(e) => {
                match &e {
                    // The server forgot us (restart, expiry): re-handshake
                    // next cycle, the entries stay pending.
                    SyncError::Server { code, .. } if code == codes::UNKNOWN_SESSION => {
                        self.session = None;
                        self.ledger.requeue_in_flight();
                    }
                    // A definitive rejection would loop forever as pending;
                    // park the entries for external handling.
                    SyncError::Server {
                        retriable: false, ..
                    } => {
                        let reason = e.to_string();
                        for entry in &batch {
                            self.ledger.reject(entry.id, &reason);
                        }
                    }
                    _ => {
                        self.ledger.requeue_in_flight();
                    }
                }
                return Err(e);
            }
        };
        let ack = match reply.body {
            MessageBody::PushAck(ack) => ack,
            other => {
                self.ledger.requeue_in_flight();
                return Err(SyncError::Protocol(format!(
                    "expected push-ack, got {}",
                    other.type_name()
                )));
            }
        };

        let mut accepted = 0u64;
        for document_id in &ack.accepted {
            if let Some(entry) = batch.iter().find(|e| &e.change.document_id == document_id) {
                self.ledger.mark_synced(entry.id);
                accepted += 1;
            }
        }
        self.observables.update_stats(|s| s.push_count += accepted);

        for conflict in ack.conflicts {
            debug!(document = %conflict.document_id, "push conflict");
            let local = self.store.get(collection, &conflict.document_id).await?;
            match local {
                Some(local) => {
                    self.resolve_and_apply(collection, &local, conflict.server_document)
                        .await?;
                }
                None => {
                    // Nothing local anymore: adopt the server copy.
                    let record = self.record_for(
                        collection,
                        &conflict.server_document,
                        None,
                        true,
                    );
                    self.store.apply_remote_change(&record).await?;
                    self.ledger
                        .remove_for_document(collection, &conflict.document_id);
                }
            }
        }

        // Entries the ack never mentioned go back to pending.
        self.ledger.requeue_in_flight();
        self.checkpoint
            .update_from_server(ack.checkpoint.server_cursor.as_deref());
        self.persist_state().await?;
        Ok(())
    }

    async fn pull_phase(&mut self, settings: &AdaptiveSettings) -> Result<()> {
        loop {
            let collections = self.sync_collections();
            if collections.is_empty() {
                return Ok(());
            }
            let body = MessageBody::Pull(Pull {
                session_id: self.session_id()?,
                collections,
                checkpoint: self.checkpoint.snapshot(),
                limit: settings.batch_size,
            });
            let reply = self.send_with_retry(body, settings).await?;
            let response = match reply.body {
                MessageBody::PullResponse(response) => response,
                other => {
                    return Err(SyncError::Protocol(format!(
                        "expected pull-response, got {}",
                        other.type_name()
                    )));
                }
            };
            let has_more = response.has_more;
            let applied = self.apply_pull_response(response).await?;
            self.observables
                .update_stats(|s| s.pull_count += applied as u64);
            if !has_more {
                return Ok(());
            }
        }
    }

    /// Applies a pull response in server-sequence order. A per-document
    /// failure does not abort the batch; it only stops the checkpoint from
    /// advancing past the failed change, so the next pull retries it.
    async fn apply_pull_response(&mut self, response: PullResponse) -> Result<usize> {
        let mut applied_total = 0;
        for (collection, batch) in response.changes {
            let records = batch.into_records()?;
            let mut blocked = false;
            for record in records {
                let sequence = record.sequence;
                match self.apply_remote_record(&collection, record).await {
                    Ok(applied) => {
                        if applied {
                            applied_total += 1;
                        }
                        if !blocked {
                            if let Some(seq) = sequence {
                                self.checkpoint.advance_sequence(&collection, seq);
                            }
                        }
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(
                            collection = %collection,
                            "skipping document in pulled batch: {e}"
                        );
                        blocked = true;
                    }
                }
            }
        }
        self.checkpoint
            .update_from_server(response.checkpoint.server_cursor.as_deref());
        self.persist_state().await?;
        Ok(applied_total)
    }

    /// Returns whether the record mutated anything; self-echoes do not.
    async fn apply_remote_record(&mut self, collection: &str, record: ChangeRecord) -> Result<bool> {
        if record.node_id == self.config.node_id
            && self
                .ledger
                .is_self_echo(collection, &record.document_id, record.rev())
        {
            debug!(document = %record.document_id, "suppressed self-echo");
            return Ok(false);
        }

        let remote = match (&record.operation, &record.document) {
            (Operation::Delete, None) => {
                Document::tombstone(&record.document_id, None, record.vclock.clone())
            }
            (_, Some(document)) => document.clone(),
            (operation, None) => {
                return Err(SyncError::Protocol(format!(
                    "pulled {operation:?} for {}/{} carries no document",
                    collection, record.document_id
                )));
            }
        };

        if let Some(local) = self.store.get(collection, &record.document_id).await? {
            // Already at this revision (a streamed push may race a pull).
            if local.rev.is_some() && local.rev == remote.rev {
                return Ok(false);
            }
            // A change the local state already causally supersedes (for
            // example the loser of a conflict this replica just resolved)
            // must not regress the document.
            if !local.vclock.is_empty()
                && !remote.vclock.is_empty()
                && local.vclock.compare(&remote.vclock) == Causality::After
            {
                debug!(document = %record.document_id, "skipping stale remote change");
                return Ok(false);
            }
            if self.ledger.has_unacked(collection, &record.document_id)
                && local.rev != remote.rev
                && conflict::in_conflict(&local, &remote)
            {
                self.resolve_and_apply(collection, &local, remote).await?;
                return Ok(true);
            }
        }

        let mut applied = record;
        applied.from_sync = true;
        self.store.apply_remote_change(&applied).await?;
        Ok(true)
    }

    /// Routes a detected conflict through the resolver, applies the outcome
    /// locally and re-pushes it when the local side (or a merge) won.
    async fn resolve_and_apply(
        &mut self,
        collection: &str,
        local: &Document,
        remote: Document,
    ) -> Result<()> {
        let base = self
            .ledger
            .entries_for(collection, &local.id)
            .first()
            .and_then(|entry| entry.previous_document.clone());
        let resolution = self.resolver.resolve(local, &remote, base.as_ref());
        self.observables.update_stats(|s| s.conflict_count += 1);

        let mut resolved = resolution.document;
        let repush = resolution.winner != Winner::Remote;
        if repush {
            // The resolved document must causally supersede the server copy,
            // or the server keeps reporting the same conflict.
            resolved.vclock.merge(&remote.vclock);
            resolved.vclock.increment(&self.config.node_id);
            let seq = resolved
                .rev
                .as_deref()
                .map(Revision::seq_of)
                .unwrap_or(0)
                .max(remote.rev.as_deref().map(Revision::seq_of).unwrap_or(0));
            resolved.rev = Some(Revision::mint(seq + 1, &resolved.content()));
        }

        let applied = self.record_for(collection, &resolved, Some(remote.clone()), true);
        self.store.apply_remote_change(&applied).await?;
        self.ledger.remove_for_document(collection, &resolved.id);

        if repush {
            let change = self.record_for(collection, &resolved, Some(remote), false);
            self.ledger.add(collection, change, Some(local.clone()));
        }
        Ok(())
    }

    fn record_for(
        &self,
        collection: &str,
        document: &Document,
        previous: Option<Document>,
        from_sync: bool,
    ) -> ChangeRecord {
        ChangeRecord {
            collection: collection.to_string(),
            document_id: document.id.clone(),
            operation: if document.deleted {
                Operation::Delete
            } else {
                Operation::Update
            },
            document: Some(document.clone()),
            previous_document: previous,
            sequence: None,
            timestamp: now_ms(),
            node_id: self.config.node_id.clone(),
            vclock: document.vclock.clone(),
            from_sync,
        }
    }

    async fn send_with_retry(
        &mut self,
        body: MessageBody,
        settings: &AdaptiveSettings,
    ) -> Result<Envelope> {
        let max_attempts = self.monitor.max_attempts();
        let mut attempt = 0;
        loop {
            if !self.monitor.can_attempt() {
                return Err(SyncError::CircuitOpen);
            }
            self.monitor.note_attempt(attempt);
            match self.transport.send(body.clone()).await {
                Ok(reply) => {
                    self.monitor.record_success(attempt);
                    return Ok(reply);
                }
                Err(e) => {
                    self.monitor.record_failure();
                    if !e.is_retriable() || attempt + 1 >= max_attempts {
                        self.monitor.record_exhausted(attempt + 1, &e.to_string());
                        return Err(e);
                    }
                    let delay = retry::backoff_delay(
                        settings.retry_base_delay,
                        attempt,
                        self.config.synced_retention(),
                    );
                    debug!("retrying in {delay:?} after: {e}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn persist_state(&mut self) -> Result<()> {
        let state = PersistedState {
            checkpoint: self.checkpoint.snapshot(),
            ledger: self.ledger.persistable(),
        };
        match self.store.save_state(&self.config.node_id, &state).await {
            Ok(()) => {
                self.checkpoint.mark_durable();
                Ok(())
            }
            Err(e) => {
                self.checkpoint.rollback();
                Err(e)
            }
        }
    }

    async fn shutdown(&mut self) {
        info!(node = %self.config.node_id, "sync engine stopping");
        // Forced disconnect preserves the ledger: in-flight entries go back
        // to pending and are persisted for the next run.
        self.ledger.requeue_in_flight();
        if let Err(e) = self.persist_state().await {
            warn!("could not persist state on shutdown: {e}");
        }
        let _ = self.transport.disconnect().await;
    }
}
