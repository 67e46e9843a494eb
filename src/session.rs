use crate::classifier::ChangeClassifier;
use crate::log::TransactionLog;
use crate::mapping::Mapping;
use crate::ops::LocalChange;
use crate::protocol::{FetchReply, Frame, RequestId, SyncRequest, SyncResponse};
use crate::transport::{Connection, FrameSender, MAX_PAYLOAD_LEN};
use crate::types::{format_len, ContentHash, LogDocument, TxKind};
use anyhow::{anyhow, bail, Context, Result};
use futures::stream::{self, StreamExt};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{spawn_blocking, JoinSet};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Fetches kept in flight at once during a round.
const MAX_IN_FLIGHT_FETCHES: usize = 16;

/// How a session reaches the remote peer's [`SyncService`].
pub trait PeerChannel: Send + Sync + 'static {
    fn call(&self, request: SyncRequest) -> impl Future<Output = Result<SyncResponse>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    /// Pause after connecting, before the first round.
    pub warmup: Duration,
    /// Pause between two rounds.
    pub round_interval: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(5),
            round_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundReport {
    pub remote_keys: usize,
    pub requested: usize,
    pub applied: usize,
    pub missing: usize,
    pub failed: usize,
}

enum FetchOutcome {
    Applied,
    Unchanged,
    Missing,
    Failed,
}

/// Keys to fetch from a remote log: those in a locally configured namespace
/// that are unknown here or strictly newer remotely. Ties keep the local
/// entry.
pub fn plan_fetches(local: &LogDocument, remote: &LogDocument, mapping: &Mapping) -> Vec<String> {
    remote
        .iter()
        .filter(|(key, _)| mapping.is_local_key(key))
        .filter(|(key, remote_tx)| match local.get(*key) {
            None => true,
            Some(local_tx) => remote_tx.supersedes(local_tx),
        })
        .map(|(key, _)| key.clone())
        .collect()
}

/// Answers a peer's requests and applies what this side fetched.
#[derive(Clone)]
pub struct SyncService {
    classifier: ChangeClassifier,
}

impl SyncService {
    pub fn new(classifier: ChangeClassifier) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &ChangeClassifier {
        &self.classifier
    }

    pub fn log(&self) -> &TransactionLog {
        self.classifier.log()
    }

    pub fn mapping(&self) -> &Mapping {
        self.classifier.mapping()
    }

    /// Serve one request. Blocking: reads files from disk.
    pub fn handle(&self, request: SyncRequest) -> SyncResponse {
        match request {
            SyncRequest::GetLog => SyncResponse::Log {
                entries: self.log().snapshot(),
            },
            SyncRequest::Fetch { key } => match self.fetch(&key) {
                Ok(response) => response,
                Err(e) => {
                    warn!(key, "Failed to serve fetch: {e:#}");
                    SyncResponse::Error {
                        message: format!("{e:#}"),
                    }
                }
            },
        }
    }

    fn fetch(&self, key: &str) -> Result<SyncResponse> {
        let not_found = || SyncResponse::NotFound {
            key: key.to_string(),
        };
        let Some(tx) = self.log().get(key) else {
            return Ok(not_found());
        };
        if tx.is_deleted() {
            return Ok(SyncResponse::File(FetchReply {
                key: key.to_string(),
                transaction: tx,
                payload: None,
            }));
        }
        let Some(path) = self.mapping().resolve(key) else {
            return Ok(not_found());
        };

        // What is on disk now wins over the log: a vanished file is answered
        // as a deletion, changed content as a modification. Read under the
        // write lock so an apply in progress is never served half-written.
        let mut log = self.log().write();
        let (change, payload) = match read_payload(&path) {
            Ok(data) => {
                let hash = ContentHash::of_bytes(&data);
                let change = LocalChange::Written {
                    kind: TxKind::Modified,
                    hash,
                };
                (change, Some(data))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => (LocalChange::Removed, None),
            Err(err) => return Err(err.into()),
        };

        if let Some(updated) = log.record_local(key, change)? {
            info!(key, "Disk drifted from log while serving fetch: {:?}", updated.kind);
        }
        let transaction = log.get(key).ok_or_else(|| anyhow!("{key} vanished from log"))?;
        drop(log);

        Ok(SyncResponse::File(FetchReply {
            key: key.to_string(),
            transaction,
            payload,
        }))
    }

    /// Apply a fetched transaction: update disk first, then the log, both
    /// under the log's write lock so the watcher never observes the new file
    /// before the log does. Returns `false` if nothing changed.
    pub fn apply(&self, reply: FetchReply) -> Result<bool> {
        let FetchReply {
            key,
            transaction,
            payload,
        } = reply;
        let Some(path) = self.mapping().resolve(&key) else {
            bail!("Refusing to apply unresolvable key {key}");
        };

        let payload = match (&transaction.content_hash, payload) {
            (None, _) => None,
            (Some(_), None) => bail!("{key}: transaction without payload"),
            (Some(expected), Some(data)) => {
                let actual = ContentHash::of_bytes(&data);
                if &actual != expected {
                    bail!("{key}: payload hash {actual} does not match {expected}");
                }
                Some(data)
            }
        };

        let mut log = self.log().write();
        match payload {
            Some(data) => {
                info!("Writing: {} ({})", path.display(), format_len(data.len() as u64));
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, &data)?;
            }
            None => {
                info!("Deleting: {}", path.display());
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        log.apply_remote(&key, transaction)
    }
}

/// Read a file to serve it, refusing anything that would not fit in one
/// frame once encoded.
fn read_payload(path: &Path) -> std::io::Result<Vec<u8>> {
    let len = fs::metadata(path)?.len();
    if len > MAX_PAYLOAD_LEN {
        return Err(std::io::Error::new(
            ErrorKind::Unsupported,
            format!("{} is {}, over the transfer limit", path.display(), format_len(len)),
        ));
    }
    fs::read(path)
}

type PendingCalls = Arc<Mutex<HashMap<RequestId, oneshot::Sender<SyncResponse>>>>;

/// [`PeerChannel`] over a [`Connection`]: tags every request with an id and
/// waits for the response the dispatcher routes back.
pub struct RpcClient {
    sender: FrameSender,
    pending: PendingCalls,
    next_id: AtomicU64,
}

impl RpcClient {
    fn new(sender: FrameSender, pending: PendingCalls) -> Self {
        Self {
            sender,
            pending,
            next_id: AtomicU64::new(1),
        }
    }
}

impl PeerChannel for RpcClient {
    async fn call(&self, request: SyncRequest) -> Result<SyncResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("Failed to lock pending calls")
            .insert(id, tx);

        if let Err(e) = self
            .sender
            .send(Frame::Request { id, body: request })
            .await
        {
            self.pending
                .lock()
                .expect("Failed to lock pending calls")
                .remove(&id);
            return Err(e);
        }

        rx.await
            .map_err(|_| anyhow!("Connection to {} closed", self.sender.peer()))
    }
}

/// Route incoming frames until the connection closes: requests go to the
/// service, responses to whoever is waiting on their id.
async fn dispatch(
    mut incoming: mpsc::Receiver<Frame>,
    sender: FrameSender,
    service: SyncService,
    pending: PendingCalls,
) {
    while let Some(frame) = incoming.recv().await {
        match frame {
            Frame::Request { id, body } => {
                let service = service.clone();
                let sender = sender.clone();
                tokio::spawn(async move {
                    let body = spawn_blocking(move || service.handle(body))
                        .await
                        .unwrap_or_else(|e| SyncResponse::Error {
                            message: format!("Request handler panicked: {e}"),
                        });
                    if let Err(e) = sender.send(Frame::Response { id, body }).await {
                        debug!("Dropping response {id}: {e}");
                    }
                });
            }
            Frame::Response { id, body } => {
                let waiter = pending
                    .lock()
                    .expect("Failed to lock pending calls")
                    .remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(body);
                    }
                    None => warn!("Response {id} from {} matches no request", sender.peer()),
                }
            }
            other => warn!("Ignoring unexpected frame from {}: {other:?}", sender.peer()),
        }
    }
    pending.lock().expect("Failed to lock pending calls").clear();
}

/// One peer's reconciliation loop.
pub struct SyncSession<C: PeerChannel> {
    peer: String,
    service: SyncService,
    channel: Arc<C>,
    timing: SessionTiming,
}

impl<C: PeerChannel> SyncSession<C> {
    pub fn new(
        peer: impl Into<String>,
        service: SyncService,
        channel: Arc<C>,
        timing: SessionTiming,
    ) -> Self {
        Self {
            peer: peer.into(),
            service,
            channel,
            timing,
        }
    }

    /// Warm up, then run rounds until the channel fails.
    pub async fn run(&self) -> Result<()> {
        info!("Waiting {:?} for {} to get ready", self.timing.warmup, self.peer);
        sleep(self.timing.warmup).await;
        info!("Connected to {}. Syncing...", self.peer);
        loop {
            self.round().await?;
            sleep(self.timing.round_interval).await;
        }
    }

    /// One reconciliation round: pull the remote log, fetch every key it
    /// wins, apply the replies, and return once all fetches have finished.
    #[tracing::instrument(skip(self), fields(peer = %self.peer))]
    pub async fn round(&self) -> Result<RoundReport> {
        let remote = match self.channel.call(SyncRequest::GetLog).await? {
            SyncResponse::Log { entries } => entries,
            SyncResponse::Error { message } => bail!("Peer failed to send its log: {message}"),
            other => bail!("Unexpected reply to log request: {other:?}"),
        };
        let local = self.service.log().snapshot();
        let keys = plan_fetches(&local, &remote, self.service.mapping());

        let mut report = RoundReport {
            remote_keys: remote.len(),
            requested: keys.len(),
            ..Default::default()
        };

        let outcomes: Vec<Result<FetchOutcome>> = stream::iter(keys)
            .map(|key| self.fetch_and_apply(key))
            .buffer_unordered(MAX_IN_FLIGHT_FETCHES)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome? {
                FetchOutcome::Applied => report.applied += 1,
                FetchOutcome::Unchanged => {}
                FetchOutcome::Missing => report.missing += 1,
                FetchOutcome::Failed => report.failed += 1,
            }
        }

        if report.requested > 0 {
            info!(
                "Round finished: {} requested, {} applied, {} missing, {} failed",
                report.requested, report.applied, report.missing, report.failed
            );
        } else {
            debug!("Round finished: in sync ({} remote keys)", report.remote_keys);
        }
        Ok(report)
    }

    /// Only channel errors are returned as `Err`; per-key problems become
    /// [`FetchOutcome::Missing`] or [`FetchOutcome::Failed`].
    async fn fetch_and_apply(&self, key: String) -> Result<FetchOutcome> {
        let response = self
            .channel
            .call(SyncRequest::Fetch { key: key.clone() })
            .await?;

        let reply = match response {
            SyncResponse::File(reply) if reply.key == key => reply,
            SyncResponse::File(reply) => {
                warn!(key, "Peer answered with a different key: {}", reply.key);
                return Ok(FetchOutcome::Failed);
            }
            SyncResponse::NotFound { .. } => {
                warn!(key, "Peer no longer has this key");
                return Ok(FetchOutcome::Missing);
            }
            SyncResponse::Error { message } => {
                warn!(key, "Peer failed to serve fetch: {message}");
                return Ok(FetchOutcome::Failed);
            }
            SyncResponse::Log { .. } => {
                warn!(key, "Unexpected log reply to fetch");
                return Ok(FetchOutcome::Failed);
            }
        };

        let service = self.service.clone();
        let applied = spawn_blocking(move || service.apply(reply))
            .await
            .context("Apply task panicked")?;
        match applied {
            Ok(true) => Ok(FetchOutcome::Applied),
            Ok(false) => Ok(FetchOutcome::Unchanged),
            Err(e) => {
                warn!(key, "Failed to apply fetched file: {e:#}");
                Ok(FetchOutcome::Failed)
            }
        }
    }
}

/// Drive one connection: answer the peer's requests and run our own rounds
/// against it. Returns when either side of the connection ends.
pub async fn run_connection(
    conn: Connection,
    service: SyncService,
    timing: SessionTiming,
) -> Result<()> {
    let peer = conn.peer().to_string();
    let (sender, incoming) = conn.split();
    let pending = PendingCalls::default();

    // Dropping the set aborts the dispatcher, even when this future is
    // cancelled.
    let mut dispatcher = JoinSet::new();
    dispatcher.spawn(dispatch(
        incoming,
        sender.clone(),
        service.clone(),
        pending.clone(),
    ));
    let client = Arc::new(RpcClient::new(sender, pending));
    let session = SyncSession::new(peer.clone(), service, client, timing);

    tokio::select! {
        result = session.run() => result,
        _ = dispatcher.join_next() => Err(anyhow!("Connection to {peer} closed")),
    }
}
