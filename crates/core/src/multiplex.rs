//! Multiplexer / broadcaster (spec §4.12, C12). The hardest component:
//! one upstream HTTP fetch per content key, fanned out to N clients via a
//! ring buffer for late joiners and first-chunk synchronization.
//!
//! Cyclic-ownership note (spec §9): the multiplexer depends on `state`
//! directly (to emit `stream_started` when it creates a session) but
//! never on `events::EventHandlers` — that dependency runs the other way
//! (`EventHandlers::stream_ended` calls `stop_by_content_key`). Keeping it
//! one-directional is what makes the cycle resolvable.
//!
//! Open question resolved (§9): the playback URL is obtained out-of-band
//! via an engine call invoked by the proxy layer or the external client,
//! left undetailed at the component-boundary level. Since
//! `get_or_create_session` already has to pick an engine, it also owns the
//! out-of-band `ace/getstream` call — routing it through a separate
//! collaborator would just relocate the same HTTP request with no change
//! in behavior.

use crate::config::MultiplexerConfig;
use crate::error::{OrchestratorError, Result};
use crate::selector::EngineSelector;
use crate::state::{engine::now_ms, StateStore, StreamStartedEvent};
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{info, warn};

/// A single-fire event that never loses a waiter to the classic
/// check-then-wait race: callers re-check the flag after obtaining the
/// `Notified` future, before awaiting it.
struct OnceEvent {
    fired: AtomicBool,
    notify: Notify,
}

impl OnceEvent {
    fn new() -> Self {
        Self { fired: AtomicBool::new(false), notify: Notify::new() }
    }

    fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_set(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        if self.is_set() {
            return;
        }
        let notified = self.notify.notified();
        tokio::pin!(notified);
        if self.is_set() {
            return;
        }
        notified.await;
    }

    async fn wait_timeout(&self, dur: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        tokio::time::timeout(dur, self.wait()).await.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcasterState {
    Created,
    Connecting,
    Streaming,
    Failed,
    Stopped,
}

#[derive(Debug, Clone)]
enum ChunkMsg {
    Data(Bytes),
    End,
}

struct PlaybackInfo {
    playback_url: String,
    stat_url: String,
    command_url: String,
    is_live: bool,
}

/// The per-content-key singleton (spec §4.12). Owns the single upstream
/// fetch and every client queue subscribed to it.
pub struct Broadcaster {
    content_key: String,
    playback_url: String,
    http: reqwest::Client,
    config: MultiplexerConfig,
    state: SyncMutex<BroadcasterState>,
    clients: SyncMutex<HashMap<u64, mpsc::Sender<ChunkMsg>>>,
    next_client_id: AtomicU64,
    ring: SyncMutex<VecDeque<Bytes>>,
    connection_event: OnceEvent,
    first_chunk_event: OnceEvent,
    error: SyncMutex<Option<String>>,
    created_at_ms: i64,
    last_active_ms: AtomicI64,
    fetch_task: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Broadcaster {
    fn new(content_key: String, playback_url: String, http: reqwest::Client, config: MultiplexerConfig) -> Arc<Self> {
        let now = now_ms();
        Arc::new(Self {
            content_key,
            playback_url,
            http,
            config,
            state: SyncMutex::new(BroadcasterState::Created),
            clients: SyncMutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(0),
            ring: SyncMutex::new(VecDeque::new()),
            connection_event: OnceEvent::new(),
            first_chunk_event: OnceEvent::new(),
            error: SyncMutex::new(None),
            created_at_ms: now,
            last_active_ms: AtomicI64::new(now),
            fetch_task: SyncMutex::new(None),
        })
    }

    pub fn content_key(&self) -> &str {
        &self.content_key
    }

    pub fn state(&self) -> BroadcasterState {
        *self.state.lock()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn last_active_ms(&self) -> i64 {
        self.last_active_ms.load(Ordering::SeqCst)
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    /// `created → connecting`: spawns the upstream fetch task.
    fn start(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run_fetch().await;
        });
        *self.fetch_task.lock() = Some(handle);
    }

    async fn run_fetch(self: Arc<Self>) {
        *self.state.lock() = BroadcasterState::Connecting;

        // AceStream middleware malfunctions under content-encoding (spec §4.12).
        let resp = self
            .http
            .get(&self.playback_url)
            .header("Accept-Encoding", "identity")
            .send()
            .await;

        let resp = match resp {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                self.fail(format!("upstream returned status {}", r.status()));
                return;
            }
            Err(err) => {
                self.fail(format!("upstream connect failed: {err}"));
                return;
            }
        };

        self.connection_event.fire();
        *self.state.lock() = BroadcasterState::Streaming;

        let mut body = resp.bytes_stream();
        let mut saw_first_chunk = false;

        loop {
            match body.next().await {
                Some(Ok(chunk)) => {
                    self.last_active_ms.store(now_ms(), Ordering::SeqCst);
                    {
                        let mut ring = self.ring.lock();
                        ring.push_back(chunk.clone());
                        while ring.len() > self.config.recent_chunks_capacity {
                            ring.pop_front();
                        }
                    }
                    if !saw_first_chunk {
                        saw_first_chunk = true;
                        self.first_chunk_event.fire();
                    }
                    self.broadcast(chunk);
                }
                Some(Err(err)) => {
                    self.fail(format!("upstream read error: {err}"));
                    return;
                }
                None => break,
            }
        }

        // Upstream ended cleanly. A client that joined but never saw a
        // single chunk must still be unblocked rather than hang forever.
        if !saw_first_chunk {
            self.first_chunk_event.fire();
        }
        info!(content_key = %self.content_key, "upstream fetch ended");
    }

    fn fail(&self, message: String) {
        warn!(content_key = %self.content_key, error = %message, "broadcaster failed");
        *self.error.lock() = Some(message);
        *self.state.lock() = BroadcasterState::Failed;
        // Crash isolation (spec §4.12): failure always unblocks waiters.
        self.connection_event.fire();
        self.first_chunk_event.fire();
        self.broadcast_end();
    }

    /// Race-free broadcast (spec §4.12): snapshot the client set under the
    /// lock, release it, then attempt a non-blocking put on each queue.
    /// A full queue means the client is too slow; it is dropped, not
    /// allowed to stall everyone else.
    fn broadcast(&self, chunk: Bytes) {
        let snapshot: Vec<(u64, mpsc::Sender<ChunkMsg>)> =
            self.clients.lock().iter().map(|(id, tx)| (*id, tx.clone())).collect();

        let mut slow = Vec::new();
        for (id, tx) in snapshot {
            if tx.try_send(ChunkMsg::Data(chunk.clone())).is_err() {
                slow.push(id);
            }
        }

        if !slow.is_empty() {
            let mut clients = self.clients.lock();
            for id in slow {
                clients.remove(&id);
                warn!(content_key = %self.content_key, client = id, "dropping slow client, queue full");
            }
        }
    }

    fn broadcast_end(&self) {
        let snapshot: Vec<mpsc::Sender<ChunkMsg>> = self.clients.lock().values().cloned().collect();
        for tx in snapshot {
            let _ = tx.try_send(ChunkMsg::End);
        }
    }

    /// Client join (spec §4.12, race-free): snapshot the ring, insert the
    /// queue under the lock, then push backfill *after* releasing it so a
    /// ~6 MiB backfill never blocks the broadcast loop.
    fn add_client(self: &Arc<Self>) -> (u64, mpsc::Receiver<ChunkMsg>) {
        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.config.client_queue_capacity);

        let backfill: Vec<Bytes> = self.ring.lock().iter().cloned().collect();

        self.clients.lock().insert(id, tx.clone());
        self.last_active_ms.store(now_ms(), Ordering::SeqCst);

        for chunk in backfill {
            if tx.try_send(ChunkMsg::Data(chunk)).is_err() {
                break;
            }
        }

        (id, rx)
    }

    fn remove_client(&self, id: u64) {
        self.clients.lock().remove(&id);
        if self.clients.lock().is_empty() {
            self.last_active_ms.store(now_ms(), Ordering::SeqCst);
        }
    }

    /// `stream_data` (spec §4.12): registers a client queue, awaits
    /// connection + first chunk (or observes failure), then yields chunks
    /// until disconnect or broadcaster death.
    pub fn stream_data(self: &Arc<Self>) -> impl futures_util::Stream<Item = Result<Bytes>> {
        let this = self.clone();
        let connect_wait = self.config.connect_wait;
        async_stream::stream! {
            let (id, mut rx) = this.add_client();

            struct ClientGuard {
                broadcaster: Arc<Broadcaster>,
                client_id: u64,
            }
            impl Drop for ClientGuard {
                fn drop(&mut self) {
                    self.broadcaster.remove_client(self.client_id);
                }
            }
            let _guard = ClientGuard { broadcaster: this.clone(), client_id: id };

            if !this.connection_event.wait_timeout(connect_wait).await {
                yield Err(OrchestratorError::UpstreamFetchFailed("timed out waiting for upstream connection".into()));
                return;
            }
            if let Some(err) = this.error.lock().clone() {
                yield Err(OrchestratorError::UpstreamFetchFailed(err));
                return;
            }

            this.first_chunk_event.wait().await;
            if let Some(err) = this.error.lock().clone() {
                yield Err(OrchestratorError::UpstreamFetchFailed(err));
                return;
            }

            while let Some(msg) = rx.recv().await {
                match msg {
                    ChunkMsg::Data(chunk) => yield Ok(chunk),
                    ChunkMsg::End => break,
                }
            }
        }
    }

    /// Idempotent: cancels the fetch task, closes the upstream response
    /// (dropped with the task), and drains client queues with an
    /// end-of-stream sentinel.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == BroadcasterState::Stopped {
                return;
            }
            *state = BroadcasterState::Stopped;
        }
        if let Some(handle) = self.fetch_task.lock().take() {
            handle.abort();
        }
        self.connection_event.fire();
        self.first_chunk_event.fire();
        self.broadcast_end();
        self.clients.lock().clear();
    }
}

/// Per-content-key fan-out (spec §4.12). Owns every live `Broadcaster`.
pub struct Multiplexer {
    state: Arc<StateStore>,
    selector: Arc<EngineSelector>,
    sessions: dashmap::DashMap<String, Arc<Broadcaster>>,
    creation_lock: tokio::sync::Mutex<()>,
    http: reqwest::Client,
    config: MultiplexerConfig,
}

impl Multiplexer {
    pub fn new(state: Arc<StateStore>, selector: Arc<EngineSelector>, config: MultiplexerConfig) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.upstream_connect_timeout)
            // read/write/pool timeouts intentionally unbounded (spec §5):
            // live streams can run indefinitely.
            .pool_max_idle_per_host(config.max_connections_per_host)
            .build()
            .expect("multiplexer http client");

        Arc::new(Self { state, selector, sessions: dashmap::DashMap::new(), creation_lock: tokio::sync::Mutex::new(()), http, config })
    }

    pub fn get(&self, content_key: &str) -> Option<Arc<Broadcaster>> {
        self.sessions.get(content_key).map(|e| e.value().clone())
    }

    /// `get_or_create_session` (spec §4.12). Serialized via
    /// `creation_lock` so at most one broadcaster per content key ever
    /// reaches `created`/`connecting`/`streaming` (spec §8 invariant #4).
    pub async fn get_or_create_session(&self, content_key: &str, key_type: &str) -> Result<Arc<Broadcaster>> {
        if let Some(existing) = self.get(content_key) {
            return Ok(existing);
        }

        let _guard = self.creation_lock.lock().await;
        if let Some(existing) = self.get(content_key) {
            return Ok(existing);
        }

        let selection = self.selector.select()?;

        let playback = match self.fetch_playback_info(&selection.host, selection.port, content_key).await {
            Ok(p) => p,
            Err(err) => {
                self.selector.release_pending(&selection.container_key);
                return Err(err);
            }
        };

        self.state
            .on_stream_started(StreamStartedEvent {
                content_key: content_key.to_string(),
                key_type: key_type.to_string(),
                playback_session_id: None,
                container_key: selection.container_key.clone(),
                engine_host: selection.host.clone(),
                engine_port: selection.port,
                stat_url: playback.stat_url,
                command_url: playback.command_url,
                is_live: playback.is_live,
            })
            .await;
        self.selector.release_pending(&selection.container_key);

        let broadcaster = Broadcaster::new(
            content_key.to_string(),
            playback.playback_url,
            self.http.clone(),
            self.config.clone(),
        );
        broadcaster.start();
        self.sessions.insert(content_key.to_string(), broadcaster.clone());
        info!(content_key, "broadcaster created");
        Ok(broadcaster)
    }

    async fn fetch_playback_info(&self, host: &str, port: u16, content_key: &str) -> Result<PlaybackInfo> {
        let url = format!("http://{host}:{port}/ace/getstream?id={content_key}&format=json");
        let resp = self.http.get(&url).send().await?;
        let body: serde_json::Value = resp.json().await?;

        let response = body
            .get("response")
            .filter(|v| !v.is_null())
            .ok_or_else(|| OrchestratorError::UpstreamFetchFailed("engine returned no playback info".into()))?;

        Ok(PlaybackInfo {
            playback_url: response.get("playback_url").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            stat_url: response.get("stat_url").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            command_url: response.get("command_url").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            is_live: response.get("is_live").and_then(|v| v.as_i64()).map(|v| v != 0).unwrap_or(false),
        })
    }

    /// Idempotent (spec §8 round-trip property): a no-op if no broadcaster
    /// exists for this content key.
    pub async fn stop_by_content_key(&self, content_key: &str) {
        if let Some((_, broadcaster)) = self.sessions.remove(content_key) {
            broadcaster.stop();
        }
    }

    pub fn list(&self) -> Vec<Arc<Broadcaster>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Idle-GC loop (spec §4.12): stops broadcasters with zero clients for
    /// longer than `idle_timeout`.
    pub fn spawn_idle_gc(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30).min(this.config.idle_timeout));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.idle_gc().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("multiplexer idle gc shutting down");
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn idle_gc(&self) {
        let now = now_ms();
        let idle_ms = self.config.idle_timeout.as_millis() as i64;
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().client_count() == 0 && now - e.value().last_active_ms() >= idle_ms)
            .map(|e| e.key().clone())
            .collect();

        for key in stale {
            if let Some((_, broadcaster)) = self.sessions.remove(&key) {
                info!(content_key = %key, "idle broadcaster garbage collected");
                broadcaster.stop();
            }
        }
    }

    /// Shutdown ordering (spec §5): stop every broadcaster before the
    /// runtime adapter is closed, so upstream sockets are released cleanly.
    pub fn stop_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().stop();
        }
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutoscalerConfig;
    use crate::runtime::fake::FakeRuntime;
    use crate::state::InMemoryStatsStore;
    use crate::vpn::VpnSupervisor;
    use futures_util::pin_mut;

    fn multiplexer() -> (Arc<Multiplexer>, Arc<StateStore>) {
        let state = Arc::new(StateStore::new(Arc::new(InMemoryStatsStore::default())));
        let runtime = Arc::new(FakeRuntime::new());
        let vpn = VpnSupervisor::new(runtime, state.clone(), crate::config::VpnConfig::default());
        let selector = Arc::new(EngineSelector::new(state.clone(), vpn, &AutoscalerConfig::default()));
        (Multiplexer::new(state.clone(), selector, MultiplexerConfig::default()), state)
    }

    #[tokio::test]
    async fn no_engines_fails_selection() {
        let (mux, _state) = multiplexer();
        assert!(mux.get_or_create_session("content1", "infohash").await.is_err());
    }

    #[tokio::test]
    async fn stop_by_content_key_is_idempotent_when_absent() {
        let (mux, _state) = multiplexer();
        mux.stop_by_content_key("does-not-exist").await;
        mux.stop_by_content_key("does-not-exist").await;
    }

    #[tokio::test]
    async fn broadcaster_failure_sets_both_events_and_unblocks_waiters() {
        let broadcaster = Broadcaster::new(
            "content1".into(),
            "http://127.0.0.1:1/nonexistent".into(),
            reqwest::Client::new(),
            MultiplexerConfig::default(),
        );
        broadcaster.start();

        let stream = broadcaster.stream_data();
        pin_mut!(stream);
        let first = stream.next().await;

        assert!(first.unwrap().is_err());
        assert_eq!(broadcaster.state(), BroadcasterState::Failed);
        assert!(broadcaster.connection_event.is_set());
        assert!(broadcaster.first_chunk_event.is_set());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let broadcaster = Broadcaster::new(
            "content1".into(),
            "http://127.0.0.1:1/nonexistent".into(),
            reqwest::Client::new(),
            MultiplexerConfig::default(),
        );
        broadcaster.stop();
        broadcaster.stop();
        assert_eq!(broadcaster.state(), BroadcasterState::Stopped);
    }

    /// A second client subscribing mid-stream sees a prefix equal to the
    /// chunks already produced (ring-buffer backfill), followed without gap
    /// by the same live suffix the first client sees from that point on.
    #[tokio::test]
    async fn late_joining_client_gets_backfill_then_live_suffix() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            for chunk in [b'A', b'B'] {
                socket.write_all(&[chunk]).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
            for chunk in [b'C', b'D'] {
                socket.write_all(&[chunk]).await.unwrap();
            }
            socket.shutdown().await.ok();
        });

        let broadcaster = Broadcaster::new(
            "content1".into(),
            format!("http://{addr}/"),
            reqwest::Client::new(),
            MultiplexerConfig::default(),
        );
        broadcaster.start();

        // TCP may coalesce the two `write_all` calls on each side of the
        // server's pause into a single read, so accumulate raw bytes rather
        // than assuming one stream item per byte written.
        async fn recv_more(stream: &mut (impl futures_util::Stream<Item = Result<Bytes>> + Unpin), buf: &mut Vec<u8>, target_len: usize) {
            while buf.len() < target_len {
                let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
                    .await
                    .expect("chunk arrives in time")
                    .expect("stream not ended")
                    .expect("no error");
                buf.extend_from_slice(&chunk);
            }
        }

        let first_stream = broadcaster.stream_data();
        pin_mut!(first_stream);

        let mut first_seen = Vec::new();
        recv_more(&mut first_stream, &mut first_seen, 2).await;
        assert_eq!(first_seen, b"AB");

        // Join the second client while the server is still in its 150ms
        // pause, i.e. strictly between the backfill chunks and the live
        // suffix.
        let second_stream = broadcaster.stream_data();
        pin_mut!(second_stream);

        let mut second_seen = Vec::new();
        recv_more(&mut second_stream, &mut second_seen, 4).await;
        assert_eq!(second_seen, b"ABCD", "late joiner sees backfill then live suffix, contiguous and in order");

        recv_more(&mut first_stream, &mut first_seen, 4).await;
        assert_eq!(first_seen, b"ABCD");
    }

    #[test]
    fn ring_buffer_bounded_by_capacity() {
        let broadcaster = Broadcaster::new(
            "content1".into(),
            "http://example.invalid/".into(),
            reqwest::Client::new(),
            MultiplexerConfig { recent_chunks_capacity: 2, ..Default::default() },
        );
        {
            let mut ring = broadcaster.ring.lock();
            for i in 0..5u8 {
                ring.push_back(Bytes::from(vec![i]));
                while ring.len() > broadcaster.config.recent_chunks_capacity {
                    ring.pop_front();
                }
            }
        }
        assert_eq!(broadcaster.ring.lock().len(), 2);
    }
}
