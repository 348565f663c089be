//! State store (spec §4.3, C3) — in-memory engine/stream registry plus a
//! pluggable persistence seam for streams and stat snapshots.
//!
//! DashMap-backed inventory, shared via `Arc`, with one addition: calls
//! for the *same stream id* must be serialized (§5) — `stream_started`/
//! `stream_ended` additionally take a `tokio::sync::Mutex<()>` guard
//! while the DashMap entries themselves absorb everything else.

pub mod engine;
pub mod stream;

pub use engine::{Engine, HealthStatus};
pub use stream::{StatSnapshot, Stream, StreamEndedEvent, StreamStartedEvent, StreamStatus};

use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Persistence seam for streams and stat snapshots (spec §4.3:
/// "persisted to a durable store"). The default impl is in-memory; a real
/// deployment can swap in a SQL-backed implementation without touching
/// the control plane (spec_full.md supplement #4).
pub trait StatsStore: Send + Sync {
    fn persist_stream(&self, stream: &Stream);
    fn persist_stat(&self, stream_id: &str, snapshot: &StatSnapshot);
    fn load_streams(&self) -> Vec<Stream>;
}

#[derive(Default)]
pub struct InMemoryStatsStore {
    streams: DashMap<String, Stream>,
}

impl StatsStore for InMemoryStatsStore {
    fn persist_stream(&self, stream: &Stream) {
        self.streams.insert(stream.id.clone(), stream.clone());
    }

    fn persist_stat(&self, stream_id: &str, snapshot: &StatSnapshot) {
        if let Some(mut entry) = self.streams.get_mut(stream_id) {
            entry.stats.push(snapshot.clone());
        }
    }

    fn load_streams(&self) -> Vec<Stream> {
        self.streams.iter().map(|e| e.value().clone()).collect()
    }
}

#[derive(Default, Clone)]
pub struct EngineFilter {
    pub vpn: Option<Option<String>>,
    pub health: Option<HealthStatus>,
    pub forwarded: Option<bool>,
}

impl EngineFilter {
    fn matches(&self, e: &Engine) -> bool {
        if let Some(vpn) = &self.vpn {
            if &e.vpn != vpn {
                return false;
            }
        }
        if let Some(health) = self.health {
            if e.health != health {
                return false;
            }
        }
        if let Some(forwarded) = self.forwarded {
            if e.forwarded != forwarded {
                return false;
            }
        }
        true
    }
}

#[derive(Default, Clone)]
pub struct StreamFilter {
    pub status: Option<StreamStatus>,
    pub container_key: Option<String>,
}

impl StreamFilter {
    fn matches(&self, s: &Stream) -> bool {
        if let Some(status) = self.status {
            if s.status != status {
                return false;
            }
        }
        if let Some(key) = &self.container_key {
            if &s.container_key != key {
                return false;
            }
        }
        true
    }
}

pub struct StateStore {
    engines: DashMap<String, Engine>,
    streams: DashMap<String, Stream>,
    write_lock: tokio::sync::Mutex<()>,
    stats_store: Arc<dyn StatsStore>,
}

/// Returned by `on_stream_ended` so the caller can schedule cache cleanup
/// (spec §4.3 / §4.10) without the state store reaching into the
/// provisioner itself.
pub struct StreamEndedOutcome {
    pub stream: Stream,
    pub engine_became_idle: bool,
}

impl StateStore {
    pub fn new(stats_store: Arc<dyn StatsStore>) -> Self {
        Self {
            engines: DashMap::new(),
            streams: DashMap::new(),
            write_lock: tokio::sync::Mutex::new(()),
            stats_store,
        }
    }

    // ---- engines ----

    pub fn upsert_engine(&self, engine: Engine) {
        self.engines.insert(engine.container_key.clone(), engine);
    }

    pub fn remove_engine(&self, key: &str) -> Option<Engine> {
        self.engines.remove(key).map(|(_, e)| e)
    }

    pub fn get_engine(&self, key: &str) -> Option<Engine> {
        self.engines.get(key).map(|e| e.value().clone())
    }

    pub fn set_engine_vpn(&self, key: &str, vpn: Option<String>) {
        if let Some(mut e) = self.engines.get_mut(key) {
            e.vpn = vpn;
        }
    }

    pub fn set_forwarded(&self, key: &str, forwarded: bool) {
        if let Some(mut e) = self.engines.get_mut(key) {
            e.forwarded = forwarded;
        }
    }

    pub fn set_health(&self, key: &str, status: HealthStatus) {
        if let Some(mut e) = self.engines.get_mut(key) {
            e.health = status;
            e.last_health_check_ms = Some(engine::now_ms());
            if status == HealthStatus::Healthy {
                e.consecutive_health_failures = 0;
            }
        }
    }

    pub fn record_health_failure(&self, key: &str) -> u32 {
        if let Some(mut e) = self.engines.get_mut(key) {
            e.consecutive_health_failures += 1;
            e.last_health_check_ms = Some(engine::now_ms());
            e.consecutive_health_failures
        } else {
            0
        }
    }

    pub fn mark_cache_cleanup(&self, key: &str) {
        if let Some(mut e) = self.engines.get_mut(key) {
            e.last_cache_cleanup_ms = Some(engine::now_ms());
        }
    }

    pub fn set_starting(&self, key: &str, starting: bool) {
        if let Some(mut e) = self.engines.get_mut(key) {
            e.starting = starting;
        }
    }

    pub fn list_engines(&self, filter: &EngineFilter) -> Vec<Engine> {
        self.engines
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn forwarded_engine_for(&self, vpn: &Option<String>) -> Option<Engine> {
        self.engines
            .iter()
            .find(|e| e.forwarded && &e.vpn == vpn)
            .map(|e| e.value().clone())
    }

    // ---- streams ----

    /// `stream_started` (spec §4.10): allocates a Stream, attaches it to
    /// the owning engine, updates `last_stream_usage`. Serialized against
    /// `on_stream_ended` for the same stream id.
    pub async fn on_stream_started(&self, evt: StreamStartedEvent) -> Stream {
        let _guard = self.write_lock.lock().await;

        let playback_session_id = evt
            .playback_session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let id = Stream::make_id(&evt.content_key, &playback_session_id);

        let stream = Stream {
            id: id.clone(),
            content_key: evt.content_key,
            key_type: evt.key_type,
            playback_session_id,
            container_key: evt.container_key.clone(),
            engine_host: evt.engine_host,
            engine_port: evt.engine_port,
            stat_url: evt.stat_url,
            command_url: evt.command_url,
            is_live: evt.is_live,
            status: StreamStatus::Started,
            started_at_ms: engine::now_ms(),
            ended_at_ms: None,
            stats: Vec::new(),
        };

        self.streams.insert(id, stream.clone());
        self.stats_store.persist_stream(&stream);

        if let Some(mut e) = self.engines.get_mut(&evt.container_key) {
            e.active_streams.insert(stream.id.clone());
            e.last_stream_usage_ms = Some(engine::now_ms());
        }

        stream
    }

    /// `stream_ended` (spec §4.10). Idempotent: ending an already-ended
    /// stream is a no-op and returns `None`.
    pub async fn on_stream_ended(&self, evt: StreamEndedEvent) -> Option<StreamEndedOutcome> {
        let _guard = self.write_lock.lock().await;

        let id = match &evt.playback_session_id {
            Some(psid) => Stream::make_id(&evt.content_key, psid),
            None => {
                // No session id given: find the most recent started stream
                // for this content key.
                self.streams
                    .iter()
                    .filter(|s| s.content_key == evt.content_key && s.status == StreamStatus::Started)
                    .max_by_key(|s| s.started_at_ms)
                    .map(|s| s.id.clone())?
            }
        };

        let mut entry = self.streams.get_mut(&id)?;
        if entry.status == StreamStatus::Ended {
            return None;
        }
        entry.status = StreamStatus::Ended;
        entry.ended_at_ms = Some(engine::now_ms());
        let stream = entry.clone();
        drop(entry);

        self.stats_store.persist_stream(&stream);

        let engine_became_idle = if let Some(mut e) = self.engines.get_mut(&stream.container_key) {
            e.active_streams.remove(&stream.id);
            e.active_streams.is_empty()
        } else {
            false
        };

        Some(StreamEndedOutcome { stream, engine_became_idle })
    }

    pub fn get_stream(&self, id: &str) -> Option<Stream> {
        self.streams.get(id).map(|s| s.value().clone())
    }

    pub fn list_streams(&self, filter: &StreamFilter) -> Vec<Stream> {
        self.streams
            .iter()
            .filter(|s| filter.matches(s.value()))
            .map(|s| s.value().clone())
            .collect()
    }

    pub fn append_stats(&self, stream_id: &str, snapshot: StatSnapshot) {
        if let Some(mut s) = self.streams.get_mut(stream_id) {
            s.stats.push(snapshot.clone());
        }
        self.stats_store.persist_stat(stream_id, &snapshot);
    }

    /// Point-in-time copy for API reads (spec §4.3).
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            engines: self.engines.iter().map(|e| e.value().clone()).collect(),
            streams: self.streams.iter().map(|s| s.value().clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StateSnapshot {
    pub engines: Vec<Engine>,
    pub streams: Vec<Stream>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store() -> StateStore {
        StateStore::new(Arc::new(InMemoryStatsStore::default()))
    }

    #[tokio::test]
    async fn stream_started_attaches_to_engine() {
        let s = store();
        s.upsert_engine(Engine::new("c1".into(), "host1".into(), 40000, 6878));

        let stream = s
            .on_stream_started(StreamStartedEvent {
                content_key: "abc".into(),
                container_key: "c1".into(),
                engine_host: "host1".into(),
                engine_port: 6878,
                ..Default::default()
            })
            .await;

        let engine = s.get_engine("c1").unwrap();
        assert!(engine.active_streams.contains(&stream.id));
    }

    #[tokio::test]
    async fn stream_ended_marks_engine_idle_when_last_stream() {
        let s = store();
        s.upsert_engine(Engine::new("c1".into(), "host1".into(), 40000, 6878));
        let stream = s
            .on_stream_started(StreamStartedEvent {
                content_key: "abc".into(),
                container_key: "c1".into(),
                playback_session_id: Some("sess1".into()),
                ..Default::default()
            })
            .await;

        let outcome = s
            .on_stream_ended(StreamEndedEvent {
                content_key: "abc".into(),
                playback_session_id: Some("sess1".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(outcome.engine_became_idle);
        assert_eq!(outcome.stream.id, stream.id);
    }

    #[tokio::test]
    async fn stream_ended_twice_is_noop() {
        let s = store();
        s.upsert_engine(Engine::new("c1".into(), "host1".into(), 40000, 6878));
        s.on_stream_started(StreamStartedEvent {
            content_key: "abc".into(),
            container_key: "c1".into(),
            playback_session_id: Some("sess1".into()),
            ..Default::default()
        })
        .await;

        let evt = || StreamEndedEvent {
            content_key: "abc".into(),
            playback_session_id: Some("sess1".into()),
            ..Default::default()
        };
        assert!(s.on_stream_ended(evt()).await.is_some());
        assert!(s.on_stream_ended(evt()).await.is_none());
    }

    #[tokio::test]
    async fn re_adding_same_key_after_ended_creates_new_record() {
        let s = store();
        s.upsert_engine(Engine::new("c1".into(), "host1".into(), 40000, 6878));
        let first = s
            .on_stream_started(StreamStartedEvent {
                content_key: "abc".into(),
                container_key: "c1".into(),
                playback_session_id: Some("sess1".into()),
                ..Default::default()
            })
            .await;
        s.on_stream_ended(StreamEndedEvent {
            content_key: "abc".into(),
            playback_session_id: Some("sess1".into()),
            ..Default::default()
        })
        .await;

        let second = s
            .on_stream_started(StreamStartedEvent {
                content_key: "abc".into(),
                container_key: "c1".into(),
                playback_session_id: Some("sess2".into()),
                ..Default::default()
            })
            .await;

        assert_ne!(first.id, second.id);
        assert_eq!(s.get_stream(&first.id).unwrap().status, StreamStatus::Ended);
        assert_eq!(s.get_stream(&second.id).unwrap().status, StreamStatus::Started);
    }
}
