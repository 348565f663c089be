//! Stream record (spec §3).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Started,
    Ended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub at_ms: i64,
    pub peers: u32,
    pub speed_down: u64,
    pub speed_up: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub live_position: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub id: String,
    pub content_key: String,
    pub key_type: String,
    pub playback_session_id: String,
    pub container_key: String,
    pub engine_host: String,
    pub engine_port: u16,
    pub stat_url: String,
    pub command_url: String,
    pub is_live: bool,
    pub status: StreamStatus,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub stats: Vec<StatSnapshot>,
}

impl Stream {
    /// `{content_key}|{playback_session_id}` per spec §3.
    pub fn make_id(content_key: &str, playback_session_id: &str) -> String {
        format!("{}|{}", content_key, playback_session_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StreamStartedEvent {
    pub content_key: String,
    pub key_type: String,
    pub playback_session_id: Option<String>,
    pub container_key: String,
    pub engine_host: String,
    pub engine_port: u16,
    pub stat_url: String,
    pub command_url: String,
    pub is_live: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StreamEndedEvent {
    pub content_key: String,
    pub playback_session_id: Option<String>,
    pub reason: Option<String>,
}
