//! Collector (spec §4.11, C11). Polls each live stream's `stat_url` and
//! is the *primary* stream-lifecycle signal for stale sessions the
//! engine silently dropped — clients don't always emit `stream_ended`.

use crate::config::CollectorConfig;
use crate::events::EventHandlers;
use crate::state::{StatSnapshot, StateStore, StreamEndedEvent, StreamFilter, StreamStatus};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct Collector {
    state: Arc<StateStore>,
    events: Arc<EventHandlers>,
    http: reqwest::Client,
    config: CollectorConfig,
}

impl Collector {
    pub fn new(state: Arc<StateStore>, events: Arc<EventHandlers>, config: CollectorConfig) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.stat_probe_timeout)
            .build()
            .expect("collector http client");
        Arc::new(Self { state, events, http, config })
    }

    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.collect_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.tick().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("collector shutting down");
                            break;
                        }
                    }
                }
            }
        });
    }

    pub async fn tick(&self) {
        let streams = self.state.list_streams(&StreamFilter { status: Some(StreamStatus::Started), ..Default::default() });
        for stream in streams {
            self.poll_one(&stream.id, &stream.content_key, &stream.stat_url).await;
        }
    }

    async fn poll_one(&self, stream_id: &str, content_key: &str, stat_url: &str) {
        let body = match self.http.get(stat_url).send().await {
            Ok(resp) => match resp.json::<serde_json::Value>().await {
                Ok(body) => body,
                Err(_) => return,
            },
            Err(_) => return, // network errors are counted elsewhere, not treated as stale
        };

        if is_stale_payload(&body) {
            info!(stream = %stream_id, "stale stream detected, synthesizing stream_ended");
            self.events
                .stream_ended(StreamEndedEvent {
                    content_key: content_key.to_string(),
                    playback_session_id: None,
                    reason: Some("stale_stream_detected".to_string()),
                })
                .await;
            return;
        }

        if let Some(snapshot) = parse_snapshot(&body) {
            self.state.append_stats(stream_id, snapshot);
        } else {
            warn!(stream = %stream_id, "unrecognized stat payload shape");
        }
    }
}

/// `{"response": null, "error": "unknown playback session id"}` (spec
/// §4.11). Case-insensitive match on the error string is load-bearing.
fn is_stale_payload(body: &serde_json::Value) -> bool {
    if !body.get("response").map(|r| r.is_null()).unwrap_or(false) {
        return false;
    }
    body.get("error")
        .and_then(|e| e.as_str())
        .map(|s| s.to_lowercase().contains("unknown playback session id"))
        .unwrap_or(false)
}

fn parse_snapshot(body: &serde_json::Value) -> Option<StatSnapshot> {
    let response = body.get("response")?;
    Some(StatSnapshot {
        at_ms: crate::state::engine::now_ms(),
        peers: response.get("peers").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        speed_down: response.get("speed_down").and_then(|v| v.as_u64()).unwrap_or(0),
        speed_up: response.get("speed_up").and_then(|v| v.as_u64()).unwrap_or(0),
        downloaded: response.get("downloaded").and_then(|v| v.as_u64()).unwrap_or(0),
        uploaded: response.get("uploaded").and_then(|v| v.as_u64()).unwrap_or(0),
        live_position: response.get("live_position").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_stale_payload_case_insensitively() {
        let body = json!({"response": null, "error": "Unknown Playback Session ID"});
        assert!(is_stale_payload(&body));
    }

    #[test]
    fn live_payload_is_not_stale() {
        let body = json!({"response": {"peers": 3}});
        assert!(!is_stale_payload(&body));
    }

    #[test]
    fn null_response_with_other_error_is_not_stale() {
        let body = json!({"response": null, "error": "internal error"});
        assert!(!is_stale_payload(&body));
    }

    #[test]
    fn parses_snapshot_fields() {
        let body = json!({"response": {"peers": 5, "speed_down": 100, "speed_up": 20, "downloaded": 1000, "uploaded": 200}});
        let snap = parse_snapshot(&body).unwrap();
        assert_eq!(snap.peers, 5);
        assert_eq!(snap.speed_down, 100);
    }
}
