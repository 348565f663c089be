//! Event handlers (spec §4.10, C10): `stream_started` / `stream_ended`.
//! Thin orchestration layer over the state store — the actual mutation
//! logic lives there so it can be serialized under one lock (spec §5).

use crate::multiplex::Multiplexer;
use crate::provisioner::Provisioner;
use crate::selector::EngineSelector;
use crate::state::{Stream, StreamEndedEvent, StreamStartedEvent};
use std::sync::Arc;
use tracing::info;

pub struct EventHandlers {
    state: Arc<crate::state::StateStore>,
    selector: Arc<EngineSelector>,
    multiplexer: Arc<Multiplexer>,
    provisioner: Arc<Provisioner>,
}

impl EventHandlers {
    pub fn new(
        state: Arc<crate::state::StateStore>,
        selector: Arc<EngineSelector>,
        multiplexer: Arc<Multiplexer>,
        provisioner: Arc<Provisioner>,
    ) -> Self {
        Self { state, selector, multiplexer, provisioner }
    }

    pub async fn stream_started(&self, evt: StreamStartedEvent) -> Stream {
        let container_key = evt.container_key.clone();
        let stream = self.state.on_stream_started(evt).await;
        self.selector.release_pending(&container_key);
        stream
    }

    pub async fn stream_ended(&self, evt: StreamEndedEvent) {
        let content_key = evt.content_key.clone();
        let outcome = match self.state.on_stream_ended(evt).await {
            Some(o) => o,
            None => return,
        };

        // Closes the synchronization gap between the stream disappearing
        // from API listings and the broadcaster's own idle timeout.
        self.multiplexer.stop_by_content_key(&content_key).await;

        if outcome.engine_became_idle {
            info!(engine = %outcome.stream.container_key, "engine became idle, scheduling cache cleanup");
            if let Err(err) = self.provisioner.clear_cache(&outcome.stream.container_key).await {
                tracing::warn!(engine = %outcome.stream.container_key, error = %err, "cache cleanup failed");
            }
        }
    }
}
