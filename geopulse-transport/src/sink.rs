//! The per-session coalescing sink.
//!
//! Events delivered to a view are buffered and flushed as a single JSON
//! array once per send interval; the flush timer is armed by the first
//! event of a window. Urgent replies (parse errors, size rejections)
//! bypass the buffer but share the per-connection writer channel, which
//! keeps all writes to one socket serialized.

use std::sync::{Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, error};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use geopulse_core::events::{EventMessage, EventSink};

struct SinkState {
    buffer: Vec<EventMessage>,
    closing: bool,
}

pub struct SessionSink {
    /// Session identity, for logs.
    name: String,
    outbound: UnboundedSender<String>,
    interval: Duration,
    state: Mutex<SinkState>,
    weak: Weak<SessionSink>,
}

impl SessionSink {
    /// Creates a sink writing through `outbound`; the connection's writer
    /// task owns the other end of the channel.
    pub fn new(
        name: impl Into<String>,
        outbound: UnboundedSender<String>,
        interval: Duration,
    ) -> std::sync::Arc<Self> {
        std::sync::Arc::new_cyclic(|weak| Self {
            name: name.into(),
            outbound,
            interval,
            state: Mutex::new(SinkState {
                buffer: Vec::new(),
                closing: false,
            }),
            weak: weak.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Serializes and sends immediately, skipping the batch.
    pub fn send_now<T: Serialize>(&self, message: &T) {
        if self.lock().closing {
            return;
        }
        match serde_json::to_string(message) {
            Ok(json) => {
                let _ = self.outbound.send(json);
            }
            Err(err) => error!("{}: failed to encode urgent message: {err}", self.name),
        }
    }

    /// Writes the pending batch as one JSON array.
    pub fn flush(&self) {
        let batch = {
            let mut state = self.lock();
            if state.closing || state.buffer.is_empty() {
                return;
            }
            std::mem::take(&mut state.buffer)
        };
        debug!("{}: flushing {} events", self.name, batch.len());
        match serde_json::to_string(&batch) {
            Ok(json) => {
                let _ = self.outbound.send(json);
            }
            Err(err) => error!("{}: failed to encode event batch: {err}", self.name),
        }
    }

    /// Marks the sink closed; later deliveries and flushes become no-ops.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closing = true;
        state.buffer.clear();
    }
}

impl EventSink for SessionSink {
    fn deliver(&self, event: &EventMessage) {
        let arm_timer = {
            let mut state = self.lock();
            if state.closing {
                return;
            }
            let first = state.buffer.is_empty();
            state.buffer.push(event.clone());
            first
        };
        if arm_timer {
            let weak = self.weak.clone();
            let interval = self.interval;
            tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                if let Some(sink) = weak.upgrade() {
                    sink.flush();
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geopulse_core::events::AgentEvent;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn event(id: &str) -> EventMessage {
        EventMessage::Agent(AgentEvent {
            id: id.to_string(),
            pos: None,
            public_data: None,
            entered: false,
            left: true,
        })
    }

    async fn recv(rx: &mut UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn events_coalesce_into_one_array_per_window() {
        let (tx, mut rx) = unbounded_channel();
        let sink = SessionSink::new("test", tx, Duration::from_millis(20));

        sink.deliver(&event("a"));
        sink.deliver(&event("b"));
        sink.deliver(&event("c"));

        let frame = recv(&mut rx).await;
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0]["agent_id"], "a");

        // the next window arms its own timer
        sink.deliver(&event("d"));
        let frame = recv(&mut rx).await;
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[tokio::test]
    async fn urgent_messages_skip_the_batch() {
        let (tx, mut rx) = unbounded_channel();
        let sink = SessionSink::new("test", tx, Duration::from_millis(50));

        sink.deliver(&event("a"));
        sink.send_now(&serde_json::json!({"error": "nope"}));

        // the urgent reply arrives before the batch flushes
        let first = recv(&mut rx).await;
        assert!(first.contains("nope"));
        let second = recv(&mut rx).await;
        assert!(second.starts_with('['));
    }

    #[tokio::test]
    async fn a_closed_sink_drops_everything() {
        let (tx, mut rx) = unbounded_channel();
        let sink = SessionSink::new("test", tx, Duration::from_millis(10));

        sink.close();
        sink.deliver(&event("a"));
        sink.send_now(&serde_json::json!({"error": "late"}));
        sink.flush();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
    }
}
