//! The outbound webhook batcher.
//!
//! Beacon notifications accumulate in memory and are POSTed as one JSON
//! array per drain interval. Delivery is at-least-once in intent only:
//! failures are logged and the batch dropped, there is no retry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;

use geopulse_core::events::{BeaconNotifier, EventMessage};

/// One queued notification, as it appears in the POST body.
#[derive(Serialize, Debug, Clone)]
pub struct HookMessage {
    #[serde(rename = "beacon_id")]
    pub beacon: String,
    pub message: EventMessage,
}

pub struct WebhookWriter {
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
    headers: HashMap<String, String>,
    pending: Mutex<Vec<HookMessage>>,
}

impl WebhookWriter {
    /// Creates the writer and spawns its drain task on the current
    /// runtime.
    pub fn start(
        url: impl Into<String>,
        headers: HashMap<String, String>,
        bearer_token: Option<String>,
        interval: Duration,
    ) -> Arc<Self> {
        let writer = Arc::new(Self {
            client: reqwest::Client::new(),
            url: url.into(),
            bearer_token,
            headers,
            pending: Mutex::new(Vec::new()),
        });
        let drainer = writer.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                drainer.drain().await;
            }
        });
        writer
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HookMessage>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sends everything queued since the last drain as a single POST.
    pub async fn drain(&self) {
        let batch = {
            let mut pending = self.lock();
            if pending.is_empty() {
                return;
            }
            std::mem::take(&mut *pending)
        };
        debug!("webhook: sending {} messages", batch.len());

        let mut request = self
            .client
            .post(&self.url)
            .json(&batch)
            .header("User-Agent", "geopulse webhook writer");
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        match request.send().await {
            Ok(response) => debug!("webhook replied with status {}", response.status()),
            Err(err) => warn!("webhook POST error: {err}"),
        }
    }

    /// Number of queued, not yet drained messages.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }
}

impl BeaconNotifier for WebhookWriter {
    fn notify(&self, beacon_id: &str, event: &EventMessage) {
        let message = HookMessage {
            beacon: beacon_id.to_string(),
            message: event.clone(),
        };
        debug!("webhook: queueing message for beacon {beacon_id}");
        self.lock().push(message);
    }
}
