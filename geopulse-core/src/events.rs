//! Outbound event messages and the delivery seams.
//!
//! Messages are built by the dispatcher and handed to per-consumer sinks;
//! the concrete sinks (session writers, the webhook batcher) live in the
//! transport layer behind the traits defined here.

use serde::Serialize;

use crate::entity::PublicData;
use crate::geo::Point;

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// Change message about an agent. The optional fields cover the four wire
/// shapes: entered (pos + data + flag), left (flag only), moved within
/// (pos only) and public-data update (pos + data).
#[derive(Serialize, Debug, Clone)]
pub struct AgentEvent {
    #[serde(rename = "agent_id")]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos: Option<Point>,
    #[serde(rename = "publicData", skip_serializing_if = "Option::is_none")]
    pub public_data: Option<PublicData>,
    #[serde(skip_serializing_if = "is_false")]
    pub entered: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub left: bool,
}

/// Change message about a point of interest.
#[derive(Serialize, Debug, Clone)]
pub struct PoiEvent {
    #[serde(rename = "poi_id")]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos: Option<Point>,
    #[serde(rename = "publicData", skip_serializing_if = "Option::is_none")]
    pub public_data: Option<PublicData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub entered: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub left: bool,
}

/// Any change message deliverable to a consumer.
#[derive(Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum EventMessage {
    Agent(AgentEvent),
    Poi(PoiEvent),
}

/// Per-view delivery target, one per session. Implementations buffer and
/// coalesce; delivery must not block.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &EventMessage);
}

/// Delivery target for air-beacon notifications, fed to the webhook
/// batcher.
pub trait BeaconNotifier: Send + Sync {
    fn notify(&self, beacon_id: &str, event: &EventMessage);
}
