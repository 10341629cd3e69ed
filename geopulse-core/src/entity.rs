//! Entities held by the world registry and the tagged references the
//! spatial index stores for them.

use std::sync::Arc;

use crate::events::{AgentEvent, EventMessage, EventSink, PoiEvent};
use crate::geo::{Point, Rect};
use crate::quad::RectHandle;

/// Free-form JSON object attached to agents, POIs and beacons.
pub type PublicData = serde_json::Map<String, serde_json::Value>;

/// A connected producer of position updates.
pub struct Agent {
    pub id: Arc<str>,
    pub sink: Arc<dyn EventSink>,
    pub public_data: PublicData,
    /// `None` while the agent is connected but unpositioned.
    pub point: Option<Point>,
}

/// A connected consumer subscribed to a rectangular window.
pub struct View {
    pub id: Arc<str>,
    pub sink: Arc<dyn EventSink>,
    pub rect: Option<Rect>,
    pub handle: Option<RectHandle>,
}

/// A persistent point of interest.
pub struct Poi {
    pub id: Arc<str>,
    pub public_data: PublicData,
    /// The agent that created it, or `None` for a system POI.
    pub creator: Option<Arc<str>>,
    pub point: Point,
}

/// A persistent rectangular region notified through webhooks.
pub struct AirBeacon {
    pub id: Arc<str>,
    pub public_data: PublicData,
    pub creator: Option<Arc<str>>,
    pub rect: Rect,
    pub handle: Option<RectHandle>,
}

/// Point entry stored in the spatial index: the entity kind plus its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PointRef {
    Agent(Arc<str>),
    Poi(Arc<str>),
}

/// Rect entry stored in the spatial index: the entity kind plus its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RectRef {
    View(Arc<str>),
    Beacon(Arc<str>),
}

/// Snapshot of an agent taken under the registry lock, carrying everything
/// needed to build its messages after the lock is released.
#[derive(Debug, Clone)]
pub struct AgentSummary {
    pub id: Arc<str>,
    pub pos: Option<Point>,
    pub public_data: PublicData,
}

impl AgentSummary {
    pub fn entered_event(&self) -> EventMessage {
        EventMessage::Agent(AgentEvent {
            id: self.id.to_string(),
            pos: self.pos,
            public_data: Some(self.public_data.clone()),
            entered: true,
            left: false,
        })
    }

    pub fn left_event(&self) -> EventMessage {
        EventMessage::Agent(AgentEvent {
            id: self.id.to_string(),
            pos: None,
            public_data: None,
            entered: false,
            left: true,
        })
    }

    /// Position update for consumers that already see the agent.
    pub fn moved_event(&self) -> EventMessage {
        EventMessage::Agent(AgentEvent {
            id: self.id.to_string(),
            pos: self.pos,
            public_data: None,
            entered: false,
            left: false,
        })
    }

    /// Public-data update, addressed to the same audience as a move.
    pub fn data_event(&self) -> EventMessage {
        EventMessage::Agent(AgentEvent {
            id: self.id.to_string(),
            pos: self.pos,
            public_data: Some(self.public_data.clone()),
            entered: false,
            left: false,
        })
    }
}

/// Snapshot of a POI taken under the registry lock.
#[derive(Debug, Clone)]
pub struct PoiSummary {
    pub id: Arc<str>,
    pub pos: Point,
    pub public_data: PublicData,
    pub creator: Option<Arc<str>>,
}

impl PoiSummary {
    pub fn entered_event(&self) -> EventMessage {
        EventMessage::Poi(PoiEvent {
            id: self.id.to_string(),
            pos: Some(self.pos),
            public_data: Some(self.public_data.clone()),
            creator: self.creator.as_ref().map(|c| c.to_string()),
            entered: true,
            left: false,
        })
    }

    pub fn left_event(&self) -> EventMessage {
        EventMessage::Poi(PoiEvent {
            id: self.id.to_string(),
            pos: None,
            public_data: None,
            creator: None,
            entered: false,
            left: true,
        })
    }
}

/// Snapshot of an air beacon taken under the registry lock.
#[derive(Debug, Clone)]
pub struct BeaconSummary {
    pub id: Arc<str>,
    pub rect: Rect,
    pub public_data: PublicData,
    pub creator: Option<Arc<str>>,
}

/// Snapshot of any point-shaped entity, for view enter/leave messages.
#[derive(Debug, Clone)]
pub enum PointSnapshot {
    Agent(AgentSummary),
    Poi(PoiSummary),
}

impl PointSnapshot {
    pub fn entered_event(&self) -> EventMessage {
        match self {
            Self::Agent(agent) => agent.entered_event(),
            Self::Poi(poi) => poi.entered_event(),
        }
    }

    pub fn left_event(&self) -> EventMessage {
        match self {
            Self::Agent(agent) => agent.left_event(),
            Self::Poi(poi) => poi.left_event(),
        }
    }
}
