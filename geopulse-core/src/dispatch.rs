//! The move dispatcher: turns registry transitions into `entered` /
//! `moved` / `left` messages and fans them out to the affected consumers.
//!
//! Views receive every message kind through their session sink; air beacons
//! receive only enter/leave notifications, routed to the webhook batcher.
//! Delivery happens after the registry lock is released.

use std::sync::Arc;

use log::warn;

use crate::entity::{PoiSummary, PublicData};
use crate::events::{BeaconNotifier, EventMessage};
use crate::geo::{Point, Rect};
use crate::registry::{Consumer, World, WorldError};

pub struct Dispatcher {
    world: Arc<World>,
    webhooks: Option<Arc<dyn BeaconNotifier>>,
}

impl Dispatcher {
    pub fn new(world: Arc<World>, webhooks: Option<Arc<dyn BeaconNotifier>>) -> Self {
        Self { world, webhooks }
    }

    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    /// Handles an agent position update: `left` to consumers losing the
    /// agent, `moved` to views keeping it, `entered` to consumers gaining
    /// it.
    pub fn agent_move(&self, id: &str, pos: Point) {
        let Some(transition) = self.world.update_agent_position(id, pos) else {
            return;
        };

        let left = transition.agent.left_event();
        for item in transition.before.difference(&transition.after) {
            self.deliver(&left, transition.consumers.get(item));
        }

        // intra-window position updates are for views only
        let moved = transition.agent.moved_event();
        for item in transition.before.intersection(&transition.after) {
            if let Some(Consumer::View { sink, .. }) = transition.consumers.get(item) {
                sink.deliver(&moved);
            }
        }

        let entered = transition.agent.entered_event();
        for item in transition.after.difference(&transition.before) {
            self.deliver(&entered, transition.consumers.get(item));
        }
    }

    /// Handles an agent public-data update: broadcast to every consumer
    /// currently containing the agent.
    pub fn agent_public_data(&self, id: &str, public_data: PublicData) {
        let Some((agent, consumers)) = self.world.update_agent_public_data(id, public_data)
        else {
            return;
        };
        self.broadcast(&agent.data_event(), &consumers);
    }

    /// Handles a session ending: a `left` broadcast from the agent's last
    /// known point, then removal. An agent that never had a position leaves
    /// silently.
    pub fn agent_disconnected(&self, id: &str) {
        let Some((agent, consumers)) = self.world.remove_agent(id) else {
            return;
        };
        if consumers.is_empty() {
            return;
        }
        self.broadcast(&agent.left_event(), &consumers);
    }

    /// Handles a view window update: `left` for points no longer visible,
    /// `entered` for newly visible ones. Points that stay visible are not
    /// re-announced; their own moves keep the view current.
    pub fn view_move(&self, id: &str, rect: Rect) {
        let Some(transition) = self.world.update_view_position(id, rect) else {
            return;
        };
        for item in transition.before.difference(&transition.after) {
            if let Some(snapshot) = transition.snapshots.get(item) {
                transition.sink.deliver(&snapshot.left_event());
            }
        }
        for item in transition.after.difference(&transition.before) {
            if let Some(snapshot) = transition.snapshots.get(item) {
                transition.sink.deliver(&snapshot.entered_event());
            }
        }
    }

    /// Creates a POI and announces it to every consumer containing it.
    pub fn create_poi(
        &self,
        id: &str,
        pos: Point,
        public_data: PublicData,
        creator: Option<&str>,
    ) -> Result<PoiSummary, WorldError> {
        let (poi, consumers) = self.world.create_poi(id, pos, public_data, creator)?;
        self.broadcast(&poi.entered_event(), &consumers);
        Ok(poi)
    }

    /// Removes a POI and announces the removal to the audience captured
    /// before it disappeared.
    pub fn remove_poi(&self, id: &str, requester: Option<&str>) -> Result<PoiSummary, WorldError> {
        let (poi, consumers) = self.world.remove_poi(id, requester)?;
        self.broadcast(&poi.left_event(), &consumers);
        Ok(poi)
    }

    fn broadcast(&self, event: &EventMessage, consumers: &[Consumer]) {
        for consumer in consumers {
            self.deliver(event, Some(consumer));
        }
    }

    fn deliver(&self, event: &EventMessage, consumer: Option<&Consumer>) {
        match consumer {
            Some(Consumer::View { sink, .. }) => sink.deliver(event),
            Some(Consumer::Beacon { id }) => {
                if let Some(webhooks) = &self.webhooks {
                    webhooks.notify(id, event);
                }
            }
            None => warn!("change message addressed to a consumer that no longer exists"),
        }
    }
}
