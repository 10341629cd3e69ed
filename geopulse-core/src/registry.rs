//! The world registry: entity maps plus the shared spatial index.
//!
//! One reader/writer lock guards the maps and the tree together. Every
//! mutating operation acquires it once, applies the change, runs the
//! before/after index queries and resolves the affected consumers while
//! still holding it, then returns a transition value; building and
//! delivering messages happens outside the lock so slow consumers never
//! block the index.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{error, info, warn};
use thiserror::Error;

use crate::entity::{
    Agent, AgentSummary, AirBeacon, BeaconSummary, Poi, PoiSummary, PointRef, PointSnapshot,
    PublicData, RectRef, View,
};
use crate::events::EventSink;
use crate::geo::{Point, Rect};
use crate::persist::{PersistError, Persister, StoredBeacon, StoredPoi, StoredState};
use crate::quad::QuadTree;

#[derive(Error, Debug)]
pub enum WorldError {
    #[error("{kind} {id:?} already exists")]
    DuplicateId { kind: &'static str, id: String },
    #[error("{kind} {id:?} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("only the creator may remove {kind} {id:?}")]
    NotCreator { kind: &'static str, id: String },
}

/// A consumer affected by a change, resolved under the lock so delivery
/// needs no second lookup.
#[derive(Clone)]
pub enum Consumer {
    View {
        id: Arc<str>,
        sink: Arc<dyn EventSink>,
    },
    Beacon {
        id: Arc<str>,
    },
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Consumer::View { id, .. } => f.debug_struct("View").field("id", id).finish(),
            Consumer::Beacon { id } => f.debug_struct("Beacon").field("id", id).finish(),
        }
    }
}

/// Result of an agent position update: the rect sets flanking the move and
/// the resolution of every rect involved.
pub struct AgentMove {
    pub prior: Option<Point>,
    /// Rects containing the prior point; empty when the agent was
    /// unpositioned.
    pub before: HashSet<RectRef>,
    /// Rects containing the new point.
    pub after: HashSet<RectRef>,
    pub consumers: HashMap<RectRef, Consumer>,
    pub agent: AgentSummary,
}

/// Result of a view window update: the point sets flanking the move and a
/// snapshot of every point involved.
pub struct ViewMove {
    pub prior: Option<Rect>,
    pub before: HashSet<PointRef>,
    pub after: HashSet<PointRef>,
    pub snapshots: HashMap<PointRef, PointSnapshot>,
    pub sink: Arc<dyn EventSink>,
}

/// Entity counts, for startup and diagnostics logging.
#[derive(Debug, Clone, Copy)]
pub struct WorldCounts {
    pub agents: usize,
    pub views: usize,
    pub pois: usize,
    pub beacons: usize,
}

struct WorldState {
    agents: HashMap<Arc<str>, Agent>,
    views: HashMap<Arc<str>, View>,
    pois: HashMap<Arc<str>, Poi>,
    beacons: HashMap<Arc<str>, AirBeacon>,
    tree: QuadTree<PointRef, RectRef>,
}

impl WorldState {
    fn resolve(&self, item: &RectRef) -> Option<Consumer> {
        match item {
            RectRef::View(id) => self.views.get(id).map(|view| Consumer::View {
                id: view.id.clone(),
                sink: view.sink.clone(),
            }),
            RectRef::Beacon(id) => self.beacons.get(id).map(|beacon| Consumer::Beacon {
                id: beacon.id.clone(),
            }),
        }
    }

    fn consumers_with_point(&self, point: &Point) -> Vec<Consumer> {
        self.tree
            .rects_with_point(point, |_| true)
            .iter()
            .filter_map(|item| self.resolve(item))
            .collect()
    }

    fn snapshot(&self, item: &PointRef) -> Option<PointSnapshot> {
        match item {
            PointRef::Agent(id) => self.agents.get(id).map(|agent| {
                PointSnapshot::Agent(AgentSummary {
                    id: agent.id.clone(),
                    pos: agent.point,
                    public_data: agent.public_data.clone(),
                })
            }),
            PointRef::Poi(id) => self.pois.get(id).map(|poi| {
                PointSnapshot::Poi(PoiSummary {
                    id: poi.id.clone(),
                    pos: poi.point,
                    public_data: poi.public_data.clone(),
                    creator: poi.creator.clone(),
                })
            }),
        }
    }

    fn load_poi(&mut self, record: StoredPoi) {
        let id: Arc<str> = Arc::from(record.id.as_str());
        self.tree.add_point(PointRef::Poi(id.clone()), record.pos);
        self.pois.insert(
            id.clone(),
            Poi {
                id,
                public_data: record.public_data,
                creator: record.creator.map(Arc::from),
                point: record.pos,
            },
        );
    }

    fn load_beacon(&mut self, record: StoredBeacon) {
        let id: Arc<str> = Arc::from(record.id.as_str());
        let handle = self.tree.add_rect(RectRef::Beacon(id.clone()), record.pos);
        self.beacons.insert(
            id.clone(),
            AirBeacon {
                id,
                public_data: record.public_data,
                creator: record.creator.map(Arc::from),
                rect: record.pos,
                handle: Some(handle),
            },
        );
    }
}

/// The registry. Shared across sessions behind an `Arc`.
pub struct World {
    state: RwLock<WorldState>,
    persister: Box<dyn Persister>,
}

impl World {
    /// Opens the world, replaying every stored POI and beacon into the
    /// index without re-persisting.
    pub fn new(persister: Box<dyn Persister>, min_depth: usize) -> Result<Self, PersistError> {
        let stored = persister.load()?;
        let mut state = WorldState {
            agents: HashMap::new(),
            views: HashMap::new(),
            pois: HashMap::new(),
            beacons: HashMap::new(),
            tree: QuadTree::new(min_depth),
        };
        for (_, record) in stored.pois {
            state.load_poi(record);
        }
        for (_, record) in stored.air_beacons {
            state.load_beacon(record);
        }
        info!(
            "world: loaded {} POIs, {} air beacons",
            state.pois.len(),
            state.beacons.len()
        );
        Ok(Self {
            state: RwLock::new(state),
            persister,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, WorldState> {
        self.state.read().unwrap_or_else(|poisoned| {
            error!("world lock poisoned by a panicking writer");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, WorldState> {
        self.state.write().unwrap_or_else(|poisoned| {
            error!("world lock poisoned by a panicking writer");
            poisoned.into_inner()
        })
    }

    // --- agents ---

    pub fn add_agent(&self, id: &str, sink: Arc<dyn EventSink>, public_data: PublicData) {
        let mut guard = self.write();
        let state = &mut *guard;
        let id: Arc<str> = Arc::from(id);
        if let Some(old) = state.agents.remove(&id) {
            error!("[BUG] agent {id:?} added while already present; replacing");
            if let Some(point) = old.point {
                state.tree.remove_point(&PointRef::Agent(old.id.clone()), &point);
            }
        }
        state.agents.insert(
            id.clone(),
            Agent {
                id,
                sink,
                public_data,
                point: None,
            },
        );
    }

    /// Removes the agent, returning its final snapshot and the consumers
    /// that contained it (empty when it was never positioned).
    pub fn remove_agent(&self, id: &str) -> Option<(AgentSummary, Vec<Consumer>)> {
        let mut guard = self.write();
        let state = &mut *guard;
        let agent = match state.agents.remove(id) {
            Some(agent) => agent,
            None => {
                warn!("removing unknown agent {id:?}");
                return None;
            }
        };
        let consumers = match agent.point {
            Some(point) => {
                state.tree.remove_point(&PointRef::Agent(agent.id.clone()), &point);
                state.consumers_with_point(&point)
            }
            None => Vec::new(),
        };
        Some((
            AgentSummary {
                id: agent.id,
                pos: agent.point,
                public_data: agent.public_data,
            },
            consumers,
        ))
    }

    /// Moves the agent and returns the transition computed under the same
    /// lock, so no two moves can race into inconsistent deltas.
    pub fn update_agent_position(&self, id: &str, pos: Point) -> Option<AgentMove> {
        let mut guard = self.write();
        let state = &mut *guard;
        let agent = match state.agents.get_mut(id) {
            Some(agent) => agent,
            None => {
                error!("agent {id:?} not found when updating position");
                return None;
            }
        };
        let prior = agent.point;
        let item = PointRef::Agent(agent.id.clone());
        agent.point = Some(pos);
        match prior {
            None => state.tree.add_point(item, pos),
            Some(from) => state.tree.move_point(&item, &from, pos),
        }
        let agent = &state.agents[id];
        let summary = AgentSummary {
            id: agent.id.clone(),
            pos: agent.point,
            public_data: agent.public_data.clone(),
        };

        let before = match prior {
            Some(from) => state.tree.rects_with_point(&from, |_| true),
            None => HashSet::new(),
        };
        let after = state.tree.rects_with_point(&pos, |_| true);
        let mut consumers = HashMap::new();
        for item in before.iter().chain(after.iter()) {
            if !consumers.contains_key(item) {
                if let Some(consumer) = state.resolve(item) {
                    consumers.insert(item.clone(), consumer);
                }
            }
        }
        Some(AgentMove {
            prior,
            before,
            after,
            consumers,
            agent: summary,
        })
    }

    /// Replaces the agent's public data and returns the consumers that
    /// currently contain it.
    pub fn update_agent_public_data(
        &self,
        id: &str,
        public_data: PublicData,
    ) -> Option<(AgentSummary, Vec<Consumer>)> {
        let mut guard = self.write();
        let state = &mut *guard;
        let agent = match state.agents.get_mut(id) {
            Some(agent) => agent,
            None => {
                error!("agent {id:?} not found when updating public data");
                return None;
            }
        };
        agent.public_data = public_data;
        let summary = AgentSummary {
            id: agent.id.clone(),
            pos: agent.point,
            public_data: agent.public_data.clone(),
        };
        let consumers = match summary.pos {
            Some(point) => state.consumers_with_point(&point),
            None => Vec::new(),
        };
        Some((summary, consumers))
    }

    // --- views ---

    pub fn add_view(&self, id: &str, sink: Arc<dyn EventSink>) {
        let mut guard = self.write();
        let state = &mut *guard;
        let id: Arc<str> = Arc::from(id);
        if let Some(old) = state.views.remove(&id) {
            error!("[BUG] view {id:?} added while already present; replacing");
            if let Some(handle) = old.handle.as_ref() {
                state.tree.remove_rect(&RectRef::View(old.id.clone()), handle);
            }
        }
        state.views.insert(
            id.clone(),
            View {
                id,
                sink,
                rect: None,
                handle: None,
            },
        );
    }

    pub fn remove_view(&self, id: &str) {
        let mut guard = self.write();
        let state = &mut *guard;
        if let Some(view) = state.views.remove(id) {
            if let Some(handle) = view.handle.as_ref() {
                state.tree.remove_rect(&RectRef::View(view.id.clone()), handle);
            }
        }
    }

    /// Moves the view window and returns the transition computed under the
    /// same lock.
    pub fn update_view_position(&self, id: &str, rect: Rect) -> Option<ViewMove> {
        let mut guard = self.write();
        let state = &mut *guard;
        let view = match state.views.get_mut(id) {
            Some(view) => view,
            None => {
                error!("view {id:?} not found when updating position");
                return None;
            }
        };
        let prior = view.rect;
        let item = RectRef::View(view.id.clone());
        let handle = match view.handle.take() {
            Some(handle) => state.tree.move_rect(&item, &handle, rect),
            None => state.tree.add_rect(item, rect),
        };
        view.rect = Some(rect);
        view.handle = Some(handle);
        let sink = view.sink.clone();

        let before: HashSet<PointRef> = match prior {
            Some(rect) => state.tree.points_in(&rect).into_iter().collect(),
            None => HashSet::new(),
        };
        let after: HashSet<PointRef> = state.tree.points_in(&rect).into_iter().collect();
        let mut snapshots = HashMap::new();
        for item in before.iter().chain(after.iter()) {
            if !snapshots.contains_key(item) {
                if let Some(snapshot) = state.snapshot(item) {
                    snapshots.insert(item.clone(), snapshot);
                }
            }
        }
        Some(ViewMove {
            prior,
            before,
            after,
            snapshots,
            sink,
        })
    }

    // --- POIs ---

    pub fn create_poi(
        &self,
        id: &str,
        pos: Point,
        public_data: PublicData,
        creator: Option<&str>,
    ) -> Result<(PoiSummary, Vec<Consumer>), WorldError> {
        let mut guard = self.write();
        let state = &mut *guard;
        if state.pois.contains_key(id) {
            return Err(WorldError::DuplicateId {
                kind: "POI",
                id: id.to_string(),
            });
        }
        let id: Arc<str> = Arc::from(id);
        let summary = PoiSummary {
            id: id.clone(),
            pos,
            public_data: public_data.clone(),
            creator: creator.map(Arc::from),
        };
        state.tree.add_point(PointRef::Poi(id.clone()), pos);
        state.pois.insert(
            id.clone(),
            Poi {
                id: id.clone(),
                public_data,
                creator: summary.creator.clone(),
                point: pos,
            },
        );
        if let Err(err) = self.persister.persist_poi(&stored_poi(&summary)) {
            error!("failed to persist POI {id:?}: {err}");
        }
        let consumers = state.consumers_with_point(&pos);
        Ok((summary, consumers))
    }

    pub fn remove_poi(
        &self,
        id: &str,
        requester: Option<&str>,
    ) -> Result<(PoiSummary, Vec<Consumer>), WorldError> {
        let mut guard = self.write();
        let state = &mut *guard;
        let poi = state.pois.get(id).ok_or_else(|| WorldError::NotFound {
            kind: "POI",
            id: id.to_string(),
        })?;
        if let Some(user) = requester {
            if poi.creator.as_deref() != Some(user) {
                return Err(WorldError::NotCreator {
                    kind: "POI",
                    id: id.to_string(),
                });
            }
        }
        let summary = PoiSummary {
            id: poi.id.clone(),
            pos: poi.point,
            public_data: poi.public_data.clone(),
            creator: poi.creator.clone(),
        };
        // audience captured before the entity disappears
        let consumers = state.consumers_with_point(&summary.pos);
        state.tree.remove_point(&PointRef::Poi(summary.id.clone()), &summary.pos);
        state.pois.remove(id);
        if let Err(err) = self.persister.remove_poi(id) {
            error!("failed to remove POI {id:?} from storage: {err}");
        }
        Ok((summary, consumers))
    }

    // --- air beacons ---

    pub fn create_beacon(
        &self,
        id: &str,
        rect: Rect,
        public_data: PublicData,
        creator: Option<&str>,
    ) -> Result<BeaconSummary, WorldError> {
        let mut guard = self.write();
        let state = &mut *guard;
        if state.beacons.contains_key(id) {
            return Err(WorldError::DuplicateId {
                kind: "air beacon",
                id: id.to_string(),
            });
        }
        let id: Arc<str> = Arc::from(id);
        let summary = BeaconSummary {
            id: id.clone(),
            rect,
            public_data: public_data.clone(),
            creator: creator.map(Arc::from),
        };
        let handle = state.tree.add_rect(RectRef::Beacon(id.clone()), rect);
        state.beacons.insert(
            id.clone(),
            AirBeacon {
                id: id.clone(),
                public_data,
                creator: summary.creator.clone(),
                rect,
                handle: Some(handle),
            },
        );
        if let Err(err) = self.persister.persist_beacon(&stored_beacon(&summary)) {
            error!("failed to persist air beacon {id:?}: {err}");
        }
        Ok(summary)
    }

    pub fn remove_beacon(
        &self,
        id: &str,
        requester: Option<&str>,
    ) -> Result<BeaconSummary, WorldError> {
        let mut guard = self.write();
        let state = &mut *guard;
        let beacon = state.beacons.get(id).ok_or_else(|| WorldError::NotFound {
            kind: "air beacon",
            id: id.to_string(),
        })?;
        if let Some(user) = requester {
            if beacon.creator.as_deref() != Some(user) {
                return Err(WorldError::NotCreator {
                    kind: "air beacon",
                    id: id.to_string(),
                });
            }
        }
        let summary = BeaconSummary {
            id: beacon.id.clone(),
            rect: beacon.rect,
            public_data: beacon.public_data.clone(),
            creator: beacon.creator.clone(),
        };
        if let Some(beacon) = state.beacons.remove(id) {
            if let Some(handle) = beacon.handle.as_ref() {
                state.tree.remove_rect(&RectRef::Beacon(beacon.id.clone()), handle);
            }
        }
        if let Err(err) = self.persister.remove_beacon(id) {
            error!("failed to remove air beacon {id:?} from storage: {err}");
        }
        Ok(summary)
    }

    // --- reads ---

    /// Snapshots of every point-shaped entity inside `rect`.
    pub fn points_in(&self, rect: &Rect) -> Vec<PointSnapshot> {
        let state = self.read();
        state
            .tree
            .points_in(rect)
            .iter()
            .filter_map(|item| state.snapshot(item))
            .collect()
    }

    pub fn counts(&self) -> WorldCounts {
        let state = self.read();
        WorldCounts {
            agents: state.agents.len(),
            views: state.views.len(),
            pois: state.pois.len(),
            beacons: state.beacons.len(),
        }
    }

    /// The current durable store contents, for the admin dump.
    pub fn dump_store(&self) -> Result<StoredState, PersistError> {
        self.persister.load()
    }
}

fn stored_poi(summary: &PoiSummary) -> StoredPoi {
    StoredPoi {
        id: summary.id.to_string(),
        pos: summary.pos,
        public_data: summary.public_data.clone(),
        creator: summary.creator.as_ref().map(|c| c.to_string()),
    }
}

fn stored_beacon(summary: &BeaconSummary) -> StoredBeacon {
    StoredBeacon {
        id: summary.id.to_string(),
        pos: summary.rect,
        public_data: summary.public_data.clone(),
        creator: summary.creator.as_ref().map(|c| c.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventMessage;
    use crate::persist::NullPersister;

    struct NullSink;

    impl EventSink for NullSink {
        fn deliver(&self, _event: &EventMessage) {}
    }

    fn world() -> World {
        World::new(Box::new(NullPersister), 2).unwrap()
    }

    fn sink() -> Arc<dyn EventSink> {
        Arc::new(NullSink)
    }

    #[test]
    fn first_agent_position_has_no_before_set() {
        let world = world();
        world.add_view("v1", sink());
        world
            .update_view_position("v1", Rect::new(-14.0, 28.0, -12.0, 30.0))
            .unwrap();
        world.add_agent("a1", sink(), PublicData::new());

        let transition = world
            .update_agent_position("a1", Point::new(-13.0, 29.0))
            .unwrap();
        assert!(transition.prior.is_none());
        assert!(transition.before.is_empty());
        assert_eq!(transition.after.len(), 1);
        assert!(transition.after.contains(&RectRef::View(Arc::from("v1"))));
    }

    #[test]
    fn agent_move_is_classified_against_both_positions() {
        let world = world();
        world.add_view("v1", sink());
        world
            .update_view_position("v1", Rect::new(-14.0, 28.0, -12.0, 30.0))
            .unwrap();
        world.add_agent("a1", sink(), PublicData::new());
        world.update_agent_position("a1", Point::new(-13.0, 29.0)).unwrap();

        let transition = world
            .update_agent_position("a1", Point::new(0.0, 0.0))
            .unwrap();
        assert_eq!(transition.prior, Some(Point::new(-13.0, 29.0)));
        assert_eq!(transition.before.len(), 1);
        assert!(transition.after.is_empty());
    }

    #[test]
    fn duplicate_poi_is_rejected() {
        let world = world();
        world
            .create_poi("p1", Point::new(1.0, 2.0), PublicData::new(), None)
            .unwrap();
        let err = world
            .create_poi("p1", Point::new(3.0, 4.0), PublicData::new(), None)
            .unwrap_err();
        assert!(matches!(err, WorldError::DuplicateId { .. }));
        assert_eq!(world.counts().pois, 1);
    }

    #[test]
    fn poi_removal_enforces_the_creator() {
        let world = world();
        world
            .create_poi("p1", Point::new(1.0, 2.0), PublicData::new(), Some("alice"))
            .unwrap();
        let err = world.remove_poi("p1", Some("bob")).unwrap_err();
        assert!(matches!(err, WorldError::NotCreator { .. }));
        world.remove_poi("p1", Some("alice")).unwrap();
        assert!(matches!(
            world.remove_poi("p1", None).unwrap_err(),
            WorldError::NotFound { .. }
        ));
    }

    #[test]
    fn beacon_lifecycle_round_trips() {
        let world = world();
        world
            .create_beacon(
                "b1",
                Rect::new(-10.0, -10.0, 10.0, 10.0),
                PublicData::new(),
                None,
            )
            .unwrap();
        assert_eq!(world.counts().beacons, 1);

        // agent inside the beacon sees it among its consumers
        world.add_agent("a1", sink(), PublicData::new());
        let transition = world
            .update_agent_position("a1", Point::new(0.0, 0.0))
            .unwrap();
        assert!(transition.after.contains(&RectRef::Beacon(Arc::from("b1"))));

        world.remove_beacon("b1", None).unwrap();
        assert_eq!(world.counts().beacons, 0);
        let transition = world
            .update_agent_position("a1", Point::new(0.5, 0.5))
            .unwrap();
        assert!(transition.after.is_empty());
    }

    #[test]
    fn removing_an_unpositioned_agent_yields_no_audience() {
        let world = world();
        world.add_agent("a1", sink(), PublicData::new());
        let (summary, consumers) = world.remove_agent("a1").unwrap();
        assert!(summary.pos.is_none());
        assert!(consumers.is_empty());
        assert!(world.remove_agent("a1").is_none());
    }
}
