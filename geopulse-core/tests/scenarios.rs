//! End-to-end dispatcher scenarios with recording sinks in place of live
//! sessions and webhooks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use geopulse_core::dispatch::Dispatcher;
use geopulse_core::entity::PublicData;
use geopulse_core::events::{BeaconNotifier, EventMessage, EventSink};
use geopulse_core::geo::{Point, Rect, WORLD};
use geopulse_core::persist::{
    JsonFilePersister, NullPersister, PersistError, Persister, StoredBeacon, StoredPoi,
    StoredState,
};
use geopulse_core::registry::World;
use serde_json::json;

#[derive(Default)]
struct RecordingSink(Mutex<Vec<EventMessage>>);

impl EventSink for RecordingSink {
    fn deliver(&self, event: &EventMessage) {
        self.0.lock().unwrap().push(event.clone());
    }
}

impl RecordingSink {
    fn take(&self) -> Vec<serde_json::Value> {
        self.0
            .lock()
            .unwrap()
            .drain(..)
            .map(|event| serde_json::to_value(&event).unwrap())
            .collect()
    }
}

#[derive(Default)]
struct RecordingNotifier(Mutex<Vec<(String, serde_json::Value)>>);

impl BeaconNotifier for RecordingNotifier {
    fn notify(&self, beacon_id: &str, event: &EventMessage) {
        self.0.lock().unwrap().push((
            beacon_id.to_string(),
            serde_json::to_value(event).unwrap(),
        ));
    }
}

impl RecordingNotifier {
    fn take(&self) -> Vec<(String, serde_json::Value)> {
        self.0.lock().unwrap().drain(..).collect()
    }
}

struct Fixture {
    dispatcher: Dispatcher,
    sink: Arc<RecordingSink>,
    webhooks: Arc<RecordingNotifier>,
}

fn fixture() -> Fixture {
    let world = Arc::new(World::new(Box::new(NullPersister), 5).unwrap());
    let webhooks = Arc::new(RecordingNotifier::default());
    let dispatcher = Dispatcher::new(world, Some(webhooks.clone()));
    Fixture {
        dispatcher,
        sink: Arc::new(RecordingSink::default()),
        webhooks,
    }
}

/// Registers a view subscribed to the given window, draining the initial
/// (empty-world) notifications.
fn subscribe(f: &Fixture, id: &str, rect: Rect) {
    f.dispatcher.world().add_view(id, f.sink.clone());
    f.dispatcher.view_move(id, rect);
    f.sink.take();
}

#[test]
fn agent_entering_a_view_is_announced() {
    let f = fixture();
    subscribe(&f, "v1", Rect::new(-14.0, 28.0, -12.0, 30.0));

    f.dispatcher.world().add_agent("a1", f.sink.clone(), PublicData::new());
    f.dispatcher.agent_move("a1", Point::new(-13.0, 29.0));

    assert_eq!(
        f.sink.take(),
        vec![json!({"agent_id": "a1", "pos": [-13.0, 29.0], "publicData": {}, "entered": true})]
    );
}

#[test]
fn agent_leaving_a_view_is_announced_once() {
    let f = fixture();
    subscribe(&f, "v1", Rect::new(-14.0, 28.0, -12.0, 30.0));
    f.dispatcher.world().add_agent("a1", f.sink.clone(), PublicData::new());
    f.dispatcher.agent_move("a1", Point::new(-13.0, 29.0));
    f.sink.take();

    f.dispatcher.agent_move("a1", Point::new(0.0, 0.0));
    assert_eq!(f.sink.take(), vec![json!({"agent_id": "a1", "left": true})]);
}

#[test]
fn agent_moving_within_a_view_sends_a_bare_position() {
    let f = fixture();
    subscribe(&f, "v1", Rect::new(-14.0, 28.0, -12.0, 30.0));
    f.dispatcher.world().add_agent("a1", f.sink.clone(), PublicData::new());
    f.dispatcher.agent_move("a1", Point::new(-13.0, 29.0));
    f.sink.take();

    f.dispatcher.agent_move("a1", Point::new(-13.5, 29.5));
    assert_eq!(
        f.sink.take(),
        vec![json!({"agent_id": "a1", "pos": [-13.5, 29.5]})]
    );
}

#[test]
fn beacons_get_enter_and_leave_but_never_moved() {
    let f = fixture();
    f.dispatcher
        .world()
        .create_beacon("b1", Rect::new(-20.0, 20.0, -10.0, 32.0), PublicData::new(), None)
        .unwrap();

    f.dispatcher.world().add_agent("a1", f.sink.clone(), PublicData::new());
    f.dispatcher.agent_move("a1", Point::new(-13.0, 29.0));
    let entered = f.webhooks.take();
    assert_eq!(entered.len(), 1);
    assert_eq!(entered[0].0, "b1");
    assert_eq!(entered[0].1["entered"], json!(true));

    // still inside: no webhook traffic for intra-region moves
    f.dispatcher.agent_move("a1", Point::new(-13.5, 29.5));
    assert!(f.webhooks.take().is_empty());

    f.dispatcher.agent_move("a1", Point::new(100.0, 0.0));
    let left = f.webhooks.take();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].1["left"], json!(true));
}

#[test]
fn split_beacon_notifies_once_per_crossing() {
    let f = fixture();
    // straddles the world center: stored under four index nodes
    f.dispatcher
        .world()
        .create_beacon("b1", Rect::new(-10.0, -10.0, 10.0, 10.0), PublicData::new(), None)
        .unwrap();

    f.dispatcher.world().add_agent("a1", f.sink.clone(), PublicData::new());
    f.dispatcher.agent_move("a1", Point::new(0.0, 0.0));
    assert_eq!(f.webhooks.take().len(), 1);
}

#[test]
fn view_window_move_swaps_the_visible_set() {
    let f = fixture();
    let world = f.dispatcher.world();
    world
        .create_poi("west", Point::new(-100.0, 0.0), PublicData::new(), None)
        .unwrap();
    world
        .create_poi("east", Point::new(100.0, 0.0), PublicData::new(), None)
        .unwrap();

    subscribe(&f, "v1", Rect::new(-110.0, -10.0, -90.0, 10.0));
    f.dispatcher.view_move("v1", Rect::new(-110.0, -10.0, -90.0, 10.0));
    // unchanged window: the still-visible POI is not re-announced
    assert!(f.sink.take().is_empty());

    f.dispatcher.view_move("v1", Rect::new(90.0, -10.0, 110.0, 10.0));
    let events = f.sink.take();
    assert_eq!(events.len(), 2);
    assert!(events.contains(&json!({"poi_id": "west", "left": true})));
    assert!(events
        .iter()
        .any(|e| e["poi_id"] == json!("east") && e["entered"] == json!(true)));
}

#[test]
fn poi_lifecycle_broadcasts_to_containing_views() {
    let f = fixture();
    subscribe(&f, "v1", Rect::new(-14.0, 28.0, -12.0, 30.0));

    f.dispatcher
        .create_poi("p1", Point::new(-13.0, 29.0), PublicData::new(), Some("alice"))
        .unwrap();
    assert_eq!(
        f.sink.take(),
        vec![json!({
            "poi_id": "p1",
            "pos": [-13.0, 29.0],
            "publicData": {},
            "creator": "alice",
            "entered": true
        })]
    );

    f.dispatcher.remove_poi("p1", Some("alice")).unwrap();
    assert_eq!(f.sink.take(), vec![json!({"poi_id": "p1", "left": true})]);
}

#[test]
fn agent_public_data_update_reaches_containing_views() {
    let f = fixture();
    subscribe(&f, "v1", Rect::new(-14.0, 28.0, -12.0, 30.0));
    f.dispatcher.world().add_agent("a1", f.sink.clone(), PublicData::new());
    f.dispatcher.agent_move("a1", Point::new(-13.0, 29.0));
    f.sink.take();

    let mut data = PublicData::new();
    data.insert("name".to_string(), json!("walker"));
    f.dispatcher.agent_public_data("a1", data);
    assert_eq!(
        f.sink.take(),
        vec![json!({"agent_id": "a1", "pos": [-13.0, 29.0], "publicData": {"name": "walker"}})]
    );
}

#[test]
fn disconnect_broadcasts_left_from_the_last_position() {
    let f = fixture();
    subscribe(&f, "v1", Rect::new(-14.0, 28.0, -12.0, 30.0));
    f.dispatcher.world().add_agent("a1", f.sink.clone(), PublicData::new());
    f.dispatcher.agent_move("a1", Point::new(-13.0, 29.0));
    f.sink.take();

    f.dispatcher.agent_disconnected("a1");
    assert_eq!(f.sink.take(), vec![json!({"agent_id": "a1", "left": true})]);

    // an agent that never had a position leaves silently
    f.dispatcher.world().add_agent("a2", f.sink.clone(), PublicData::new());
    f.dispatcher.agent_disconnected("a2");
    assert!(f.sink.take().is_empty());
}

struct CountingPersister {
    stored: StoredState,
    poi_writes: AtomicUsize,
    beacon_writes: AtomicUsize,
}

impl Persister for CountingPersister {
    fn load(&self) -> Result<StoredState, PersistError> {
        Ok(self.stored.clone())
    }

    fn persist_poi(&self, _poi: &StoredPoi) -> Result<(), PersistError> {
        self.poi_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove_poi(&self, _id: &str) -> Result<(), PersistError> {
        Ok(())
    }

    fn persist_beacon(&self, _beacon: &StoredBeacon) -> Result<(), PersistError> {
        self.beacon_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove_beacon(&self, _id: &str) -> Result<(), PersistError> {
        Ok(())
    }
}

#[test]
fn startup_replay_does_not_re_persist() {
    let mut stored = StoredState::default();
    for i in 0..50 {
        let id = format!("p{i}");
        stored.pois.insert(
            id.clone(),
            StoredPoi {
                id,
                pos: Point::new(-170.0 + i as f64 * 3.0, 10.0),
                public_data: PublicData::new(),
                creator: None,
            },
        );
    }
    let persister = Arc::new(CountingPersister {
        stored,
        poi_writes: AtomicUsize::new(0),
        beacon_writes: AtomicUsize::new(0),
    });

    struct Shared(Arc<CountingPersister>);
    impl Persister for Shared {
        fn load(&self) -> Result<StoredState, PersistError> {
            self.0.load()
        }
        fn persist_poi(&self, poi: &StoredPoi) -> Result<(), PersistError> {
            self.0.persist_poi(poi)
        }
        fn remove_poi(&self, id: &str) -> Result<(), PersistError> {
            self.0.remove_poi(id)
        }
        fn persist_beacon(&self, beacon: &StoredBeacon) -> Result<(), PersistError> {
            self.0.persist_beacon(beacon)
        }
        fn remove_beacon(&self, id: &str) -> Result<(), PersistError> {
            self.0.remove_beacon(id)
        }
    }

    let world = World::new(Box::new(Shared(persister.clone())), 5).unwrap();
    assert_eq!(world.points_in(&WORLD).len(), 50);
    assert_eq!(persister.poi_writes.load(Ordering::SeqCst), 0);
    assert_eq!(persister.beacon_writes.load(Ordering::SeqCst), 0);
}

#[test]
fn file_backed_state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");

    {
        let world = World::new(Box::new(JsonFilePersister::open(&path).unwrap()), 5).unwrap();
        for i in 0..50 {
            world
                .create_poi(&format!("p{i}"), Point::new(i as f64, 10.0), PublicData::new(), None)
                .unwrap();
        }
        world
            .create_beacon(
                "b1",
                Rect::new(-10.0, -10.0, 10.0, 10.0),
                PublicData::new(),
                None,
            )
            .unwrap();
    }

    let world = World::new(Box::new(JsonFilePersister::open(&path).unwrap()), 5).unwrap();
    let counts = world.counts();
    assert_eq!(counts.pois, 50);
    assert_eq!(counts.beacons, 1);
    assert_eq!(world.points_in(&WORLD).len(), 50);
}
