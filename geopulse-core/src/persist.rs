//! Durable storage for POIs and air beacons.
//!
//! The registry calls a [`Persister`] on every durable mutation and replays
//! the whole store once at startup. Record field names are part of the
//! on-disk format.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::PublicData;
use crate::geo::{Point, Rect};

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("storage encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stored POI record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredPoi {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Pos")]
    pub pos: Point,
    #[serde(rename = "PublicData")]
    pub public_data: PublicData,
    #[serde(rename = "Creator")]
    pub creator: Option<String>,
}

/// Stored air-beacon record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredBeacon {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Pos")]
    pub pos: Rect,
    #[serde(rename = "PublicData")]
    pub public_data: PublicData,
    #[serde(rename = "Creator")]
    pub creator: Option<String>,
}

/// The two keyed collections a store holds, keyed by entity id.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StoredState {
    pub pois: BTreeMap<String, StoredPoi>,
    #[serde(rename = "airBeacons")]
    pub air_beacons: BTreeMap<String, StoredBeacon>,
}

/// Storage backend for the durable entities.
pub trait Persister: Send + Sync {
    fn load(&self) -> Result<StoredState, PersistError>;
    fn persist_poi(&self, poi: &StoredPoi) -> Result<(), PersistError>;
    fn remove_poi(&self, id: &str) -> Result<(), PersistError>;
    fn persist_beacon(&self, beacon: &StoredBeacon) -> Result<(), PersistError>;
    fn remove_beacon(&self, id: &str) -> Result<(), PersistError>;
}

/// Backend for deployments without durable state.
pub struct NullPersister;

impl Persister for NullPersister {
    fn load(&self) -> Result<StoredState, PersistError> {
        Ok(StoredState::default())
    }

    fn persist_poi(&self, _poi: &StoredPoi) -> Result<(), PersistError> {
        Ok(())
    }

    fn remove_poi(&self, _id: &str) -> Result<(), PersistError> {
        Ok(())
    }

    fn persist_beacon(&self, _beacon: &StoredBeacon) -> Result<(), PersistError> {
        Ok(())
    }

    fn remove_beacon(&self, _id: &str) -> Result<(), PersistError> {
        Ok(())
    }
}

/// Single-file JSON store. Keeps the state in memory and rewrites the file
/// through a temp-file rename on every mutation, so a crash can only leave
/// the previous complete state behind.
pub struct JsonFilePersister {
    path: PathBuf,
    state: Mutex<StoredState>,
}

impl JsonFilePersister {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => StoredState::default(),
            Err(err) => return Err(err.into()),
        };
        info!("storage: opened {}", path.display());
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoredState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self, state: &StoredState) -> Result<(), PersistError> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(state)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Persister for JsonFilePersister {
    fn load(&self) -> Result<StoredState, PersistError> {
        Ok(self.lock().clone())
    }

    fn persist_poi(&self, poi: &StoredPoi) -> Result<(), PersistError> {
        let mut state = self.lock();
        state.pois.insert(poi.id.clone(), poi.clone());
        self.write(&state)
    }

    fn remove_poi(&self, id: &str) -> Result<(), PersistError> {
        let mut state = self.lock();
        state.pois.remove(id);
        self.write(&state)
    }

    fn persist_beacon(&self, beacon: &StoredBeacon) -> Result<(), PersistError> {
        let mut state = self.lock();
        state.air_beacons.insert(beacon.id.clone(), beacon.clone());
        self.write(&state)
    }

    fn remove_beacon(&self, id: &str) -> Result<(), PersistError> {
        let mut state = self.lock();
        state.air_beacons.remove(id);
        self.write(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poi(id: &str, x: f64, y: f64) -> StoredPoi {
        StoredPoi {
            id: id.to_string(),
            pos: Point::new(x, y),
            public_data: PublicData::new(),
            creator: Some("tester".to_string()),
        }
    }

    #[test]
    fn file_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = JsonFilePersister::open(&path).unwrap();
        store.persist_poi(&poi("p1", -13.0, 29.0)).unwrap();
        store
            .persist_beacon(&StoredBeacon {
                id: "b1".to_string(),
                pos: Rect::new(-10.0, -10.0, 10.0, 10.0),
                public_data: PublicData::new(),
                creator: None,
            })
            .unwrap();
        drop(store);

        let reopened = JsonFilePersister::open(&path).unwrap();
        let state = reopened.load().unwrap();
        assert_eq!(state.pois.len(), 1);
        assert_eq!(state.pois["p1"], poi("p1", -13.0, 29.0));
        assert_eq!(state.air_beacons.len(), 1);

        reopened.remove_poi("p1").unwrap();
        drop(reopened);
        let state = JsonFilePersister::open(&path).unwrap().load().unwrap();
        assert!(state.pois.is_empty());
        assert_eq!(state.air_beacons.len(), 1);
    }

    #[test]
    fn missing_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFilePersister::open(dir.path().join("absent.json")).unwrap();
        assert_eq!(store.load().unwrap(), StoredState::default());
    }

    #[test]
    fn record_field_names_are_stable() {
        let json = serde_json::to_value(poi("p1", 1.0, 2.0)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"ID": "p1", "Pos": [1.0, 2.0], "PublicData": {}, "Creator": "tester"})
        );
    }

    #[test]
    fn removing_absent_records_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFilePersister::open(dir.path().join("store.json")).unwrap();
        store.remove_poi("ghost").unwrap();
        store.remove_beacon("ghost").unwrap();
    }
}
