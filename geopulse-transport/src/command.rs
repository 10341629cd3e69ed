//! The inbound session command protocol.
//!
//! A single JSON object carries zero or more optional fields; each present
//! field triggers its handler if the session's capabilities permit it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use geopulse_core::entity::PublicData;
use geopulse_core::geo::{Point, Rect};

#[derive(Error, Debug, PartialEq)]
pub enum CommandError {
    #[error("invalid agentPosition")]
    InvalidAgentPosition,
    #[error("invalid viewPosition")]
    InvalidViewPosition,
    #[error("invalid POI position")]
    InvalidPoiPosition,
    #[error("invalid POI id")]
    MissingPoiId,
    #[error("invalid air beacon position")]
    InvalidBeaconPosition,
    #[error("invalid air beacon id")]
    MissingBeaconId,
}

/// POI payload used by both the session protocol and the admin HTTP body.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PoiCommand {
    pub poi_id: Option<String>,
    pub pos: Option<Point>,
    #[serde(rename = "publicData")]
    pub public_data: Option<PublicData>,
    pub creator: Option<String>,
}

/// Air-beacon payload used by both the session protocol and the admin HTTP
/// body.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BeaconCommand {
    pub ab_id: Option<String>,
    pub pos: Option<Rect>,
    #[serde(rename = "publicData")]
    pub public_data: Option<PublicData>,
    pub creator: Option<String>,
}

/// One session message. All fields optional; absent fields are no-ops.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct SessionCommand {
    #[serde(rename = "agentPosition")]
    pub agent_position: Option<Point>,
    #[serde(rename = "publicData")]
    pub public_data: Option<PublicData>,
    #[serde(rename = "viewPosition")]
    pub view_position: Option<Rect>,
    #[serde(rename = "createPOI")]
    pub create_poi: Option<PoiCommand>,
    #[serde(rename = "removePOI")]
    pub remove_poi: Option<PoiCommand>,
    #[serde(rename = "createAirBeacon")]
    pub create_air_beacon: Option<BeaconCommand>,
    #[serde(rename = "removeAirBeacon")]
    pub remove_air_beacon: Option<BeaconCommand>,
}

impl SessionCommand {
    /// Validates the present fields, normalizing a reversed view window
    /// (`x1 >= x2`) into the full longitudinal band before checking it.
    pub fn check(&mut self) -> Result<(), CommandError> {
        if let Some(pos) = &self.agent_position {
            if !pos.is_valid() {
                return Err(CommandError::InvalidAgentPosition);
            }
        }
        if let Some(view) = self.view_position.as_mut() {
            if view.x1 >= view.x2 {
                view.x1 = -180.0;
                view.x2 = 180.0;
            }
            if !view.is_valid() {
                return Err(CommandError::InvalidViewPosition);
            }
        }
        if let Some(poi) = &self.create_poi {
            if poi.poi_id.is_none() {
                return Err(CommandError::MissingPoiId);
            }
            match &poi.pos {
                Some(pos) if pos.is_valid() => {}
                _ => return Err(CommandError::InvalidPoiPosition),
            }
        }
        if let Some(poi) = &self.remove_poi {
            if poi.poi_id.is_none() {
                return Err(CommandError::MissingPoiId);
            }
        }
        if let Some(beacon) = &self.create_air_beacon {
            if beacon.ab_id.is_none() {
                return Err(CommandError::MissingBeaconId);
            }
            match &beacon.pos {
                Some(pos) if pos.is_valid() => {}
                _ => return Err(CommandError::InvalidBeaconPosition),
            }
        }
        if let Some(beacon) = &self.remove_air_beacon {
            if beacon.ab_id.is_none() {
                return Err(CommandError::MissingBeaconId);
            }
        }
        Ok(())
    }
}

/// Immediate error reply, written outside the batch.
#[derive(Serialize, Debug, Clone)]
pub struct ErrorReply {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorReply {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: Some(message.into()),
        }
    }

    pub fn simple(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_combined_command() {
        let mut command: SessionCommand = serde_json::from_str(
            r#"{
                "agentPosition": [-13, 29],
                "viewPosition": [-14, 28, -12, 30],
                "publicData": {"name": "walker"}
            }"#,
        )
        .unwrap();
        command.check().unwrap();
        assert_eq!(command.agent_position, Some(Point::new(-13.0, 29.0)));
        assert_eq!(command.view_position, Some(Rect::new(-14.0, 28.0, -12.0, 30.0)));
        assert!(command.public_data.unwrap().contains_key("name"));
    }

    #[test]
    fn rejects_an_out_of_world_agent_position() {
        let mut command: SessionCommand =
            serde_json::from_str(r#"{"agentPosition": [200, 29]}"#).unwrap();
        assert_eq!(command.check(), Err(CommandError::InvalidAgentPosition));
    }

    #[test]
    fn reversed_view_becomes_the_full_band() {
        let mut command: SessionCommand =
            serde_json::from_str(r#"{"viewPosition": [10, 20, -10, 30]}"#).unwrap();
        command.check().unwrap();
        assert_eq!(command.view_position, Some(Rect::new(-180.0, 20.0, 180.0, 30.0)));
    }

    #[test]
    fn poi_commands_require_an_id_and_a_valid_position() {
        let mut command: SessionCommand =
            serde_json::from_str(r#"{"createPOI": {"pos": [1, 2]}}"#).unwrap();
        assert_eq!(command.check(), Err(CommandError::MissingPoiId));

        let mut command: SessionCommand =
            serde_json::from_str(r#"{"createPOI": {"poi_id": "p1", "pos": [1, 91]}}"#).unwrap();
        assert_eq!(command.check(), Err(CommandError::InvalidPoiPosition));

        let mut command: SessionCommand =
            serde_json::from_str(r#"{"removePOI": {}}"#).unwrap();
        assert_eq!(command.check(), Err(CommandError::MissingPoiId));
    }

    #[test]
    fn beacon_commands_require_an_id_and_a_valid_position() {
        let mut command: SessionCommand = serde_json::from_str(
            r#"{"createAirBeacon": {"ab_id": "b1", "pos": [-10, -10, 10, 10]}}"#,
        )
        .unwrap();
        command.check().unwrap();

        let mut command: SessionCommand =
            serde_json::from_str(r#"{"removeAirBeacon": {}}"#).unwrap();
        assert_eq!(command.check(), Err(CommandError::MissingBeaconId));
    }

    #[test]
    fn error_reply_wire_shape() {
        let reply = ErrorReply::new("Invalid Command", "invalid viewPosition");
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            serde_json::json!({"error": "Invalid Command", "message": "invalid viewPosition"})
        );
        let simple = ErrorReply::simple("View size error");
        assert_eq!(
            serde_json::to_value(&simple).unwrap(),
            serde_json::json!({"error": "View size error"})
        );
    }
}
