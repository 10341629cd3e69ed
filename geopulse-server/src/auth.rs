//! Capability tokens: HMAC-signed JWTs carrying the session's identity and
//! what it is allowed to do.

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use geopulse_core::entity::PublicData;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token expired")]
    Expired,
    #[error("token grants no capabilities")]
    NoCapabilities,
}

/// The `caps` claim: boolean capabilities plus size limits.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Capabilities {
    pub produce: bool,
    pub consume: bool,
    #[serde(rename = "createPOI")]
    pub create_poi: bool,
    #[serde(rename = "createAirBeacon")]
    pub create_air_beacon: bool,
    #[serde(rename = "sendEvents")]
    pub send_events: bool,
    #[serde(rename = "receiveEvents")]
    pub receive_events: bool,
    /// Maximum view window size, `[width, height]`.
    #[serde(rename = "maxView")]
    pub max_view: [f64; 2],
    /// Maximum air-beacon size, `[width, height]`.
    #[serde(rename = "maxAirBeacon")]
    pub max_air_beacon: [f64; 2],
    pub http: bool,
}

impl Capabilities {
    fn grants_anything(&self) -> bool {
        self.produce || self.consume || self.create_poi || self.create_air_beacon
    }
}

/// The full token payload.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Claims {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "viewId")]
    pub view_id: String,
    #[serde(rename = "publicProperties")]
    pub public_properties: PublicData,
    #[serde(rename = "caps")]
    pub capabilities: Capabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Verifies an HMAC-signed token and normalizes its capabilities. Any
/// non-HMAC algorithm is rejected; `exp` is honored when present but not
/// required; zero size limits default to `[1, 1]`.
pub fn verify(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let key = DecodingKey::from_secret(secret.as_bytes());
    let data = jsonwebtoken::decode::<Claims>(token, &key, &validation)?;
    let mut claims = data.claims;

    if let Some(exp) = claims.exp {
        if exp < now() {
            return Err(AuthError::Expired);
        }
    }
    if !claims.capabilities.grants_anything() {
        return Err(AuthError::NoCapabilities);
    }
    if claims.capabilities.max_view[0] == 0.0 {
        claims.capabilities.max_view = [1.0, 1.0];
    }
    if claims.capabilities.max_air_beacon[0] == 0.0 {
        claims.capabilities.max_air_beacon = [1.0, 1.0];
    }
    Ok(claims)
}

/// Signs an all-capability token for development use.
pub fn dev_token(
    secret: &str,
    agent_id: &str,
    view_id: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        agent_id: agent_id.to_string(),
        view_id: view_id.to_string(),
        public_properties: PublicData::new(),
        capabilities: Capabilities {
            produce: true,
            consume: true,
            create_poi: true,
            create_air_beacon: true,
            send_events: true,
            receive_events: true,
            max_view: [360.0, 180.0],
            max_air_beacon: [360.0, 180.0],
            http: true,
        },
        exp: None,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_token_round_trips() {
        let token = dev_token("developmentKey", "a1", "v1").unwrap();
        let claims = verify(&token, "developmentKey").unwrap();
        assert_eq!(claims.agent_id, "a1");
        assert_eq!(claims.view_id, "v1");
        assert!(claims.capabilities.produce);
        assert!(claims.capabilities.http);
        assert_eq!(claims.capabilities.max_view, [360.0, 180.0]);
    }

    #[test]
    fn a_wrong_secret_is_rejected() {
        let token = dev_token("developmentKey", "a1", "v1").unwrap();
        assert!(matches!(
            verify(&token, "otherKey"),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn a_capability_less_token_is_rejected() {
        let claims = Claims::default();
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"developmentKey"),
        )
        .unwrap();
        assert!(matches!(
            verify(&token, "developmentKey"),
            Err(AuthError::NoCapabilities)
        ));
    }

    #[test]
    fn zero_size_limits_default_to_one_by_one() {
        let claims = Claims {
            capabilities: Capabilities {
                produce: true,
                ..Capabilities::default()
            },
            ..Claims::default()
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"developmentKey"),
        )
        .unwrap();
        let verified = verify(&token, "developmentKey").unwrap();
        assert_eq!(verified.capabilities.max_view, [1.0, 1.0]);
        assert_eq!(verified.capabilities.max_air_beacon, [1.0, 1.0]);
    }

    #[test]
    fn an_expired_token_is_rejected() {
        let claims = Claims {
            capabilities: Capabilities {
                produce: true,
                ..Capabilities::default()
            },
            exp: Some(1),
            ..Claims::default()
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"developmentKey"),
        )
        .unwrap();
        assert!(matches!(
            verify(&token, "developmentKey"),
            Err(AuthError::Expired)
        ));
    }
}
