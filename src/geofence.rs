use crate::models::GeoPoint;
use serde::Serialize;
use std::env;
use tracing::warn;

const EARTH_RADIUS_KM: f64 = 6371.0;
pub const DEFAULT_MAX_DISTANCE_KM: f64 = 5.0;

/// Great-circle distance in kilometers (haversine).
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Rounded for display only; comparisons use the raw distance.
fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Debug, PartialEq)]
pub enum GeofenceError {
    /// Claimed coordinates missing or not finite numbers.
    UserLocationInvalid,
    /// The challenge record has no coordinate pair; a data-integrity bug,
    /// not a user mistake.
    ChallengeLocationInvalid,
}

#[derive(Debug, Serialize, Clone)]
pub struct GeoCheck {
    pub valid: bool,
    pub distance_km: f64,
    pub message: String,
}

/// Distance check between a claimed location and a challenge's registered
/// location. Always returns the computed (rounded) distance, valid or not.
pub fn validate(
    user: Option<GeoPoint>,
    challenge: Option<&GeoPoint>,
    max_distance_km: f64,
) -> Result<GeoCheck, GeofenceError> {
    let user = user.ok_or(GeofenceError::UserLocationInvalid)?;
    if !user.latitude.is_finite() || !user.longitude.is_finite() {
        return Err(GeofenceError::UserLocationInvalid);
    }
    let challenge = challenge.ok_or(GeofenceError::ChallengeLocationInvalid)?;

    let distance = haversine_km(
        user.latitude,
        user.longitude,
        challenge.latitude,
        challenge.longitude,
    );
    let valid = distance <= max_distance_km;
    let message = if valid {
        format!("Location verified, {} km from the challenge site", round2(distance))
    } else {
        format!(
            "Too far from the challenge site: {} km away, allowed radius is {} km",
            round2(distance),
            max_distance_km
        )
    };
    Ok(GeoCheck {
        valid,
        distance_km: round2(distance),
        message,
    })
}

/// Gate policy consulted before validation runs. Injected so deployments can
/// swap the configuration source; the refresh policy is the provider's to
/// document.
pub trait VerificationGate: Send + Sync {
    /// True when verification should be skipped for this user.
    fn bypass(&self, user_id: &str) -> bool;
    fn max_distance_km(&self) -> f64;
}

/// Environment-backed gate. Reads its variables on every call rather than
/// caching at startup, so toggling verification or the bypass list takes
/// effect without a restart. That re-parse on the hot path is a deliberate
/// trade-off: the variables are tiny and gated requests are not.
pub struct EnvGate;

impl VerificationGate for EnvGate {
    fn bypass(&self, user_id: &str) -> bool {
        if !env_flag("GEO_VERIFICATION_ENABLED", true) {
            return true;
        }
        if env_flag("TESTING_MODE", false) {
            return true;
        }
        env::var("GEO_BYPASS_USERS")
            .map(|list| list.split(',').any(|id| id.trim() == user_id))
            .unwrap_or(false)
    }

    fn max_distance_km(&self) -> f64 {
        match env::var("GEO_MAX_DISTANCE_KM") {
            Ok(raw) => match raw.trim().parse::<f64>() {
                Ok(v) if v.is_finite() && v > 0.0 => v,
                _ => {
                    // Misconfiguration must never disable the gate.
                    warn!(
                        "Invalid GEO_MAX_DISTANCE_KM value {:?}, using default {} km",
                        raw, DEFAULT_MAX_DISTANCE_KM
                    );
                    DEFAULT_MAX_DISTANCE_KM
                }
            },
            Err(_) => DEFAULT_MAX_DISTANCE_KM,
        }
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                // A typo must not silently flip the gate.
                warn!(
                    "Unrecognized {} value {:?}, using default {}",
                    key, other, default
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(latitude: f64, longitude: f64) -> GeoPoint {
        GeoPoint { latitude, longitude }
    }

    #[test]
    fn identical_points_are_zero_distance() {
        assert_eq!(haversine_km(52.52, 13.405, 52.52, 13.405), 0.0);
    }

    #[test]
    fn distance_is_symmetric() {
        let d1 = haversine_km(48.8566, 2.3522, 51.5074, -0.1278);
        let d2 = haversine_km(51.5074, -0.1278, 48.8566, 2.3522);
        assert!((d1 - d2).abs() < 1e-9);
        // Paris - London is roughly 344 km.
        assert!((d1 - 344.0).abs() < 2.0);
    }

    #[test]
    fn five_km_boundary() {
        // 0.0449 degrees of latitude is ~4.99 km, 0.0451 is ~5.01 km.
        let site = point(0.0, 0.0);
        let near = validate(Some(point(0.0449, 0.0)), Some(&site), 5.0).unwrap();
        assert!(near.valid, "at {} km", near.distance_km);
        let far = validate(Some(point(0.0451, 0.0)), Some(&site), 5.0).unwrap();
        assert!(!far.valid, "at {} km", far.distance_km);
        assert!(far.message.contains("allowed radius"));
    }

    #[test]
    fn exact_boundary_is_valid() {
        let site = point(0.0, 0.0);
        let user = point(0.0449, 0.0);
        let exact = haversine_km(user.latitude, user.longitude, site.latitude, site.longitude);
        let check = validate(Some(user), Some(&site), exact).unwrap();
        assert!(check.valid);
    }

    #[test]
    fn missing_locations_are_rejected() {
        let site = point(1.0, 1.0);
        assert_eq!(
            validate(None, Some(&site), 5.0).unwrap_err(),
            GeofenceError::UserLocationInvalid
        );
        assert_eq!(
            validate(Some(point(f64::NAN, 0.0)), Some(&site), 5.0).unwrap_err(),
            GeofenceError::UserLocationInvalid
        );
        assert_eq!(
            validate(Some(point(1.0, 1.0)), None, 5.0).unwrap_err(),
            GeofenceError::ChallengeLocationInvalid
        );
    }

    #[test]
    fn unparseable_flag_keeps_the_default() {
        // Unique var name so parallel tests cannot interfere.
        std::env::set_var("GEOFENCE_FLAG_TEST_A", "enabled");
        assert!(env_flag("GEOFENCE_FLAG_TEST_A", true));
        assert!(!env_flag("GEOFENCE_FLAG_TEST_A", false));
        std::env::set_var("GEOFENCE_FLAG_TEST_A", "false");
        assert!(!env_flag("GEOFENCE_FLAG_TEST_A", true));
        std::env::set_var("GEOFENCE_FLAG_TEST_A", "on");
        assert!(env_flag("GEOFENCE_FLAG_TEST_A", false));
        std::env::remove_var("GEOFENCE_FLAG_TEST_A");
        assert!(env_flag("GEOFENCE_FLAG_TEST_A", true));
    }

    #[test]
    fn invalid_distance_config_falls_back_to_default() {
        std::env::set_var("GEO_MAX_DISTANCE_KM", "not-a-number");
        assert_eq!(EnvGate.max_distance_km(), DEFAULT_MAX_DISTANCE_KM);
        std::env::set_var("GEO_MAX_DISTANCE_KM", "7.5");
        assert_eq!(EnvGate.max_distance_km(), 7.5);
        std::env::remove_var("GEO_MAX_DISTANCE_KM");
        assert_eq!(EnvGate.max_distance_km(), DEFAULT_MAX_DISTANCE_KM);
    }
}
