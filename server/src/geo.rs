use serde::{Deserialize, Serialize};
use std::fmt;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Default distance a fix has to move before downstream data is recomputed.
pub const DEFAULT_MOVEMENT_THRESHOLD_M: f64 = 500.0;

/// Finest bucket precision in decimal degrees (about 1 mm). Beyond this the
/// rounding factor overflows and every position lands in one bucket.
pub const MAX_KEY_PRECISION: u32 = 8;

/// A captured position. Superseded by the next fix, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_coordinates(self.latitude, self.longitude)
    }

    /// Key fragment rounded to `precision` decimal degrees so that jittery
    /// fixes around the same spot share a cache entry.
    pub fn bucket_key(&self, precision: u32) -> String {
        let p = precision as usize;
        format!(
            "{:.*}_{:.*}",
            p,
            round_to(self.latitude, precision),
            p,
            round_to(self.longitude, precision)
        )
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.5}, {:.5})", self.latitude, self.longitude)
    }
}

fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    let rounded = (value * factor).round() / factor;
    // collapse -0.0 so both sides of the equator/meridian share a bucket
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Validate latitude and longitude coordinates
pub fn validate_coordinates(lat: f64, lon: f64) -> Result<(), String> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(format!("Invalid latitude: {}. Must be between -90 and 90", lat));
    }
    if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
        return Err(format!("Invalid longitude: {}. Must be between -180 and 180", lon));
    }
    Ok(())
}

/// Great-circle distance in meters using the Haversine formula.
pub fn distance_meters(a: &Coordinates, b: &Coordinates) -> f64 {
    if a == b {
        return 0.0;
    }

    let lat1_rad = a.latitude.to_radians();
    let lat2_rad = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lon = (b.longitude - a.longitude).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// The first fix is always significant; after that only moves of at least
/// `threshold_m` count.
pub fn is_significant_movement(
    previous: Option<&Coordinates>,
    next: &Coordinates,
    threshold_m: f64,
) -> bool {
    match previous {
        None => true,
        Some(prev) => distance_meters(prev, next) >= threshold_m,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn coord() -> impl Strategy<Value = Coordinates> {
        (-89.0f64..89.0, -179.0f64..179.0).prop_map(|(lat, lon)| Coordinates::new(lat, lon))
    }

    #[test]
    fn test_validate_coordinates() {
        assert!(validate_coordinates(0.0, 0.0).is_ok());
        assert!(validate_coordinates(90.0, 180.0).is_ok());
        assert!(validate_coordinates(-90.0, -180.0).is_ok());
        assert!(validate_coordinates(91.0, 0.0).is_err());
        assert!(validate_coordinates(0.0, 181.0).is_err());
        assert!(validate_coordinates(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_distance_known_pair() {
        // Berlin Alexanderplatz to Brandenburg Gate, roughly 2.5 km
        let alex = Coordinates::new(52.5219, 13.4132);
        let gate = Coordinates::new(52.5163, 13.3777);
        let d = distance_meters(&alex, &gate);
        assert!((d - 2480.0).abs() < 150.0, "got {}", d);
    }

    #[test]
    fn test_first_fix_is_significant() {
        assert!(is_significant_movement(None, &Coordinates::new(52.0, 13.0), 500.0));
    }

    #[test]
    fn test_identical_fix_is_not_significant() {
        let p = Coordinates::new(52.0, 13.0);
        assert!(!is_significant_movement(Some(&p), &Coordinates::new(52.0, 13.0), 500.0));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let a = Coordinates::new(52.0, 13.0);
        let b = Coordinates::new(52.01, 13.0);
        let d = distance_meters(&a, &b);
        assert!(is_significant_movement(Some(&a), &b, d));
        assert!(!is_significant_movement(Some(&a), &b, d + 1.0));
    }

    #[test]
    fn test_bucket_key_rounding() {
        let a = Coordinates::new(52.52001, 13.40499);
        let b = Coordinates::new(52.51996, 13.40502);
        assert_eq!(a.bucket_key(3), "52.520_13.405");
        assert_eq!(a.bucket_key(3), b.bucket_key(3));
        assert_ne!(a.bucket_key(5), b.bucket_key(5));
        assert_eq!(Coordinates::new(-0.0001, 0.0).bucket_key(3), "0.000_0.000");
    }

    #[test]
    fn test_bucket_key_at_max_precision_stays_finite() {
        let berlin = Coordinates::new(52.52, 13.405).bucket_key(MAX_KEY_PRECISION);
        let sydney = Coordinates::new(-33.8688, 151.2093).bucket_key(MAX_KEY_PRECISION);
        assert!(!berlin.contains("NaN") && !berlin.contains("inf"), "{}", berlin);
        assert_ne!(berlin, sydney);
    }

    proptest! {
        #[test]
        fn prop_distance_to_self_is_zero(a in coord()) {
            prop_assert_eq!(distance_meters(&a, &a), 0.0);
        }

        #[test]
        fn prop_distance_is_symmetric(a in coord(), b in coord()) {
            let ab = distance_meters(&a, &b);
            let ba = distance_meters(&b, &a);
            prop_assert!((ab - ba).abs() < 1e-6, "{} vs {}", ab, ba);
        }

        #[test]
        fn prop_first_fix_always_significant(a in coord(), threshold in 0.0f64..1e6) {
            prop_assert!(is_significant_movement(None, &a, threshold));
        }
    }
}
