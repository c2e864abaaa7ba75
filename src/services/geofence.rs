use thiserror::Error;

/// Mean Earth radius in meters (IUGG).
const EARTH_RADIUS_M: f64 = 6_371_008.8;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeofenceError {
    #[error("invalid coordinate: lat {latitude}, lon {longitude}")]
    InvalidCoordinate { latitude: f64, longitude: f64 },
}

/// A validated WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, GeofenceError> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        if !valid {
            return Err(GeofenceError::InvalidCoordinate {
                latitude,
                longitude,
            });
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

/// Great-circle distance in meters between two coordinates (haversine).
///
/// Geofence radii are tens of meters, so a flat Euclidean approximation over
/// degrees is not acceptable here.
pub fn distance_meters(a: Coordinate, b: Coordinate) -> f64 {
    let phi_a = a.latitude.to_radians();
    let phi_b = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2)
        + phi_a.cos() * phi_b.cos() * (d_lambda / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Whether `point` lies within `radius_m` meters of `center`.
pub fn within_radius(center: Coordinate, point: Coordinate, radius_m: f64) -> bool {
    distance_meters(center, point) <= radius_m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(Coordinate::new(91.0, 0.0).is_err());
        assert!(Coordinate::new(-91.0, 0.0).is_err());
        assert!(Coordinate::new(0.0, 181.0).is_err());
        assert!(Coordinate::new(0.0, -181.0).is_err());
        assert!(Coordinate::new(f64::NAN, 0.0).is_err());
        assert!(Coordinate::new(45.0, 120.0).is_ok());
    }

    #[test]
    fn zero_distance_for_identical_points() {
        let p = Coordinate::new(16.5062, 80.648).unwrap();
        assert!(distance_meters(p, p) < 1e-6);
    }

    #[test]
    fn one_millidegree_of_latitude_is_about_111_meters() {
        let a = Coordinate::new(16.5060, 80.6480).unwrap();
        let b = Coordinate::new(16.5070, 80.6480).unwrap();
        let d = distance_meters(a, b);
        assert!((d - 111.2).abs() < 1.0, "distance was {d}");
    }

    #[test]
    fn radius_check_at_the_boundary() {
        let center = Coordinate::new(16.5062, 80.6480).unwrap();
        // ~55m east of center at this latitude.
        let nearby = Coordinate::new(16.5062, 80.64852).unwrap();
        let d = distance_meters(center, nearby);
        assert!(d > 50.0 && d < 60.0, "distance was {d}");

        assert!(!within_radius(center, nearby, 50.0));
        assert!(within_radius(center, nearby, 75.0));
    }
}
