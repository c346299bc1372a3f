//! Geographic points and great-circle distances.

use crate::error::{CodecError, CodecResult};

/// Mean earth radius in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Mean earth radius in miles.
pub const EARTH_RADIUS_MILES: f64 = 3958.8;

/// A latitude/longitude pair in degrees.
///
/// Latitude is within `[-90, 90]` and longitude within `[-180, 180]`;
/// the constructor rejects anything else.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    /// Creates a point, validating both coordinates.
    pub fn new(latitude: f64, longitude: f64) -> CodecResult<Self> {
        let lat_ok = latitude.is_finite() && (-90.0..=90.0).contains(&latitude);
        let lon_ok = longitude.is_finite() && (-180.0..=180.0).contains(&longitude);
        if !lat_ok || !lon_ok {
            return Err(CodecError::InvalidGeoPoint {
                latitude,
                longitude,
            });
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Latitude in degrees.
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    /// Longitude in degrees.
    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Central angle to another point, in radians (haversine).
    pub fn radians_to(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = lat2 - lat1;
        let d_lon = (other.longitude - self.longitude).to_radians();

        let sin_lat = (d_lat / 2.0).sin();
        let sin_lon = (d_lon / 2.0).sin();
        let a = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lon * sin_lon;
        // Clamp rounding drift so asin stays defined
        2.0 * a.sqrt().min(1.0).asin()
    }

    /// Distance to another point in kilometers.
    pub fn kilometers_to(&self, other: &GeoPoint) -> f64 {
        self.radians_to(other) * EARTH_RADIUS_KM
    }

    /// Distance to another point in miles.
    pub fn miles_to(&self, other: &GeoPoint) -> f64 {
        self.radians_to(other) * EARTH_RADIUS_MILES
    }
}
