//! Great-circle distance between telemetry coordinates.

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// True when `lat`/`lon` are finite decimal degrees inside [-90, 90] / [-180, 180].
pub fn is_valid_coordinate(lat: f64, lon: f64) -> bool {
    lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon)
}

/// Haversine distance in meters.
///
/// Returns `None` when either pair is missing or out of range. An unknown
/// distance must fail any threshold check.
pub fn distance_m(
    lat1: Option<f64>,
    lon1: Option<f64>,
    lat2: Option<f64>,
    lon2: Option<f64>,
) -> Option<f64> {
    let (lat1, lon1, lat2, lon2) = (lat1?, lon1?, lat2?, lon2?);
    if !is_valid_coordinate(lat1, lon1) || !is_valid_coordinate(lat2, lon2) {
        return None;
    }

    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    // Clamp guards against a > 1 from float rounding on antipodal points.
    let c = 2.0 * a.sqrt().min(1.0).asin();
    Some(EARTH_RADIUS_M * c)
}

/// `distance_m(..) <= threshold`, with unknown distance never passing.
pub fn within_meters(
    lat1: Option<f64>,
    lon1: Option<f64>,
    lat2: Option<f64>,
    lon2: Option<f64>,
    threshold_m: f64,
) -> bool {
    matches!(distance_m(lat1, lon1, lat2, lon2), Some(d) if d <= threshold_m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_point_is_zero() {
        assert_eq!(distance_m(Some(50.0), Some(14.0), Some(50.0), Some(14.0)), Some(0.0));
    }

    #[test]
    fn symmetric() {
        let d1 = distance_m(Some(50.08), Some(14.42), Some(48.14), Some(11.58)).unwrap();
        let d2 = distance_m(Some(48.14), Some(11.58), Some(50.08), Some(14.42)).unwrap();
        assert_eq!(d1, d2);
        // Prague to Munich is roughly 300 km
        assert!((290_000.0..310_000.0).contains(&d1), "got {d1}");
    }

    #[test]
    fn small_latitude_offset() {
        // 0.00005 deg of latitude is ~5.6 m
        let d = distance_m(Some(50.0), Some(14.0), Some(50.00005), Some(14.0)).unwrap();
        assert!((5.0..6.0).contains(&d), "got {d}");
    }

    #[test]
    fn monotonic_in_separation() {
        let near = distance_m(Some(0.0), Some(0.0), Some(0.0), Some(1.0)).unwrap();
        let far = distance_m(Some(0.0), Some(0.0), Some(0.0), Some(2.0)).unwrap();
        assert!(far > near);
    }

    #[test]
    fn antipodal_points_do_not_produce_nan() {
        let d = distance_m(Some(0.0), Some(0.0), Some(0.0), Some(180.0)).unwrap();
        assert!(d.is_finite());
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_M).abs() < 1.0);
    }

    #[test]
    fn missing_or_invalid_is_unknown() {
        assert_eq!(distance_m(None, Some(14.0), Some(50.0), Some(14.0)), None);
        assert_eq!(distance_m(Some(50.0), Some(14.0), Some(50.0), None), None);
        assert_eq!(distance_m(Some(91.0), Some(14.0), Some(50.0), Some(14.0)), None);
        assert_eq!(distance_m(Some(50.0), Some(-181.0), Some(50.0), Some(14.0)), None);
        assert_eq!(distance_m(Some(f64::NAN), Some(14.0), Some(50.0), Some(14.0)), None);
    }

    #[test]
    fn unknown_never_within_threshold() {
        assert!(!within_meters(None, None, Some(50.0), Some(14.0), f64::INFINITY));
        assert!(within_meters(Some(50.0), Some(14.0), Some(50.0), Some(14.0), 0.0));
    }
}
