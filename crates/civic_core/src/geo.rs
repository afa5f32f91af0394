use crate::policy::{LocalityPolicy, Policy, normalize_area};
use crate::schema::{AreaWeighting, Coordinate, Location};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres between two (lat, lon) points given in degrees.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin() * (d_lat / 2.0).sin()
        + lat1.to_radians().cos()
            * lat2.to_radians().cos()
            * (d_lon / 2.0).sin()
            * (d_lon / 2.0).sin();
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

pub fn distance_between(a: &Coordinate, b: &Coordinate) -> f64 {
    haversine_km(a.lat, a.lon, b.lat, b.lon)
}

/// Classify `observer` relative to `target`. Never fails: without a usable
/// area code or coordinate pair the observer is treated as outside.
pub fn classify(observer: &Location, target: &Location, policy: &Policy) -> AreaWeighting {
    let locality = &policy.locality;

    let codes = match (&observer.area_code, &target.area_code) {
        (Some(a), Some(b)) if !a.trim().is_empty() && !b.trim().is_empty() => Some((a, b)),
        _ => None,
    };
    let distance_km = match (&observer.coordinate, &target.coordinate) {
        (Some(a), Some(b)) => Some(distance_between(a, b)),
        _ => None,
    };

    if codes.is_none() && distance_km.is_none() {
        return outside(policy);
    }

    let same_area = codes.is_some_and(|(a, b)| normalize_area(a) == normalize_area(b));
    let listed_adjacent = codes.is_some_and(|(a, b)| policy.adjacency.are_adjacent(a, b));

    let is_local = same_area || distance_km.is_some_and(|d| d <= locality.local_radius_km);
    let is_adjacent = !is_local
        && (listed_adjacent || distance_km.is_some_and(|d| d <= locality.adjacent_radius_km));

    AreaWeighting {
        is_local,
        is_adjacent,
        multiplier: multiplier_for(is_local, is_adjacent, locality),
        distance_km,
    }
}

fn multiplier_for(is_local: bool, is_adjacent: bool, locality: &LocalityPolicy) -> f64 {
    if is_local {
        locality.local_multiplier
    } else if is_adjacent {
        locality.adjacent_multiplier
    } else {
        locality.outside_multiplier
    }
}

/// Outside weighting, used when nothing is known about the observer.
pub fn outside(policy: &Policy) -> AreaWeighting {
    AreaWeighting {
        is_local: false,
        is_adjacent: false,
        multiplier: policy.locality.outside_multiplier,
        distance_km: None,
    }
}

/// True when a freshly observed position differs enough from the cached one
/// that the registered location should be refreshed.
pub fn has_moved(current: &Coordinate, cached: Option<&Coordinate>, policy: &Policy) -> bool {
    match cached {
        None => true,
        Some(cached) => distance_between(current, cached) > policy.locality.movement_threshold_km,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::parse_adjacency;

    const TOLERANCE: f64 = 1e-9;

    fn policy_with_adjacency() -> Policy {
        let mut policy = Policy::default();
        policy.adjacency = parse_adjacency("adjacency:\n  DEL-001: [DEL-002]\n").unwrap();
        policy
    }

    #[test]
    fn haversine_is_reflexive() {
        for (lat, lon) in [(28.6139, 77.2090), (0.0, 0.0), (-33.8688, 151.2093), (89.9, -179.9)] {
            assert!(haversine_km(lat, lon, lat, lon).abs() < TOLERANCE);
        }
    }

    #[test]
    fn haversine_is_symmetric() {
        let pairs = [
            ((28.6139, 77.2090), (28.6200, 77.2100)),
            ((51.5074, -0.1278), (40.7128, -74.0060)),
            ((-33.8688, 151.2093), (35.6762, 139.6503)),
        ];
        for ((lat1, lon1), (lat2, lon2)) in pairs {
            let forward = haversine_km(lat1, lon1, lat2, lon2);
            let backward = haversine_km(lat2, lon2, lat1, lon1);
            assert!((forward - backward).abs() < TOLERANCE);
        }
    }

    #[test]
    fn haversine_matches_known_distances() {
        // One degree of latitude along a meridian.
        let one_degree = haversine_km(0.0, 0.0, 1.0, 0.0);
        assert!((one_degree - EARTH_RADIUS_KM * std::f64::consts::PI / 180.0).abs() < 1e-9);

        // London to New York is roughly 5570 km.
        let london_ny = haversine_km(51.5074, -0.1278, 40.7128, -74.0060);
        assert!((london_ny - 5570.0).abs() < 10.0);
    }

    #[test]
    fn matching_area_codes_are_local() {
        let w = classify(&Location::area("DEL-001"), &Location::area("del-001"), &Policy::default());
        assert!(w.is_local);
        assert!(!w.is_adjacent);
        assert_eq!(w.multiplier, 2.0);
    }

    #[test]
    fn adjacency_table_marks_adjacent() {
        let policy = policy_with_adjacency();
        let w = classify(&Location::area("DEL-002"), &Location::area("DEL-001"), &policy);
        assert!(!w.is_local);
        assert!(w.is_adjacent);
        assert_eq!(w.multiplier, 1.5);
    }

    #[test]
    fn distance_bands_classify_coordinates() {
        let policy = Policy::default();
        let target = Location::point(28.6139, 77.2090);

        // ~0.7 km away
        let near = classify(&Location::point(28.6200, 77.2100), &target, &policy);
        assert!(near.is_local);

        // ~5.6 km north
        let mid = classify(&Location::point(28.6639, 77.2090), &target, &policy);
        assert!(!mid.is_local && mid.is_adjacent);

        // ~55 km north
        let far = classify(&Location::point(29.1139, 77.2090), &target, &policy);
        assert!(!far.is_local && !far.is_adjacent);
        assert_eq!(far.multiplier, 1.0);
        assert!(far.distance_km.unwrap() > 50.0);
    }

    #[test]
    fn unknown_locations_are_outside() {
        let w = classify(&Location::default(), &Location::area("DEL-001"), &Policy::default());
        assert_eq!(w, outside(&Policy::default()));

        let blank = classify(&Location::area("  "), &Location::area("  "), &Policy::default());
        assert!(!blank.is_local);
    }

    #[test]
    fn multiplier_is_monotonic_in_locality() {
        let policy = policy_with_adjacency();
        let target = Location::area("DEL-001");
        let local = classify(&Location::area("DEL-001"), &target, &policy).multiplier;
        let adjacent = classify(&Location::area("DEL-002"), &target, &policy).multiplier;
        let away = classify(&Location::area("MUM-001"), &target, &policy).multiplier;
        assert!(local >= adjacent && adjacent >= away);
    }

    #[test]
    fn movement_threshold() {
        let policy = Policy::default();
        let here = Coordinate { lat: 28.6139, lon: 77.2090 };
        let nearby = Coordinate { lat: 28.6145, lon: 77.2095 };
        let across_town = Coordinate { lat: 28.6400, lon: 77.2090 };
        assert!(has_moved(&here, None, &policy));
        assert!(!has_moved(&here, Some(&nearby), &policy));
        assert!(has_moved(&here, Some(&across_town), &policy));
    }
}
