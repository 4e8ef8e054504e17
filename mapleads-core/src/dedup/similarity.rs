//! Name similarity and distance scoring.

use std::collections::BTreeSet;

use super::normalize::normalize_name;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

fn ratio(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b) * 100.0
}

fn joined(parts: &[&str]) -> String {
    parts.join(" ").trim().to_string()
}

/// Token-set ratio on a 0-100 scale.
///
/// Both names are normalized and split into token sets. The shared tokens
/// are compared against each side's full token list, so a name that is a
/// token subset of the other ("sharma dental" / "sharma dental clinic")
/// scores 100.
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let left: BTreeSet<&str> = a.split(' ').collect();
    let right: BTreeSet<&str> = b.split(' ').collect();

    let common: Vec<&str> = left.intersection(&right).copied().collect();
    let only_left: Vec<&str> = left.difference(&right).copied().collect();
    let only_right: Vec<&str> = right.difference(&left).copied().collect();

    let base = joined(&common);
    let with_left = joined(&[base.as_str(), joined(&only_left).as_str()]);
    let with_right = joined(&[base.as_str(), joined(&only_right).as_str()]);

    let mut best = ratio(&with_left, &with_right);
    if !base.is_empty() {
        best = best
            .max(ratio(&base, &with_left))
            .max(ratio(&base, &with_right));
    }
    best
}

/// Great-circle distance in metres.
pub fn haversine_m(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lng1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lng2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlng = lng2 - lng1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_subset_scores_full_match() {
        assert_eq!(token_set_ratio("Sharma Dental", "Sharma Dental Clinic"), 100.0);
        assert_eq!(token_set_ratio("Clinic, Dental SHARMA", "sharma dental clinic"), 100.0);
    }

    #[test]
    fn unrelated_names_score_low() {
        assert!(token_set_ratio("Sharma Dental Clinic", "Blue Lotus Bakery") < 50.0);
        assert_eq!(token_set_ratio("", "Blue Lotus Bakery"), 0.0);
    }

    #[test]
    fn small_typos_stay_above_merge_threshold() {
        assert!(token_set_ratio("Sharma Dentl Clinic", "Sharma Dental Clinic") >= 85.0);
    }

    #[test]
    fn haversine_matches_known_distance() {
        // ~111.2 km per degree of latitude.
        let d = haversine_m((18.0, 73.0), (19.0, 73.0));
        assert!((d - 111_195.0).abs() < 100.0, "{d}");
        assert!(haversine_m((18.5204, 73.8567), (18.5204, 73.8567)) < 1e-6);
    }
}
