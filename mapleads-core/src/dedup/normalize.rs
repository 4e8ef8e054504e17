//! Canonical forms used as identity keys.

use crate::config::DedupConfig;
use crate::leads::LeadFields;

/// Shortest digit string still treated as a phone number.
const MIN_PHONE_DIGITS: usize = 7;

/// Canonical digit-only phone number, country code included.
///
/// Separators are dropped, a leading `00` is read as `+`, trunk zeros are
/// stripped and bare national numbers get the default country code.
pub fn normalize_phone(raw: &str, config: &DedupConfig) -> Option<String> {
    let trimmed = raw.trim();
    let international = trimmed.starts_with('+') || trimmed.starts_with("00");

    let mut digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if trimmed.starts_with("00") {
        digits.drain(..2);
    }

    if !international {
        let stripped = digits.trim_start_matches('0');
        let cc = config.default_country_code.as_str();
        digits = if stripped.len() == config.national_number_len {
            format!("{cc}{stripped}")
        } else {
            stripped.to_string()
        };
    }

    (digits.len() >= MIN_PHONE_DIGITS).then_some(digits)
}

/// Lower-cased alphanumeric tokens separated by single spaces.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Coarse key bounding fuzzy comparisons: postal code when present, city otherwise.
pub fn blocking_key(fields: &LeadFields) -> Option<String> {
    if let Some(pin) = fields.postal_code.as_deref() {
        let pin: String = pin
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if !pin.is_empty() {
            return Some(format!("pin:{pin}"));
        }
    }
    fields
        .city
        .as_deref()
        .map(normalize_name)
        .filter(|city| !city.is_empty())
        .map(|city| format!("city:{city}"))
}

pub fn geo_cell(lat: f64, lng: f64, precision: usize) -> Option<String> {
    geohash::encode(geohash::Coord { x: lng, y: lat }, precision).ok()
}

/// The cell containing the point and its eight neighbours.
pub fn geo_cells_around(lat: f64, lng: f64, precision: usize) -> Vec<String> {
    let Some(cell) = geo_cell(lat, lng, precision) else {
        return Vec::new();
    };
    let mut cells = vec![cell.clone()];
    if let Ok(n) = geohash::neighbors(&cell) {
        cells.extend([n.n, n.ne, n.e, n.se, n.s, n.sw, n.w, n.nw]);
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DedupConfig {
        DedupConfig::default()
    }

    #[test]
    fn phone_forms_collapse_to_one_key() {
        let expected = Some("919876543210".to_string());
        for raw in [
            "+91 98765 43210",
            "098765-43210",
            "9876543210",
            "0091 9876543210",
            "(+91) 98765.43210",
        ] {
            assert_eq!(normalize_phone(raw, &config()), expected, "{raw}");
        }
    }

    #[test]
    fn short_or_empty_phones_are_rejected() {
        assert_eq!(normalize_phone("", &config()), None);
        assert_eq!(normalize_phone("ext 12", &config()), None);
    }

    #[test]
    fn names_lose_case_and_punctuation() {
        assert_eq!(normalize_name("  Dr. Sharma's   DENTAL-Clinic "), "dr sharma s dental clinic");
    }

    #[test]
    fn blocking_prefers_postal_code() {
        let mut fields = LeadFields {
            city: Some("Pune".into()),
            ..Default::default()
        };
        assert_eq!(blocking_key(&fields).as_deref(), Some("city:pune"));
        fields.postal_code = Some("411 001".into());
        assert_eq!(blocking_key(&fields).as_deref(), Some("pin:411001"));
    }

    #[test]
    fn neighbouring_cells_include_the_center() {
        let cells = geo_cells_around(18.5204, 73.8567, 7);
        assert_eq!(cells.len(), 9);
        assert_eq!(cells[0], geo_cell(18.5204, 73.8567, 7).unwrap());
    }
}
