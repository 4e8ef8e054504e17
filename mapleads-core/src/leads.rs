//! Lead records: the field bag returned by extractors and the stored lead it
//! is promoted to.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{JobId, LeadId, TaskId};

/// Business fields shared by raw candidates and stored leads.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadFields {
    pub business_name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub email: Option<String>,
    pub category: Option<String>,
    pub place_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub rating: Option<f32>,
    pub review_count: Option<u32>,
    pub hours: Option<String>,
    /// Social profile links keyed by network (`facebook`, `instagram`, ...).
    pub socials: BTreeMap<String, String>,
}

fn filled(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn fill_missing(target: &mut Option<String>, source: &Option<String>) -> bool {
    if !filled(target) && filled(source) {
        *target = source.clone();
        return true;
    }
    false
}

fn overwrite(target: &mut Option<String>, source: &Option<String>) -> bool {
    if filled(source) && target != source {
        *target = source.clone();
        return true;
    }
    false
}

impl LeadFields {
    /// Place id if present and non-blank.
    pub fn place_id(&self) -> Option<&str> {
        self.place_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) if lat.is_finite() && lng.is_finite() => Some((lat, lng)),
            _ => None,
        }
    }

    pub fn has_phone(&self) -> bool {
        filled(&self.phone)
    }

    pub fn has_website(&self) -> bool {
        filled(&self.website)
    }

    /// Share of the ten core fields that carry a value, on a 0-100 scale.
    pub fn quality_score(&self) -> u8 {
        let core = [
            !self.business_name.trim().is_empty(),
            filled(&self.address),
            filled(&self.city),
            filled(&self.state),
            filled(&self.postal_code),
            filled(&self.phone),
            filled(&self.website),
            filled(&self.category),
            filled(&self.email),
            filled(&self.place_id),
        ];
        let hits = core.iter().filter(|present| **present).count();
        (hits * 100 / core.len()) as u8
    }

    /// Copies candidate values into fields that are empty here. Returns true
    /// when anything changed.
    pub fn merge_missing_from(&mut self, other: &LeadFields) -> bool {
        let mut changed = false;
        if self.business_name.trim().is_empty() && !other.business_name.trim().is_empty() {
            self.business_name = other.business_name.clone();
            changed = true;
        }
        changed |= fill_missing(&mut self.address, &other.address);
        changed |= fill_missing(&mut self.city, &other.city);
        changed |= fill_missing(&mut self.state, &other.state);
        changed |= fill_missing(&mut self.postal_code, &other.postal_code);
        changed |= fill_missing(&mut self.phone, &other.phone);
        changed |= fill_missing(&mut self.website, &other.website);
        changed |= fill_missing(&mut self.email, &other.email);
        changed |= fill_missing(&mut self.category, &other.category);
        changed |= fill_missing(&mut self.place_id, &other.place_id);
        changed |= fill_missing(&mut self.hours, &other.hours);
        if self.coordinates().is_none() && other.coordinates().is_some() {
            self.latitude = other.latitude;
            self.longitude = other.longitude;
            changed = true;
        }
        if self.rating.is_none() && other.rating.is_some() {
            self.rating = other.rating;
            changed = true;
        }
        if self.review_count.is_none() && other.review_count.is_some() {
            self.review_count = other.review_count;
            changed = true;
        }
        for (network, link) in &other.socials {
            if !self.socials.contains_key(network) && !link.trim().is_empty() {
                self.socials.insert(network.clone(), link.clone());
                changed = true;
            }
        }
        changed
    }

    /// Overwrites fields with every non-empty candidate value. The stored
    /// place id is kept; it is only filled when missing.
    pub fn overwrite_from(&mut self, other: &LeadFields) -> bool {
        let mut changed = false;
        if !other.business_name.trim().is_empty() && self.business_name != other.business_name {
            self.business_name = other.business_name.clone();
            changed = true;
        }
        changed |= overwrite(&mut self.address, &other.address);
        changed |= overwrite(&mut self.city, &other.city);
        changed |= overwrite(&mut self.state, &other.state);
        changed |= overwrite(&mut self.postal_code, &other.postal_code);
        changed |= overwrite(&mut self.phone, &other.phone);
        changed |= overwrite(&mut self.website, &other.website);
        changed |= overwrite(&mut self.email, &other.email);
        changed |= overwrite(&mut self.category, &other.category);
        changed |= overwrite(&mut self.hours, &other.hours);
        changed |= fill_missing(&mut self.place_id, &other.place_id);
        if other.coordinates().is_some() && self.coordinates() != other.coordinates() {
            self.latitude = other.latitude;
            self.longitude = other.longitude;
            changed = true;
        }
        if other.rating.is_some() && self.rating != other.rating {
            self.rating = other.rating;
            changed = true;
        }
        if other.review_count.is_some() && self.review_count != other.review_count {
            self.review_count = other.review_count;
            changed = true;
        }
        for (network, link) in &other.socials {
            if !link.trim().is_empty() && self.socials.get(network) != Some(link) {
                self.socials.insert(network.clone(), link.clone());
                changed = true;
            }
        }
        changed
    }
}

/// A record produced by the extractor for one task. Transient: it is either
/// promoted to a [`Lead`], folded into an existing one, or dropped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub source_task: TaskId,
    pub fields: LeadFields,
}

impl RawCandidate {
    pub fn new(source_task: TaskId, fields: LeadFields) -> Self {
        Self {
            source_task,
            fields,
        }
    }
}

/// A stored lead. The dataset is global: `job_id` names the job that first
/// discovered it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub job_id: JobId,
    pub source_task: TaskId,
    pub fields: LeadFields,
    pub data_quality_score: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn from_candidate(job_id: JobId, candidate: &RawCandidate) -> Self {
        let now = Utc::now();
        Self {
            id: LeadId::new(),
            job_id,
            source_task: candidate.source_task,
            data_quality_score: candidate.fields.quality_score(),
            fields: candidate.fields.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn merge_from(&mut self, candidate: &RawCandidate) -> bool {
        let changed = self.fields.merge_missing_from(&candidate.fields);
        self.touch(changed);
        changed
    }

    pub fn update_from(&mut self, candidate: &RawCandidate) -> bool {
        let changed = self.fields.overwrite_from(&candidate.fields);
        self.touch(changed);
        changed
    }

    fn touch(&mut self, changed: bool) {
        if changed {
            self.data_quality_score = self.fields.quality_score();
            self.updated_at = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn task() -> TaskId {
        TaskId(Uuid::from_u128(7))
    }

    #[test]
    fn quality_score_counts_core_fields() {
        let mut fields = LeadFields {
            business_name: "Sharma Dental Clinic".into(),
            phone: Some("+91 98765 43210".into()),
            ..Default::default()
        };
        assert_eq!(fields.quality_score(), 20);

        fields.city = Some("Pune".into());
        fields.website = Some("   ".into());
        assert_eq!(fields.quality_score(), 30);
    }

    #[test]
    fn merge_fills_only_missing_fields() {
        let job = JobId::new();
        let stored = LeadFields {
            business_name: "Sharma Dental".into(),
            phone: Some("020 1234 5678".into()),
            ..Default::default()
        };
        let mut lead = Lead::from_candidate(job, &RawCandidate::new(task(), stored));
        let before = lead.data_quality_score;

        let incoming = LeadFields {
            business_name: "Sharma Dental Clinic".into(),
            phone: Some("999".into()),
            website: Some("https://sharmadental.in".into()),
            socials: BTreeMap::from([("instagram".to_string(), "@sharma".to_string())]),
            ..Default::default()
        };
        assert!(lead.merge_from(&RawCandidate::new(task(), incoming)));

        assert_eq!(lead.fields.business_name, "Sharma Dental");
        assert_eq!(lead.fields.phone.as_deref(), Some("020 1234 5678"));
        assert_eq!(lead.fields.website.as_deref(), Some("https://sharmadental.in"));
        assert_eq!(lead.fields.socials.len(), 1);
        assert!(lead.data_quality_score > before);
    }

    #[test]
    fn update_overwrites_but_keeps_place_id() {
        let job = JobId::new();
        let stored = LeadFields {
            business_name: "Old Name".into(),
            place_id: Some("ChIJ-1".into()),
            category: Some("Dentist".into()),
            ..Default::default()
        };
        let mut lead = Lead::from_candidate(job, &RawCandidate::new(task(), stored));

        let incoming = LeadFields {
            business_name: "New Name".into(),
            place_id: Some("ChIJ-2".into()),
            ..Default::default()
        };
        assert!(lead.update_from(&RawCandidate::new(task(), incoming)));
        assert_eq!(lead.fields.business_name, "New Name");
        assert_eq!(lead.fields.place_id.as_deref(), Some("ChIJ-1"));
        assert_eq!(lead.fields.category.as_deref(), Some("Dentist"));
    }
}
